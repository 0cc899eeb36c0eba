//! Message dispatch: formatting, typing-aware buffering, and the
//! message-bus fan-out.
//!
//! Delivery is at-most-once and local: a message reaches a terminal only
//! if it is attached right now. The SendBuffer keeps messages out of a
//! terminal while its human is mid-keystroke, with an age-out so nothing
//! waits forever.

use crate::config::Settings;
use crate::error::SpireError;
use crate::paths::workspace_basename;
use crate::registry::TerminalRegistry;
use crate::resolver::{resolve_target, ResolvedTarget};
use crate::session::{PtySession, SessionMap};
use chrono::Utc;
use spire_types::address::ResolveErrorKind;
use spire_types::api::SendOptions;
use spire_types::message::{BusFrame, MessageEndpoint, MessageMetadata};
use spire_types::parse_address;
use spire_types::RoleKind;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const INTERRUPT_BYTE: u8 = 0x03;

/// Tunables lifted out of [`Settings`] so tests can shrink them.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub idle_threshold: Duration,
    pub flush_interval: Duration,
    pub max_age: Duration,
    pub interrupt_delay: Duration,
}

impl From<&Settings> for DispatchConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            idle_threshold: settings.send_idle_threshold(),
            flush_interval: settings.send_flush_interval(),
            max_age: settings.send_max_age(),
            interrupt_delay: settings.interrupt_delay(),
        }
    }
}

/// A send request after HTTP decoding, with workspaces already
/// canonicalized by the caller.
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub to: String,
    pub message: String,
    pub from: Option<String>,
    pub workspace: Option<PathBuf>,
    pub from_workspace: Option<PathBuf>,
    pub options: SendOptions,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub target: ResolvedTarget,
    /// False when the message went into the typing-aware queue.
    pub immediate: bool,
}

/// Message addressed at the architect: name the sender so the architect
/// knows which agent is reporting.
pub fn format_to_architect(from: Option<&str>, message: &str) -> String {
    match from {
        Some(from) => format!("[msg from {}] {}", from, message),
        None => format!("[msg] {}", message),
    }
}

/// Message addressed at a builder or shell; the sender is named only
/// when one was given.
pub fn format_to_worker(from: Option<&str>, message: &str) -> String {
    match from {
        Some(from) => format!("[msg from {}] {}", from, message),
        None => format!("[msg] {}", message),
    }
}

struct Pending {
    payload: Vec<u8>,
    no_enter: bool,
    interrupt: bool,
    queued_at: Instant,
}

/// Per-target FIFO of messages waiting for the target to stop typing.
pub struct SendBuffer {
    queues: Mutex<HashMap<String, VecDeque<Pending>>>,
    pending: AtomicUsize,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()), pending: AtomicUsize::new(0) }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Queue a message, delivering immediately when the target is idle,
    /// not composing, and has nothing queued ahead (so per-target order
    /// holds).
    async fn enqueue(
        &self,
        session: &Arc<PtySession>,
        pending: Pending,
        cfg: &DispatchConfig,
    ) -> bool {
        let deliver_now = {
            let mut queues = self.queues.lock().expect("send buffer lock");
            let queue = queues.entry(session.id.clone()).or_default();
            if queue.is_empty()
                && session.is_running()
                && session.ready_for_message(cfg.idle_threshold)
            {
                true
            } else {
                queue.push_back(pending);
                self.pending.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        if deliver_now {
            deliver(session, pending, cfg).await;
        }
        deliver_now
    }

    /// One flush pass: deliver everything whose target is ready or whose
    /// queue entry aged out; drop queues whose target no longer exists.
    pub async fn flush_once(&self, sessions: &SessionMap, cfg: &DispatchConfig) {
        let mut due: Vec<(Arc<PtySession>, Vec<Pending>)> = Vec::new();
        {
            let mut queues = self.queues.lock().expect("send buffer lock");
            queues.retain(|session_id, queue| {
                let Some(session) = sessions.get(session_id).map(|s| s.clone()) else {
                    warn!(
                        "discarding {} queued message(s) for vanished session {}",
                        queue.len(),
                        session_id
                    );
                    self.pending.fetch_sub(queue.len(), Ordering::Relaxed);
                    return false;
                };
                if !session.is_running() {
                    warn!(
                        "discarding {} queued message(s) for exited session {}",
                        queue.len(),
                        session_id
                    );
                    self.pending.fetch_sub(queue.len(), Ordering::Relaxed);
                    return false;
                }
                let ready = session.ready_for_message(cfg.idle_threshold);
                let mut batch = Vec::new();
                while let Some(front) = queue.front() {
                    if ready || front.queued_at.elapsed() >= cfg.max_age {
                        batch.push(queue.pop_front().expect("front checked"));
                    } else {
                        break;
                    }
                }
                if !batch.is_empty() {
                    self.pending.fetch_sub(batch.len(), Ordering::Relaxed);
                    due.push((session, batch));
                }
                !queue.is_empty()
            });
        }
        for (session, batch) in due {
            for pending in batch {
                deliver(&session, pending, cfg).await;
            }
        }
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(session: &Arc<PtySession>, pending: Pending, cfg: &DispatchConfig) {
    if pending.interrupt {
        session.write(bytes::Bytes::from_static(&[INTERRUPT_BYTE]));
        tokio::time::sleep(cfg.interrupt_delay).await;
    }
    session.write(pending.payload);
    if !pending.no_enter {
        session.write(&b"\r"[..]);
    }
    debug!("delivered message to session {}", session.id);
}

/// Background flush loop; cancelled by dropping the join handle's task.
pub fn spawn_flush_loop(
    buffer: Arc<SendBuffer>,
    sessions: SessionMap,
    cfg: DispatchConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            buffer.flush_once(&sessions, &cfg).await;
        }
    })
}

struct Subscriber {
    id: u64,
    project: Option<String>,
    tx: mpsc::UnboundedSender<BusFrame>,
}

/// Fan-out of structured message frames to WebSocket subscribers.
/// Broadcast order is preserved per subscriber; there is no history.
pub struct MessageBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub fn subscribe(&self, project: Option<String>) -> (u64, mpsc::UnboundedReceiver<BusFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().expect("bus lock").push(Subscriber { id, project, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().expect("bus lock").retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus lock").len()
    }

    pub fn broadcast(&self, frame: &BusFrame) {
        let mut subscribers = self.subscribers.lock().expect("bus lock");
        subscribers.retain(|sub| {
            if let Some(project) = &sub.project {
                if !frame.touches_project(project) {
                    return true;
                }
            }
            sub.tx.send(frame.clone()).is_ok()
        });
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// The dispatcher ties resolution, formatting, buffering, and the bus
/// together.
pub struct Dispatcher {
    sessions: SessionMap,
    registry: Arc<TerminalRegistry>,
    bus: Arc<MessageBus>,
    buffer: Arc<SendBuffer>,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        sessions: SessionMap,
        registry: Arc<TerminalRegistry>,
        bus: Arc<MessageBus>,
        buffer: Arc<SendBuffer>,
        cfg: DispatchConfig,
    ) -> Self {
        Self { sessions, registry, bus, buffer, cfg }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn buffer(&self) -> &Arc<SendBuffer> {
        &self.buffer
    }

    pub async fn send(&self, msg: SendMessage) -> crate::Result<SendOutcome> {
        let address = parse_address(&msg.to)
            .map_err(|e| SpireError::InvalidParams(format!("bad target address: {}", e)))?;

        let target = {
            let entries = self.registry.read().await;
            resolve_target(&entries, &address, msg.workspace.as_deref()).map_err(|failure| {
                match failure.kind {
                    ResolveErrorKind::NotFound => SpireError::NotFound {
                        message: failure.message,
                        candidates: failure.candidates,
                    },
                    ResolveErrorKind::Ambiguous => SpireError::Ambiguous {
                        message: failure.message,
                        candidates: failure.candidates,
                    },
                    ResolveErrorKind::NoContext => SpireError::NoContext(failure.message),
                }
            })?
        };

        let session = self
            .sessions
            .get(&target.terminal_id)
            .map(|s| s.clone())
            .ok_or_else(|| SpireError::not_found(format!("terminal {} has exited", target.agent)))?;

        let payload = if msg.options.raw {
            msg.message.clone().into_bytes()
        } else {
            match target.role {
                RoleKind::Architect => format_to_architect(msg.from.as_deref(), &msg.message),
                RoleKind::Builder | RoleKind::Shell => {
                    format_to_worker(msg.from.as_deref(), &msg.message)
                }
            }
            .into_bytes()
        };

        let immediate = self
            .buffer
            .enqueue(
                &session,
                Pending {
                    payload,
                    no_enter: msg.options.no_enter,
                    interrupt: msg.options.interrupt,
                    queued_at: Instant::now(),
                },
                &self.cfg,
            )
            .await;

        let from_project = msg
            .from_workspace
            .as_deref()
            .map(|p| workspace_basename(p))
            .unwrap_or_else(|| workspace_basename(&target.workspace));
        self.bus.broadcast(&BusFrame::Message {
            from: msg
                .from
                .clone()
                .map(|agent| MessageEndpoint { project: from_project, agent }),
            to: MessageEndpoint {
                project: workspace_basename(&target.workspace),
                agent: target.agent.clone(),
            },
            content: msg.message.clone(),
            metadata: MessageMetadata {
                raw: msg.options.raw,
                no_enter: msg.options.no_enter,
                interrupt: msg.options.interrupt,
            },
            timestamp: Utc::now(),
        });

        Ok(SendOutcome { target, immediate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegisterTerminal;
    use crate::session::SpawnOptions;
    use crate::store::SessionStore;
    use std::path::Path;

    #[test]
    fn formatters_name_the_sender_only_when_given() {
        assert_eq!(format_to_architect(Some("builder-bugfix-296"), "done"),
            "[msg from builder-bugfix-296] done");
        assert_eq!(format_to_architect(None, "done"), "[msg] done");
        assert_eq!(format_to_worker(Some("bob"), "hi"), "[msg from bob] hi");
        assert_eq!(format_to_worker(None, "hi"), "[msg] hi");
    }

    fn test_cfg(idle_ms: u64, max_age_ms: u64) -> DispatchConfig {
        DispatchConfig {
            idle_threshold: Duration::from_millis(idle_ms),
            flush_interval: Duration::from_millis(50),
            max_age: Duration::from_millis(max_age_ms),
            interrupt_delay: Duration::from_millis(10),
        }
    }

    fn cat_session() -> Arc<PtySession> {
        PtySession::spawn_local(SpawnOptions {
            id: None,
            label: "cat".to_string(),
            command: "cat".to_string(),
            args: vec![],
            cwd: std::env::current_dir().unwrap(),
            env: vec![],
            cols: 80,
            rows: 24,
            ring_capacity: 1000,
            kill_grace: Duration::from_millis(200),
        })
        .unwrap()
    }

    async fn ring_contains(session: &Arc<PtySession>, needle: &str) -> bool {
        for _ in 0..100 {
            let snapshot = {
                let (sink, _rx) = crate::session::BufferedSink::new(1 << 20);
                session.attach(sink)
            };
            if let Some(id) = snapshot.client_id {
                session.detach(id);
            }
            if snapshot.lines.iter().any(|l| l.contains(needle)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn sessions_with(session: &Arc<PtySession>) -> SessionMap {
        let map: SessionMap = Arc::new(dashmap::DashMap::new());
        map.insert(session.id.clone(), session.clone());
        map
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn composing_target_defers_until_newline_and_idle() {
        let session = cat_session();
        let sessions = sessions_with(&session);
        let buffer = SendBuffer::new();
        let cfg = test_cfg(100, 60_000);

        session.record_user_input(b"x");
        let immediate = buffer
            .enqueue(
                &session,
                Pending {
                    payload: b"[msg] deferred".to_vec(),
                    no_enter: false,
                    interrupt: false,
                    queued_at: Instant::now(),
                },
                &cfg,
            )
            .await;
        assert!(!immediate);
        assert_eq!(buffer.pending_count(), 1);

        // still composing: a flush must not deliver
        buffer.flush_once(&sessions, &cfg).await;
        assert_eq!(buffer.pending_count(), 1);

        // newline ends composing; after the idle threshold the flush
        // delivers exactly once
        session.record_user_input(b"\r");
        tokio::time::sleep(Duration::from_millis(150)).await;
        buffer.flush_once(&sessions, &cfg).await;
        assert_eq!(buffer.pending_count(), 0);
        assert!(ring_contains(&session, "deferred").await);

        session.kill();
        session.wait_exit().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_messages_flush_in_fifo_order() {
        let session = cat_session();
        let sessions = sessions_with(&session);
        let buffer = SendBuffer::new();
        let cfg = test_cfg(50, 60_000);

        session.record_user_input(b"typing");
        for i in 1..=3 {
            let immediate = buffer
                .enqueue(
                    &session,
                    Pending {
                        payload: format!("order-{}", i).into_bytes(),
                        no_enter: false,
                        interrupt: false,
                        queued_at: Instant::now(),
                    },
                    &cfg,
                )
                .await;
            assert!(!immediate);
        }

        session.record_user_input(b"\n");
        tokio::time::sleep(Duration::from_millis(80)).await;
        buffer.flush_once(&sessions, &cfg).await;
        assert!(ring_contains(&session, "order-3").await);

        let (sink, _rx) = crate::session::BufferedSink::new(1 << 20);
        let reply = session.attach(sink);
        if let Some(id) = reply.client_id {
            session.detach(id);
        }
        let pos = |needle: &str| {
            reply.lines.iter().position(|l| l.contains(needle)).unwrap_or(usize::MAX)
        };
        assert!(pos("order-1") < pos("order-2"));
        assert!(pos("order-2") < pos("order-3"));

        session.kill();
        session.wait_exit().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn vanished_target_discards_queue() {
        let session = cat_session();
        let sessions: SessionMap = Arc::new(dashmap::DashMap::new());
        let buffer = SendBuffer::new();
        let cfg = test_cfg(50, 60_000);

        session.record_user_input(b"typing");
        buffer
            .enqueue(
                &session,
                Pending {
                    payload: b"never delivered".to_vec(),
                    no_enter: false,
                    interrupt: false,
                    queued_at: Instant::now(),
                },
                &cfg,
            )
            .await;
        assert_eq!(buffer.pending_count(), 1);

        // the session was never in the map (already gone at flush time)
        buffer.flush_once(&sessions, &cfg).await;
        assert_eq!(buffer.pending_count(), 0);

        session.kill();
        session.wait_exit().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn aged_messages_deliver_despite_typing() {
        let session = cat_session();
        let sessions = sessions_with(&session);
        let buffer = SendBuffer::new();
        let cfg = test_cfg(60_000, 100);

        session.record_user_input(b"still typing");
        buffer
            .enqueue(
                &session,
                Pending {
                    payload: b"aged-out".to_vec(),
                    no_enter: false,
                    interrupt: false,
                    queued_at: Instant::now(),
                },
                &cfg,
            )
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        session.record_user_input(b"x");
        buffer.flush_once(&sessions, &cfg).await;
        assert_eq!(buffer.pending_count(), 0);
        assert!(ring_contains(&session, "aged-out").await);

        session.kill();
        session.wait_exit().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatcher_formats_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(&dir.path().join("spire.db")).await.unwrap());
        let registry = Arc::new(TerminalRegistry::new(store));
        let workspace = PathBuf::from("/home/dev/wsx");
        registry.activate_workspace(&workspace).await.unwrap();

        let architect = cat_session();
        registry
            .register_terminal(RegisterTerminal {
                workspace: workspace.clone(),
                role: RoleKind::Architect,
                role_key: None,
                session_id: architect.id.clone(),
                pid: architect.pid(),
                holder_socket: None,
                holder_pid: None,
                holder_start_time: None,
            })
            .await
            .unwrap();

        let sessions = sessions_with(&architect);
        let bus = Arc::new(MessageBus::new());
        let (_sub_id, mut bus_rx) = bus.subscribe(Some("wsx".to_string()));
        let dispatcher = Dispatcher::new(
            sessions,
            registry,
            bus,
            Arc::new(SendBuffer::new()),
            test_cfg(0, 60_000),
        );

        let outcome = dispatcher
            .send(SendMessage {
                to: "wsx:architect".to_string(),
                message: "done".to_string(),
                from: Some("builder-bugfix-296".to_string()),
                workspace: None,
                from_workspace: Some(workspace.clone()),
                options: SendOptions::default(),
            })
            .await
            .unwrap();
        assert!(outcome.immediate);
        assert_eq!(outcome.target.agent, "architect");

        assert!(ring_contains(&architect, "[msg from builder-bugfix-296] done").await);

        let frame = bus_rx.recv().await.unwrap();
        let BusFrame::Message { from, to, content, .. } = frame;
        assert_eq!(from.unwrap().agent, "builder-bugfix-296");
        assert_eq!(to.project, "wsx");
        assert_eq!(to.agent, "architect");
        assert_eq!(content, "done");

        architect.kill();
        architect.wait_exit().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_recipient_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(&dir.path().join("spire.db")).await.unwrap());
        let registry = Arc::new(TerminalRegistry::new(store));
        let sessions: SessionMap = Arc::new(dashmap::DashMap::new());
        let dispatcher = Dispatcher::new(
            sessions,
            registry,
            Arc::new(MessageBus::new()),
            Arc::new(SendBuffer::new()),
            test_cfg(0, 60_000),
        );

        let err = dispatcher
            .send(SendMessage {
                to: "ghost:architect".to_string(),
                message: "hello".to_string(),
                from: None,
                workspace: None,
                from_workspace: None,
                options: SendOptions::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SpireError::NotFound { .. }));
    }
}
