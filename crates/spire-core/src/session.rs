//! PTY session wrapper: local pseudoterminals and shellper-backed sessions
//! behind one interface.
//!
//! Each session owns a single loop task; all output fan-out and state
//! transitions happen there. External callers post `write`/`resize`/`kill`
//! through a bounded inbox and observe output by attaching a sink. A slow
//! sink never stalls the session: frames above its byte budget are dropped
//! and the client resynchronizes later via seq-based resume.

use crate::error::SpireError;
use crate::ring::{Replay, RingBuffer};
use crate::shellper::client::ClientHandle;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Default per-client outbound budget before frames are dropped.
pub const DEFAULT_HIGH_WATER: usize = 1024 * 1024;

const INBOX_CAPACITY: usize = 256;
const WRITER_CAPACITY: usize = 256;
const EVENTS_CAPACITY: usize = 1024;

/// Shared map of live sessions, keyed by session id.
pub type SessionMap = Arc<dashmap::DashMap<String, Arc<PtySession>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Exited,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// Frames pushed to attached clients.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionFrame {
    Data(Bytes),
    Exit(ExitInfo),
}

impl SessionFrame {
    fn cost(&self) -> usize {
        match self {
            SessionFrame::Data(b) => b.len(),
            SessionFrame::Exit(_) => 64,
        }
    }
}

/// Client adapter for session output. `send` must never block; returning
/// false means the frame was dropped.
pub trait OutputSink: Send + Sync {
    fn send(&self, frame: SessionFrame) -> bool;
}

/// Events flowing from a session backend into the session loop.
#[derive(Debug)]
pub enum BackendEvent {
    Output(Bytes),
    Exit(ExitInfo),
}

/// The write/resize/kill side of a backend. Implementations must be
/// non-blocking: slow underlying writers drop input rather than queueing
/// it without bound.
trait SessionBackend: Send {
    fn write(&mut self, data: Bytes);
    fn resize(&mut self, cols: u16, rows: u16);
    /// Request orderly termination.
    fn terminate(&mut self);
    /// Escalate after the grace period.
    fn force_kill(&mut self);
}

enum Command {
    Write(Bytes),
    Resize(u16, u16),
    Kill,
}

struct SessionState {
    status: SessionStatus,
    exit: Option<ExitInfo>,
    cols: u16,
    rows: u16,
    pid: Option<u32>,
}

struct Activity {
    last_input_at: Instant,
    composing: bool,
}

/// Replay handed back by `attach`/`attach_resume`.
pub struct AttachReply {
    /// Present while the session is running; used for `detach`.
    pub client_id: Option<u64>,
    pub lines: Vec<String>,
    pub seq: u64,
    /// True when resume fell back to a full snapshot.
    pub overflow: bool,
    /// Present when the session has already exited.
    pub exit: Option<ExitInfo>,
}

/// One interactive session: a local PTY child or a shellper holder.
pub struct PtySession {
    pub id: String,
    pub label: String,
    pub cwd: PathBuf,
    persistent: bool,
    inbox: mpsc::Sender<Command>,
    ring: Arc<Mutex<RingBuffer>>,
    clients: Arc<Mutex<HashMap<u64, Arc<dyn OutputSink>>>>,
    state: Arc<RwLock<SessionState>>,
    activity: Mutex<Activity>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    next_client_id: AtomicU64,
}

/// Options for spawning a session with a local PTY.
pub struct SpawnOptions {
    pub id: Option<String>,
    pub label: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub ring_capacity: usize,
    pub kill_grace: Duration,
}

/// Options for wrapping a reconnected or freshly created shellper client.
pub struct ShellperSessionOptions {
    pub id: Option<String>,
    pub label: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub ring_capacity: usize,
    pub kill_grace: Duration,
}

impl PtySession {
    /// Spawn a command on a local pseudoterminal.
    pub fn spawn_local(opts: SpawnOptions) -> crate::Result<Arc<Self>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                cols: opts.cols,
                rows: opts.rows,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpireError::Internal(format!("openpty failed: {}", e)))?;

        let mut cmd = CommandBuilder::new(&opts.command);
        cmd.args(&opts.args);
        cmd.cwd(&opts.cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpireError::Internal(format!("spawn {} failed: {}", opts.command, e)))?;
        let pid = child.process_id();
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpireError::Internal(format!("pty reader: {}", e)))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| SpireError::Internal(format!("pty writer: {}", e)))?;

        let (events_tx, events_rx) = mpsc::channel::<BackendEvent>(EVENTS_CAPACITY);
        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITER_CAPACITY);

        // Blocking reader thread; when the PTY reaches EOF the child has
        // gone away, so reap it and report the exit.
        std::thread::spawn(move || {
            let mut child = child;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if events_tx
                            .blocking_send(BackendEvent::Output(Bytes::copy_from_slice(&buf[..n])))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let code = child.wait().ok().map(|status| status.exit_code() as i32);
            let _ = events_tx.blocking_send(BackendEvent::Exit(ExitInfo { code, signal: None }));
        });

        // Blocking writer thread fed by the backend.
        std::thread::spawn(move || {
            while let Some(data) = writer_rx.blocking_recv() {
                if writer.write_all(&data).is_err() || writer.flush().is_err() {
                    break;
                }
            }
        });

        let backend = LocalPtyBackend { writer_tx, master: pair.master, pid };
        Ok(Self::build(
            opts.id,
            opts.label,
            opts.cwd,
            false,
            opts.cols,
            opts.rows,
            pid,
            opts.ring_capacity,
            opts.kill_grace,
            Vec::new(),
            events_rx,
            Box::new(backend),
        ))
    }

    /// Wrap a connected shellper client. `seed` and the event stream come
    /// from the client's replay handoff, so no output is lost or doubled.
    pub fn from_shellper(
        opts: ShellperSessionOptions,
        handle: ClientHandle,
        holder_pid: u32,
        seed: Vec<String>,
        events_rx: mpsc::Receiver<BackendEvent>,
    ) -> Arc<Self> {
        let backend = ShellperBackend { handle };
        Self::build(
            opts.id,
            opts.label,
            opts.cwd,
            true,
            opts.cols,
            opts.rows,
            Some(holder_pid),
            opts.ring_capacity,
            opts.kill_grace,
            seed,
            events_rx,
            Box::new(backend),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: Option<String>,
        label: String,
        cwd: PathBuf,
        persistent: bool,
        cols: u16,
        rows: u16,
        pid: Option<u32>,
        ring_capacity: usize,
        kill_grace: Duration,
        seed: Vec<String>,
        events_rx: mpsc::Receiver<BackendEvent>,
        backend: Box<dyn SessionBackend>,
    ) -> Arc<Self> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut ring = RingBuffer::new(ring_capacity);
        ring.append_lines(seed);
        let ring = Arc::new(Mutex::new(ring));
        let clients: Arc<Mutex<HashMap<u64, Arc<dyn OutputSink>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(RwLock::new(SessionState {
            status: SessionStatus::Running,
            exit: None,
            cols,
            rows,
            pid,
        }));
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        let session = Arc::new(Self {
            id: id.clone(),
            label,
            cwd,
            persistent,
            inbox: inbox_tx,
            ring: ring.clone(),
            clients: clients.clone(),
            state: state.clone(),
            activity: Mutex::new(Activity { last_input_at: Instant::now(), composing: false }),
            exit_rx,
            next_client_id: AtomicU64::new(1),
        });

        tokio::spawn(run_loop(
            id, ring, clients, state, exit_tx, events_rx, inbox_rx, backend, kill_grace,
        ));
        session
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().expect("session state lock").status
    }

    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.state.read().expect("session state lock").exit.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.read().expect("session state lock").pid
    }

    pub fn size(&self) -> (u16, u16) {
        let st = self.state.read().expect("session state lock");
        (st.cols, st.rows)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn current_seq(&self) -> u64 {
        self.ring.lock().expect("ring lock").current_seq()
    }

    /// Forward bytes to the PTY. Never blocks: if the inbox is saturated
    /// the input is dropped with a warning.
    pub fn write(&self, data: impl Into<Bytes>) {
        match self.inbox.try_send(Command::Write(data.into())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("session {}: input dropped, writer saturated", self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("session {}: write after exit ignored", self.id);
            }
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        {
            let mut st = self.state.write().expect("session state lock");
            st.cols = cols;
            st.rows = rows;
        }
        let _ = self.inbox.try_send(Command::Resize(cols, rows));
    }

    /// Request orderly termination; SIGKILL follows after the grace
    /// period. Safe to call repeatedly.
    pub fn kill(&self) {
        let _ = self.inbox.try_send(Command::Kill);
    }

    /// Full replay for a new attachment. While the session runs, the sink
    /// joins the fan-out set; on an exited session the final snapshot and
    /// exit info are returned and the sink is not registered.
    pub fn attach(&self, sink: Arc<dyn OutputSink>) -> AttachReply {
        let mut clients = self.clients.lock().expect("clients lock");
        let ring = self.ring.lock().expect("ring lock");
        let lines = ring.snapshot();
        let seq = ring.current_seq();
        drop(ring);
        let (running, exit) = {
            let st = self.state.read().expect("session state lock");
            (st.status == SessionStatus::Running, st.exit.clone())
        };
        let client_id = if running {
            let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            clients.insert(id, sink);
            Some(id)
        } else {
            None
        };
        AttachReply { client_id, lines, seq, overflow: false, exit }
    }

    /// Incremental replay for a resuming client; falls back to a full
    /// snapshot (flagged `overflow`) when `seq` has been evicted.
    pub fn attach_resume(&self, sink: Arc<dyn OutputSink>, seq: u64) -> AttachReply {
        let mut clients = self.clients.lock().expect("clients lock");
        let ring = self.ring.lock().expect("ring lock");
        let (lines, overflow) = match ring.since(seq) {
            Replay::Delta(lines) => (lines, false),
            Replay::Overflow => (ring.snapshot(), true),
        };
        let current = ring.current_seq();
        drop(ring);
        let (running, exit) = {
            let st = self.state.read().expect("session state lock");
            (st.status == SessionStatus::Running, st.exit.clone())
        };
        let client_id = if running {
            let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            clients.insert(id, sink);
            Some(id)
        } else {
            None
        };
        AttachReply { client_id, lines, seq: current, overflow, exit }
    }

    /// Read retained output without attaching: full snapshot, or the
    /// delta after `since` (flagged overflow when evicted).
    pub fn read_output(&self, since: Option<u64>) -> (Vec<String>, u64, bool) {
        let ring = self.ring.lock().expect("ring lock");
        let seq = ring.current_seq();
        match since {
            None => (ring.snapshot(), seq, false),
            Some(since) => match ring.since(since) {
                Replay::Delta(lines) => (lines, seq, false),
                Replay::Overflow => (ring.snapshot(), seq, true),
            },
        }
    }

    /// Remove a client from the fan-out set. Idempotent.
    pub fn detach(&self, client_id: u64) {
        self.clients.lock().expect("clients lock").remove(&client_id);
    }

    pub fn attached_clients(&self) -> usize {
        self.clients.lock().expect("clients lock").len()
    }

    /// Note user keystrokes for the typing heuristic: a newline ends
    /// composing, anything else starts it.
    pub fn record_user_input(&self, data: &[u8]) {
        let mut activity = self.activity.lock().expect("activity lock");
        activity.last_input_at = Instant::now();
        if data.iter().any(|&b| b == b'\r' || b == b'\n') {
            activity.composing = false;
        } else if !data.is_empty() {
            activity.composing = true;
        }
    }

    pub fn is_composing(&self) -> bool {
        self.activity.lock().expect("activity lock").composing
    }

    pub fn is_user_idle(&self, threshold: Duration) -> bool {
        self.activity.lock().expect("activity lock").last_input_at.elapsed() >= threshold
    }

    /// True when a queued message may be delivered right now.
    pub fn ready_for_message(&self, idle_threshold: Duration) -> bool {
        let activity = self.activity.lock().expect("activity lock");
        !activity.composing && activity.last_input_at.elapsed() >= idle_threshold
    }

    /// Wait for the session to exit.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(info) = rx.borrow().clone() {
                return info;
            }
            if rx.changed().await.is_err() {
                return self.exit_info().unwrap_or_default();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    id: String,
    ring: Arc<Mutex<RingBuffer>>,
    clients: Arc<Mutex<HashMap<u64, Arc<dyn OutputSink>>>>,
    state: Arc<RwLock<SessionState>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    mut events: mpsc::Receiver<BackendEvent>,
    mut inbox: mpsc::Receiver<Command>,
    mut backend: Box<dyn SessionBackend>,
    kill_grace: Duration,
) {
    let mut inbox_open = true;
    let mut force_deadline: Option<tokio::time::Instant> = None;
    let mut dropped_frames: u64 = 0;

    let exit_info = loop {
        let force_kill_timer = async {
            match force_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            ev = events.recv() => match ev {
                Some(BackendEvent::Output(bytes)) => {
                    let clients = clients.lock().expect("clients lock");
                    ring.lock().expect("ring lock").append(&bytes);
                    for sink in clients.values() {
                        if !sink.send(SessionFrame::Data(bytes.clone())) {
                            dropped_frames += 1;
                        }
                    }
                }
                Some(BackendEvent::Exit(info)) => break info,
                // Backend stream vanished without an exit frame: treat it
                // as a crash.
                None => break ExitInfo { code: Some(-1), signal: None },
            },
            cmd = inbox.recv(), if inbox_open => match cmd {
                Some(Command::Write(data)) => backend.write(data),
                Some(Command::Resize(cols, rows)) => backend.resize(cols, rows),
                Some(Command::Kill) => {
                    backend.terminate();
                    if force_deadline.is_none() {
                        force_deadline =
                            Some(tokio::time::Instant::now() + kill_grace);
                    }
                }
                None => inbox_open = false,
            },
            _ = force_kill_timer => {
                debug!("session {}: grace expired, force killing", id);
                backend.force_kill();
                force_deadline = None;
            }
        }
    };

    if dropped_frames > 0 {
        warn!("session {}: dropped {} output frames under backpressure", id, dropped_frames);
    }

    {
        let mut st = state.write().expect("session state lock");
        if st.status == SessionStatus::Exited {
            return;
        }
        st.status = SessionStatus::Exited;
        st.exit = Some(exit_info.clone());
        st.pid = None;
    }
    info!(
        "session {} exited (code: {:?}, signal: {:?})",
        id, exit_info.code, exit_info.signal
    );

    // Single exit frame per client, then the fan-out set is cleared.
    let sinks: Vec<Arc<dyn OutputSink>> =
        clients.lock().expect("clients lock").drain().map(|(_, sink)| sink).collect();
    for sink in sinks {
        sink.send(SessionFrame::Exit(exit_info.clone()));
    }
    let _ = exit_tx.send(Some(exit_info));
}

struct LocalPtyBackend {
    writer_tx: mpsc::Sender<Bytes>,
    master: Box<dyn MasterPty + Send>,
    pid: Option<u32>,
}

impl SessionBackend for LocalPtyBackend {
    fn write(&mut self, data: Bytes) {
        if self.writer_tx.try_send(data).is_err() {
            warn!("pty writer saturated, dropping input");
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        if let Err(e) =
            self.master.resize(PtySize { cols, rows, pixel_width: 0, pixel_height: 0 })
        {
            warn!("pty resize failed: {}", e);
        }
    }

    fn terminate(&mut self) {
        if let Some(pid) = self.pid {
            crate::paths::send_sigterm_group(pid);
        }
    }

    fn force_kill(&mut self) {
        if let Some(pid) = self.pid {
            crate::paths::send_sigkill_group(pid);
        }
    }
}

struct ShellperBackend {
    handle: ClientHandle,
}

impl SessionBackend for ShellperBackend {
    fn write(&mut self, data: Bytes) {
        self.handle.write(data);
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.handle.resize(cols, rows);
    }

    fn terminate(&mut self) {
        // The holder clears its restart policy and escalates SIGTERM to
        // SIGKILL itself.
        self.handle.kill();
    }

    fn force_kill(&mut self) {}
}

/// Output sink with a byte budget: frames above the high-water mark are
/// dropped instead of queued, so one stuck WebSocket cannot grow daemon
/// memory without bound.
pub struct BufferedSink {
    tx: mpsc::UnboundedSender<SessionFrame>,
    buffered: Arc<AtomicUsize>,
    high_water: usize,
    dropped: AtomicU64,
}

pub struct BufferedSinkRx {
    rx: mpsc::UnboundedReceiver<SessionFrame>,
    buffered: Arc<AtomicUsize>,
}

impl BufferedSink {
    pub fn new(high_water: usize) -> (Arc<Self>, BufferedSinkRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self { tx, buffered: buffered.clone(), high_water, dropped: AtomicU64::new(0) }),
            BufferedSinkRx { rx, buffered },
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl OutputSink for BufferedSink {
    fn send(&self, frame: SessionFrame) -> bool {
        let cost = frame.cost();
        // Exit frames always go through: they are tiny and terminal.
        if !matches!(frame, SessionFrame::Exit(_))
            && self.buffered.load(Ordering::Acquire) + cost > self.high_water
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.tx.send(frame).is_err() {
            return false;
        }
        self.buffered.fetch_add(cost, Ordering::AcqRel);
        true
    }
}

impl BufferedSinkRx {
    /// Receive the next frame, releasing its budget.
    pub async fn recv(&mut self) -> Option<SessionFrame> {
        let frame = self.rx.recv().await;
        if let Some(f) = &frame {
            self.buffered.fetch_sub(f.cost(), Ordering::AcqRel);
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_opts(command: &str, args: &[&str]) -> SpawnOptions {
        SpawnOptions {
            id: None,
            label: "test".to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::current_dir().unwrap(),
            env: Vec::new(),
            cols: 80,
            rows: 24,
            ring_capacity: 1000,
            kill_grace: Duration::from_millis(200),
        }
    }

    async fn wait_for_line(session: &PtySession, needle: &str) -> bool {
        for _ in 0..100 {
            let found = {
                let ring = session.ring.lock().unwrap();
                ring.snapshot().iter().any(|l| l.contains(needle))
            };
            if found {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_session_captures_output_and_exits() {
        let session =
            PtySession::spawn_local(spawn_opts("sh", &["-c", "printf 'hello\\n'"])).unwrap();
        let exit = session.wait_exit().await;
        assert_eq!(exit.code, Some(0));
        assert_eq!(session.status(), SessionStatus::Exited);
        assert!(wait_for_line(&session, "hello").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_reaches_the_child() {
        let session = PtySession::spawn_local(spawn_opts("cat", &[])).unwrap();
        session.write(&b"roundtrip\r"[..]);
        assert!(wait_for_line(&session, "roundtrip").await);
        session.kill();
        let exit = session.wait_exit().await;
        assert_eq!(session.status(), SessionStatus::Exited);
        // cat dies by signal; there is no meaningful exit code to assert
        let _ = exit;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_is_idempotent_and_exits_once() {
        let session = PtySession::spawn_local(spawn_opts("cat", &[])).unwrap();
        session.kill();
        session.kill();
        session.wait_exit().await;
        assert_eq!(session.status(), SessionStatus::Exited);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attach_after_exit_returns_snapshot_and_exit() {
        let session =
            PtySession::spawn_local(spawn_opts("sh", &["-c", "printf 'done\\n'"])).unwrap();
        session.wait_exit().await;
        assert!(wait_for_line(&session, "done").await);

        let (sink, _rx) = BufferedSink::new(DEFAULT_HIGH_WATER);
        let reply = session.attach(sink);
        assert!(reply.client_id.is_none());
        assert!(reply.exit.is_some());
        assert!(reply.lines.iter().any(|l| l.contains("done")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn detach_twice_is_safe() {
        let session = PtySession::spawn_local(spawn_opts("cat", &[])).unwrap();
        let (sink, _rx) = BufferedSink::new(DEFAULT_HIGH_WATER);
        let reply = session.attach(sink);
        let client_id = reply.client_id.unwrap();
        session.detach(client_id);
        session.detach(client_id);
        assert_eq!(session.attached_clients(), 0);
        session.kill();
        session.wait_exit().await;
    }

    #[test]
    fn composing_follows_newline_heuristic() {
        let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let session = PtySession::spawn_local(spawn_opts("cat", &[])).unwrap();
            assert!(!session.is_composing());
            session.record_user_input(b"x");
            assert!(session.is_composing());
            assert!(!session.is_user_idle(Duration::from_secs(1)));
            session.record_user_input(b"\r");
            assert!(!session.is_composing());
            session.kill();
            session.wait_exit().await;
        });
    }

    #[test]
    fn buffered_sink_drops_above_high_water() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let (sink, mut rx) = BufferedSink::new(100);
            assert!(sink.send(SessionFrame::Data(Bytes::from(vec![0u8; 60]))));
            assert!(!sink.send(SessionFrame::Data(Bytes::from(vec![0u8; 60]))));
            assert_eq!(sink.dropped(), 1);

            // draining the first frame frees budget for the next
            assert!(rx.recv().await.is_some());
            assert!(sink.send(SessionFrame::Data(Bytes::from(vec![0u8; 60]))));

            // exit frames bypass the budget
            assert!(sink.send(SessionFrame::Exit(ExitInfo::default())));
        });
    }
}
