//! Client side of the shellper socket protocol.
//!
//! A `ShellperClient` owns one connection to a holder: a writer task drains
//! outbound frames, a reader task turns inbound frames into backend events
//! for the owning `PtySession`. The client keeps its own small replay
//! buffer of complete lines so a session built after the holder has
//! already produced output can still seed its ring.

use crate::error::SpireError;
use crate::ring::RingBuffer;
use crate::session::{BackendEvent, ExitInfo};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use spire_types::shellper::{HolderControl, HolderEvent, RestartPolicy, ShellperCodec, ShellperFrame};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Lines of holder output the client retains for ring seeding.
const CLIENT_REPLAY_LINES: usize = 2_000;

const OUTBOX_CAPACITY: usize = 256;
const EVENTS_CAPACITY: usize = 1024;

/// Holder coordinates advertised in its meta frame.
#[derive(Debug, Clone)]
pub struct HolderMeta {
    pub pid: u32,
    pub start_time: u64,
    pub socket_path: PathBuf,
}

/// Cheap handle for pushing frames to the holder. Non-blocking: a stalled
/// socket drops writes rather than backing up into callers.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ShellperFrame>,
}

impl ClientHandle {
    pub fn write(&self, data: Bytes) {
        if self.tx.try_send(ShellperFrame::Data(data)).is_err() {
            warn!("shellper writer saturated, dropping input");
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.send_control(&HolderControl::Resize { cols, rows });
    }

    pub fn kill(&self) {
        self.send_control(&HolderControl::Kill {});
    }

    fn send_control(&self, msg: &HolderControl) {
        match ShellperFrame::control(msg) {
            Ok(frame) => {
                if self.tx.try_send(frame).is_err() {
                    warn!("shellper writer saturated, dropping control frame");
                }
            }
            Err(e) => warn!("failed to encode holder control: {}", e),
        }
    }
}

#[derive(Debug)]
struct ClientShared {
    replay: RingBuffer,
    forward: Option<mpsc::Sender<BackendEvent>>,
    exit: Option<ExitInfo>,
}

/// A live connection to one holder.
#[derive(Debug)]
pub struct ShellperClient {
    meta: HolderMeta,
    handle: ClientHandle,
    shared: Arc<Mutex<ClientShared>>,
}

impl ShellperClient {
    /// Connect to a holder socket and wait for its meta frame.
    pub async fn connect(socket_path: &Path, timeout: Duration) -> crate::Result<Self> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| SpireError::HolderSpawnFailed("connect timed out".to_string()))??;
        let mut framed = Framed::new(stream, ShellperCodec);

        let meta = tokio::time::timeout(timeout, framed.next())
            .await
            .map_err(|_| SpireError::HolderSpawnFailed("no meta frame before timeout".into()))?
            .ok_or_else(|| SpireError::HolderSpawnFailed("holder closed before meta".into()))?
            .map_err(|e| SpireError::HolderSpawnFailed(format!("bad meta frame: {}", e)))?;
        let meta = match meta.parse_control::<HolderEvent>() {
            Ok(HolderEvent::Meta { pid, start_time, socket_path }) => {
                HolderMeta { pid, start_time, socket_path: PathBuf::from(socket_path) }
            }
            other => {
                return Err(SpireError::HolderSpawnFailed(format!(
                    "expected meta frame, got {:?}",
                    other
                )))
            }
        };

        let (mut sink, mut stream) = framed.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ShellperFrame>(OUTBOX_CAPACITY);
        let shared = Arc::new(Mutex::new(ClientShared {
            replay: RingBuffer::new(CLIENT_REPLAY_LINES),
            forward: None,
            exit: None,
        }));

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(ShellperFrame::Data(bytes)) => {
                        let forward = {
                            let mut s = reader_shared.lock().expect("client lock");
                            s.replay.append(&bytes);
                            s.forward.clone()
                        };
                        if let Some(tx) = forward {
                            if tx.send(BackendEvent::Output(bytes)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(frame @ ShellperFrame::Control(_)) => {
                        match frame.parse_control::<HolderEvent>() {
                            Ok(HolderEvent::Exit { code, signal }) => {
                                forward_exit(&reader_shared, ExitInfo { code, signal }).await;
                                return;
                            }
                            Ok(HolderEvent::Stale {}) => {
                                warn!("holder declared this client stale");
                                forward_exit(
                                    &reader_shared,
                                    ExitInfo { code: Some(-1), signal: None },
                                )
                                .await;
                                return;
                            }
                            Ok(HolderEvent::Meta { .. }) => {}
                            Err(e) => debug!("ignoring unparseable holder frame: {}", e),
                        }
                    }
                    Err(e) => {
                        warn!("shellper read error: {}", e);
                        break;
                    }
                }
            }
            // Stream ended without an exit frame: the holder crashed.
            forward_exit(&reader_shared, ExitInfo { code: Some(-1), signal: None }).await;
        });

        Ok(Self { meta, handle: ClientHandle { tx: out_tx }, shared })
    }

    /// Reclaim an existing holder. The meta frame is checked locally
    /// against the expected coordinates and the holder re-verifies the
    /// `reconnect` frame; either failing means the pid was recycled and the
    /// record is stale. Returns `Ok(None)` in that case.
    pub async fn reconnect(
        socket_path: &Path,
        expected_pid: u32,
        expected_start_time: u64,
        restart_policy: Option<RestartPolicy>,
        timeout: Duration,
    ) -> crate::Result<Option<Self>> {
        let client = Self::connect(socket_path, timeout).await?;
        if client.meta.pid != expected_pid || client.meta.start_time != expected_start_time {
            debug!(
                "holder at {} is stale: expected pid {}/{}, got {}/{}",
                socket_path.display(),
                expected_pid,
                expected_start_time,
                client.meta.pid,
                client.meta.start_time
            );
            return Ok(None);
        }
        client.handle.send_control(&HolderControl::Reconnect {
            expected_pid,
            expected_start_time,
            restart_policy,
        });
        Ok(Some(client))
    }

    pub fn meta(&self) -> &HolderMeta {
        &self.meta
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Hand over the event stream to a session. Returns the receiver plus
    /// the lines received so far; the swap happens under the replay lock so
    /// nothing is doubled or lost between the seed and the first event.
    pub fn subscribe(&self) -> (mpsc::Receiver<BackendEvent>, Vec<String>) {
        let (tx, rx) = mpsc::channel(EVENTS_CAPACITY);
        let mut shared = self.shared.lock().expect("client lock");
        let seed = shared.replay.snapshot();
        if let Some(exit) = shared.exit.clone() {
            // Holder already went away; make sure the session hears it.
            let _ = tx.try_send(BackendEvent::Exit(exit));
        }
        shared.forward = Some(tx);
        (rx, seed)
    }

    /// Complete lines the client has buffered, for attachees during a
    /// holder gap.
    pub fn replay_lines(&self) -> Vec<String> {
        self.shared.lock().expect("client lock").replay.snapshot()
    }
}

async fn forward_exit(shared: &Arc<Mutex<ClientShared>>, info: ExitInfo) {
    let forward = {
        let mut s = shared.lock().expect("client lock");
        if s.exit.is_some() {
            return;
        }
        s.exit = Some(info.clone());
        s.forward.clone()
    };
    if let Some(tx) = forward {
        let _ = tx.send(BackendEvent::Exit(info)).await;
    }
}
