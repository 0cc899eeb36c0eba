//! The holder loop: one PTY child, one socket, at most one client.
//!
//! A holder binds its socket, then spawns the requested process on a
//! pseudoterminal. Every accepted connection gets a meta frame (pid +
//! start time, the capability a reconnecting daemon must present) and a
//! replay of the scrollback, and becomes the current client — replacing
//! whichever connection held that role before. Client disconnects never
//! stop the holder; only child exit (with restarts exhausted), a kill
//! frame, or SIGTERM do, and the socket file is removed on the way out.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use spire_types::shellper::{
    CodecError, HolderControl, HolderEvent, RestartPolicy, ShellperCodec, ShellperFrame,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const KILL_GRACE: Duration = Duration::from_millis(500);

pub struct HolderConfig {
    pub socket_path: PathBuf,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub restart: Option<RestartPolicy>,
    pub scrollback_bytes: usize,
    pub command: Vec<String>,
}

enum ChildEvent {
    Output(Bytes),
    Exit(i32),
}

struct Child {
    events: mpsc::Receiver<ChildEvent>,
    writer_tx: mpsc::Sender<Bytes>,
    master: Box<dyn MasterPty + Send>,
    pid: Option<u32>,
}

/// Byte scrollback replayed to every (re)connecting client.
struct Scrollback {
    data: Vec<u8>,
    cap: usize,
}

impl Scrollback {
    fn new(cap: usize) -> Self {
        Self { data: Vec::new(), cap }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.cap {
            let excess = self.data.len() - self.cap;
            self.data.drain(..excess);
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }
}

pub async fn run(config: HolderConfig) -> Result<()> {
    let start_time =
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let pid = std::process::id();

    let _ = std::fs::remove_file(&config.socket_path);
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    info!("holder {} listening on {}", pid, config.socket_path.display());

    let result = serve(&config, listener, pid, start_time).await;

    // The holder never outlives its socket file.
    let _ = std::fs::remove_file(&config.socket_path);
    result
}

async fn serve(
    config: &HolderConfig,
    listener: UnixListener,
    pid: u32,
    start_time: u64,
) -> Result<()> {
    let mut child = match spawn_child(config) {
        Ok(child) => child,
        Err(e) => {
            // Nothing to hold: exit immediately, the daemon finds out on
            // its first connect.
            warn!("child spawn failed: {}", e);
            return Err(e);
        }
    };

    let mut scroll = Scrollback::new(config.scrollback_bytes);
    let mut client: Option<Framed<UnixStream, ShellperCodec>> = None;
    let mut restart = config.restart;
    let mut restarts_used: u32 = 0;
    let mut force_kill_at: Option<tokio::time::Instant> = None;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        let force_kill_timer = async {
            match force_kill_at {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("accept failed")?;
                let mut framed = Framed::new(stream, ShellperCodec);
                let meta = ShellperFrame::control(&HolderEvent::Meta {
                    pid,
                    start_time,
                    socket_path: config.socket_path.to_string_lossy().to_string(),
                })?;
                if framed.send(meta).await.is_err() {
                    continue;
                }
                let replay = scroll.snapshot();
                if !replay.is_empty() {
                    let _ = framed.send(ShellperFrame::data(replay)).await;
                }
                if client.is_some() {
                    debug!("replacing existing client");
                }
                client = Some(framed);
            }

            ev = child.events.recv() => match ev {
                Some(ChildEvent::Output(bytes)) => {
                    scroll.push(&bytes);
                    if let Some(framed) = client.as_mut() {
                        if framed.send(ShellperFrame::Data(bytes)).await.is_err() {
                            client = None;
                        }
                    }
                }
                exited => {
                    let code = match exited {
                        Some(ChildEvent::Exit(code)) => code,
                        _ => -1,
                    };
                    let may_restart = restart
                        .map(|p| restarts_used < p.max_restarts)
                        .unwrap_or(false);
                    if may_restart {
                        let policy = restart.expect("checked");
                        restarts_used += 1;
                        info!(
                            "child exited with {}; restart {}/{} after {}ms",
                            code, restarts_used, policy.max_restarts, policy.delay_ms
                        );
                        tokio::time::sleep(Duration::from_millis(policy.delay_ms)).await;
                        match spawn_child(config) {
                            Ok(next) => {
                                child = next;
                                force_kill_at = None;
                            }
                            Err(e) => {
                                warn!("restart failed: {}", e);
                                send_exit(&mut client, Some(code)).await;
                                break;
                            }
                        }
                    } else {
                        info!("child exited with {}", code);
                        send_exit(&mut client, Some(code)).await;
                        break;
                    }
                }
            },

            frame = next_client_frame(&mut client) => match frame {
                Some(Ok(ShellperFrame::Data(bytes))) => {
                    if child.writer_tx.try_send(bytes).is_err() {
                        warn!("pty writer saturated, dropping input");
                    }
                }
                Some(Ok(frame @ ShellperFrame::Control(_))) => {
                    match frame.parse_control::<HolderControl>() {
                        Ok(HolderControl::Resize { cols, rows }) => {
                            let _ = child.master.resize(PtySize {
                                cols, rows, pixel_width: 0, pixel_height: 0,
                            });
                        }
                        Ok(HolderControl::Kill {}) => {
                            // Clear the policy first so the kill cannot
                            // race an auto-respawn.
                            restart = None;
                            terminate(child.pid);
                            if force_kill_at.is_none() {
                                force_kill_at =
                                    Some(tokio::time::Instant::now() + KILL_GRACE);
                            }
                        }
                        Ok(HolderControl::Reconnect {
                            expected_pid,
                            expected_start_time,
                            restart_policy,
                        }) => {
                            if expected_pid != pid || expected_start_time != start_time {
                                warn!(
                                    "stale reconnect: expected {}/{}, we are {}/{}",
                                    expected_pid, expected_start_time, pid, start_time
                                );
                                if let Some(framed) = client.as_mut() {
                                    let _ = framed
                                        .send(ShellperFrame::control(&HolderEvent::Stale {})?)
                                        .await;
                                }
                                client = None;
                            } else if let Some(policy) = restart_policy {
                                restart = Some(policy);
                                restarts_used = 0;
                            }
                        }
                        Err(e) => debug!("unparseable control frame ignored: {}", e),
                    }
                }
                Some(Err(e)) => {
                    warn!("client read error: {}", e);
                    client = None;
                }
                // Client went away; the holder is not owned by any
                // particular client, keep running.
                None => client = None,
            },

            _ = force_kill_timer => {
                force_kill(child.pid);
                force_kill_at = None;
            }

            _ = sigterm.recv() => {
                info!("SIGTERM: shutting down holder");
                terminate(child.pid);
                break;
            }
        }
    }

    Ok(())
}

async fn next_client_frame(
    client: &mut Option<Framed<UnixStream, ShellperCodec>>,
) -> Option<std::result::Result<ShellperFrame, CodecError>> {
    match client {
        Some(framed) => framed.next().await,
        None => std::future::pending().await,
    }
}

async fn send_exit(client: &mut Option<Framed<UnixStream, ShellperCodec>>, code: Option<i32>) {
    if let Some(framed) = client.as_mut() {
        if let Ok(frame) = ShellperFrame::control(&HolderEvent::Exit { code, signal: None }) {
            let _ = framed.send(frame).await;
        }
    }
}

fn spawn_child(config: &HolderConfig) -> Result<Child> {
    let (program, args) =
        config.command.split_first().context("empty command for holder child")?;

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            cols: config.cols,
            rows: config.rows,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow::anyhow!("openpty failed: {}", e))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.cwd(&config.cwd);
    cmd.env("TERM", "xterm-256color");

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow::anyhow!("spawn {} failed: {}", program, e))?;
    let pid = child.process_id();
    drop(pair.slave);
    info!("spawned {} (pid {:?})", program, pid);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow::anyhow!("pty reader: {}", e))?;
    let mut writer =
        pair.master.take_writer().map_err(|e| anyhow::anyhow!("pty writer: {}", e))?;

    let (events_tx, events_rx) = mpsc::channel::<ChildEvent>(1024);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(256);

    std::thread::spawn(move || {
        let mut child = child;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if events_tx
                        .blocking_send(ChildEvent::Output(Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let code = child.wait().map(|status| status.exit_code() as i32).unwrap_or(-1);
        let _ = events_tx.blocking_send(ChildEvent::Exit(code));
    });

    std::thread::spawn(move || {
        while let Some(data) = writer_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    Ok(Child { events: events_rx, writer_tx, master: pair.master, pid })
}

// The PTY child is its session leader, so signalling the group reaches
// grandchildren that share the slave (e.g. `sh -c "...; cat"`).
fn terminate(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            if libc::killpg(pid as i32, libc::SIGTERM) != 0 {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
}

fn force_kill(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            if libc::killpg(pid as i32, libc::SIGKILL) != 0 {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }
}
