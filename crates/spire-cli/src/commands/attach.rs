//! `spire attach`: bridge the local terminal onto a session over the
//! hybrid-binary WebSocket.

use crate::api::ApiClient;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use spire_types::ws::{decode_frame, encode_data, ControlFrame, WsFrame};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

pub async fn run(id: &str) -> Result<()> {
    let client = ApiClient::new()?;
    let url = client.ws_url(&format!("/ws/terminal/{}", id));

    let mut request = url.into_client_request().context("bad websocket url")?;
    if let Some(key) = client.bearer() {
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {}", key).parse().expect("header value"));
    }

    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .context("failed to connect (is spired running?)")?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // raw mode with restore-on-drop, so a panic cannot wedge the shell
    let stdin_handle = std::io::stdin();
    let original_termios = {
        use std::os::fd::AsFd;
        nix::sys::termios::tcgetattr(stdin_handle.as_fd())?
    };
    let mut raw_termios = original_termios.clone();
    nix::sys::termios::cfmakeraw(&mut raw_termios);
    {
        use std::os::fd::AsFd;
        nix::sys::termios::tcsetattr(
            stdin_handle.as_fd(),
            nix::sys::termios::SetArg::TCSANOW,
            &raw_termios,
        )?;
    }
    struct TermiosGuard {
        original: nix::sys::termios::Termios,
    }
    impl Drop for TermiosGuard {
        fn drop(&mut self) {
            use std::os::fd::AsFd;
            let stdin = std::io::stdin();
            let _ = nix::sys::termios::tcsetattr(
                stdin.as_fd(),
                nix::sys::termios::SetArg::TCSANOW,
                &self.original,
            );
        }
    }
    let _guard = TermiosGuard { original: original_termios };

    eprintln!("[attached to {}; Ctrl-C twice to detach]\r", id);

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut input_buf = [0u8; 4096];
    let mut last_seq: Option<u64> = None;
    let mut last_ctrl_c: Option<Instant> = None;
    let ctrl_c_window = Duration::from_secs(1);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!("websocket error: {}", e);
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Binary(raw) => match decode_frame(&raw) {
                        Ok(WsFrame::Data(bytes)) => {
                            stdout.write_all(&bytes).await?;
                            stdout.flush().await?;
                        }
                        Ok(WsFrame::Control(ControlFrame::Seq { seq })) => {
                            last_seq = Some(seq);
                        }
                        Ok(WsFrame::Control(ControlFrame::Exit { code, .. })) => {
                            eprintln!("\r\n[session exited with {:?}]\r", code);
                            break;
                        }
                        Ok(WsFrame::Control(_)) => {}
                        Err(e) => tracing::debug!("bad frame: {}", e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            read = stdin.read(&mut input_buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("stdin error: {}", e);
                        break;
                    }
                };
                let data = &input_buf[..n];

                if data.len() == 1 && data[0] == 0x03 {
                    let now = Instant::now();
                    if last_ctrl_c.map(|t| now.duration_since(t) < ctrl_c_window).unwrap_or(false) {
                        eprintln!("\r\n[detached; resume later with seq {:?}]\r", last_seq);
                        break;
                    }
                    last_ctrl_c = Some(now);
                    // a single Ctrl-C still reaches the session
                } else {
                    last_ctrl_c = None;
                }

                if ws_tx.send(Message::Binary(encode_data(data))).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    Ok(())
}
