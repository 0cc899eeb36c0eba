//! WebSocket endpoints: the hybrid-binary terminal bridge and the JSON
//! message bus.

use crate::app::AppState;
use crate::http::{decode_ws_segment, ApiError};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use spire_core::session::{BufferedSink, PtySession, SessionFrame, DEFAULT_HIGH_WATER};
use spire_core::SpireError;
use spire_types::ws::{decode_frame, encode_control, encode_data, ControlFrame, WsFrame};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SEQ_HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
pub struct TerminalQuery {
    resume: Option<u64>,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    project: Option<String>,
}

pub async fn terminal_upgrade(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    serve_terminal(state, id, query, headers, ws)
}

/// Workspace-scoped upgrade URL; the workspace segment is origin context
/// only and resolves to the same terminal namespace.
pub async fn workspace_terminal_upgrade(
    State(state): State<AppState>,
    Path((workspace, id)): Path<(String, String)>,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = decode_ws_segment(&workspace) {
        return e.into_response();
    }
    serve_terminal(state, id, query, headers, ws)
}

fn serve_terminal(
    state: AppState,
    id: String,
    query: TerminalQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session) = state.sessions.get(&id).map(|s| s.clone()) else {
        return ApiError(SpireError::not_found(format!("no terminal {}", id))).into_response();
    };
    // resume: header wins over query
    let resume = headers
        .get("x-session-resume")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or(query.resume);
    ws.on_upgrade(move |socket| handle_terminal(socket, session, resume))
}

async fn handle_terminal(socket: WebSocket, session: Arc<PtySession>, resume: Option<u64>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (sink, mut frames) = BufferedSink::new(DEFAULT_HIGH_WATER);
    let reply = match resume {
        Some(seq) => session.attach_resume(sink, seq),
        None => session.attach(sink),
    };

    // replay first, then the seq the client should cache for resume
    let mut replay = reply.lines.join("\n");
    if !replay.is_empty() {
        replay.push('\n');
    }
    if ws_tx.send(Message::Binary(encode_data(replay.as_bytes()))).await.is_err() {
        if let Some(client_id) = reply.client_id {
            session.detach(client_id);
        }
        return;
    }
    let _ = ws_tx
        .send(Message::Binary(encode_control(&ControlFrame::Seq { seq: reply.seq })))
        .await;

    // exited sessions get the final snapshot, one exit frame, and a
    // normal close
    if let Some(exit) = reply.exit {
        let _ = ws_tx
            .send(Message::Binary(encode_control(&ControlFrame::Exit {
                code: exit.code,
                signal: exit.signal,
            })))
            .await;
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame { code: 1000, reason: "exited".into() })))
            .await;
        return;
    }
    let Some(client_id) = reply.client_id else { return };

    let mut heartbeat = tokio::time::interval(SEQ_HEARTBEAT);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(SessionFrame::Data(bytes)) => {
                    if ws_tx.send(Message::Binary(encode_data(&bytes))).await.is_err() {
                        break;
                    }
                }
                Some(SessionFrame::Exit(exit)) => {
                    let _ = ws_tx
                        .send(Message::Binary(encode_control(&ControlFrame::Exit {
                            code: exit.code,
                            signal: exit.signal,
                        })))
                        .await;
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "exited".into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(raw))) => match decode_frame(&raw) {
                    Ok(WsFrame::Data(bytes)) => {
                        session.record_user_input(&bytes);
                        session.write(bytes);
                    }
                    Ok(WsFrame::Control(ControlFrame::Resize { cols, rows })) => {
                        session.resize(cols, rows);
                    }
                    Ok(WsFrame::Control(ControlFrame::Ping {})) => {
                        let _ = ws_tx
                            .send(Message::Binary(encode_control(&ControlFrame::Pong {})))
                            .await;
                    }
                    Ok(WsFrame::Control(_)) => {}
                    Err(e) => debug!("bad frame from client: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket error: {}", e);
                    break;
                }
            },

            _ = heartbeat.tick() => {
                let frame = ControlFrame::Seq { seq: session.current_seq() };
                if ws_tx.send(Message::Binary(encode_control(&frame))).await.is_err() {
                    break;
                }
            }
        }
    }

    // detach synchronously with connection teardown
    session.detach(client_id);
}

pub async fn messages_upgrade(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_messages(socket, state, query.project))
}

async fn handle_messages(socket: WebSocket, state: AppState, project: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sub_id, mut bus_rx) = state.bus.subscribe(project);

    loop {
        tokio::select! {
            frame = bus_rx.recv() => match frame {
                Some(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("bus frame serialization failed: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    state.bus.unsubscribe(sub_id);
}
