//! Browser terminal transport
//!
//! The browser attaches to a session created by the shell endpoint. Binary
//! frames and plain text frames carry keystrokes; JSON control frames carry
//! resizes. Output goes back as binary frames.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::session::{Attachment, Outbound, TerminalSize};
use crate::error::Error;
use crate::AppState;

/// Chunks buffered between transport and bridge in each direction
const TRANSPORT_BUFFER: usize = 32;

/// Largest reason a websocket close frame can carry, in bytes
const MAX_CLOSE_REASON: usize = 123;

/// JSON control frames sent by the browser
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlFrame {
    Resize { rows: u16, cols: u16 },
    Stdin { data: String },
}

/// A decoded inbound frame
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Data(Bytes),
    Resize(TerminalSize),
    Ignore,
}

fn decode_text(text: &str) -> Inbound {
    if text.trim_start().starts_with('{') {
        match serde_json::from_str::<ControlFrame>(text) {
            Ok(ControlFrame::Resize { rows, cols }) if rows == 0 || cols == 0 => {
                return Inbound::Ignore
            }
            Ok(ControlFrame::Resize { rows, cols }) => {
                return Inbound::Resize(TerminalSize::new(rows, cols))
            }
            Ok(ControlFrame::Stdin { data }) => return Inbound::Data(Bytes::from(data)),
            Err(_) => {}
        }
    }
    Inbound::Data(Bytes::copy_from_slice(text.as_bytes()))
}

/// Session id carried by the transport path.
///
/// SockJS clients connect to `{server}/{session}/websocket`. Any other path
/// carries the id as its last non-empty segment.
fn session_id_from_path(path: &str) -> Option<&str> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [_server, session, "websocket"] => Some(*session),
        [.., last] => Some(*last),
        [] => None,
    }
}

/// Cut `reason` down to what fits in a close frame
fn close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Upgrade to the terminal websocket
pub async fn terminal_socket(
    State(state): State<AppState>,
    Path(path): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = session_id_from_path(&path).map(str::to_string);
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, session_id))
}

async fn handle_terminal_socket(socket: WebSocket, state: AppState, session_id: Option<String>) {
    let Some(session_id) = session_id else {
        reject(socket, Error::InvalidRequest("missing session id".to_string())).await;
        return;
    };

    let session = match state.sessions.get(&session_id) {
        Ok(session) => session,
        Err(e) => {
            reject(socket, e).await;
            return;
        }
    };

    let (input_tx, input_rx) = mpsc::channel::<Bytes>(TRANSPORT_BUFFER);
    let (output_tx, mut output_rx) = mpsc::channel::<Outbound>(TRANSPORT_BUFFER);
    let attachment = Attachment {
        input: input_rx,
        output: output_tx,
    };
    if let Err(e) = session.bind(attachment).await {
        reject(socket, e).await;
        return;
    }
    info!("Browser attached to terminal session {}", session_id);

    let (mut sink, mut stream) = socket.split();
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            outbound = output_rx.recv() => match outbound {
                Some(Outbound::Data(data)) => {
                    if sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Error(message)) => failure = Some(message),
                None => break,
            },
            inbound = stream.next() => {
                let inbound = match inbound {
                    Some(Ok(Message::Binary(data))) => Inbound::Data(data),
                    Some(Ok(Message::Text(text))) => decode_text(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => Inbound::Ignore,
                    Some(Err(e)) => {
                        debug!("Terminal socket {} errored: {}", session_id, e);
                        break;
                    }
                };

                match inbound {
                    Inbound::Data(data) => {
                        if input_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Inbound::Resize(size) => {
                        if session.push_resize(size).is_err() {
                            break;
                        }
                    }
                    Inbound::Ignore => {}
                }
            }
        }
    }

    // Stop feeding the bridge so it tears down the exec stream
    drop(input_tx);

    let close = match failure {
        Some(message) => {
            let frame = serde_json::json!({ "op": "error", "message": message }).to_string();
            let _ = sink.send(Message::Text(frame.into())).await;
            CloseFrame {
                code: close_code::ERROR,
                reason: "terminal session failed".into(),
            }
        }
        None => CloseFrame {
            code: close_code::NORMAL,
            reason: "terminal session closed".into(),
        },
    };
    let _ = sink.send(Message::Close(Some(close))).await;

    state.sessions.delete(&session_id).await;
    info!("Browser detached from terminal session {}", session_id);
}

/// Close a socket that cannot be attached, telling the browser why
async fn reject(mut socket: WebSocket, reason: Error) {
    warn!("Rejecting terminal socket: {}", reason);
    let reason = reason.to_string();
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: close_reason(&reason).into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
