//! WebSocket frame push.
//!
//! Frames go out as binary messages. Status and error text go out as JSON
//! text messages: `{"message": ...}` and `{"error": ...}`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use cr_core::{SessionId, StreamMode};
use cr_session::SessionEvent;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::context::AppContext;
use crate::error::AppError;
use crate::routes::sessions::{parse_id, StartSessionRequest};

/// GET /ws/sessions/{id}
///
/// Attach to a running frame session. Closing the socket detaches without
/// stopping the session.
pub async fn session_ws(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let handle = ctx.sessions.get(&id)?;
    let events = handle.subscribe().ok_or_else(|| {
        cr_core::Error::Conflict(format!("session {id} is not a frame session"))
    })?;

    Ok(ws.on_upgrade(move |socket| async move {
        let (mut sender, mut receiver) = socket.split();
        forward_events(id, events, &mut sender, &mut receiver).await;
        tracing::debug!(session_id = %id, "Frame subscriber detached");
    }))
}

/// GET /ws/stream
///
/// The client sends one text message with a start body; frames then flow on
/// the same socket and the session is stopped when the socket closes.
pub async fn stream_ws(State(ctx): State<AppContext>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, ctx))
}

async fn handle_stream_socket(socket: WebSocket, ctx: AppContext) {
    let (mut sender, mut receiver) = socket.split();

    let payload = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<StartSessionRequest>(text.as_str()) {
                    Ok(payload) => break payload,
                    Err(e) => {
                        send_error(&mut sender, format!("Invalid start message: {e}")).await;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    let request = StartSessionRequest {
        mode: StreamMode::FrameStream,
        ..payload
    };
    let started = match request.into_start_request(&ctx.config) {
        Ok(req) => ctx.sessions.start(req).await,
        Err(e) => Err(e),
    };
    let handle = match started {
        Ok(handle) => handle,
        Err(e) => {
            send_error(&mut sender, e.to_string()).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let id = handle.id();
    if let Some(events) = handle.subscribe() {
        send_json(
            &mut sender,
            serde_json::json!({ "message": "Session started", "session_id": id }),
        )
        .await;
        forward_events(id, events, &mut sender, &mut receiver).await;
    }

    match ctx.sessions.stop(&id).await {
        Ok(outcome) => {
            tracing::info!(session_id = %id, state = %outcome.final_state, "Socket closed, session stopped");
        }
        Err(cr_core::Error::NotFound { .. }) => {}
        Err(e) => tracing::warn!(session_id = %id, "Failed to stop session: {e}"),
    }
}

type Sender = SplitSink<WebSocket, Message>;

/// Pump session events to the socket until the session ends or the client
/// goes away.
async fn forward_events<R>(
    id: SessionId,
    mut events: broadcast::Receiver<SessionEvent>,
    sender: &mut Sender,
    receiver: &mut R,
) where
    R: futures::Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        tokio::select! {
            event = events.recv() => {
                let sent = match event {
                    Ok(SessionEvent::Frame(frame)) => {
                        sender.send(Message::Binary(frame.data)).await.is_ok()
                    }
                    Ok(SessionEvent::Status(message)) => {
                        send_json(sender, serde_json::json!({ "message": message })).await
                    }
                    Ok(SessionEvent::Error(error)) => {
                        send_json(sender, serde_json::json!({ "error": error })).await
                    }
                    Ok(SessionEvent::End) | Err(RecvError::Closed) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(session_id = %id, skipped, "Slow frame subscriber");
                        true
                    }
                };
                if !sent {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_json(sender: &mut Sender, value: serde_json::Value) -> bool {
    sender
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

async fn send_error(sender: &mut Sender, error: String) {
    send_json(sender, serde_json::json!({ "error": error })).await;
}
