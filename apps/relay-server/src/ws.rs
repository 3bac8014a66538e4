//! WebSocket endpoint: one socket per participant.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use cofield::{CollabMessage, UserId};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{room::Room, AppState};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The first frame must be the join handshake.
    let join = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<CollabMessage>(&text) {
                Ok(message) => break message,
                Err(e) => {
                    warn!("malformed handshake frame: {}", e);
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let CollabMessage::Join {
        session_id,
        model,
        record_id,
        user,
    } = join
    else {
        warn!("expected join_collaboration as first message; closing");
        return;
    };

    let user_id = user.user_id;
    let room = state.rooms.get_or_create(session_id, &model, &record_id);
    let mut broadcast_rx = room.join(user.clone());
    info!(
        "{} ({}) joined session {}",
        user.display_name, user_id, session_id
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<CollabMessage>();

    // Membership is relay-authoritative; the joiner mirrors this roster.
    let _ = tx.send(CollabMessage::ParticipantsUpdated {
        participants: room.roster(),
    });

    // Pump queued messages onto the socket.
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to encode message: {}", e),
            }
        }
    });

    // Pump room fan-out into this participant's queue.
    let fanout_tx = tx.clone();
    let fanout_task = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(envelope) => {
                    if envelope.should_deliver_to(user_id)
                        && fanout_tx.send(envelope.message).is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("client {} lagged, {} messages dropped", user_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<CollabMessage>(&text) {
                Ok(message) => {
                    if !handle_client_message(message, &room, user_id, &tx) {
                        break;
                    }
                }
                Err(e) => warn!("dropping malformed frame from {}: {}", user_id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("socket error for {}: {}", user_id, e);
                break;
            }
        }
    }

    // Disconnect implies leave.
    send_task.abort();
    fanout_task.abort();
    if room.leave(user_id) {
        state.rooms.remove_if_empty(session_id);
    }
    info!("{} left session {}", user_id, session_id);
}

/// Dispatch one client frame. Returns false when the client asked to leave.
fn handle_client_message(
    message: CollabMessage,
    room: &Arc<Room>,
    user_id: UserId,
    tx: &mpsc::UnboundedSender<CollabMessage>,
) -> bool {
    match message {
        CollabMessage::FieldChanged { .. }
        | CollabMessage::CursorMoved { .. }
        | CollabMessage::FieldFocused { .. }
        | CollabMessage::FieldBlurred { .. }
        | CollabMessage::ConflictDetected { .. } => room.forward(user_id, message),

        CollabMessage::ResolveConflict { resolution } => room.resolve(user_id, resolution),

        CollabMessage::Leave { .. } => return false,

        CollabMessage::Ping => {
            let _ = tx.send(CollabMessage::Pong);
        }

        CollabMessage::Join { .. } => {
            warn!("duplicate join from {}; ignoring", user_id);
        }

        other => {
            warn!("unexpected message from {}: {:?}", user_id, other);
        }
    }
    true
}
