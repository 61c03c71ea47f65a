use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use canvas_sync::{ControlMessage, Frame, Presence, Throttle};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::collab::document::{Outbound, ProjectDocument};
use crate::error::AppError;
use crate::identity::CurrentUser;
use crate::AppState;

/// WebSocket handler for a project's live document
async fn ws_handler(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let project = state.db.require_project(&project_id).await?;
    let (doc, updates) = state.docs.join(&project, &state.db).await?;
    let user = CurrentUser::from_headers(&headers);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, doc, updates, user)))
}

fn to_message(frame: Frame) -> Option<Message> {
    match frame {
        Frame::Update(update) => Some(Message::Binary(update)),
        Frame::Control(control) => match control.to_json() {
            Ok(text) => Some(Message::Text(text)),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode control message");
                None
            }
        },
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Binary(data) => Some(Frame::Update(data)),
        Message::Text(text) => ControlMessage::from_json(&text).map(Frame::Control),
        _ => None,
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    doc: Arc<ProjectDocument>,
    mut update_rx: broadcast::Receiver<Outbound>,
    user: Option<CurrentUser>,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // Send initial state and current presence; `update_rx` was subscribed before this
    // state was encoded, so nothing falls between the two
    let mut initial = vec![Frame::Update(doc.doc.encode_state())];
    initial.extend(
        doc.presence_snapshot(&connection_id)
            .await
            .into_iter()
            .map(|p| Frame::Control(ControlMessage::Awareness(p))),
    );
    for frame in initial {
        let Some(message) = to_message(frame) else {
            continue;
        };
        if let Err(e) = sender.send(message).await {
            tracing::error!(connection = %connection_id, error = %e, "failed to send initial state");
            drop(update_rx);
            state.docs.release(&doc.project_id, &state.db).await;
            return;
        }
    }

    // Direct replies to this client share the sink with the fan-out
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<Frame>();
    let own_id = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(frame) => frame,
                    None => break,
                },
                outbound = update_rx.recv() => match outbound {
                    Ok(Outbound { origin, frame }) => {
                        if origin == own_id {
                            continue;
                        }
                        frame
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // The client repairs the gap with its next sync request
                        tracing::warn!(connection = %own_id, skipped, "connection lagging behind updates");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            let Some(message) = to_message(frame) else {
                continue;
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages from this client
    let recv_doc = doc.clone();
    let recv_id = connection_id.clone();
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        let interval = recv_state.config.awareness_throttle;
        let mut awareness_throttle = Throttle::new(interval);
        // Newest presence dropped by the throttle, published when `flush` fires
        let mut held: Option<Presence> = None;
        let flush = tokio::time::sleep(interval);
        tokio::pin!(flush);
        let can_edit = user.is_some();

        loop {
            let msg = tokio::select! {
                msg = receiver.next() => match msg {
                    Some(Ok(msg)) => msg,
                    _ => break,
                },
                _ = &mut flush, if held.is_some() => {
                    if let Some(presence) = held.take() {
                        recv_doc.update_presence(&recv_id, presence).await;
                    }
                    continue;
                }
            };
            if let Message::Close(_) = msg {
                break;
            }
            let Some(frame) = from_message(msg) else {
                continue;
            };

            match frame {
                Frame::Update(update) => {
                    if !can_edit {
                        tracing::debug!(connection = %recv_id, "dropping update from read-only connection");
                        continue;
                    }
                    if let Err(e) = recv_doc.apply_client_update(&recv_id, update.clone()) {
                        tracing::error!(connection = %recv_id, error = %e, "failed to apply update");
                        continue;
                    }
                    if let Err(e) = recv_state
                        .db
                        .store_crdt_update(&recv_doc.project_id, &update)
                        .await
                    {
                        tracing::error!(project = %recv_doc.project_id, error = %e, "failed to store update");
                    }
                    recv_doc.schedule_checkpoint(recv_state.db.clone()).await;
                }
                Frame::Control(ControlMessage::SyncRequest { state_vector }) => {
                    match recv_doc.answer_sync_request(&state_vector) {
                        Ok(diff) => {
                            let _ = direct_tx.send(Frame::Update(diff));
                        }
                        Err(e) => {
                            tracing::warn!(connection = %recv_id, error = %e, "bad sync request")
                        }
                    }
                }
                Frame::Control(ControlMessage::Awareness(presence)) => {
                    let presence = match &user {
                        Some(user) => {
                            let mut own = user.presence(&recv_id);
                            own.cursor = presence.cursor;
                            own.is_typing = presence.is_typing;
                            own.selection = presence.selection;
                            own
                        }
                        None => presence,
                    };
                    if awareness_throttle.allow(recv_id.clone()) {
                        held = None;
                        recv_doc.update_presence(&recv_id, presence).await;
                    } else {
                        held = Some(presence);
                        flush.as_mut().reset(tokio::time::Instant::now() + interval);
                    }
                }
                Frame::Control(ControlMessage::PresenceRemoved { .. }) => {
                    held = None;
                    recv_doc.remove_presence(&recv_id).await;
                }
            }
        }
    });

    // Wait for either task to complete, then for the other to unwind so neither its
    // subscription nor a held presence outlives the connection
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = (&mut recv_task).await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = (&mut send_task).await;
        }
    }

    doc.remove_presence(&connection_id).await;
    tracing::debug!(connection = %connection_id, project = %doc.project_id, "connection closed");
    state.docs.release(&doc.project_id, &state.db).await;
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/:project_id", get(ws_handler))
}
