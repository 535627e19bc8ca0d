//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client frames,
//! dispatching them to the core services, and sending responses.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};

use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::identity::Principal;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Spawns a sender task that drains the connection's outbound channel
/// 2. Processes incoming frames until the connection closes; everything
///    except `authenticate` and `ping` requires an authenticated session
/// 3. Releases the presence binding on the way out
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Outbound Channel + Sender Task ────────────────────────────

    let (handle, mut rx) = ConnectionHandle::channel();
    let connection_id = handle.id();
    tracing::debug!(connection = %connection_id, "WebSocket opened");

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(WsMessage::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Step 2: Process Frames ────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, &handle, client_msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        connection = %connection_id,
                        error = %e,
                        "Failed to parse client message"
                    );
                    handle.emit(ServerMessage::Error {
                        code: "invalid_frame".to_string(),
                        message: format!("Invalid message format: {}", e),
                    });
                }
            },
            Ok(WsMessage::Close(_)) => {
                tracing::debug!(connection = %connection_id, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    connection = %connection_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong; axum answers pings itself
        }
    }

    // ── Step 3: Cleanup ───────────────────────────────────────────────────

    state.lifecycle.on_disconnect(connection_id);
    sender_task.abort();
    tracing::debug!(connection = %connection_id, "WebSocket closed");
}

/// Handle a parsed client message.
async fn handle_client_message(state: &RelayState, handle: &ConnectionHandle, msg: ClientMessage) {
    match msg {
        ClientMessage::Authenticate { token } => {
            match state.lifecycle.on_authenticate(handle, &token).await {
                Ok(principal) => {
                    handle.emit(ServerMessage::Authenticated {
                        principal_id: principal.id,
                        privileged: principal.privileged,
                    });
                }
                Err(e) => {
                    handle.emit(ServerMessage::from_error(&e));
                }
            }
        }

        ClientMessage::Ping => {
            handle.emit(ServerMessage::Pong);
        }

        other => {
            let principal = match state.lifecycle.principal_for(handle.id()) {
                Ok(p) => p,
                Err(e) => {
                    handle.emit(ServerMessage::from_error(&e));
                    return;
                }
            };

            if let Err(e) = dispatch(state, handle, &principal, other).await {
                tracing::debug!(
                    principal = principal.id.as_str(),
                    code = e.code(),
                    error = %e,
                    "Request failed"
                );
                handle.emit(ServerMessage::from_error(&e));
            }
        }
    }
}

/// Route an authenticated request to the core service that owns it.
async fn dispatch(
    state: &RelayState,
    handle: &ConnectionHandle,
    principal: &Principal,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::Send { to, content } => {
            let message = state.router.send(&principal.id, &to, &content).await?;
            handle.emit(ServerMessage::SendAck {
                message_id: message.id,
            });
        }

        ClientMessage::MarkRead { counterpart } => {
            let count = state.receipts.mark_read(&principal.id, &counterpart).await?;
            handle.emit(ServerMessage::MarkReadAck { counterpart, count });
        }

        ClientMessage::ListConversations => {
            let conversations = state.conversations.list_conversations(&principal.id).await?;
            handle.emit(ServerMessage::Conversations { conversations });
        }

        ClientMessage::FetchHistory {
            counterpart,
            limit,
            before_id,
        } => {
            let messages = state
                .conversations
                .history(&principal.id, &counterpart, limit, before_id)
                .await?;
            handle.emit(ServerMessage::History {
                counterpart,
                messages,
            });
        }

        // Handled before authentication is checked
        ClientMessage::Authenticate { .. } | ClientMessage::Ping => {}
    }
    Ok(())
}
