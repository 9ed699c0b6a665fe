//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: assigning the identity,
//! decoding client events, dispatching them to the relay state, and
//! reporting rejected events back to the sender.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};

use crate::error::{RelayError, Result};
use crate::identity::Identity;
use crate::protocol::{ClientMessage, ServerMessage, Target};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Registers the connection and mints its identity
/// 2. Spawns a sender task draining the outbound queue
/// 3. Processes incoming events until the connection closes
/// 4. Ends the client's calls and removes it from the roster
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Register ──────────────────────────────────────────────────

    let (tx, mut rx) = state.outbound_channel();
    let identity = state.connect(tx);

    // ── Step 2: Spawn Sender Task ─────────────────────────────────────────

    let sender_identity = identity.clone();
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(
                        identity = %sender_identity,
                        error = %e,
                        "Failed to serialize server message"
                    );
                }
            }
        }
    });

    // ── Step 3: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => handle_client_message(&state, &identity, client_msg),
                Err(e) => {
                    tracing::warn!(
                        identity = %identity,
                        error = %e,
                        "Failed to parse client message"
                    );
                    report(&state, &identity, &RelayError::MalformedMessage(e.to_string()));
                }
            },
            Ok(Message::Binary(_)) => {
                report(
                    &state,
                    &identity,
                    &RelayError::MalformedMessage("binary frames are not supported".to_string()),
                );
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(identity = %identity, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "WebSocket error");
                break;
            }
            _ => {} // Ping/Pong are answered by the WebSocket layer
        }
    }

    // ── Step 4: Cleanup ───────────────────────────────────────────────────

    state.disconnect(&identity);
    sender_task.abort();
}

/// Dispatch one decoded client event.
fn handle_client_message(state: &RelayState, me: &Identity, msg: ClientMessage) {
    let result = match msg {
        ClientMessage::CallUser {
            user_to_call,
            signal_data,
            from,
        } => {
            if let Some(claimed) = from.filter(|claimed| claimed != me) {
                tracing::warn!(
                    identity = %me,
                    claimed = %claimed,
                    "callUser claimed another sender, using connection identity"
                );
            }
            state.call_user(me, &user_to_call, signal_data).map(|_| ())
        }

        ClientMessage::AcceptCall { signal, to } => {
            peer(me, &to).and_then(|caller| state.accept_call(me, &caller, signal))
        }

        ClientMessage::DeclineCall { to } => {
            peer(me, &to).and_then(|caller| state.decline_call(me, &caller))
        }

        ClientMessage::CancelCall { to } => {
            peer(me, &to).and_then(|callee| state.cancel_call(me, &callee))
        }

        ClientMessage::EndCall { to } => peer(me, &to).and_then(|other| state.end_call(me, &other)),

        ClientMessage::Message { to, message } => {
            state.send_message(me, &to, message);
            Ok(())
        }

        ClientMessage::Signal { to, signal } => state.relay_signal(me, &to, signal),

        ClientMessage::Ping => {
            state.presence.send_best_effort(me, ServerMessage::Pong);
            Ok(())
        }
    };

    if let Err(err) = result {
        report(state, me, &err);
    }
}

/// The other participant named by a lifecycle event's `to`.
fn peer(me: &Identity, to: &Target) -> Result<Identity> {
    to.peer_of(me)
        .ok_or_else(|| RelayError::InvalidTarget("no peer identity in `to`".to_string()))
}

/// Tell the sender its event was rejected. Stale events are swallowed.
fn report(state: &RelayState, me: &Identity, err: &RelayError) {
    if err.is_silent() {
        tracing::debug!(identity = %me, "Ignoring event for a call that already ended");
        return;
    }
    tracing::debug!(identity = %me, code = err.code(), error = %err, "Rejected client event");
    state.presence.send_best_effort(me, ServerMessage::from(err));
}
