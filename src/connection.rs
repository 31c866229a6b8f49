use crate::events::{EventType, WireEvent};
use crate::rate_limit::RateLimiter;
use crate::rooms::{Room, RoomRegistry, SocketHandle, SocketId, SocketMessage};
use crate::store::Store;
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

/// A socket that stays silent longer than this is presumed gone (clients
/// heartbeat well inside the window).
pub const HEARTBEAT_TIMEOUT_SECONDS: f64 = 35.0;

/// Close codes used by the admission and read loops.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Per-socket sliding-window limits (events per second).
pub const MOVE_EVENTS_PER_SECOND: usize = 60;
pub const ERASE_EVENTS_PER_SECOND: usize = 30;
const RATE_WINDOW_SECONDS: f64 = 1.0;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// What the external auth layer hands the core per accepted socket. The
/// username doubles as the session-scoped client identity.
#[derive(Debug, Clone)]
pub struct Admission {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub gm_key: Option<String>,
}

pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rate-limit then apply one decoded frame, returning the emitted reply.
/// Over-limit TOKEN_MOVE / ERASE_AT frames never reach the room.
pub fn handle_frame(
    room: &Room,
    socket_id: SocketId,
    client_id: &str,
    limiter: &RateLimiter,
    event: WireEvent,
) -> WireEvent {
    let over_limit = match event.event_type {
        EventType::TokenMove => {
            !limiter.check("move", MOVE_EVENTS_PER_SECOND, RATE_WINDOW_SECONDS)
        }
        EventType::EraseAt => {
            !limiter.check("erase", ERASE_EVENTS_PER_SECOND, RATE_WINDOW_SECONDS)
        }
        _ => false,
    };
    if over_limit {
        let error = WireEvent::error("rate limited");
        room.send_to(socket_id, &error);
        return error;
    }
    room.submit(socket_id, client_id, event)
}

/// Drive one admitted WebSocket for its whole life: membership check, room
/// attach + handshake, framed read loop with the heartbeat deadline, and
/// detach (with flush-on-empty) on the way out.
pub async fn serve_socket(
    registry: &RoomRegistry,
    store: &dyn Store,
    ws: WebSocketStream<TcpStream>,
    admission: Admission,
) {
    let (mut sink, mut reader) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketMessage>();

    // Writer task: the only place that touches the sink. Everything else
    // queues frames through the handle.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                SocketMessage::Event(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                SocketMessage::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let handle = SocketHandle {
        id: next_socket_id(),
        client_id: admission.username.clone(),
        tx,
    };
    let socket_id = handle.id;

    let member = store
        .is_member(&admission.user_id, &admission.room_id)
        .unwrap_or(false);
    if !member {
        handle.close(CLOSE_POLICY_VIOLATION, "not a room member");
        let _ = writer.await;
        return;
    }

    let attached = registry.attach(
        &admission.room_id,
        handle.clone(),
        &admission.user_id,
        admission.gm_key.as_deref(),
    );
    let room = match attached {
        Ok((room, is_gm)) => {
            debug!(room_id = %admission.room_id, client_id = %admission.username, is_gm, "socket attached");
            room
        }
        Err(e) => {
            tracing::warn!(room_id = %admission.room_id, error = %e, "attach failed");
            handle.close(CLOSE_INTERNAL_ERROR, "internal error");
            let _ = writer.await;
            return;
        }
    };

    let limiter = RateLimiter::new();
    let deadline = Duration::from_secs_f64(HEARTBEAT_TIMEOUT_SECONDS);
    loop {
        let frame = match tokio::time::timeout(deadline, reader.next()).await {
            Err(_) => {
                handle.close(CLOSE_GOING_AWAY, "heartbeat-timeout");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => match WireEvent::decode(&text) {
                Ok(event) => {
                    handle_frame(&room, socket_id, &admission.username, &limiter, event);
                }
                Err(_) => {
                    room.send_to(socket_id, &WireEvent::error("Invalid event"));
                }
            },
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; binary is not part
            // of the wire protocol.
            _ => {}
        }
    }

    registry.detach(&admission.room_id, socket_id);
    // The writer exits when every sender is gone; ours is the last one.
    drop(handle);
    let _ = writer.await;
}
