use crate::autosave;
use crate::erase;
use crate::events::{self, EventType, WireEvent};
use crate::journal::Journal;
use crate::models::{RoomState, Shape, ShapeKind, Stroke, Token};
use crate::permissions;
use crate::presence::Presence;
use crate::store::{Store, StoreError};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

pub const ERASER_HIT_RADIUS_DEFAULT: f64 = 18.0;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid room state: {0}")]
    InvalidState(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
}

// --- Sockets ---

pub type SocketId = u64;

/// Messages delivered to a socket's writer task.
#[derive(Debug, Clone)]
pub enum SocketMessage {
    Event(String),
    Close { code: u16, reason: String },
}

/// Handle to one connected socket: the identity it speaks for and the
/// outbound channel its writer task drains. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    pub id: SocketId,
    pub client_id: String,
    pub tx: mpsc::UnboundedSender<SocketMessage>,
}

impl SocketHandle {
    /// Queue an event frame. Returns false if the writer side is gone.
    pub fn send_event(&self, encoded: &str) -> bool {
        self.tx
            .send(SocketMessage::Event(encoded.to_string()))
            .is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(SocketMessage::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

// --- Room ---

pub(crate) struct RoomInner {
    pub(crate) state: RoomState,
    pub(crate) journal: Journal,
    pub(crate) presence: Presence,
    pub(crate) sockets: HashMap<SocketId, SocketHandle>,
    pub(crate) dirty: bool,
    pub(crate) last_change: Instant,
    autosave_live: bool,
}

/// One live room: exclusive owner of its state, journal, and socket set.
/// Every mutation runs under the inner mutex, which is held only over
/// CPU-bound work (fanout queues frames without blocking), so all sockets
/// observe events in the exact order the room accepted them.
pub struct Room {
    pub room_id: String,
    inner: Mutex<RoomInner>,
    store: Arc<dyn Store>,
    // Self-handle for spawning the autosave task from &self methods.
    weak: Weak<Room>,
}

/// Where a reply goes: to everyone in the room, or back to the sender only.
enum Reply {
    Broadcast(WireEvent),
    Sender(WireEvent),
}

impl Room {
    fn new(room_id: &str, state: RoomState, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Room {
            room_id: room_id.to_string(),
            inner: Mutex::new(RoomInner {
                state,
                journal: Journal::new(),
                presence: Presence::new(),
                sockets: HashMap::new(),
                dirty: false,
                last_change: Instant::now(),
                autosave_live: false,
            }),
            store,
            weak: weak.clone(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RoomInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Inspection ---

    pub fn snapshot_state(&self) -> RoomState {
        self.lock().state.clone()
    }

    pub fn journal_depth(&self) -> usize {
        self.lock().journal.depth()
    }

    pub fn redo_depth(&self) -> usize {
        self.lock().journal.redo_depth()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn socket_count(&self) -> usize {
        self.lock().sockets.len()
    }

    pub fn clients(&self) -> Vec<String> {
        self.lock().presence.clients()
    }

    // --- Admission ---

    /// Attach a socket and run the connection handshake in one serialized
    /// step: presence bump, GM claim, the three initial frames to the
    /// joiner (STATE_SYNC, HELLO, PRESENCE), and the join broadcasts.
    /// Returns whether this session holds GM.
    pub fn admit(
        &self,
        handle: SocketHandle,
        user_id: &str,
        gm_key: Option<&str>,
        owner_user_id: Option<&str>,
    ) -> bool {
        let mut schedule = false;
        let is_gm;
        {
            let mut inner = self.lock();
            let client_id = handle.client_id.clone();
            inner.presence.incr(&client_id);
            inner.sockets.insert(handle.id, handle.clone());

            // GM claim. The recorded owner always takes GM; otherwise the
            // legacy shared-key mode applies: the first connection to supply
            // a key sets it, later connections must match it.
            let mut claimed = false;
            if owner_user_id == Some(user_id) {
                inner.state.gm_id = Some(client_id.clone());
                inner.state.gm_user_id = Some(user_id.to_string());
                claimed = true;
            } else if let Some(key) = gm_key {
                let key_hash = crate::connection::hash_key(key);
                match inner.state.gm_key_hash.clone() {
                    None => {
                        inner.state.gm_key_hash = Some(key_hash);
                        inner.state.gm_id = Some(client_id.clone());
                        claimed = true;
                    }
                    Some(expected) if expected == key_hash => {
                        inner.state.gm_id = Some(client_id.clone());
                        claimed = true;
                    }
                    Some(_) => {}
                }
            }
            if claimed {
                mark_dirty(&mut inner);
            }
            is_gm = inner.state.gm_id.as_deref() == Some(client_id.as_str());

            // Initial frames to the joiner, in order.
            let sync = state_sync(&inner);
            let hello = WireEvent::new(
                EventType::Hello,
                json!({
                    "client_id": client_id,
                    "room_id": self.room_id,
                    "is_gm": is_gm,
                    "gm_key_set": inner.state.gm_key_hash.is_some(),
                    "username": client_id,
                }),
            );
            let presence = presence_event(&inner, &self.room_id);
            handle.send_event(&sync.encode());
            handle.send_event(&hello.encode());
            handle.send_event(&presence.encode());

            // Everyone else learns about the claim and the joiner.
            if claimed {
                let sync = state_sync(&inner);
                self.fanout(&mut inner, &sync);
            }
            let announce = WireEvent::new(
                EventType::Hello,
                json!({ "client_id": client_id, "room_id": self.room_id }),
            );
            self.fanout(&mut inner, &announce);
            let presence = presence_event(&inner, &self.room_id);
            self.fanout(&mut inner, &presence);

            if claimed {
                schedule = self.ensure_autosave(&mut inner);
            }
        }
        if schedule {
            self.schedule_autosave();
        }
        is_gm
    }

    /// Remove a socket, dropping its presence and telling the survivors.
    /// Returns true when the room just became socket-empty.
    pub fn detach_socket(&self, socket_id: SocketId) -> bool {
        let mut inner = self.lock();
        if let Some(handle) = inner.sockets.remove(&socket_id) {
            inner.presence.decr(&handle.client_id);
        }
        if inner.sockets.is_empty() {
            return true;
        }
        let presence = presence_event(&inner, &self.room_id);
        self.fanout(&mut inner, &presence);
        false
    }

    // --- Event processing ---

    /// Apply one inbound event from `socket_id` speaking as `client_id`.
    /// Exactly one reply is produced: the normalized accepted event goes to
    /// every socket, an ERROR (or a rejected TOKEN_MOVE echo) goes back to
    /// the sender only. Returns the emitted event.
    pub fn submit(&self, socket_id: SocketId, client_id: &str, event: WireEvent) -> WireEvent {
        let mut schedule = false;
        let emitted;
        {
            let mut inner = self.lock();
            let reply = match apply_event(&mut inner, client_id, &event) {
                Ok(reply) => reply,
                Err(error) => Reply::Sender(error),
            };
            match reply {
                Reply::Broadcast(ev) => {
                    self.fanout(&mut inner, &ev);
                    // Ownership and lock changes alter what clients may do,
                    // so they are followed by a fresh presence frame.
                    if matches!(
                        ev.event_type,
                        EventType::TokenCreate
                            | EventType::TokenDelete
                            | EventType::TokenAssign
                            | EventType::TokenSetLock
                    ) {
                        let presence = presence_event(&inner, &self.room_id);
                        self.fanout(&mut inner, &presence);
                    }
                    emitted = ev;
                }
                Reply::Sender(ev) => {
                    let delivered = inner
                        .sockets
                        .get(&socket_id)
                        .map(|handle| handle.send_event(&ev.encode()));
                    if delivered == Some(false) {
                        self.reap(&mut inner, vec![socket_id]);
                    }
                    emitted = ev;
                }
            }
            if inner.dirty {
                schedule = self.ensure_autosave(&mut inner);
            }
        }
        if schedule {
            self.schedule_autosave();
        }
        emitted
    }

    /// Queue an event to a single attached socket (sender-only replies that
    /// bypass event application, e.g. rate-limit errors).
    pub fn send_to(&self, socket_id: SocketId, event: &WireEvent) {
        let mut inner = self.lock();
        let delivered = inner
            .sockets
            .get(&socket_id)
            .map(|handle| handle.send_event(&event.encode()));
        if delivered == Some(false) {
            self.reap(&mut inner, vec![socket_id]);
        }
    }

    /// Serialize once and queue to every attached socket. Sockets whose
    /// writer is gone are reaped; this never fails upward.
    fn fanout(&self, inner: &mut RoomInner, event: &WireEvent) {
        let encoded = event.encode();
        let dead: Vec<SocketId> = inner
            .sockets
            .values()
            .filter(|s| !s.send_event(&encoded))
            .map(|s| s.id)
            .collect();
        if !dead.is_empty() {
            self.reap(inner, dead);
        }
    }

    /// Drop dead sockets and re-announce presence to the survivors,
    /// repeating if the announcement itself finds more corpses.
    fn reap(&self, inner: &mut RoomInner, mut dead: Vec<SocketId>) {
        while !dead.is_empty() {
            for id in dead.drain(..) {
                if let Some(handle) = inner.sockets.remove(&id) {
                    inner.presence.decr(&handle.client_id);
                }
            }
            if inner.sockets.is_empty() {
                return;
            }
            let encoded = presence_event(inner, &self.room_id).encode();
            dead = inner
                .sockets
                .values()
                .filter(|s| !s.send_event(&encoded))
                .map(|s| s.id)
                .collect();
        }
    }

    // --- Persistence ---

    /// Write the state blob to the store if dirty. On failure the room is
    /// left dirty so the next debounce pass retries.
    pub fn flush(&self) -> Result<(), StoreError> {
        let encoded = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            inner.state.encode()
        };
        if let Err(e) = self.store.save_room(&self.room_id, &encoded) {
            self.lock().dirty = true;
            return Err(e);
        }
        Ok(())
    }

    fn ensure_autosave(&self, inner: &mut RoomInner) -> bool {
        if inner.autosave_live {
            return false;
        }
        inner.autosave_live = true;
        true
    }

    fn schedule_autosave(&self) {
        if let Some(room) = self.weak.upgrade() {
            autosave::schedule(room);
        }
    }

    pub(crate) fn change_stamp(&self) -> Instant {
        self.lock().last_change
    }

    /// Called by the debounce task after a successful flush. Returns true
    /// if new changes raced in and the task should keep running.
    pub(crate) fn autosave_pass_done(&self) -> bool {
        let mut inner = self.lock();
        if inner.dirty {
            return true;
        }
        inner.autosave_live = false;
        false
    }
}

/// Mark the room changed: set the dirty bit, stamp the change time, and
/// bump the document version. Every accepted mutation funnels through here.
fn mark_dirty(inner: &mut RoomInner) {
    inner.dirty = true;
    inner.last_change = Instant::now();
    inner.state.version += 1;
}

fn push_history(inner: &mut RoomInner) {
    let snapshot = inner.state.encode();
    inner.journal.push(snapshot);
}

fn state_sync(inner: &RoomInner) -> WireEvent {
    WireEvent::new(EventType::StateSync, inner.state.client_view())
}

fn presence_event(inner: &RoomInner, room_id: &str) -> WireEvent {
    WireEvent::new(
        EventType::Presence,
        json!({
            "clients": inner.presence.clients(),
            "gm_id": inner.state.gm_id,
            "room_id": room_id,
        }),
    )
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Decode an inbound payload into its strict shape; unknown or malformed
/// fields become the validation ERROR sent back to the sender.
fn parse<T: DeserializeOwned>(event: &WireEvent) -> Result<T, WireEvent> {
    events::parse_payload(&event.payload).map_err(|_| {
        WireEvent::error(&format!("Invalid {} payload", event.event_type.as_str()))
    })
}

fn require_gm(inner: &RoomInner, client_id: &str, denied: &str) -> Result<(), WireEvent> {
    if permissions::is_gm(&inner.state, client_id) {
        Ok(())
    } else {
        Err(WireEvent::error(denied))
    }
}

/// The per-event contract. `Err` is always an ERROR event addressed to the
/// sender only; the event boundary never panics or raises.
fn apply_event(
    inner: &mut RoomInner,
    client_id: &str,
    event: &WireEvent,
) -> Result<Reply, WireEvent> {
    let ty = event.event_type;
    match ty {
        EventType::Heartbeat => Ok(Reply::Sender(WireEvent::new(
            EventType::Heartbeat,
            json!({ "ts": now_ts() }),
        ))),

        EventType::ReqStateSync => Ok(Reply::Sender(state_sync(inner))),

        EventType::Undo => {
            require_gm(inner, client_id, "Only GM can undo")?;
            let current = inner.state.encode();
            let previous = inner
                .journal
                .undo(current)
                .ok_or_else(|| WireEvent::error("Nothing to undo"))?;
            // Snapshots carry the version they were taken at; the live
            // counter must never rewind.
            let live = inner.state.version;
            inner.state = RoomState::decode(&previous)
                .map_err(|_| WireEvent::error("Corrupt undo snapshot"))?;
            inner.state.version = live;
            inner.state.normalize_order();
            mark_dirty(inner);
            Ok(Reply::Broadcast(state_sync(inner)))
        }

        EventType::Redo => {
            require_gm(inner, client_id, "Only GM can redo")?;
            let current = inner.state.encode();
            let next = inner
                .journal
                .redo(current)
                .ok_or_else(|| WireEvent::error("Nothing to redo"))?;
            let live = inner.state.version;
            inner.state = RoomState::decode(&next)
                .map_err(|_| WireEvent::error("Corrupt redo snapshot"))?;
            inner.state.version = live;
            inner.state.normalize_order();
            mark_dirty(inner);
            Ok(Reply::Broadcast(state_sync(inner)))
        }

        EventType::TokenCreate => {
            let p: events::TokenCreatePayload = parse(event)?;
            if p.id.is_empty() {
                return Err(WireEvent::error("Invalid token"));
            }
            push_history(inner);
            let token = Token {
                id: p.id.clone(),
                x: p.x,
                y: p.y,
                name: p.name.unwrap_or_else(|| "Token".to_string()),
                color: p.color.unwrap_or_else(|| "#ffffff".to_string()),
                image_url: None,
                size_scale: 1.0,
                owner_id: None,
                locked: p.locked,
                badges: Vec::new(),
            };
            let payload = serde_json::to_value(&token).expect("token serializes");
            inner.state.tokens.insert(p.id, token);
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(EventType::TokenCreate, payload)))
        }

        EventType::TokenMove => {
            let p: events::TokenMovePayload = parse(event)?;
            let Some(token) = inner.state.tokens.get(&p.id) else {
                return Err(WireEvent::error_for("Unknown token", &p.id));
            };
            if !permissions::can_move_token(&inner.state, client_id, token) {
                // Authoritative echo so the sender snaps back from its
                // optimistic move.
                return Ok(Reply::Sender(WireEvent::new(
                    EventType::TokenMove,
                    json!({
                        "id": p.id,
                        "x": token.x,
                        "y": token.y,
                        "rejected": true,
                        "reason": "Not allowed",
                    }),
                )));
            }
            // Drag streams are cheap: only explicit commits snapshot history.
            if p.commit {
                push_history(inner);
            }
            let token = inner.state.tokens.get_mut(&p.id).expect("checked above");
            if let Some(x) = p.x {
                token.x = x;
            }
            if let Some(y) = p.y {
                token.y = y;
            }
            let payload = json!({ "id": p.id, "x": token.x, "y": token.y, "commit": p.commit });
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(EventType::TokenMove, payload)))
        }

        EventType::TokenDelete => {
            let p: events::TokenIdPayload = parse(event)?;
            if !inner.state.tokens.contains_key(&p.id) {
                return Err(WireEvent::error_for("Unknown token", &p.id));
            }
            require_gm(inner, client_id, "Only GM can delete tokens")?;
            push_history(inner);
            inner.state.tokens.remove(&p.id);
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::TokenDelete,
                json!({ "id": p.id }),
            )))
        }

        EventType::TokenRename => {
            require_gm(inner, client_id, "Only GM can rename tokens")?;
            let p: events::TokenRenamePayload = parse(event)?;
            let name = p.name.trim().to_string();
            if name.is_empty() {
                return Err(WireEvent::error("Invalid token name"));
            }
            if !inner.state.tokens.contains_key(&p.id) {
                return Err(WireEvent::error_for("Unknown token", &p.id));
            }
            push_history(inner);
            let token = inner.state.tokens.get_mut(&p.id).expect("checked above");
            token.name = name.clone();
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::TokenRename,
                json!({ "id": p.id, "name": name }),
            )))
        }

        EventType::TokenSetSize => {
            require_gm(inner, client_id, "Only GM can resize tokens")?;
            let p: events::TokenSetSizePayload = parse(event)?;
            if !inner.state.tokens.contains_key(&p.id) {
                return Err(WireEvent::error_for("Unknown token", &p.id));
            }
            push_history(inner);
            let size = p.size_scale.clamp(0.25, 4.0);
            let token = inner.state.tokens.get_mut(&p.id).expect("checked above");
            token.size_scale = size;
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::TokenSetSize,
                json!({ "id": p.id, "size_scale": size }),
            )))
        }

        EventType::TokenAssign => {
            let p: events::TokenAssignPayload = parse(event)?;
            if !inner.state.tokens.contains_key(&p.id) {
                return Err(WireEvent::error_for("Unknown token", &p.id));
            }
            require_gm(inner, client_id, "Only GM can assign tokens")?;
            push_history(inner);
            let token = inner.state.tokens.get_mut(&p.id).expect("checked above");
            token.owner_id = p.owner_id.clone();
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::TokenAssign,
                json!({ "id": p.id, "owner_id": p.owner_id }),
            )))
        }

        EventType::TokenSetLock => {
            require_gm(inner, client_id, "Only GM can lock tokens")?;
            let p: events::SetLockPayload = parse(event)?;
            if !inner.state.tokens.contains_key(&p.id) {
                return Err(WireEvent::error_for("Unknown token", &p.id));
            }
            push_history(inner);
            let token = inner.state.tokens.get_mut(&p.id).expect("checked above");
            token.locked = p.locked;
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::TokenSetLock,
                json!({ "id": p.id, "locked": p.locked }),
            )))
        }

        EventType::TokenBadgeToggle => {
            require_gm(inner, client_id, "Only GM can edit token badges")?;
            let p: events::TokenBadgeTogglePayload = parse(event)?;
            let badge = p.badge.trim().to_string();
            if badge.is_empty() {
                return Err(WireEvent::error("Invalid badge"));
            }
            if !inner.state.tokens.contains_key(&p.id) {
                return Err(WireEvent::error_for("Unknown token", &p.id));
            }
            push_history(inner);
            let token = inner.state.tokens.get_mut(&p.id).expect("checked above");
            if let Some(pos) = token.badges.iter().position(|b| *b == badge) {
                token.badges.remove(pos);
            } else {
                token.badges.push(badge);
            }
            let badges = token.badges.clone();
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::TokenBadgeToggle,
                json!({ "id": p.id, "badges": badges }),
            )))
        }

        EventType::StrokeAdd => {
            let p: events::StrokeAddPayload = parse(event)?;
            if p.id.is_empty() || p.points.len() < 2 {
                return Err(WireEvent::error("Invalid stroke"));
            }
            let stroke = Stroke {
                id: p.id.clone(),
                points: p.points,
                color: p.color.unwrap_or_else(|| "#ffffff".to_string()),
                width: p.width.unwrap_or(3.0),
                locked: p.locked,
                layer: p.layer,
            };
            push_history(inner);
            let payload = serde_json::to_value(&stroke).expect("stroke serializes");
            // Re-adding an existing id replaces it and moves it to the top.
            inner.state.strokes.insert(p.id.clone(), stroke);
            inner.state.append_stroke_order(&p.id);
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(EventType::StrokeAdd, payload)))
        }

        EventType::StrokeDelete => {
            require_gm(inner, client_id, "Only GM can delete strokes")?;
            let p: events::StrokeDeletePayload = parse(event)?;
            let ids = p.ids.unwrap_or_else(|| p.id.into_iter().collect());
            let existing: Vec<String> = ids
                .into_iter()
                .filter(|id| inner.state.strokes.contains_key(id))
                .collect();
            if existing.is_empty() {
                return Ok(Reply::Broadcast(WireEvent::new(
                    EventType::StrokeDelete,
                    json!({ "ids": [] }),
                )));
            }
            push_history(inner);
            for id in &existing {
                inner.state.strokes.remove(id);
                inner.state.remove_stroke_order(id);
            }
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::StrokeDelete,
                json!({ "ids": existing }),
            )))
        }

        EventType::StrokeSetLock => {
            require_gm(inner, client_id, "Only GM can lock strokes")?;
            let p: events::SetLockPayload = parse(event)?;
            if !inner.state.strokes.contains_key(&p.id) {
                return Err(WireEvent::error_for("Unknown stroke", &p.id));
            }
            push_history(inner);
            let stroke = inner.state.strokes.get_mut(&p.id).expect("checked above");
            stroke.locked = p.locked;
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::StrokeSetLock,
                json!({ "id": p.id, "locked": p.locked }),
            )))
        }

        EventType::EraseAt => {
            require_gm(inner, client_id, "Only GM can erase")?;
            let p: events::EraseAtPayload = parse(event)?;
            let r = p.r.unwrap_or(ERASER_HIT_RADIUS_DEFAULT);

            let mut stroke_ids: Vec<String> = inner
                .state
                .strokes
                .iter()
                .filter(|(_, s)| !s.locked && erase::stroke_hits_circle(s, p.x, p.y, r))
                .map(|(id, _)| id.clone())
                .collect();
            stroke_ids.sort();

            let mut shape_ids: Vec<String> = if p.erase_shapes {
                inner
                    .state
                    .shapes
                    .iter()
                    .filter(|(_, s)| !s.locked && erase::shape_hits_circle(s, p.x, p.y, r))
                    .map(|(id, _)| id.clone())
                    .collect()
            } else {
                Vec::new()
            };
            shape_ids.sort();

            if stroke_ids.is_empty() && shape_ids.is_empty() {
                return Ok(Reply::Broadcast(WireEvent::new(
                    EventType::EraseAt,
                    json!({ "stroke_ids": [], "shape_ids": [] }),
                )));
            }
            push_history(inner);
            for id in &stroke_ids {
                inner.state.strokes.remove(id);
                inner.state.remove_stroke_order(id);
            }
            for id in &shape_ids {
                inner.state.shapes.remove(id);
                inner.state.remove_shape_order(id);
            }
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::EraseAt,
                json!({ "stroke_ids": stroke_ids, "shape_ids": shape_ids }),
            )))
        }

        EventType::ShapeAdd => {
            let p: events::ShapeAddPayload = parse(event)?;
            let kind =
                ShapeKind::parse(&p.kind).ok_or_else(|| WireEvent::error("Invalid shape type"))?;
            if p.id.is_empty() {
                return Err(WireEvent::error("Invalid shape"));
            }
            let shape = Shape {
                id: p.id.clone(),
                kind,
                x1: p.x1,
                y1: p.y1,
                x2: p.x2,
                y2: p.y2,
                color: p.color.unwrap_or_else(|| "#ffffff".to_string()),
                width: p.width.unwrap_or(3.0),
                fill: p.fill,
                locked: p.locked,
                layer: p.layer,
            };
            push_history(inner);
            let payload = serde_json::to_value(&shape).expect("shape serializes");
            inner.state.shapes.insert(p.id.clone(), shape);
            inner.state.append_shape_order(&p.id);
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(EventType::ShapeAdd, payload)))
        }

        EventType::ShapeDelete => {
            require_gm(inner, client_id, "Only GM can delete shapes")?;
            let p: events::TokenIdPayload = parse(event)?;
            if inner.state.shapes.contains_key(&p.id) {
                push_history(inner);
                inner.state.shapes.remove(&p.id);
                inner.state.remove_shape_order(&p.id);
                mark_dirty(inner);
            }
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::ShapeDelete,
                json!({ "id": p.id }),
            )))
        }

        EventType::ShapeSetLock => {
            require_gm(inner, client_id, "Only GM can lock shapes")?;
            let p: events::SetLockPayload = parse(event)?;
            if !inner.state.shapes.contains_key(&p.id) {
                return Err(WireEvent::error_for("Unknown shape", &p.id));
            }
            push_history(inner);
            let shape = inner.state.shapes.get_mut(&p.id).expect("checked above");
            shape.locked = p.locked;
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::ShapeSetLock,
                json!({ "id": p.id, "locked": p.locked }),
            )))
        }

        EventType::RoomSettings => {
            require_gm(inner, client_id, "Only GM can change room settings")?;
            let p: events::RoomSettingsPayload = parse(event)?;
            if let Some(url) = &p.background_url {
                if !(url.is_null() || url.is_string()) {
                    return Err(WireEvent::error("Invalid ROOM_SETTINGS payload"));
                }
            }
            push_history(inner);
            if let Some(v) = p.allow_players_move {
                inner.state.allow_players_move = v;
            }
            if let Some(v) = p.allow_all_move {
                inner.state.allow_all_move = v;
            }
            if let Some(v) = p.lockdown {
                inner.state.lockdown = v;
            }
            if let Some(url) = p.background_url {
                inner.state.background_url =
                    url.as_str().filter(|s| !s.is_empty()).map(String::from);
            }
            if let Some(visibility) = p.layer_visibility {
                // Only the known layer names can be toggled.
                for (layer, visible) in visibility {
                    if let Some(entry) = inner.state.layer_visibility.get_mut(&layer) {
                        *entry = visible;
                    }
                }
            }
            mark_dirty(inner);
            Ok(Reply::Broadcast(WireEvent::new(
                EventType::RoomSettings,
                json!({
                    "allow_players_move": inner.state.allow_players_move,
                    "allow_all_move": inner.state.allow_all_move,
                    "lockdown": inner.state.lockdown,
                    "background_url": inner.state.background_url,
                    "layer_visibility": inner.state.layer_visibility,
                }),
            )))
        }

        // Server-emitted types have no inbound handling.
        EventType::Hello | EventType::Presence | EventType::StateSync | EventType::Error => Err(
            WireEvent::error(&format!("Unhandled event type: {}", ty.as_str())),
        ),
    }
}

// --- Registry ---

/// Lazily materializes rooms from the store and owns the `room_id → Room`
/// map. The map lock is a short critical section, never held across store
/// or socket I/O.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    store: Arc<dyn Store>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        RoomRegistry {
            rooms: Mutex::new(HashMap::new()),
            store,
        }
    }

    fn rooms_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Find the live room, materializing it from the store on first use. A
    /// corrupt blob falls back to a blank room with the same id rather than
    /// refusing to serve.
    pub fn get_or_create(&self, room_id: &str) -> Result<Arc<Room>, StoreError> {
        if let Some(room) = self.rooms_lock().get(room_id) {
            return Ok(Arc::clone(room));
        }
        let raw = self.store.load_room(room_id)?;
        let mut state = match raw {
            Some(blob) => match RoomState::decode(&blob) {
                Ok(state) => state,
                Err(e) => {
                    warn!(room_id, error = %e, "corrupt room state, starting blank");
                    RoomState::blank(room_id)
                }
            },
            None => RoomState::blank(room_id),
        };
        state.normalize_order();
        let room = Room::new(room_id, state, Arc::clone(&self.store));
        let mut rooms = self.rooms_lock();
        Ok(Arc::clone(rooms.entry(room_id.to_string()).or_insert(room)))
    }

    /// Admit a socket into a room (creating/loading it on demand) and run
    /// the handshake. Returns the room and whether the session holds GM.
    pub fn attach(
        &self,
        room_id: &str,
        handle: SocketHandle,
        user_id: &str,
        gm_key: Option<&str>,
    ) -> Result<(Arc<Room>, bool), StoreError> {
        let room = self.get_or_create(room_id)?;
        let owner = self.store.get_room_owner(room_id)?;
        let is_gm = room.admit(handle, user_id, gm_key, owner.as_deref());
        Ok((room, is_gm))
    }

    /// Remove a socket; when the room just went socket-empty, flush dirty
    /// state synchronously and evict the room from memory.
    pub fn detach(&self, room_id: &str, socket_id: SocketId) {
        let room = self.rooms_lock().get(room_id).cloned();
        let Some(room) = room else {
            return;
        };
        if room.detach_socket(socket_id) {
            if let Err(e) = room.flush() {
                warn!(room_id, error = %e, "flush on disconnect failed");
            }
            let mut rooms = self.rooms_lock();
            // A socket may have attached while we flushed; keep the room then.
            if room.socket_count() == 0 {
                rooms.remove(room_id);
            }
        }
    }

    pub fn is_active(&self, room_id: &str) -> bool {
        self.rooms_lock()
            .get(room_id)
            .map(|room| room.socket_count() > 0)
            .unwrap_or(false)
    }

    pub fn drop_room(&self, room_id: &str) {
        self.rooms_lock().remove(room_id);
    }

    /// Flush every dirty live room. Run on process shutdown.
    pub fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms_lock().values().cloned().collect();
        for room in rooms {
            if let Err(e) = room.flush() {
                warn!(room_id = %room.room_id, error = %e, "flush on shutdown failed");
            }
        }
    }

    // --- Document operations (consumed by the external admin surface) ---

    /// Full room state as clients see it (no `gm_key_hash`).
    pub fn export_state(&self, room_id: &str) -> Result<serde_json::Value, RegistryError> {
        let room = self.get_or_create(room_id)?;
        let view = room.lock().state.client_view();
        Ok(view)
    }

    /// Replace a room's document wholesale. The room id, GM key hash, and
    /// version counter are preserved from the live room; the journal is
    /// cleared because its snapshots describe a document that no longer
    /// exists.
    pub fn import_state(
        &self,
        room_id: &str,
        value: serde_json::Value,
    ) -> Result<(), RegistryError> {
        let room = self.get_or_create(room_id)?;
        self.replace_state(&room, value)
    }

    /// Snapshot the room's current state under `label`; returns the id.
    pub fn create_snapshot(&self, room_id: &str, label: &str) -> Result<String, RegistryError> {
        let room = self.get_or_create(room_id)?;
        let encoded = room.lock().state.encode();
        let snapshot_id = self.store.create_snapshot(room_id, label, &encoded)?;
        Ok(snapshot_id)
    }

    /// Restore a snapshot into its room, auto-checkpointing the current
    /// state first. Returns the id of the auto checkpoint.
    pub fn restore_snapshot(
        &self,
        room_id: &str,
        snapshot_id: &str,
    ) -> Result<String, RegistryError> {
        let room = self.get_or_create(room_id)?;
        let Some((snapshot_room, raw)) = self.store.load_snapshot(snapshot_id)? else {
            return Err(RegistryError::SnapshotNotFound(snapshot_id.to_string()));
        };
        if snapshot_room != room_id {
            return Err(RegistryError::SnapshotNotFound(snapshot_id.to_string()));
        }
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| RegistryError::InvalidState(e.to_string()))?;

        let label = format!("Auto before restore {snapshot_id}");
        let current = room.lock().state.encode();
        let auto_id = self.store.create_snapshot(room_id, &label, &current)?;

        self.replace_state(&room, value)?;
        Ok(auto_id)
    }

    fn replace_state(&self, room: &Room, value: serde_json::Value) -> Result<(), RegistryError> {
        {
            let mut inner = room.lock();
            let mut imported: RoomState = serde_json::from_value(value)
                .map_err(|e| RegistryError::InvalidState(e.to_string()))?;
            imported.room_id = room.room_id.clone();
            imported.gm_key_hash = inner.state.gm_key_hash.clone();
            imported.version = inner.state.version;
            inner.state = imported;
            inner.state.normalize_order();
            inner.journal.clear();
            mark_dirty(&mut inner);
            let sync = state_sync(&inner);
            room.fanout(&mut inner, &sync);
        }
        room.flush()?;
        Ok(())
    }
}
