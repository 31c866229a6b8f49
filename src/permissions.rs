use crate::models::{RoomState, Token};

/// A client holds GM power iff its session identity matches the room's
/// current `gm_id`. Claimed during the connection handshake.
pub fn is_gm(state: &RoomState, client_id: &str) -> bool {
    state.gm_id.as_deref() == Some(client_id)
}

/// Whether `client_id` may move `token`:
/// GM always may. Otherwise lockdown and per-token locks block everyone,
/// `allow_all_move` opens every unlocked token ("party mode"), and
/// `allow_players_move` opens tokens assigned to the mover.
pub fn can_move_token(state: &RoomState, client_id: &str, token: &Token) -> bool {
    if is_gm(state, client_id) {
        return true;
    }
    if state.lockdown {
        return false;
    }
    if token.locked {
        return false;
    }
    if state.allow_all_move {
        return true;
    }
    if state.allow_players_move && token.owner_id.as_deref() == Some(client_id) {
        return true;
    }
    false
}
