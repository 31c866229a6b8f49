use crate::common::{find_event, owner_client, player_client, test_env};
use serde_json::json;
use tabletop_relay::events::EventType;

// --- Create / move / commit ---

#[tokio::test]
async fn test_create_move_commit_journal_and_version() {
    let env = test_env();
    let mut gm = owner_client(&env, "r1", "alice");
    gm.clear();
    let base_version = gm.state().version;

    let reply = gm.send(
        EventType::TokenCreate,
        json!({"id": "t1", "x": 0, "y": 0, "name": "T"}),
    );
    assert_eq!(reply.event_type, EventType::TokenCreate);

    // A drag stream: ten uncommitted moves, then the commit.
    for i in 1..=10 {
        let reply = gm.send(
            EventType::TokenMove,
            json!({"id": "t1", "x": i, "y": i, "commit": false}),
        );
        assert_eq!(reply.event_type, EventType::TokenMove);
    }
    gm.send(
        EventType::TokenMove,
        json!({"id": "t1", "x": 10, "y": 10, "commit": true}),
    );

    // Only the create and the commit snapshot history.
    assert_eq!(gm.room.journal_depth(), 2);
    let state = gm.state();
    let token = &state.tokens["t1"];
    assert_eq!((token.x, token.y), (10.0, 10.0));
    assert_eq!(state.version, base_version + 12);
}

#[tokio::test]
async fn test_create_broadcasts_normalized_token() {
    let env = test_env();
    let mut gm = owner_client(&env, "r1", "alice");
    let mut player = player_client(&env, "r1", "bob");
    gm.clear();
    player.clear();

    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 3, "y": 4}));

    let events = player.drain();
    let created = find_event(&events, EventType::TokenCreate).unwrap();
    assert_eq!(created.payload["id"], json!("t1"));
    assert_eq!(created.payload["name"], json!("Token"));
    assert_eq!(created.payload["color"], json!("#ffffff"));
    assert_eq!(created.payload["size_scale"], json!(1.0));
    assert_eq!(created.payload["owner_id"], json!(null));
}

#[tokio::test]
async fn test_move_unknown_token_errors() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");

    let reply = gm.send(EventType::TokenMove, json!({"id": "ghost", "x": 1, "y": 1}));
    assert_eq!(reply.event_type, EventType::Error);
    assert_eq!(reply.payload["message"], json!("Unknown token"));
    assert_eq!(reply.payload["id"], json!("ghost"));
}

// --- Move authority ---

#[tokio::test]
async fn test_player_move_rejected_with_authoritative_echo() {
    let env = test_env();
    let mut gm = owner_client(&env, "r1", "alice");
    let mut bob = player_client(&env, "r1", "bob");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 5, "y": 7}));
    gm.clear();
    bob.clear();
    let version_before = bob.state().version;

    let reply = bob.send(EventType::TokenMove, json!({"id": "t1", "x": 99, "y": 99}));

    // The sender snaps back to the server's coordinates.
    assert_eq!(reply.event_type, EventType::TokenMove);
    assert_eq!(reply.payload["rejected"], json!(true));
    assert_eq!(reply.payload["x"], json!(5.0));
    assert_eq!(reply.payload["y"], json!(7.0));

    // Sender-only: the GM sees nothing, the state did not move.
    assert!(find_event(&gm.drain(), EventType::TokenMove).is_none());
    let state = bob.state();
    assert_eq!((state.tokens["t1"].x, state.tokens["t1"].y), (5.0, 7.0));
    assert_eq!(state.version, version_before);

    // The echo reached the sender's socket.
    let events = bob.drain();
    let echo = find_event(&events, EventType::TokenMove).unwrap();
    assert_eq!(echo.payload["rejected"], json!(true));
}

#[tokio::test]
async fn test_assigned_owner_may_move_when_enabled() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    let bob = player_client(&env, "r1", "bob");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));
    gm.send(EventType::TokenAssign, json!({"id": "t1", "owner_id": "bob"}));
    gm.send(EventType::RoomSettings, json!({"allow_players_move": true}));

    let reply = bob.send(EventType::TokenMove, json!({"id": "t1", "x": 2, "y": 2}));
    assert_eq!(reply.event_type, EventType::TokenMove);
    assert!(reply.payload.get("rejected").is_none());
    assert_eq!(bob.state().tokens["t1"].x, 2.0);
}

#[tokio::test]
async fn test_unassigned_player_blocked_even_when_enabled() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    let bob = player_client(&env, "r1", "bob");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));
    gm.send(EventType::RoomSettings, json!({"allow_players_move": true}));

    let reply = bob.send(EventType::TokenMove, json!({"id": "t1", "x": 2, "y": 2}));
    assert_eq!(reply.payload["rejected"], json!(true));
}

#[tokio::test]
async fn test_party_mode_opens_unlocked_tokens() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    let bob = player_client(&env, "r1", "bob");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));
    gm.send(
        EventType::TokenCreate,
        json!({"id": "t2", "x": 0, "y": 0, "locked": true}),
    );
    gm.send(EventType::RoomSettings, json!({"allow_all_move": true}));

    let ok = bob.send(EventType::TokenMove, json!({"id": "t1", "x": 1, "y": 1}));
    assert!(ok.payload.get("rejected").is_none());

    // Locked tokens stay locked even in party mode.
    let blocked = bob.send(EventType::TokenMove, json!({"id": "t2", "x": 1, "y": 1}));
    assert_eq!(blocked.payload["rejected"], json!(true));
}

#[tokio::test]
async fn test_lockdown_blocks_player_moves_but_not_gm() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    let bob = player_client(&env, "r1", "bob");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));
    gm.send(EventType::TokenAssign, json!({"id": "t1", "owner_id": "bob"}));
    gm.send(
        EventType::RoomSettings,
        json!({"allow_players_move": true, "lockdown": true}),
    );

    let blocked = bob.send(EventType::TokenMove, json!({"id": "t1", "x": 1, "y": 1}));
    assert_eq!(blocked.payload["rejected"], json!(true));

    let ok = gm.send(EventType::TokenMove, json!({"id": "t1", "x": 1, "y": 1}));
    assert!(ok.payload.get("rejected").is_none());
}

// --- GM-only token mutations ---

#[tokio::test]
async fn test_player_cannot_delete_or_assign_or_lock() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    let bob = player_client(&env, "r1", "bob");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));

    let reply = bob.send(EventType::TokenDelete, json!({"id": "t1"}));
    assert_eq!(reply.payload["message"], json!("Only GM can delete tokens"));
    let reply = bob.send(EventType::TokenAssign, json!({"id": "t1", "owner_id": "bob"}));
    assert_eq!(reply.payload["message"], json!("Only GM can assign tokens"));
    let reply = bob.send(EventType::TokenSetLock, json!({"id": "t1", "locked": true}));
    assert_eq!(reply.payload["message"], json!("Only GM can lock tokens"));

    let state = bob.state();
    assert!(state.tokens.contains_key("t1"));
    assert!(state.tokens["t1"].owner_id.is_none());
    assert!(!state.tokens["t1"].locked);
}

#[tokio::test]
async fn test_gm_delete_token() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));

    let reply = gm.send(EventType::TokenDelete, json!({"id": "t1"}));
    assert_eq!(reply.event_type, EventType::TokenDelete);
    assert!(gm.state().tokens.is_empty());

    // Deleting again is an unknown-token error.
    let reply = gm.send(EventType::TokenDelete, json!({"id": "t1"}));
    assert_eq!(reply.payload["message"], json!("Unknown token"));
}

#[tokio::test]
async fn test_token_rename_and_resize() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));

    let reply = gm.send(EventType::TokenRename, json!({"id": "t1", "name": "Ogre"}));
    assert_eq!(reply.payload["name"], json!("Ogre"));
    assert_eq!(gm.state().tokens["t1"].name, "Ogre");

    let reply = gm.send(EventType::TokenRename, json!({"id": "t1", "name": "   "}));
    assert_eq!(reply.payload["message"], json!("Invalid token name"));

    // Size is clamped to a sane range.
    let reply = gm.send(EventType::TokenSetSize, json!({"id": "t1", "size_scale": 100.0}));
    assert_eq!(reply.payload["size_scale"], json!(4.0));
    let reply = gm.send(EventType::TokenSetSize, json!({"id": "t1", "size_scale": 0.01}));
    assert_eq!(reply.payload["size_scale"], json!(0.25));
}

#[tokio::test]
async fn test_token_badge_toggle() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));

    let reply = gm.send(EventType::TokenBadgeToggle, json!({"id": "t1", "badge": "poisoned"}));
    assert_eq!(reply.payload["badges"], json!(["poisoned"]));
    let reply = gm.send(EventType::TokenBadgeToggle, json!({"id": "t1", "badge": "stunned"}));
    assert_eq!(reply.payload["badges"], json!(["poisoned", "stunned"]));

    // Toggling an existing badge removes it, preserving order.
    let reply = gm.send(EventType::TokenBadgeToggle, json!({"id": "t1", "badge": "poisoned"}));
    assert_eq!(reply.payload["badges"], json!(["stunned"]));
}

#[tokio::test]
async fn test_token_create_same_id_replaces() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0, "name": "Old"}));
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 9, "y": 9, "name": "New"}));

    let state = gm.state();
    assert_eq!(state.tokens.len(), 1);
    assert_eq!(state.tokens["t1"].name, "New");
    assert_eq!(state.tokens["t1"].x, 9.0);
}
