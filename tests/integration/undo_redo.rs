use crate::common::{assert_same_document, find_event, owner_client, player_client, test_env};
use serde_json::json;
use tabletop_relay::events::EventType;

#[tokio::test]
async fn test_undo_redo_settings_change() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");

    gm.send(EventType::RoomSettings, json!({"lockdown": true}));
    assert!(gm.state().lockdown);

    let reply = gm.send(EventType::Undo, json!({}));
    assert_eq!(reply.event_type, EventType::StateSync);
    assert!(!gm.state().lockdown);

    let reply = gm.send(EventType::Redo, json!({}));
    assert_eq!(reply.event_type, EventType::StateSync);
    assert!(gm.state().lockdown);
}

#[tokio::test]
async fn test_undo_is_gm_only() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    let bob = player_client(&env, "r1", "bob");
    gm.send(EventType::RoomSettings, json!({"lockdown": true}));

    let reply = bob.send(EventType::Undo, json!({}));
    assert_eq!(reply.payload["message"], json!("Only GM can undo"));
    let reply = bob.send(EventType::Redo, json!({}));
    assert_eq!(reply.payload["message"], json!("Only GM can redo"));
    assert!(bob.state().lockdown);
}

#[tokio::test]
async fn test_undo_empty_journal_errors() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");

    let reply = gm.send(EventType::Undo, json!({}));
    assert_eq!(reply.payload["message"], json!("Nothing to undo"));
    let reply = gm.send(EventType::Redo, json!({}));
    assert_eq!(reply.payload["message"], json!("Nothing to redo"));
}

#[tokio::test]
async fn test_k_undos_restore_initial_k_redos_restore_final() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    let initial = gm.state();

    // A run of material mutations of different kinds.
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 1, "y": 1}));
    gm.send(
        EventType::StrokeAdd,
        json!({"id": "s1", "points": [{"x": 0, "y": 0}, {"x": 1, "y": 1}]}),
    );
    gm.send(
        EventType::ShapeAdd,
        json!({"id": "sh1", "type": "rect", "x1": 0, "y1": 0, "x2": 5, "y2": 5}),
    );
    gm.send(EventType::TokenMove, json!({"id": "t1", "x": 9, "y": 9, "commit": true}));
    gm.send(EventType::RoomSettings, json!({"allow_all_move": true}));
    let final_state = gm.state();
    let k = 5;
    assert_eq!(gm.room.journal_depth(), k);

    for _ in 0..k {
        let reply = gm.send(EventType::Undo, json!({}));
        assert_eq!(reply.event_type, EventType::StateSync);
    }
    assert_same_document(&initial, &gm.state());

    for _ in 0..k {
        let reply = gm.send(EventType::Redo, json!({}));
        assert_eq!(reply.event_type, EventType::StateSync);
    }
    assert_same_document(&final_state, &gm.state());
}

#[tokio::test]
async fn test_version_still_increases_across_undo() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));
    let before = gm.state().version;

    gm.send(EventType::Undo, json!({}));
    let after_undo = gm.state().version;
    assert!(after_undo > before, "undo must bump the version");

    gm.send(EventType::Redo, json!({}));
    assert!(gm.state().version > after_undo, "redo must bump the version");
}

#[tokio::test]
async fn test_new_mutation_clears_redo() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));
    gm.send(EventType::Undo, json!({}));
    assert_eq!(gm.room.redo_depth(), 1);

    // Diverging kills the old future.
    gm.send(EventType::TokenCreate, json!({"id": "t2", "x": 0, "y": 0}));
    assert_eq!(gm.room.redo_depth(), 0);
    let reply = gm.send(EventType::Redo, json!({}));
    assert_eq!(reply.payload["message"], json!("Nothing to redo"));
}

#[tokio::test]
async fn test_journal_capacity_bounded_at_50() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    for i in 0..60 {
        gm.send(
            EventType::TokenCreate,
            json!({"id": format!("t{i}"), "x": 0, "y": 0}),
        );
    }
    assert_eq!(gm.room.journal_depth(), 50);

    let mut undos = 0;
    loop {
        let reply = gm.send(EventType::Undo, json!({}));
        if reply.event_type == EventType::Error {
            break;
        }
        undos += 1;
    }
    assert_eq!(undos, 50);
    // Ten creations happened before the journal window; they survive.
    assert_eq!(gm.state().tokens.len(), 10);
}

#[tokio::test]
async fn test_undo_broadcasts_state_sync_to_everyone() {
    let env = test_env();
    let mut gm = owner_client(&env, "r1", "alice");
    let mut bob = player_client(&env, "r1", "bob");
    gm.send(EventType::TokenCreate, json!({"id": "t1", "x": 0, "y": 0}));
    gm.clear();
    bob.clear();

    gm.send(EventType::Undo, json!({}));

    for client in [&mut gm, &mut bob] {
        let events = client.drain();
        let sync = find_event(&events, EventType::StateSync).unwrap();
        assert_eq!(sync.payload["tokens"], json!({}));
    }
}

#[tokio::test]
async fn test_undo_restores_draw_order_consistently() {
    let env = test_env();
    let gm = owner_client(&env, "r1", "alice");
    gm.send(
        EventType::StrokeAdd,
        json!({"id": "s1", "points": [{"x": 0, "y": 0}, {"x": 1, "y": 1}]}),
    );
    gm.send(
        EventType::StrokeAdd,
        json!({"id": "s2", "points": [{"x": 2, "y": 2}, {"x": 3, "y": 3}]}),
    );
    gm.send(EventType::Undo, json!({}));

    let state = gm.state();
    assert_eq!(state.draw_order.strokes, vec!["s1".to_string()]);
    crate::common::assert_order_invariant(&state);
}
