//! Integration tests for the state replication protocol
//!
//! These tests drive the state owner through its wire interface, the way the
//! other contexts do, and check what gets persisted and broadcast.

use eq8comp_core::domain::store::load_state;
use eq8comp_core::domain::{
    Command, EffectState, FilterId, Reply, StateService, StateStorage, StoreConfig, StoreError,
    WireMessage, DEFAULT_PRESET_ID, STORAGE_KEY,
};
use eq8comp_infra::storage::JsonFileStorage;
use eq8comp_tests::{settle, spawn_owner, WINDOW};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

fn set_filter_json(id: u8, frequency: f64) -> String {
    format!(
        r#"{{"type":"SET_FILTER","filter":{{"id":{},"frequency":{},"gain":2.0,"q":1.0,"type":"peaking","enabled":true}}}}"#,
        id, frequency
    )
}

// ============================================================================
// RATE-LIMITED FAN-OUT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slider_drag_commits_once_with_final_value() {
    let owner = spawn_owner(EffectState::factory_default());
    let mut first = owner.store.subscribe();
    let mut second = owner.store.subscribe();

    let start = Instant::now();
    for step in 0..10 {
        owner
            .store
            .dispatch_json(&set_filter_json(5, 500.0 + step as f64 * 10.0))
            .await
            .unwrap();
        sleep(Duration::from_millis(4)).await;
    }

    let state = first.recv().await.unwrap();
    assert_eq!(Instant::now() - start, WINDOW);
    assert_eq!(state.filter(FilterId::new(5)).unwrap().frequency, 590.0);
    assert_eq!(second.recv().await.unwrap(), state);

    settle().await;
    assert!(first.try_recv().is_err());
    assert_eq!(owner.storage.writes(), 1);
    assert_eq!(owner.storage.stored_state().as_ref(), Some(state.as_ref()));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_listener_does_not_block_others() {
    let owner = spawn_owner(EffectState::factory_default());
    let dropped = owner.store.subscribe();
    let mut kept = owner.store.subscribe();
    drop(dropped);

    owner
        .store
        .send(Command::SetEqEnabled { enabled: false })
        .await
        .unwrap();

    let state = kept.recv().await.unwrap();
    assert!(!state.eq_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_input_is_dropped() {
    let owner = spawn_owner(EffectState::factory_default());
    let before = owner.store.get_state().await.unwrap();
    let unknown_band = set_filter_json(9, 100.0);
    let negative_frequency = set_filter_json(2, -5.0);

    for raw in [
        "garbage",
        r#"{"type":"SET_VOLUME","volume":3}"#,
        r#"{"type":"SET_PREAMP"}"#,
        unknown_band.as_str(),
        negative_frequency.as_str(),
    ] {
        let err = owner.store.dispatch_json(raw).await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedCommand(_)), "{}", raw);
    }

    settle().await;
    assert_eq!(owner.store.get_state().await.unwrap(), before);
    assert_eq!(owner.storage.writes(), 0);
}

// ============================================================================
// PRESETS OVER THE WIRE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_preset_round_trip_through_wire() {
    let owner = spawn_owner(EffectState::factory_default());

    owner.store.dispatch_json(&set_filter_json(2, 321.0)).await.unwrap();
    owner
        .store
        .dispatch_json(r#"{"type":"SET_PREAMP","preampGain":-3.5}"#)
        .await
        .unwrap();
    let saved_state = owner.store.get_state().await.unwrap();

    let preset = saved_state.capture_preset("Late night", "moon");
    let save = serde_json::json!({ "type": "SAVE_PRESET", "preset": preset });
    let id = match owner.store.dispatch_json(&save.to_string()).await.unwrap() {
        Reply::PresetSaved { id } => id,
        other => panic!("unexpected reply {:?}", other),
    };
    assert_ne!(id, DEFAULT_PRESET_ID);

    owner
        .store
        .dispatch_json(r#"{"type":"RESET_FILTERS"}"#)
        .await
        .unwrap();
    owner
        .store
        .send(Command::LoadPreset { id: id.clone() })
        .await
        .unwrap();

    let loaded = owner.store.get_state().await.unwrap();
    assert_eq!(loaded.filters, saved_state.filters);
    assert_eq!(loaded.compressor, saved_state.compressor);
    assert_eq!(loaded.preamp_gain, saved_state.preamp_gain);
    assert!(loaded.presets.contains_key(&id));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_preset_leaves_state_untouched() {
    let owner = spawn_owner(EffectState::factory_default());
    owner
        .store
        .send(Command::SetCompEnabled { enabled: false })
        .await
        .unwrap();
    let before = owner.store.get_state().await.unwrap();

    let err = owner
        .store
        .send(Command::LoadPreset {
            id: "missing".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    let after = owner.store.get_state().await.unwrap();
    assert_eq!(
        serde_json::to_vec(&*after).unwrap(),
        serde_json::to_vec(&*before).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_get_state_reply_wire_shape() {
    let owner = spawn_owner(EffectState::factory_default());
    let reply = owner
        .store
        .dispatch_json(r#"{"type":"GET_STATE"}"#)
        .await
        .unwrap();

    let json: serde_json::Value = serde_json::from_str(&reply.into_wire().to_json()).unwrap();
    assert_eq!(json["type"], "SET_STATE");
    assert_eq!(json["state"]["preampGain"], 0.0);
    assert_eq!(json["state"]["compressor"]["ratio"], 8.0);
    assert_eq!(json["state"]["presets"][DEFAULT_PRESET_ID]["locked"], true);

    let decoded: WireMessage = serde_json::from_value(json).unwrap();
    assert!(matches!(decoded, WireMessage::SetState { .. }));
}

// ============================================================================
// PERSISTENCE ON DISK
// ============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let config = StoreConfig::default();

    let storage = Arc::new(JsonFileStorage::new(&path));
    let (store, task) = StateService::open(storage, &config).await.unwrap().spawn();
    store
        .send(Command::SetEqEnabled { enabled: false })
        .await
        .unwrap();
    store
        .send(Command::SetPreamp { preamp_gain: 4.0 })
        .await
        .unwrap();
    let expected = store.get_state().await.unwrap();

    // Shutdown flushes the pending write
    drop(store);
    task.await.unwrap();

    let reopened = JsonFileStorage::new(&path);
    let state = load_state(&reopened, &config).await.unwrap();
    assert_eq!(state, *expected);
}

#[tokio::test]
async fn test_partial_record_is_completed_with_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let storage = JsonFileStorage::new(&path);
    storage
        .set(STORAGE_KEY, serde_json::json!({ "eqEnabled": false, "preampGain": -2.0 }))
        .await
        .unwrap();

    let state = load_state(&storage, &StoreConfig::default()).await.unwrap();
    let defaults = EffectState::factory_default();

    assert!(!state.eq_enabled);
    assert_eq!(state.preamp_gain, -2.0);
    assert_eq!(state.filters, defaults.filters);
    assert_eq!(state.compressor, defaults.compressor);
    assert!(state.presets.contains_key(DEFAULT_PRESET_ID));
}
