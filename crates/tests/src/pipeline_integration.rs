//! Integration tests for pipelines driven by replicated state
//!
//! A state owner and a page processor run on their own tasks, connected only
//! by the command channel and the state broadcast. The virtual substrate's
//! probe shows what the live graphs look like after each update.

use eq8comp_core::domain::routing::plan;
use eq8comp_core::domain::{
    Command, ContextState, EffectState, ElementId, FilterId, NodeKind, PageEvent, StoreError,
    Subscriber,
};
use eq8comp_infra::audio::{GraphProbe, VirtualBackend};
use eq8comp_tests::{settle, spawn_owner, spawn_page, state_with};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;

const FFT_SIZE: usize = 2048;

fn element(name: &str) -> ElementId {
    ElementId::new(name)
}

fn assert_graph_matches(probe: &GraphProbe, element: &ElementId, state: &EffectState) {
    let graph = probe.graph(element).expect("graph exists");
    let expected = plan(state);

    assert_eq!(graph.edges.len(), expected.len(), "edge count for {}", element);
    assert_eq!(
        graph.edges.iter().collect::<HashSet<_>>(),
        expected.iter().collect::<HashSet<_>>(),
        "edges for {}",
        element
    );
    assert_eq!(graph.duplicate_connects, 0);
}

// ============================================================================
// TOPOLOGY FOLLOWS STATE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_every_topology_through_commands() {
    let owner = spawn_owner(EffectState::factory_default());
    let backend = VirtualBackend::new(FFT_SIZE);
    let probe = backend.probe();
    let page = spawn_page(owner.store.clone(), backend).await;

    page.send(PageEvent::Present(vec![element("a"), element("b")]))
        .await;
    settle().await;

    let cases = [
        (true, true, true),
        (true, true, false),
        (true, false, true),
        (true, false, false),
        (false, true, true),
        (false, false, false),
        (true, true, true),
    ];

    for (eq, bands, comp) in cases {
        let target = state_with(eq, bands, comp);
        owner
            .store
            .send(Command::SetEqEnabled { enabled: eq })
            .await
            .unwrap();
        owner
            .store
            .send(Command::SetCompEnabled { enabled: comp })
            .await
            .unwrap();
        for filter in target.filters {
            owner
                .store
                .send(Command::SetFilter { filter })
                .await
                .unwrap();
        }
        settle().await;

        let state = owner.store.get_state().await.unwrap();
        assert_eq!(state.filters, target.filters);
        for name in ["a", "b"] {
            assert_graph_matches(&probe, &element(name), &state);
        }
    }

    page.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_element_uses_current_state() {
    let owner = spawn_owner(state_with(false, true, true));
    let backend = VirtualBackend::new(FFT_SIZE);
    let probe = backend.probe();
    let page = spawn_page(owner.store.clone(), backend).await;

    owner
        .store
        .send(Command::SetPreamp { preamp_gain: -20.0 })
        .await
        .unwrap();
    settle().await;

    page.send(PageEvent::Discovered(element("late"))).await;
    settle().await;

    let state = owner.store.get_state().await.unwrap();
    assert_graph_matches(&probe, &element("late"), &state);

    let graph = probe.graph(&element("late")).unwrap();
    assert!((graph.preamp - 0.1).abs() < 1e-9);
    assert!(!graph.path().contains(&NodeKind::Preamp));
    assert_eq!(graph.biquads.len(), 8);

    page.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_element_releases_its_context() {
    let owner = spawn_owner(EffectState::factory_default());
    let backend = VirtualBackend::new(FFT_SIZE);
    let probe = backend.probe();
    let page = spawn_page(owner.store.clone(), backend).await;

    page.send(PageEvent::Present(vec![element("a"), element("b"), element("c")]))
        .await;
    page.send(PageEvent::Present(vec![element("c")])).await;
    settle().await;

    let open: Vec<ElementId> = probe.open().into_iter().map(|g| g.element).collect();
    assert_eq!(open, vec![element("c")]);

    let closed = probe.graph(&element("a")).unwrap();
    assert_eq!(closed.state, ContextState::Closed);
    assert!(closed.edges.is_empty());

    let processor = page.stop().await;
    assert_eq!(processor.manager().len(), 1);
    drop(processor);
    assert!(probe.open().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_postamp_follows_compressor_gain() {
    let owner = spawn_owner(EffectState::factory_default());
    let backend = VirtualBackend::new(FFT_SIZE);
    let probe = backend.probe();
    let page = spawn_page(owner.store.clone(), backend).await;
    page.send(PageEvent::Discovered(element("a"))).await;

    let mut compressor = owner.store.get_state().await.unwrap().compressor;
    compressor.gain = 6.0;
    compressor.threshold = -30.0;
    owner
        .store
        .send(Command::SetCompressor { compressor })
        .await
        .unwrap();
    settle().await;

    let graph = probe.graph(&element("a")).unwrap();
    assert!((graph.postamp - 1.9953).abs() < 1e-3);
    assert_eq!(graph.dynamics.unwrap().threshold, -30.0);

    page.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_preset_with_foreign_band_never_reaches_pipelines() {
    let owner = spawn_owner(EffectState::factory_default());
    let backend = VirtualBackend::new(FFT_SIZE);
    let probe = backend.probe();
    let page = spawn_page(owner.store.clone(), backend).await;
    page.send(PageEvent::Discovered(element("a"))).await;
    settle().await;

    let mut preset = owner.store.get_state().await.unwrap().capture_preset("Odd", "x");
    preset.filters[2].id = FilterId::new(9);
    let save = serde_json::json!({ "type": "SAVE_PRESET", "id": "odd", "preset": preset });
    let err = owner
        .store
        .dispatch_json(&save.to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MalformedCommand(_)));

    let err = owner
        .store
        .send(Command::LoadPreset { id: "odd".to_string() })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    settle().await;

    let state = owner.store.get_state().await.unwrap();
    assert_graph_matches(&probe, &element("a"), &state);
    let path = probe.graph(&element("a")).unwrap().path();
    assert_eq!(path.last(), Some(&NodeKind::Destination));

    page.stop().await;
}

// ============================================================================
// SUSPENDED CONTEXTS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_suspended_context_recovers() {
    let owner = spawn_owner(EffectState::factory_default());
    let backend = VirtualBackend::new(FFT_SIZE).suspended(3);
    let probe = backend.probe();
    let page = spawn_page(owner.store.clone(), backend).await;

    page.send(PageEvent::Discovered(element("a"))).await;
    settle().await;
    assert_eq!(probe.graph(&element("a")).unwrap().state, ContextState::Suspended);

    sleep(Duration::from_secs(5)).await;

    let graph = probe.graph(&element("a")).unwrap();
    assert_eq!(graph.state, ContextState::Running);
    assert_eq!(graph.resume_attempts, 4);
    let state = owner.store.get_state().await.unwrap();
    assert_graph_matches(&probe, &element("a"), &state);

    page.stop().await;
}

// ============================================================================
// TELEMETRY
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_telemetry_reports_reduction_only_with_compressor() {
    let owner = spawn_owner(EffectState::factory_default());
    let page = spawn_page(owner.store.clone(), VirtualBackend::new(FFT_SIZE)).await;
    page.send(PageEvent::Discovered(element("a"))).await;

    let (subscriber, mut frames) = Subscriber::channel(4);
    page.send(PageEvent::ConsumerConnected(subscriber)).await;

    let frame = frames.recv().await.unwrap();
    assert!(frame.gain_reduction < -1.0, "reduction {}", frame.gain_reduction);
    assert_eq!(frame.time_domain_data.len(), FFT_SIZE / 2);
    assert_eq!(frame.frequency_data.len(), FFT_SIZE / 2);

    owner
        .store
        .send(Command::SetCompEnabled { enabled: false })
        .await
        .unwrap();
    settle().await;

    // Drain frames sampled before the broadcast arrived
    while frames.try_recv().is_ok() {}
    let frame = frames.recv().await.unwrap();
    assert_eq!(frame.gain_reduction, 0.0);

    page.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_samples_first_discovered_element() {
    let owner = spawn_owner(EffectState::factory_default());
    let backend = VirtualBackend::new(FFT_SIZE);
    let probe = backend.probe();
    let page = spawn_page(owner.store.clone(), backend).await;

    page.send(PageEvent::Discovered(element("first"))).await;
    page.send(PageEvent::Discovered(element("second"))).await;

    let (subscriber, mut frames) = Subscriber::channel(4);
    page.send(PageEvent::ConsumerConnected(subscriber)).await;
    assert!(frames.recv().await.is_some());

    // Taking the first element away moves sampling to the next one
    page.send(PageEvent::Removed(element("first"))).await;
    settle().await;
    while frames.try_recv().is_ok() {}
    assert!(frames.recv().await.is_some());
    assert_eq!(probe.open().len(), 1);

    page.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replaces_consumer() {
    let owner = spawn_owner(EffectState::factory_default());
    let page = spawn_page(owner.store.clone(), VirtualBackend::new(FFT_SIZE)).await;
    page.send(PageEvent::Discovered(element("a"))).await;

    let (first, mut first_frames) = Subscriber::channel(4);
    page.send(PageEvent::ConsumerConnected(first)).await;
    assert!(first_frames.recv().await.is_some());

    let (second, mut second_frames) = Subscriber::channel(4);
    page.send(PageEvent::ConsumerConnected(second)).await;
    assert!(second_frames.recv().await.is_some());

    // The first consumer's stream ends once its buffered frames are read
    while first_frames.recv().await.is_some() {}

    page.send(PageEvent::ConsumerDisconnected).await;
    settle().await;
    while second_frames.try_recv().is_ok() {}
    assert!(second_frames.recv().await.is_none());

    let processor = page.stop().await;
    assert!(!processor.sampler().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_no_frames_without_pipelines() {
    let owner = spawn_owner(EffectState::factory_default());
    let page = spawn_page(owner.store.clone(), VirtualBackend::new(FFT_SIZE)).await;

    let (subscriber, mut frames) = Subscriber::channel(4);
    page.send(PageEvent::ConsumerConnected(subscriber)).await;

    let waited = tokio::time::timeout(Duration::from_millis(200), frames.recv()).await;
    assert!(waited.is_err());

    let processor = page.stop().await;
    assert_eq!(processor.sampler().frames_sent(), 0);
}
