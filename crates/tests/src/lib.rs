//! Shared fixtures for the eq8comp integration tests

use eq8comp_core::domain::{
    EffectState, Eq8Config, MemoryStorage, PageEvent, PageProcessor, StateHandle, StateService,
};
use eq8comp_infra::audio::VirtualBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const WINDOW: Duration = Duration::from_millis(50);

/// A running state owner over in-memory storage
pub struct Owner {
    pub store: StateHandle,
    pub storage: Arc<MemoryStorage>,
    pub task: JoinHandle<()>,
}

pub fn spawn_owner(state: EffectState) -> Owner {
    let storage = Arc::new(MemoryStorage::new());
    let (store, task) = StateService::with_state(storage.clone(), state, WINDOW).spawn();
    Owner {
        store,
        storage,
        task,
    }
}

/// A running page processor on the virtual substrate
pub struct Page {
    pub events: mpsc::Sender<PageEvent>,
    pub task: JoinHandle<PageProcessor<VirtualBackend>>,
}

pub async fn spawn_page(store: StateHandle, backend: VirtualBackend) -> Page {
    let processor = PageProcessor::start(store, backend, &Eq8Config::default())
        .await
        .expect("state owner reachable");
    let (events, rx) = mpsc::channel(32);
    Page {
        events,
        task: tokio::spawn(processor.run(rx)),
    }
}

impl Page {
    pub async fn send(&self, event: PageEvent) {
        self.events.send(event).await.expect("page processor running");
    }

    /// Close the feed and wait for the processor to stop
    pub async fn stop(self) -> PageProcessor<VirtualBackend> {
        drop(self.events);
        self.task.await.expect("page processor panicked")
    }
}

/// Wait past one broadcast window
pub async fn settle() {
    tokio::time::sleep(WINDOW * 2).await;
}

/// Factory state with the three routing conditions set
pub fn state_with(eq_enabled: bool, bands: bool, comp_enabled: bool) -> EffectState {
    let mut state = EffectState::factory_default();
    state.eq_enabled = eq_enabled;
    state.compressor.enabled = comp_enabled;
    if !bands {
        for filter in state.filters.iter_mut() {
            filter.enabled = false;
        }
    }
    state
}
