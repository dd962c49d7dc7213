//! The per-page signal processor context
//!
//! A page processor owns the pipelines of one page and the telemetry slot
//! feeding a visualization consumer. It never writes state itself: it fetches
//! a snapshot from the state owner, listens to committed broadcasts and
//! reacts to element discovery events.

use crate::domain::audio::{AudioBackend, ElementId};
use crate::domain::config::Eq8Config;
use crate::domain::pipeline::PipelineManager;
use crate::domain::state::EffectState;
use crate::domain::store::{StateHandle, StoreError};
use crate::domain::telemetry::{SamplerEvent, Subscriber, TelemetrySampler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Input from the element discovery feed and the consumer side
#[derive(Debug)]
pub enum PageEvent {
    /// A media element appeared
    Discovered(ElementId),
    /// A media element is gone
    Removed(ElementId),
    /// Full scan result: exactly these elements are present
    Present(Vec<ElementId>),
    /// Playback started on an element
    Playing(ElementId),
    ConsumerConnected(Subscriber),
    ConsumerDisconnected,
}

pub struct PageProcessor<B: AudioBackend> {
    store: StateHandle,
    updates: broadcast::Receiver<Arc<EffectState>>,
    manager: PipelineManager<B>,
    sampler: TelemetrySampler,
    resume_retry: Duration,
}

impl<B: AudioBackend> PageProcessor<B> {
    /// Connect to the state owner and fetch the current state
    pub async fn start(store: StateHandle, backend: B, config: &Eq8Config) -> Result<Self, StoreError> {
        // Subscribe first so no commit between the fetch and the loop is lost
        let updates = store.subscribe();
        let state = store.get_state().await?;
        debug!(eq = state.eq_enabled, comp = state.compressor.enabled, "Page processor started");

        Ok(Self {
            store,
            updates,
            manager: PipelineManager::new(backend, state),
            sampler: TelemetrySampler::new(config.telemetry.interval()),
            resume_retry: config.pipeline.resume_retry(),
        })
    }

    pub fn manager(&self) -> &PipelineManager<B> {
        &self.manager
    }

    pub fn sampler(&self) -> &TelemetrySampler {
        &self.sampler
    }

    /// Process events until the feed closes, then hand the processor back
    pub async fn run(mut self, mut events: mpsc::Receiver<PageEvent>) -> Self {
        let mut resume_timer = interval(self.resume_retry);
        resume_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let suspended = self.manager.has_suspended();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                update = self.updates.recv() => match update {
                    Ok(state) => self.manager.apply_state(state),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "State updates lagged, re-fetching");
                        self.refresh().await;
                    }
                    Err(RecvError::Closed) => {
                        info!("State owner gone");
                        break;
                    }
                },
                event = self.sampler.next_event() => match event {
                    SamplerEvent::Tick => self.sample(),
                    SamplerEvent::Disconnected => self.sampler.disconnect(),
                },
                _ = resume_timer.tick(), if suspended => {
                    let resumed = self.manager.resume_suspended();
                    if resumed > 0 {
                        info!(resumed, "Suspended pipelines resumed");
                    }
                }
            }
        }

        self.sampler.disconnect();
        debug!(pipelines = self.manager.len(), "Page processor stopped");
        self
    }

    async fn handle_event(&mut self, event: PageEvent) {
        match event {
            PageEvent::Discovered(element) => {
                if let Err(e) = self.manager.discover(element.clone()) {
                    warn!(element = %element, error = %e, "Failed to build pipeline");
                }
            }
            PageEvent::Removed(element) => {
                self.manager.remove(&element);
            }
            PageEvent::Present(elements) => {
                let (added, removed) = self.manager.reconcile(&elements);
                debug!(added, removed, "Media elements reconciled");
            }
            PageEvent::Playing(element) => {
                self.refresh().await;
                if let Err(e) = self.manager.on_playing(&element) {
                    warn!(element = %element, error = %e, "Playback resync failed");
                }
            }
            PageEvent::ConsumerConnected(subscriber) => self.sampler.connect(subscriber),
            PageEvent::ConsumerDisconnected => self.sampler.disconnect(),
        }
    }

    /// Replace the local snapshot with the state owner's current one
    async fn refresh(&mut self) {
        match self.store.get_state().await {
            Ok(state) => self.manager.apply_state(state),
            Err(e) => warn!(error = %e, "Failed to fetch state"),
        }
    }

    fn sample(&mut self) {
        let state = Arc::clone(self.manager.state());
        let Some(pipeline) = self.manager.active_mut() else {
            trace!("No pipeline to sample");
            return;
        };
        let frame = TelemetrySampler::sample(pipeline, &state);
        self.sampler.emit(frame);
    }
}
