//! Per-element pipelines and their lifecycle
//!
//! A `Pipeline` wraps one processing context bound to one media element. Its
//! node set is fixed at creation; every state update rewrites node parameters
//! and then performs a full teardown followed by a rebuild from the routing
//! plan, so the live edge set is always exactly what the policy predicts.

use crate::domain::audio::{
    db_to_gain, AudioBackend, AudioContext, BiquadParams, ContextState, DynamicsParams, Edge,
    ElementId, GainStage, NodeKind, PipelineError, Result,
};
use crate::domain::routing::RoutingInput;
use crate::domain::state::{EffectState, FilterId};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// One media element's processing graph
#[derive(Debug)]
pub struct Pipeline<C> {
    element: ElementId,
    context: C,
    filter_ids: Vec<FilterId>,
    /// Edges established by the last rebuild
    edges: Vec<Edge>,
    rebuilds: u64,
}

impl<C: AudioContext> Pipeline<C> {
    fn new(element: ElementId, context: C, filter_ids: Vec<FilterId>) -> Self {
        Self {
            element,
            context,
            filter_ids,
            edges: Vec::new(),
            rebuilds: 0,
        }
    }

    pub fn element(&self) -> &ElementId {
        &self.element
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn is_suspended(&self) -> bool {
        self.context.state() == ContextState::Suspended
    }

    /// Make every node parameter equal to `state`
    fn write_params(&mut self, state: &EffectState) {
        for id in &self.filter_ids {
            if let Some(filter) = state.filter(*id) {
                self.context.set_biquad(*id, &BiquadParams::from(filter));
            }
        }
        self.context
            .set_gain(GainStage::Preamp, db_to_gain(state.preamp_gain));
        self.context
            .set_dynamics(&DynamicsParams::from(&state.compressor));
        self.context
            .set_gain(GainStage::Postamp, db_to_gain(state.compressor.gain));
    }

    /// Drop every connection owned by any node of this pipeline
    fn teardown(&mut self) {
        for node in NodeKind::outputs(&self.filter_ids) {
            self.context.disconnect(node);
        }
        self.edges.clear();
    }

    /// Full teardown, then connect exactly the planned edges
    ///
    /// A plan naming a band this pipeline has no node for, or naming one band
    /// twice, is refused before anything is torn down. If the substrate refuses
    /// a connection part way, the pipeline is rewired as a bypass so the element
    /// still reaches the destination.
    fn rebuild(&mut self, state: &EffectState) -> Result<()> {
        let input = RoutingInput::new(state, true);
        self.check_chain(&input.chain)?;
        let plan = input.edges();

        self.teardown();
        if let Err(e) = self.connect_all(&plan) {
            warn!(element = %self.element, error = %e, "Rebuild failed, falling back to bypass");
            self.teardown();
            if let Err(bypass_err) = self.connect_all(&RoutingInput::bypass().edges()) {
                error!(element = %self.element, error = %bypass_err, "Bypass wiring failed");
            }
            return Err(e);
        }
        self.rebuilds += 1;

        debug!(
            element = %self.element,
            topology = ?input.topology(),
            edges = plan.len(),
            "Pipeline rebuilt"
        );
        Ok(())
    }

    fn check_chain(&self, chain: &[FilterId]) -> Result<()> {
        for (index, id) in chain.iter().enumerate() {
            if !self.filter_ids.contains(id) {
                return Err(PipelineError::Context(format!("no node for filter {}", id)));
            }
            if chain[..index].contains(id) {
                return Err(PipelineError::Context(format!("filter {} wired twice", id)));
            }
        }
        Ok(())
    }

    fn connect_all(&mut self, edges: &[Edge]) -> Result<()> {
        for edge in edges {
            self.context.connect(*edge)?;
            self.edges.push(*edge);
        }
        Ok(())
    }

    fn update(&mut self, state: &EffectState) -> Result<()> {
        self.write_params(state);
        self.rebuild(state)
    }

    /// Try to start a suspended context; rebuilds when it comes up
    fn try_resume(&mut self, state: &EffectState) -> Result<bool> {
        if !self.is_suspended() {
            return Ok(false);
        }

        match self.context.resume()? {
            ContextState::Running => {
                info!(element = %self.element, "Audio context resumed");
                self.update(state)?;
                Ok(true)
            }
            other => {
                debug!(element = %self.element, state = ?other, "Audio context still not running");
                Ok(false)
            }
        }
    }

    fn close(&mut self) {
        self.teardown();
        self.context.close();
    }
}

/// Owns the 1:1 mapping between present media elements and pipelines
pub struct PipelineManager<B: AudioBackend> {
    backend: B,
    state: Arc<EffectState>,
    /// In discovery order
    pipelines: Vec<Pipeline<B::Context>>,
}

impl<B: AudioBackend> PipelineManager<B> {
    pub fn new(backend: B, state: Arc<EffectState>) -> Self {
        Self {
            backend,
            state,
            pipelines: Vec::new(),
        }
    }

    pub fn state(&self) -> &Arc<EffectState> {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn pipelines(&self) -> &[Pipeline<B::Context>] {
        &self.pipelines
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn is_tracked(&self, element: &ElementId) -> bool {
        self.pipelines.iter().any(|p| &p.element == element)
    }

    pub fn get(&self, element: &ElementId) -> Option<&Pipeline<B::Context>> {
        self.pipelines.iter().find(|p| &p.element == element)
    }

    /// The pipeline telemetry reads from: the first one discovered
    pub fn active_mut(&mut self) -> Option<&mut Pipeline<B::Context>> {
        self.pipelines.first_mut()
    }

    /// Build a pipeline for a newly present element
    ///
    /// Returns `Ok(false)` when the element is already tracked.
    #[instrument(skip(self), fields(element = %element))]
    pub fn discover(&mut self, element: ElementId) -> Result<bool> {
        if self.is_tracked(&element) {
            return Ok(false);
        }

        let filter_ids = self.state.filter_ids().to_vec();
        let context = self.backend.create_context(&element, &filter_ids)?;
        let mut pipeline = Pipeline::new(element, context, filter_ids);

        if let Err(e) = pipeline.update(&self.state) {
            pipeline.close();
            return Err(e);
        }

        if pipeline.is_suspended() {
            warn!(element = %pipeline.element, "Audio context suspended, will retry resume");
            if let Err(e) = pipeline.try_resume(&self.state) {
                warn!(element = %pipeline.element, error = %e, "Resume failed");
            }
        }

        info!(element = %pipeline.element, total = self.pipelines.len() + 1, "Media element discovered");
        self.pipelines.push(pipeline);
        Ok(true)
    }

    /// Release the pipeline of an element that is gone
    pub fn remove(&mut self, element: &ElementId) -> bool {
        let Some(index) = self.pipelines.iter().position(|p| &p.element == element) else {
            return false;
        };

        let mut pipeline = self.pipelines.remove(index);
        pipeline.close();
        info!(element = %element, total = self.pipelines.len(), "Media element removed");
        true
    }

    /// Track exactly the elements in `present`
    ///
    /// Vanished elements are released first, then new ones are discovered in
    /// the given order. Returns `(added, removed)`.
    pub fn reconcile(&mut self, present: &[ElementId]) -> (usize, usize) {
        let gone: Vec<ElementId> = self
            .pipelines
            .iter()
            .map(|p| p.element.clone())
            .filter(|e| !present.contains(e))
            .collect();

        let removed = gone.iter().filter(|e| self.remove(e)).count();

        let mut added = 0;
        for element in present {
            match self.discover(element.clone()) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!(element = %element, error = %e, "Failed to build pipeline"),
            }
        }

        (added, removed)
    }

    /// Bring every pipeline in line with a new snapshot
    pub fn apply_state(&mut self, state: Arc<EffectState>) {
        self.state = state;
        for pipeline in &mut self.pipelines {
            if let Err(e) = pipeline.update(&self.state) {
                warn!(element = %pipeline.element, error = %e, "Pipeline update failed");
            }
        }
    }

    pub fn has_suspended(&self) -> bool {
        self.pipelines.iter().any(Pipeline::is_suspended)
    }

    /// Retry resumption of every suspended context; returns how many came up
    pub fn resume_suspended(&mut self) -> usize {
        let mut resumed = 0;
        for pipeline in &mut self.pipelines {
            match pipeline.try_resume(&self.state) {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => warn!(element = %pipeline.element, error = %e, "Resume failed"),
            }
        }
        resumed
    }

    /// Playback started on `element`: resume its context if needed and rebuild
    pub fn on_playing(&mut self, element: &ElementId) -> Result<()> {
        let state = Arc::clone(&self.state);
        let pipeline = self
            .pipelines
            .iter_mut()
            .find(|p| &p.element == element)
            .ok_or_else(|| PipelineError::UnknownElement(element.to_string()))?;

        if !pipeline.try_resume(&state)? {
            pipeline.update(&state)?;
        }
        Ok(())
    }

    /// Release every pipeline
    pub fn shutdown(&mut self) {
        for mut pipeline in self.pipelines.drain(..) {
            pipeline.close();
        }
    }
}

impl<B: AudioBackend> Drop for PipelineManager<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
