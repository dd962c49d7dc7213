//! In-memory node-graph substrate
//!
//! Each context records its live edges and node parameters. Analyser readings
//! are synthesized from a test tone pushed through the gains that are
//! actually on the signal path, so telemetry reacts to topology and settings.
//! Every graph can be observed from outside through a `GraphProbe`.

use eq8comp_core::domain::{
    gain_to_db, AudioBackend, AudioContext, BiquadParams, ContextState, DynamicsParams, Edge,
    ElementId, FilterId, GainStage, NodeKind, PipelineError,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

type Result<T> = std::result::Result<T, PipelineError>;

const SAMPLE_RATE: f64 = 48_000.0;
const TONE_HZ: f64 = 1_000.0;
const TONE_AMPLITUDE: f64 = 0.5;

/// Observable state of one virtual context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSnapshot {
    pub element: ElementId,
    pub state: ContextState,
    /// Live edges in connection order
    pub edges: Vec<Edge>,
    pub biquads: BTreeMap<FilterId, BiquadParams>,
    pub dynamics: Option<DynamicsParams>,
    pub preamp: f64,
    pub postamp: f64,
    /// Connect calls for an edge that already existed
    pub duplicate_connects: u64,
    pub resume_attempts: u64,
}

impl GraphSnapshot {
    fn new(element: ElementId, state: ContextState) -> Self {
        Self {
            element,
            state,
            edges: Vec::new(),
            biquads: BTreeMap::new(),
            dynamics: None,
            preamp: 1.0,
            postamp: 1.0,
            duplicate_connects: 0,
            resume_attempts: 0,
        }
    }

    /// Nodes from source to destination following the live edges
    pub fn path(&self) -> Vec<NodeKind> {
        let mut path = vec![NodeKind::Source];
        let mut current = NodeKind::Source;
        while let Some(edge) = self.edges.iter().find(|e| e.from == current) {
            if path.contains(&edge.to) {
                break;
            }
            path.push(edge.to);
            current = edge.to;
        }
        path
    }

    fn on_path(&self, node: NodeKind) -> bool {
        self.path().contains(&node)
    }

    /// Tone level arriving at the compressor, in dB
    fn compressor_input_db(&self) -> f64 {
        let pre = if self.on_path(NodeKind::Preamp) {
            self.preamp
        } else {
            1.0
        };
        gain_to_db(TONE_AMPLITUDE * pre)
    }

    /// Hard-knee static curve applied to the test tone
    fn reduction_db(&self) -> f64 {
        let Some(dynamics) = self.dynamics else {
            return 0.0;
        };
        if !self.on_path(NodeKind::Compressor) {
            return 0.0;
        }
        let over = self.compressor_input_db() - dynamics.threshold;
        if over <= 0.0 || dynamics.ratio <= 0.0 {
            0.0
        } else {
            -(over - over / dynamics.ratio)
        }
    }

    /// Tone amplitude seen by the analyser
    fn output_amplitude(&self) -> f64 {
        if !self.on_path(NodeKind::Analyser) {
            return 0.0;
        }
        let mut amplitude = TONE_AMPLITUDE;
        if self.on_path(NodeKind::Preamp) {
            amplitude *= self.preamp;
        }
        if self.on_path(NodeKind::Compressor) {
            amplitude *= 10f64.powf(self.reduction_db() / 20.0);
        }
        if self.on_path(NodeKind::Postamp) {
            amplitude *= self.postamp;
        }
        amplitude
    }
}

type SharedGraph = Arc<Mutex<GraphSnapshot>>;

fn lock(graph: &SharedGraph) -> MutexGuard<'_, GraphSnapshot> {
    graph.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Control-plane handle on one virtual context
pub struct VirtualContext {
    graph: SharedGraph,
    filter_ids: Vec<FilterId>,
    bins: usize,
    /// Resume calls to refuse before coming up
    resume_refusals: usize,
    phase: f64,
}

impl VirtualContext {
    fn check_node(&self, node: NodeKind) -> Result<()> {
        match node {
            NodeKind::Filter(id) if !self.filter_ids.contains(&id) => Err(PipelineError::Context(
                format!("no filter node {} in this context", id),
            )),
            _ => Ok(()),
        }
    }
}

impl AudioContext for VirtualContext {
    fn state(&self) -> ContextState {
        lock(&self.graph).state
    }

    fn resume(&mut self) -> Result<ContextState> {
        let mut graph = lock(&self.graph);
        graph.resume_attempts += 1;
        match graph.state {
            ContextState::Closed => Err(PipelineError::Context(format!(
                "context for {} is closed",
                graph.element
            ))),
            ContextState::Running => Ok(ContextState::Running),
            ContextState::Suspended if self.resume_refusals > 0 => {
                self.resume_refusals -= 1;
                Ok(ContextState::Suspended)
            }
            ContextState::Suspended => {
                graph.state = ContextState::Running;
                Ok(ContextState::Running)
            }
        }
    }

    fn connect(&mut self, edge: Edge) -> Result<()> {
        self.check_node(edge.from)?;
        self.check_node(edge.to)?;
        if edge.from == edge.to || edge.from == NodeKind::Destination || edge.to == NodeKind::Source {
            return Err(PipelineError::Context(format!("invalid connection {}", edge)));
        }

        let mut graph = lock(&self.graph);
        if graph.state == ContextState::Closed {
            return Err(PipelineError::Context(format!(
                "context for {} is closed",
                graph.element
            )));
        }
        if graph.edges.contains(&edge) {
            graph.duplicate_connects += 1;
        }
        graph.edges.push(edge);
        Ok(())
    }

    fn disconnect(&mut self, node: NodeKind) {
        lock(&self.graph).edges.retain(|e| e.from != node);
    }

    fn set_biquad(&mut self, id: FilterId, params: &BiquadParams) {
        lock(&self.graph).biquads.insert(id, *params);
    }

    fn set_dynamics(&mut self, params: &DynamicsParams) {
        lock(&self.graph).dynamics = Some(*params);
    }

    fn set_gain(&mut self, stage: GainStage, multiplier: f64) {
        let mut graph = lock(&self.graph);
        match stage {
            GainStage::Preamp => graph.preamp = multiplier,
            GainStage::Postamp => graph.postamp = multiplier,
        }
    }

    fn analyser_bins(&self) -> usize {
        self.bins
    }

    fn read_time_domain(&mut self, out: &mut [f32]) {
        let amplitude = lock(&self.graph).output_amplitude();
        let step = TAU * TONE_HZ / SAMPLE_RATE;
        for sample in out.iter_mut() {
            *sample = (amplitude * self.phase.sin()) as f32;
            self.phase = (self.phase + step) % TAU;
        }
    }

    fn read_frequency(&mut self, out: &mut [u8]) {
        let amplitude = lock(&self.graph).output_amplitude();
        if out.is_empty() {
            return;
        }
        // Bin width is (SAMPLE_RATE / 2) / bins
        let tone_bin = (TONE_HZ * out.len() as f64 / (SAMPLE_RATE / 2.0)).round();
        let peak = 255.0 * amplitude.min(1.0);
        for (i, byte) in out.iter_mut().enumerate() {
            let distance = (i as f64 - tone_bin).abs();
            *byte = (peak / (1.0 + distance)).round() as u8;
        }
    }

    fn gain_reduction(&self) -> f32 {
        lock(&self.graph).reduction_db() as f32
    }

    fn close(&mut self) {
        let mut graph = lock(&self.graph);
        graph.state = ContextState::Closed;
        graph.edges.clear();
        debug!(element = %graph.element, "Virtual context closed");
    }
}

/// Read access to every context a backend has created
#[derive(Debug, Clone, Default)]
pub struct GraphProbe {
    graphs: Arc<Mutex<Vec<SharedGraph>>>,
}

impl GraphProbe {
    fn register(&self, graph: SharedGraph) {
        self.graphs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(graph);
    }

    fn all(&self) -> Vec<SharedGraph> {
        self.graphs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest context created for `element`
    pub fn graph(&self, element: &ElementId) -> Option<GraphSnapshot> {
        self.all()
            .iter()
            .rev()
            .map(|g| lock(g).clone())
            .find(|g| &g.element == element)
    }

    /// Snapshots of every context ever created, in creation order
    pub fn snapshots(&self) -> Vec<GraphSnapshot> {
        self.all().iter().map(|g| lock(g).clone()).collect()
    }

    /// Contexts that are not closed
    pub fn open(&self) -> Vec<GraphSnapshot> {
        self.snapshots()
            .into_iter()
            .filter(|g| g.state != ContextState::Closed)
            .collect()
    }
}

/// Factory for virtual contexts
#[derive(Debug, Clone)]
pub struct VirtualBackend {
    fft_size: usize,
    start_suspended: bool,
    resume_refusals: usize,
    probe: GraphProbe,
}

impl VirtualBackend {
    pub fn new(fft_size: usize) -> Self {
        Self {
            fft_size,
            start_suspended: false,
            resume_refusals: 0,
            probe: GraphProbe::default(),
        }
    }

    /// New contexts start suspended and refuse `refusals` resume calls
    pub fn suspended(mut self, refusals: usize) -> Self {
        self.start_suspended = true;
        self.resume_refusals = refusals;
        self
    }

    pub fn probe(&self) -> GraphProbe {
        self.probe.clone()
    }
}

impl AudioBackend for VirtualBackend {
    type Context = VirtualContext;

    fn create_context(
        &mut self,
        element: &ElementId,
        filter_ids: &[FilterId],
    ) -> Result<VirtualContext> {
        let state = if self.start_suspended {
            ContextState::Suspended
        } else {
            ContextState::Running
        };
        let graph = Arc::new(Mutex::new(GraphSnapshot::new(element.clone(), state)));
        self.probe.register(Arc::clone(&graph));

        info!(element = %element, state = ?state, filters = filter_ids.len(), "Virtual context created");
        Ok(VirtualContext {
            graph,
            filter_ids: filter_ids.to_vec(),
            bins: self.fft_size / 2,
            resume_refusals: self.resume_refusals,
            phase: 0.0,
        })
    }
}
