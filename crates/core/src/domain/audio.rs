//! Audio substrate abstractions
//!
//! This module defines the control-plane interface of the node-based audio
//! processing substrate: one context per media element, a fixed set of nodes,
//! and connect/disconnect/parameter operations. Concrete substrates live in
//! the `infra` crate.

use crate::domain::state::{CompressorSpec, FilterId, FilterKind, FilterSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by the audio substrate or the pipeline layer
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The substrate refused to create or drive a context
    #[error("Audio context error: {0}")]
    Context(String),

    /// The context exists but is not processing audio yet
    #[error("Audio context suspended: {0}")]
    Suspended(String),

    /// No pipeline is tracked for the element
    #[error("Unknown media element: {0}")]
    UnknownElement(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Identifier of a discovered media element
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One node of a pipeline's fixed node set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    Source,
    Preamp,
    Filter(FilterId),
    Compressor,
    Postamp,
    Analyser,
    Destination,
}

impl NodeKind {
    /// All nodes that may own outgoing connections, in creation order
    pub fn outputs(filter_ids: &[FilterId]) -> Vec<NodeKind> {
        let mut nodes = Vec::with_capacity(filter_ids.len() + 5);
        nodes.push(NodeKind::Source);
        nodes.push(NodeKind::Preamp);
        nodes.extend(filter_ids.iter().copied().map(NodeKind::Filter));
        nodes.push(NodeKind::Compressor);
        nodes.push(NodeKind::Postamp);
        nodes.push(NodeKind::Analyser);
        nodes
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Source => write!(f, "source"),
            NodeKind::Preamp => write!(f, "preamp"),
            NodeKind::Filter(id) => write!(f, "filter#{}", id.get()),
            NodeKind::Compressor => write!(f, "compressor"),
            NodeKind::Postamp => write!(f, "postamp"),
            NodeKind::Analyser => write!(f, "analyser"),
            NodeKind::Destination => write!(f, "destination"),
        }
    }
}

/// Directed connection between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeKind,
    pub to: NodeKind,
}

impl Edge {
    pub fn new(from: NodeKind, to: NodeKind) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Run state of a processing context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextState {
    Running,
    /// Created but not rendering (e.g. blocked by an autoplay policy)
    Suspended,
    Closed,
}

/// Parameters written to one biquad filter node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadParams {
    pub kind: FilterKind,
    pub frequency: f64,
    pub q: f64,
    pub gain_db: f64,
}

impl From<&FilterSpec> for BiquadParams {
    fn from(source: &FilterSpec) -> Self {
        Self {
            kind: source.kind,
            frequency: source.frequency,
            q: source.q,
            gain_db: source.gain,
        }
    }
}

/// Parameters written to the dynamics compressor node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynamicsParams {
    pub threshold: f64,
    pub ratio: f64,
    pub attack: f64,
    pub release: f64,
    pub knee: f64,
}

impl From<&CompressorSpec> for DynamicsParams {
    fn from(source: &CompressorSpec) -> Self {
        Self {
            threshold: source.threshold,
            ratio: source.ratio,
            attack: source.attack,
            release: source.release,
            knee: source.knee,
        }
    }
}

/// Gain-type nodes around the processing chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GainStage {
    Preamp,
    Postamp,
}

/// Control-plane handle on one processing context bound to a media element
///
/// Node identities are fixed at creation; only edges and parameter values
/// change afterwards. All calls are issued from the owning page task.
pub trait AudioContext: Send {
    /// Current run state
    fn state(&self) -> ContextState;

    /// Ask a suspended context to start rendering, returning the resulting state
    fn resume(&mut self) -> Result<ContextState>;

    /// Establish one directed connection
    fn connect(&mut self, edge: Edge) -> Result<()>;

    /// Remove every outgoing connection of `node` (no-op when it has none)
    fn disconnect(&mut self, node: NodeKind);

    fn set_biquad(&mut self, id: FilterId, params: &BiquadParams);

    fn set_dynamics(&mut self, params: &DynamicsParams);

    /// Set a gain node to a linear multiplier
    fn set_gain(&mut self, stage: GainStage, multiplier: f64);

    /// Number of analysis bins (half the FFT size)
    fn analyser_bins(&self) -> usize;

    /// Copy the analyser's current waveform into `out`
    fn read_time_domain(&mut self, out: &mut [f32]);

    /// Copy the analyser's current byte spectrum into `out`
    fn read_frequency(&mut self, out: &mut [u8]);

    /// Attenuation currently applied by the compressor, in dB (<= 0)
    fn gain_reduction(&self) -> f32;

    /// Release the context and every node it owns
    fn close(&mut self);
}

/// Factory for processing contexts
pub trait AudioBackend: Send {
    type Context: AudioContext;

    /// Create a context wrapping `element` with one filter node per id
    fn create_context(&mut self, element: &ElementId, filter_ids: &[FilterId])
        -> Result<Self::Context>;
}

/// Convert decibels to a linear multiplier (`10^(dB/20)`)
pub fn db_to_gain(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Convert a linear multiplier back to decibels
pub fn gain_to_db(gain: f64) -> f64 {
    20.0 * gain.log10()
}
