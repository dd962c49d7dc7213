//! Signal routing policy
//!
//! The topology of a pipeline is a pure function of three conditions: whether
//! the equalizer is switched on, whether any band is enabled, and whether the
//! compressor is switched on. This module turns an `EffectState` into the
//! exact list of edges to establish after a full teardown.

use crate::domain::audio::{Edge, NodeKind};
use crate::domain::state::{EffectState, FilterId, FilterSpec};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The six possible signal paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    /// source → preamp → filters → compressor → postamp
    EqCompressor,
    /// source → preamp → filters
    Eq,
    /// source → preamp → compressor → postamp
    PreampCompressor,
    /// source → preamp
    Preamp,
    /// source → compressor → postamp
    Compressor,
    /// source
    Bypass,
}

impl Topology {
    pub fn select(eq_enabled: bool, has_filters: bool, comp_enabled: bool) -> Self {
        let eq_active = eq_enabled && has_filters;
        let preamp_only = eq_enabled && !has_filters;

        match (eq_active, preamp_only, comp_enabled) {
            (true, _, true) => Topology::EqCompressor,
            (true, _, false) => Topology::Eq,
            (false, true, true) => Topology::PreampCompressor,
            (false, true, false) => Topology::Preamp,
            (false, false, true) => Topology::Compressor,
            (false, false, false) => Topology::Bypass,
        }
    }

    pub fn uses_preamp(&self) -> bool {
        matches!(
            self,
            Topology::EqCompressor | Topology::Eq | Topology::PreampCompressor | Topology::Preamp
        )
    }

    pub fn uses_filters(&self) -> bool {
        matches!(self, Topology::EqCompressor | Topology::Eq)
    }

    pub fn uses_compressor(&self) -> bool {
        matches!(
            self,
            Topology::EqCompressor | Topology::PreampCompressor | Topology::Compressor
        )
    }
}

/// Everything the policy looks at
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingInput {
    pub eq_enabled: bool,
    pub comp_enabled: bool,
    /// Enabled bands, in wiring order
    pub chain: Vec<FilterId>,
    /// Whether the pipeline carries an analysis node
    pub analyser: bool,
}

impl RoutingInput {
    pub fn new(state: &EffectState, analyser: bool) -> Self {
        Self {
            eq_enabled: state.eq_enabled,
            comp_enabled: state.compressor.enabled,
            chain: filter_chain(&state.filters),
            analyser,
        }
    }

    pub fn topology(&self) -> Topology {
        Topology::select(self.eq_enabled, !self.chain.is_empty(), self.comp_enabled)
    }

    /// Nodes on the signal path, source to destination
    /// Source straight through analysis to the destination
    pub fn bypass() -> Self {
        Self {
            eq_enabled: false,
            comp_enabled: false,
            chain: Vec::new(),
            analyser: true,
        }
    }

    pub fn path(&self) -> Vec<NodeKind> {
        let topology = self.topology();
        let mut path = Vec::with_capacity(self.chain.len() + 6);

        path.push(NodeKind::Source);
        if topology.uses_preamp() {
            path.push(NodeKind::Preamp);
        }
        if topology.uses_filters() {
            path.extend(self.chain.iter().copied().map(NodeKind::Filter));
        }
        if topology.uses_compressor() {
            path.push(NodeKind::Compressor);
            path.push(NodeKind::Postamp);
        }
        if self.analyser {
            path.push(NodeKind::Analyser);
        }
        path.push(NodeKind::Destination);
        path
    }

    /// The complete edge list: one edge per consecutive pair on the path
    pub fn edges(&self) -> Vec<Edge> {
        self.path()
            .windows(2)
            .map(|pair| Edge::new(pair[0], pair[1]))
            .collect()
    }
}

/// Enabled bands sorted by descending frequency, ties by ascending id
pub fn filter_chain(filters: &[FilterSpec]) -> Vec<FilterId> {
    let mut enabled: Vec<&FilterSpec> = filters.iter().filter(|f| f.enabled).collect();
    enabled.sort_by(|a, b| match b.frequency.total_cmp(&a.frequency) {
        Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
    enabled.into_iter().map(|f| f.id).collect()
}

/// Edges for `state`, with the analysis node as final stage
pub fn plan(state: &EffectState) -> Vec<Edge> {
    RoutingInput::new(state, true).edges()
}
