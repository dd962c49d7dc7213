//! Audio substrate implementations
//!
//! The control plane only ever talks to `AudioBackend`/`AudioContext`. The
//! virtual graph records topology and parameters in memory and synthesizes
//! analyser readings from them, which is what the CLI and the integration
//! tests run against.

pub mod virtual_graph;

pub use virtual_graph::*;
