//! Domain entities and business rules

pub mod audio;
pub mod command;
pub mod config;
pub mod page;
pub mod pipeline;
pub mod routing;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod throttle;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    db_to_gain, gain_to_db, AudioBackend, AudioContext, BiquadParams, ContextState,
    DynamicsParams, Edge, ElementId, GainStage, NodeKind, PipelineError,
};
pub use command::{Command, Reply, WireMessage};
pub use config::{ConfigError, Eq8Config, PipelineConfig, StoreConfig, TelemetryConfig};
pub use page::{PageEvent, PageProcessor};
pub use pipeline::{Pipeline, PipelineManager};
pub use routing::{RoutingInput, Topology};
pub use state::{
    CompressorSpec, EffectState, FilterId, FilterKind, FilterSpec, Preset, Settings,
    DEFAULT_PRESET_ID, FILTER_COUNT,
};
pub use store::{
    Applied, MemoryStorage, StateHandle, StateService, StateStorage, StateStore, StorageError,
    StoreError, STORAGE_KEY,
};
pub use telemetry::{SamplerEvent, Subscriber, TelemetryFrame, TelemetrySampler};
pub use throttle::RateLimiter;
