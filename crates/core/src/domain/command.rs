//! Mutation and query messages accepted by the state owner
//!
//! Commands travel as `type`-tagged JSON records. Decoding happens once at the
//! boundary; everything past it matches on the `Command` sum type.

use crate::domain::state::{CompressorSpec, EffectState, FilterSpec, Preset, Settings};
use crate::domain::store::StoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A request to the state owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    SetFilter {
        filter: FilterSpec,
    },
    SetCompressor {
        compressor: CompressorSpec,
    },
    SetCompEnabled {
        enabled: bool,
    },
    SetEqEnabled {
        enabled: bool,
    },
    SetPreamp {
        #[serde(rename = "preampGain")]
        preamp_gain: f64,
    },
    SetSettings {
        settings: Settings,
    },
    ResetFilters,
    SavePreset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        preset: Preset,
    },
    DeletePreset {
        id: String,
    },
    LoadPreset {
        id: String,
    },
    GetState,
}

impl Command {
    /// Decode one wire message
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::MalformedCommand(e.to_string()))
    }

    /// Decode an already parsed wire message
    pub fn from_value(value: serde_json::Value) -> Result<Self, StoreError> {
        serde_json::from_value(value).map_err(|e| StoreError::MalformedCommand(e.to_string()))
    }

    /// Wire name, for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetFilter { .. } => "SET_FILTER",
            Command::SetCompressor { .. } => "SET_COMPRESSOR",
            Command::SetCompEnabled { .. } => "SET_COMP_ENABLED",
            Command::SetEqEnabled { .. } => "SET_EQ_ENABLED",
            Command::SetPreamp { .. } => "SET_PREAMP",
            Command::SetSettings { .. } => "SET_SETTINGS",
            Command::ResetFilters => "RESET_FILTERS",
            Command::SavePreset { .. } => "SAVE_PRESET",
            Command::DeletePreset { .. } => "DELETE_PRESET",
            Command::LoadPreset { .. } => "LOAD_PRESET",
            Command::GetState => "GET_STATE",
        }
    }
}

/// Answer to a single command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack,
    PresetSaved { id: String },
    State(Arc<EffectState>),
}

impl Reply {
    pub fn into_wire(self) -> WireMessage {
        match self {
            Reply::Ack => WireMessage::Ack,
            Reply::PresetSaved { id } => WireMessage::PresetSaved { id },
            Reply::State(state) => WireMessage::SetState {
                state: EffectState::clone(&state),
            },
        }
    }
}

/// Messages sent from the state owner to other contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    SetState { state: EffectState },
    PresetSaved { id: String },
    Ack,
    Error { message: String },
}

impl WireMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"ERROR","message":"serialization failed: {}"}}"#, e)
        })
    }
}
