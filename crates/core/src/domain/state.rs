//! Canonical effect settings
//!
//! `EffectState` is the single writable truth of the system. Only the state
//! store mutates it; every other component works on immutable snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Number of equalizer bands
pub const FILTER_COUNT: usize = 8;

/// Schema version written with every persisted state
pub const STATE_VERSION: u32 = 1;

/// Id of the built-in, locked preset
pub const DEFAULT_PRESET_ID: &str = "d9c9ad7c-4ba6-4a7d-9f37-2e476fdfafba";

/// Factory center frequencies, indexed by `id - 1`
pub const FACTORY_FREQUENCIES: [f64; FILTER_COUNT] =
    [46.0, 215.0, 1000.0, 4642.0, 711.0, 1668.0, 3914.0, 9182.0];

/// Stable identity of an equalizer band (1..=8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(u8);

impl FilterId {
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Biquad shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Lowshelf,
    Peaking,
    Highshelf,
}

/// One equalizer band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub id: FilterId,
    /// Center/corner frequency in Hz
    pub frequency: f64,
    /// Boost or cut in dB
    pub gain: f64,
    pub q: f64,
    #[serde(rename = "type")]
    pub kind: FilterKind,
    pub enabled: bool,
}

impl FilterSpec {
    /// Check that the tunable values are usable by the substrate
    pub fn validate(&self) -> Result<(), String> {
        if !(self.frequency.is_finite() && self.frequency > 0.0) {
            return Err(format!("filter {}: frequency must be positive, got {}", self.id, self.frequency));
        }
        if !self.gain.is_finite() {
            return Err(format!("filter {}: gain must be finite", self.id));
        }
        if !(self.q.is_finite() && self.q >= 0.0) {
            return Err(format!("filter {}: q must be non-negative, got {}", self.id, self.q));
        }
        Ok(())
    }
}

/// Dynamics compressor settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorSpec {
    pub enabled: bool,
    /// dB, <= 0
    pub threshold: f64,
    /// >= 1
    pub ratio: f64,
    /// Seconds
    pub attack: f64,
    /// Seconds
    pub release: f64,
    /// dB, >= 0
    pub knee: f64,
    /// Post-compression gain in dB
    pub gain: f64,
}

impl CompressorSpec {
    pub fn validate(&self) -> Result<(), String> {
        let finite = [self.threshold, self.ratio, self.attack, self.release, self.knee, self.gain]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err("compressor values must be finite".to_string());
        }
        if self.threshold > 0.0 {
            return Err(format!("compressor threshold must be <= 0 dB, got {}", self.threshold));
        }
        if self.ratio < 1.0 {
            return Err(format!("compressor ratio must be >= 1, got {}", self.ratio));
        }
        if self.attack <= 0.0 || self.release <= 0.0 {
            return Err("compressor attack and release must be positive".to_string());
        }
        if self.knee < 0.0 {
            return Err(format!("compressor knee must be >= 0 dB, got {}", self.knee));
        }
        Ok(())
    }
}

impl Default for CompressorSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: -40.0,
            ratio: 8.0,
            attack: 0.003,
            release: 0.15,
            knee: 30.0,
            gain: 0.0,
        }
    }
}

/// Visualization settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub sensitivity: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self { sensitivity: 1024 }
    }
}

/// Saved snapshot of the tunable chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub icon: String,
    pub compressor: CompressorSpec,
    pub filters: [FilterSpec; FILTER_COUNT],
    pub preamp_gain: f64,
}

impl Preset {
    /// The built-in preset mirroring factory values
    pub fn factory() -> Self {
        Self {
            name: "Default".to_string(),
            locked: true,
            image: None,
            icon: "audiotrack".to_string(),
            compressor: CompressorSpec::default(),
            filters: factory_filters(),
            preamp_gain: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_chain(&self.compressor, &self.filters, self.preamp_gain)
    }
}

/// The full settings record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EffectState {
    pub version: u32,
    pub eq_enabled: bool,
    pub compressor: CompressorSpec,
    /// Ordered by id
    pub filters: [FilterSpec; FILTER_COUNT],
    /// dB
    pub preamp_gain: f64,
    pub settings: Settings,
    pub presets: BTreeMap<String, Preset>,
}

impl Default for EffectState {
    fn default() -> Self {
        Self::factory_default()
    }
}

impl EffectState {
    /// Factory default state with the locked "Default" preset
    pub fn factory_default() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert(DEFAULT_PRESET_ID.to_string(), Preset::factory());

        Self {
            version: STATE_VERSION,
            eq_enabled: true,
            compressor: CompressorSpec::default(),
            filters: factory_filters(),
            preamp_gain: 0.0,
            settings: Settings::default(),
            presets,
        }
    }

    pub fn filter(&self, id: FilterId) -> Option<&FilterSpec> {
        self.filters.iter().find(|f| f.id == id)
    }

    pub fn filter_mut(&mut self, id: FilterId) -> Option<&mut FilterSpec> {
        self.filters.iter_mut().find(|f| f.id == id)
    }

    pub fn filter_ids(&self) -> [FilterId; FILTER_COUNT] {
        self.filters.map(|f| f.id)
    }

    /// Check the live chain; stored presets are checked when loaded
    pub fn validate(&self) -> Result<(), String> {
        validate_chain(&self.compressor, &self.filters, self.preamp_gain)
    }

    /// Whether any processing stage is switched on
    pub fn is_active(&self) -> bool {
        self.eq_enabled || self.compressor.enabled
    }

    /// Capture the current chain as a new, unlocked preset
    pub fn capture_preset(&self, name: impl Into<String>, icon: impl Into<String>) -> Preset {
        Preset {
            name: name.into(),
            locked: false,
            image: None,
            icon: icon.into(),
            compressor: self.compressor,
            filters: self.filters,
            preamp_gain: self.preamp_gain,
        }
    }
}

/// Check a band array: ids exactly 1..=8 in id order, every band usable
pub fn validate_filters(filters: &[FilterSpec; FILTER_COUNT]) -> Result<(), String> {
    for (index, filter) in filters.iter().enumerate() {
        let expected = FilterId::new(index as u8 + 1);
        if filter.id != expected {
            return Err(format!(
                "band {} carries filter id {}, expected {}",
                index + 1,
                filter.id,
                expected
            ));
        }
        filter.validate()?;
    }
    Ok(())
}

fn validate_chain(
    compressor: &CompressorSpec,
    filters: &[FilterSpec; FILTER_COUNT],
    preamp_gain: f64,
) -> Result<(), String> {
    validate_filters(filters)?;
    compressor.validate()?;
    if !preamp_gain.is_finite() {
        return Err(format!("preamp gain must be finite, got {}", preamp_gain));
    }
    Ok(())
}

/// The factory 8-band layout
pub fn factory_filters() -> [FilterSpec; FILTER_COUNT] {
    let mut index = 0;
    FACTORY_FREQUENCIES.map(|frequency| {
        index += 1;
        let kind = match index {
            1 => FilterKind::Lowshelf,
            n if n == FILTER_COUNT => FilterKind::Highshelf,
            _ => FilterKind::Peaking,
        };
        FilterSpec {
            id: FilterId::new(index as u8),
            frequency,
            gain: 0.0,
            q: if kind == FilterKind::Lowshelf { 0.0 } else { 1.0 },
            kind,
            enabled: index <= 4,
        }
    })
}
