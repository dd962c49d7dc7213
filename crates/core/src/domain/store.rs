//! State owner and replication protocol
//!
//! This module provides:
//! - `StateStore`: applies commands to the one `EffectState`
//! - `StateStorage`: the key/value persistence interface
//! - `StateService`: the state owner task, which persists and broadcasts every
//!   mutation behind a trailing-edge rate limiter
//! - `StateHandle`: the cloneable message-passing front of the state owner

use crate::domain::command::{Command, Reply};
use crate::domain::config::StoreConfig;
use crate::domain::state::{factory_filters, EffectState, DEFAULT_PRESET_ID};
use crate::domain::throttle::RateLimiter;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

/// Key of the single persisted record
pub const STORAGE_KEY: &str = "::state";

const REQUEST_QUEUE: usize = 64;
const UPDATE_QUEUE: usize = 16;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the state owner
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Preset not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("State owner is not running")]
    Closed,
}

/// Errors raised by a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

/// Key/value persistence for the state record
#[async_trait]
pub trait StateStorage: Send + Sync {
    async fn get(&self, key: &str) -> std::result::Result<Option<Value>, StorageError>;

    async fn set(&self, key: &str, value: Value) -> std::result::Result<(), StorageError>;
}

/// In-process storage with failure injection
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, Value>>,
    writes: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with a state record
    pub fn with_state(state: &EffectState) -> std::result::Result<Self, StorageError> {
        let storage = Self::new();
        storage.insert(STORAGE_KEY, serde_json::to_value(state)?)?;
        Ok(storage)
    }

    /// Make the next `count` reads fail
    pub fn fail_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make every write fail until reset
    pub fn fail_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Number of successful writes
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn record(&self, key: &str) -> Option<Value> {
        self.records.lock().ok().and_then(|records| records.get(key).cloned())
    }

    /// The persisted state record, decoded
    pub fn stored_state(&self) -> Option<EffectState> {
        self.record(STORAGE_KEY)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    fn insert(&self, key: &str, value: Value) -> std::result::Result<(), StorageError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))?;
        records.insert(key.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn get(&self, key: &str) -> std::result::Result<Option<Value>, StorageError> {
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable("injected read failure".to_string()));
        }
        Ok(self.record(key))
    }

    async fn set(&self, key: &str, value: Value) -> std::result::Result<(), StorageError> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected write failure".to_string()));
        }
        self.insert(key, value)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What applying a command did to the state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Mutated,
    /// A preset was stored under this id (the state was mutated)
    PresetSaved(String),
    /// Nothing to do, e.g. deleting an absent preset
    Unchanged,
    /// A read-only query
    Query,
}

impl Applied {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Applied::Mutated | Applied::PresetSaved(_))
    }
}

/// Owner of the canonical `EffectState`
#[derive(Debug, Clone)]
pub struct StateStore {
    state: EffectState,
}

impl StateStore {
    pub fn new(state: EffectState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &EffectState {
        &self.state
    }

    pub fn snapshot(&self) -> Arc<EffectState> {
        Arc::new(self.state.clone())
    }

    /// Apply one command atomically. On error the state is left untouched.
    pub fn apply(&mut self, command: Command) -> Result<Applied> {
        match command {
            Command::SetFilter { filter } => {
                filter.validate().map_err(StoreError::MalformedCommand)?;
                let slot = self.state.filter_mut(filter.id).ok_or_else(|| {
                    StoreError::MalformedCommand(format!("unknown filter id {}", filter.id))
                })?;
                slot.frequency = filter.frequency;
                slot.gain = filter.gain;
                slot.q = filter.q;
                slot.kind = filter.kind;
                slot.enabled = filter.enabled;
                Ok(Applied::Mutated)
            }
            Command::SetCompressor { compressor } => {
                compressor.validate().map_err(StoreError::MalformedCommand)?;
                self.state.compressor = compressor;
                Ok(Applied::Mutated)
            }
            Command::SetCompEnabled { enabled } => {
                self.state.compressor.enabled = enabled;
                Ok(Applied::Mutated)
            }
            Command::SetEqEnabled { enabled } => {
                self.state.eq_enabled = enabled;
                Ok(Applied::Mutated)
            }
            Command::SetPreamp { preamp_gain } => {
                if !preamp_gain.is_finite() {
                    return Err(StoreError::MalformedCommand(format!(
                        "preamp gain must be finite, got {}",
                        preamp_gain
                    )));
                }
                self.state.preamp_gain = preamp_gain;
                Ok(Applied::Mutated)
            }
            Command::SetSettings { settings } => {
                self.state.settings = settings;
                Ok(Applied::Mutated)
            }
            Command::ResetFilters => {
                self.state.filters = factory_filters();
                self.state.preamp_gain = 0.0;
                Ok(Applied::Mutated)
            }
            Command::SavePreset { id, preset } => {
                preset.validate().map_err(StoreError::MalformedCommand)?;
                let id = match id.filter(|id| !id.is_empty()) {
                    Some(id) => id,
                    None => self.fresh_preset_id(),
                };
                debug!(id = %id, name = %preset.name, "Saving preset");
                self.state.presets.insert(id.clone(), preset);
                Ok(Applied::PresetSaved(id))
            }
            Command::DeletePreset { id } => {
                if self.state.presets.remove(&id).is_some() {
                    debug!(id = %id, "Preset deleted");
                    Ok(Applied::Mutated)
                } else {
                    debug!(id = %id, "Preset to delete does not exist");
                    Ok(Applied::Unchanged)
                }
            }
            Command::LoadPreset { id } => {
                let preset = self
                    .state
                    .presets
                    .get(&id)
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                preset
                    .validate()
                    .map_err(|e| StoreError::MalformedCommand(format!("preset {}: {}", id, e)))?;
                let (compressor, filters, preamp_gain) =
                    (preset.compressor, preset.filters, preset.preamp_gain);
                self.state.compressor = compressor;
                self.state.filters = filters;
                self.state.preamp_gain = preamp_gain;
                debug!(id = %id, "Preset loaded");
                Ok(Applied::Mutated)
            }
            Command::GetState => Ok(Applied::Query),
        }
    }

    fn fresh_preset_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if id != DEFAULT_PRESET_ID && !self.state.presets.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Read the persisted state, retrying with a fixed backoff while storage fails
///
/// An absent record is initialised with factory defaults; a record that fails
/// to decode, or whose live chain breaks the fixed band layout, is replaced by
/// factory defaults.
#[instrument(skip(storage, config))]
pub async fn load_state(storage: &dyn StateStorage, config: &StoreConfig) -> Result<EffectState> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match storage.get(STORAGE_KEY).await {
            Ok(Some(value)) => match serde_json::from_value::<EffectState>(value) {
                Ok(state) => match state.validate() {
                    Ok(()) => {
                        info!(presets = state.presets.len(), "Persisted state loaded");
                        return Ok(state);
                    }
                    Err(reason) => {
                        warn!(reason = %reason, "Persisted state is invalid, restoring factory defaults");
                        return Ok(initialise(storage).await);
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Persisted state is corrupt, restoring factory defaults");
                    return Ok(initialise(storage).await);
                }
            },
            Ok(None) => {
                info!("No persisted state, writing factory defaults");
                return Ok(initialise(storage).await);
            }
            Err(e) => {
                let limit = config.storage_retry_attempts;
                if limit != 0 && attempt >= limit {
                    error!(attempt, error = %e, "Giving up on persisted state");
                    return Err(e.into());
                }
                warn!(attempt, error = %e, "Failed to read persisted state, retrying");
                tokio::time::sleep(config.storage_retry_backoff()).await;
            }
        }
    }
}

async fn initialise(storage: &dyn StateStorage) -> EffectState {
    let state = EffectState::factory_default();
    let written = match serde_json::to_value(&state) {
        Ok(value) => storage.set(STORAGE_KEY, value).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = written {
        warn!(error = %e, "Failed to write factory defaults");
    }
    state
}

struct Request {
    command: Command,
    reply: Option<oneshot::Sender<Result<Reply>>>,
}

/// The state owner context
pub struct StateService {
    store: StateStore,
    storage: Arc<dyn StateStorage>,
    limiter: RateLimiter<Arc<EffectState>>,
    updates: broadcast::Sender<Arc<EffectState>>,
    indicator: watch::Sender<bool>,
}

impl StateService {
    /// Load persisted state (retrying per `config`) and prepare the service
    pub async fn open(storage: Arc<dyn StateStorage>, config: &StoreConfig) -> Result<Self> {
        let state = load_state(storage.as_ref(), config).await?;
        Ok(Self::with_state(storage, state, config.broadcast_window()))
    }

    /// Prepare the service around an already known state
    pub fn with_state(storage: Arc<dyn StateStorage>, state: EffectState, window: Duration) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_QUEUE);
        let (indicator, _) = watch::channel(state.is_active());
        Self {
            store: StateStore::new(state),
            storage,
            limiter: RateLimiter::new(window),
            updates,
            indicator,
        }
    }

    pub fn state(&self) -> &EffectState {
        self.store.state()
    }

    /// Run the service on its own task
    pub fn spawn(self) -> (StateHandle, JoinHandle<()>) {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        let handle = StateHandle {
            requests,
            updates: self.updates.clone(),
            indicator: self.indicator.subscribe(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        info!(window_ms = self.limiter.window().as_millis() as u64, "State owner started");
        loop {
            let deadline = self.limiter.deadline();
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(snapshot) = self.limiter.poll(Instant::now()) {
                        self.commit(snapshot).await;
                    }
                }
            }
        }

        if self.limiter.is_pending() {
            debug!("Flushing pending state before shutdown");
        }
        if let Some(snapshot) = self.limiter.flush() {
            self.commit(snapshot).await;
        }
        info!("State owner stopped");
    }

    fn handle(&mut self, request: Request) {
        let Request { command, reply } = request;
        let name = command.name();

        let result = match self.store.apply(command) {
            Ok(applied) => {
                trace!(command = name, ?applied, "Command applied");
                if applied.is_mutation() {
                    self.publish();
                }
                Ok(match applied {
                    Applied::PresetSaved(id) => Reply::PresetSaved { id },
                    Applied::Query => Reply::State(self.store.snapshot()),
                    Applied::Mutated | Applied::Unchanged => Reply::Ack,
                })
            }
            Err(e) => {
                warn!(command = name, error = %e, "Command rejected");
                Err(e)
            }
        };

        if let Some(reply) = reply {
            // The requester may have stopped waiting
            let _ = reply.send(result);
        }
    }

    fn publish(&mut self) {
        let snapshot = self.store.snapshot();
        let active = snapshot.is_active();
        self.indicator.send_if_modified(|current| {
            if *current != active {
                *current = active;
                true
            } else {
                false
            }
        });
        let now = Instant::now();
        if self.limiter.call(snapshot, now) {
            let idle_ms = self
                .limiter
                .last_fire()
                .map(|fired| now.duration_since(fired).as_millis() as u64);
            trace!(idle_ms = ?idle_ms, "Broadcast window opened");
        }
    }

    /// Persist, then fan out
    async fn commit(&mut self, snapshot: Arc<EffectState>) {
        match serde_json::to_value(&*snapshot) {
            Ok(value) => {
                if let Err(e) = self.storage.set(STORAGE_KEY, value).await {
                    warn!(error = %e, "Failed to persist state");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize state"),
        }
        let listeners = self.updates.send(snapshot).unwrap_or(0);
        debug!(listeners, "State broadcast");
    }
}

/// Message-passing front of the state owner
#[derive(Clone)]
pub struct StateHandle {
    requests: mpsc::Sender<Request>,
    updates: broadcast::Sender<Arc<EffectState>>,
    indicator: watch::Receiver<bool>,
}

impl StateHandle {
    /// Send a command and wait for its reply
    pub async fn send(&self, command: Command) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request { command, reply: Some(tx) })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Send a command without waiting for the outcome
    pub async fn post(&self, command: Command) -> Result<()> {
        self.requests
            .send(Request { command, reply: None })
            .await
            .map_err(|_| StoreError::Closed)
    }

    /// Decode and send a raw wire message; malformed input is logged and dropped
    pub async fn dispatch_json(&self, raw: &str) -> Result<Reply> {
        let command = Command::from_json(raw).map_err(|e| {
            warn!(error = %e, "Dropping malformed command");
            e
        })?;
        self.send(command).await
    }

    pub async fn get_state(&self) -> Result<Arc<EffectState>> {
        match self.send(Command::GetState).await? {
            Reply::State(state) => Ok(state),
            other => Err(StoreError::MalformedCommand(format!(
                "unexpected reply to GET_STATE: {:?}",
                other
            ))),
        }
    }

    /// Receive every committed state. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EffectState>> {
        self.updates.subscribe()
    }

    /// Whether any processing stage is switched on
    pub fn active_indicator(&self) -> watch::Receiver<bool> {
        self.indicator.clone()
    }
}
