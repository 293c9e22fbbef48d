//! Reconciliation engine.
//!
//! Owns the authoritative record collection. Change requests are validated
//! against the ownership/authority rule when they are enqueued, then applied
//! once per tick by [`ReconciliationEngine::update`], newest request first.
//! Updates to lerp-registered numeric fields converge over several ticks;
//! everything else snaps.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use rustc_hash::{FxHashMap, FxHashSet};
use tidal_config::SyncConfig;

use crate::client::{Client, ClientDirectory};
use crate::lerp::LerpTable;
use crate::queue::{ActionKind, ChangeQueue, PendingAction};
use crate::record::{EntityId, EntityRecord, FieldValue};

/// Errors raised while configuring the engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Interpolation rates must lie in `(0, 1]`.
    #[error("lerp rate {rate} for field '{field}' is outside (0, 1]")]
    InvalidLerpRate { field: String, rate: f64 },

    /// The convergence threshold must be finite and non-negative.
    #[error("lerp threshold {0} must be finite and non-negative")]
    InvalidThreshold(f64),
}

/// Tunables for the reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSettings {
    /// An interpolated field counts as converged once it is this close to
    /// its target.
    pub lerp_threshold: f64,
    /// Rate used by [`LerpTable::register_default`].
    pub default_lerp_rate: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lerp_threshold: 0.1,
            default_lerp_rate: 0.25,
        }
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            lerp_threshold: config.lerp_threshold,
            default_lerp_rate: config.default_lerp_rate,
        }
    }
}

/// Lifecycle notification for bound game objects.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    /// A record entered the collection.
    Added {
        requestor: Client,
        record: EntityRecord,
    },
    /// A record left the collection; its id is retired.
    Destroyed {
        requestor: Client,
        record: EntityRecord,
    },
}

impl RecordEvent {
    pub fn record(&self) -> &EntityRecord {
        match self {
            Self::Added { record, .. } | Self::Destroyed { record, .. } => record,
        }
    }
}

/// Outcome of one [`ReconciliationEngine::update`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Tick counter after the pass.
    pub tick: u64,
    /// Actions fully applied and removed.
    pub applied: usize,
    /// Actions still pending (unconverged updates).
    pub pending: usize,
}

/// The authoritative record collection and its change queue.
pub struct ReconciliationEngine {
    directory: Arc<ClientDirectory>,
    settings: SyncSettings,
    records: FxHashMap<EntityId, EntityRecord>,
    retired: FxHashSet<EntityId>,
    queue: ChangeQueue,
    lerp: LerpTable,
    subscribers: Vec<Sender<RecordEvent>>,
    outbox: Vec<RecordEvent>,
    tick: u64,
}

impl ReconciliationEngine {
    pub fn new(directory: Arc<ClientDirectory>, settings: SyncSettings) -> Result<Self, SyncError> {
        if !settings.lerp_threshold.is_finite() || settings.lerp_threshold < 0.0 {
            return Err(SyncError::InvalidThreshold(settings.lerp_threshold));
        }
        Ok(Self {
            directory,
            settings,
            records: FxHashMap::default(),
            retired: FxHashSet::default(),
            queue: ChangeQueue::new(),
            lerp: LerpTable::with_default_rate(settings.default_lerp_rate)?,
            subscribers: Vec::new(),
            outbox: Vec::new(),
            tick: 0,
        })
    }

    /// Build an engine from the `[sync]` config section, registering every
    /// configured lerp field.
    pub fn from_config(
        directory: Arc<ClientDirectory>,
        config: &SyncConfig,
    ) -> Result<Self, SyncError> {
        let mut engine = Self::new(directory, SyncSettings::from(config))?;
        for (field, rate) in &config.lerp_fields {
            engine.register_lerp(field.clone(), *rate)?;
        }
        Ok(engine)
    }

    pub fn directory(&self) -> &Arc<ClientDirectory> {
        &self.directory
    }

    pub fn settings(&self) -> SyncSettings {
        self.settings
    }

    /// Interpolate `field` at `rate` per tick from now on.
    pub fn register_lerp(&mut self, field: impl Into<String>, rate: f64) -> Result<(), SyncError> {
        self.lerp.register(field, rate)
    }

    pub fn lerp_table(&self) -> &LerpTable {
        &self.lerp
    }

    pub fn lerp_table_mut(&mut self) -> &mut LerpTable {
        &mut self.lerp
    }

    /// Hand authority to `client`.
    pub fn register_authority(&self, client: Client) {
        self.directory.register_authority(client);
    }

    /// Whether `requestor` may change `record`: the authority may change
    /// anything, an owner only records it owns (and still owns, if the record
    /// already exists).
    fn may_change(&self, record: &EntityRecord, requestor: &Client) -> bool {
        if self.directory.is_authority(requestor.id) {
            return true;
        }
        if record.owner() != requestor.id {
            return false;
        }
        self.records
            .get(&record.id())
            .is_none_or(|existing| existing.owner() == requestor.id)
    }

    /// Validate and queue a change request. Unauthorized requests are
    /// dropped and reported as `false`; they are never an error.
    pub fn try_enqueue(&mut self, record: EntityRecord, kind: ActionKind, requestor: &Client) -> bool {
        if !self.may_change(&record, requestor) {
            tracing::debug!(
                "Rejected {kind:?} of {} from {} (owner {})",
                record.id(),
                requestor.id,
                record.owner()
            );
            return false;
        }
        let replaced = self.queue.push_or_replace(PendingAction {
            kind,
            requestor: requestor.clone(),
            payload: record,
        });
        if replaced {
            tracing::trace!("Replaced pending {kind:?}");
        }
        true
    }

    /// Run one reconciliation pass.
    pub fn update(&mut self) -> TickReport {
        self.outbox.clear();
        self.tick += 1;

        let actions = self.queue.take_all();
        let mut unfinished = Vec::new();
        let mut applied = 0;

        // Newest first; anything older that targets a record destroyed in
        // this pass then finds it missing and is dropped as stale.
        for action in actions.into_iter().rev() {
            let done = match action.kind {
                ActionKind::Create => self.apply_create(&action),
                ActionKind::Update => self.apply_update(&action),
                ActionKind::Destroy => self.apply_destroy(&action),
                ActionKind::Reckon => self.apply_reckon(&action),
            };
            if done {
                applied += 1;
            } else {
                unfinished.push(action);
            }
        }

        // A record destroyed in this pass takes its newer unconverged
        // updates with it.
        let before = unfinished.len();
        unfinished.retain(|action| !self.retired.contains(&action.target()));
        applied += before - unfinished.len();

        unfinished.reverse();
        self.queue.restore(unfinished);

        TickReport {
            tick: self.tick,
            applied,
            pending: self.queue.len(),
        }
    }

    fn apply_create(&mut self, action: &PendingAction) -> bool {
        let id = action.target();
        if self.retired.contains(&id) {
            tracing::debug!("Create of retired {id} discarded");
            return true;
        }
        if self.records.contains_key(&id) {
            tracing::debug!("Create of existing {id} ignored");
            return true;
        }
        self.insert(action);
        true
    }

    fn apply_update(&mut self, action: &PendingAction) -> bool {
        let id = action.target();
        let Some(record) = self.records.get_mut(&id) else {
            tracing::debug!("Update of missing {id} dropped as stale");
            return true;
        };

        let mut converged = true;
        for (name, goal) in action.payload.mutable_fields() {
            let rate = self.lerp.rate_for(name);
            match (rate, record.number(name), goal.as_number()) {
                (Some(rate), Some(current), Some(goal)) => {
                    let next = current + (goal - current) * rate;
                    record.set(name, next);
                    if (next - goal).abs() > self.settings.lerp_threshold {
                        converged = false;
                    }
                }
                _ => record.set(name, goal.clone()),
            }
        }
        converged
    }

    fn apply_destroy(&mut self, action: &PendingAction) -> bool {
        let id = action.target();
        match self.records.remove(&id) {
            Some(record) => {
                self.retired.insert(id);
                self.emit(RecordEvent::Destroyed {
                    requestor: action.requestor.clone(),
                    record,
                });
            }
            None => tracing::debug!("Destroy of missing {id} ignored"),
        }
        true
    }

    fn apply_reckon(&mut self, action: &PendingAction) -> bool {
        let id = action.target();
        if !self.directory.is_authority(action.requestor.id) {
            tracing::debug!("Reckon of {id} from non-authority {} ignored", action.requestor.id);
            return true;
        }
        if self.retired.contains(&id) {
            tracing::debug!("Reckon of retired {id} discarded");
            return true;
        }

        if let Some(record) = self.records.get_mut(&id) {
            if record.type_name() != action.payload.type_name() {
                tracing::debug!(
                    "Reckon of {id} ignored: type {} does not match {}",
                    action.payload.type_name(),
                    record.type_name()
                );
                return true;
            }
            for (name, value) in action.payload.mutable_fields() {
                record.set(name, value.clone());
            }
            return true;
        }

        self.insert(action);
        true
    }

    fn insert(&mut self, action: &PendingAction) {
        let record = action.payload.clone();
        tracing::debug!("Added {} ({}) owned by {}", record.id(), record.type_name(), record.owner());
        self.records.insert(record.id(), record.clone());
        self.emit(RecordEvent::Added {
            requestor: action.requestor.clone(),
            record,
        });
    }

    fn emit(&mut self, event: RecordEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        self.outbox.push(event);
    }

    /// Add an engine-driven movement delta onto the current authoritative
    /// values, bypassing the queue. Fields missing from the record start at
    /// the delta; non-numeric fields are left alone. Returns `false` when the
    /// record is missing or `requestor` may not change it.
    pub fn apply_delta(&mut self, requestor: &Client, id: EntityId, delta: &[(&str, f64)]) -> bool {
        let authorized = match self.records.get(&id) {
            Some(record) => {
                self.directory.is_authority(requestor.id) || record.owner() == requestor.id
            }
            None => false,
        };
        if !authorized {
            tracing::debug!("Delta for {id} from {} rejected", requestor.id);
            return false;
        }
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        for &(name, amount) in delta {
            match record.get(name).map(FieldValue::as_number) {
                Some(Some(current)) => record.set(name, current + amount),
                Some(None) => tracing::debug!("Delta skipped non-numeric field '{name}' on {id}"),
                None => record.set(name, amount),
            }
        }
        true
    }

    /// Subscribe to [`RecordEvent`]s. Dropping the receiver unsubscribes.
    pub fn subscribe(&mut self) -> Receiver<RecordEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Events emitted by the most recent [`update`](Self::update).
    pub fn last_tick_events(&self) -> &[RecordEvent] {
        &self.outbox
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Every record, ordered by id.
    pub fn snapshot(&self) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = self.records.values().cloned().collect();
        records.sort_by_key(EntityRecord::id);
        records
    }

    pub fn is_retired(&self, id: EntityId) -> bool {
        self.retired.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingAction> {
        self.queue.iter()
    }

    /// Discard every pending action.
    pub fn clear_pending(&mut self) {
        if !self.queue.is_empty() {
            tracing::debug!("Discarding {} pending actions", self.queue.len());
        }
        self.queue.clear();
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }
}
