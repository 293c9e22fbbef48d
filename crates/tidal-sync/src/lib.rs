//! Authoritative entity replication: the record collection, ownership and
//! authority checks, the per-tick reconciliation pass with selective
//! interpolation, the engine-delta bridge for locally simulated bodies, and
//! the session adapter that carries all of it over a transport.

pub mod bridge;
pub mod client;
pub mod engine;
pub mod lerp;
pub mod queue;
pub mod record;
pub mod session;

pub use bridge::{DeltaBridge, Pose, SimulatedBody};
pub use client::{Client, ClientDirectory, ClientId};
pub use engine::{ReconciliationEngine, RecordEvent, SyncError, SyncSettings, TickReport};
pub use lerp::LerpTable;
pub use queue::{ActionKind, ChangeQueue, PendingAction};
pub use record::{EntityId, EntityRecord, FieldValue, HEADER_FIELDS, Replicated};
pub use session::{
    ChangeEnvelope, ConnectionState, NetSession, Role, SessionConfig, SessionError,
};
