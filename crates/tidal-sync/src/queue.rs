//! Pending change requests awaiting the next reconciliation pass.

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::record::{EntityId, EntityRecord};

/// What a pending action does to its target.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Insert a record that does not exist yet.
    Create,
    /// Merge fields into an existing record, interpolating where registered.
    Update,
    /// Remove a record.
    Destroy,
    /// Authority-only forced snapshot.
    Reckon,
}

/// One queued change request.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub requestor: Client,
    pub payload: EntityRecord,
}

impl PendingAction {
    pub fn target(&self) -> EntityId {
        self.payload.id()
    }
}

/// Unbounded queue holding at most one action per `(target, kind)`.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    actions: Vec<PendingAction>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an action, or replace the payload and requestor of the action
    /// already pending for the same target and kind. Returns `true` when a
    /// pending action was replaced.
    pub fn push_or_replace(&mut self, action: PendingAction) -> bool {
        let target = action.target();
        match self
            .actions
            .iter_mut()
            .find(|a| a.kind == action.kind && a.target() == target)
        {
            Some(existing) => {
                existing.payload = action.payload;
                existing.requestor = action.requestor;
                true
            }
            None => {
                self.actions.push(action);
                false
            }
        }
    }

    /// Take every pending action, leaving the queue empty. Order is
    /// enqueue order.
    pub fn take_all(&mut self) -> Vec<PendingAction> {
        std::mem::take(&mut self.actions)
    }

    /// Put back actions that did not finish, ahead of anything queued since.
    pub fn restore(&mut self, mut unfinished: Vec<PendingAction>) {
        unfinished.append(&mut self.actions);
        self.actions = unfinished;
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.actions.iter()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }
}
