//! Lifecycle hook interfaces.
//!
//! The entity manager invokes a before/after hook pair around every
//! operation. One event value is threaded from the before hook to the
//! after hook, so hooks can stash state in [`LifecycleEvent::state`] and
//! read it back when the operation finishes.

use serde_json::{Map, Value as JsonValue};

use crate::error::Error;

/// Entity-manager operations hooks can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Entity creation.
    Create,
    /// Single-record fetch.
    FindOne,
    /// Multi-record fetch.
    FindMany,
    /// Entity update.
    Update,
    /// Entity deletion.
    Delete,
    /// Record count.
    Count,
}

impl Action {
    /// Stable name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::FindOne => "findOne",
            Action::FindMany => "findMany",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Count => "count",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The per-call event passed to both hooks of one operation.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// The operation being performed.
    pub action: Action,
    /// Model uid the operation targets.
    pub uid: String,
    /// Operation parameters; the before hook may mutate them.
    pub params: JsonValue,
    /// Hook-owned state bag, threaded from before to after.
    pub state: Map<String, JsonValue>,
}

impl LifecycleEvent {
    pub(crate) fn new(action: Action, uid: &str, params: JsonValue) -> Self {
        Self {
            action,
            uid: uid.to_string(),
            params,
            state: Map::new(),
        }
    }
}

/// Before/after callbacks around entity-manager operations.
pub trait Lifecycle: Send + Sync {
    /// Called before the operation runs. May mutate `event.params`.
    fn before(&self, _event: &mut LifecycleEvent) -> Result<(), Error> {
        Ok(())
    }

    /// Called after the operation succeeds, with its result when one
    /// exists.
    fn after(&self, _event: &mut LifecycleEvent, _result: Option<&JsonValue>) -> Result<(), Error> {
        Ok(())
    }
}
