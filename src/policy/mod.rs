pub mod codec;
pub mod compiler;
pub mod matcher;
pub mod path;
pub mod types;

use std::sync::Arc;

use tokio::sync::watch;

use crate::errors::GateError;
use crate::settings::Policy;

pub use types::{AccessTable, Edge, RoutePattern};

/// Process-wide holder of the current [`AccessTable`].
///
/// Tables are never mutated in place: a recompilation builds a new table and
/// publishes it, replacing the shared `Arc` in one step. Evaluations take a
/// snapshot and keep using it even if a newer table lands mid-request.
#[derive(Clone)]
pub struct PolicyHandle {
    tx: Arc<watch::Sender<Arc<AccessTable>>>,
}

impl PolicyHandle {
    pub fn new(table: AccessTable) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(table));
        Self { tx: Arc::new(tx) }
    }

    /// Load the startup table from the configured artifact.
    ///
    /// A missing or unreadable artifact leaves the gate with an empty table,
    /// which denies every role-gated route, unless `require_artifact` makes it
    /// fatal.
    pub fn from_settings(policy: &Policy) -> Result<Self, GateError> {
        let table = match (&policy.artifact, policy.require_artifact) {
            (Some(path), true) => codec::read(path)?,
            (Some(path), false) => codec::load(path).unwrap_or_default(),
            (None, true) => {
                return Err(GateError::Misconfigured(
                    "policy.require_artifact is set but policy.artifact is not".into(),
                ))
            }
            (None, false) => {
                tracing::warn!("No policy artifact configured; starting with an empty access table");
                AccessTable::new()
            }
        };
        Ok(Self::new(table))
    }

    pub fn snapshot(&self) -> Arc<AccessTable> {
        self.tx.borrow().clone()
    }

    /// Replace the current table and return the one it superseded.
    pub fn publish(&self, table: AccessTable) -> Arc<AccessTable> {
        let roles = table.role_count();
        let grants = table.grant_count();
        let previous = self.tx.send_replace(Arc::new(table));
        tracing::info!(roles, grants, "Published access table");
        previous
    }

    /// Receiver notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AccessTable>> {
        self.tx.subscribe()
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(AccessTable::new())
    }
}

impl std::fmt::Debug for PolicyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.snapshot();
        f.debug_struct("PolicyHandle")
            .field("roles", &table.role_count())
            .field("grants", &table.grant_count())
            .finish()
    }
}
