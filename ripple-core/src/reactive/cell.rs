//! Cell Implementation
//!
//! A Cell is the fundamental reactive primitive. It holds a value and a
//! version stamp that grows by one with every write.
//!
//! # How Cells Work
//!
//! 1. Reading a cell returns a clone of its value. Reads made while a
//!    derivation or effect is running are attributed to that computation.
//!
//! 2. Writing a cell replaces the value, bumps the version and records the
//!    cell in the open batch. Dependents recompute when the batch commits,
//!    never during the write itself.
//!
//! 3. A write made with no open batch opens one and commits it immediately.
//!
//! # Functional Updates
//!
//! [`Cell::update`] receives the value current at the moment the update is
//! applied, not when the closure was created. Several updates queued in one
//! batch therefore fold left in call order:
//!
//! ```rust,ignore
//! runtime.batch(|| {
//!     count.update(|c| c + 1)?;
//!     count.update(|c| c * 10)
//! })??;
//! // (0 + 1) * 10
//! assert_eq!(count.read()?, 10);
//! ```

use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::RwLock;

use super::runtime::Runtime;
use crate::error::Result;
use crate::graph::{NodeId, NodeKind};

/// Anything a derivation or effect can declare as a dependency.
pub trait Trackable {
    /// The dependency's node in the graph.
    fn node_id(&self) -> NodeId;
}

/// A pending write to a cell.
pub enum Update<T> {
    /// Replace the value.
    Replace(T),

    /// Compute the next value from the latest one.
    Apply(Box<dyn FnOnce(&T) -> T + Send>),
}

impl<T> Update<T> {
    /// Build a functional update.
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        Update::Apply(Box::new(f))
    }

    fn apply(self, current: &T) -> T {
        match self {
            Update::Replace(value) => value,
            Update::Apply(f) => f(current),
        }
    }
}

impl<T> From<T> for Update<T> {
    fn from(value: T) -> Self {
        Update::Replace(value)
    }
}

/// A versioned reactive value of type `T`.
///
/// Cells are created through [`ScopeHandle::cell`](super::ScopeHandle::cell)
/// and live until their scope is torn down. Clones share the same value.
///
/// # Example
///
/// ```rust,ignore
/// let count = scope.cell(0)?;
/// count.set(5)?;
/// assert_eq!(count.read()?, 5);
/// assert_eq!(count.version()?, 1);
/// ```
pub struct Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    id: NodeId,
    value: Arc<RwLock<T>>,
    runtime: Runtime,
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(id: NodeId, value: T, runtime: Runtime) -> Self {
        Self {
            id,
            value: Arc::new(RwLock::new(value)),
            runtime,
        }
    }

    /// Get the cell's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current value.
    ///
    /// Inside a derivation or effect the read is attributed to it; reading a
    /// cell the computation did not declare logs a warning.
    pub fn read(&self) -> Result<T> {
        self.runtime.ensure_live(self.id, NodeKind::Source)?;
        self.runtime.record_read(self.id);
        Ok(self.value.read().clone())
    }

    /// Get the current value without attributing the read to any computation.
    pub fn peek(&self) -> Result<T> {
        self.runtime.ensure_live(self.id, NodeKind::Source)?;
        Ok(self.value.read().clone())
    }

    /// Apply a write and record it in the open batch.
    ///
    /// Settles straight away when no batch is open, so errors from that
    /// commit (such as `RunawayBatch`) are returned here.
    pub fn write(&self, update: impl Into<Update<T>>) -> Result<()> {
        self.runtime.ensure_live(self.id, NodeKind::Source)?;

        let next = {
            let current = self.value.read();
            update.into().apply(&current)
        };
        *self.value.write() = next;

        self.runtime.note_write(self.id)
    }

    /// Replace the value.
    pub fn set(&self, value: T) -> Result<()> {
        self.write(Update::Replace(value))
    }

    /// Update the value from the latest one.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        self.write(Update::with(f))
    }

    /// Replace the value only if it differs from the current one.
    ///
    /// Returns whether a write happened. An equal value leaves the version
    /// alone, so nothing downstream re-runs.
    pub fn set_if_changed(&self, value: T) -> Result<bool>
    where
        T: PartialEq,
    {
        if self.peek()? == value {
            return Ok(false);
        }
        self.set(value)?;
        Ok(true)
    }

    /// Number of writes applied so far.
    pub fn version(&self) -> Result<u64> {
        self.runtime.version(self.id, NodeKind::Source)
    }

    /// Whether the cell's scope is still alive.
    pub fn is_live(&self) -> bool {
        self.runtime.ensure_live(self.id, NodeKind::Source).is_ok()
    }
}

impl<T> Trackable for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
            runtime: self.runtime.clone(),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("value", &*self.value.read())
            .field("version", &self.version().ok())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn cell_read_and_set() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cell = scope.cell(0).unwrap();
        assert_eq!(cell.read().unwrap(), 0);

        cell.set(42).unwrap();
        assert_eq!(cell.read().unwrap(), 42);
    }

    #[test]
    fn cell_update() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cell = scope.cell(10).unwrap();

        cell.update(|v| v + 5).unwrap();
        assert_eq!(cell.read().unwrap(), 15);
    }

    #[test]
    fn versions_count_writes() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cell = scope.cell("a".to_string()).unwrap();
        assert_eq!(cell.version().unwrap(), 0);

        cell.set("b".to_string()).unwrap();
        cell.write("c".to_string()).unwrap();
        assert_eq!(cell.version().unwrap(), 2);
    }

    #[test]
    fn set_if_changed_skips_equal_values() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cell = scope.cell(3).unwrap();

        assert!(!cell.set_if_changed(3).unwrap());
        assert_eq!(cell.version().unwrap(), 0);

        assert!(cell.set_if_changed(4).unwrap());
        assert_eq!(cell.read().unwrap(), 4);
        assert_eq!(cell.version().unwrap(), 1);
    }

    #[test]
    fn functional_writes_in_one_batch_fold_in_order() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cell = scope.cell(0).unwrap();

        runtime
            .batch(|| {
                cell.update(|c| c + 1).unwrap();
                cell.update(|c| c * 10).unwrap();
                cell.update(|c| c - 3).unwrap();
            })
            .unwrap();

        assert_eq!(cell.read().unwrap(), 7);
        assert_eq!(cell.version().unwrap(), 3);
    }

    #[test]
    fn cell_clone_shares_state() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cell1 = scope.cell(0).unwrap();
        let cell2 = cell1.clone();

        cell1.set(42).unwrap();
        assert_eq!(cell2.read().unwrap(), 42);
        assert_eq!(cell1.id(), cell2.id());
    }

    #[test]
    fn cell_ids_are_unique() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let c1 = scope.cell(0).unwrap();
        let c2 = scope.cell(0).unwrap();
        assert_ne!(c1.id(), c2.id());
    }

    #[test]
    fn torn_down_cell_rejects_reads_and_writes() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cell = scope.cell(1).unwrap();
        scope.teardown().unwrap();

        assert!(!cell.is_live());
        assert!(matches!(
            cell.read(),
            Err(EngineError::UseAfterTeardown { kind: "cell", .. })
        ));
        assert!(matches!(
            cell.set(2),
            Err(EngineError::UseAfterTeardown { .. })
        ));
        assert!(cell.peek().is_err());
    }
}
