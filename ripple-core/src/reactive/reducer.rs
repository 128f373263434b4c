//! Reducers
//!
//! A reducer pairs a cell with a pure transition `(state, action) -> state`.
//! Dispatching an action reads the cell, runs the transition and writes the
//! result back, so every state change goes through one function.
//!
//! Transitions should return the state unchanged for actions they do not
//! handle. The write still happens (the cell's version grows) but the value
//! is identical.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::cell::Cell;
use crate::error::{BoxError, EngineError, Result};

type Transition<S, A> = Arc<dyn Fn(&S, &A) -> std::result::Result<S, BoxError> + Send + Sync>;

/// Sends actions through a transition into its paired cell.
///
/// # Example
///
/// ```rust,ignore
/// enum Action { Increment, Reset }
///
/// let (count, dispatch) = scope.reducer(0, |state: &i32, action: &Action| {
///     Ok(match action {
///         Action::Increment => state + 1,
///         Action::Reset => 0,
///     })
/// })?;
///
/// dispatch.dispatch(Action::Increment)?;
/// assert_eq!(count.read()?, 1);
/// ```
pub struct Dispatch<S, A>
where
    S: Clone + Send + Sync + 'static,
{
    cell: Cell<S>,
    transition: Transition<S, A>,
}

impl<S, A> Dispatch<S, A>
where
    S: Clone + Send + Sync + 'static,
{
    pub(crate) fn new<F>(cell: Cell<S>, transition: F) -> Self
    where
        F: Fn(&S, &A) -> std::result::Result<S, BoxError> + Send + Sync + 'static,
    {
        Self {
            cell,
            transition: Arc::new(transition),
        }
    }

    /// Apply `action` to the current state and write the result.
    ///
    /// A failing transition returns `TransitionFailed` and leaves the cell
    /// untouched.
    pub fn dispatch(&self, action: A) -> Result<()> {
        let current = self.cell.peek()?;
        let next = (self.transition)(&current, &action).map_err(|source| {
            debug!(cell = %self.cell.id(), error = %source, "transition failed");
            EngineError::TransitionFailed {
                cell: self.cell.id(),
                source,
            }
        })?;
        self.cell.set(next)
    }

    /// Read the current state.
    pub fn state(&self) -> Result<S> {
        self.cell.read()
    }

    /// The cell this dispatcher writes to.
    pub fn cell(&self) -> &Cell<S> {
        &self.cell
    }
}

impl<S, A> Clone for Dispatch<S, A>
where
    S: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            transition: Arc::clone(&self.transition),
        }
    }
}

impl<S, A> fmt::Debug for Dispatch<S, A>
where
    S: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("cell", &self.cell.id())
            .finish()
    }
}
