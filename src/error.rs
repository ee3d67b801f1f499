use thiserror::Error;

/// Outcome of a [`TimedInvoker`](crate::TimedInvoker) call
/// that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError<E> {
    /// The cancellation signal or timeout resolved before the
    /// computation did. The computation keeps running.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The computation finished first and returned an error.
    #[error("computation failed: {0}")]
    Computation(E),
    /// The computation panicked before producing a result.
    #[error("computation aborted before producing a result")]
    Aborted,
}

impl<E> InvokeError<E> {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, InvokeError::DeadlineExceeded)
    }

    pub fn into_computation(self) -> Option<E> {
        match self {
            InvokeError::Computation(e) => Some(e),
            _ => None,
        }
    }
}
