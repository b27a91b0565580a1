/// Why a task stopped before producing its own outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbortError {
    /// Explicit abort, optionally with a human-readable reason.
    #[error("operation aborted{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted(Option<String>),

    /// The task did not settle within its deadline.
    #[error("operation timed out")]
    Timeout,
}

impl AbortError {
    pub fn aborted() -> Self {
        AbortError::Aborted(None)
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        AbortError::Aborted(Some(reason.into()))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AbortError::Timeout)
    }
}

/// Error types that can carry an [`AbortError`].
///
/// A task whose error reports an abort cause settles as
/// [`SettleState::Aborted`](crate::SettleState::Aborted) rather than
/// `Rejected`. Timeouts are aborts too.
pub trait AbortCause: From<AbortError> + Send + 'static {
    fn abort_cause(&self) -> Option<&AbortError>;

    fn is_abort(&self) -> bool {
        self.abort_cause().is_some()
    }

    fn is_timeout(&self) -> bool {
        self.abort_cause().is_some_and(AbortError::is_timeout)
    }
}

impl AbortCause for AbortError {
    fn abort_cause(&self) -> Option<&AbortError> {
        Some(self)
    }
}
