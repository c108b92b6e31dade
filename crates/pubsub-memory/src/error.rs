use thiserror::Error;

/// Failure configured with [`crate::MemoryProvider::fail_with`].
#[derive(Clone, Debug, Error)]
#[error("injected failure: {reason}")]
pub struct InjectedFailure {
    /// Reason given when the failure was configured.
    pub reason: String,
}
