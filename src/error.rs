use anyhow::Error as AnyError;

/// Error surfaced to callers of the dispatcher.
///
/// Transient backend failures and per-item encoding failures never show up here; the
/// workers absorb them. What remains is either a rejection the caller opted into, a
/// dispatcher that is not accepting work, or a defect.
#[derive(Debug)]
pub enum DispatchError {
    /// The dispatcher released a rejectable dispatch without writing it.
    BackendUnavailable,
    /// `dispatch` was called before `start` or after `stop`.
    NotRunning,
    /// Internal bookkeeping reached a state that should be impossible.
    InvariantViolation(String),
    /// A worker terminated unexpectedly.
    Fatal(AnyError),
}

impl DispatchError {
    pub fn invariant(message: impl Into<String>) -> Self {
        DispatchError::InvariantViolation(message.into())
    }

    /// Returns true for the conditions that indicate a defect rather than an
    /// operational state.
    pub fn is_severe(&self) -> bool {
        matches!(
            self,
            DispatchError::InvariantViolation(_) | DispatchError::Fatal(_)
        )
    }
}

impl core::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DispatchError::BackendUnavailable => write!(f, "spill backend unavailable"),
            DispatchError::NotRunning => write!(f, "spill dispatcher is not running"),
            DispatchError::InvariantViolation(message) => {
                write!(f, "spill dispatcher invariant violated: {message}")
            }
            DispatchError::Fatal(source) => write!(f, "spill dispatcher failed: {source}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Fatal(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}
