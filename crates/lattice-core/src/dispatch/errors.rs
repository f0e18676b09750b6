//! Dispatch-level error taxonomy.
//!
//! Transport, timeout, and evaluator failures are all mapped into
//! [`DispatchError`] at the dispatch boundary. The taxonomy is stable: each
//! variant has a fixed wire code so peers can round-trip errors through the
//! framed protocol, with unknown codes falling back to [`DispatchError::Internal`].

use thiserror::Error;

/// Classification of a dispatch error, used for routing decisions and as a
/// stable label in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Cancelled,
    DeadlineExceeded,
    DepthExceeded,
    Unavailable,
    InvalidCursor,
    UnknownSecondary,
    Evaluator,
    Internal,
}

impl ErrorKind {
    /// Returns a static string representation for log labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::DepthExceeded => "depth_exceeded",
            Self::Unavailable => "unavailable",
            Self::InvalidCursor => "invalid_cursor",
            Self::UnknownSecondary => "unknown_secondary",
            Self::Evaluator => "evaluator",
            Self::Internal => "internal",
        }
    }
}

/// Errors surfaced by dispatch operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DispatchError {
    /// The caller's context was cancelled before or during the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline or the dispatcher's overall timeout elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The request arrived with an exhausted depth budget.
    #[error("max depth exceeded: recursion budget exhausted")]
    DepthExceeded,

    /// A peer was unreachable or its transport failed.
    #[error("peer unavailable: {0}")]
    Unavailable(String),

    /// The supplied cursor has the wrong version or shape. Caller bug;
    /// never transient.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// A cursor pinned the request to a secondary this dispatcher does not
    /// know about.
    #[error("unknown secondary dispatcher `{0}`")]
    UnknownSecondary(String),

    /// The evaluation engine failed; the message is surfaced as-is.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// A protocol violation or other unclassified internal failure.
    #[error("internal dispatch error: {0}")]
    Internal(String),
}

impl DispatchError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::DepthExceeded => ErrorKind::DepthExceeded,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::InvalidCursor(_) => ErrorKind::InvalidCursor,
            Self::UnknownSecondary(_) => ErrorKind::UnknownSecondary,
            Self::Evaluation(_) => ErrorKind::Evaluator,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if retrying the same request cannot succeed.
    ///
    /// Terminal errors indicate caller bugs (invalid cursor, unknown
    /// secondary) or exhausted budgets (depth); transient transport
    /// failures and timeouts are not terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DepthExceeded | Self::InvalidCursor(_) | Self::UnknownSecondary(_)
        )
    }

    /// Returns `true` if a hedged, unpinned secondary failing with this
    /// error should be absorbed in favor of the primary.
    ///
    /// Only errors produced before the secondary's first response are
    /// eligible; the cluster dispatcher enforces that part of the rule.
    #[must_use]
    pub fn allows_primary_fallback(&self) -> bool {
        // Caller bugs abort the operation no matter which producer
        // reported them.
        !matches!(self, Self::InvalidCursor(_) | Self::UnknownSecondary(_))
    }

    /// Stable wire code for the framed peer protocol.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Cancelled => 1,
            Self::DeadlineExceeded => 2,
            Self::DepthExceeded => 3,
            Self::Unavailable(_) => 4,
            Self::InvalidCursor(_) => 5,
            Self::UnknownSecondary(_) => 6,
            Self::Evaluation(_) => 7,
            Self::Internal(_) => 8,
        }
    }

    /// Reconstructs an error from its wire code and message.
    ///
    /// Unknown codes fall back to [`DispatchError::Internal`] so that a
    /// newer peer's errors still surface rather than being dropped.
    #[must_use]
    pub fn from_wire(code: u16, message: String) -> Self {
        match code {
            1 => Self::Cancelled,
            2 => Self::DeadlineExceeded,
            3 => Self::DepthExceeded,
            4 => Self::Unavailable(message),
            5 => Self::InvalidCursor(message),
            6 => Self::UnknownSecondary(message),
            7 => Self::Evaluation(message),
            _ => Self::Internal(message),
        }
    }

    /// Message carried alongside the wire code, for variants that have one.
    #[must_use]
    pub fn wire_message(&self) -> String {
        match self {
            Self::Cancelled | Self::DeadlineExceeded | Self::DepthExceeded => String::new(),
            Self::Unavailable(m)
            | Self::InvalidCursor(m)
            | Self::UnknownSecondary(m)
            | Self::Evaluation(m)
            | Self::Internal(m) => m.clone(),
        }
    }
}
