//! Transfer lifecycle.
//!
//! ```text
//! Queued ──> InProgress ──> Completed | Cancelled | Failed
//!   │
//!   └──> Skipped | Cancelled
//! ```
//!
//! Terminal states are final.

use crate::error::{ErrorKind, FailureClass, Result};
use derive_more::Display;

/// Why a transfer was never started. Not a failure.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Server says the file doesn't exist.
    #[display("not on server")]
    NotOnServer,
    /// Server refuses to serve the file.
    #[display("forbidden")]
    Forbidden,
    /// Server reports a zero-byte file.
    #[display("empty")]
    Empty,
    /// Upload was marked to be skipped before it started.
    #[display("skip requested")]
    Requested,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    #[display("queued")]
    Queued,
    #[display("in progress")]
    InProgress,
    #[display("completed")]
    Completed,
    #[display("cancelled")]
    Cancelled,
    #[display("failed ({_0})")]
    Failed(FailureClass),
    #[display("skipped ({_0})")]
    Skipped(SkipReason),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }

    pub fn can_become(&self, next: &TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Queued, InProgress | Skipped(_) | Cancelled) | (InProgress, Completed | Cancelled | Failed(_))
        )
    }

    /// Move to `next`, rejecting anything the lifecycle doesn't allow.
    pub fn advance(&mut self, next: TransferState) -> Result<()> {
        if !self.can_become(&next) {
            exn::bail!(ErrorKind::InvalidTransition { from: self.name(), to: next.name() });
        }
        *self = next;
        Ok(())
    }
}

/// Terminal state for a transfer that ended with `err`.
impl From<&ErrorKind> for TransferState {
    fn from(err: &ErrorKind) -> Self {
        match err.class() {
            FailureClass::Cancelled => Self::Cancelled,
            class => Self::Failed(class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TransferState::Queued, TransferState::InProgress)]
    #[case(TransferState::Queued, TransferState::Skipped(SkipReason::NotOnServer))]
    #[case(TransferState::Queued, TransferState::Cancelled)]
    #[case(TransferState::InProgress, TransferState::Completed)]
    #[case(TransferState::InProgress, TransferState::Cancelled)]
    #[case(TransferState::InProgress, TransferState::Failed(FailureClass::Network))]
    fn test_allowed(#[case] from: TransferState, #[case] to: TransferState) {
        let mut state = from;
        state.advance(to).unwrap();
        assert_eq!(state, to);
    }

    #[rstest]
    #[case(TransferState::Queued, TransferState::Completed)]
    #[case(TransferState::Queued, TransferState::Failed(FailureClass::Network))]
    #[case(TransferState::InProgress, TransferState::Queued)]
    #[case(TransferState::InProgress, TransferState::Skipped(SkipReason::Requested))]
    #[case(TransferState::Completed, TransferState::Cancelled)]
    #[case(TransferState::Cancelled, TransferState::InProgress)]
    #[case(TransferState::Failed(FailureClass::Local), TransferState::Completed)]
    #[case(TransferState::Skipped(SkipReason::Empty), TransferState::InProgress)]
    fn test_rejected(#[case] from: TransferState, #[case] to: TransferState) {
        let mut state = from;
        let err = state.advance(to).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidTransition { .. }));
        assert_eq!(state, from);
    }

    #[test]
    fn test_from_error() {
        assert_eq!(TransferState::from(&ErrorKind::Cancelled), TransferState::Cancelled);
        assert_eq!(
            TransferState::from(&ErrorKind::Network("reset".into())),
            TransferState::Failed(FailureClass::Network)
        );
    }
}
