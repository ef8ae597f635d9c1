use thiserror::Error;
use uuid::Uuid;

use concord_gateway::DeliveryError;
use concord_types::{Party, RecordId, ThreadId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no live {kind} record for thread {thread_id}")]
    NotFound { thread_id: ThreadId, kind: &'static str },

    #[error("two live {kind} records of thread {thread_id} share the newest timestamp")]
    AmbiguousHead { thread_id: ThreadId, kind: &'static str },

    #[error("thread {0} is closed")]
    ThreadClosed(ThreadId),

    #[error("a proposal is already outstanding on thread {0}")]
    ProposalAlreadyOutstanding(ThreadId),

    #[error("no outstanding proposal on thread {0}")]
    NoOutstandingProposal(ThreadId),

    #[error("invalid action arguments: {0}")]
    InvalidActionArguments(String),

    #[error("{party} did not initiate the proposal on thread {thread_id}")]
    NotProposer { thread_id: ThreadId, party: Party },

    #[error("the proposal on thread {0} has not been agreed by every required signer")]
    NotQuorate(ThreadId),

    #[error("nothing to reject on thread {0}")]
    NothingToReject(ThreadId),

    #[error("{party} already agreed to the proposal on thread {thread_id}")]
    AlreadyAgreed { thread_id: ThreadId, party: Party },

    #[error("{party} is not a required signer of the proposal on thread {thread_id}")]
    NotASigner { thread_id: ThreadId, party: Party },

    #[error("record {record} of thread {thread_id} was taken by a competing commit")]
    CommitConflict { thread_id: ThreadId, record: RecordId },

    #[error("commit rejected: {0}")]
    CommitRejected(String),

    #[error("{party} refused to sign: {reason}")]
    SignatureRefused { party: Party, reason: String },

    #[error("backfilled message {message_id} rejected: {reason}")]
    BackfillRejected { message_id: Uuid, reason: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invariant violated on thread {thread_id}: {reason}")]
    InvariantViolation { thread_id: ThreadId, reason: String },

    #[error("thread {0} is halted until an operator clears it")]
    ThreadHalted(ThreadId),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Error {
    /// Transport failures only. A lost commit race is final for that
    /// attempt and is never retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_delivery_failures_are_retryable() {
        let unreachable = Error::from(DeliveryError::UnknownParty(Party::from("w")));
        assert!(unreachable.is_retryable());

        let conflict = Error::CommitConflict {
            thread_id: ThreadId::new(),
            record: RecordId::new(),
        };
        assert!(!conflict.is_retryable());
        assert!(!Error::CommitRejected("missing signature".into()).is_retryable());
    }
}
