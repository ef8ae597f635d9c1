use serde::{Deserialize, Serialize};

use crate::models::{MessageRecord, Party, Record, RecordId, ThreadId};
use crate::transition::{Command, Transition, TransitionId};

/// A party's signature over a transition digest, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySignature {
    pub party: Party,
    pub signature: String,
}

/// Fire-and-forget messages sent between parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerNotice {
    /// A transition committed by the notary; record your copies.
    Finality {
        transition: Transition,
        signatures: Vec<PartySignature>,
    },

    /// You were removed from the thread; tombstone your copy.
    Shutdown { thread_id: ThreadId, from: Party },

    /// Ordered history of a thread you were just added to.
    Backfill {
        thread_id: ThreadId,
        from: Party,
        messages: Vec<MessageRecord>,
    },
}

impl PeerNotice {
    pub fn thread_id(&self) -> ThreadId {
        match self {
            Self::Finality { transition, .. } => transition.thread_id,
            Self::Shutdown { thread_id, .. } => *thread_id,
            Self::Backfill { thread_id, .. } => *thread_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Finality { .. } => "finality",
            Self::Shutdown { .. } => "shutdown",
            Self::Backfill { .. } => "backfill",
        }
    }
}

/// Requests that expect exactly one [`PeerReply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerRequest {
    /// Check the transition against your own store and sign it.
    Sign { transition: Transition },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerReply {
    Signed(PartySignature),
    Refused { reason: String },
}

/// Published locally after each commit lands in a party's store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub command: Command,
    pub thread_id: ThreadId,
    pub transition_id: Option<TransitionId>,
    pub produced: Vec<Record>,
    pub consumed: Vec<RecordId>,
}

impl ChangeEvent {
    pub fn from_transition(transition: &Transition, produced: Vec<Record>, consumed: Vec<RecordId>) -> Self {
        Self {
            command: transition.command,
            thread_id: transition.thread_id,
            transition_id: Some(transition.id),
            produced,
            consumed,
        }
    }
}
