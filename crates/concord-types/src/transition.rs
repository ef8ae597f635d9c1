use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{ChangeKind, Party, Record, RecordId, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionId(Uuid);

impl TransitionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a transition was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    CreateThread,
    SendMessage,
    Propose { kind: ChangeKind },
    Agree,
    Reject,
    ConsumeProposal,
    FinalizeClose,
    FinalizeParticipants,
    AdoptHistory,
    /// Local tombstone after removal. Never submitted for commit.
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateThread => "create_thread",
            Self::SendMessage => "send_message",
            Self::Propose { .. } => "propose",
            Self::Agree => "agree",
            Self::Reject => "reject",
            Self::ConsumeProposal => "consume_proposal",
            Self::FinalizeClose => "finalize_close",
            Self::FinalizeParticipants => "finalize_participants",
            Self::AdoptHistory => "adopt_history",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Propose { kind } => write!(f, "propose({})", kind),
            other => f.write_str(other.name()),
        }
    }
}

/// An atomic state change: consume `inputs`, produce `outputs`, while every
/// record in `references` stays live. Commits only with a signature from each
/// of `required_signers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub thread_id: ThreadId,
    pub command: Command,
    pub inputs: Vec<RecordId>,
    pub references: Vec<RecordId>,
    pub outputs: Vec<Record>,
    pub required_signers: BTreeSet<Party>,
    pub created_at: DateTime<Utc>,
}

impl Transition {
    pub fn new(thread_id: ThreadId, command: Command, required_signers: BTreeSet<Party>) -> Self {
        Self {
            id: TransitionId::new(),
            thread_id,
            command,
            inputs: Vec::new(),
            references: Vec::new(),
            outputs: Vec::new(),
            required_signers,
            created_at: Utc::now(),
        }
    }

    pub fn consuming(mut self, inputs: impl IntoIterator<Item = RecordId>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn referencing(mut self, references: impl IntoIterator<Item = RecordId>) -> Self {
        self.references.extend(references);
        self
    }

    pub fn producing(mut self, outputs: impl IntoIterator<Item = Record>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    /// Hex SHA-256 over the canonical JSON encoding. This is what parties sign.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Every party holding a copy of any output. Finality is delivered to
    /// these parties.
    pub fn audience(&self) -> BTreeSet<Party> {
        let mut parties = self.required_signers.clone();
        for output in &self.outputs {
            parties.extend(output.participants());
        }
        parties
    }
}
