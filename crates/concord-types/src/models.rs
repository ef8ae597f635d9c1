use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier minted once when a thread is created. Every record of the
/// thread carries it as the join key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(Uuid);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ThreadId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of one stored record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// A named participant. Ordered so rosters iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Party(String);

impl Party {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Party {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Closed,
}

/// Reference to an attached blob. Only the digest travels with the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    /// Hex-encoded SHA-256 of the blob.
    pub sha256: String,
}

/// One party's private copy of a chat message.
///
/// Messages never supersede each other. `message_id` is shared by every
/// private copy of the same message; `id` is unique per copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: RecordId,
    pub message_id: Uuid,
    pub thread_id: ThreadId,
    pub created_at: DateTime<Utc>,
    pub subject: String,
    pub sender: Party,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub visible_to: Party,
}

impl MessageRecord {
    /// Re-derive this message as a fresh private copy for `party`.
    pub fn copy_for(&self, party: &Party) -> Self {
        Self {
            id: RecordId::new(),
            visible_to: party.clone(),
            ..self.clone()
        }
    }
}

/// Roster and lifecycle of a thread. Superseded on every structural change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMetaRecord {
    pub id: RecordId,
    pub thread_id: ThreadId,
    pub created_at: DateTime<Utc>,
    pub admin: Party,
    pub receivers: BTreeSet<Party>,
    pub status: ThreadStatus,
}

impl ThreadMetaRecord {
    pub fn new(thread_id: ThreadId, admin: Party, receivers: BTreeSet<Party>) -> Self {
        Self {
            id: RecordId::new(),
            thread_id,
            created_at: Utc::now(),
            admin,
            receivers,
            status: ThreadStatus::Active,
        }
    }

    /// Admin plus receivers.
    pub fn roster(&self) -> BTreeSet<Party> {
        let mut roster = self.receivers.clone();
        roster.insert(self.admin.clone());
        roster
    }

    pub fn is_member(&self, party: &Party) -> bool {
        self.admin == *party || self.receivers.contains(party)
    }

    pub fn is_active(&self) -> bool {
        self.status == ThreadStatus::Active
    }

    /// Next version of this record with a new receiver set. The admin and
    /// thread id carry over unchanged.
    pub fn successor(&self, receivers: BTreeSet<Party>) -> Self {
        Self {
            id: RecordId::new(),
            thread_id: self.thread_id,
            created_at: Utc::now(),
            admin: self.admin.clone(),
            receivers,
            status: self.status,
        }
    }
}

/// The structural change a proposal asks for, as declared by the proposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Close,
    AddParticipants,
    RemoveParticipants,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::AddParticipants => "add_participants",
            Self::RemoveParticipants => "remove_participants",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    Close,
    UpdateParticipants {
        to_add: BTreeSet<Party>,
        to_remove: BTreeSet<Party>,
    },
}

impl Change {
    /// `to_add ∪ to_remove`; empty for a close.
    pub fn affected_parties(&self) -> BTreeSet<Party> {
        match self {
            Self::Close => BTreeSet::new(),
            Self::UpdateParticipants { to_add, to_remove } => {
                to_add.union(to_remove).cloned().collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Proposed,
    Agreed,
    Rejected,
}

/// One record of the propose/agree/reject protocol.
///
/// The PROPOSED record is the proposal itself and `proposal_id == id`. AGREED
/// and REJECTED records answer it and carry its id in `proposal_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: RecordId,
    pub proposal_id: RecordId,
    pub thread_id: ThreadId,
    pub proposer: Party,
    pub kind: ChangeKind,
    pub change: Change,
    pub required_signers: BTreeSet<Party>,
    pub agreed_signers: BTreeSet<Party>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

impl ProposalRecord {
    pub fn proposed(
        thread_id: ThreadId,
        proposer: Party,
        kind: ChangeKind,
        change: Change,
        required_signers: BTreeSet<Party>,
    ) -> Self {
        let id = RecordId::new();
        Self {
            id,
            proposal_id: id,
            thread_id,
            proposer,
            kind,
            change,
            required_signers,
            agreed_signers: BTreeSet::new(),
            status: ProposalStatus::Proposed,
            created_at: Utc::now(),
        }
    }

    /// The AGREED copy `responder` emits for this proposal.
    pub fn agreement(&self, responder: &Party) -> Self {
        self.answer(ProposalStatus::Agreed, BTreeSet::from([responder.clone()]))
    }

    /// The REJECTED marker `responder` emits for this proposal.
    pub fn rejection(&self, responder: &Party) -> Self {
        self.answer(ProposalStatus::Rejected, BTreeSet::from([responder.clone()]))
    }

    fn answer(&self, status: ProposalStatus, agreed_signers: BTreeSet<Party>) -> Self {
        Self {
            id: RecordId::new(),
            proposal_id: self.proposal_id,
            status,
            agreed_signers,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn affected_parties(&self) -> BTreeSet<Party> {
        self.change.affected_parties()
    }

    pub fn is_proposed(&self) -> bool {
        self.status == ProposalStatus::Proposed
    }

    pub fn is_agreed(&self) -> bool {
        self.status == ProposalStatus::Agreed
    }

    pub fn is_rejected(&self) -> bool {
        self.status == ProposalStatus::Rejected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Message,
    Meta,
    Proposal,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Meta => "meta",
            Self::Proposal => "proposal",
        }
    }

    /// Kinds with at most one live record per thread.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Self::Meta)
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "meta" => Ok(Self::Meta),
            "proposal" => Ok(Self::Proposal),
            other => Err(format!("unknown record kind: {}", other)),
        }
    }
}

/// Any record a transition can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Message(MessageRecord),
    Meta(ThreadMetaRecord),
    Proposal(ProposalRecord),
}

impl Record {
    pub fn id(&self) -> RecordId {
        match self {
            Self::Message(m) => m.id,
            Self::Meta(m) => m.id,
            Self::Proposal(p) => p.id,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        match self {
            Self::Message(m) => m.thread_id,
            Self::Meta(m) => m.thread_id,
            Self::Proposal(p) => p.thread_id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Message(_) => RecordKind::Message,
            Self::Meta(_) => RecordKind::Meta,
            Self::Proposal(_) => RecordKind::Proposal,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Message(m) => m.created_at,
            Self::Meta(m) => m.created_at,
            Self::Proposal(p) => p.created_at,
        }
    }

    /// Parties that keep a copy of this record in their own store.
    pub fn participants(&self) -> BTreeSet<Party> {
        match self {
            Self::Message(m) => BTreeSet::from([m.visible_to.clone()]),
            Self::Meta(m) => m.roster(),
            Self::Proposal(p) => {
                let mut parties = p.required_signers.clone();
                parties.insert(p.proposer.clone());
                parties
            }
        }
    }

    pub fn is_visible_to(&self, party: &Party) -> bool {
        self.participants().contains(party)
    }

    /// Uniqueness key the commit service enforces: no two live records may
    /// share one.
    pub fn singleton_key(&self) -> String {
        match self {
            // Copies are de-duplicated by each party's own store
            Self::Message(m) => format!("message:{}", m.id),
            Self::Meta(m) => format!("meta:{}", m.thread_id),
            Self::Proposal(p) => match p.status {
                ProposalStatus::Proposed => format!("proposed:{}", p.thread_id),
                ProposalStatus::Agreed => {
                    let responder = p
                        .agreed_signers
                        .iter()
                        .map(Party::as_str)
                        .collect::<Vec<_>>()
                        .join(",");
                    format!("agreed:{}:{}", p.proposal_id, responder)
                }
                ProposalStatus::Rejected => format!("rejected:{}", p.proposal_id),
            },
        }
    }
}

impl From<MessageRecord> for Record {
    fn from(record: MessageRecord) -> Self {
        Self::Message(record)
    }
}

impl From<ThreadMetaRecord> for Record {
    fn from(record: ThreadMetaRecord) -> Self {
        Self::Meta(record)
    }
}

impl From<ProposalRecord> for Record {
    fn from(record: ProposalRecord) -> Self {
        Self::Proposal(record)
    }
}

/// Typed access to one variant of [`Record`].
pub trait StoredRecord: Sized + Clone {
    const KIND: RecordKind;

    fn from_record(record: Record) -> Option<Self>;
    fn id(&self) -> RecordId;
    fn created_at(&self) -> DateTime<Utc>;
}

impl StoredRecord for MessageRecord {
    const KIND: RecordKind = RecordKind::Message;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Message(m) => Some(m),
            _ => None,
        }
    }

    fn id(&self) -> RecordId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl StoredRecord for ThreadMetaRecord {
    const KIND: RecordKind = RecordKind::Meta;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Meta(m) => Some(m),
            _ => None,
        }
    }

    fn id(&self) -> RecordId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl StoredRecord for ProposalRecord {
    const KIND: RecordKind = RecordKind::Proposal;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Proposal(p) => Some(p),
            _ => None,
        }
    }

    fn id(&self) -> RecordId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parties(names: &[&str]) -> BTreeSet<Party> {
        names.iter().map(|n| Party::from(*n)).collect()
    }

    #[test]
    fn roster_includes_admin() {
        let meta = ThreadMetaRecord::new(ThreadId::new(), "x".into(), parties(&["y", "z"]));
        assert_eq!(meta.roster(), parties(&["x", "y", "z"]));
        assert!(meta.is_member(&"x".into()));
        assert!(!meta.is_member(&"w".into()));
    }

    #[test]
    fn successor_keeps_admin_and_thread() {
        let meta = ThreadMetaRecord::new(ThreadId::new(), "x".into(), parties(&["y"]));
        let next = meta.successor(parties(&["y", "z"]));
        assert_eq!(next.thread_id, meta.thread_id);
        assert_eq!(next.admin, meta.admin);
        assert_ne!(next.id, meta.id);
        assert_eq!(next.receivers, parties(&["y", "z"]));
    }

    #[test]
    fn answers_point_at_the_proposal() {
        let proposal = ProposalRecord::proposed(
            ThreadId::new(),
            "y".into(),
            ChangeKind::AddParticipants,
            Change::UpdateParticipants {
                to_add: parties(&["z"]),
                to_remove: BTreeSet::new(),
            },
            parties(&["x", "y"]),
        );
        let agreed = proposal.agreement(&"x".into());
        assert_eq!(agreed.proposal_id, proposal.id);
        assert_eq!(agreed.agreed_signers, parties(&["x"]));
        assert!(agreed.is_agreed());
        assert_eq!(agreed.affected_parties(), parties(&["z"]));

        let rejected = proposal.rejection(&"x".into());
        assert!(rejected.is_rejected());
        assert_ne!(rejected.id, agreed.id);
    }

    #[test]
    fn singleton_keys_separate_agreements_by_responder() {
        let proposal = ProposalRecord::proposed(
            ThreadId::new(),
            "x".into(),
            ChangeKind::Close,
            Change::Close,
            parties(&["x", "y", "z"]),
        );
        let by_y = Record::from(proposal.agreement(&"y".into()));
        let by_y_again = Record::from(proposal.agreement(&"y".into()));
        let by_z = Record::from(proposal.agreement(&"z".into()));
        assert_eq!(by_y.singleton_key(), by_y_again.singleton_key());
        assert_ne!(by_y.singleton_key(), by_z.singleton_key());
    }

    #[test]
    fn record_json_is_tagged() {
        let meta = ThreadMetaRecord::new(ThreadId::new(), "x".into(), parties(&["y"]));
        let json = serde_json::to_value(Record::from(meta.clone())).unwrap();
        assert_eq!(json["record"], "meta");
        assert_eq!(json["status"], "active");
        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, Record::Meta(meta));
    }
}
