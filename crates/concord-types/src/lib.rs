//! Records, transitions and peer messages shared by every concord crate.

pub mod events;
pub mod models;
pub mod transition;

pub use events::{ChangeEvent, PartySignature, PeerNotice, PeerReply, PeerRequest};
pub use models::{
    Attachment, Change, ChangeKind, MessageRecord, Party, ProposalRecord, ProposalStatus, Record,
    RecordId, RecordKind, StoredRecord, ThreadId, ThreadMetaRecord, ThreadStatus,
};
pub use transition::{Command, Transition, TransitionId};
