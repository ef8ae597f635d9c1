//! Rules for each kind of structural change.
//!
//! A change knows how to check itself against the current thread meta, who
//! must sign it, and what the thread looks like afterwards.

use std::collections::BTreeSet;

use concord_types::{Change, ChangeKind, Party, ThreadMetaRecord};

use crate::error::{Error, Result};

/// Build a change from raw action arguments, rejecting duplicates, overlap
/// between the two lists, and arguments that do not fit `kind`.
pub fn build_change(kind: ChangeKind, to_add: &[Party], to_remove: &[Party]) -> Result<Change> {
    let to_add = distinct("to_add", to_add)?;
    let to_remove = distinct("to_remove", to_remove)?;

    let change = match kind {
        ChangeKind::Close => {
            if !to_add.is_empty() || !to_remove.is_empty() {
                return Err(invalid("a close proposal names no parties"));
            }
            Change::Close
        }
        ChangeKind::AddParticipants | ChangeKind::RemoveParticipants => {
            Change::UpdateParticipants { to_add, to_remove }
        }
    };
    check_shape(kind, &change)?;
    Ok(change)
}

/// Per-kind behavior of a [`Change`].
pub trait ChangeRules {
    /// Check the change against the live meta before anything is committed.
    fn validate(&self, kind: ChangeKind, meta: &ThreadMetaRecord, initiator: &Party) -> Result<()>;

    /// Parties whose signatures the change needs. Parties being removed
    /// never sign their own removal.
    fn required_signers(&self, meta: &ThreadMetaRecord) -> BTreeSet<Party>;

    /// The meta that succeeds `meta`, or `None` when the change ends the
    /// thread.
    fn apply(&self, meta: &ThreadMetaRecord) -> Option<ThreadMetaRecord>;
}

impl ChangeRules for Change {
    fn validate(&self, kind: ChangeKind, meta: &ThreadMetaRecord, initiator: &Party) -> Result<()> {
        if !meta.is_active() {
            return Err(Error::ThreadClosed(meta.thread_id));
        }
        if !meta.is_member(initiator) {
            return Err(invalid(format!("{} is not a participant", initiator)));
        }
        check_shape(kind, self)?;

        let Self::UpdateParticipants { to_add, to_remove } = self else {
            return Ok(());
        };

        if to_remove.contains(initiator) {
            return Err(invalid("the initiator cannot remove themselves"));
        }
        if to_remove.contains(&meta.admin) {
            return Err(invalid(format!("{} is the thread admin and cannot be removed", meta.admin)));
        }
        if let Some(stranger) = to_remove.iter().find(|p| !meta.receivers.contains(*p)) {
            return Err(invalid(format!("{} is not a participant", stranger)));
        }
        if let Some(member) = to_add.iter().find(|p| meta.is_member(p)) {
            return Err(invalid(format!("{} is already a participant", member)));
        }
        Ok(())
    }

    fn required_signers(&self, meta: &ThreadMetaRecord) -> BTreeSet<Party> {
        match self {
            Self::Close => meta.roster(),
            Self::UpdateParticipants { to_remove, .. } => meta.roster().difference(to_remove).cloned().collect(),
        }
    }

    fn apply(&self, meta: &ThreadMetaRecord) -> Option<ThreadMetaRecord> {
        match self {
            Self::Close => None,
            Self::UpdateParticipants { to_add, to_remove } => {
                let receivers = meta
                    .receivers
                    .union(to_add)
                    .filter(|p| !to_remove.contains(*p))
                    .cloned()
                    .collect();
                Some(meta.successor(receivers))
            }
        }
    }
}

/// Structural checks that need no thread state.
fn check_shape(kind: ChangeKind, change: &Change) -> Result<()> {
    match (kind, change) {
        (ChangeKind::Close, Change::Close) => Ok(()),
        (ChangeKind::Close, _) | (_, Change::Close) => {
            Err(invalid(format!("change does not match kind {}", kind)))
        }
        (kind, Change::UpdateParticipants { to_add, to_remove }) => {
            if kind == ChangeKind::AddParticipants && to_add.is_empty() {
                return Err(invalid("add_participants needs at least one party to add"));
            }
            if kind == ChangeKind::RemoveParticipants && to_remove.is_empty() {
                return Err(invalid("remove_participants needs at least one party to remove"));
            }
            if let Some(both) = to_add.intersection(to_remove).next() {
                return Err(invalid(format!("{} is both added and removed", both)));
            }
            if to_add.iter().chain(to_remove).any(|p| p.as_str().trim().is_empty()) {
                return Err(invalid("party names must not be blank"));
            }
            Ok(())
        }
    }
}

fn distinct(field: &str, parties: &[Party]) -> Result<BTreeSet<Party>> {
    let mut set = BTreeSet::new();
    for party in parties {
        if !set.insert(party.clone()) {
            return Err(invalid(format!("{} appears twice in {}", party, field)));
        }
    }
    Ok(set)
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidActionArguments(reason.into())
}
