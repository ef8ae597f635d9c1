//! Quorum evaluation over a thread's live proposal records.
//!
//! The result depends only on the set of records, never on the order they
//! arrived in.

use std::collections::BTreeSet;

use thiserror::Error;

use concord_types::{Party, ProposalRecord};

/// The proposer counts as agreed the moment it proposes and never emits an
/// AGREED record of its own.
pub const PROPOSER_IMPLICITLY_AGREES: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    Pending,
    Complete,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuorumError {
    #[error("{0} live PROPOSED records for one thread")]
    MultipleProposals(usize),
}

/// Evaluate the live proposal records of one thread.
///
/// Rejected if any REJECTED record is live. Otherwise complete when the
/// single PROPOSED record's required signers, less the proposer, have all
/// agreed. No PROPOSED record at all is pending.
pub fn evaluate(records: &[ProposalRecord]) -> Result<Quorum, QuorumError> {
    let proposal = single_proposal(records)?;

    if records.iter().any(ProposalRecord::is_rejected) {
        return Ok(Quorum::Rejected);
    }
    let Some(proposal) = proposal else {
        return Ok(Quorum::Pending);
    };

    if agreed_signers(proposal, records).len() == needed_agreements(proposal) {
        Ok(Quorum::Complete)
    } else {
        Ok(Quorum::Pending)
    }
}

/// The one live PROPOSED record, if any.
pub fn single_proposal(records: &[ProposalRecord]) -> Result<Option<&ProposalRecord>, QuorumError> {
    let mut proposed = records.iter().filter(|r| r.is_proposed());
    let first = proposed.next();
    let extra = proposed.count();
    if extra > 0 {
        return Err(QuorumError::MultipleProposals(extra + 1));
    }
    Ok(first)
}

/// How many explicit AGREED records complete `proposal`.
pub fn needed_agreements(proposal: &ProposalRecord) -> usize {
    let implicit = PROPOSER_IMPLICITLY_AGREES && proposal.required_signers.contains(&proposal.proposer);
    proposal.required_signers.len() - usize::from(implicit)
}

/// Required signers, other than the proposer, with a live AGREED record for
/// `proposal`.
pub fn agreed_signers<'a>(proposal: &ProposalRecord, records: &'a [ProposalRecord]) -> BTreeSet<&'a Party> {
    records
        .iter()
        .filter(|r| r.is_agreed() && r.proposal_id == proposal.id)
        .flat_map(|r| r.agreed_signers.iter())
        .filter(|p| proposal.required_signers.contains(*p))
        .filter(|p| !(PROPOSER_IMPLICITLY_AGREES && **p == proposal.proposer))
        .collect()
}

/// Required signers still to agree.
pub fn missing_signers(proposal: &ProposalRecord, records: &[ProposalRecord]) -> BTreeSet<Party> {
    let agreed = agreed_signers(proposal, records);
    proposal
        .required_signers
        .iter()
        .filter(|p| !agreed.contains(p))
        .filter(|p| !(PROPOSER_IMPLICITLY_AGREES && **p == proposal.proposer))
        .cloned()
        .collect()
}
