use std::fmt;

use concord_types::ProposalRecord;

use crate::quorum::{self, Quorum, QuorumError};

/// Where a thread stands in the propose/agree/finalize cycle, as seen from
/// one party's store.
///
/// `Done` and `Void` are not observable: once finalization or a fresh
/// proposal consumes the records, the thread reads as `Idle` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalPhase {
    Idle,
    Proposed,
    Agreed { agreed: usize, needed: usize },
    Finalizing,
    Rejected,
}

impl ProposalPhase {
    /// Derive the phase from live proposal records. `finalizing` is set while
    /// this party is running the proposer's finalization.
    pub fn derive(records: &[ProposalRecord], finalizing: bool) -> Result<Self, QuorumError> {
        let proposal = quorum::single_proposal(records)?;
        if finalizing {
            return Ok(Self::Finalizing);
        }

        match (quorum::evaluate(records)?, proposal) {
            (Quorum::Rejected, _) => Ok(Self::Rejected),
            (_, None) if records.iter().any(ProposalRecord::is_agreed) => {
                // Agreements whose proposal this store has not seen yet
                Ok(Self::Agreed { agreed: 0, needed: 0 })
            }
            (_, None) => Ok(Self::Idle),
            (_, Some(proposal)) => {
                let agreed = quorum::agreed_signers(proposal, records).len();
                if agreed == 0 {
                    Ok(Self::Proposed)
                } else {
                    Ok(Self::Agreed {
                        agreed,
                        needed: quorum::needed_agreements(proposal),
                    })
                }
            }
        }
    }

    /// A new proposal may start from here. A live REJECTED marker is voided
    /// by the next proposal.
    pub fn accepts_new_proposal(&self) -> bool {
        matches!(self, Self::Idle | Self::Rejected)
    }
}

impl fmt::Display for ProposalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Proposed => f.write_str("proposed"),
            Self::Agreed { agreed, needed } => write!(f, "agreed({}/{})", agreed, needed),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{Change, ChangeKind, Party, ThreadId};

    fn proposal() -> ProposalRecord {
        ProposalRecord::proposed(
            ThreadId::new(),
            Party::from("x"),
            ChangeKind::Close,
            Change::Close,
            ["x", "y", "z"].into_iter().map(Party::from).collect(),
        )
    }

    #[test]
    fn walks_through_the_cycle() {
        let proposal = proposal();
        let y = proposal.agreement(&"y".into());
        let z = proposal.agreement(&"z".into());

        assert_eq!(ProposalPhase::derive(&[], false), Ok(ProposalPhase::Idle));
        assert_eq!(ProposalPhase::derive(&[proposal.clone()], false), Ok(ProposalPhase::Proposed));
        assert_eq!(
            ProposalPhase::derive(&[proposal.clone(), y.clone()], false),
            Ok(ProposalPhase::Agreed { agreed: 1, needed: 2 })
        );
        assert_eq!(
            ProposalPhase::derive(&[proposal.clone(), y, z], true),
            Ok(ProposalPhase::Finalizing)
        );
    }

    #[test]
    fn only_idle_or_rejected_accept_a_new_proposal() {
        let proposal = proposal();
        let rejected = ProposalPhase::derive(&[proposal.rejection(&"y".into())], false).unwrap();
        assert_eq!(rejected, ProposalPhase::Rejected);
        assert!(rejected.accepts_new_proposal());
        assert!(!ProposalPhase::derive(&[proposal], false).unwrap().accepts_new_proposal());
    }

    #[test]
    fn orphan_agreement_blocks_new_proposals() {
        let orphan = proposal().agreement(&"y".into());
        let phase = ProposalPhase::derive(&[orphan], false).unwrap();
        assert!(!phase.accepts_new_proposal());
        assert_eq!(phase.to_string(), "agreed(0/0)");
    }
}
