//! The propose / agree / reject half of the protocol.

use std::collections::BTreeSet;

use tracing::info;

use concord_types::{ChangeKind, Command, Party, ProposalRecord, ThreadId, Transition};

use crate::change::{ChangeRules, build_change};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::phase::ProposalPhase;
use crate::quorum;

impl Node {
    /// Open a proposal on `thread_id`. The change is checked in full before
    /// anything is committed. Any REJECTED marker or orphaned answer left by
    /// an earlier proposal is swept up by the same transition.
    pub async fn propose(
        &self,
        thread_id: ThreadId,
        kind: ChangeKind,
        to_add: &[Party],
        to_remove: &[Party],
    ) -> Result<ProposalRecord> {
        let change = build_change(kind, to_add, to_remove)?;

        let _session = self.session(thread_id).await;
        self.ensure_not_halted(thread_id)?;
        let me = self.party().clone();
        let meta = self.thread(thread_id)?;
        change.validate(kind, &meta, &me)?;

        let records = self.proposals(thread_id)?;
        let phase = ProposalPhase::derive(&records, self.is_finalizing(thread_id))
            .map_err(|e| self.halt(thread_id, e.to_string()))?;
        if !phase.accepts_new_proposal() {
            return Err(Error::ProposalAlreadyOutstanding(thread_id));
        }

        let required = change.required_signers(&meta);
        let proposal = ProposalRecord::proposed(thread_id, me.clone(), kind, change, required.clone());
        let transition = Transition::new(thread_id, Command::Propose { kind }, required)
            .consuming(records.iter().map(|r| r.id))
            .referencing([meta.id])
            .producing([proposal.clone().into()]);

        self.commit(transition).await?;
        info!(
            "{}: proposed {} on thread {} ({} signer(s))",
            me,
            kind,
            thread_id,
            proposal.required_signers.len()
        );

        if self.config().auto_finalize && quorum::needed_agreements(&proposal) == 0 {
            self.spawn_finalize(thread_id);
        }
        Ok(proposal)
    }

    /// Agree to the outstanding proposal. Agreeing twice returns the
    /// existing agreement without committing anything.
    pub async fn agree(&self, thread_id: ThreadId) -> Result<ProposalRecord> {
        let _session = self.session(thread_id).await;
        self.ensure_not_halted(thread_id)?;
        let me = self.party().clone();

        let records = self.proposals(thread_id)?;
        let proposal = self
            .outstanding(thread_id, &records)?
            .ok_or(Error::NoOutstandingProposal(thread_id))?;

        if proposal.proposer == me {
            return Err(Error::AlreadyAgreed { thread_id, party: me });
        }
        if !proposal.required_signers.contains(&me) {
            return Err(Error::NotASigner { thread_id, party: me });
        }
        if let Some(existing) = own_agreement(&records, &proposal, &me) {
            return Ok(existing.clone());
        }

        let agreement = proposal.agreement(&me);
        let transition = Transition::new(thread_id, Command::Agree, BTreeSet::from([me.clone(), proposal.proposer.clone()]))
            .referencing([proposal.id])
            .producing([agreement.clone().into()]);

        match self.commit(transition).await {
            Ok(_) => {
                info!("{}: agreed to {} on thread {}", me, proposal.kind, thread_id);
                Ok(agreement)
            }
            Err(conflict @ Error::CommitConflict { .. }) => {
                // A duplicate delivery may have committed ours already
                let records = self.proposals(thread_id)?;
                own_agreement(&records, &proposal, &me).cloned().ok_or(conflict)
            }
            Err(e) => Err(e),
        }
    }

    /// Reject the outstanding proposal. The rejection consumes the proposal
    /// and every agreement to it, leaving a REJECTED marker that the next
    /// proposal clears.
    pub async fn reject(&self, thread_id: ThreadId) -> Result<ProposalRecord> {
        let _session = self.session(thread_id).await;
        self.ensure_not_halted(thread_id)?;
        let me = self.party().clone();

        let records = self.proposals(thread_id)?;
        let proposal = self
            .outstanding(thread_id, &records)?
            .ok_or(Error::NothingToReject(thread_id))?;

        if !proposal.required_signers.contains(&me) {
            return Err(Error::NotASigner { thread_id, party: me });
        }
        if proposal.proposer == me || own_agreement(&records, &proposal, &me).is_some() {
            return Err(Error::AlreadyAgreed { thread_id, party: me });
        }

        let rejection = proposal.rejection(&me);
        let answers = records
            .iter()
            .filter(|r| r.is_agreed() && r.proposal_id == proposal.id)
            .map(|r| r.id);
        let transition = Transition::new(thread_id, Command::Reject, BTreeSet::from([me.clone(), proposal.proposer.clone()]))
            .consuming(std::iter::once(proposal.id).chain(answers))
            .producing([rejection.clone().into()]);

        self.commit(transition).await?;
        info!("{}: rejected {} on thread {}", me, proposal.kind, thread_id);
        Ok(rejection)
    }

    /// The single live PROPOSED record. Several halt the thread.
    pub(crate) fn outstanding(&self, thread_id: ThreadId, records: &[ProposalRecord]) -> Result<Option<ProposalRecord>> {
        quorum::single_proposal(records)
            .map(|p| p.cloned())
            .map_err(|e| self.halt(thread_id, e.to_string()))
    }
}

fn own_agreement<'a>(records: &'a [ProposalRecord], proposal: &ProposalRecord, me: &Party) -> Option<&'a ProposalRecord> {
    records
        .iter()
        .find(|r| r.is_agreed() && r.proposal_id == proposal.id && r.agreed_signers.contains(me))
}
