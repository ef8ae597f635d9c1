//! Finalization: applying a fully agreed proposal to the thread.

use std::collections::BTreeSet;

use futures_util::future::join;
use tracing::{error, info, warn};

use concord_types::{Change, Command, MessageRecord, Party, PeerNotice, ProposalRecord, ThreadId, ThreadMetaRecord, Transition};

use crate::change::ChangeRules;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::quorum::{self, Quorum};

impl Node {
    /// Finalize whatever the outstanding, fully agreed proposal asks for.
    pub async fn finalize(&self, thread_id: ThreadId) -> Result<()> {
        let records = self.proposals(thread_id)?;
        let proposal = self
            .outstanding(thread_id, &records)?
            .ok_or(Error::NotQuorate(thread_id))?;
        match proposal.change {
            Change::Close => self.finalize_close(thread_id).await,
            Change::UpdateParticipants { .. } => self.finalize_participant_update(thread_id).await.map(|_| ()),
        }
    }

    /// End the thread. One transition consumes the meta, every proposal
    /// record and the proposer's messages; each other member drops its own
    /// copies when the finality notice arrives.
    pub async fn finalize_close(&self, thread_id: ThreadId) -> Result<()> {
        let _session = self.session(thread_id).await;
        self.ensure_not_halted(thread_id)?;
        let _finalizing = self.begin_finalizing(thread_id);

        let (proposal, records) = self.quorate_proposal(thread_id)?;
        if proposal.change != Change::Close {
            return Err(Error::InvalidActionArguments(format!(
                "the proposal on thread {} is not a close",
                thread_id
            )));
        }

        let meta = self.thread(thread_id)?;
        let messages: Vec<MessageRecord> = self.messages(thread_id)?;
        let inputs = messages
            .iter()
            .map(|m| m.id)
            .chain([meta.id])
            .chain(records.iter().map(|r| r.id));
        let transition =
            Transition::new(thread_id, Command::FinalizeClose, proposal.required_signers.clone()).consuming(inputs);

        self.commit(transition).await?;
        info!("{}: closed thread {}", self.party(), thread_id);
        Ok(())
    }

    /// Apply an agreed participant update in four steps: consume the
    /// proposal records, shut removed parties out and backfill added ones
    /// concurrently, then replace the meta. The steps are not atomic as a
    /// whole; a failure after the first leaves the proposal consumed.
    pub async fn finalize_participant_update(&self, thread_id: ThreadId) -> Result<ThreadMetaRecord> {
        let _session = self.session(thread_id).await;
        self.ensure_not_halted(thread_id)?;
        let _finalizing = self.begin_finalizing(thread_id);

        let (proposal, records) = self.quorate_proposal(thread_id)?;
        let Change::UpdateParticipants { to_add, to_remove } = &proposal.change else {
            return Err(Error::InvalidActionArguments(format!(
                "the proposal on thread {} does not update participants",
                thread_id
            )));
        };

        let meta = self.thread(thread_id)?;
        let successor = proposal.change.apply(&meta).ok_or_else(|| {
            Error::InvalidActionArguments("participant update produced no successor".into())
        })?;

        let consume = Transition::new(thread_id, Command::ConsumeProposal, proposal.required_signers.clone())
            .consuming(records.iter().map(|r| r.id))
            .referencing([meta.id]);
        self.commit(consume).await?;

        let ((), backfill) = join(self.shut_out(thread_id, to_remove), self.backfill(thread_id, to_add)).await;
        match backfill {
            Ok(report) if !report.failed.is_empty() => {
                warn!("{}: backfill on thread {} missed {:?}", self.party(), thread_id, report.failed);
            }
            Ok(_) => {}
            Err(e) => warn!("{}: backfill on thread {} failed: {}", self.party(), thread_id, e),
        }

        let replace = Transition::new(thread_id, Command::FinalizeParticipants, proposal.required_signers.clone())
            .consuming([meta.id])
            .producing([successor.clone().into()]);
        if let Err(e) = self.commit(replace).await {
            error!(
                "{}: proposal on thread {} consumed but roster not updated: {}",
                self.party(),
                thread_id,
                e
            );
            return Err(e);
        }

        info!(
            "{}: thread {} now has {} receiver(s) (+{} -{})",
            self.party(),
            thread_id,
            successor.receivers.len(),
            to_add.len(),
            to_remove.len()
        );
        Ok(successor)
    }

    /// The outstanding proposal and its answers, if this party proposed it
    /// and every required signer has agreed.
    fn quorate_proposal(&self, thread_id: ThreadId) -> Result<(ProposalRecord, Vec<ProposalRecord>)> {
        let records = self.proposals(thread_id)?;
        let proposal = self
            .outstanding(thread_id, &records)?
            .ok_or(Error::NotQuorate(thread_id))?;

        if proposal.proposer != *self.party() {
            return Err(Error::NotProposer {
                thread_id,
                party: self.party().clone(),
            });
        }
        let verdict = quorum::evaluate(&records).map_err(|e| self.halt(thread_id, e.to_string()))?;
        if verdict != Quorum::Complete {
            return Err(Error::NotQuorate(thread_id));
        }
        Ok((proposal, records))
    }

    /// Tell each removed party to tombstone its copy of the thread.
    async fn shut_out(&self, thread_id: ThreadId, removed: &BTreeSet<Party>) {
        let notice = PeerNotice::Shutdown {
            thread_id,
            from: self.party().clone(),
        };
        for party in removed {
            if let Err(e) = self.notify(party, &notice).await {
                warn!("{}: shutdown for thread {} not delivered to {}: {}", self.party(), thread_id, party, e);
            }
        }
    }
}
