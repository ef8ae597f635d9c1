//! Counterparty checks run before this party signs someone else's
//! transition. Each check works only from this party's own store.

use std::collections::BTreeSet;

use chrono::Utc;

use concord_types::{
    Change, ChangeKind, Command, Party, ProposalRecord, Record, RecordId, StoredRecord, Transition,
};

use crate::change::ChangeRules;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::validation::validate_message;

impl Node {
    /// Decide whether to sign `transition` on behalf of this party. The
    /// error is the refusal reason sent back to `from`.
    pub(crate) fn review(&self, from: &Party, transition: &Transition) -> std::result::Result<(), String> {
        let me = self.party();
        if !transition.required_signers.contains(me) {
            return Err(format!("{} is not a required signer", me));
        }
        if !transition.required_signers.contains(from) {
            return Err(format!("{} is not a required signer", from));
        }
        if self.is_halted(transition.thread_id) {
            return Err(format!("thread {} is halted", transition.thread_id));
        }
        if transition.outputs.iter().any(|o| o.thread_id() != transition.thread_id) {
            return Err("output belongs to another thread".into());
        }

        let verdict = match transition.command {
            Command::CreateThread => self.review_create(from, transition),
            Command::Propose { kind } => self.review_propose(from, kind, transition),
            Command::Agree => self.review_answer(from, transition, ProposalRecord::is_agreed),
            Command::Reject => self.review_answer(from, transition, ProposalRecord::is_rejected),
            Command::ConsumeProposal => self.review_consume(from, transition),
            Command::FinalizeClose => self.review_close(from, transition),
            Command::FinalizeParticipants => self.review_roster(from, transition),
            other => Err(refuse(format!("{} is never co-signed", other))),
        };
        verdict.map_err(|e| e.to_string())
    }

    fn review_create(&self, from: &Party, transition: &Transition) -> Result<()> {
        let metas: Vec<_> = transition
            .outputs
            .iter()
            .filter_map(|o| match o {
                Record::Meta(meta) => Some(meta),
                _ => None,
            })
            .collect();
        let [meta] = metas.as_slice() else {
            return Err(refuse("a new thread has exactly one meta record"));
        };

        if meta.admin != *from {
            return Err(refuse(format!("{} is not the admin of the new thread", from)));
        }
        if meta.receivers.contains(&meta.admin) || !meta.is_member(self.party()) {
            return Err(refuse("roster is malformed"));
        }
        if transition.required_signers != meta.roster() {
            return Err(refuse("every member must sign the new thread"));
        }
        if !transition.inputs.is_empty() || !transition.references.is_empty() {
            return Err(refuse("a new thread consumes nothing"));
        }

        let now = Utc::now();
        for output in &transition.outputs {
            match output {
                Record::Meta(_) => {}
                Record::Message(m) => {
                    if m.sender != *from || !meta.is_member(&m.visible_to) {
                        return Err(refuse("opening message is malformed"));
                    }
                    validate_message(m, transition.thread_id, self.config(), now).map_err(Error::InvalidMessage)?;
                }
                Record::Proposal(_) => return Err(refuse("a new thread carries no proposal")),
            }
        }
        Ok(())
    }

    fn review_propose(&self, from: &Party, kind: ChangeKind, transition: &Transition) -> Result<()> {
        let [Record::Proposal(proposal)] = transition.outputs.as_slice() else {
            return Err(refuse("expected exactly one proposal"));
        };
        if !proposal.is_proposed() || proposal.proposer != *from || proposal.kind != kind {
            return Err(refuse("proposal does not match the command"));
        }

        let meta = self.thread(transition.thread_id)?;
        if transition.references != [meta.id] {
            return Err(refuse("proposal is not based on the current thread state"));
        }
        proposal.change.validate(kind, &meta, from)?;

        let required = proposal.change.required_signers(&meta);
        if proposal.required_signers != required || transition.required_signers != required {
            return Err(refuse("required signers do not follow from the change"));
        }

        // Competing proposals are settled by the notary. Only stale proposal
        // records may be swept up.
        for input in &transition.inputs {
            if let Some((record, _)) = self.db().get_record(*input)? {
                if !matches!(record, Record::Proposal(ref p) if !p.is_proposed()) {
                    return Err(refuse(format!("{} may not be consumed by a proposal", input)));
                }
            }
        }
        Ok(())
    }

    /// AGREED and REJECTED records are co-signed by the responder and the
    /// proposer. This runs on the proposer's side.
    fn review_answer(&self, from: &Party, transition: &Transition, expected: fn(&ProposalRecord) -> bool) -> Result<()> {
        let [Record::Proposal(answer)] = transition.outputs.as_slice() else {
            return Err(refuse("expected exactly one answer"));
        };
        if !expected(answer) || answer.agreed_signers != BTreeSet::from([from.clone()]) {
            return Err(refuse("answer does not match the command"));
        }

        let Some(proposal) = self.live::<ProposalRecord>(answer.proposal_id)?.filter(ProposalRecord::is_proposed) else {
            return Err(refuse("unknown or settled proposal"));
        };
        if proposal.proposer != *self.party() {
            return Err(refuse("only the proposer co-signs an answer"));
        }
        if !proposal.required_signers.contains(from) || *from == proposal.proposer {
            return Err(refuse(format!("{} does not answer this proposal", from)));
        }
        if answer.thread_id != proposal.thread_id
            || answer.kind != proposal.kind
            || answer.change != proposal.change
            || answer.required_signers != proposal.required_signers
        {
            return Err(refuse("answer does not match the proposal"));
        }

        match transition.command {
            Command::Agree => {
                if !transition.inputs.is_empty() || transition.references != [proposal.id] {
                    return Err(refuse("an agreement only references the proposal"));
                }
            }
            _ => {
                if !transition.inputs.contains(&proposal.id) {
                    return Err(refuse("a rejection consumes the proposal"));
                }
                self.ensure_answers_only(transition, proposal.id)?;
            }
        }
        Ok(())
    }

    fn review_consume(&self, from: &Party, transition: &Transition) -> Result<()> {
        if !transition.outputs.is_empty() {
            return Err(refuse("consuming a proposal produces nothing"));
        }
        let proposal = self.consumed_proposal(from, transition)?;
        if !matches!(proposal.change, Change::UpdateParticipants { .. }) {
            return Err(refuse("not a participant update"));
        }
        self.ensure_answers_only(transition, proposal.id)?;
        self.ensure_agreed(&proposal, false)
    }

    fn review_close(&self, from: &Party, transition: &Transition) -> Result<()> {
        if !transition.outputs.is_empty() {
            return Err(refuse("closing produces nothing"));
        }
        let proposal = self.consumed_proposal(from, transition)?;
        if proposal.change != Change::Close {
            return Err(refuse("not a close proposal"));
        }
        let meta = self.thread(transition.thread_id)?;
        if !transition.inputs.contains(&meta.id) {
            return Err(refuse("closing must consume the thread meta"));
        }
        self.ensure_agreed(&proposal, false)
    }

    fn review_roster(&self, from: &Party, transition: &Transition) -> Result<()> {
        let [Record::Meta(next)] = transition.outputs.as_slice() else {
            return Err(refuse("expected exactly one successor meta"));
        };
        let meta = self.thread(transition.thread_id)?;
        if transition.inputs != [meta.id] || !transition.references.is_empty() {
            return Err(refuse("a roster update consumes exactly the current meta"));
        }

        // The proposal was consumed in the step before this one
        let settled = self
            .db()
            .records::<ProposalRecord>(transition.thread_id, true)?
            .into_iter()
            .filter(|p| p.is_proposed() && p.proposer == *from)
            .max_by_key(|p| p.created_at);
        let Some(proposal) = settled else {
            return Err(refuse("no proposal from the requester"));
        };
        if self.live::<ProposalRecord>(proposal.id)?.is_some() {
            return Err(refuse("the proposal has not been consumed yet"));
        }
        if transition.required_signers != proposal.required_signers {
            return Err(refuse("signers differ from the proposal"));
        }

        let Some(expected) = proposal.change.apply(&meta) else {
            return Err(refuse("the proposal does not update participants"));
        };
        if next.receivers != expected.receivers || next.admin != meta.admin || next.status != meta.status {
            return Err(refuse("successor meta does not follow from the proposal"));
        }
        self.ensure_agreed(&proposal, true)
    }

    /// The live PROPOSED record among the inputs, initiated by `from`.
    fn consumed_proposal(&self, from: &Party, transition: &Transition) -> Result<ProposalRecord> {
        for input in &transition.inputs {
            if let Some(proposal) = self.live::<ProposalRecord>(*input)?.filter(ProposalRecord::is_proposed) {
                if proposal.proposer != *from {
                    return Err(refuse(format!("{} did not initiate this proposal", from)));
                }
                if transition.required_signers != proposal.required_signers {
                    return Err(refuse("signers differ from the proposal"));
                }
                return Ok(proposal);
            }
        }
        Err(refuse("no outstanding proposal among the inputs"))
    }

    /// Every proposal record among the inputs answers `proposal_id`.
    fn ensure_answers_only(&self, transition: &Transition, proposal_id: RecordId) -> Result<()> {
        for input in &transition.inputs {
            match self.db().get_record(*input)? {
                Some((Record::Proposal(p), _)) if p.proposal_id != proposal_id => {
                    return Err(refuse(format!("{} belongs to another proposal", input)));
                }
                Some((Record::Proposal(_), _)) | None => {}
                Some(_) => return Err(refuse(format!("{} is not a proposal record", input))),
            }
        }
        Ok(())
    }

    /// This party's own AGREED record for `proposal` exists. Each signer
    /// holds its own agreement, so the check needs nobody else's state.
    fn ensure_agreed(&self, proposal: &ProposalRecord, include_consumed: bool) -> Result<()> {
        let me = self.party();
        let agreed = self
            .db()
            .records::<ProposalRecord>(proposal.thread_id, include_consumed)?
            .iter()
            .any(|r| r.is_agreed() && r.proposal_id == proposal.id && r.agreed_signers.contains(me));
        if agreed {
            Ok(())
        } else {
            Err(refuse(format!("{} has not agreed to this proposal", me)))
        }
    }

    /// A record of type `T` that is live in this party's store.
    fn live<T: StoredRecord>(&self, id: RecordId) -> Result<Option<T>> {
        Ok(match self.db().get_record(id)? {
            Some((record, false)) => T::from_record(record),
            _ => None,
        })
    }
}

fn refuse(reason: impl Into<String>) -> Error {
    Error::InvalidActionArguments(reason.into())
}
