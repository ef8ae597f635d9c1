//! One party's protocol node.
//!
//! A node owns the party's signing key and local store. It drives the
//! operations this party initiates and answers the signature requests and
//! notices other parties send it. Initiated operations on one thread are
//! serialized by a per-thread session lock. Answering a request never takes
//! that lock, so two parties can be mid-operation and still sign for each
//! other.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use concord_crypto::{PartyKey, sign_digest};
use concord_db::{Applied, Database};
use concord_gateway::{Dispatcher, PeerHandler, run_mailbox};
use concord_notary::{CommitOutcome, CommitService};
use concord_types::{
    ChangeEvent, Command, Party, PartySignature, PeerNotice, PeerReply, PeerRequest, ProposalRecord, Record,
    ThreadId, ThreadMetaRecord, Transition,
};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::head::resolve_head;
use crate::notifier::{ChangeObserver, Notifier};
use crate::phase::ProposalPhase;
use crate::quorum::{self, Quorum};

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    party: Party,
    key: PartyKey,
    db: Database,
    notary: Arc<dyn CommitService>,
    dispatcher: Dispatcher,
    notifier: Notifier,
    config: EngineConfig,

    /// thread -> lock held while this party runs one of its own operations
    sessions: Mutex<HashMap<ThreadId, Arc<AsyncMutex<()>>>>,

    /// threads this party is finalizing right now
    finalizing: Mutex<HashSet<ThreadId>>,

    /// thread -> why it was halted
    halted: Mutex<HashMap<ThreadId, String>>,

    /// mailbox registration, set by `start`
    conn_id: Mutex<Option<Uuid>>,
}

impl Node {
    pub fn new(
        party: Party,
        key: PartyKey,
        db: Database,
        notary: Arc<dyn CommitService>,
        dispatcher: Dispatcher,
        config: EngineConfig,
    ) -> Self {
        notary.register_party(party.clone(), key);
        Self {
            inner: Arc::new(NodeInner {
                party,
                key,
                db,
                notary,
                dispatcher,
                notifier: Notifier::new(),
                config,
                sessions: Mutex::new(HashMap::new()),
                finalizing: Mutex::new(HashSet::new()),
                halted: Mutex::new(HashMap::new()),
                conn_id: Mutex::new(None),
            }),
        }
    }

    /// Open this party's mailbox and start answering peers.
    pub async fn start(&self) -> JoinHandle<()> {
        let (conn_id, mailbox) = self.inner.dispatcher.register(self.inner.party.clone()).await;
        *guard(&self.inner.conn_id) = Some(conn_id);
        info!("{} online", self.inner.party);
        tokio::spawn(run_mailbox(self.inner.party.clone(), mailbox, self.clone()))
    }

    /// Close the mailbox. The task returned by `start` ends once it drains.
    pub async fn stop(&self) {
        let conn_id = guard(&self.inner.conn_id).take();
        if let Some(conn_id) = conn_id {
            self.inner.dispatcher.unregister(&self.inner.party, conn_id).await;
            info!("{} offline", self.inner.party);
        }
    }

    pub fn party(&self) -> &Party {
        &self.inner.party
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn register_observer(&self, observer: Arc<dyn ChangeObserver>) {
        self.inner.notifier.register(observer);
    }

    pub(crate) fn db(&self) -> &Database {
        &self.inner.db
    }

    // -- Reads --

    /// Current meta of a thread.
    pub fn thread(&self, thread_id: ThreadId) -> Result<ThreadMetaRecord> {
        Ok(resolve_head::<ThreadMetaRecord>(&self.inner.db, thread_id)?.into_inner())
    }

    /// Live proposal records of a thread.
    pub fn proposals(&self, thread_id: ThreadId) -> Result<Vec<ProposalRecord>> {
        Ok(self.inner.db.records(thread_id, false)?)
    }

    /// Quorum state of the thread's outstanding proposal. More than one live
    /// PROPOSED record halts the thread.
    pub fn evaluate(&self, thread_id: ThreadId) -> Result<Quorum> {
        let records = self.proposals(thread_id)?;
        quorum::evaluate(&records).map_err(|e| self.halt(thread_id, e.to_string()))
    }

    pub fn phase(&self, thread_id: ThreadId) -> Result<ProposalPhase> {
        let records = self.proposals(thread_id)?;
        ProposalPhase::derive(&records, self.is_finalizing(thread_id)).map_err(|e| self.halt(thread_id, e.to_string()))
    }

    // -- Halting --

    pub fn is_halted(&self, thread_id: ThreadId) -> bool {
        guard(&self.inner.halted).contains_key(&thread_id)
    }

    /// Let protocol work resume on a halted thread. Returns whether it was
    /// halted.
    pub fn clear_halt(&self, thread_id: ThreadId) -> bool {
        let cleared = guard(&self.inner.halted).remove(&thread_id);
        if let Some(reason) = &cleared {
            info!("{}: halt on thread {} cleared (was: {})", self.inner.party, thread_id, reason);
        }
        cleared.is_some()
    }

    pub(crate) fn halt(&self, thread_id: ThreadId, reason: String) -> Error {
        error!("{}: halting thread {}: {}", self.inner.party, thread_id, reason);
        guard(&self.inner.halted).insert(thread_id, reason.clone());
        Error::InvariantViolation { thread_id, reason }
    }

    pub(crate) fn ensure_not_halted(&self, thread_id: ThreadId) -> Result<()> {
        if self.is_halted(thread_id) {
            return Err(Error::ThreadHalted(thread_id));
        }
        Ok(())
    }

    // -- Sessions --

    pub(crate) async fn session(&self, thread_id: ThreadId) -> OwnedMutexGuard<()> {
        let lock = guard(&self.inner.sessions).entry(thread_id).or_default().clone();
        lock.lock_owned().await
    }

    pub fn is_finalizing(&self, thread_id: ThreadId) -> bool {
        guard(&self.inner.finalizing).contains(&thread_id)
    }

    pub(crate) fn begin_finalizing(&self, thread_id: ThreadId) -> Finalizing {
        guard(&self.inner.finalizing).insert(thread_id);
        Finalizing {
            node: self.clone(),
            thread_id,
        }
    }

    // -- Commit --

    /// Collect every required signature, submit to the notary, record the
    /// result locally and tell everyone else holding a copy.
    pub(crate) async fn commit(&self, transition: Transition) -> Result<Applied> {
        let signatures = self.collect_signatures(&transition).await?;

        match self.inner.notary.submit(&transition, &signatures) {
            CommitOutcome::Committed(_) => {}
            CommitOutcome::Conflict { record } => {
                debug!("{}: {} lost the race for {}", self.inner.party, transition.command, record);
                return Err(Error::CommitConflict {
                    thread_id: transition.thread_id,
                    record,
                });
            }
            CommitOutcome::Rejected(reason) => return Err(Error::CommitRejected(reason)),
        }

        let applied = self.record(&transition)?;
        self.distribute(&transition, &signatures).await;
        Ok(applied)
    }

    pub(crate) fn sign(&self, transition: &Transition) -> Result<PartySignature> {
        let digest = transition.digest().map_err(anyhow::Error::from)?;
        Ok(PartySignature {
            party: self.inner.party.clone(),
            signature: sign_digest(&self.inner.key, &digest)?,
        })
    }

    async fn collect_signatures(&self, transition: &Transition) -> Result<Vec<PartySignature>> {
        let request = PeerRequest::Sign {
            transition: transition.clone(),
        };

        let pending = transition.required_signers.iter().map(|signer| {
            let request = &request;
            async move {
                if *signer == self.inner.party {
                    return self.sign(transition);
                }
                match self.inner.dispatcher.request(&self.inner.party, signer, request).await? {
                    PeerReply::Signed(signature) if signature.party == *signer => Ok(signature),
                    PeerReply::Signed(signature) => Err(Error::SignatureRefused {
                        party: signer.clone(),
                        reason: format!("reply was signed by {}", signature.party),
                    }),
                    PeerReply::Refused { reason } => Err(Error::SignatureRefused {
                        party: signer.clone(),
                        reason,
                    }),
                }
            }
        });

        join_all(pending).await.into_iter().collect()
    }

    /// Apply a committed transition to this party's store and publish the
    /// change. A transition already recorded publishes nothing.
    fn record(&self, transition: &Transition) -> Result<Applied> {
        let mut applied = self.inner.db.apply_transition(transition, &self.inner.party)?;
        if applied.duplicate {
            return Ok(applied);
        }

        if transition.command == Command::FinalizeClose {
            // Each party drops its own private copies
            applied.consumed.extend(self.inner.db.tombstone_thread(transition.thread_id)?);
        }

        debug!(
            "{}: recorded {} {} (+{} -{})",
            self.inner.party,
            transition.command,
            transition.id,
            applied.produced.len(),
            applied.consumed.len()
        );
        self.inner.notifier.publish(ChangeEvent::from_transition(
            transition,
            applied.produced.clone(),
            applied.consumed.clone(),
        ));
        Ok(applied)
    }

    async fn distribute(&self, transition: &Transition, signatures: &[PartySignature]) {
        let notice = PeerNotice::Finality {
            transition: transition.clone(),
            signatures: signatures.to_vec(),
        };
        for party in transition.audience() {
            if party == self.inner.party {
                continue;
            }
            if let Err(e) = self.inner.dispatcher.notify(&self.inner.party, &party, &notice).await {
                warn!(
                    "{}: finality of {} not delivered to {}: {}",
                    self.inner.party, transition.id, party, e
                );
            }
        }
    }

    pub(crate) async fn notify(&self, to: &Party, notice: &PeerNotice) -> Result<()> {
        Ok(self.inner.dispatcher.notify(&self.inner.party, to, notice).await?)
    }

    // -- Inbound --

    fn on_finality(&self, from: &Party, transition: Transition) -> Result<()> {
        if !self.inner.notary.is_committed(transition.id) {
            return Err(Error::CommitRejected(format!(
                "{} from {} was never committed",
                transition.id, from
            )));
        }

        let applied = self.record(&transition)?;
        if applied.duplicate {
            return Ok(());
        }

        let completes_mine = applied.produced.iter().any(|record| {
            matches!(record, Record::Proposal(p) if p.is_agreed() && p.proposer == self.inner.party)
        });
        if completes_mine && self.inner.config.auto_finalize {
            self.spawn_finalize(transition.thread_id);
        }
        Ok(())
    }

    /// Drop a thread this party was removed from. The notice is trusted, not
    /// verified: any current member sending in its own name is believed, and
    /// no committed proposal is checked behind it.
    fn on_shutdown(&self, from: &Party, thread_id: ThreadId, remover: &Party) -> Result<()> {
        if from != remover {
            return Err(Error::InvalidActionArguments(format!(
                "shutdown signed as {} but sent by {}",
                remover, from
            )));
        }
        let meta = self.thread(thread_id)?;
        if !meta.is_member(remover) {
            return Err(Error::InvalidActionArguments(format!(
                "{} is not a participant of thread {}",
                remover, thread_id
            )));
        }

        let consumed = self.inner.db.tombstone_thread(thread_id)?;
        info!("{}: removed from thread {} by {}", self.inner.party, thread_id, remover);
        self.inner.notifier.publish(ChangeEvent {
            command: Command::Shutdown,
            thread_id,
            transition_id: None,
            produced: Vec::new(),
            consumed,
        });
        Ok(())
    }

    /// Finalize in the background once the outstanding proposal is complete.
    pub(crate) fn spawn_finalize(&self, thread_id: ThreadId) {
        let node = self.clone();
        tokio::spawn(async move { node.finalize_when_quorate(thread_id).await });
    }

    async fn finalize_when_quorate(&self, thread_id: ThreadId) {
        match self.evaluate(thread_id) {
            Ok(Quorum::Complete) if !self.is_finalizing(thread_id) => {
                info!("{}: proposal on thread {} is fully agreed", self.inner.party, thread_id);
                if let Err(e) = self.finalize(thread_id).await {
                    warn!("{}: finalizing thread {} failed: {}", self.inner.party, thread_id, e);
                }
            }
            Ok(Quorum::Pending) => self.log_waiting(thread_id),
            Ok(_) => {}
            Err(e) => warn!("{}: cannot evaluate thread {}: {}", self.inner.party, thread_id, e),
        }
    }

    fn log_waiting(&self, thread_id: ThreadId) {
        let Ok(records) = self.proposals(thread_id) else { return };
        if let Ok(Some(proposal)) = quorum::single_proposal(&records) {
            let missing = quorum::missing_signers(proposal, &records);
            debug!(
                "{}: proposal on thread {} still waits on {:?}",
                self.inner.party, thread_id, missing
            );
        }
    }
}

impl PeerHandler for Node {
    async fn on_notice(&self, from: Party, notice: PeerNotice) {
        let thread_id = notice.thread_id();
        let label = notice.label();

        let outcome = match notice {
            PeerNotice::Finality { transition, .. } => self.on_finality(&from, transition),
            PeerNotice::Shutdown { thread_id, from: remover } => self.on_shutdown(&from, thread_id, &remover),
            PeerNotice::Backfill {
                thread_id,
                from: sender,
                messages,
            } => {
                if sender == from {
                    self.adopt_history(thread_id, &sender, messages).await.map(|_| ())
                } else {
                    Err(Error::InvalidActionArguments(format!(
                        "backfill labelled {} but sent by {}",
                        sender, from
                    )))
                }
            }
        };

        if let Err(e) = outcome {
            warn!(
                "{}: {} from {} for thread {} dropped: {}",
                self.inner.party, label, from, thread_id, e
            );
        }
    }

    async fn on_request(&self, from: Party, request: PeerRequest) -> PeerReply {
        match request {
            PeerRequest::Sign { transition } => {
                if let Err(reason) = self.review(&from, &transition) {
                    info!(
                        "{}: refusing to sign {} for {}: {}",
                        self.inner.party, transition.command, from, reason
                    );
                    return PeerReply::Refused { reason };
                }
                match self.sign(&transition) {
                    Ok(signature) => PeerReply::Signed(signature),
                    Err(e) => PeerReply::Refused { reason: e.to_string() },
                }
            }
        }
    }
}

/// Marks a thread as finalizing for as long as it is held.
pub(crate) struct Finalizing {
    node: Node,
    thread_id: ThreadId,
}

impl Drop for Finalizing {
    fn drop(&mut self) {
        guard(&self.node.inner.finalizing).remove(&self.thread_id);
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use concord_crypto::generate_party_key;
    use concord_notary::LocalNotary;
    use concord_types::{Change, ChangeKind};

    fn lone_node(name: &str) -> Node {
        Node::new(
            Party::from(name),
            generate_party_key(),
            Database::open_in_memory().unwrap(),
            Arc::new(LocalNotary::new()),
            Dispatcher::new(Duration::from_millis(100)),
            EngineConfig::default(),
        )
    }

    fn close(thread_id: ThreadId, proposer: &str) -> ProposalRecord {
        ProposalRecord::proposed(
            thread_id,
            Party::from(proposer),
            ChangeKind::Close,
            Change::Close,
            BTreeSet::from([Party::from("x"), Party::from("y")]),
        )
    }

    #[tokio::test]
    async fn two_live_proposals_halt_the_thread() {
        let node = lone_node("x");
        let thread_id = ThreadId::new();
        let meta = ThreadMetaRecord::new(thread_id, Party::from("x"), BTreeSet::from([Party::from("y")]));
        node.db().insert_record(&meta.into()).unwrap();
        node.db().insert_record(&close(thread_id, "x").into()).unwrap();
        node.db().insert_record(&close(thread_id, "y").into()).unwrap();

        let err = node.evaluate(thread_id).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { .. }));
        assert!(node.is_halted(thread_id));

        let err = node.propose(thread_id, ChangeKind::Close, &[], &[]).await.unwrap_err();
        assert!(matches!(err, Error::ThreadHalted(_)));

        assert!(node.clear_halt(thread_id));
        assert!(!node.clear_halt(thread_id));
        assert!(!node.is_halted(thread_id));
    }

    #[tokio::test]
    async fn signing_requires_being_a_signer() {
        let node = lone_node("x");
        let thread_id = ThreadId::new();
        let transition = Transition::new(thread_id, Command::Agree, BTreeSet::from([Party::from("y")]));
        let reply = node.on_request(Party::from("y"), PeerRequest::Sign { transition }).await;
        assert!(matches!(reply, PeerReply::Refused { .. }));
    }

    #[tokio::test]
    async fn finality_for_uncommitted_transition_is_ignored() {
        let node = lone_node("x");
        let thread_id = ThreadId::new();
        let meta = ThreadMetaRecord::new(thread_id, Party::from("y"), BTreeSet::from([Party::from("x")]));
        let transition = Transition::new(thread_id, Command::CreateThread, meta.roster()).producing([meta.into()]);

        node.on_notice(
            Party::from("y"),
            PeerNotice::Finality {
                transition,
                signatures: Vec::new(),
            },
        )
        .await;
        assert!(node.threads().unwrap().is_empty());
    }
}
