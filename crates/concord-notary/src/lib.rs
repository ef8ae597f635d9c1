//! Commit service: atomic, all-or-nothing acceptance of signed transitions.
//!
//! The [`CommitService`] trait is the boundary the protocol engine talks to.
//! [`LocalNotary`] is an in-memory implementation: it checks every required
//! signature, refuses transitions whose inputs were already consumed, and
//! keeps at most one live record per singleton key. It is the single point of
//! total order for every thread it serves.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use concord_crypto::{PartyKey, verify_digest};
use concord_types::{Party, PartySignature, RecordId, Transition, TransitionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(TransitionId),
    /// The transition is malformed or under-signed. Resubmitting the same
    /// transition will fail again.
    Rejected(String),
    /// A competing transition already consumed or claimed this record.
    Conflict { record: RecordId },
}

pub trait CommitService: Send + Sync {
    /// Make `party`'s key known for signature checks.
    fn register_party(&self, party: Party, key: PartyKey);

    fn submit(&self, transition: &Transition, signatures: &[PartySignature]) -> CommitOutcome;

    fn is_committed(&self, id: TransitionId) -> bool;
}

#[derive(Default)]
pub struct LocalNotary {
    state: Mutex<NotaryState>,
}

#[derive(Default)]
struct NotaryState {
    keys: HashMap<Party, PartyKey>,
    /// live record -> its singleton key
    live: HashMap<RecordId, String>,
    /// singleton key -> live record holding it
    claims: HashMap<String, RecordId>,
    /// consumed record -> consuming transition
    consumed: HashMap<RecordId, TransitionId>,
    committed: HashSet<TransitionId>,
}

impl LocalNotary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self, record: RecordId) -> bool {
        self.state
            .lock()
            .map(|state| state.live.contains_key(&record))
            .unwrap_or(false)
    }

    /// Number of live records whose singleton key starts with `prefix`.
    pub fn live_claims(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .map(|state| state.claims.keys().filter(|k| k.starts_with(prefix)).count())
            .unwrap_or(0)
    }
}

impl CommitService for LocalNotary {
    fn register_party(&self, party: Party, key: PartyKey) {
        if let Ok(mut state) = self.state.lock() {
            debug!("Notary: registered {}", party);
            state.keys.insert(party, key);
        }
    }

    fn submit(&self, transition: &Transition, signatures: &[PartySignature]) -> CommitOutcome {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => return CommitOutcome::Rejected(format!("notary state poisoned: {}", e)),
        };

        if state.committed.contains(&transition.id) {
            return CommitOutcome::Committed(transition.id);
        }

        let outcome = state.check(transition, signatures);
        match outcome {
            Ok(()) => {
                state.commit(transition);
                info!(
                    "Notary: committed {} {} for thread {} ({} in, {} out)",
                    transition.command,
                    transition.id,
                    transition.thread_id,
                    transition.inputs.len(),
                    transition.outputs.len()
                );
                CommitOutcome::Committed(transition.id)
            }
            Err(outcome) => {
                warn!("Notary: refused {} {}: {:?}", transition.command, transition.id, outcome);
                outcome
            }
        }
    }

    fn is_committed(&self, id: TransitionId) -> bool {
        self.state
            .lock()
            .map(|state| state.committed.contains(&id))
            .unwrap_or(false)
    }
}

impl NotaryState {
    fn check(&self, transition: &Transition, signatures: &[PartySignature]) -> Result<(), CommitOutcome> {
        let rejected = |reason: String| Err(CommitOutcome::Rejected(reason));

        if transition.required_signers.is_empty() {
            return rejected("no required signers".into());
        }

        let digest = match transition.digest() {
            Ok(digest) => digest,
            Err(e) => return rejected(format!("cannot digest transition: {}", e)),
        };

        for signer in &transition.required_signers {
            let Some(key) = self.keys.get(signer) else {
                return rejected(format!("unknown signer {}", signer));
            };
            let Some(signature) = signatures.iter().find(|s| s.party == *signer) else {
                return rejected(format!("missing signature from {}", signer));
            };
            if !verify_digest(key, &digest, &signature.signature) {
                return rejected(format!("invalid signature from {}", signer));
            }
        }

        let mut seen = HashSet::new();
        for id in transition.inputs.iter().chain(&transition.references) {
            if !seen.insert(*id) {
                return rejected(format!("record {} listed twice", id));
            }
            if self.consumed.contains_key(id) {
                return Err(CommitOutcome::Conflict { record: *id });
            }
            if !self.live.contains_key(id) {
                return rejected(format!("unknown record {}", id));
            }
        }

        let mut claimed = HashSet::new();
        for output in &transition.outputs {
            let id = output.id();
            if output.thread_id() != transition.thread_id {
                return rejected(format!("output {} belongs to another thread", id));
            }
            if self.live.contains_key(&id) || self.consumed.contains_key(&id) {
                return rejected(format!("output {} already exists", id));
            }
            let key = output.singleton_key();
            if !claimed.insert(key.clone()) {
                return rejected(format!("two outputs claim {}", key));
            }
            if let Some(holder) = self.claims.get(&key) {
                if !transition.inputs.contains(holder) {
                    return Err(CommitOutcome::Conflict { record: *holder });
                }
            }
        }

        Ok(())
    }

    fn commit(&mut self, transition: &Transition) {
        for input in &transition.inputs {
            if let Some(key) = self.live.remove(input) {
                self.claims.remove(&key);
            }
            self.consumed.insert(*input, transition.id);
        }
        for output in &transition.outputs {
            let key = output.singleton_key();
            self.claims.insert(key.clone(), output.id());
            self.live.insert(output.id(), key);
        }
        self.committed.insert(transition.id);
    }
}
