//! Concord protocol engine.
//!
//! Each party runs a [`Node`]: it keeps its own thread store, proposes and
//! answers structural changes, finalizes agreed ones, and keeps every other
//! party's copy in step through the commit service.
//!
//! Changes move through propose → agree / reject → finalize. A proposal is
//! complete when every required signer other than the proposer has agreed
//! (see [`quorum`]). Only the proposer may finalize.

pub mod change;
pub mod config;
pub mod error;
pub mod head;
pub mod node;
pub mod notifier;
pub mod phase;
pub mod quorum;
pub mod validation;

mod backfill;
mod mutator;
mod proposal;
mod review;
mod threads;

pub use backfill::{AdoptionReport, BackfillReport};
pub use change::{ChangeRules, build_change};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use head::{Head, resolve_head};
pub use node::Node;
pub use notifier::{ChangeObserver, Notifier, NullObserver, TracingObserver};
pub use phase::ProposalPhase;
pub use quorum::{PROPOSER_IMPLICITLY_AGREES, Quorum};
