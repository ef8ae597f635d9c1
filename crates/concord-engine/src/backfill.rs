//! History backfill for newly added participants.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{info, warn};

use concord_types::{Command, MessageRecord, Party, PeerNotice, Record, ThreadId, Transition};

use crate::error::{Error, Result};
use crate::node::Node;
use crate::validation::validate_message;

/// What a backfill sent, and to whom.
#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    pub messages: usize,
    pub delivered: Vec<Party>,
    pub failed: Vec<(Party, String)>,
}

/// What a receiving party did with a backfill.
#[derive(Debug, Default)]
pub struct AdoptionReport {
    pub adopted: Vec<MessageRecord>,
    pub duplicates: usize,
    pub rejected: Vec<Error>,
}

impl Node {
    /// Send this party's full history of `thread_id`, oldest first, to each
    /// of `new_parties`. A failed delivery to one party does not affect the
    /// others.
    pub async fn backfill(&self, thread_id: ThreadId, new_parties: &BTreeSet<Party>) -> Result<BackfillReport> {
        if new_parties.is_empty() {
            return Ok(BackfillReport::default());
        }

        let messages = self.messages(thread_id)?;
        let mut report = BackfillReport {
            messages: messages.len(),
            ..BackfillReport::default()
        };
        let notice = PeerNotice::Backfill {
            thread_id,
            from: self.party().clone(),
            messages,
        };

        let sends = new_parties.iter().map(|party| {
            let notice = &notice;
            async move { (party, self.notify(party, notice).await) }
        });
        for (party, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => report.delivered.push(party.clone()),
                Err(e) => report.failed.push((party.clone(), e.to_string())),
            }
        }

        info!(
            "{}: backfilled {} message(s) of thread {} to {} party(ies)",
            self.party(),
            report.messages,
            thread_id,
            report.delivered.len()
        );
        Ok(report)
    }

    /// Take in a backfill: re-derive a private copy of each message, check it
    /// on its own, and commit the ones that pass in a single self-signed
    /// transition. Messages already held are skipped, so a repeated backfill
    /// adopts nothing twice.
    pub async fn adopt_history(
        &self,
        thread_id: ThreadId,
        from: &Party,
        messages: Vec<MessageRecord>,
    ) -> Result<AdoptionReport> {
        let _session = self.session(thread_id).await;
        let me = self.party().clone();
        let now = Utc::now();

        let mut report = AdoptionReport::default();
        let mut seen = HashSet::new();
        let mut newest: Option<DateTime<Utc>> = None;

        for message in messages {
            let message_id = message.message_id;
            if !seen.insert(message_id) || self.db().has_live_message(message_id)? {
                report.duplicates += 1;
                continue;
            }

            let copy = message.copy_for(&me);
            let verdict = validate_message(&copy, thread_id, self.config(), now).and_then(|()| match newest {
                Some(previous) if copy.created_at < previous => Err("history is out of order".to_string()),
                _ => Ok(()),
            });
            if let Err(reason) = verdict {
                let rejected = Error::BackfillRejected { message_id, reason };
                warn!("{}: backfill from {}: {}", me, from, rejected);
                report.rejected.push(rejected);
                continue;
            }

            newest = Some(copy.created_at);
            report.adopted.push(copy);
        }

        if !report.adopted.is_empty() {
            let transition = Transition::new(thread_id, Command::AdoptHistory, BTreeSet::from([me.clone()]))
                .producing(report.adopted.iter().cloned().map(Record::from));
            self.commit(transition).await?;
        }

        info!(
            "{}: adopted {} message(s) of thread {} from {} ({} duplicate, {} rejected)",
            me,
            report.adopted.len(),
            thread_id,
            from,
            report.duplicates,
            report.rejected.len()
        );
        Ok(report)
    }
}
