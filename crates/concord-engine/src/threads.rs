use std::collections::BTreeSet;
use std::iter;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use concord_types::{
    Attachment, Command, MessageRecord, Party, Record, RecordId, ThreadId, ThreadMetaRecord, Transition,
};

use crate::error::{Error, Result};
use crate::head::resolve_head;
use crate::node::Node;
use crate::validation::validate_message;

impl Node {
    /// Start a thread administered by this party. Every member signs the
    /// opening transition and receives a private copy of the first message.
    pub async fn create_thread(&self, receivers: &[Party], subject: &str, content: &str) -> Result<ThreadMetaRecord> {
        let admin = self.party().clone();
        let mut roster = BTreeSet::new();
        for receiver in receivers {
            if *receiver == admin {
                return Err(Error::InvalidActionArguments("the admin is not a receiver".into()));
            }
            if !roster.insert(receiver.clone()) {
                return Err(Error::InvalidActionArguments(format!("{} listed twice", receiver)));
            }
        }
        if roster.is_empty() {
            return Err(Error::InvalidActionArguments("a thread needs at least one receiver".into()));
        }

        let meta = ThreadMetaRecord::new(ThreadId::new(), admin, roster);
        let copies = self.compose(&meta, subject, content, None)?;
        let transition = Transition::new(meta.thread_id, Command::CreateThread, meta.roster())
            .producing(iter::once(Record::from(meta.clone())).chain(copies.into_iter().map(Record::from)));

        let _session = self.session(meta.thread_id).await;
        self.commit(transition).await?;
        info!("{}: created thread {} with {} receiver(s)", self.party(), meta.thread_id, meta.receivers.len());
        Ok(meta)
    }

    /// Post a message to every current member. Returns this party's copy.
    pub async fn send_message(
        &self,
        thread_id: ThreadId,
        subject: &str,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<MessageRecord> {
        let me = self.party().clone();
        let meta = self.thread(thread_id)?;
        if !meta.is_active() {
            return Err(Error::ThreadClosed(thread_id));
        }
        if !meta.is_member(&me) {
            return Err(Error::InvalidActionArguments(format!("{} is not a participant", me)));
        }

        let copies = self.compose(&meta, subject, content, attachment)?;
        let own = copies
            .iter()
            .find(|c| c.visible_to == me)
            .cloned()
            .ok_or_else(|| Error::InvalidActionArguments(format!("{} is not a participant", me)))?;

        let transition = Transition::new(thread_id, Command::SendMessage, BTreeSet::from([me]))
            .referencing([meta.id])
            .producing(copies.into_iter().map(Record::from));
        self.commit(transition).await?;
        Ok(own)
    }

    /// This party's live messages in a thread, oldest first.
    pub fn messages(&self, thread_id: ThreadId) -> Result<Vec<MessageRecord>> {
        Ok(self.db().records(thread_id, false)?)
    }

    pub fn latest_message(&self, thread_id: ThreadId) -> Result<MessageRecord> {
        Ok(resolve_head::<MessageRecord>(self.db(), thread_id)?.into_inner())
    }

    /// Threads with at least one live record in this party's store.
    pub fn threads(&self) -> Result<BTreeSet<ThreadId>> {
        Ok(self.db().query_all_thread_ids()?)
    }

    /// One private copy per member, each checked before anything is sent.
    fn compose(
        &self,
        meta: &ThreadMetaRecord,
        subject: &str,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<Vec<MessageRecord>> {
        let now = Utc::now();
        let original = MessageRecord {
            id: RecordId::new(),
            message_id: Uuid::new_v4(),
            thread_id: meta.thread_id,
            created_at: now,
            subject: subject.to_string(),
            sender: self.party().clone(),
            content: content.to_string(),
            attachment,
            visible_to: self.party().clone(),
        };

        meta.roster()
            .iter()
            .map(|party| -> Result<MessageRecord> {
                let copy = original.copy_for(party);
                validate_message(&copy, meta.thread_id, self.config(), now).map_err(Error::InvalidMessage)?;
                Ok(copy)
            })
            .collect()
    }
}
