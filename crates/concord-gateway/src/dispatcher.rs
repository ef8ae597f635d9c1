use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use concord_types::{Party, PeerNotice, PeerReply, PeerRequest};

use crate::error::DeliveryError;

/// What lands in a party's mailbox. Payloads are JSON text.
#[derive(Debug)]
pub enum Inbound {
    Notice {
        from: Party,
        payload: String,
    },
    Request {
        from: Party,
        payload: String,
        reply: oneshot::Sender<PeerReply>,
    },
}

/// Routes notices and requests between registered parties.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// party -> (conn_id, mailbox sender)
    mailboxes: RwLock<HashMap<Party, (Uuid, mpsc::UnboundedSender<Inbound>)>>,

    /// How long a request waits for its reply.
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                mailboxes: RwLock::new(HashMap::new()),
                request_timeout,
            }),
        }
    }

    /// Register a party's mailbox. A later registration under the same name
    /// replaces the earlier one. Returns (conn_id, receiver).
    pub async fn register(&self, party: Party) -> (Uuid, mpsc::UnboundedReceiver<Inbound>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("{} registered mailbox {}", party, conn_id);
        self.inner.mailboxes.write().await.insert(party, (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister a party's mailbox, but only if conn_id matches.
    pub async fn unregister(&self, party: &Party, conn_id: Uuid) {
        let mut mailboxes = self.inner.mailboxes.write().await;
        if let Some((stored_conn_id, _)) = mailboxes.get(party) {
            if *stored_conn_id == conn_id {
                mailboxes.remove(party);
                debug!("{} unregistered mailbox {}", party, conn_id);
            }
        }
    }

    pub async fn is_registered(&self, party: &Party) -> bool {
        self.inner.mailboxes.read().await.contains_key(party)
    }

    /// Registered parties, sorted.
    pub async fn parties(&self) -> Vec<Party> {
        let mut parties: Vec<Party> = self.inner.mailboxes.read().await.keys().cloned().collect();
        parties.sort();
        parties
    }

    /// Deliver a notice. Succeeds once the notice is in the mailbox.
    pub async fn notify(&self, from: &Party, to: &Party, notice: &PeerNotice) -> Result<(), DeliveryError> {
        let payload = serde_json::to_string(notice)?;
        trace!("{} -> {}: {} ({} bytes)", from, to, notice.label(), payload.len());
        self.deliver(
            to,
            Inbound::Notice {
                from: from.clone(),
                payload,
            },
        )
        .await
    }

    /// Send a request and wait for its reply, bounded by the request timeout.
    pub async fn request(&self, from: &Party, to: &Party, request: &PeerRequest) -> Result<PeerReply, DeliveryError> {
        let payload = serde_json::to_string(request)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.deliver(
            to,
            Inbound::Request {
                from: from.clone(),
                payload,
                reply: reply_tx,
            },
        )
        .await?;

        match tokio::time::timeout(self.inner.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DeliveryError::NoReply(to.clone())),
            Err(_) => {
                warn!("Request {} -> {} timed out", from, to);
                Err(DeliveryError::Timeout {
                    party: to.clone(),
                    after: self.inner.request_timeout,
                })
            }
        }
    }

    async fn deliver(&self, to: &Party, inbound: Inbound) -> Result<(), DeliveryError> {
        let mailboxes = self.inner.mailboxes.read().await;
        let (_, tx) = mailboxes
            .get(to)
            .ok_or_else(|| DeliveryError::UnknownParty(to.clone()))?;
        tx.send(inbound).map_err(|_| DeliveryError::MailboxClosed(to.clone()))
    }
}
