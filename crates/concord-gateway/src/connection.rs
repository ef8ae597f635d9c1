use std::future::Future;

use tokio::sync::mpsc;
use tracing::{info, warn};

use concord_types::{Party, PeerNotice, PeerReply, PeerRequest};

use crate::dispatcher::Inbound;

/// The receiving side of a party: what to do with decoded traffic.
pub trait PeerHandler: Clone + Send + Sync + 'static {
    /// Notices are handled one at a time, in mailbox order.
    fn on_notice(&self, from: Party, notice: PeerNotice) -> impl Future<Output = ()> + Send;

    /// Requests are handled concurrently, each on its own task.
    fn on_request(&self, from: Party, request: PeerRequest) -> impl Future<Output = PeerReply> + Send;
}

/// Drain a party's mailbox until every sender is gone.
///
/// Notices run inline so a consuming transition is never recorded ahead of
/// one it follows from the same sender. Requests are spawned: a party waiting
/// on its own outgoing request must still be able to answer others.
pub async fn run_mailbox<H: PeerHandler>(
    party: Party,
    mut mailbox: mpsc::UnboundedReceiver<Inbound>,
    handler: H,
) {
    info!("{} mailbox open", party);

    while let Some(inbound) = mailbox.recv().await {
        match inbound {
            Inbound::Notice { from, payload } => match serde_json::from_str::<PeerNotice>(&payload) {
                Ok(notice) => handler.on_notice(from, notice).await,
                Err(e) => {
                    warn!(
                        "{} bad notice from {}: {} -- raw: {}",
                        party,
                        from,
                        e,
                        &payload[..payload.len().min(200)]
                    );
                }
            },
            Inbound::Request { from, payload, reply } => match serde_json::from_str::<PeerRequest>(&payload) {
                Ok(request) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let answer = handler.on_request(from, request).await;
                        let _ = reply.send(answer);
                    });
                }
                Err(e) => {
                    warn!("{} bad request from {}: {}", party, from, e);
                    let _ = reply.send(PeerReply::Refused {
                        reason: format!("malformed request: {}", e),
                    });
                }
            },
        }
    }

    info!("{} mailbox closed", party);
}
