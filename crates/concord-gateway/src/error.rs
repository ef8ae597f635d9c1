use std::time::Duration;

use concord_types::Party;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Nobody is registered under that name.
    #[error("unknown party: {0}")]
    UnknownParty(Party),

    /// The party's mailbox was dropped while sending.
    #[error("mailbox closed for {0}")]
    MailboxClosed(Party),

    /// The party accepted the request but dropped it without answering.
    #[error("no reply from {0}")]
    NoReply(Party),

    #[error("request to {party} timed out after {after:?}")]
    Timeout { party: Party, after: Duration },

    #[error("could not encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}
