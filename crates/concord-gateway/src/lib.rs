//! In-process point-to-point delivery between named parties.
//!
//! Every party registers a mailbox with the [`Dispatcher`]. Notices and
//! requests are JSON-encoded on send and decoded by the receiving
//! [`connection`] loop, so nothing crosses a party boundary as a live Rust
//! value.

pub mod connection;
pub mod dispatcher;
pub mod error;

pub use connection::{PeerHandler, run_mailbox};
pub use dispatcher::{Dispatcher, Inbound};
pub use error::DeliveryError;
