//! Push channel for offer lifecycle events.

pub mod offer_channel;
pub mod transport;

pub use offer_channel::OfferChannel;
pub use transport::{HttpPushTransport, PushEnvelope, PushEvent, PushTransport};
