//! Client side of Fusion Connect calling: the HTTP signaling client, the
//! durable active-call record, the call session tracker and the mailbox
//! poller that feeds signals into it.

pub mod client;
pub mod poller;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use client::{ClientError, SignalingClient};
pub use poller::{MailboxPoller, PollerHandle};
pub use store::{ActiveCallStore, CallStoreError, FileActiveCallStore, InMemoryActiveCallStore};
pub use tracker::{
    CallError, CallEvent, CallSubscription, CallTracker, ConnectMode, TrackerConfig,
};
