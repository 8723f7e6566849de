//! Rendezvous server
//!
//! Brokers pairing codes between receivers and senders and relays the
//! offer/answer/ICE exchange. Application data never passes through here.
//! All state is in memory; a restart drops every pairing.

pub mod hub;
pub mod registry;
pub mod server;

pub use hub::{Hub, HubCommand, HubHandle};
pub use registry::{Claim, PairingCode, PairingRegistry, RegistryStats};
pub use server::{router, run_rendezvous_server, RendezvousState};
