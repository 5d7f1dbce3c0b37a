//! Coordinator service: runs the configured number of federated rounds over NATS.

pub mod federation;
pub mod nats_channel;

pub use federation::FederationModule;
pub use nats_channel::NatsChannel;
