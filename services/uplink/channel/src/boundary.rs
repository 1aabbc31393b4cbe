//! Contracts with the components that surround a data channel.
//!
//! Payload schemas, key persistence and network probing live outside this
//! crate; channels only see them through these traits.

use crate::types::DirectionMap;

/// Serializes outbound per-feature state into one request blob
pub trait Multiplexer: Send + Sync {
    /// Compile a request covering every transport in `types`
    fn compile_request(&self, types: &DirectionMap) -> anyhow::Result<Vec<u8>>;
}

/// Parses an inbound response blob back into per-feature updates
pub trait Demultiplexer: Send + Sync {
    /// Called before a response is processed
    fn pre_process(&self) {}

    /// Process one decrypted response payload
    fn process_response(&self, response: &[u8]) -> anyhow::Result<()>;

    /// Called after a response was processed, also when processing failed
    fn post_process(&self) {}
}

/// Reports whether the network is reachable at all
pub trait ConnectivityChecker: Send + Sync {
    /// `false` when no network connectivity is detected
    fn check_connectivity(&self) -> bool;
}

/// Persisted device identity
pub trait IdentityStore: Send + Sync {
    /// Ed25519 signing key seed of the device
    fn private_key(&self) -> [u8; 32];

    /// Ed25519 verifying key of the device
    fn public_key(&self) -> [u8; 32];

    /// Discard the local identity after the server rejected it
    fn clean(&self);
}
