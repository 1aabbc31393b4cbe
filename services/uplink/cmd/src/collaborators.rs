//! Stand-in collaborators for running the channel without the full client.
//!
//! The identity lives in memory, requests are JSON documents listing the
//! transports and their directions, and responses are only logged.

use anyhow::Context;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uplink_channel::{ConnectivityChecker, Demultiplexer, DirectionMap, IdentityStore, Multiplexer};

/// Device key pair kept in memory; cleaning generates a new one
pub struct InMemoryIdentity {
    key: RwLock<SigningKey>,
}

impl InMemoryIdentity {
    /// Identity from a 32-byte seed, or a random one
    pub fn new(seed: Option<[u8; 32]>) -> Self {
        let seed = seed.unwrap_or_else(random_seed);
        Self {
            key: RwLock::new(SigningKey::from_bytes(&seed)),
        }
    }

    fn key(&self) -> SigningKey {
        match self.key.read() {
            Ok(key) => key.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl IdentityStore for InMemoryIdentity {
    fn private_key(&self) -> [u8; 32] {
        self.key().to_bytes()
    }

    fn public_key(&self) -> [u8; 32] {
        self.key().verifying_key().to_bytes()
    }

    fn clean(&self) {
        let fresh = SigningKey::from_bytes(&random_seed());
        info!(
            "Identity rejected by server, new public key {}",
            hex::encode(fresh.verifying_key().to_bytes())
        );
        match self.key.write() {
            Ok(mut key) => *key = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }
}

fn random_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// Compiles `{"request_id": n, "transports": {...}}` documents
#[derive(Default)]
pub struct JsonMultiplexer {
    next_request: AtomicU64,
}

impl Multiplexer for JsonMultiplexer {
    fn compile_request(&self, types: &DirectionMap) -> anyhow::Result<Vec<u8>> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "request_id": request_id,
            "transports": types,
        });
        serde_json::to_vec(&body).context("failed to serialize sync request")
    }
}

/// Logs every response it receives
#[derive(Default)]
pub struct LoggingDemultiplexer {
    responses: AtomicU64,
}

impl Demultiplexer for LoggingDemultiplexer {
    fn process_response(&self, response: &[u8]) -> anyhow::Result<()> {
        let count = self.responses.fetch_add(1, Ordering::Relaxed) + 1;
        match serde_json::from_slice::<serde_json::Value>(response) {
            Ok(value) => info!("Response #{}: {}", count, value),
            Err(_) => info!("Response #{}: {} opaque bytes", count, response.len()),
        }
        Ok(())
    }
}

/// Treats a successful TCP connect to a well-known address as connectivity
///
/// A background task probes on a fixed interval and caches the outcome;
/// channels only read the cached value.
pub struct SocketConnectivityChecker {
    address: String,
    reachable: Arc<AtomicBool>,
}

impl SocketConnectivityChecker {
    /// Start probing `address` (`host:port`) every `interval`
    ///
    /// The network counts as reachable until the first probe says otherwise.
    /// The probe task ends once the checker is dropped.
    pub fn spawn(address: impl Into<String>, timeout: Duration, interval: Duration) -> Arc<Self> {
        let checker = Arc::new(Self {
            address: address.into(),
            reachable: Arc::new(AtomicBool::new(true)),
        });

        let address = checker.address.clone();
        let reachable = Arc::downgrade(&checker.reachable);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = probe(&address, timeout).await;
                let Some(reachable) = reachable.upgrade() else {
                    break;
                };
                if reachable.swap(result, Ordering::SeqCst) != result {
                    info!("Connectivity probe {}: reachable={}", address, result);
                }
            }
            debug!("Connectivity probe {} stopped", address);
        });
        checker
    }
}

async fn probe(address: &str, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match lookup_host(address).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            warn!("Can't resolve connectivity probe {}: {}", address, e);
            return false;
        }
    };
    for addr in addrs {
        if let Ok(Ok(_)) = tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            return true;
        }
    }
    false
}

impl ConnectivityChecker for SocketConnectivityChecker {
    fn check_connectivity(&self) -> bool {
        let reachable = self.reachable.load(Ordering::SeqCst);
        debug!("Connectivity probe {}: reachable={}", self.address, reachable);
        reachable
    }
}
