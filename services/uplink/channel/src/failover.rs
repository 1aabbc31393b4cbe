//! Failover policy for channel connection failures.
//!
//! Channels report server failures and successful connections here, and ask
//! for a decision when they cannot reach the network at all. The manager is
//! shared by every channel and only does bookkeeping on the caller's task.

use dashmap::DashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::{ServerDescriptor, ServerRole};

/// Coarse condition a channel asks for a decision about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailoverStatus {
    /// Connectivity probe reported no network
    NoConnectivity,
    /// Every bootstrap server failed
    BootstrapServersNa,
    /// The bootstrap server in use failed
    CurrentBootstrapServerNa,
    /// Every operations server failed
    OperationsServersNa,
    /// Bootstrap answered without any operations server
    NoOperationsServersReceived,
}

impl FailoverStatus {
    /// Role whose server list the status is about
    fn exhausted_role(self) -> Option<ServerRole> {
        match self {
            FailoverStatus::OperationsServersNa => Some(ServerRole::Operations),
            FailoverStatus::BootstrapServersNa => Some(ServerRole::Bootstrap),
            _ => None,
        }
    }
}

/// Outcome of a failover request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    /// Do nothing further
    Noop,
    /// Try again after `delay`
    Retry {
        /// Delay before the next attempt
        delay: Duration,
    },
    /// Give up; the process has to stop
    Stop,
}

/// Signal sent to the channel manager when a server should be rotated out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailed {
    /// The server that failed
    pub server: ServerDescriptor,
}

/// Policy engine consulted by channels on connection failures
pub trait FailoverManager: Send + Sync + Debug {
    /// Record a failure of `server`; may ask the channel manager to rotate
    fn on_server_failed(&self, server: &ServerDescriptor);

    /// Record a successful connection to `server`
    fn on_server_connected(&self, server: &ServerDescriptor);

    /// Decide what to do about `status`
    fn on_failover(&self, status: FailoverStatus) -> FailoverDecision;
}

/// Tunables of [`DefaultFailoverManager`]
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    /// Delay before the first retry
    pub retry_delay: Duration,
    /// Factor applied to the delay on every consecutive failure (1 = fixed)
    pub backoff_multiplier: u32,
    /// Upper bound of the retry delay
    pub max_retry_delay: Duration,
    /// Consecutive failover requests tolerated before deciding STOP
    pub max_consecutive_failures: Option<u32>,
    /// Window in which repeated failures of one server are reported once
    pub failure_resolution_timeout: Duration,
    /// Whether a lost network is retried or left to an external resume
    pub retry_on_no_connectivity: bool,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            backoff_multiplier: 2,
            max_retry_delay: Duration::from_secs(300),
            max_consecutive_failures: None,
            failure_resolution_timeout: Duration::from_secs(10),
            retry_on_no_connectivity: true,
        }
    }
}

impl FailoverPolicy {
    /// Delay for the `attempt`-th consecutive failure, starting at 1
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.backoff_multiplier.max(1).saturating_pow(exponent);
        self.retry_delay
            .checked_mul(factor)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }
}

#[derive(Debug, Clone)]
struct FailureInfo {
    /// Number of consecutive failures
    count: u32,
    /// Timestamp of first failure in current sequence
    first_failure: Instant,
    /// Timestamp of last failure
    last_failure: Instant,
}

/// Failover manager with per-server bookkeeping and a configurable policy
#[derive(Debug)]
pub struct DefaultFailoverManager {
    policy: FailoverPolicy,
    /// Failure records per server address and role
    failures: DashMap<(String, ServerRole), FailureInfo>,
    /// Consecutive failover requests per status
    attempts: DashMap<FailoverStatus, u32>,
    /// Last rotation signal per role
    last_signal: DashMap<ServerRole, (String, Instant)>,
    signals: mpsc::UnboundedSender<ServerFailed>,
}

impl DefaultFailoverManager {
    /// Create a manager; the receiver feeds server rotation to the channel manager
    pub fn new(policy: FailoverPolicy) -> (Self, mpsc::UnboundedReceiver<ServerFailed>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let manager = Self {
            policy,
            failures: DashMap::new(),
            attempts: DashMap::new(),
            last_signal: DashMap::new(),
            signals,
        };
        (manager, rx)
    }

    /// Current consecutive failure count for a server
    pub fn failure_count(&self, server: &ServerDescriptor) -> u32 {
        self.failures
            .get(&(server.address(), server.role))
            .map(|info| info.count)
            .unwrap_or(0)
    }
}

impl FailoverManager for DefaultFailoverManager {
    fn on_server_failed(&self, server: &ServerDescriptor) {
        let now = Instant::now();
        let key = (server.address(), server.role);

        let count = {
            let mut info = self.failures.entry(key.clone()).or_insert(FailureInfo {
                count: 0,
                first_failure: now,
                last_failure: now,
            });
            info.count += 1;
            info.last_failure = now;
            info.count
        };
        debug!("Recorded failure of server {} (count: {})", server, count);

        // One rotation per server within the resolution window
        if let Some(last) = self.last_signal.get(&server.role) {
            let (address, at) = last.value();
            if *address == key.0 && now.duration_since(*at) < self.policy.failure_resolution_timeout {
                debug!(
                    "Rotation away from {} already requested {:?} ago, ignoring",
                    server,
                    now.duration_since(*at)
                );
                return;
            }
        }

        self.last_signal.insert(server.role, (key.0, now));
        if self
            .signals
            .send(ServerFailed {
                server: server.clone(),
            })
            .is_err()
        {
            warn!("Channel manager is gone, cannot rotate away from {}", server);
        }
    }

    fn on_server_connected(&self, server: &ServerDescriptor) {
        let key = (server.address(), server.role);
        if let Some((_, info)) = self.failures.remove(&key) {
            info!(
                "Server {} recovered after {} failures over {:?}",
                server,
                info.count,
                info.last_failure.duration_since(info.first_failure)
            );
        }
        self.last_signal.remove(&server.role);
        self.attempts.clear();
    }

    fn on_failover(&self, status: FailoverStatus) -> FailoverDecision {
        let attempt = {
            let mut attempts = self.attempts.entry(status).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if let Some(max) = self.policy.max_consecutive_failures {
            if attempt > max {
                warn!(
                    "Failover for {:?} exhausted after {} consecutive attempts",
                    status, max
                );
                return FailoverDecision::Stop;
            }
        }

        if status == FailoverStatus::NoConnectivity && !self.policy.retry_on_no_connectivity {
            return FailoverDecision::Noop;
        }

        // The list restarts from the top, so the next failure of the same
        // server has to reach the channel manager again
        if let Some(role) = status.exhausted_role() {
            self.last_signal.remove(&role);
        }

        let delay = self.policy.delay_for(attempt);
        debug!(
            "Failover for {:?}: retry #{} in {:?}",
            status, attempt, delay
        );
        FailoverDecision::Retry { delay }
    }
}
