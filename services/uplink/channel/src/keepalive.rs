//! Keep-alive scheduling and round-trip tracking.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interval between PINGREQ frames for a negotiated keep-alive
///
/// Pings go out at half the keep-alive so the server always sees traffic
/// before its timeout expires.
pub fn ping_interval(keep_alive_secs: u16) -> Duration {
    Duration::from_millis(u64::from(keep_alive_secs.max(1)) * 500)
}

/// Outstanding ping and the last measured round trip
#[derive(Debug, Default)]
pub struct KeepaliveState {
    outstanding: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl KeepaliveState {
    /// Record a PINGREQ being sent
    pub fn record_ping(&mut self) {
        self.outstanding = Some(Instant::now());
    }

    /// Process a PINGRESP and return the RTT if a ping was outstanding
    pub fn process_pong(&mut self) -> Option<Duration> {
        let rtt = self.outstanding.take().map(|sent| sent.elapsed());
        if rtt.is_some() {
            self.last_rtt = rtt;
        }
        rtt
    }

    /// Most recent round trip
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Forget the outstanding ping when the connection goes away
    pub fn reset(&mut self) {
        self.outstanding = None;
    }
}

/// Spawn the recurring keep-alive task for one connection
///
/// Each tick is reported through `ticks` as a value built by `tick`; the task
/// ends when `cancel` fires or the receiving side is gone.
pub fn spawn_keepalive<T, F>(
    interval: Duration,
    cancel: CancellationToken,
    ticks: mpsc::UnboundedSender<T>,
    tick: F,
) -> tokio::task::JoinHandle<()>
where
    T: Send + 'static,
    F: Fn() -> T + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Keep-alive task cancelled");
                    break;
                }
                _ = timer.tick() => {
                    if ticks.send(tick()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}
