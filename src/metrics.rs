//! Relay metrics
//!
//! Per-relay traffic and dial counters. Every mutation and every read takes
//! the same reader/writer lock, so a snapshot is always internally
//! consistent. Updates are also forwarded to the `metrics` facade, labelled
//! with the relay name, for whatever exporter the host process installs.

use ::metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::config::defaults::DIAL_SAMPLES;

/// Point-in-time copy of a relay's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Bytes sent from clients towards destinations
    pub upload: u64,
    /// Bytes sent from destinations back to clients
    pub download: u64,
    /// Connections currently open
    pub active: i64,
    /// Connections ever opened
    pub total_connections: u64,
    /// HTTP requests handled
    pub total_requests: u64,
    /// Successful dials
    pub dial_successes: u64,
    /// Failed dials
    pub dial_failures: u64,
    /// Mean of the recent dial durations, in milliseconds
    pub dial_average_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    up: u64,
    down: u64,
    active: i64,
    total_conns: u64,
    total_requests: u64,
    dial_success: u64,
    dial_fail: u64,
    dial_times: VecDeque<u64>,
}

impl Counters {
    fn dial_average(&self) -> u64 {
        if self.dial_times.is_empty() {
            return 0;
        }
        self.dial_times.iter().sum::<u64>() / self.dial_times.len() as u64
    }
}

/// Thread-safe counters for one relay
#[derive(Debug)]
pub struct Metrics {
    relay: String,
    counters: RwLock<Counters>,
}

impl Metrics {
    /// Create an empty recorder for the named relay
    pub fn new(relay: &str) -> Self {
        Self {
            relay: relay.to_string(),
            counters: RwLock::new(Counters {
                dial_times: VecDeque::with_capacity(DIAL_SAMPLES),
                ..Counters::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Counters> {
        self.counters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Counters> {
        self.counters.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add transferred bytes
    pub fn record_bandwidth(&self, up: u64, down: u64) {
        {
            let mut c = self.write();
            c.up += up;
            c.down += down;
        }

        if up > 0 {
            counter!("localrelay_bytes_up_total", "relay" => self.relay.clone()).increment(up);
        }
        if down > 0 {
            counter!("localrelay_bytes_down_total", "relay" => self.relay.clone()).increment(down);
        }
    }

    /// Record dial outcomes and the time elapsed since `started`
    pub fn record_dial(&self, success: u64, failure: u64, started: Instant) {
        self.record_dial_duration(success, failure, started.elapsed());
    }

    /// Record dial outcomes with an explicit duration
    ///
    /// Only the last ten durations, failed dials included, feed the average.
    pub fn record_dial_duration(&self, success: u64, failure: u64, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        {
            let mut c = self.write();
            c.dial_success += success;
            c.dial_fail += failure;

            if c.dial_times.len() == DIAL_SAMPLES {
                c.dial_times.pop_front();
            }
            c.dial_times.push_back(millis);
        }

        counter!("localrelay_dial_success_total", "relay" => self.relay.clone()).increment(success);
        counter!("localrelay_dial_failure_total", "relay" => self.relay.clone()).increment(failure);
        histogram!("localrelay_dial_duration_ms", "relay" => self.relay.clone()).record(millis as f64);
    }

    /// Adjust the active connection count
    ///
    /// Positive deltas also count towards the total, which never decreases.
    pub fn record_connection_delta(&self, delta: i64) {
        let active = {
            let mut c = self.write();
            if delta > 0 {
                c.total_conns += delta as u64;
            }
            c.active += delta;
            c.active
        };

        if delta > 0 {
            counter!("localrelay_connections_total", "relay" => self.relay.clone())
                .increment(delta as u64);
        }
        gauge!("localrelay_connections_active", "relay" => self.relay.clone()).set(active as f64);
    }

    /// Count handled HTTP requests
    pub fn record_request(&self, delta: u64) {
        self.write().total_requests += delta;

        counter!("localrelay_requests_total", "relay" => self.relay.clone()).increment(delta);
    }

    /// Bytes uploaded through the relay
    pub fn upload(&self) -> u64 {
        self.read().up
    }

    /// Bytes downloaded through the relay
    pub fn download(&self) -> u64 {
        self.read().down
    }

    /// Active and total connections
    pub fn connections(&self) -> (i64, u64) {
        let c = self.read();
        (c.active, c.total_conns)
    }

    /// HTTP requests handled
    pub fn requests(&self) -> u64 {
        self.read().total_requests
    }

    /// Successful and failed dials
    pub fn dialer(&self) -> (u64, u64) {
        let c = self.read();
        (c.dial_success, c.dial_fail)
    }

    /// Mean of the recent dial durations in milliseconds, 0 with no samples
    pub fn dialer_average_millis(&self) -> u64 {
        self.read().dial_average()
    }

    /// Consistent copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.read();
        MetricsSnapshot {
            upload: c.up,
            download: c.down,
            active: c.active,
            total_connections: c.total_conns,
            total_requests: c.total_requests,
            dial_successes: c.dial_success,
            dial_failures: c.dial_fail,
            dial_average_ms: c.dial_average(),
        }
    }
}
