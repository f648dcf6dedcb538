use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use parking_lot::RwLock;

use crate::connection::ConnectionTracker;
use crate::traffic::TrafficCounters;

pub const MAX_LATENCY: Duration = Duration::from_secs(30);
pub const MAX_JITTER: Duration = Duration::from_secs(10);
pub const MAX_DROP_RATE: f64 = 1.0;

/// Network degradation applied to every relayed chunk
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChaosSettings {
    pub latency: Duration,
    pub jitter: Duration,
    pub drop_rate: f64,
}

/// Where the proxy listens and where it forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub target: String,
}

impl Default for ConnectionTarget {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            target: String::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    chaos: ChaosSettings,
    connection: ConnectionTarget,
}

/// Runtime state shared between the accept loop, every relay and the
/// control console.
///
/// All access goes through short critical sections; no lock is ever held
/// across I/O or a sleep, so a setter called from the console is visible to
/// the next chunk of every in-flight connection.
#[derive(Debug, Default)]
pub struct HavocState {
    inner: RwLock<Inner>,
    seed: Option<u64>,
    traffic: TrafficCounters,
    connections: ConnectionTracker,
}

impl HavocState {
    /// Create an empty, zero-valued state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state whose relay randomness is derived from `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn set_port(&self, port: u16) {
        self.inner.write().connection.listen_port = port;
    }

    pub fn set_listen_ip(&self, ip: IpAddr) {
        self.inner.write().connection.listen_ip = ip;
    }

    pub fn set_target(&self, target: impl Into<String>) {
        self.inner.write().connection.target = target.into();
    }

    /// Set the base latency, clamped to [`MAX_LATENCY`]
    pub fn set_latency(&self, latency: Duration) {
        self.inner.write().chaos.latency = latency.min(MAX_LATENCY);
    }

    /// Set the jitter, clamped to [`MAX_JITTER`]
    pub fn set_jitter(&self, jitter: Duration) {
        self.inner.write().chaos.jitter = jitter.min(MAX_JITTER);
    }

    /// Set the drop rate, clamped to `[0, 1]`. NaN is stored as `0`.
    pub fn set_drop_rate(&self, drop_rate: f64) {
        let drop_rate = if drop_rate.is_nan() {
            0.0
        } else {
            drop_rate.clamp(0.0, MAX_DROP_RATE)
        };
        self.inner.write().chaos.drop_rate = drop_rate;
    }

    /// Shift latency by `delta_ms` milliseconds, saturating at both ends
    pub fn adjust_latency(&self, delta_ms: i64) {
        let mut inner = self.inner.write();
        inner.chaos.latency = shift(inner.chaos.latency, delta_ms).min(MAX_LATENCY);
    }

    /// Shift jitter by `delta_ms` milliseconds, saturating at both ends
    pub fn adjust_jitter(&self, delta_ms: i64) {
        let mut inner = self.inner.write();
        inner.chaos.jitter = shift(inner.chaos.jitter, delta_ms).min(MAX_JITTER);
    }

    pub fn adjust_drop_rate(&self, delta: f64) {
        let mut inner = self.inner.write();
        let next = inner.chaos.drop_rate + delta;
        inner.chaos.drop_rate = if next.is_nan() {
            0.0
        } else {
            next.clamp(0.0, MAX_DROP_RATE)
        };
    }

    /// Copy of the chaos settings at the instant of the call
    pub fn chaos(&self) -> ChaosSettings {
        self.inner.read().chaos
    }

    /// Copy of the listen/target configuration at the instant of the call
    pub fn connection(&self) -> ConnectionTarget {
        self.inner.read().connection.clone()
    }

    pub fn target(&self) -> String {
        self.inner.read().connection.target.clone()
    }

    pub fn traffic(&self) -> &TrafficCounters {
        &self.traffic
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }
}

fn shift(value: Duration, delta_ms: i64) -> Duration {
    let delta = Duration::from_millis(delta_ms.unsigned_abs());
    if delta_ms >= 0 {
        value.saturating_add(delta)
    } else {
        value.saturating_sub(delta)
    }
}
