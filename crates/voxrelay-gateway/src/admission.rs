//! Connection admission: a global connection cap and accept-rate limit kept
//! in atomic counters, plus a per-IP limiter.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use voxrelay_core::config::AdmissionConfig;
use voxrelay_core::error::{Result, VoxRelayError};

const IP_WINDOW: Duration = Duration::from_secs(60);

type IpTable = Mutex<HashMap<IpAddr, Vec<Instant>>>;

/// In-memory per-IP limiter for WebSocket connections.
pub struct IpLimiter {
    max_per_ip: u32,
    connections: Arc<IpTable>,
}

impl IpLimiter {
    pub fn new(max_per_ip: u32) -> Self {
        let limiter = Self {
            max_per_ip,
            connections: Arc::new(Mutex::new(HashMap::new())),
        };

        // Periodic cleanup, stops once the limiter is dropped.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let table = Arc::downgrade(&limiter.connections);
            handle.spawn(cleanup_loop(table));
        }

        limiter
    }

    /// Returns true if a connection from this IP should be allowed.
    pub fn check(&self, ip: IpAddr) -> bool {
        let mut map = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let timestamps = map.entry(ip).or_default();
        timestamps.retain(|t| now.duration_since(*t) < IP_WINDOW);

        if timestamps.len() >= self.max_per_ip as usize {
            warn!(%ip, count = timestamps.len(), limit = self.max_per_ip,
                "Rate limited: too many connections from IP");
            return false;
        }

        timestamps.push(now);
        true
    }

    /// Record that a connection from this IP was closed.
    pub fn release(&self, ip: IpAddr) {
        let mut map = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timestamps) = map.get_mut(&ip) {
            if !timestamps.is_empty() {
                timestamps.remove(0);
            }
            if timestamps.is_empty() {
                map.remove(&ip);
            }
        }
    }
}

async fn cleanup_loop(table: Weak<IpTable>) {
    loop {
        tokio::time::sleep(IP_WINDOW).await;
        let Some(table) = table.upgrade() else {
            break;
        };
        let mut map = table.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        map.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < IP_WINDOW);
            !timestamps.is_empty()
        });
        debug!(entries = map.len(), "IP limiter cleanup");
    }
}

/// Gate for new transport connections.
pub struct Admission {
    max_connections: usize,
    max_accepts_per_sec: u32,
    active: Arc<AtomicUsize>,
    epoch: Instant,
    window_second: AtomicU64,
    window_count: AtomicU32,
    per_ip: Arc<IpLimiter>,
}

impl Admission {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_accepts_per_sec: config.max_accepts_per_sec,
            active: Arc::new(AtomicUsize::new(0)),
            epoch: Instant::now(),
            window_second: AtomicU64::new(0),
            window_count: AtomicU32::new(0),
            per_ip: Arc::new(IpLimiter::new(config.max_connections_per_ip)),
        }
    }

    /// Admit a connection from `ip`. The connection counts against the
    /// limits until the returned permit is dropped.
    pub fn try_admit(&self, ip: IpAddr) -> Result<ConnectionPermit> {
        if !self.accept_within_rate() {
            return Err(VoxRelayError::Admission(
                "accept rate exceeded, retry shortly".into(),
            ));
        }

        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_connections {
            self.active.fetch_sub(1, Ordering::AcqRel);
            warn!(active = previous, limit = self.max_connections, "Connection limit reached");
            return Err(VoxRelayError::Admission("too many connections".into()));
        }

        if !self.per_ip.check(ip) {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(VoxRelayError::Admission(format!(
                "too many connections from {ip}"
            )));
        }

        Ok(ConnectionPermit {
            ip,
            active: self.active.clone(),
            per_ip: self.per_ip.clone(),
        })
    }

    /// Connections currently holding a permit.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn accept_within_rate(&self) -> bool {
        let second = self.epoch.elapsed().as_secs();
        let current = self.window_second.load(Ordering::Acquire);
        if current != second
            && self
                .window_second
                .compare_exchange(current, second, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.window_count.store(0, Ordering::Release);
        }

        let count = self.window_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.max_accepts_per_sec {
            warn!(count, limit = self.max_accepts_per_sec, "Accept rate exceeded");
            return false;
        }
        true
    }
}

/// Held for the lifetime of an admitted connection.
pub struct ConnectionPermit {
    ip: IpAddr,
    active: Arc<AtomicUsize>,
    per_ip: Arc<IpLimiter>,
}

impl ConnectionPermit {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.per_ip.release(self.ip);
    }
}
