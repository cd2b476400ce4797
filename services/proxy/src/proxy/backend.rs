//! Backend endpoints, health checking and the TCP data path.
//!
//! A backend is one upstream address of a service. It keeps:
//! - traffic counters updated lock-free from the data path
//! - an Up/Down state driven by consecutive health check outcomes
//! - at most one health check task, started once and stopped on removal
//!
//! Settings inherited from the owning service are copied in when the
//! backend is attached, so later service changes only reach backends that
//! are re-added.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::stream::{self, Deadlines, Traffic};
use crate::model::{BackendConfig, BackendStat, ServiceConfig};

/// Service settings a backend inherits when it is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub client_timeout: Option<Duration>,
    pub server_timeout: Option<Duration>,
    pub dial_timeout: Duration,
    pub check_interval: Duration,
    pub rise: u32,
    pub fall: u32,
}

impl BackendSettings {
    pub fn from_service(config: &ServiceConfig) -> Self {
        let config = config.normalized();
        Self {
            client_timeout: config.client_timeout(),
            server_timeout: config.server_timeout(),
            dial_timeout: config.connect_timeout(),
            check_interval: config.check_interval(),
            rise: config.rise,
            fall: config.fall,
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self::from_service(&ServiceConfig::default())
    }
}

/// Up/Down change produced by a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentUp,
    WentDown,
}

/// A live backend.
pub struct Backend {
    config: BackendConfig,
    settings: BackendSettings,

    up: AtomicBool,
    rise_count: AtomicU64,
    fall_count: AtomicU64,
    check_ok: AtomicU64,
    check_fail: AtomicU64,

    sent: AtomicU64,
    rcvd: AtomicU64,
    errors: AtomicU64,
    conns: AtomicU64,
    active: AtomicU64,

    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.config.name)
            .field("address", &self.config.address)
            .field("up", &self.is_up())
            .finish()
    }
}

impl Backend {
    /// Create a backend. It starts Up and does nothing until `start`.
    pub fn new(config: BackendConfig, settings: BackendSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: config.normalized(),
            settings,
            up: AtomicBool::new(true),
            rise_count: AtomicU64::new(0),
            fall_count: AtomicU64::new(0),
            check_ok: AtomicU64::new(0),
            check_fail: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            rcvd: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            conns: AtomicU64::new(0),
            active: AtomicU64::new(0),
            started: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    /// Health checking is disabled when no check address is configured.
    pub fn health_checked(&self) -> bool {
        !self.config.check_address.is_empty()
    }

    pub fn is_up(&self) -> bool {
        !self.health_checked() || self.up.load(Ordering::Acquire)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Launch the health check task. Only the first call has an effect,
    /// and a stopped backend never starts.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.health_checked() {
            debug!(backend = %self.name(), "health checks disabled");
            return;
        }

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let interval = backend.settings.check_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => backend.check().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!(backend = %backend.name(), "health check loop stopped");
        });
    }

    /// Signal the health check task to exit. Safe to call any number of
    /// times, with or without a prior `start`.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Dial the check address once and feed the outcome to the state machine.
    async fn check(&self) {
        let addr = &self.config.check_address;
        let ok = match timeout(self.settings.dial_timeout, TcpStream::connect(addr.as_str())).await
        {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(backend = %self.name(), check_addr = %addr, error = %e, "health check failed");
                false
            }
            Err(_) => {
                debug!(backend = %self.name(), check_addr = %addr, "health check timed out");
                false
            }
        };

        match self.record_check(ok) {
            Some(Transition::WentUp) => {
                info!(backend = %self.name(), addr = %self.address(), "backend up")
            }
            Some(Transition::WentDown) => {
                warn!(backend = %self.name(), addr = %self.address(), "backend down")
            }
            None => {}
        }
    }

    /// Apply one health check outcome.
    ///
    /// Consecutive successes reaching `rise` mark the backend Up;
    /// consecutive failures reaching `fall` mark it Down. Every outcome
    /// resets the opposing streak.
    pub fn record_check(&self, ok: bool) -> Option<Transition> {
        if ok {
            self.check_ok.fetch_add(1, Ordering::Relaxed);
            self.fall_count.store(0, Ordering::Relaxed);
            let rises = self.rise_count.fetch_add(1, Ordering::Relaxed) + 1;
            if rises >= u64::from(self.settings.rise) && !self.up.swap(true, Ordering::AcqRel) {
                return Some(Transition::WentUp);
            }
        } else {
            self.check_fail.fetch_add(1, Ordering::Relaxed);
            self.rise_count.store(0, Ordering::Relaxed);
            let falls = self.fall_count.fetch_add(1, Ordering::Relaxed) + 1;
            if falls >= u64::from(self.settings.fall) && self.up.swap(false, Ordering::AcqRel) {
                return Some(Transition::WentDown);
            }
        }
        None
    }

    /// Dial the backend address within the dial timeout.
    pub async fn dial(&self) -> io::Result<TcpStream> {
        let result = match timeout(
            self.settings.dial_timeout,
            TcpStream::connect(self.config.address.as_str()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        };

        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Count a connection as active until the guard is dropped.
    pub fn track(self: &Arc<Self>) -> ActiveGuard {
        self.conns.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            backend: Arc::clone(self),
        }
    }

    /// Copy bytes both ways between a dialed backend connection and the
    /// accepted client connection until both directions are finished.
    pub async fn proxy(self: &Arc<Self>, server: TcpStream, client: TcpStream) {
        let _active = self.track();

        let deadlines = Deadlines {
            client: self.settings.client_timeout,
            server: self.settings.server_timeout,
        };
        let traffic = Traffic {
            sent: &self.sent,
            rcvd: &self.rcvd,
            errors: &self.errors,
        };

        let (sent, rcvd) = stream::splice(client, server, deadlines, traffic).await;
        debug!(backend = %self.name(), sent, rcvd, "connection closed");
    }

    /// Count an I/O error seen outside the TCP copy path.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count bytes relayed outside the TCP copy path.
    pub fn record_traffic(&self, sent: u64, rcvd: u64) {
        self.sent.fetch_add(sent, Ordering::Relaxed);
        self.rcvd.fetch_add(rcvd, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BackendStat {
        BackendStat {
            name: self.config.name.clone(),
            address: self.config.address.clone(),
            check_address: self.config.check_address.clone(),
            weight: self.config.weight,
            up: self.is_up(),
            sent: self.sent.load(Ordering::Relaxed),
            rcvd: self.rcvd.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            conns: self.conns.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            check_ok: self.check_ok.load(Ordering::Relaxed),
            check_fail: self.check_fail.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the backend's active count on drop.
pub struct ActiveGuard {
    backend: Arc<Backend>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.backend.active.fetch_sub(1, Ordering::Relaxed);
    }
}
