//! Services: one listener, an ordered backend set and a balancing policy.
//!
//! The accept loop dispatches each inbound connection to its own task,
//! which asks the balancer for candidates and dials them in order until
//! one answers. When none does, the client connection is closed without
//! writing anything.
//!
//! Lock order is registry, then service. The service lock only guards the
//! backend list and the round robin cursor; counters and health state live
//! on the backends themselves.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::{Backend, BackendSettings};
use super::balancer::{least_conn, round_robin, RoundRobinCursor};
use super::http::{ErrorPages, ReverseProxy};
use crate::error::{ProxyError, Result};
use crate::model::{Balance, BackendConfig, BackendStat, ServiceConfig, ServiceStat};

/// Default maximum concurrent connections per service listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

#[derive(Default)]
struct ServiceState {
    backends: Vec<Arc<Backend>>,
    cursor: RoundRobinCursor,
}

/// A registered service.
pub struct Service {
    name: String,
    /// Normalized service level settings; `backends` is always empty here.
    config: ArcSwap<ServiceConfig>,
    local_addr: Option<SocketAddr>,
    state: Mutex<ServiceState>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    http: ReverseProxy,
    error_pages: Arc<ErrorPages>,
    http_active: AtomicU64,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

fn settings_only(config: &ServiceConfig) -> ServiceConfig {
    let mut config = config.normalized();
    config.backends.clear();
    config
}

impl Service {
    /// Open the listener, attach the configured backends and start serving.
    ///
    /// An empty address creates an HTTP-only service reachable through its
    /// virtual hosts.
    pub async fn start(config: ServiceConfig, max_connections: usize) -> Result<Arc<Self>> {
        let listener = if config.address.is_empty() {
            None
        } else {
            let listener =
                TcpListener::bind(config.address.as_str())
                    .await
                    .map_err(|source| ProxyError::Bind {
                        addr: config.address.clone(),
                        source,
                    })?;
            Some(listener)
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let error_pages = ErrorPages::new();
        error_pages.configure(&config.error_pages);

        let service = Arc::new(Self {
            name: config.name.clone(),
            config: ArcSwap::from_pointee(settings_only(&config)),
            local_addr,
            state: Mutex::new(ServiceState::default()),
            accept_task: Mutex::new(None),
            http: ReverseProxy::new().on_response(error_pages.hook()),
            error_pages,
            http_active: AtomicU64::new(0),
        });

        for backend in &config.backends {
            service.add_backend(backend.clone());
        }

        if let Some(listener) = listener {
            let handle = tokio::spawn(accept_loop(
                Arc::downgrade(&service),
                listener,
                Arc::new(Semaphore::new(max_connections.max(1))),
            ));
            *service.lock_task() = Some(handle);
        }

        info!(
            service = %service.name,
            addr = ?service.local_addr,
            backend_count = config.backends.len(),
            "Service started"
        );
        Ok(service)
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.accept_task.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the listener is bound to, if the service has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Current service level settings.
    pub fn settings(&self) -> Arc<ServiceConfig> {
        self.config.load_full()
    }

    /// Apply changed service level fields in place. Already attached
    /// backends keep the settings they were created with.
    pub fn update_settings(&self, config: &ServiceConfig) {
        self.config.store(Arc::new(settings_only(config)));
        self.error_pages.configure(&config.error_pages);
        debug!(service = %self.name, "Service settings updated");
    }

    /// Attach a backend, replacing any backend of the same name in place.
    pub fn add_backend(&self, config: BackendConfig) {
        let settings = BackendSettings::from_service(&self.config.load());
        let backend = Arc::new(Backend::new(config, settings));

        let replaced = {
            let mut state = self.lock_state();
            match state.backends.iter_mut().find(|b| b.name() == backend.name()) {
                Some(slot) => Some(std::mem::replace(slot, Arc::clone(&backend))),
                None => {
                    state.backends.push(Arc::clone(&backend));
                    None
                }
            }
        };

        if let Some(old) = &replaced {
            old.stop();
        }
        backend.start();

        info!(
            service = %self.name,
            backend = %backend.name(),
            addr = %backend.address(),
            replaced = replaced.is_some(),
            "Backend added"
        );
    }

    /// Stop and remove a backend. Returns whether it existed.
    pub fn remove_backend(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.lock_state();
            let index = state.backends.iter().position(|b| b.name() == name);
            index.map(|i| state.backends.remove(i))
        };

        match removed {
            Some(backend) => {
                backend.stop();
                info!(service = %self.name, backend = %name, "Backend removed");
                true
            }
            None => false,
        }
    }

    /// Converge the backend set on `desired`.
    ///
    /// Unchanged backends are kept as they are, changed ones are replaced
    /// in place, new ones are appended and missing ones removed. The new
    /// list is staged and swapped in under one lock, so the set is never
    /// observed half reconciled.
    pub fn reconcile_backends(&self, desired: &[BackendConfig]) {
        let settings = BackendSettings::from_service(&self.config.load());
        let mut started = Vec::new();
        let mut stopped = Vec::new();

        {
            let mut state = self.lock_state();
            let mut next: Vec<Arc<Backend>> = Vec::with_capacity(desired.len());

            for current in &state.backends {
                match desired.iter().find(|d| d.name == current.name()) {
                    Some(wanted) if wanted.equal(current.config()) => {
                        next.push(Arc::clone(current));
                    }
                    Some(wanted) => {
                        let backend = Arc::new(Backend::new(wanted.clone(), settings.clone()));
                        next.push(Arc::clone(&backend));
                        started.push(backend);
                        stopped.push(Arc::clone(current));
                    }
                    None => stopped.push(Arc::clone(current)),
                }
            }

            for wanted in desired {
                if next.iter().any(|b| b.name() == wanted.name) {
                    continue;
                }
                let backend = Arc::new(Backend::new(wanted.clone(), settings.clone()));
                next.push(Arc::clone(&backend));
                started.push(backend);
            }

            state.backends = next;
            if state.cursor.last_backend >= state.backends.len() {
                state.cursor = RoundRobinCursor::default();
            }
        }

        for backend in &stopped {
            backend.stop();
        }
        for backend in &started {
            backend.start();
        }

        if !started.is_empty() || !stopped.is_empty() {
            info!(
                service = %self.name,
                started = started.len(),
                stopped = stopped.len(),
                "Backends reconciled"
            );
        }
    }

    pub fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.lock_state()
            .backends
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.lock_state().backends.clone()
    }

    /// Number of Up backends.
    pub fn available(&self) -> usize {
        self.lock_state().backends.iter().filter(|b| b.is_up()).count()
    }

    /// Priority-ordered candidates for one connection attempt.
    pub fn next_backends(&self) -> Vec<Arc<Backend>> {
        let balance = self.config.load().balance;
        let mut state = self.lock_state();
        match balance {
            Balance::RoundRobin => {
                let ServiceState { backends, cursor } = &mut *state;
                round_robin(backends, cursor)
            }
            Balance::LeastConn => least_conn(&state.backends),
        }
    }

    /// Serve one HTTP request through this service's backends.
    pub async fn serve_http(&self, req: Request<Body>, client: SocketAddr) -> Response<Body> {
        let _in_flight = InFlight::enter(&self.http_active);
        let candidates = self.next_backends();
        self.http.serve(req, client, candidates).await
    }

    async fn handle_connection(&self, client: TcpStream, peer: SocketAddr) {
        for backend in self.next_backends() {
            match backend.dial().await {
                Ok(server) => {
                    debug!(backend = %backend.name(), addr = %backend.address(), "Connected to backend");
                    backend.proxy(server, client).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        backend = %backend.name(),
                        addr = %backend.address(),
                        error = %e,
                        "Backend connection failed"
                    );
                }
            }
        }

        debug!(peer = %peer, "No available backends, closing client");
    }

    /// Stop every backend, then close the listener.
    pub async fn stop(&self) {
        let backends = std::mem::take(&mut self.lock_state().backends);
        for backend in &backends {
            backend.stop();
        }

        let task = self.lock_task().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        info!(service = %self.name, "Service stopped");
    }

    /// Full configuration including the current backends.
    pub fn config(&self) -> ServiceConfig {
        let mut config = (*self.config.load_full()).clone();
        config.backends = self
            .lock_state()
            .backends
            .iter()
            .map(|b| b.config().clone())
            .collect();
        config
    }

    pub fn backend_stats(&self, name: &str) -> Option<BackendStat> {
        self.backend(name).map(|b| b.stats())
    }

    pub fn stats(&self) -> ServiceStat {
        let config = self.config.load_full();
        let backends: Vec<BackendStat> = self.backends().iter().map(|b| b.stats()).collect();

        ServiceStat {
            name: self.name.clone(),
            address: config.address.clone(),
            virtual_hosts: config.virtual_hosts.clone(),
            balance: config.balance,
            check_interval: config.check_interval,
            fall: config.fall,
            rise: config.rise,
            client_timeout: config.client_timeout,
            server_timeout: config.server_timeout,
            connect_timeout: config.connect_timeout,
            sent: backends.iter().map(|b| b.sent).sum(),
            rcvd: backends.iter().map(|b| b.rcvd).sum(),
            errors: backends.iter().map(|b| b.errors).sum(),
            conns: backends.iter().map(|b| b.conns).sum(),
            active: backends.iter().map(|b| b.active).sum(),
            http_active: self.http_active.load(Ordering::Relaxed),
            backends,
        }
    }
}

/// Counts an in-flight HTTP request until dropped.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn accept_loop(service: Weak<Service>, listener: TcpListener, limit: Arc<Semaphore>) {
    loop {
        let accepted = listener.accept().await;
        let Some(service) = service.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, peer)) => {
                let permit = match Arc::clone(&limit).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(service = %service.name, peer = %peer, "Connection rejected: max connections reached");
                        continue;
                    }
                };

                let span = tracing::info_span!("connection", service = %service.name, peer = %peer);
                tokio::spawn(
                    async move {
                        service.handle_connection(stream, peer).await;
                        drop(permit);
                    }
                    .instrument(span),
                );
            }
            Err(e) => {
                error!(service = %service.name, error = %e, "Accept error");
                // Brief sleep to avoid tight loop on persistent errors
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
