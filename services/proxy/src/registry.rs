//! Process-wide table of services and virtual hosts.
//!
//! Every structural change (add, update, remove) runs under one async
//! mutex, so concurrent requests are applied one after another and each
//! observes the result of the previous one. Health state and traffic
//! counters are updated by the backends without touching this lock.
//!
//! Host routing reads an immutable snapshot of the virtual host table that
//! is republished after each change, so requests never wait on the lock.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::model::{BackendConfig, BackendStat, ServiceConfig, ServiceStat};
use crate::proxy::{Service, VirtualHost, DEFAULT_MAX_CONNECTIONS};

type VirtualHosts = HashMap<String, Arc<VirtualHost>>;

#[derive(Default)]
struct RegistryState {
    services: HashMap<String, Arc<Service>>,
    vhosts: VirtualHosts,
}

impl RegistryState {
    fn service(&self, name: &str) -> Result<&Arc<Service>> {
        self.services
            .get(name)
            .ok_or_else(|| ProxyError::NoService(name.to_string()))
    }

    fn attach(&mut self, hostname: &str, service: &Arc<Service>) {
        let vhost = self
            .vhosts
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(VirtualHost::new(hostname)));
        Arc::make_mut(vhost).add(Arc::clone(service));
        debug!(vhost = %hostname, service = %service.name(), "Virtual host attached");
    }

    fn detach(&mut self, hostname: &str, service: &str) {
        if let Some(vhost) = self.vhosts.get_mut(hostname) {
            Arc::make_mut(vhost).remove(service);
            if vhost.is_empty() {
                self.vhosts.remove(hostname);
                debug!(vhost = %hostname, "Virtual host removed");
            }
        }
    }
}

/// Reject backends whose address cannot be dialed as `host:port`.
fn validate_backend(backend: &BackendConfig) -> Result<()> {
    let dialable = |addr: &str| {
        addr.rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
    };

    if !dialable(&backend.address) {
        return Err(ProxyError::InvalidAddress {
            addr: backend.address.clone(),
        });
    }
    if !backend.check_address.is_empty() && !dialable(&backend.check_address) {
        return Err(ProxyError::InvalidAddress {
            addr: backend.check_address.clone(),
        });
    }
    Ok(())
}

fn validate_service(config: &ServiceConfig) -> Result<()> {
    config.backends.iter().try_for_each(validate_backend)
}

/// Hostnames to detach and to attach when moving from `old` to `new`.
///
/// Both inputs must be sorted; the result is computed with one merge walk.
pub fn diff_sorted(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let mut removed = Vec::new();
    let mut added = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            std::cmp::Ordering::Less => {
                removed.push(old[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(new[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    removed.extend_from_slice(&old[i..]);
    added.extend_from_slice(&new[j..]);

    (removed, added)
}

/// The service registry.
pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
    routes: ArcSwap<VirtualHosts>,
    max_connections: usize,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_max_connections(DEFAULT_MAX_CONNECTIONS)
    }

    /// Registry whose services cap concurrent TCP connections at `max`.
    pub fn with_max_connections(max: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            routes: ArcSwap::from_pointee(VirtualHosts::new()),
            max_connections: max,
        }
    }

    /// Start a service and register it under its virtual hosts.
    ///
    /// Nothing is registered if the name is taken or the listener cannot
    /// be opened.
    pub async fn add_service(&self, config: ServiceConfig) -> Result<ServiceStat> {
        let config = config.normalized();
        validate_service(&config)?;
        let mut state = self.state.lock().await;
        self.add_locked(&mut state, config).await
    }

    /// Reconcile an existing service with a new configuration.
    ///
    /// Backends and virtual hosts are diffed; other changed fields are
    /// applied in place without reopening the listener. A changed address
    /// opens the new listener before the old service is retired.
    pub async fn update_service(&self, config: ServiceConfig) -> Result<ServiceStat> {
        let config = config.normalized();
        validate_service(&config)?;
        let mut state = self.state.lock().await;
        self.update_locked(&mut state, config).await
    }

    /// Create the service if it is absent, then reconcile it with `config`.
    ///
    /// Both steps run under one lock acquisition, so concurrent identical
    /// requests converge on a single service.
    pub async fn put_service(&self, config: ServiceConfig) -> Result<ServiceStat> {
        let config = config.normalized();
        validate_service(&config)?;
        let mut state = self.state.lock().await;
        if state.services.contains_key(&config.name) {
            self.update_locked(&mut state, config).await
        } else {
            self.add_locked(&mut state, config).await
        }
    }

    /// Make the current virtual host table visible to `route_host`.
    fn publish(&self, state: &RegistryState) {
        self.routes.store(Arc::new(state.vhosts.clone()));
    }

    async fn add_locked(&self, state: &mut RegistryState, config: ServiceConfig) -> Result<ServiceStat> {
        if state.services.contains_key(&config.name) {
            return Err(ProxyError::DuplicateService(config.name));
        }

        let service = Service::start(config.clone(), self.max_connections).await?;
        for hostname in &config.virtual_hosts {
            state.attach(hostname, &service);
        }
        state
            .services
            .insert(config.name.clone(), Arc::clone(&service));
        self.publish(state);

        info!(service = %config.name, "Service registered");
        Ok(service.stats())
    }

    async fn update_locked(
        &self,
        state: &mut RegistryState,
        config: ServiceConfig,
    ) -> Result<ServiceStat> {
        let current = Arc::clone(state.service(&config.name)?);
        let previous = current.settings();

        if previous.address != config.address {
            let replacement = Service::start(config.clone(), self.max_connections).await?;
            for hostname in &previous.virtual_hosts {
                state.detach(hostname, &config.name);
            }
            for hostname in &config.virtual_hosts {
                state.attach(hostname, &replacement);
            }
            state
                .services
                .insert(config.name.clone(), Arc::clone(&replacement));
            self.publish(state);
            current.stop().await;

            info!(
                service = %config.name,
                old_addr = %previous.address,
                new_addr = %config.address,
                "Service moved to new address"
            );
            return Ok(replacement.stats());
        }

        if !previous.equal(&config) {
            current.update_settings(&config);
        }
        current.reconcile_backends(&config.backends);

        let (removed, added) = diff_sorted(&previous.virtual_hosts, &config.virtual_hosts);
        for hostname in &removed {
            state.detach(hostname, &config.name);
        }
        for hostname in &added {
            state.attach(hostname, &current);
        }
        if !removed.is_empty() || !added.is_empty() {
            self.publish(state);
        }

        debug!(
            service = %config.name,
            vhosts_removed = removed.len(),
            vhosts_added = added.len(),
            "Service updated"
        );
        Ok(current.stats())
    }

    /// Stop a service and prune it from every virtual host.
    pub async fn remove_service(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let service = state
            .services
            .remove(name)
            .ok_or_else(|| ProxyError::NoService(name.to_string()))?;

        for hostname in &service.settings().virtual_hosts {
            state.detach(hostname, name);
        }
        self.publish(&state);
        service.stop().await;

        info!(service = %name, "Service removed");
        Ok(())
    }

    /// Attach or replace one backend of an existing service.
    pub async fn add_backend(&self, service: &str, backend: BackendConfig) -> Result<ServiceStat> {
        validate_backend(&backend)?;
        let state = self.state.lock().await;
        let service = state.service(service)?;
        service.add_backend(backend);
        Ok(service.stats())
    }

    /// Remove one backend of an existing service.
    pub async fn remove_backend(&self, service: &str, backend: &str) -> Result<ServiceStat> {
        let state = self.state.lock().await;
        let svc = state.service(service)?;
        if !svc.remove_backend(backend) {
            return Err(ProxyError::NoBackend {
                service: service.to_string(),
                backend: backend.to_string(),
            });
        }
        Ok(svc.stats())
    }

    pub async fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.state.lock().await.services.get(name).cloned()
    }

    /// Stats of every service, sorted by name.
    pub async fn stats(&self) -> Vec<ServiceStat> {
        let state = self.state.lock().await;
        let mut stats: Vec<ServiceStat> = state.services.values().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub async fn service_stats(&self, name: &str) -> Result<ServiceStat> {
        let state = self.state.lock().await;
        Ok(state.service(name)?.stats())
    }

    pub async fn backend_stats(&self, service: &str, backend: &str) -> Result<BackendStat> {
        let state = self.state.lock().await;
        state
            .service(service)?
            .backend_stats(backend)
            .ok_or_else(|| ProxyError::NoBackend {
                service: service.to_string(),
                backend: backend.to_string(),
            })
    }

    /// Configuration of every service, sorted by name.
    pub async fn config(&self) -> Vec<ServiceConfig> {
        let state = self.state.lock().await;
        let mut configs: Vec<ServiceConfig> =
            state.services.values().map(|s| s.config()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Pick the service that should handle a request for `hostname`.
    pub fn route_host(&self, hostname: &str) -> Option<Arc<Service>> {
        self.routes.load().get(hostname)?.service()
    }

    /// Hostnames with at least one service, sorted.
    pub async fn virtual_hosts(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.vhosts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Services registered under one hostname, in rotation order.
    pub async fn virtual_host_services(&self, hostname: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .vhosts
            .get(hostname)
            .map(|vhost| vhost.service_names())
            .unwrap_or_default()
    }

    /// Stop and drop every service.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.vhosts.clear();
        self.publish(&state);
        for (_, service) in state.services.drain() {
            service.stop().await;
        }
        info!("Registry shut down");
    }
}
