//! Virtual hosts: an HTTP hostname shared by one or more services.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::service::Service;

/// Services registered under one hostname, picked in round robin.
///
/// Membership only changes under the registry lock; picking a service
/// only advances the atomic cursor, so published copies can be shared by
/// request handlers.
#[derive(Debug)]
pub struct VirtualHost {
    name: String,
    services: Vec<Arc<Service>>,
    last: AtomicUsize,
}

impl Clone for VirtualHost {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            services: self.services.clone(),
            last: AtomicUsize::new(self.last.load(Ordering::Relaxed)),
        }
    }
}

impl VirtualHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: Vec::new(),
            last: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a service, replacing one of the same name.
    pub fn add(&mut self, service: Arc<Service>) {
        match self.services.iter_mut().find(|s| s.name() == service.name()) {
            Some(slot) => *slot = service,
            None => self.services.push(service),
        }
    }

    /// Remove a service by name. Returns whether it was registered.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.services.len();
        self.services.retain(|s| s.name() != name);
        self.services.len() != before
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    /// Next service in rotation, skipping services without an Up backend.
    ///
    /// After a full lap with nothing available the last selected service
    /// is returned anyway, so the HTTP layer can answer with its own error
    /// response.
    pub fn service(&self) -> Option<Arc<Service>> {
        let count = self.services.len();
        if count == 0 {
            return None;
        }

        let mut pick = 0;
        for _ in 0..count {
            pick = (self.last.fetch_add(1, Ordering::Relaxed) + 1) % count;
            if self.services[pick].available() > 0 {
                return Some(Arc::clone(&self.services[pick]));
            }
        }
        Some(Arc::clone(&self.services[pick]))
    }
}
