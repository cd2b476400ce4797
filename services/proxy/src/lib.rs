pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod persistence;
pub mod proxy;
pub mod registry;
pub mod state;

pub use error::{ProxyError, Result};
pub use model::{Balance, BackendConfig, BackendStat, ServiceConfig, ServiceStat};
pub use proxy::{Backend, HostRouter, ReverseProxy, Service, VirtualHost};
pub use registry::ServiceRegistry;
