//! TCP and HTTP data plane.
//!
//! ## Architecture
//!
//! ```text
//! TCP:  Client -> Service listener -> balancer -> Backend::proxy -> upstream
//! HTTP: Client -> HostRouter -> VirtualHost -> Service -> ReverseProxy -> upstream
//!                    |
//!                    +-> admin router (unknown Host)
//! ```
//!
//! Every Backend also runs its own health-check task, which drives its
//! Up/Down state independently of the traffic counters.

mod backend;
mod balancer;
mod http;
mod router;
mod service;
mod stream;
mod vhost;

pub use backend::{ActiveGuard, Backend, BackendSettings, Transition};
pub use balancer::{least_conn, round_robin, RoundRobinCursor};
pub use http::{
    append_forwarded_for, strip_hop_headers, ErrorPages, OnRequest, OnResponse, ReverseProxy,
    HOP_HEADERS,
};
pub use router::{strip_port, HostRouter};
pub use service::{Service, DEFAULT_MAX_CONNECTIONS};
pub use stream::{splice, Deadlines, Traffic};
pub use vhost::VirtualHost;
