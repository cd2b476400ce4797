//! HTTP reverse proxy pipeline for a service.
//!
//! ```text
//! request -> OnRequest hooks -> strip hop-by-hop, X-Forwarded-For
//!         -> dial candidates in order -> HTTP/1.1 exchange
//!         -> (502 on failure) -> OnResponse hooks -> client
//! ```
//!
//! Bodies are streamed in both directions; every data frame is relayed as
//! soon as it arrives and counted against the backend that carried it.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, StatusCode, Uri, Version};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use super::backend::Backend;

/// Headers that only describe one connection leg.
pub const HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    HeaderName::from_static("trailers"),
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Runs before the request is forwarded. `Err(response)` stops the
/// pipeline and sends that response instead.
pub type OnRequest = Arc<dyn Fn(&mut Request<Body>) -> Result<(), Response<Body>> + Send + Sync>;

/// Runs on every response, including synthetic ones. Returning `false`
/// skips the remaining hooks.
pub type OnResponse = Arc<dyn Fn(&mut Response<Body>) -> bool + Send + Sync>;

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_HEADERS.iter() {
        headers.remove(name);
    }
}

/// Append the client IP to `X-Forwarded-For`, comma-joined with any
/// existing value.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: SocketAddr) {
    let ip = client.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn bad_gateway() -> Response<Body> {
    let mut response = Response::new(Body::from("Bad Gateway\n"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Per-service HTTP pipeline.
#[derive(Default, Clone)]
pub struct ReverseProxy {
    on_request: Vec<OnRequest>,
    on_response: Vec<OnResponse>,
}

impl ReverseProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(mut self, hook: OnRequest) -> Self {
        self.on_request.push(hook);
        self
    }

    pub fn on_response(mut self, hook: OnResponse) -> Self {
        self.on_response.push(hook);
        self
    }

    /// Forward one request to the first candidate that accepts a
    /// connection.
    pub async fn serve(
        &self,
        mut req: Request<Body>,
        client: SocketAddr,
        candidates: Vec<Arc<Backend>>,
    ) -> Response<Body> {
        for hook in &self.on_request {
            if let Err(response) = hook(&mut req) {
                return response;
            }
        }

        prepare_request(&mut req, client);

        let mut response = match forward(req, candidates).await {
            Some(response) => response,
            None => bad_gateway(),
        };

        for hook in &self.on_response {
            if !hook(&mut response) {
                break;
            }
        }
        response
    }
}

fn prepare_request(req: &mut Request<Body>, client: SocketAddr) {
    strip_hop_headers(req.headers_mut());
    append_forwarded_for(req.headers_mut(), client);

    // HTTP/1.1 origin-form towards the backend; Host is kept as received.
    if req.headers().get(header::HOST).is_none() {
        let host = req
            .uri()
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok());
        if let Some(host) = host {
            req.headers_mut().insert(header::HOST, host);
        }
    }
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("/"));
    *req.uri_mut() = path;
    *req.version_mut() = Version::HTTP_11;
}

async fn forward(req: Request<Body>, candidates: Vec<Arc<Backend>>) -> Option<Response<Body>> {
    for backend in candidates {
        let stream = match backend.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(backend = %backend.name(), addr = %backend.address(), error = %e, "backend dial failed");
                continue;
            }
        };

        let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
            Ok(parts) => parts,
            Err(e) => {
                backend.record_error();
                warn!(backend = %backend.name(), error = %e, "backend handshake failed");
                continue;
            }
        };
        let active = backend.track();

        let conn_backend = Arc::clone(&backend);
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                conn_backend.record_error();
                debug!(backend = %conn_backend.name(), error = %e, "backend connection error");
            }
        });

        let uploaded = Arc::clone(&backend);
        let req = req.map(|body| {
            Body::new(body.map_frame(move |frame| {
                if let Some(data) = frame.data_ref() {
                    uploaded.record_traffic(data.len() as u64, 0);
                }
                frame
            }))
        });

        let response = match sender.send_request(req).await {
            Ok(response) => response,
            Err(e) => {
                backend.record_error();
                warn!(backend = %backend.name(), error = %e, "backend request failed");
                return None;
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_headers(&mut parts.headers);

        // The guard rides along with the body so the backend counts as
        // active until the last frame is relayed.
        let counted = Arc::clone(&backend);
        let body = body.map_frame(move |frame| {
            let _ = &active;
            if let Some(data) = frame.data_ref() {
                counted.record_traffic(0, data.len() as u64);
            }
            frame
        });

        return Some(Response::from_parts(parts, Body::new(body)));
    }

    None
}

#[derive(Clone)]
struct ErrorPage {
    body: Bytes,
    content_type: Option<HeaderValue>,
}

/// Cached error pages for one service, keyed by status code.
#[derive(Default)]
pub struct ErrorPages {
    configured: RwLock<BTreeMap<u16, String>>,
    pages: RwLock<HashMap<u16, ErrorPage>>,
}

impl ErrorPages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Apply a new status-code to URL map. Pages that are no longer
    /// configured are dropped; new or changed ones are fetched in the
    /// background.
    pub fn configure(self: &Arc<Self>, wanted: &BTreeMap<u16, String>) {
        let changed: Vec<(u16, String)> = {
            let Ok(mut configured) = self.configured.write() else {
                return;
            };
            if *configured == *wanted {
                return;
            }
            let changed = wanted
                .iter()
                .filter(|(code, url)| configured.get(*code) != Some(*url))
                .map(|(code, url)| (*code, url.clone()))
                .collect();
            *configured = wanted.clone();
            changed
        };

        if let Ok(mut pages) = self.pages.write() {
            pages.retain(|code, _| wanted.contains_key(code));
            for (code, _) in &changed {
                pages.remove(code);
            }
        }

        for (code, url) in changed {
            let pages = Arc::clone(self);
            tokio::spawn(async move {
                match fetch_page(&url).await {
                    Ok(page) => pages.store(code, &url, page),
                    Err(e) => warn!(status = code, url = %url, error = %e, "error page fetch failed"),
                }
            });
        }
    }

    fn store(&self, code: u16, url: &str, page: ErrorPage) {
        // Drop the result if the mapping moved on while fetching.
        let current = self
            .configured
            .read()
            .map(|c| c.get(&code).map(String::as_str) == Some(url))
            .unwrap_or(false);
        if !current {
            return;
        }
        if let Ok(mut pages) = self.pages.write() {
            debug!(status = code, url = %url, bytes = page.body.len(), "error page cached");
            pages.insert(code, page);
        }
    }

    /// Replace the body of a response whose status has a cached page.
    pub fn apply(&self, response: &mut Response<Body>) -> bool {
        let page = match self.pages.read() {
            Ok(pages) => pages.get(&response.status().as_u16()).cloned(),
            Err(_) => None,
        };

        if let Some(page) = page {
            let headers = response.headers_mut();
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::CONTENT_ENCODING);
            match page.content_type {
                Some(ct) => headers.insert(header::CONTENT_TYPE, ct),
                None => headers.remove(header::CONTENT_TYPE),
            };
            *response.body_mut() = Body::from(page.body);
        }
        true
    }

    /// Response hook backed by this cache.
    pub fn hook(self: &Arc<Self>) -> OnResponse {
        let pages = Arc::clone(self);
        Arc::new(move |response| pages.apply(response))
    }

    #[cfg(test)]
    fn insert(&self, code: u16, body: &'static str) {
        self.pages.write().unwrap().insert(
            code,
            ErrorPage {
                body: Bytes::from_static(body.as_bytes()),
                content_type: Some(HeaderValue::from_static("text/html")),
            },
        );
    }
}

async fn fetch_page(url: &str) -> reqwest::Result<ErrorPage> {
    let response = reqwest::get(url).await?.error_for_status()?;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok());
    let body = response.bytes().await?;
    Ok(ErrorPage { body, content_type })
}
