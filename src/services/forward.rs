//! Byte-level forwarding to the backend, and the dispatcher that owns the
//! identity header.
//!
//! The transport itself sits behind [`Forwarder`] so the pipeline can be
//! tested without a backend. [`ForwardingDispatcher`] is the only place that
//! touches the principal header: it is set (overwriting anything the client
//! sent) on authenticated forwards and stripped on every unauthenticated
//! forward path, so a caller can never smuggle in an identity.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;
use url::Url;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl From<reqwest::Error> for ForwardError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

/// Streams a request to the resolved backend target, byte for byte, keeping
/// the original Host header.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, target: &Url, req: Request<Body>) -> Result<Response, ForwardError>;
}

/// Request headers that must not travel to the backend. Content-Length is
/// recomputed from the buffered body.
const SKIPPED_REQUEST_HEADERS: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::UPGRADE,
];

const SKIPPED_RESPONSE_HEADERS: [HeaderName; 3] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
];

pub struct HttpForwarder {
    http: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, target: &Url, req: Request<Body>) -> Result<Response, ForwardError> {
        let (parts, body) = req.into_parts();

        let url = rebase_url(target, parts.uri.path_and_query().map(|pq| pq.as_str()));
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ForwardError::Body(e.to_string()))?;

        let mut builder = self.http.request(parts.method.clone(), url);
        for (name, value) in &parts.headers {
            if SKIPPED_REQUEST_HEADERS.contains(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !bytes.is_empty() {
            builder = builder.body(bytes);
        }

        let upstream = builder.send().await?;

        let mut response = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if SKIPPED_RESPONSE_HEADERS.contains(name) {
                continue;
            }
            response = response.header(name, value);
        }
        let body = upstream.bytes().await?;
        response
            .body(Body::from(body))
            .map_err(|e| ForwardError::Upstream(e.to_string()))
    }
}

/// Append the original path and query onto the target, keeping any base path
/// prefix the target carries.
pub fn rebase_url(target: &Url, path_and_query: Option<&str>) -> Url {
    let pq = path_and_query.unwrap_or("/");
    let (path, query) = match pq.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (pq, None),
    };

    let mut url = target.clone();
    let base = target.path().trim_end_matches('/');
    url.set_path(&format!("{base}{path}"));
    url.set_query(query);
    url
}

/// Injects or strips the identity header, then hands off to the transport.
pub struct ForwardingDispatcher {
    target: Url,
    principal_header: HeaderName,
    forwarder: Arc<dyn Forwarder>,
}

impl ForwardingDispatcher {
    pub fn new(target: Url, principal_header: HeaderName, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            target,
            principal_header,
            forwarder,
        }
    }

    /// Forward an authenticated request with the identity header set to the
    /// resolved principal.
    pub async fn forward_as_principal(&self, username: &str, mut req: Request<Body>) -> Response {
        let value = match HeaderValue::from_str(username) {
            Ok(value) => value,
            Err(_) => {
                error!(%username, "principal is not a valid header value");
                return (StatusCode::INTERNAL_SERVER_ERROR, "invalid principal").into_response();
            }
        };
        req.headers_mut().insert(self.principal_header.clone(), value);
        self.dispatch(req).await
    }

    /// Forward without an authenticated principal. The identity header is
    /// removed so the backend sees only its own credential checks.
    pub async fn forward_anonymous(&self, mut req: Request<Body>) -> Response {
        req.headers_mut().remove(&self.principal_header);
        self.dispatch(req).await
    }

    async fn dispatch(&self, req: Request<Body>) -> Response {
        match self.forwarder.forward(&self.target, req).await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "forwarding to backend failed");
                (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
            }
        }
    }
}
