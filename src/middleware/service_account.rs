//! Ingress classification: buffers the body where single-logout detection
//! needs it, then tags requests issued by service accounts.
//!
//! The tags ride on the request as extensions (see
//! [`crate::classify::RequestMetadata`]), the same way an authentication
//! context would be handed from middleware to a handler.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use regex::Regex;
use tracing::debug;

use crate::classify::{self, RequestMetadata};
use crate::error::AppError;
use crate::state::AppState;

/// Decides whether a caller is a service account, from the configured
/// naming pattern. Construction fails on an invalid pattern so the pipeline
/// never starts half-built.
pub struct ServiceAccountDetector {
    pattern: Regex,
}

impl ServiceAccountDetector {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, username: &str) -> bool {
        self.pattern.is_match(username)
    }
}

/// Classify the request and attach its metadata tags.
pub async fn tag(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let (mut req, class) = classify::classify(req)
        .await
        .map_err(|_| AppError::BodyRead)?;

    let mut metadata = RequestMetadata {
        is_service_account: false,
        bypass_authentication: state.settings.forward_unauthenticated_rest && !class.browser,
    };

    if metadata.bypass_authentication
        && let Some(detector) = &state.settings.service_accounts
        && let Some((username, _)) = classify::basic_auth(req.headers())
        && detector.matches(&username)
    {
        debug!(%username, "request authenticates as a service account");
        metadata.is_service_account = true;
    }

    req.extensions_mut().insert(class);
    req.extensions_mut().insert(metadata);

    Ok(next.run(req).await)
}
