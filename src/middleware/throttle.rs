//! Throttling stage: admits or rejects machine-account traffic based on the
//! caller's token bucket.
//!
//! The stage runs after ingress tagging and before the authentication gate.
//! A rejected request never reaches a downstream stage; an admitted one is
//! observed on the way back so a successful round trip clears the caller's
//! throttling history.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};

use crate::classify::{self, RequestClass, RequestMetadata};
use crate::config::ThrottleScope;
use crate::error::AppError;
use crate::state::AppState;

pub async fn limit(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let class = req
        .extensions()
        .get::<RequestClass>()
        .copied()
        .unwrap_or_default();
    let metadata = req
        .extensions()
        .get::<RequestMetadata>()
        .copied()
        .unwrap_or_default();

    let applies = match state.settings.throttle_scope {
        ThrottleScope::ServiceAccounts => metadata.is_service_account,
        ThrottleScope::AllRest => !class.browser,
    };
    if !applies {
        return next.run(req).await;
    }

    let Some((username, _password)) = classify::basic_auth(req.headers()) else {
        return AppError::MissingCredentials.into_response();
    };
    let ip = classify::first_forwarded_ip(req.headers());
    debug!(%username, %ip, "extracted identity for throttling");

    let identity = format!("{ip}:{username}");

    if !state.limiter.allow(&identity) {
        info!(path = %req.uri().path(), %username, %ip, "throttling request");
        return AppError::Throttled.into_response();
    }

    if let Some(tokens) = state.limiter.tokens(&identity) {
        debug!(%username, %ip, tokens, "tokens left after admission");
    }

    let response = next.run(req).await;

    // A successful round trip forgives the throttling history; failures keep
    // draining the bucket.
    if response.status().is_success() || response.status().is_redirection() {
        state.limiter.forget(&identity);
    }

    response
}
