//! Authentication gate: the handler behind the admission stages.
//!
//! Decides, per request, between forwarding with an injected principal,
//! forwarding for backend-side credential checks, serving a public resource
//! anonymously, answering a single-logout callback, and redirecting to
//! login. Every branch ends in a definite response.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, info, warn};

use crate::classify::{self, RequestClass, RequestMetadata};
use crate::pipeline::ResourceSettings;
use crate::state::AppState;

pub async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response {
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

    let (parts, body) = req.into_parts();

    if state.tickets.is_authenticated(&parts).await {
        return authenticated(&state, parts, body).await;
    }

    debug!(uri = %parts.uri, "unauthenticated request");

    if class.single_logout {
        return single_logout(&state, body).await;
    }

    if metadata.bypass_authentication {
        // Forwarded for backend-side credential checks; the identity header
        // is stripped by the dispatcher.
        let username = classify::basic_auth(&parts.headers)
            .map(|(username, _)| username)
            .unwrap_or_default();
        info!(uri = %parts.uri, %username, "forwarding unauthenticated machine request");
        return state
            .dispatcher
            .forward_anonymous(Request::from_parts(parts, body))
            .await;
    }

    if class.browser
        && let Some(resources) = &state.settings.resources
        && classify::matches_resource_path(parts.uri.path(), &resources.resource_path)
    {
        return anonymous_resource(&state, resources, parts, body).await;
    }

    info!(uri = %parts.uri, "redirecting to login");
    state.tickets.redirect_to_login(&parts)
}

async fn authenticated(state: &AppState, parts: Parts, body: Body) -> Response {
    let Some(username) = state.tickets.username(&parts).await else {
        warn!(uri = %parts.uri, "authenticated request without a resolvable principal");
        return state.tickets.redirect_to_login(&parts);
    };

    if state.tickets.is_first_authenticated_request(&parts).await
        && let Some(replicator) = &state.replicator
    {
        let attributes = state.tickets.attributes(&parts).await;
        if let Err(err) = replicator.replicate(&username, &attributes).await {
            // Best-effort: the request is forwarded regardless.
            error!(error = %err, %username, "failed to replicate user");
        }
    }

    let session_cookie = state.tickets.issue_cookie(&parts).await;

    info!(uri = %parts.uri, %username, "forwarding authenticated request");
    let mut response = state
        .dispatcher
        .forward_as_principal(&username, Request::from_parts(parts, body))
        .await;

    if let Some(cookie) = session_cookie {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

async fn single_logout(state: &AppState, body: Body) -> Response {
    // The body was buffered at ingress, collecting it again is in-memory.
    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            state.tickets.single_logout(&bytes).await;
            StatusCode::OK.into_response()
        }
        Err(err) => {
            warn!(error = %err, "failed to read single-logout callback body");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn anonymous_resource(
    state: &AppState,
    resources: &ResourceSettings,
    parts: Parts,
    body: Body,
) -> Response {
    let target = format!(
        "{}{}",
        resources.base_url.as_str().trim_end_matches('/'),
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );

    match state.probe.status(&target).await {
        Ok(status) if status >= 400 => {
            debug!(uri = %parts.uri, status, "resource unavailable, redirecting to login");
            state.tickets.redirect_to_login(&parts)
        }
        Ok(_) => {
            info!(uri = %parts.uri, "delivering resource on anonymous request");
            state
                .dispatcher
                .forward_anonymous(Request::from_parts(parts, body))
                .await
        }
        Err(err) => {
            // A failed probe counts as an unavailable resource.
            error!(error = %err, uri = %parts.uri, "resource probe failed");
            state.tickets.redirect_to_login(&parts)
        }
    }
}
