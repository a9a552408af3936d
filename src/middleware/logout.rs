//! Redirects configured logout requests to the ticket service's logout
//! endpoint instead of forwarding them to the backend.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::info;

use crate::state::AppState;

/// Logout trigger: at least one of method/path is set; an unset part
/// matches anything.
#[derive(Clone, Debug)]
pub struct LogoutRule {
    method: Option<Method>,
    path_suffix: Option<String>,
}

impl LogoutRule {
    /// Returns `None` when neither trigger is configured, in which case the
    /// stage is left out of the chain entirely.
    pub fn from_config(
        method: Option<&str>,
        path_suffix: Option<&str>,
    ) -> Result<Option<Self>, axum::http::method::InvalidMethod> {
        let method = method
            .filter(|m| !m.is_empty())
            .map(Method::try_from)
            .transpose()?;
        let path_suffix = path_suffix
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        if method.is_none() && path_suffix.is_none() {
            return Ok(None);
        }
        Ok(Some(Self {
            method,
            path_suffix,
        }))
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.as_ref().is_none_or(|m| m == method)
            && self
                .path_suffix
                .as_deref()
                .is_none_or(|suffix| path.ends_with(suffix))
    }
}

pub async fn redirect(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if let Some(rule) = &state.settings.logout
        && rule.matches(req.method(), req.uri().path())
    {
        info!(logout_url = %state.settings.logout_url, "redirecting logout request");
        return Redirect::to(state.settings.logout_url.as_str()).into_response();
    }
    next.run(req).await
}
