//! Ticket-service client capability.
//!
//! The single-sign-on protocol itself lives behind this trait; the pipeline
//! only ever asks the questions below and can be exercised with fakes. The
//! production implementation speaking the CAS-style protocol is
//! [`cas::CasTicketClient`].

pub mod cas;

pub use cas::CasTicketClient;

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderValue;
use axum::http::request::Parts;
use axum::response::Response;
use thiserror::Error;

/// Attribute bag delivered by the ticket service (key → list of values).
pub type UserAttributes = HashMap<String, Vec<String>>;

/// Principal resolved from a validated ticket.
#[derive(Clone, Debug)]
pub struct Principal {
    pub username: String,
    pub attributes: UserAttributes,
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("ticket validation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ticket rejected: {code}: {description}")]
    Rejected { code: String, description: String },

    #[error("malformed validation response: {0}")]
    MalformedResponse(String),
}

/// Capability consumed by the authentication gate.
///
/// Implementations must be cheap to share behind an `Arc` and safe to call
/// concurrently; all session state is owned by the implementation.
#[async_trait]
pub trait TicketClient: Send + Sync {
    /// Whether the request carries a valid authenticated session.
    async fn is_authenticated(&self, parts: &Parts) -> bool;

    /// True exactly once per session, for the request that established it.
    async fn is_first_authenticated_request(&self, parts: &Parts) -> bool;

    /// Username of the authenticated principal, if any.
    async fn username(&self, parts: &Parts) -> Option<String>;

    /// Attribute bag of the authenticated principal. Empty when the request
    /// is not authenticated.
    async fn attributes(&self, parts: &Parts) -> UserAttributes;

    /// Redirect an unauthenticated interactive request to the login page.
    fn redirect_to_login(&self, parts: &Parts) -> Response;

    /// Session cookie to attach to the response when this request just
    /// established a session.
    async fn issue_cookie(&self, _parts: &Parts) -> Option<HeaderValue> {
        None
    }

    /// Handle a single-logout callback body (tear down the named session).
    async fn single_logout(&self, _form: &[u8]) {}
}
