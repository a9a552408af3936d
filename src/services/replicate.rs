//! User replication toward a downstream user store.
//!
//! When a principal authenticates for the first time in a session, the gate
//! pushes a user record to the configured endpoint so the backend knows the
//! account before the first proxied request lands. Replication is
//! best-effort; failures are logged by the caller and never block
//! forwarding.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::services::ticket::UserAttributes;

#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("replication request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("replication endpoint returned status {0}")]
    Status(StatusCode),
}

#[async_trait]
pub trait UserReplicator: Send + Sync {
    async fn replicate(
        &self,
        username: &str,
        attributes: &UserAttributes,
    ) -> Result<(), ReplicateError>;
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ReplicatedUser<'a> {
    username: &'a str,
    first_name: &'a str,
    last_name: &'a str,
    email: &'a str,
}

impl<'a> ReplicatedUser<'a> {
    fn from_attributes(username: &'a str, attributes: &'a UserAttributes) -> Self {
        Self {
            username: first_or(attributes, "username", username),
            first_name: first_or(attributes, "givenName", ""),
            last_name: first_or(attributes, "surname", ""),
            email: first_or(attributes, "mail", ""),
        }
    }
}

fn first_or<'a>(attributes: &'a UserAttributes, key: &str, fallback: &'a str) -> &'a str {
    attributes
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
        .unwrap_or(fallback)
}

/// Replicator POSTing a JSON user record with basic auth.
pub struct RestUserReplicator {
    http: reqwest::Client,
    url: Url,
    username: String,
    password: String,
}

impl RestUserReplicator {
    pub fn new(http: reqwest::Client, url: Url, username: String, password: String) -> Self {
        Self {
            http,
            url,
            username,
            password,
        }
    }
}

#[async_trait]
impl UserReplicator for RestUserReplicator {
    async fn replicate(
        &self,
        username: &str,
        attributes: &UserAttributes,
    ) -> Result<(), ReplicateError> {
        let user = ReplicatedUser::from_attributes(username, attributes);

        let response = self
            .http
            .post(self.url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .json(&user)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ReplicateError::Status(status))
        }
    }
}
