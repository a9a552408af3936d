//! CAS-style ticket client: service-ticket validation, an in-memory session
//! registry keyed by an opaque cookie, login redirects and single-logout.
//!
//! Validation uses the JSON rendering of the `p3/serviceValidate` endpoint,
//! so the response parses with serde instead of an XML stack. Sessions live
//! in process memory; a single-logout callback removes the session that was
//! established by the named service ticket.

use std::collections::HashMap;
use std::mem;

use async_trait::async_trait;
use axum::http::request::Parts;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Redirect, Response};
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::services::ticket::{Principal, TicketClient, TicketError, UserAttributes};

const SESSION_COOKIE: &str = "sso-gate-session";
const TICKET_PARAM: &str = "ticket";

struct Session {
    principal: Principal,
    /// Consumed by the first `is_first_authenticated_request` query.
    fresh: bool,
}

pub struct CasTicketClient {
    http: reqwest::Client,
    login_url: Url,
    validate_url: Url,
    service_url: Url,
    /// session id → session
    sessions: Mutex<HashMap<String, Session>>,
    /// service ticket → session id, kept for cookie issuance and single-logout
    tickets: Mutex<HashMap<String, String>>,
    session_index: Regex,
}

impl CasTicketClient {
    /// `cas_url` is the base of the ticket service (e.g. `https://sso.example.com/cas`),
    /// `service_url` the public URL of this proxy as registered with it.
    pub fn new(cas_url: &Url, service_url: &Url, http: reqwest::Client) -> Self {
        let login_url = url_with_subpath(cas_url, "login");
        let validate_url = url_with_subpath(cas_url, "p3/serviceValidate");
        // The session index element names the service ticket that opened the session.
        let session_index = Regex::new(r"<(?:\w+:)?SessionIndex>([^<]+)</(?:\w+:)?SessionIndex>")
            .expect("session index pattern compiles");

        Self {
            http,
            login_url,
            validate_url,
            service_url: service_url.clone(),
            sessions: Mutex::new(HashMap::new()),
            tickets: Mutex::new(HashMap::new()),
            session_index,
        }
    }

    /// The service parameter sent to the ticket service: this proxy's public
    /// URL with the originally requested path and query appended, so the
    /// caller lands back where they started after login. The ticket itself is
    /// never part of the service it was issued for.
    fn service_for(&self, parts: &Parts) -> String {
        let base = self.service_url.as_str().trim_end_matches('/');
        let path = parts.uri.path();

        let remaining: Vec<(String, String)> = parts
            .uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .filter(|(name, _)| name != TICKET_PARAM)
                    .map(|(name, value)| (name.into_owned(), value.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        if remaining.is_empty() {
            format!("{base}{path}")
        } else {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(remaining)
                .finish();
            format!("{base}{path}?{query}")
        }
    }

    fn ticket_param(parts: &Parts) -> Option<String> {
        let query = parts.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == TICKET_PARAM)
            .map(|(_, value)| value.into_owned())
    }

    fn session_cookie(parts: &Parts) -> Option<String> {
        let cookies = parts.headers.get(header::COOKIE)?.to_str().ok()?;
        cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_string())
        })
    }

    /// Resolve the session id for a request: cookie first, then the ticket
    /// that validated during this very request (no cookie round trip yet).
    fn resolve_session_id(&self, parts: &Parts) -> Option<String> {
        if let Some(sid) = Self::session_cookie(parts)
            && self.sessions.lock().contains_key(&sid)
        {
            return Some(sid);
        }
        let ticket = Self::ticket_param(parts)?;
        self.tickets.lock().get(&ticket).cloned()
    }

    async fn validate_ticket(&self, ticket: &str, service: &str) -> Result<Principal, TicketError> {
        let mut url = self.validate_url.clone();
        url.query_pairs_mut()
            .append_pair("service", service)
            .append_pair(TICKET_PARAM, ticket)
            .append_pair("format", "JSON");

        let body = self.http.get(url).send().await?.text().await?;
        parse_validation_response(&body)
    }

    #[cfg(test)]
    fn insert_session_for_ticket(&self, ticket: &str, principal: Principal) -> String {
        let sid = Uuid::new_v4().to_string();
        self.sessions.lock().insert(
            sid.clone(),
            Session {
                principal,
                fresh: true,
            },
        );
        self.tickets.lock().insert(ticket.to_string(), sid.clone());
        sid
    }
}

#[async_trait]
impl TicketClient for CasTicketClient {
    async fn is_authenticated(&self, parts: &Parts) -> bool {
        if self.resolve_session_id(parts).is_some() {
            return true;
        }

        let Some(ticket) = Self::ticket_param(parts) else {
            return false;
        };

        let service = self.service_for(parts);
        match self.validate_ticket(&ticket, &service).await {
            Ok(principal) => {
                let sid = Uuid::new_v4().to_string();
                info!(username = %principal.username, "ticket validated, session established");
                self.sessions.lock().insert(
                    sid.clone(),
                    Session {
                        principal,
                        fresh: true,
                    },
                );
                self.tickets.lock().insert(ticket, sid);
                true
            }
            Err(err) => {
                warn!(error = %err, "ticket validation failed");
                false
            }
        }
    }

    async fn is_first_authenticated_request(&self, parts: &Parts) -> bool {
        let Some(sid) = self.resolve_session_id(parts) else {
            return false;
        };
        let mut sessions = self.sessions.lock();
        sessions
            .get_mut(&sid)
            .map(|s| mem::replace(&mut s.fresh, false))
            .unwrap_or(false)
    }

    async fn username(&self, parts: &Parts) -> Option<String> {
        let sid = self.resolve_session_id(parts)?;
        let sessions = self.sessions.lock();
        sessions.get(&sid).map(|s| s.principal.username.clone())
    }

    async fn attributes(&self, parts: &Parts) -> UserAttributes {
        let Some(sid) = self.resolve_session_id(parts) else {
            return UserAttributes::default();
        };
        let sessions = self.sessions.lock();
        sessions
            .get(&sid)
            .map(|s| s.principal.attributes.clone())
            .unwrap_or_default()
    }

    fn redirect_to_login(&self, parts: &Parts) -> Response {
        let mut login = self.login_url.clone();
        login
            .query_pairs_mut()
            .append_pair("service", &self.service_for(parts));
        Redirect::to(login.as_str()).into_response()
    }

    async fn issue_cookie(&self, parts: &Parts) -> Option<HeaderValue> {
        if Self::session_cookie(parts).is_some() {
            return None;
        }
        let ticket = Self::ticket_param(parts)?;
        let sid = self.tickets.lock().get(&ticket).cloned()?;
        HeaderValue::from_str(&format!(
            "{SESSION_COOKIE}={sid}; Path=/; HttpOnly; SameSite=Lax"
        ))
        .ok()
    }

    async fn single_logout(&self, form: &[u8]) {
        let Some(message) = url::form_urlencoded::parse(form)
            .find(|(name, _)| name == "logoutRequest")
            .map(|(_, value)| value.into_owned())
        else {
            return;
        };

        let Some(ticket) = self
            .session_index
            .captures(&message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        else {
            debug!("single-logout callback without session index");
            return;
        };

        if let Some(sid) = self.tickets.lock().remove(&ticket) {
            self.sessions.lock().remove(&sid);
            info!(%ticket, "session terminated by single-logout");
        }
    }
}

/// Join a sub-path onto a base URL, keeping the base's own path prefix.
fn url_with_subpath(base: &Url, subpath: &str) -> Url {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), subpath);
    Url::parse(&joined).unwrap_or_else(|_| base.clone())
}

#[derive(Deserialize)]
struct ServiceResponseEnvelope {
    #[serde(rename = "serviceResponse")]
    service_response: ServiceResponseBody,
}

#[derive(Deserialize)]
struct ServiceResponseBody {
    #[serde(rename = "authenticationSuccess")]
    success: Option<AuthenticationSuccess>,
    #[serde(rename = "authenticationFailure")]
    failure: Option<AuthenticationFailure>,
}

#[derive(Deserialize)]
struct AuthenticationSuccess {
    user: String,
    #[serde(default)]
    attributes: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct AuthenticationFailure {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

fn parse_validation_response(body: &str) -> Result<Principal, TicketError> {
    let envelope: ServiceResponseEnvelope = serde_json::from_str(body)
        .map_err(|e| TicketError::MalformedResponse(e.to_string()))?;

    if let Some(success) = envelope.service_response.success {
        return Ok(Principal {
            username: success.user,
            attributes: normalize_attributes(success.attributes),
        });
    }

    if let Some(failure) = envelope.service_response.failure {
        return Err(TicketError::Rejected {
            code: failure.code,
            description: failure.description.trim().to_string(),
        });
    }

    Err(TicketError::MalformedResponse(
        "neither success nor failure present".to_string(),
    ))
}

/// Attribute values arrive as scalars or arrays; normalize both to lists.
fn normalize_attributes(raw: HashMap<String, serde_json::Value>) -> UserAttributes {
    raw.into_iter()
        .map(|(key, value)| {
            let values = match value {
                serde_json::Value::Array(items) => {
                    items.into_iter().map(scalar_to_string).collect()
                }
                other => vec![scalar_to_string(other)],
            };
            (key, values)
        })
        .collect()
}

fn scalar_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    fn client() -> CasTicketClient {
        let cas = Url::parse("https://sso.example.com/cas").unwrap();
        let service = Url::parse("https://proxy.example.com").unwrap();
        CasTicketClient::new(&cas, &service, reqwest::Client::new())
    }

    fn parts_for(uri: &str) -> Parts {
        let (parts, _) = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
    }

    fn parts_with_cookie(uri: &str, sid: &str) -> Parts {
        let (parts, _) = Request::builder()
            .uri(uri)
            .header(header::COOKIE, format!("{SESSION_COOKIE}={sid}"))
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
    }

    fn principal() -> Principal {
        Principal {
            username: "alice".to_string(),
            attributes: UserAttributes::from([(
                "mail".to_string(),
                vec!["alice@example.com".to_string()],
            )]),
        }
    }

    #[test]
    fn parses_successful_validation_response() {
        let body = r#"{
            "serviceResponse": {
                "authenticationSuccess": {
                    "user": "alice",
                    "attributes": {
                        "mail": ["alice@example.com"],
                        "givenName": "Alice",
                        "isMemberOf": ["admins", "users"]
                    }
                }
            }
        }"#;

        let principal = parse_validation_response(body).unwrap();
        assert_eq!(principal.username, "alice");
        assert_eq!(
            principal.attributes.get("mail"),
            Some(&vec!["alice@example.com".to_string()])
        );
        assert_eq!(
            principal.attributes.get("givenName"),
            Some(&vec!["Alice".to_string()])
        );
        assert_eq!(
            principal.attributes.get("isMemberOf"),
            Some(&vec!["admins".to_string(), "users".to_string()])
        );
    }

    #[test]
    fn parses_failed_validation_response() {
        let body = r#"{
            "serviceResponse": {
                "authenticationFailure": {
                    "code": "INVALID_TICKET",
                    "description": "Ticket ST-abc not recognized"
                }
            }
        }"#;

        let err = parse_validation_response(body).unwrap_err();
        match err {
            TicketError::Rejected { code, .. } => assert_eq!(code, "INVALID_TICKET"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_garbage_validation_response() {
        assert!(matches!(
            parse_validation_response("<html>not json</html>"),
            Err(TicketError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_validation_response(r#"{"serviceResponse": {}}"#),
            Err(TicketError::MalformedResponse(_))
        ));
    }

    #[test]
    fn login_redirect_carries_service_with_original_path() {
        let client = client();
        let parts = parts_for("/repo/browse?sort=name");

        let response = client.redirect_to_login(&parts);
        assert_eq!(response.status(), axum::http::StatusCode::SEE_OTHER);

        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with("https://sso.example.com/cas/login?service="));
        assert!(location.contains("proxy.example.com%2Frepo%2Fbrowse"));
    }

    #[tokio::test]
    async fn session_cookie_authenticates_and_first_flag_is_consumed_once() {
        let client = client();
        let sid = client.insert_session_for_ticket("ST-1", principal());
        let parts = parts_with_cookie("/anything", &sid);

        assert!(client.is_authenticated(&parts).await);
        assert_eq!(client.username(&parts).await.as_deref(), Some("alice"));
        assert!(client.is_first_authenticated_request(&parts).await);
        assert!(!client.is_first_authenticated_request(&parts).await);
        assert_eq!(
            client.attributes(&parts).await.get("mail"),
            Some(&vec!["alice@example.com".to_string()])
        );
    }

    #[tokio::test]
    async fn unknown_request_is_not_authenticated() {
        let client = client();
        let parts = parts_for("/anything");
        assert!(!client.is_authenticated(&parts).await);
        assert!(client.username(&parts).await.is_none());
        assert!(client.attributes(&parts).await.is_empty());
    }

    #[tokio::test]
    async fn cookie_is_issued_for_fresh_ticket_sessions_only() {
        let client = client();
        let sid = client.insert_session_for_ticket("ST-2", principal());

        let fresh = parts_for("/landing?ticket=ST-2");
        let cookie = client.issue_cookie(&fresh).await.expect("cookie issued");
        assert!(cookie.to_str().unwrap().contains(&sid));

        // Once the browser presents the cookie there is nothing to issue.
        let returning = parts_with_cookie("/landing?ticket=ST-2", &sid);
        assert!(client.issue_cookie(&returning).await.is_none());

        // No ticket, no cookie.
        assert!(client.issue_cookie(&parts_for("/landing")).await.is_none());
    }

    #[tokio::test]
    async fn single_logout_drops_the_named_session() {
        let client = client();
        let sid = client.insert_session_for_ticket("ST-99", principal());

        let message = "<samlp:LogoutRequest>\
             <samlp:SessionIndex>ST-99</samlp:SessionIndex>\
             </samlp:LogoutRequest>";
        let form = format!(
            "logoutRequest={}",
            url::form_urlencoded::byte_serialize(message.as_bytes()).collect::<String>()
        );

        client.single_logout(form.as_bytes()).await;

        let parts = parts_with_cookie("/anything", &sid);
        assert!(!client.is_authenticated(&parts).await);
    }

    #[tokio::test]
    async fn single_logout_ignores_unknown_tickets_and_garbage() {
        let client = client();
        let sid = client.insert_session_for_ticket("ST-5", principal());

        client.single_logout(b"logoutRequest=no-session-index").await;
        client.single_logout(b"unrelated=field").await;

        let parts = parts_with_cookie("/x", &sid);
        assert!(client.is_authenticated(&parts).await);
    }
}
