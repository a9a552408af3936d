//! Pipeline composition: validates the configuration into [`Settings`] and
//! assembles the admission chain around the gate.
//!
//! Everything that can be malformed (URLs, the principal header, the
//! service-account pattern, the logout method) is checked here, once, so
//! request handling never meets a half-built pipeline.

use axum::Router;
use axum::http::HeaderName;
use axum::middleware;
use thiserror::Error;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use url::Url;

use crate::config::{Config, ThrottleScope};
use crate::gate;
use crate::middleware::logout::{self, LogoutRule};
use crate::middleware::service_account::{self, ServiceAccountDetector};
use crate::middleware::throttle;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid target url {url:?}: {source}")]
    InvalidTargetUrl { url: String, source: url::ParseError },

    #[error("invalid ticket-service url {url:?}: {source}")]
    InvalidTicketServiceUrl { url: String, source: url::ParseError },

    #[error("invalid service url {url:?}: {source}")]
    InvalidServiceUrl { url: String, source: url::ParseError },

    #[error("invalid anonymous base url {url:?}: {source}")]
    InvalidAnonymousBaseUrl { url: String, source: url::ParseError },

    #[error("invalid replication url {url:?}: {source}")]
    InvalidReplicationUrl { url: String, source: url::ParseError },

    #[error("invalid principal header name {name:?}")]
    InvalidPrincipalHeader { name: String },

    #[error("invalid logout method {method:?}")]
    InvalidLogoutMethod { method: String },

    #[error("invalid service-account pattern {pattern:?}: {source}")]
    InvalidServiceAccountPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Anonymous-resource probing: both parts must be configured.
#[derive(Clone, Debug)]
pub struct ResourceSettings {
    pub base_url: Url,
    pub resource_path: String,
}

#[derive(Clone, Debug)]
pub struct ReplicationSettings {
    pub url: Url,
    pub username: String,
    pub password: String,
}

/// Validated, immutable view of the configuration the pipeline runs on.
pub struct Settings {
    pub target: Url,
    pub cas_url: Url,
    pub service_url: Url,
    pub principal_header: HeaderName,
    pub forward_unauthenticated_rest: bool,
    pub throttle_scope: ThrottleScope,
    pub service_accounts: Option<ServiceAccountDetector>,
    pub logout: Option<LogoutRule>,
    pub logout_url: Url,
    pub resources: Option<ResourceSettings>,
    pub replication: Option<ReplicationSettings>,
}

pub fn build_settings(config: &Config) -> Result<Settings, PipelineError> {
    let target = Url::parse(&config.target_url).map_err(|source| PipelineError::InvalidTargetUrl {
        url: config.target_url.clone(),
        source,
    })?;

    let cas_url =
        Url::parse(&config.cas_url).map_err(|source| PipelineError::InvalidTicketServiceUrl {
            url: config.cas_url.clone(),
            source,
        })?;

    let service_url =
        Url::parse(&config.service_url).map_err(|source| PipelineError::InvalidServiceUrl {
            url: config.service_url.clone(),
            source,
        })?;

    let logout_url = Url::parse(&format!(
        "{}/logout",
        config.cas_url.trim_end_matches('/')
    ))
    .map_err(|source| PipelineError::InvalidTicketServiceUrl {
        url: config.cas_url.clone(),
        source,
    })?;

    let principal_header = HeaderName::from_bytes(config.principal_header.as_bytes()).map_err(
        |_| PipelineError::InvalidPrincipalHeader {
            name: config.principal_header.clone(),
        },
    )?;

    let service_accounts = config
        .service_account_pattern
        .as_deref()
        .map(|pattern| {
            ServiceAccountDetector::new(pattern).map_err(|source| {
                PipelineError::InvalidServiceAccountPattern {
                    pattern: pattern.to_string(),
                    source,
                }
            })
        })
        .transpose()?;

    let logout = LogoutRule::from_config(
        config.logout_method.as_deref(),
        config.logout_path.as_deref(),
    )
    .map_err(|_| PipelineError::InvalidLogoutMethod {
        method: config.logout_method.clone().unwrap_or_default(),
    })?;

    let resources = match (&config.anonymous_base_url, &config.resource_path) {
        (Some(base), Some(path)) => {
            let base_url =
                Url::parse(base).map_err(|source| PipelineError::InvalidAnonymousBaseUrl {
                    url: base.clone(),
                    source,
                })?;
            Some(ResourceSettings {
                base_url,
                resource_path: path.clone(),
            })
        }
        (None, None) => None,
        _ => {
            warn!("anonymous resource probing needs both base url and resource path, ignoring");
            None
        }
    };

    let replication = config
        .replication
        .as_ref()
        .map(|r| {
            let url = Url::parse(&r.url).map_err(|source| PipelineError::InvalidReplicationUrl {
                url: r.url.clone(),
                source,
            })?;
            Ok(ReplicationSettings {
                url,
                username: r.username.clone(),
                password: r.password.clone(),
            })
        })
        .transpose()?;

    Ok(Settings {
        target,
        cas_url,
        service_url,
        principal_header,
        forward_unauthenticated_rest: config.forward_unauthenticated_rest,
        throttle_scope: config.throttle_scope,
        service_accounts,
        logout,
        logout_url,
        resources,
        replication,
    })
}

/// Assemble the admission chain. Execution order is fixed: service-account
/// tagging, then throttling, then logout redirection (when configured),
/// then the gate as fallback handler.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .fallback(gate::dispatch)
        .with_state(state.clone());

    // Layers added later wrap the ones added earlier, so this reads
    // innermost to outermost.
    if state.settings.logout.is_some() {
        router = router.layer(middleware::from_fn_with_state(
            state.clone(),
            logout::redirect,
        ));
    }
    router = router
        .layer(middleware::from_fn_with_state(state.clone(), throttle::limit))
        .layer(middleware::from_fn_with_state(state, service_account::tag));

    let request_id_header = HeaderName::from_static("x-request-id");
    router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base_config;

    #[test]
    fn valid_config_builds_settings() {
        let settings = build_settings(&base_config()).unwrap();
        assert_eq!(settings.target.as_str(), "http://backend:8080/");
        assert_eq!(
            settings.logout_url.as_str(),
            "https://sso.example.com/cas/logout"
        );
        assert_eq!(settings.principal_header.as_str(), "x-proxy-user");
        assert!(settings.logout.is_none());
        assert!(settings.resources.is_none());
        assert!(settings.service_accounts.is_none());
    }

    #[test]
    fn unparsable_target_url_fails_fast() {
        let mut config = base_config();
        config.target_url = "http://".to_string();
        assert!(matches!(
            build_settings(&config),
            Err(PipelineError::InvalidTargetUrl { .. })
        ));
    }

    #[test]
    fn unparsable_ticket_service_url_fails_fast() {
        let mut config = base_config();
        config.cas_url = "not a url".to_string();
        assert!(matches!(
            build_settings(&config),
            Err(PipelineError::InvalidTicketServiceUrl { .. })
        ));
    }

    #[test]
    fn broken_service_account_pattern_fails_fast() {
        let mut config = base_config();
        config.service_account_pattern = Some("([unclosed".to_string());
        assert!(matches!(
            build_settings(&config),
            Err(PipelineError::InvalidServiceAccountPattern { .. })
        ));
    }

    #[test]
    fn invalid_logout_method_fails_fast() {
        let mut config = base_config();
        config.logout_method = Some("NOT A METHOD".to_string());
        assert!(matches!(
            build_settings(&config),
            Err(PipelineError::InvalidLogoutMethod { .. })
        ));
    }

    #[test]
    fn invalid_principal_header_fails_fast() {
        let mut config = base_config();
        config.principal_header = "bad header\n".to_string();
        assert!(matches!(
            build_settings(&config),
            Err(PipelineError::InvalidPrincipalHeader { .. })
        ));
    }

    #[test]
    fn partial_resource_settings_are_ignored() {
        let mut config = base_config();
        config.resource_path = Some("/static".to_string());
        config.anonymous_base_url = None;
        let settings = build_settings(&config).unwrap();
        assert!(settings.resources.is_none());
    }

    #[test]
    fn complete_resource_settings_are_kept() {
        let mut config = base_config();
        config.resource_path = Some("/static".to_string());
        config.anonymous_base_url = Some("http://backend:8080".to_string());
        let settings = build_settings(&config).unwrap();
        let resources = settings.resources.unwrap();
        assert_eq!(resources.resource_path, "/static");
        assert_eq!(resources.base_url.as_str(), "http://backend:8080/");
    }
}
