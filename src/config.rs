/*
 * Responsibility
 * - 環境変数や設定の読み込み (TARGET_URL, CAS_URL, レートリミット設定など)
 * - 設定値のバリデーション (不足なら起動失敗)
 * - URL / regex の検証は pipeline::build_settings 側で行う
 */
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::limiter::{DEFAULT_BURST_SIZE, DEFAULT_EVICTION_INTERVAL, DEFAULT_TOKEN_RATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn from_env() -> Self {
        match std::env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Which requests the throttling stage applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleScope {
    /// Only requests tagged as service-account traffic.
    #[default]
    ServiceAccounts,
    /// Every non-browser request.
    AllRest,
}

impl FromStr for ThrottleScope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "service-accounts" => Ok(Self::ServiceAccounts),
            "all-rest" => Ok(Self::AllRest),
            _ => Err(()),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration: {}", key),
            ConfigError::Invalid(key) => write!(f, "invalid configuration: {}", key),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub app_env: AppEnv,

    pub target_url: String,
    pub cas_url: String,
    pub service_url: String,
    pub principal_header: String,

    pub logout_method: Option<String>,
    pub logout_path: Option<String>,

    pub service_account_pattern: Option<String>,
    pub forward_unauthenticated_rest: bool,
    pub throttle_scope: ThrottleScope,

    pub resource_path: Option<String>,
    pub anonymous_base_url: Option<String>,

    pub limiter_token_rate: u32,
    pub limiter_burst_size: u32,
    pub limiter_eviction_interval: Duration,

    pub skip_ssl_verification: bool,
    pub replication: Option<ReplicationConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let addr: SocketAddr = SocketAddr::from_str(&format!("0.0.0.0:{}", port))
            .map_err(|_| ConfigError::Invalid("PORT"))?;

        let app_env = AppEnv::from_env();

        let target_url =
            std::env::var("TARGET_URL").map_err(|_| ConfigError::Missing("TARGET_URL"))?;
        let cas_url = std::env::var("CAS_URL").map_err(|_| ConfigError::Missing("CAS_URL"))?;
        let service_url =
            std::env::var("SERVICE_URL").map_err(|_| ConfigError::Missing("SERVICE_URL"))?;

        let principal_header = std::env::var("PRINCIPAL_HEADER")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "X-Forwarded-User".to_string());

        let logout_method = optional("LOGOUT_METHOD");
        let logout_path = optional("LOGOUT_PATH");

        let service_account_pattern = optional("SERVICE_ACCOUNT_NAME_REGEX");
        let forward_unauthenticated_rest =
            bool_with_default("FORWARD_UNAUTHENTICATED_REST_REQUESTS", false)?;

        let throttle_scope = match optional("THROTTLE_SCOPE") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("THROTTLE_SCOPE"))?,
            None => ThrottleScope::default(),
        };

        let resource_path = optional("RESOURCE_PATH");
        let anonymous_base_url = optional("ANONYMOUS_BASE_URL");

        let limiter_token_rate = u32_with_default("LIMITER_TOKEN_RATE", DEFAULT_TOKEN_RATE)?;
        let limiter_burst_size = u32_with_default("LIMITER_BURST_SIZE", DEFAULT_BURST_SIZE)?;
        let limiter_eviction_interval = match optional("LIMITER_EVICTION_INTERVAL_SECONDS") {
            Some(raw) => {
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| ConfigError::Invalid("LIMITER_EVICTION_INTERVAL_SECONDS"))?;
                // Zero falls back to the historical default interval.
                if secs == 0 {
                    DEFAULT_EVICTION_INTERVAL
                } else {
                    Duration::from_secs(secs)
                }
            }
            None => DEFAULT_EVICTION_INTERVAL,
        };

        let skip_ssl_verification = bool_with_default("SKIP_SSL_VERIFICATION", false)?;

        let replication = match optional("REPLICATION_URL") {
            Some(url) => Some(ReplicationConfig {
                url,
                username: std::env::var("REPLICATION_USERNAME")
                    .map_err(|_| ConfigError::Missing("REPLICATION_USERNAME"))?,
                password: std::env::var("REPLICATION_PASSWORD")
                    .map_err(|_| ConfigError::Missing("REPLICATION_PASSWORD"))?,
            }),
            None => None,
        };

        Ok(Self {
            addr,
            app_env,
            target_url,
            cas_url,
            service_url,
            principal_header,
            logout_method,
            logout_path,
            service_account_pattern,
            forward_unauthenticated_rest,
            throttle_scope,
            resource_path,
            anonymous_base_url,
            limiter_token_rate,
            limiter_burst_size,
            limiter_eviction_interval,
            skip_ssl_verification,
            replication,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn bool_with_default(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key) {
        Some(raw) => parse_bool(&raw).ok_or(ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

fn u32_with_default(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match optional(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// A minimal valid configuration for composition tests.
    pub fn base_config() -> Config {
        Config {
            addr: SocketAddr::from_str("0.0.0.0:8080").unwrap(),
            app_env: AppEnv::Development,
            target_url: "http://backend:8080".to_string(),
            cas_url: "https://sso.example.com/cas".to_string(),
            service_url: "https://proxy.example.com".to_string(),
            principal_header: "x-proxy-user".to_string(),
            logout_method: None,
            logout_path: None,
            service_account_pattern: None,
            forward_unauthenticated_rest: false,
            throttle_scope: ThrottleScope::default(),
            resource_path: None,
            anonymous_base_url: None,
            limiter_token_rate: DEFAULT_TOKEN_RATE,
            limiter_burst_size: DEFAULT_BURST_SIZE,
            limiter_eviction_interval: DEFAULT_EVICTION_INTERVAL,
            skip_ssl_verification: false,
            replication: None,
        }
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn throttle_scope_parses_both_variants() {
        assert_eq!(
            "service-accounts".parse::<ThrottleScope>(),
            Ok(ThrottleScope::ServiceAccounts)
        );
        assert_eq!("all-rest".parse::<ThrottleScope>(), Ok(ThrottleScope::AllRest));
        assert!("everything".parse::<ThrottleScope>().is_err());
    }
}
