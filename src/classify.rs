//! Request classification (browser vs. machine client, single-logout
//! callbacks, resource paths) plus small header helpers shared by the
//! admission stages.
//!
//! Classification runs once at ingress. Single-logout detection has to look
//! at the form body, so the body is buffered and restored here; later stages
//! and the forwarder read it as if nothing happened.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const LOGOUT_REQUEST_FIELD: &str = "logoutRequest";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Per-request classification computed at ingress.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestClass {
    /// User-Agent looks like an interactive browser, or the request is a
    /// single-logout callback.
    pub browser: bool,
    /// POST form carrying a non-empty `logoutRequest` field.
    pub single_logout: bool,
}

/// Tags attached at ingress and consumed by the later stages. Request-scoped,
/// never shared between requests.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestMetadata {
    /// Caller matched the configured service-account naming pattern.
    pub is_service_account: bool,
    /// Non-browser request eligible to skip ticket validation and let the
    /// backend apply its own credential check.
    pub bypass_authentication: bool,
}

pub fn is_browser_user_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    ua.contains("mozilla") || ua.contains("opera")
}

/// Substring containment, deliberately permissive (no path-segment
/// alignment required).
pub fn matches_resource_path(path: &str, configured: &str) -> bool {
    path.contains(configured)
}

/// Decode `Authorization: Basic …` into a `(username, password)` pair.
pub fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// First address of `X-Forwarded-For`, trimmed. The reverse proxy in front
/// of us may append localhost addresses, only the first entry identifies the
/// caller. Empty string when the header is absent.
pub fn first_forwarded_ip(headers: &HeaderMap) -> String {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn is_form_urlencoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case(FORM_URLENCODED)
        })
        .unwrap_or(false)
}

/// Does a buffered form body carry a non-empty `logoutRequest` field?
pub fn has_logout_request_field(body: &[u8]) -> bool {
    url::form_urlencoded::parse(body)
        .any(|(name, value)| name == LOGOUT_REQUEST_FIELD && !value.is_empty())
}

/// Classify a request. When single-logout detection needs the form body it
/// is buffered in full and restored on the returned request.
pub async fn classify(req: Request<Body>) -> Result<(Request<Body>, RequestClass), axum::Error> {
    let browser_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(is_browser_user_agent)
        .unwrap_or(false);

    if req.method() != Method::POST || !is_form_urlencoded(req.headers()) {
        let class = RequestClass {
            browser: browser_agent,
            single_logout: false,
        };
        return Ok((req, class));
    }

    let (parts, body) = req.into_parts();
    let bytes: Bytes = axum::body::to_bytes(body, usize::MAX).await?;
    let single_logout = has_logout_request_field(&bytes);
    let req = Request::from_parts(parts, Body::from(bytes));

    let class = RequestClass {
        browser: browser_agent || single_logout,
        single_logout,
    };
    Ok((req, class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const IE: &str = "Mozilla/5.0 (compatible; MSIE 10.0; Windows NT 6.1; Trident/6.0)";
    const SAFARI: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15";
    const ANDROID: &str = "Mozilla/5.0 (Linux; U; Android 4.0.3; ko-kr; LG-L160L Build/IML74K) AppleWebkit/534.30 (KHTML, like Gecko) Version/4.0 Mobile Safari/534.30";
    const OPERA: &str = "Opera/9.80 (X11; Linux i686; Ubuntu/14.10) Presto/2.12.388 Version/12.16";
    const OPERA_MINI: &str = "Opera/9.80 (Android; Opera Mini/7.6.40234/28.3392; U; en) Presto/2.8.119 Version/11.10";
    const GIT_LFS: &str = "git-lfs/2.5.1 (GitHub; linux amd64; go 1.10.3)";

    #[test]
    fn browser_user_agents_are_recognized() {
        for ua in [CHROME, FIREFOX, IE, SAFARI, ANDROID, OPERA, OPERA_MINI] {
            assert!(is_browser_user_agent(ua), "expected browser: {ua}");
        }
    }

    #[test]
    fn non_browser_user_agent_is_rejected() {
        assert!(!is_browser_user_agent(GIT_LFS));
        assert!(!is_browser_user_agent(""));
    }

    #[test]
    fn resource_path_matches_by_substring() {
        assert!(matches_resource_path("/app/static/logo.png", "/static"));
        assert!(matches_resource_path("/prefix/staticfiles/x", "/static"));
        assert!(!matches_resource_path("/app/dynamic", "/static"));
    }

    #[test]
    fn basic_auth_decodes_credentials() {
        let mut headers = HeaderMap::new();
        // admin:secret
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic YWRtaW46c2VjcmV0"),
        );
        assert_eq!(
            basic_auth(&headers),
            Some(("admin".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn basic_auth_rejects_malformed_values() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        assert_eq!(basic_auth(&headers), None);

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic !!!not-base64!!!"),
        );
        assert_eq!(basic_auth(&headers), None);

        assert_eq!(basic_auth(&HeaderMap::new()), None);
    }

    #[test]
    fn first_forwarded_ip_takes_first_entry_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static(" 10.0.0.1 , 127.0.0.1"),
        );
        assert_eq!(first_forwarded_ip(&headers), "10.0.0.1");
    }

    #[test]
    fn first_forwarded_ip_defaults_to_empty() {
        assert_eq!(first_forwarded_ip(&HeaderMap::new()), "");
    }

    #[test]
    fn logout_request_field_detection() {
        assert!(has_logout_request_field(
            b"logoutRequest=%3Csamlp%3ALogoutRequest%2F%3E"
        ));
        assert!(!has_logout_request_field(b"logoutRequest="));
        assert!(!has_logout_request_field(b"other=value"));
        assert!(!has_logout_request_field(b""));
    }

    #[tokio::test]
    async fn classify_flags_single_logout_and_restores_body() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/callback")
            .header(header::CONTENT_TYPE, FORM_URLENCODED)
            .header(header::USER_AGENT, GIT_LFS)
            .body(Body::from("logoutRequest=payload"))
            .unwrap();

        let (req, class) = classify(req).await.unwrap();
        assert!(class.single_logout);
        // A single-logout callback counts as a browser request.
        assert!(class.browser);

        let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"logoutRequest=payload");
    }

    #[tokio::test]
    async fn classify_plain_rest_request() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/things")
            .header(header::USER_AGENT, GIT_LFS)
            .body(Body::empty())
            .unwrap();

        let (_req, class) = classify(req).await.unwrap();
        assert!(!class.browser);
        assert!(!class.single_logout);
    }

    #[tokio::test]
    async fn classify_browser_get() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/")
            .header(header::USER_AGENT, CHROME)
            .body(Body::empty())
            .unwrap();

        let (_req, class) = classify(req).await.unwrap();
        assert!(class.browser);
        assert!(!class.single_logout);
    }
}
