use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::{config::ConfigError, IngressState};

pub const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";
pub const ALLOWED_HEADERS: &str =
    "Content-Type, Authorization, Set-Cookie, connect-protocol-version";

/// Cross-origin headers stamped on every response under the mount path.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_origin: HeaderValue,
}

impl CorsPolicy {
    /// Resolves the allowed origin: `public_url` when set and non-empty,
    /// otherwise `client_url`, otherwise an empty value.
    pub fn new(public_url: Option<&str>, client_url: Option<&str>) -> Result<Self, ConfigError> {
        let origin = public_url
            .filter(|value| !value.is_empty())
            .or(client_url)
            .unwrap_or_default();

        let allow_origin = HeaderValue::from_str(origin).map_err(|_| ConfigError::InvalidOrigin)?;
        Ok(Self { allow_origin })
    }

    pub fn allow_origin(&self) -> &HeaderValue {
        &self.allow_origin
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            self.allow_origin.clone(),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

pub async fn apply_cors_policy(
    State(state): State<IngressState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        debug!(
            path = %request.uri().path(),
            origin = ?request.headers().get(header::ORIGIN),
            "answering preflight"
        );
        let mut response = StatusCode::OK.into_response();
        state.cors.apply(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    state.cors.apply(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_takes_precedence() {
        let policy = CorsPolicy::new(
            Some("https://app.example.com"),
            Some("https://fallback.example.com"),
        )
        .expect("valid origin");
        assert_eq!(policy.allow_origin(), "https://app.example.com");
    }

    #[test]
    fn empty_public_url_uses_client_url() {
        let policy = CorsPolicy::new(Some(""), Some("https://fallback.example.com"))
            .expect("valid origin");
        assert_eq!(policy.allow_origin(), "https://fallback.example.com");
    }

    #[test]
    fn no_origin_configured_yields_empty_value() {
        let policy = CorsPolicy::new(None, None).expect("empty origin is allowed");
        assert_eq!(policy.allow_origin(), "");
    }

    #[test]
    fn control_characters_are_rejected() {
        let err = CorsPolicy::new(Some("https://app.example.com\n"), None)
            .expect_err("newline is not a header value");
        assert!(matches!(err, ConfigError::InvalidOrigin));
    }

    #[test]
    fn apply_sets_all_four_headers() {
        let policy = CorsPolicy::new(Some("https://app.example.com"), None).expect("valid origin");
        let mut headers = HeaderMap::new();
        policy.apply(&mut headers);

        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example.com");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOWED_HEADERS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }
}
