use std::sync::Arc;

use axum::{middleware, routing::any, Router};

pub mod config;
pub mod errors;
pub mod http;
pub mod listener;
pub mod logging;
pub mod rpc;
pub mod server;

use http::cors::CorsPolicy;
use rpc::{Interceptor, RpcService};

#[derive(Clone)]
pub struct IngressState {
    pub mount_path: Arc<str>,
    pub cors: Arc<CorsPolicy>,
    pub service: Arc<dyn RpcService>,
    pub interceptor: Arc<dyn Interceptor>,
}

impl IngressState {
    pub fn new(
        mount_path: impl Into<Arc<str>>,
        cors: CorsPolicy,
        service: Arc<dyn RpcService>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Self {
        Self {
            mount_path: mount_path.into(),
            cors: Arc::new(cors),
            service,
            interceptor,
        }
    }
}

/// Mounts the RPC service under `state.mount_path`.
///
/// Requests under the mount path pass, in order, through the cross-origin
/// policy, call-context injection, the interceptor and the service.
pub fn build_app(state: IngressState) -> Router {
    let mount_path = state.mount_path.to_string();

    let rpc = Router::new()
        .route(&mount_path, any(http::handlers::dispatch))
        .route(
            &format!("{mount_path}{{*procedure}}"),
            any(http::handlers::dispatch),
        )
        .route_layer(middleware::from_fn(http::context::inject_call_context))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            http::cors::apply_cors_policy,
        ));

    Router::new()
        .merge(rpc)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{
        body::{Body, Bytes},
        http::{header, HeaderValue, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::{
        config::{Settings, DEFAULT_MOUNT_PATH},
        errors::{Code, RpcError},
        http::{
            context::CallContext,
            cors::{ALLOWED_HEADERS, ALLOWED_METHODS},
        },
        rpc::{Next, PassThrough, UnaryRequest, UnaryResponse},
    };

    use super::*;

    /// Echoes back what it saw of the transport and counts invocations.
    #[derive(Default)]
    struct ProbeService {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcService for ProbeService {
        async fn call(
            &self,
            ctx: CallContext,
            request: UnaryRequest,
        ) -> Result<UnaryResponse, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            match request.procedure.as_str() {
                "Login" => {
                    let transport = ctx
                        .transport()
                        .ok_or_else(|| RpcError::internal("no transport handles"))?;
                    transport
                        .response()
                        .set_cookie(HeaderValue::from_static("session=abc; HttpOnly"));
                    Ok(UnaryResponse::new(request.body))
                }
                "Probe" => {
                    // Let concurrent requests overlap before reading the handles.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let transport = ctx
                        .transport()
                        .ok_or_else(|| RpcError::internal("no transport handles"))?;
                    let probe = transport
                        .request()
                        .headers
                        .get("x-probe")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    Ok(UnaryResponse::new(probe))
                }
                "Reject" => Err(RpcError::invalid_argument("email is malformed")),
                "Size" => Ok(UnaryResponse::new(request.body.len().to_string())),
                other => Err(RpcError::unimplemented(format!("{other} is not implemented"))),
            }
        }
    }

    struct RequireAuthorization;

    #[async_trait]
    impl Interceptor for RequireAuthorization {
        async fn intercept(
            &self,
            ctx: CallContext,
            request: UnaryRequest,
            next: Next<'_>,
        ) -> Result<UnaryResponse, RpcError> {
            if !request.headers.contains_key(header::AUTHORIZATION) {
                return Err(RpcError::unauthenticated("missing authorization header"));
            }
            next.run(ctx, request).await
        }
    }

    fn state_with(
        service: Arc<ProbeService>,
        interceptor: Arc<dyn Interceptor>,
        public_url: Option<&str>,
        client_url: Option<&str>,
    ) -> IngressState {
        IngressState::new(
            DEFAULT_MOUNT_PATH,
            CorsPolicy::new(public_url, client_url).expect("valid origin"),
            service,
            interceptor,
        )
    }

    fn app(service: Arc<ProbeService>) -> Router {
        build_app(state_with(
            service,
            Arc::new(PassThrough),
            Some("https://app.example.com"),
            None,
        ))
    }

    fn rpc_request(method: &str, procedure: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("{DEFAULT_MOUNT_PATH}{procedure}"))
            .method(method)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"email\":\"a@example.com\"}"))
            .expect("request build")
    }

    async fn body_bytes(response: axum::response::Response) -> Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
    }

    fn assert_cors_headers(response: &axum::response::Response, origin: &str) {
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], origin);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOWED_HEADERS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn preflight_short_circuits_with_cors_headers() {
        let service = Arc::new(ProbeService::default());
        let response = app(service.clone())
            .oneshot(rpc_request("OPTIONS", "Login"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors_headers(&response, "https://app.example.com");
        assert!(body_bytes(response).await.is_empty());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preflight_on_bare_mount_path_is_answered() {
        let service = Arc::new(ProbeService::default());
        let response = app(service.clone())
            .oneshot(rpc_request("OPTIONS", ""))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors_headers(&response, "https://app.example.com");
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn post_invokes_handler_once_with_cors_headers() {
        let service = Arc::new(ProbeService::default());
        let response = app(service.clone())
            .oneshot(rpc_request("POST", "Login"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors_headers(&response, "https://app.example.com");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            body_bytes(response).await,
            Bytes::from_static(b"{\"email\":\"a@example.com\"}")
        );
    }

    #[tokio::test]
    async fn get_invokes_handler_once() {
        let service = Arc::new(ProbeService::default());
        let response = app(service.clone())
            .oneshot(rpc_request("GET", "Login"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors_headers(&response, "https://app.example.com");
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cookies_written_through_transport_reach_the_client() {
        let response = app(Arc::new(ProbeService::default()))
            .oneshot(rpc_request("POST", "Login"))
            .await
            .expect("request execution");

        assert_eq!(
            response.headers()[header::SET_COOKIE],
            "session=abc; HttpOnly"
        );
    }

    #[tokio::test]
    async fn concurrent_requests_see_their_own_transport_handles() {
        let router = app(Arc::new(ProbeService::default()));

        let probe = |value: &'static str| {
            Request::builder()
                .uri(format!("{DEFAULT_MOUNT_PATH}Probe"))
                .method("POST")
                .header("x-probe", value)
                .body(Body::empty())
                .expect("request build")
        };

        let (first, second) = tokio::join!(
            router.clone().oneshot(probe("first")),
            router.clone().oneshot(probe("second")),
        );

        let first = first.expect("request execution");
        let second = second.expect("request execution");
        assert_eq!(body_bytes(first).await, Bytes::from_static(b"first"));
        assert_eq!(body_bytes(second).await, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn handler_errors_propagate_with_their_code() {
        let response = app(Arc::new(ProbeService::default()))
            .oneshot(rpc_request("POST", "Reject"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_cors_headers(&response, "https://app.example.com");
        let body_json: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).expect("valid json response");
        assert_eq!(body_json["code"], "invalid_argument");
        assert_eq!(body_json["message"], "email is malformed");
    }

    #[tokio::test]
    async fn large_bodies_reach_the_handler_intact() {
        let payload = vec![b'x'; 5 * 1024 * 1024];
        let request = Request::builder()
            .uri(format!("{DEFAULT_MOUNT_PATH}Size"))
            .method("POST")
            .header(header::CONTENT_TYPE, "application/proto")
            .body(Body::from(payload))
            .expect("request build");

        let response = app(Arc::new(ProbeService::default()))
            .oneshot(request)
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from("5242880"));
    }

    #[tokio::test]
    async fn unknown_procedure_is_unimplemented() {
        let response = app(Arc::new(ProbeService::default()))
            .oneshot(rpc_request("POST", "Register"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn interceptor_can_reject_before_the_handler() {
        let service = Arc::new(ProbeService::default());
        let router = build_app(state_with(
            service.clone(),
            Arc::new(RequireAuthorization),
            Some("https://app.example.com"),
            None,
        ));

        let response = router
            .clone()
            .oneshot(rpc_request("POST", "Login"))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_cors_headers(&response, "https://app.example.com");
        let body_json: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).expect("valid json response");
        assert_eq!(body_json["code"], Code::Unauthenticated.as_str());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);

        let mut authorized = rpc_request("POST", "Login");
        authorized
            .headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        let response = router
            .oneshot(authorized)
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn paths_outside_mount_are_not_found() {
        let service = Arc::new(ProbeService::default());
        let response = app(service.clone())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn public_url_from_settings_is_the_allowed_origin() {
        let settings = Settings::from_lookup(|key| match key {
            "PUBLIC_URL" => Some("https://app.example.com".to_string()),
            "PORT" => Some("8443".to_string()),
            _ => None,
        })
        .expect("settings should parse");
        let config = settings.server_config();
        assert_eq!(config.bind_port, 8443);

        let router = build_app(IngressState::new(
            config.mount_path.as_str(),
            CorsPolicy::new(config.public_url.as_deref(), config.client_url.as_deref())
                .expect("valid origin"),
            Arc::new(ProbeService::default()),
            Arc::new(PassThrough),
        ));
        let response = router
            .oneshot(rpc_request("OPTIONS", "Login"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors_headers(&response, "https://app.example.com");
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn client_url_is_used_when_public_url_is_unset() {
        let service = Arc::new(ProbeService::default());
        let router = build_app(state_with(
            service,
            Arc::new(PassThrough),
            None,
            Some("https://fallback.example.com"),
        ));

        for method in ["OPTIONS", "POST"] {
            let response = router
                .clone()
                .oneshot(rpc_request(method, "Login"))
                .await
                .expect("request execution");
            assert_cors_headers(&response, "https://fallback.example.com");
        }
    }
}
