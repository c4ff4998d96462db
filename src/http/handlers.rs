//! Axum handler for the mount path
//!
//! Turns an HTTP request into a [`UnaryRequest`], runs it through the
//! interception point and the method handlers, and renders the outcome.

use axum::{
    body::to_bytes,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::{
    errors::RpcError,
    http::context::CallContext,
    rpc::{Next, UnaryRequest, UnaryResponse},
    IngressState,
};

pub const DEFAULT_CONTENT_TYPE: &str = "application/proto";

pub async fn dispatch(State(state): State<IngressState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let procedure = parts
        .uri
        .path()
        .strip_prefix(&*state.mount_path)
        .unwrap_or_default()
        .to_string();
    let ctx = parts
        .extensions
        .get::<CallContext>()
        .cloned()
        .unwrap_or_default();

    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            return RpcError::invalid_argument(format!("unreadable request body: {err}"))
                .into_response()
        }
    };

    let request_content_type = parts.headers.get(header::CONTENT_TYPE).cloned();
    let unary = UnaryRequest {
        procedure,
        headers: parts.headers,
        body,
    };

    debug!(procedure = %unary.procedure, "dispatching rpc call");
    let outcome = state
        .interceptor
        .intercept(ctx, unary, Next::new(state.service.as_ref()))
        .await;

    match outcome {
        Ok(response) => render(response, request_content_type),
        Err(err) => err.into_response(),
    }
}

fn render(response: UnaryResponse, request_content_type: Option<HeaderValue>) -> Response {
    let UnaryResponse { mut headers, body } = response;
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            request_content_type.unwrap_or(HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
        );
    }

    (StatusCode::OK, headers, body).into_response()
}
