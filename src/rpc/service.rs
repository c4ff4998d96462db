use async_trait::async_trait;
use axum::{body::Bytes, http::HeaderMap};

use crate::{errors::RpcError, http::context::CallContext};

/// A single unary call after transport framing has been stripped.
#[derive(Debug, Clone)]
pub struct UnaryRequest {
    /// Method name relative to the mount path, e.g. `Login`.
    pub procedure: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct UnaryResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UnaryRequest {
    pub fn new(procedure: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            procedure: procedure.into(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

impl UnaryResponse {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// The method handler set served under the mount path.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn call(&self, ctx: CallContext, request: UnaryRequest)
        -> Result<UnaryResponse, RpcError>;
}

/// Answers every procedure with `unimplemented`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnimplementedService;

#[async_trait]
impl RpcService for UnimplementedService {
    async fn call(
        &self,
        _ctx: CallContext,
        request: UnaryRequest,
    ) -> Result<UnaryResponse, RpcError> {
        Err(RpcError::unimplemented(format!(
            "procedure {} is not implemented",
            request.procedure
        )))
    }
}
