//! Per-call interception point
//!
//! Runs once per RPC call, after transport middleware and before the method
//! handler. Policy such as credential checks or rate limiting hooks in here.

use async_trait::async_trait;

use crate::{
    errors::RpcError,
    http::context::CallContext,
    rpc::service::{RpcService, UnaryRequest, UnaryResponse},
};

/// The rest of the call chain. Consumed by [`Next::run`], so the wrapped
/// call can run at most once.
pub struct Next<'a> {
    service: &'a dyn RpcService,
}

impl<'a> Next<'a> {
    pub fn new(service: &'a dyn RpcService) -> Self {
        Self { service }
    }

    pub async fn run(
        self,
        ctx: CallContext,
        request: UnaryRequest,
    ) -> Result<UnaryResponse, RpcError> {
        self.service.call(ctx, request).await
    }
}

/// Wraps each unary call.
///
/// An implementation either calls `next.run` or returns an error; there is no
/// way to drop a call silently. Errors from `next.run` should be returned
/// as-is so the transport can map them to a status.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: CallContext,
        request: UnaryRequest,
        next: Next<'_>,
    ) -> Result<UnaryResponse, RpcError>;
}

/// Default interceptor: forwards every call unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait]
impl Interceptor for PassThrough {
    async fn intercept(
        &self,
        ctx: CallContext,
        request: UnaryRequest,
        next: Next<'_>,
    ) -> Result<UnaryResponse, RpcError> {
        next.run(ctx, request).await
    }
}
