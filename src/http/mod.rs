//! HTTP ingress for the RPC service
//!
//! Cross-origin policy, call-context injection, and the handler that hands
//! each request to the interception point and the method handlers.

pub mod context;
pub mod cors;
pub mod handlers;
