//! RPC call abstractions
//!
//! The method handlers and the per-call interception point are plugged in
//! from outside; this module only defines the seams they implement.

pub mod interceptor;
pub mod service;

pub use interceptor::{Interceptor, Next, PassThrough};
pub use service::{RpcService, UnaryRequest, UnaryResponse, UnimplementedService};
