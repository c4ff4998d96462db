//! Per-request call context
//!
//! Each request gets a fresh [`CallContext`] carrying [`TransportHandles`]:
//! a snapshot of the request head and a writer for response headers. Method
//! handlers use it for transport-level work the RPC layer does not expose,
//! such as setting cookies.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri, Version},
    middleware::Next,
    response::Response,
};

/// Request head as seen by the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl TransportRequest {
    fn from_request(request: &Request) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
        }
    }
}

/// Headers buffered for the outgoing response of one request.
///
/// Everything written here is appended to the response once the handler
/// returns.
#[derive(Debug, Clone, Default)]
pub struct ResponseWriter {
    headers: Arc<Mutex<HeaderMap>>,
}

impl ResponseWriter {
    pub fn append_header(&self, name: HeaderName, value: HeaderValue) {
        self.lock().append(name, value);
    }

    pub fn set_cookie(&self, cookie: HeaderValue) {
        self.append_header(header::SET_COOKIE, cookie);
    }

    #[cfg(test)]
    fn headers(&self) -> HeaderMap {
        self.lock().clone()
    }

    fn drain_into(&self, target: &mut HeaderMap) {
        let buffered = std::mem::take(&mut *self.lock());
        let mut current = None;
        for (name, value) in buffered {
            if let Some(name) = name {
                current = Some(name);
            }
            if let Some(name) = current.clone() {
                target.append(name, value);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeaderMap> {
        self.headers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport handles of the request currently being served.
#[derive(Debug, Clone)]
pub struct TransportHandles {
    request: Arc<TransportRequest>,
    response: ResponseWriter,
}

impl TransportHandles {
    pub fn new(request: TransportRequest, response: ResponseWriter) -> Self {
        Self {
            request: Arc::new(request),
            response,
        }
    }

    pub fn request(&self) -> &TransportRequest {
        &self.request
    }

    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }
}

/// Context handed to interceptors and method handlers.
///
/// Outside a live request there are no transport handles and
/// [`CallContext::transport`] returns `None`.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    transport: Option<TransportHandles>,
}

impl CallContext {
    /// Derives a context carrying `handles`, leaving `self` untouched.
    pub fn with_transport(&self, handles: TransportHandles) -> Self {
        Self {
            transport: Some(handles),
        }
    }

    pub fn transport(&self) -> Option<&TransportHandles> {
        self.transport.as_ref()
    }
}

pub async fn inject_call_context(mut request: Request, next: Next) -> Response {
    let writer = ResponseWriter::default();
    let handles = TransportHandles::new(TransportRequest::from_request(&request), writer.clone());
    let ctx = request
        .extensions()
        .get::<CallContext>()
        .cloned()
        .unwrap_or_default()
        .with_transport(handles);
    request.extensions_mut().insert(ctx);

    let mut response = next.run(request).await;
    writer.drain_into(response.headers_mut());
    response
}
