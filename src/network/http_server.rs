// HTTP route table and response building
//
// Handlers are registered by (method, path). Unmatched requests get a 404,
// a handler error gets a 500, both with plain-text bodies. An optional
// CORS layer injects permissive headers into every response.

use crate::error::Result;
use crate::network::connection::Connection;
use crate::protocol::message::Message;
use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Response under construction by a route handler.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 200 response with a JSON body.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string().into_bytes())
    }

    /// Response with a plain-text body.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain")
            .with_body(body.into().into_bytes())
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn not_found() -> Self {
        Self::text(404, "404 Not Found")
    }

    pub fn internal_error() -> Self {
        Self::text(500, "500 Internal Server Error")
    }

    /// Encode into HTTP/1.1 wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.to_vec()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Handler for one (method, path) route.
pub type HttpHandler = Arc<dyn Fn(&Message) -> Result<HttpResponse> + Send + Sync>;

/// Route table for the HTTP listener.
pub struct HttpRouter {
    routes: RwLock<HashMap<(String, String), HttpHandler>>,
    cors_enabled: AtomicBool,
}

impl HttpRouter {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            cors_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_cors_enabled(&self, enabled: bool) {
        self.cors_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Register a handler for a method and path, replacing any previous
    /// registration.
    pub fn register(
        &self,
        method: impl Into<String>,
        path: impl Into<String>,
        handler: HttpHandler,
    ) {
        let key = (method.into().to_ascii_uppercase(), path.into());
        self.routes.write().insert(key, handler);
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Dispatch one parsed request and write the response back to the
    /// connection. Honors `Connection: close`.
    pub fn dispatch(&self, message: &Message, connection: &Arc<Connection>) {
        let (Some(method), Some(url)) = (message.http_method(), message.http_url()) else {
            debug!(
                connection_id = connection.id(),
                "non-request HTTP message dropped"
            );
            return;
        };
        let path = url.split('?').next().unwrap_or(url);

        let handler = {
            let routes = self.routes.read();
            routes
                .get(&(method.to_ascii_uppercase(), path.to_string()))
                .cloned()
        };

        let mut response = match handler {
            Some(handler) => match handler(message) {
                Ok(response) => response,
                Err(e) => {
                    error!(
                        connection_id = connection.id(),
                        method, path, "handler failed: {}", e
                    );
                    HttpResponse::internal_error()
                }
            },
            None => HttpResponse::not_found(),
        };

        if self.cors_enabled.load(Ordering::Relaxed) {
            response = response
                .with_header("Access-Control-Allow-Origin", "*")
                .with_header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS")
                .with_header("Access-Control-Allow-Headers", "Content-Type, Authorization");
        }

        if let Err(e) = connection.send(response.encode()) {
            debug!(connection_id = connection.id(), "response send failed: {}", e);
            return;
        }

        let wants_close = message
            .http_headers()
            .and_then(|headers| headers.get("connection"))
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        if wants_close {
            connection.close();
        }
    }
}

impl Default for HttpRouter {
    fn default() -> Self {
        Self::new()
    }
}
