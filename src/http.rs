//! Narrow HTTP seam used by the Hilo client.
//!
//! The client never talks to `ureq` directly: it hands an [`HttpRequest`] to an
//! [`HttpTransport`] and gets back the status, content type and raw body. The
//! production transport is [`UreqTransport`]; tests script their own.

use core::fmt;
use http::Method;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn declares_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    }
}

/// Failures below the HTTP layer. Both variants are transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Connection(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Connection(s) => write!(f, "connection error: {}", s),
        }
    }
}

impl std::error::Error for TransportError {}

pub trait HttpTransport {
    fn do_request(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking transport backed by a shared `ureq` agent.
///
/// Non-2xx statuses are returned as regular responses; deciding what to retry is
/// the client's job.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        let config = ureq::Agent::config_builder().http_status_as_error(false).build();
        UreqTransport {
            agent: ureq::Agent::new_with_config(config),
        }
    }

    fn run<S: ureq::AsSendBody>(
        &self,
        request: http::Request<S>,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let request = self.agent.configure_request(request).timeout_global(Some(timeout)).build();
        let mut resp = self.agent.run(request).map_err(map_ureq_error)?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = resp.body_mut().read_to_string().map_err(map_ureq_error)?;
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for UreqTransport {
    fn do_request(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = http::Request::builder().method(req.method.clone()).uri(&req.url);
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let invalid = |e: http::Error| TransportError::Connection(format!("invalid request: {}", e));
        match &req.body {
            Some(body) => self.run(builder.body(body.clone()).map_err(invalid)?, req.timeout),
            None => self.run(builder.body(()).map_err(invalid)?, req.timeout),
        }
    }
}

fn map_ureq_error(e: ureq::Error) -> TransportError {
    match e {
        ureq::Error::Timeout(_) => TransportError::Timeout,
        other => TransportError::Connection(other.to_string()),
    }
}
