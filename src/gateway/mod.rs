pub mod client;
pub mod probe;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, ConfigurationError};

/// Body of a gateway response after content-type sniffing.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary { content_type: String, bytes: Vec<u8> },
}

/// Why a gateway call did not produce usable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Configuration,
    Network,
    Timeout,
    /// 404/405/410: this deployment has no such path, or the session has nothing there yet.
    NotFound,
    /// Any other non-success status. Not retried.
    Rejected,
    /// HTTP success, but the payload is not the shape the operation expects.
    UnrecognizedShape,
}

/// Uniform result of one gateway call. Built fresh per call, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub success: bool,
    pub http_status: u16,
    pub target_endpoint: String,
    pub raw_payload: Option<Payload>,
    pub diagnostic_hint: Option<String>,
    pub failure: Option<FailureKind>,
}

impl Envelope {
    /// Envelope for an HTTP response that actually arrived.
    pub fn from_status(target: impl Into<String>, status: u16, payload: Option<Payload>) -> Self {
        Self {
            success: (200..300).contains(&status),
            http_status: status,
            target_endpoint: target.into(),
            raw_payload: payload,
            diagnostic_hint: None,
            failure: classify_status(status),
        }
    }

    /// Envelope for a call that never got an HTTP response.
    pub fn failed(target: impl Into<String>, kind: FailureKind, hint: impl Into<String>) -> Self {
        Self {
            success: false,
            http_status: 500,
            target_endpoint: target.into(),
            raw_payload: None,
            diagnostic_hint: Some(hint.into()),
            failure: Some(kind),
        }
    }

    pub fn configuration(err: &ConfigurationError) -> Self {
        Self::failed("N/A", FailureKind::Configuration, err.hint())
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.diagnostic_hint = Some(hint.into());
        self
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.raw_payload {
            Some(Payload::Json(value)) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self.raw_payload {
            Some(Payload::Json(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.failure == Some(FailureKind::NotFound)
    }

    /// No usable gateway answer at all: missing configuration, network
    /// failure or timeout. Further calls in the same operation would fail too.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self.failure,
            Some(FailureKind::Configuration | FailureKind::Network | FailureKind::Timeout)
        )
    }
}

pub fn classify_status(status: u16) -> Option<FailureKind> {
    match status {
        200..=299 => None,
        404 | 405 | 410 => Some(FailureKind::NotFound),
        _ => Some(FailureKind::Rejected),
    }
}

#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub path: String,
    pub method: Method,
    pub body: Option<Value>,
    /// Hint carried into the envelope when the call itself succeeds.
    pub hint: Option<String>,
}

impl GatewayRequest {
    pub fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            path: path.into(),
            method,
            body,
            hint: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, None)
    }

    pub fn post(path: impl Into<String>, body: Option<Value>) -> Self {
        Self::new(Method::POST, path, body)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Issues single calls against the gateway.
///
/// Implementations never fail: every outcome is an [`Envelope`]. The only
/// `Err` is [`Cancelled`], returned when `cancel` fired before or during the
/// call, in which case the in-flight request is dropped.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn execute(
        &self,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<Envelope, Cancelled>;
}

/// Values substituted into `{name}` placeholders of an endpoint template.
#[derive(Debug, Clone, Default)]
pub struct TemplateArgs {
    pairs: Vec<(&'static str, String)>,
}

impl TemplateArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.pairs.push((name, value.into()));
        self
    }

    pub fn render(&self, template: &str) -> String {
        let mut path = template.to_string();
        for (name, value) in &self.pairs {
            path = path.replace(&format!("{{{}}}", name), &encode_segment(value));
        }
        path
    }
}

/// Percent-encode a path/query value, keeping `@` and `:` literal since
/// gateways route on raw WhatsApp ids.
fn encode_segment(value: &str) -> String {
    urlencoding::encode(value)
        .replace("%40", "@")
        .replace("%3A", ":")
}
