use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Envelope, FailureKind, Gateway, GatewayRequest, Payload};
use crate::config::{GatewayConfig, GatewayCredentials};
use crate::error::{Cancelled, ConfigurationError};

/// reqwest-backed executor for the WhatsApp HTTP gateway.
pub struct GatewayClient {
    client: reqwest::Client,
    credentials: Result<GatewayCredentials, ConfigurationError>,
    timeout: Duration,
}

impl GatewayClient {
    /// Validates the configuration once; a missing URL or key is reported on
    /// every call instead of failing construction.
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials: config.credentials(),
            timeout: config.timeout(),
        }
    }

    fn target_url(base_url: &str, path: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Gateway for GatewayClient {
    async fn execute(
        &self,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<Envelope, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let credentials = match &self.credentials {
            Ok(credentials) => credentials,
            Err(err) => return Ok(Envelope::configuration(err)),
        };

        let target = Self::target_url(&credentials.base_url, &request.path);
        debug!("Gateway {} {}", request.method, target);

        let mut builder = self
            .client
            .request(request.method.clone(), &target)
            .header("X-Api-Key", &credentials.api_key)
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let call = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, content_type, bytes.to_vec()))
        };

        // Dropping `call` on either branch abandons the request.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            outcome = tokio::time::timeout(self.timeout, call) => outcome,
        };

        let envelope = match outcome {
            Err(_) => Envelope::failed(
                target,
                FailureKind::Timeout,
                format!(
                    "Request to the gateway exceeded the {} timeout. Make sure the service is reachable.",
                    format_duration(self.timeout)
                ),
            ),
            Ok(Err(err)) => network_failure(target, &err),
            Ok(Ok((status, content_type, bytes))) => {
                let (payload, unparseable) = decode_body(content_type, bytes);
                let mut envelope = Envelope::from_status(target, status, payload);
                envelope.diagnostic_hint = if unparseable {
                    Some("Gateway transport succeeded but the body could not be parsed as JSON.".to_string())
                } else {
                    request.hint
                };
                envelope
            }
        };

        debug!(
            "Gateway {} -> status={} success={}",
            envelope.target_endpoint, envelope.http_status, envelope.success
        );
        Ok(envelope)
    }
}

/// Image and octet-stream bodies stay binary; everything else is parsed as
/// JSON. Returns `(payload, unparseable)`.
fn decode_body(content_type: Option<String>, bytes: Vec<u8>) -> (Option<Payload>, bool) {
    let is_binary = content_type.as_deref().is_some_and(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.starts_with("image/") || ct.starts_with("application/octet-stream")
    });

    if is_binary {
        let content_type = content_type
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_string())
            .unwrap_or_default();
        return (Some(Payload::Binary { content_type, bytes }), false);
    }

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return (None, false);
    }

    match serde_json::from_slice(&bytes) {
        Ok(value) => (Some(Payload::Json(value)), false),
        Err(_) => (None, true),
    }
}

fn network_failure(target: String, err: &reqwest::Error) -> Envelope {
    if err.is_timeout() {
        return Envelope::failed(
            target,
            FailureKind::Timeout,
            "Request to the gateway timed out at the transport layer.",
        );
    }

    let hint = if is_connection_refused(err) {
        "Connection refused. Make sure the gateway is running at the configured address.".to_string()
    } else if is_dns_failure(err) {
        "Gateway host could not be resolved. Check the hostname in WAHA_INTERNAL_URL.".to_string()
    } else {
        format!("Network error while contacting the gateway: {}", err)
    };

    Envelope::failed(target, FailureKind::Network, hint)
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = cause.source();
    }
    false
}

/// `15s` for whole seconds, `250ms` otherwise.
fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms >= 1000 && ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}
