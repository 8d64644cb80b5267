use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, GatewaySummary, SyncConfig};
use crate::contact;
use crate::error::Cancelled;
use crate::gateway::probe::{self, Operation};
use crate::gateway::{Envelope, Gateway, GatewayRequest, TemplateArgs};
use crate::model::{Chat, ContactMeta, Message};
use crate::normalize;
use crate::sync::{SessionSync, Sleeper, SyncProgress};

pub const DEFAULT_MESSAGE_LIMIT: u32 = 50;
pub const MAX_MESSAGE_LIMIT: u32 = 500;

/// What the console's callers receive from every operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub status: u16,
    pub target_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Reshape an envelope, replacing its payload with canonical `data`.
    /// `ok` requires usable data, not just a 2xx.
    pub fn from_envelope(envelope: Envelope, data: Option<T>) -> Self {
        Self {
            ok: envelope.success && envelope.failure.is_none() && data.is_some(),
            status: envelope.http_status,
            target_url: envelope.target_endpoint,
            data,
            hint: envelope.diagnostic_hint,
        }
    }

    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            status: 200,
            target_url: "N/A".to_string(),
            data: Some(data),
            hint: None,
        }
    }

    /// 500 is reserved for internal failures; gateway-side errors are data.
    pub fn is_internal_error(&self) -> bool {
        !self.ok && self.status == 500
    }
}

impl ApiResponse<Value> {
    /// Passthrough of the gateway's own JSON answer.
    pub fn passthrough(envelope: Envelope) -> Self {
        Self {
            ok: envelope.success,
            status: envelope.http_status,
            target_url: envelope.target_endpoint.clone(),
            hint: envelope.diagnostic_hint.clone(),
            data: envelope.into_json(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: Option<String>,
    pub user_id: Option<String>,
    pub session_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Start { session: String },
    Stop { session: String },
    Logout { session: String },
}

impl SessionAction {
    /// Validate the action body. The error is the operator hint.
    pub fn parse(request: &ActionRequest) -> Result<Self, String> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let action = non_empty(&request.action).ok_or("Action is required")?;
        match action.as_str() {
            "start" => {
                let user_id = non_empty(&request.user_id)
                    .ok_or("userId is required for start action")?;
                Ok(SessionAction::Start {
                    session: format!("session-{}", user_id),
                })
            }
            "stop" => Ok(SessionAction::Stop {
                session: non_empty(&request.session_name)
                    .ok_or("sessionName is required for stop action")?,
            }),
            "logout" => Ok(SessionAction::Logout {
                session: non_empty(&request.session_name)
                    .ok_or("sessionName is required for logout action")?,
            }),
            other => Err(format!("Unknown action: {}", other)),
        }
    }

    fn request(&self) -> GatewayRequest {
        let args = |session: &str| TemplateArgs::new().set("session", session);
        match self {
            SessionAction::Start { session } => {
                GatewayRequest::post("/api/sessions/start", Some(json!({ "name": session })))
            }
            SessionAction::Stop { session } => {
                GatewayRequest::post(args(session).render("/api/sessions/{session}/stop"), None)
            }
            SessionAction::Logout { session } => {
                GatewayRequest::post(args(session).render("/api/sessions/{session}/logout"), None)
            }
        }
    }
}

/// The gateway adapter's four operations plus session/health passthroughs.
/// Holds no per-request state.
#[derive(Clone)]
pub struct Adapter {
    gateway: Arc<dyn Gateway>,
    sleeper: Arc<dyn Sleeper>,
    config: Arc<Config>,
}

impl Adapter {
    pub fn new(gateway: Arc<dyn Gateway>, sleeper: Arc<dyn Sleeper>, config: Config) -> Self {
        Self {
            gateway,
            sleeper,
            config: Arc::new(config),
        }
    }

    fn sync_config(&self) -> &SyncConfig {
        &self.config.sync
    }

    pub async fn list_chats(
        &self,
        session: &str,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(&SyncProgress) + Send + Sync),
    ) -> Result<ApiResponse<Vec<Chat>>, Cancelled> {
        let sync = SessionSync::new(self.gateway.as_ref(), self.sleeper.as_ref(), self.sync_config());
        let report = sync.list_chats(session, cancel, on_progress).await?;

        let chats = report
            .succeeded
            .then(|| report.envelope.json().and_then(normalize::chats))
            .flatten();
        if let Some(chats) = &chats {
            info!("Session '{}': {} chats", session, chats.len());
        }
        Ok(ApiResponse::from_envelope(report.envelope, chats))
    }

    /// Newest-first, as the gateway returns them.
    pub async fn list_messages(
        &self,
        session: &str,
        chat_id: &str,
        limit: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse<Vec<Message>>, Cancelled> {
        let limit = limit
            .unwrap_or(DEFAULT_MESSAGE_LIMIT)
            .clamp(1, MAX_MESSAGE_LIMIT);
        let args = TemplateArgs::new()
            .set("session", session)
            .set("chat", chat_id)
            .set("limit", limit.to_string());

        let envelope = probe::probe(
            self.gateway.as_ref(),
            Operation::ListMessages,
            probe::LIST_MESSAGES,
            &args,
            cancel,
        )
        .await?;

        let messages = envelope
            .json()
            .filter(|_| envelope.success && envelope.failure.is_none())
            .and_then(normalize::messages);
        Ok(ApiResponse::from_envelope(envelope, messages))
    }

    pub async fn contact_meta(
        &self,
        session: &str,
        contact_id: &str,
        chat_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse<ContactMeta>, Cancelled> {
        let resolution = contact::resolve(self.gateway.as_ref(), session, contact_id, chat_name, cancel).await?;
        Ok(match resolution {
            Ok(meta) => ApiResponse::ok(meta),
            Err(envelope) => ApiResponse::from_envelope(envelope, None),
        })
    }

    pub async fn session_action(
        &self,
        action: &SessionAction,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse<Value>, Cancelled> {
        info!("Session action: {:?}", action);
        let envelope = self.gateway.execute(action.request(), cancel).await?;
        Ok(ApiResponse::passthrough(envelope))
    }

    pub async fn sessions(&self, cancel: &CancellationToken) -> Result<ApiResponse<Value>, Cancelled> {
        let request = GatewayRequest::get("/api/sessions")
            .with_hint("Failed to fetch sessions from the gateway.");
        let envelope = self.gateway.execute(request, cancel).await?;
        Ok(ApiResponse::passthrough(envelope))
    }

    /// `/api/health`, falling back to `/health` when the fork lacks the former.
    pub async fn health(&self, cancel: &CancellationToken) -> Result<ApiResponse<Value>, Cancelled> {
        let envelope = self
            .gateway
            .execute(GatewayRequest::get("/api/health"), cancel)
            .await?;
        if !envelope.is_not_found() {
            return Ok(ApiResponse::passthrough(envelope));
        }

        let original = envelope
            .diagnostic_hint
            .unwrap_or_else(|| "Endpoint /api/health not found.".to_string());
        let fallback = GatewayRequest::get("/health")
            .with_hint(format!("{} Trying /health as a fallback.", original));
        let envelope = self.gateway.execute(fallback, cancel).await?;
        Ok(ApiResponse::passthrough(envelope))
    }

    pub fn info(&self) -> GatewaySummary {
        self.config.gateway.summary()
    }

    /// Authenticated passthrough of an arbitrary gateway call.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Envelope, Cancelled> {
        debug!("Forwarding {} {}", method, path);
        self.gateway
            .execute(GatewayRequest::new(method, path, body), cancel)
            .await
    }
}
