//! Sequential discovery of which endpoint shape a gateway deployment serves.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Envelope, FailureKind, Gateway, GatewayRequest, TemplateArgs};
use crate::error::Cancelled;
use crate::normalize;

// Template lists run from the most common deployment to the least.

pub const LIST_CHATS: &[&str] = &[
    "/api/sessions/{session}/chats",
    "/api/chats/{session}",
    "/api/{session}/chats",
];

pub const LIST_MESSAGES: &[&str] = &[
    "/api/sessions/{session}/chats/{chat}/messages?limit={limit}",
    "/api/sessions/{session}/messages?chatId={chat}&limit={limit}",
    "/api/{session}/chats/{chat}/messages?limit={limit}",
];

pub const CONTACT_INFO: &[&str] = &[
    "/api/{session}/contacts/{contact}",
    "/api/contacts?contactId={contact}&session={session}",
    "/api/sessions/{session}/contacts/{contact}",
];

/// Message templates with the page size pinned to the newest message.
pub const LATEST_MESSAGE: &[&str] = &[
    "/api/sessions/{session}/chats/{chat}/messages?limit=1",
    "/api/sessions/{session}/messages?chatId={chat}&limit=1",
    "/api/{session}/chats/{chat}/messages?limit=1",
];

pub const AVATAR: &[&str] = &[
    "/api/{session}/contacts/{contact}/picture",
    "/api/contacts/profile-picture?contactId={contact}&session={session}",
    "/api/sessions/{session}/contacts/{contact}/profile-picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListChats,
    ListMessages,
    ContactInfo,
    LatestMessage,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::ListChats => "chats",
            Operation::ListMessages => "messages",
            Operation::ContactInfo => "contact info",
            Operation::LatestMessage => "latest message",
        }
    }

    /// Whether `payload` holds data this operation can normalize.
    pub fn recognizes(&self, payload: &Value) -> bool {
        match self {
            Operation::ListChats => {
                normalize::collection(payload, normalize::CHAT_COLLECTION_KEYS).is_some()
            }
            Operation::ListMessages | Operation::LatestMessage => {
                normalize::collection(payload, normalize::MESSAGE_COLLECTION_KEYS).is_some()
            }
            Operation::ContactInfo => normalize::contact_record(payload).is_some(),
        }
    }
}

/// Try `templates` in order until one answers with recognizable data.
///
/// Not-found statuses and unrecognized shapes move on to the next template;
/// any other failure is returned at once. When every template misses, the
/// last envelope comes back with a hint naming the final endpoint.
pub async fn probe(
    gateway: &dyn Gateway,
    operation: Operation,
    templates: &[&str],
    args: &TemplateArgs,
    cancel: &CancellationToken,
) -> Result<Envelope, Cancelled> {
    let mut last: Option<Envelope> = None;

    for template in templates {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let path = args.render(template);
        let request = GatewayRequest::get(path.clone())
            .with_hint(format!("Attempt failed for path: {}.", path));
        let mut envelope = gateway.execute(request, cancel).await?;

        debug!(
            "Probe {} {} -> status={} success={}",
            operation.label(),
            path,
            envelope.http_status,
            envelope.success
        );

        if envelope.success {
            if envelope.json().is_some_and(|p| operation.recognizes(p)) {
                envelope.diagnostic_hint = None;
                return Ok(envelope);
            }
            envelope.failure = Some(FailureKind::UnrecognizedShape);
            envelope.diagnostic_hint = Some(format!(
                "Gateway response from {} was successful but the data shape was not recognized.",
                path
            ));
            last = Some(envelope);
            continue;
        }

        if envelope.is_not_found() {
            last = Some(envelope);
            continue;
        }

        warn!(
            "Probe {} aborted on {} with status {}",
            operation.label(),
            envelope.target_endpoint,
            envelope.http_status
        );
        return Ok(envelope);
    }

    Ok(match last {
        Some(envelope) if !envelope.success => {
            let hint = format!(
                "All {} paths failed. Last attempt on {} failed with status {}. Verify the gateway service and its endpoints.",
                operation.label(),
                envelope.target_endpoint,
                envelope.http_status
            );
            envelope.with_hint(hint)
        }
        Some(envelope) => envelope,
        None => Envelope::failed(
            "N/A",
            FailureKind::Rejected,
            format!("No {} paths to try.", operation.label()),
        ),
    })
}
