use base64::Engine as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Cancelled;
use crate::gateway::{probe, Gateway, GatewayRequest, Payload, TemplateArgs};
use crate::normalize;

/// Identifiers worth asking the picture endpoints about, first-seen order,
/// duplicates removed.
pub fn candidate_identifiers(
    resolved_id: &str,
    alternate_sender: Option<&str>,
    phone_number: Option<&str>,
) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |id: String| {
        if !id.is_empty() && !candidates.contains(&id) {
            candidates.push(id);
        }
    };

    push(resolved_id.to_string());
    if let Some(alt) = alternate_sender {
        push(alt.to_string());
    }
    if let Some(phone) = phone_number.filter(|p| !p.is_empty()) {
        push(format!("{}@c.us", phone));
        push(format!("{}@s.whatsapp.net", phone));
    }
    candidates
}

/// Find a picture for the first identifier/template pair that yields one.
///
/// JSON answers must carry a url-like field; image bodies are inlined as a
/// `data:` URI. HTTP failures are misses and the next pair is tried; an
/// unreachable gateway ends the search. The result is `None` in both cases.
pub async fn resolve(
    gateway: &dyn Gateway,
    session: &str,
    candidates: &[String],
    cancel: &CancellationToken,
) -> Result<Option<String>, Cancelled> {
    for contact in candidates {
        let args = TemplateArgs::new()
            .set("session", session)
            .set("contact", contact.as_str());

        for template in probe::AVATAR {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            let path = args.render(template);
            let envelope = gateway.execute(GatewayRequest::get(path.clone()), cancel).await?;
            if envelope.is_unreachable() {
                debug!("Avatar lookup stopped at {}: gateway unreachable", path);
                return Ok(None);
            }
            if !envelope.success {
                debug!("Avatar miss {} (status {})", path, envelope.http_status);
                continue;
            }

            let found = match &envelope.raw_payload {
                Some(Payload::Json(value)) => normalize::picture_url(value),
                Some(Payload::Binary {
                    content_type,
                    bytes,
                }) if !bytes.is_empty() => Some(data_uri(content_type, bytes)),
                _ => None,
            };

            if let Some(url) = found {
                debug!("Avatar found for {} via {}", contact, path);
                return Ok(Some(url));
            }
        }
    }

    Ok(None)
}

fn data_uri(content_type: &str, bytes: &[u8]) -> String {
    let content_type = if content_type.is_empty() {
        "application/octet-stream"
    } else {
        content_type
    };
    format!(
        "data:{};base64,{}",
        content_type,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
