//! Display identity for a chat counterpart.
//!
//! Identifiers come in three classes: groups (`@g.us`), plain personal ids
//! (`@c.us` / `@s.whatsapp.net`, local part is the phone number) and linked
//! ids (`@lid`, network-assigned, not a phone number). Linked ids are
//! enriched from the metadata of the conversation's newest message.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::avatar;
use crate::error::Cancelled;
use crate::gateway::probe::{self, Operation};
use crate::gateway::{Envelope, Gateway, TemplateArgs};
use crate::model::ContactMeta;
use crate::normalize;

pub const GROUP_SUFFIX: &str = "@g.us";
pub const LINKED_SUFFIX: &str = "@lid";
pub const PERSONAL_SUFFIXES: &[&str] = &["@c.us", "@s.whatsapp.net"];

pub const LINKED_FALLBACK_NAME: &str = "Unknown LID Contact";

const METADATA_KEYS: &[&str] = &["_data", "_Data"];
const PUSH_NAME: &[&str] = &["pushName", "notifyName"];
const ALTERNATE_SENDER: &[&str] = &["senderAlt", "senderPn", "participantAlt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactClass {
    Group,
    Personal,
    Linked,
}

pub fn classify(id: &str) -> ContactClass {
    if id.ends_with(GROUP_SUFFIX) {
        ContactClass::Group
    } else if id.ends_with(LINKED_SUFFIX) {
        ContactClass::Linked
    } else {
        ContactClass::Personal
    }
}

/// Trim, and give bare phone numbers the direct-contact suffix.
pub fn canonicalize(id: &str) -> String {
    let id = id.trim();
    let digits = id.strip_prefix('+').unwrap_or(id);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        format!("{}@c.us", digits)
    } else {
        id.to_string()
    }
}

/// Substring before the first `@`.
pub fn local_part(id: &str) -> &str {
    id.split('@').next().unwrap_or(id)
}

/// Phone number carried by a direct-contact id; `None` for groups and linked ids.
pub fn extract_phone(id: &str) -> Option<String> {
    PERSONAL_SUFFIXES
        .iter()
        .find_map(|suffix| id.strip_suffix(suffix))
        .filter(|local| !local.is_empty())
        .map(str::to_string)
}

/// `"628123:4@s.whatsapp.net"` -> `"628123"`: cut at the first `:` or `@`,
/// then keep digits only.
pub fn digits_only(raw: &str) -> Option<String> {
    let head = raw.split([':', '@']).next().unwrap_or_default();
    let digits: String = head.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Facts recovered from the newest message's provider metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub push_name: Option<String>,
    /// Alternate sender id with any device part removed.
    pub alternate_sender: Option<String>,
}

impl Enrichment {
    pub fn from_message(record: &Value) -> Self {
        let Some(metadata) = METADATA_KEYS
            .iter()
            .find_map(|key| record.get(key).filter(|v| v.is_object()))
        else {
            return Self::default();
        };

        Self {
            push_name: normalize::first_text(metadata, PUSH_NAME),
            alternate_sender: normalize::first_text(metadata, ALTERNATE_SENDER)
                .map(|raw| strip_device(&raw)),
        }
    }

    pub fn alternate_number(&self) -> Option<String> {
        self.alternate_sender.as_deref().and_then(digits_only)
    }
}

/// `"628:12@s.whatsapp.net"` -> `"628@s.whatsapp.net"`.
fn strip_device(raw: &str) -> String {
    let raw = raw.trim();
    match raw.split_once('@') {
        Some((user, server)) => format!("{}@{}", user.split(':').next().unwrap_or(user), server),
        None => raw.split(':').next().unwrap_or(raw).to_string(),
    }
}

/// Build the contact metadata for `contact_id` within `session`.
///
/// Groups never touch the network. Every other class does a primary contact
/// lookup; linked ids additionally consult the newest message when the
/// lookup did not yield both a name and a number. Enrichment only fills
/// gaps and never replaces a name the lookup confirmed.
///
/// The inner `Err` is the lookup envelope when the gateway could not be
/// reached at all (configuration, network, timeout); nothing else is tried.
pub async fn resolve(
    gateway: &dyn Gateway,
    session: &str,
    contact_id: &str,
    chat_name: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Result<ContactMeta, Envelope>, Cancelled> {
    let resolved = canonicalize(contact_id);
    let class = classify(&resolved);

    if class == ContactClass::Group {
        let display_name = chat_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| local_part(&resolved))
            .to_string();
        return Ok(Ok(ContactMeta {
            display_name,
            phone_number: None,
            avatar_url: None,
            resolved_identifier: resolved,
        }));
    }

    let fallback = match class {
        ContactClass::Linked => LINKED_FALLBACK_NAME.to_string(),
        _ => local_part(&resolved).to_string(),
    };

    let args = TemplateArgs::new()
        .set("session", session)
        .set("contact", resolved.as_str());
    let lookup = probe::probe(gateway, Operation::ContactInfo, probe::CONTACT_INFO, &args, cancel).await?;
    if lookup.is_unreachable() {
        warn!(
            "Contact lookup for {} failed: {}",
            resolved,
            lookup.diagnostic_hint.as_deref().unwrap_or("gateway unreachable")
        );
        return Ok(Err(lookup));
    }
    let record = lookup
        .json()
        .filter(|_| lookup.success)
        .and_then(normalize::contact_record);

    let primary_name = record.and_then(|r| normalize::first_text(r, normalize::CONTACT_NAME));
    let looked_up_number = record.and_then(|r| normalize::first_text(r, normalize::CONTACT_NUMBER));
    let inline_avatar = record.and_then(normalize::avatar_url);

    let mut display_name = primary_name.clone().unwrap_or_else(|| fallback.clone());
    let mut phone_number = looked_up_number.clone().or_else(|| extract_phone(&resolved));
    let mut enrichment = Enrichment::default();
    let mut reachable = true;

    if class == ContactClass::Linked && !(primary_name.is_some() && looked_up_number.is_some()) {
        match latest_message_enrichment(gateway, session, &resolved, cancel).await? {
            Some(found) => enrichment = found,
            None => reachable = false,
        }
        debug!("Enrichment for {}: {:?}", resolved, enrichment);

        let name_is_fallback = primary_name.as_deref().map_or(true, |name| name == fallback);
        if name_is_fallback {
            if let Some(push_name) = &enrichment.push_name {
                display_name = push_name.clone();
            }
        }
        if phone_number.is_none() {
            phone_number = enrichment.alternate_number();
        }
    }

    // An avatar already on the contact record wins over the picture endpoints.
    let avatar_url = match inline_avatar {
        Some(url) => Some(url),
        None if !reachable => None,
        None => {
            let candidates = avatar::candidate_identifiers(
                &resolved,
                enrichment.alternate_sender.as_deref(),
                phone_number.as_deref(),
            );
            avatar::resolve(gateway, session, &candidates, cancel).await?
        }
    };

    Ok(Ok(ContactMeta {
        display_name,
        phone_number,
        avatar_url,
        resolved_identifier: resolved,
    }))
}

/// `None` when the gateway stopped answering.
async fn latest_message_enrichment(
    gateway: &dyn Gateway,
    session: &str,
    chat_id: &str,
    cancel: &CancellationToken,
) -> Result<Option<Enrichment>, Cancelled> {
    let args = TemplateArgs::new()
        .set("session", session)
        .set("chat", chat_id);
    let envelope = probe::probe(gateway, Operation::LatestMessage, probe::LATEST_MESSAGE, &args, cancel).await?;
    if envelope.is_unreachable() {
        return Ok(None);
    }

    let newest = envelope
        .json()
        .filter(|_| envelope.success)
        .and_then(|payload| normalize::collection(payload, normalize::MESSAGE_COLLECTION_KEYS))
        .and_then(|records| records.first());

    Ok(Some(newest.map(Enrichment::from_message).unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::ScriptedGateway;
    use crate::gateway::FailureKind;
    use serde_json::json;

    const LID: &str = "5551234@lid";

    fn contact_path(id: &str) -> String {
        format!("/api/s1/contacts/{}", id)
    }

    fn latest_path(id: &str) -> String {
        format!("/api/sessions/s1/chats/{}/messages?limit=1", id)
    }

    #[test]
    fn test_classification_and_canonical_ids() {
        assert_eq!(classify("120363@g.us"), ContactClass::Group);
        assert_eq!(classify("628@c.us"), ContactClass::Personal);
        assert_eq!(classify("628@s.whatsapp.net"), ContactClass::Personal);
        assert_eq!(classify(LID), ContactClass::Linked);

        assert_eq!(canonicalize(" 628123 "), "628123@c.us");
        assert_eq!(canonicalize("+628123"), "628123@c.us");
        assert_eq!(canonicalize("628123@c.us"), "628123@c.us");
        assert_eq!(canonicalize(LID), LID);
    }

    #[test]
    fn test_extract_phone() {
        assert_eq!(extract_phone("628123@c.us").as_deref(), Some("628123"));
        assert_eq!(extract_phone("628123@s.whatsapp.net").as_deref(), Some("628123"));
        assert_eq!(extract_phone(LID), None);
        assert_eq!(extract_phone("1@g.us"), None);
    }

    #[test]
    fn test_digits_only() {
        assert_eq!(digits_only("628123:12@s.whatsapp.net").as_deref(), Some("628123"));
        assert_eq!(digits_only("+62 812-3@c.us").as_deref(), Some("628123"));
        assert_eq!(digits_only("abc@lid"), None);
    }

    #[test]
    fn test_enrichment_checks_both_casings() {
        let lower = json!({"_data": {"notifyName": "Budi", "senderAlt": "628777:3@s.whatsapp.net"}});
        let enrichment = Enrichment::from_message(&lower);
        assert_eq!(enrichment.push_name.as_deref(), Some("Budi"));
        assert_eq!(enrichment.alternate_sender.as_deref(), Some("628777@s.whatsapp.net"));
        assert_eq!(enrichment.alternate_number().as_deref(), Some("628777"));

        let upper = json!({"_Data": {"pushName": "Sari"}});
        assert_eq!(Enrichment::from_message(&upper).push_name.as_deref(), Some("Sari"));

        assert_eq!(Enrichment::from_message(&json!({"body": "x"})), Enrichment::default());
    }

    #[tokio::test]
    async fn test_group_makes_no_network_calls() {
        let gateway = ScriptedGateway::new();
        let meta = resolve(&gateway, "s1", "120363@g.us", Some("Sales Team"), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "Sales Team");
        assert_eq!(meta.phone_number, None);
        assert_eq!(meta.avatar_url, None);
        assert_eq!(meta.resolved_identifier, "120363@g.us");
        assert_eq!(gateway.call_count(), 0);

        let meta = resolve(&gateway, "s1", "120363@g.us", Some("  "), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "120363");
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_personal_contact_from_lookup() {
        let gateway = ScriptedGateway::new()
            .json(
                &contact_path("628123@c.us"),
                200,
                json!({"id": "628123@c.us", "name": "A", "pushname": "B", "number": "628123"}),
            )
            .json(
                "/api/s1/contacts/628123@c.us/picture",
                200,
                json!({"url": "https://cdn/a.jpg"}),
            );

        let meta = resolve(&gateway, "s1", "628123@c.us", None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "A");
        assert_eq!(meta.phone_number.as_deref(), Some("628123"));
        assert_eq!(meta.avatar_url.as_deref(), Some("https://cdn/a.jpg"));
        assert_eq!(meta.resolved_identifier, "628123@c.us");
        // Personal ids never consult message history.
        assert!(!gateway.calls().iter().any(|p| p.contains("messages")));
    }

    #[tokio::test]
    async fn test_personal_contact_falls_back_to_identifier() {
        let gateway = ScriptedGateway::new();
        let meta = resolve(&gateway, "s1", "628123", None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "628123");
        assert_eq!(meta.phone_number.as_deref(), Some("628123"));
        assert_eq!(meta.avatar_url, None);
        assert_eq!(meta.resolved_identifier, "628123@c.us");
    }

    #[tokio::test]
    async fn test_inline_avatar_skips_picture_endpoints() {
        let gateway = ScriptedGateway::new().json(
            &contact_path("628123@c.us"),
            200,
            json!({"data": {"id": "628123@c.us", "pushname": "P", "profilePicUrl": "https://inline"}}),
        );
        let meta = resolve(&gateway, "s1", "628123@c.us", None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "P");
        assert_eq!(meta.avatar_url.as_deref(), Some("https://inline"));
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn test_linked_id_enriched_from_latest_message() {
        let gateway = ScriptedGateway::new()
            .json(&contact_path(LID), 200, json!({"id": LID}))
            .json(
                &latest_path(LID),
                200,
                json!([{"id": "m1", "_data": {"notifyName": "Budi", "senderAlt": "628777@s.whatsapp.net"}}]),
            );

        let meta = resolve(&gateway, "s1", LID, None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "Budi");
        assert_eq!(meta.phone_number.as_deref(), Some("628777"));
        assert_eq!(meta.resolved_identifier, LID);

        // Avatar candidates: lid, alternate sender, then the c.us variant.
        let calls = gateway.calls();
        assert!(calls.contains(&"/api/s1/contacts/628777@s.whatsapp.net/picture".to_string()));
        assert!(calls.contains(&"/api/s1/contacts/628777@c.us/picture".to_string()));
    }

    #[tokio::test]
    async fn test_enrichment_never_overrides_confirmed_name() {
        let gateway = ScriptedGateway::new()
            .json(&contact_path(LID), 200, json!({"id": LID, "name": "Confirmed"}))
            .json(
                &latest_path(LID),
                200,
                json!([{"_data": {"pushName": "Other", "senderAlt": "628999@c.us"}}]),
            );

        let meta = resolve(&gateway, "s1", LID, None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "Confirmed");
        assert_eq!(meta.phone_number.as_deref(), Some("628999"));
        assert!(gateway.calls().contains(&latest_path(LID)));
    }

    #[tokio::test]
    async fn test_linked_with_name_and_number_skips_enrichment() {
        let gateway = ScriptedGateway::new().json(
            &contact_path(LID),
            200,
            json!({"id": LID, "name": "Known", "number": "628111"}),
        );
        let meta = resolve(&gateway, "s1", LID, None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "Known");
        assert_eq!(meta.phone_number.as_deref(), Some("628111"));
        assert!(!gateway.calls().iter().any(|p| p.contains("messages")));
    }

    #[tokio::test]
    async fn test_linked_without_any_data_uses_sentinel() {
        let gateway = ScriptedGateway::new();
        let meta = resolve(&gateway, "s1", LID, None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, LINKED_FALLBACK_NAME);
        assert_eq!(meta.phone_number, None);
        assert_eq!(meta.avatar_url, None);
    }

    #[tokio::test]
    async fn test_rejected_lookup_still_returns_record() {
        let gateway = ScriptedGateway::new().status(&contact_path("628123@c.us"), 401);
        let meta = resolve(&gateway, "s1", "628123@c.us", None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "628123");
        assert_eq!(meta.phone_number.as_deref(), Some("628123"));
    }

    fn timed_out(path: &str) -> Envelope {
        Envelope::failed(
            format!("http://gateway.test{}", path),
            FailureKind::Timeout,
            "Request to the gateway exceeded the 15s timeout.",
        )
    }

    #[tokio::test]
    async fn test_unreachable_lookup_returns_envelope_without_further_calls() {
        let gateway = ScriptedGateway::new().reply(&contact_path(LID), timed_out(&contact_path(LID)));
        let envelope = resolve(&gateway, "s1", LID, None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(envelope.failure, Some(FailureKind::Timeout));
        assert!(envelope.diagnostic_hint.unwrap().contains("15s"));
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn test_enrichment_timeout_skips_avatar_lookup() {
        let gateway = ScriptedGateway::new()
            .json(&contact_path(LID), 200, json!({"id": LID, "name": "Known"}))
            .reply(&latest_path(LID), timed_out(&latest_path(LID)));
        let meta = resolve(&gateway, "s1", LID, None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.display_name, "Known");
        assert_eq!(meta.avatar_url, None);
        assert_eq!(gateway.calls(), vec![contact_path(LID), latest_path(LID)]);
    }
}
