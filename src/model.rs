use serde::Serialize;

/// Provider-independent chat summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub display_name: String,
    pub is_group: bool,
    /// Seconds since epoch, 0 when unknown.
    pub last_activity_timestamp: i64,
    pub avatar_url: Option<String>,
    pub last_message_preview: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    FromMe,
    FromThem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub body: String,
    pub direction: Direction,
    pub timestamp: i64,
    pub has_media: bool,
    pub media_kind: MediaKind,
    pub media_file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactMeta {
    pub display_name: String,
    pub phone_number: Option<String>,
    pub avatar_url: Option<String>,
    pub resolved_identifier: String,
}
