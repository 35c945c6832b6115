//! Inbound message from the upstream source: delivered to the forwarder for routing and delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message received from the upstream source. Immutable once recorded in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Unique source identifier: `<origin chat id>:<source message id>`.
    pub id: String,
    /// Upstream offset (Telegram update_id). Strictly increasing in ingestion order.
    pub offset: i64,
    pub origin_chat_id: String,
    /// Public username of the origin chat, without the leading `@`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_username: Option<String>,
    /// Message id inside the origin chat (needed to forward/copy it).
    pub source_message_id: i64,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        offset: i64,
        origin_chat_id: impl Into<String>,
        source_message_id: i64,
        payload: Payload,
    ) -> Self {
        let origin_chat_id = origin_chat_id.into();
        Self {
            id: message_id(&origin_chat_id, source_message_id),
            offset,
            origin_chat_id,
            origin_username: None,
            source_message_id,
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        let name = username.into();
        let name = name.trim().trim_start_matches('@');
        self.origin_username = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        self
    }
}

/// Build the stable message id for a (chat, message) pair.
pub fn message_id(origin_chat_id: &str, source_message_id: i64) -> String {
    format!("{}:{}", origin_chat_id, source_message_id)
}

/// Message content: text (or caption) and an optional media reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn media(kind: impl Into<String>, file_id: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            text: caption,
            media: Some(MediaRef {
                kind: kind.into(),
                file_id: file_id.into(),
            }),
        }
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_none() && self.text.as_deref().map_or(true, |t| t.trim().is_empty())
    }
}

/// Reference to media held by the upstream (e.g. a Telegram file_id). The forwarder never downloads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    /// "photo", "video", "document", ...
    pub kind: String,
    pub file_id: String,
}
