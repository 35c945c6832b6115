//! Telegram channel: long-poll getUpdates as the upstream, forwardMessage/copyMessage as the outbound.

use crate::channels::inbound::{InboundMessage, Payload};
use crate::delivery::{DeliveryOutcome, Outbound};
use crate::listener::{Upstream, UpstreamBatch, UpstreamError};
use crate::routing::{ForwardMode, ForwardTarget};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_POLL_TIMEOUT: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Bot API response envelope. `result` is kept raw; callers decode what they need.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    #[serde(default)]
    pub retry_after: Option<u64>,
    #[serde(default)]
    pub migrate_to_chat_id: Option<i64>,
}

impl ApiResponse {
    fn describe(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| "no description".to_string())
    }
}

/// Telegram update (getUpdates result item). Only message-bearing kinds are decoded.
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub channel_post: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<FileRef>>,
    #[serde(default)]
    pub video: Option<FileRef>,
    #[serde(default)]
    pub document: Option<FileRef>,
    #[serde(default)]
    pub audio: Option<FileRef>,
    #[serde(default)]
    pub voice: Option<FileRef>,
    #[serde(default)]
    pub animation: Option<FileRef>,
    #[serde(default)]
    pub sticker: Option<FileRef>,
    #[serde(default)]
    pub video_note: Option<FileRef>,
    #[serde(default)]
    pub poll: Option<serde_json::Value>,
    #[serde(default)]
    pub location: Option<serde_json::Value>,
    #[serde(default)]
    pub venue: Option<serde_json::Value>,
    #[serde(default)]
    pub contact: Option<serde_json::Value>,
    #[serde(default)]
    pub dice: Option<serde_json::Value>,
    #[serde(default)]
    pub game: Option<serde_json::Value>,
    #[serde(default)]
    pub story: Option<serde_json::Value>,
    #[serde(default)]
    pub invoice: Option<serde_json::Value>,
    #[serde(default)]
    pub giveaway: Option<serde_json::Value>,
    #[serde(default)]
    pub paid_media: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileRef {
    pub file_id: String,
}

/// getMe result.
#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

impl TelegramMessage {
    fn payload(&self) -> Payload {
        let text = self.text.clone().or_else(|| self.caption.clone());
        // Photo sizes are ordered smallest first.
        let media = [
            ("photo", self.photo.as_ref().and_then(|p| p.last())),
            ("video", self.video.as_ref()),
            ("document", self.document.as_ref()),
            ("audio", self.audio.as_ref()),
            ("voice", self.voice.as_ref()),
            ("animation", self.animation.as_ref()),
            ("sticker", self.sticker.as_ref()),
            ("video_note", self.video_note.as_ref()),
        ]
        .into_iter()
        .find_map(|(kind, f)| f.map(|f| (kind, f.file_id.clone())));
        match media {
            Some((kind, file_id)) => Payload::media(kind, file_id, text),
            None => Payload { text, media: None },
        }
    }

    /// Content the Bot API can forward but that carries no file or text (polls, locations, ...).
    fn other_content(&self) -> Option<&'static str> {
        [
            ("poll", &self.poll),
            ("location", &self.location),
            ("venue", &self.venue),
            ("contact", &self.contact),
            ("dice", &self.dice),
            ("game", &self.game),
            ("story", &self.story),
            ("invoice", &self.invoice),
            ("giveaway", &self.giveaway),
            ("paid_media", &self.paid_media),
        ]
        .into_iter()
        .find_map(|(kind, v)| v.as_ref().map(|_| kind))
    }
}

impl TelegramUpdate {
    /// Convert to an inbound message. None for service messages (pins, member changes, ...),
    /// which forwardMessage rejects.
    pub fn into_inbound(self) -> Option<InboundMessage> {
        let offset = self.update_id;
        let msg = self.channel_post.or(self.message)?;
        let payload = msg.payload();
        if payload.is_empty() {
            match msg.other_content() {
                Some(kind) => log::debug!(
                    "telegram: update {} carries a {}, forwarded without text",
                    offset,
                    kind
                ),
                None => {
                    log::debug!(
                        "telegram: update {} from chat {} has no forwardable content",
                        offset,
                        msg.chat.id
                    );
                    return None;
                }
            }
        }
        let inbound = InboundMessage::new(offset, msg.chat.id.to_string(), msg.message_id, payload);
        Some(match msg.chat.username {
            Some(u) => inbound.with_username(u),
            None => inbound,
        })
    }
}

/// Map a Bot API send response to a delivery outcome.
pub fn classify_response(status: u16, body: Option<&ApiResponse>) -> DeliveryOutcome {
    if let Some(b) = body {
        if b.ok && (200..300).contains(&status) {
            return DeliveryOutcome::Delivered;
        }
    }
    let code = body.and_then(|b| b.error_code).unwrap_or(status);
    let reason = match body {
        Some(b) => format!("{} {}", code, b.describe()),
        None => format!("{} unreadable response", status),
    };
    if let Some(new_id) = body
        .and_then(|b| b.parameters.as_ref())
        .and_then(|p| p.migrate_to_chat_id)
    {
        return DeliveryOutcome::permanent(format!("{} (chat migrated to {})", reason, new_id));
    }
    match code {
        429 => DeliveryOutcome::TransientFailure {
            reason,
            retry_after: body
                .and_then(|b| b.parameters.as_ref())
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs),
        },
        500..=599 => DeliveryOutcome::transient(reason),
        // 2xx with ok=false or an unparseable body: nothing we can fix by resending the same request.
        _ => DeliveryOutcome::permanent(reason),
    }
}

/// Telegram connector. Long-polls for updates and relays them with forwardMessage or copyMessage.
pub struct TelegramChannel {
    id: String,
    token: String,
    api_base: String,
    poll_timeout: u64,
    /// Bound for calls outside the delivery worker's attempt timeout (getMe, sendMessage).
    request_timeout: Duration,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            id: "telegram".to_string(),
            token: token.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    /// Use a different Bot API endpoint (local Bot API server, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout = secs;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Verify the token with getMe.
    pub async fn get_me(&self) -> Result<BotIdentity, UpstreamError> {
        let res = self
            .client
            .get(self.method_url("getMe"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        let status = res.status();
        if status.as_u16() == 401 || status.as_u16() == 404 {
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::Unauthorized(format!("getMe: {} {}", status, body)));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::Request(format!("getMe failed: {} {}", status, body)));
        }
        let data: ApiResponse = res
            .json()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        let result = data
            .result
            .ok_or_else(|| UpstreamError::Request("getMe returned no result".to_string()))?;
        serde_json::from_value(result).map_err(|e| UpstreamError::Request(e.to_string()))
    }

    /// Call getUpdates (long poll) for updates after `resume_after`.
    pub async fn get_updates(&self, resume_after: Option<i64>) -> Result<Vec<TelegramUpdate>, UpstreamError> {
        let mut body = serde_json::json!({
            "timeout": self.poll_timeout,
            "allowed_updates": ["message", "channel_post"],
        });
        if let Some(off) = resume_after {
            body["offset"] = serde_json::Value::from(off + 1);
        }
        let res = self
            .client
            .post(self.method_url("getUpdates"))
            .json(&body)
            .timeout(Duration::from_secs(self.poll_timeout + 10))
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        let status = res.status();
        if status.as_u16() == 401 || status.as_u16() == 404 {
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::Unauthorized(format!("getUpdates: {} {}", status, body)));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::Request(format!("getUpdates failed: {} {}", status, body)));
        }
        let data: ApiResponse = res
            .json()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        if !data.ok {
            return Err(UpstreamError::Request(format!(
                "getUpdates returned ok: false ({})",
                data.describe()
            )));
        }
        let updates = match data.result {
            Some(v) => serde_json::from_value(v).map_err(|e| UpstreamError::Request(e.to_string()))?,
            None => Vec::new(),
        };
        Ok(updates)
    }

    /// Relay one message to a target. Exactly one HTTP request.
    pub async fn relay(&self, message: &InboundMessage, target: &ForwardTarget) -> DeliveryOutcome {
        let method = match target.mode {
            ForwardMode::Forward => "forwardMessage",
            ForwardMode::Copy => "copyMessage",
        };
        let body = serde_json::json!({
            "chat_id": target.chat_id,
            "from_chat_id": message.origin_chat_id,
            "message_id": message.source_message_id,
        });
        let res = match self.client.post(self.method_url(method)).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return DeliveryOutcome::transient(format!("{} request failed: {}", method, e)),
        };
        let status = res.status().as_u16();
        let parsed: Option<ApiResponse> = res.json().await.ok();
        classify_response(status, parsed.as_ref())
    }

    /// Send a text message to a chat via sendMessage.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), String> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let res = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("sendMessage failed: {} {}", status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl Upstream for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn receive(&self, resume_after: Option<i64>) -> Result<UpstreamBatch, UpstreamError> {
        let updates = self.get_updates(resume_after).await?;
        let last_offset = updates.iter().map(|u| u.update_id).max();
        let messages = updates
            .into_iter()
            .filter_map(TelegramUpdate::into_inbound)
            .collect();
        Ok(UpstreamBatch {
            messages,
            last_offset,
        })
    }
}

#[async_trait]
impl Outbound for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &InboundMessage, target: &ForwardTarget) -> DeliveryOutcome {
        self.relay(message, target).await
    }

    async fn notify(&self, chat_id: &str, text: &str) -> Result<(), String> {
        self.send_message(chat_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ApiResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn classifies_rate_limit_with_hint() {
        let body = parse(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#,
        );
        match classify_response(429, Some(&body)) {
            DeliveryOutcome::TransientFailure { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn classifies_server_errors_as_transient_and_client_errors_as_permanent() {
        let gw = parse(r#"{"ok":false,"error_code":502,"description":"Bad Gateway"}"#);
        assert!(matches!(
            classify_response(502, Some(&gw)),
            DeliveryOutcome::TransientFailure { .. }
        ));
        assert!(matches!(
            classify_response(503, None),
            DeliveryOutcome::TransientFailure { .. }
        ));
        let gone = parse(r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#);
        assert_eq!(
            classify_response(400, Some(&gone)),
            DeliveryOutcome::permanent("400 Bad Request: chat not found")
        );
        let kicked = parse(r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was kicked"}"#);
        assert!(matches!(
            classify_response(403, Some(&kicked)),
            DeliveryOutcome::PermanentFailure { .. }
        ));
        let ok = parse(r#"{"ok":true,"result":{"message_id":5}}"#);
        assert_eq!(classify_response(200, Some(&ok)), DeliveryOutcome::Delivered);
    }

    #[test]
    fn channel_post_with_photo_maps_to_inbound() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{"update_id":11,"channel_post":{"message_id":3,"chat":{"id":-1001,"username":"news"},
               "caption":"look","photo":[{"file_id":"small"},{"file_id":"large"}]}}"#,
        )
        .unwrap();
        let m = update.into_inbound().unwrap();
        assert_eq!(m.id, "-1001:3");
        assert_eq!(m.offset, 11);
        assert_eq!(m.origin_username.as_deref(), Some("news"));
        assert_eq!(m.payload.text.as_deref(), Some("look"));
        assert_eq!(m.payload.media.as_ref().unwrap().file_id, "large");
    }

    #[test]
    fn service_updates_have_no_inbound() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{"update_id":12,"message":{"message_id":4,"chat":{"id":5},"pinned_message":{"message_id":3,"chat":{"id":5}}}}"#,
        )
        .unwrap();
        assert!(update.into_inbound().is_none());
        let other: TelegramUpdate =
            serde_json::from_str(r#"{"update_id":13,"my_chat_member":{}}"#).unwrap();
        assert!(other.into_inbound().is_none());
    }

    #[test]
    fn polls_locations_and_contacts_map_to_inbound() {
        let posts = [
            (20, r#""poll":{"id":"p1","question":"Lunch?","options":[]}"#),
            (21, r#""location":{"latitude":52.5,"longitude":13.4}"#),
            (22, r#""contact":{"phone_number":"+100","first_name":"Ann"}"#),
        ];
        for (update_id, content) in posts {
            let json = format!(
                r#"{{"update_id":{},"channel_post":{{"message_id":{},"chat":{{"id":-1001}},{}}}}}"#,
                update_id, update_id, content
            );
            let update: TelegramUpdate = serde_json::from_str(&json).unwrap();
            let m = update.into_inbound().expect("content post is forwardable");
            assert_eq!(m.offset, update_id);
            assert_eq!(m.source_message_id, update_id);
            assert!(m.payload.is_empty());
        }
    }
}
