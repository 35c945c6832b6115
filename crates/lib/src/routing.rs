//! Target resolution: which configured destinations an inbound message is forwarded to.
//!
//! Resolution is a pure function of the configuration and the message, so re-processing a
//! message after a restart yields the same (message, target) keys.

use crate::channels::InboundMessage;
use serde::{Deserialize, Serialize};

/// How a message is relayed to a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Forward with the "Forwarded from" header.
    #[default]
    Forward,
    /// Copy the content without attribution.
    Copy,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Copy => "copy",
        }
    }
}

/// Which kind of content a target accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Any,
    /// Only messages without media.
    Text,
    /// Only messages carrying media.
    Media,
}

/// Optional per-target filter. An empty filter accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFilter {
    /// When non-empty, the text must contain at least one of these (case-insensitive).
    #[serde(default)]
    pub include_keywords: Vec<String>,
    /// The text must contain none of these (case-insensitive).
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default)]
    pub content: ContentKind,
}

impl TargetFilter {
    pub fn matches(&self, message: &InboundMessage) -> bool {
        let has_media = message.payload.has_media();
        match self.content {
            ContentKind::Any => {}
            ContentKind::Text if has_media => return false,
            ContentKind::Media if !has_media => return false,
            _ => {}
        }
        let text = message
            .payload
            .text
            .as_deref()
            .unwrap_or("")
            .to_lowercase();
        let contains = |k: &String| {
            let k = k.trim().to_lowercase();
            !k.is_empty() && text.contains(&k)
        };
        if self.exclude_keywords.iter().any(contains) {
            return false;
        }
        let includes: Vec<&String> = self
            .include_keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .collect();
        includes.is_empty() || includes.into_iter().any(contains)
    }
}

/// A configured destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Stable configured name; part of the delivery record key.
    pub id: String,
    /// Destination chat id (or @channel username).
    pub chat_id: String,
    /// Sources this target receives from; empty = every configured source.
    pub sources: Vec<String>,
    pub mode: ForwardMode,
    pub filter: TargetFilter,
}

impl ForwardTarget {
    pub fn new(id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            sources: Vec::new(),
            mode: ForwardMode::default(),
            filter: TargetFilter::default(),
        }
    }
}

/// Normalize a source/channel reference for comparison: trim, drop leading `@`, lowercase.
pub fn normalize_source(s: &str) -> String {
    s.trim().trim_start_matches('@').to_lowercase()
}

/// True if the message originates from `source` (matched by chat id or username).
fn origin_matches(source: &str, message: &InboundMessage) -> bool {
    let source = normalize_source(source);
    if source.is_empty() {
        return false;
    }
    if source == message.origin_chat_id.trim().to_lowercase() {
        return true;
    }
    message
        .origin_username
        .as_deref()
        .map(|u| normalize_source(u) == source)
        .unwrap_or(false)
}

/// Resolves inbound messages to forward targets.
#[derive(Debug, Clone)]
pub struct Router {
    sources: Vec<String>,
    /// Sorted by id for deterministic resolution.
    targets: Vec<ForwardTarget>,
}

impl Router {
    pub fn new(sources: Vec<String>, mut targets: Vec<ForwardTarget>) -> Self {
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        Self { sources, targets }
    }

    /// True if the message comes from one of the configured sources.
    pub fn is_source(&self, message: &InboundMessage) -> bool {
        self.sources.iter().any(|s| origin_matches(s, message))
    }

    /// Resolve the ordered set of targets for a message. Empty when the message is not from a source,
    /// or every target is filtered out.
    pub fn resolve_targets(&self, message: &InboundMessage) -> Vec<ForwardTarget> {
        if !self.is_source(message) {
            return Vec::new();
        }
        self.targets
            .iter()
            .filter(|t| t.chat_id.trim() != message.origin_chat_id.trim())
            .filter(|t| t.sources.is_empty() || t.sources.iter().any(|s| origin_matches(s, message)))
            .filter(|t| t.filter.matches(message))
            .cloned()
            .collect()
    }

    /// Look up a configured target by id.
    pub fn target(&self, id: &str) -> Option<&ForwardTarget> {
        self.targets.iter().find(|t| t.id == id)
    }
}
