//! # Change Events
//!
//! The immutable record delivered by the upstream for every change on the
//! monitored wikis. One `ChangeEvent` is created per SSE message, shared as
//! `Arc<ChangeEvent>` with every route, and dropped once all workers finish.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// `meta.domain` value the upstream stamps on synthetic validation traffic.
pub const CANARY_DOMAIN: &str = "canary";

/// `[[:Subject]] added to category` / `[[:Subject]] removed from category`
static CATEGORY_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\[:(?P<subject>[^\]]+?)\]\]\s+(?P<action>added|removed)\b")
        .expect("category comment pattern is valid")
});

/// Metadata block attached by the upstream to each record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMeta {
    /// Domain the record originates from (`en.wikipedia.org`, or `canary`).
    pub domain: String,
    /// Upstream's unique id for this record.
    pub id: Option<String>,
    /// Stream name the record was published on.
    pub stream: Option<String>,
    /// ISO-8601 event time as rendered by the upstream.
    pub dt: Option<String>,
}

/// # Change Event
///
/// Field names follow the upstream wire format; `type` is exposed as `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Origin identifier of the wiki (`enwiki`, `commonswiki`...).
    #[serde(default)]
    pub wiki: String,
    /// `edit`, `new`, `log`, `categorize`, `external`...
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Subject title (the page that changed, or the category for `categorize`).
    #[serde(default)]
    pub title: String,
    /// Actor.
    #[serde(default)]
    pub user: String,
    /// Human-readable edit summary.
    #[serde(default)]
    pub comment: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub meta: EventMeta,

    /// Recent-change id, when the upstream provides one.
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub namespace: Option<i64>,
    #[serde(default)]
    pub bot: Option<bool>,
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Category membership change recovered from a `categorize` comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryChange {
    /// `subject` was added to the event's category (`title`).
    Added(String),
    /// `subject` was removed from the event's category (`title`).
    Removed(String),
}

impl CategoryChange {
    pub fn subject(&self) -> &str {
        match self {
            CategoryChange::Added(s) | CategoryChange::Removed(s) => s,
        }
    }
}

impl ChangeEvent {
    /// Decodes one SSE `data:` payload.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Synthetic validation traffic never reaches routes.
    pub fn is_canary(&self) -> bool {
        self.meta.domain == CANARY_DOMAIN
    }

    pub fn is_categorize(&self) -> bool {
        self.kind == "categorize"
    }

    /// Parses the comment of a `categorize` event. Free text, so `None` is common.
    pub fn category_change(&self) -> Option<CategoryChange> {
        if !self.is_categorize() {
            return None;
        }
        let caps = CATEGORY_COMMENT.captures(&self.comment)?;
        let subject = caps.name("subject")?.as_str().to_string();
        match caps.name("action")?.as_str() {
            "added" => Some(CategoryChange::Added(subject)),
            _ => Some(CategoryChange::Removed(subject)),
        }
    }

    /// Stable identity for idempotent workers: the upstream id when present,
    /// otherwise wiki + type + title + timestamp.
    pub fn dedup_key(&self) -> String {
        match (&self.meta.id, self.id) {
            (Some(meta_id), _) => meta_id.clone(),
            (None, Some(rc_id)) => format!("{}:{}", self.wiki, rc_id),
            (None, None) => format!("{}:{}:{}:{}", self.wiki, self.kind, self.title, self.timestamp),
        }
    }
}
