//! Delivery context: where a reply should land.
//!
//! A [`DeliveryContext`] is the channel-routing tuple `{channel, to,
//! accountId, threadId}`. All fields are optional; normalization elides
//! empty strings, and a context with nothing left normalizes to `None`.
//! Merge is field-wise primary-first. The bucket key used by the
//! announce queue is derived from channel + recipient.
//!
//! Channel and account-id canonicalization belongs to the channel
//! plugin registry; the core applies its baseline rules locally (trim,
//! lowercase channel names).

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::store::SessionEntry;

// ─────────────────────────────────────────────────────────────────────────────
// ThreadId
// ─────────────────────────────────────────────────────────────────────────────

/// Thread identifier within a channel.
///
/// Channels disagree on the shape: Telegram topics are integers, Slack
/// thread timestamps are strings. Numeric inputs are truncated to
/// integers; non-finite numbers are rejected at parse time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ThreadId {
    /// Integer thread id (e.g. Telegram topic).
    Number(i64),
    /// String thread id (e.g. Slack thread timestamp).
    Text(String),
}

impl ThreadId {
    /// Parse a thread id from a loose JSON value.
    ///
    /// Numbers are truncated to integers; strings are trimmed and elided
    /// when empty; everything else (null, bool, arrays) yields `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Number(i))
                } else {
                    n.as_f64().filter(|f| f.is_finite()).map(|f| Self::Number(f as i64))
                }
            }
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(Self::Text(trimmed.to_owned()))
                }
            }
            _ => None,
        }
    }

    /// Normalize in place: trim textual ids, elide empty ones.
    #[must_use]
    fn normalized(&self) -> Option<Self> {
        match self {
            Self::Number(n) => Some(Self::Number(*n)),
            Self::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(Self::Text(trimmed.to_owned()))
                }
            }
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl Serialize for ThreadId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_i64(*n),
            Self::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for ThreadId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ThreadIdVisitor;

        impl Visitor<'_> for ThreadIdVisitor {
            type Value = ThreadId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a thread id (number or string)")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ThreadId, E> {
                Ok(ThreadId::Number(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ThreadId, E> {
                Ok(ThreadId::Number(v as i64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<ThreadId, E> {
                if v.is_finite() {
                    Ok(ThreadId::Number(v as i64))
                } else {
                    Err(E::custom("non-finite thread id"))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ThreadId, E> {
                Ok(ThreadId::Text(v.to_owned()))
            }
        }

        deserializer.deserialize_any(ThreadIdVisitor)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DeliveryContext
// ─────────────────────────────────────────────────────────────────────────────

/// Channel-routing tuple for outbound delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryContext {
    /// Channel plugin name (e.g. `slack`, `telegram`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Recipient id within the channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Account the message is sent from, for multi-account channels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Thread within the conversation, when the channel supports threads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
}

impl DeliveryContext {
    /// Normalize a context: trim every field, elide empties, lowercase
    /// the channel name. Returns `None` when nothing remains.
    #[must_use]
    pub fn normalize(ctx: &Self) -> Option<Self> {
        let channel = normalize_channel(ctx.channel.as_deref());
        let to = normalize_string(ctx.to.as_deref());
        let account_id = normalize_string(ctx.account_id.as_deref());
        let thread_id = ctx.thread_id.as_ref().and_then(ThreadId::normalized);

        if channel.is_none() && to.is_none() && account_id.is_none() && thread_id.is_none() {
            return None;
        }
        Some(Self {
            channel,
            to,
            account_id,
            thread_id,
        })
    }

    /// Merge two contexts field-wise, primary first, then re-normalize.
    #[must_use]
    pub fn merge(primary: Option<&Self>, fallback: Option<&Self>) -> Option<Self> {
        let merged = match (primary, fallback) {
            (None, None) => return None,
            (Some(p), None) => p.clone(),
            (None, Some(f)) => f.clone(),
            (Some(p), Some(f)) => Self {
                channel: p.channel.clone().or_else(|| f.channel.clone()),
                to: p.to.clone().or_else(|| f.to.clone()),
                account_id: p.account_id.clone().or_else(|| f.account_id.clone()),
                thread_id: p.thread_id.clone().or_else(|| f.thread_id.clone()),
            },
        };
        Self::normalize(&merged)
    }

    /// Derive a delivery context from a session store entry.
    ///
    /// Prefers the last observed route (`last_channel` / `last_to` /
    /// `last_account_id` / `last_thread_id`), then the session's persisted
    /// delivery context, then the origin thread.
    #[must_use]
    pub fn from_session(entry: &SessionEntry) -> Option<Self> {
        let persisted = entry.delivery_context.as_ref();
        let candidate = Self {
            channel: entry
                .last_channel
                .clone()
                .or_else(|| persisted.and_then(|c| c.channel.clone())),
            to: entry
                .last_to
                .clone()
                .or_else(|| persisted.and_then(|c| c.to.clone())),
            account_id: entry
                .last_account_id
                .clone()
                .or_else(|| persisted.and_then(|c| c.account_id.clone())),
            thread_id: entry
                .last_thread_id
                .clone()
                .or_else(|| persisted.and_then(|c| c.thread_id.clone()))
                .or_else(|| entry.origin_thread_id.clone()),
        };
        Self::normalize(&candidate)
    }

    /// Announce-queue bucket key: `"<channel>|<to>|<accountId>|<threadId>"`.
    ///
    /// Defined only when channel and recipient are both present; the last
    /// two segments may be empty.
    #[must_use]
    pub fn key(ctx: &Self) -> Option<String> {
        let normalized = Self::normalize(ctx)?;
        let channel = normalized.channel?;
        let to = normalized.to?;
        let account = normalized.account_id.unwrap_or_default();
        let thread = normalized
            .thread_id
            .map(|t| t.to_string())
            .unwrap_or_default();
        Some(format!("{channel}|{to}|{account}|{thread}"))
    }
}

fn normalize_string(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn normalize_channel(value: Option<&str>) -> Option<String> {
    normalize_string(value).map(|s| s.to_ascii_lowercase())
}
