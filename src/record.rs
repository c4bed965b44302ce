//! Raw post parsing and the normalized per-link record stored in partitions.

use crate::date::{checked_epoch, epoch_from_f64, parse_event_time};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Line-level schema for raw post exports. Extra fields are ignored by serde.
/// Ids may be numbers or strings depending on the exporter.
#[derive(Debug, Deserialize)]
struct RawPost {
    #[serde(alias = "tweet_id", alias = "post_id")]
    id: Option<Value>,
    local_time: Option<Value>,
    #[serde(alias = "created_utc")]
    timestamp_utc: Option<Value>,
    user_id: Option<Value>,
    retweeted_id: Option<Value>,
    links: Option<Value>,
}

/// Why a raw line was excluded from partitioning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    MissingId,
    BadTimestamp,
}

/// A raw post with its event time resolved and its links split out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Post {
    pub id: String,
    pub event_time: i64,
    pub user_id: Option<String>,
    pub reposted_id: Option<String>,
    pub links: Vec<String>,
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn event_time(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => match n.as_i64() {
            Some(secs) => checked_epoch(secs),
            None => n.as_f64().and_then(epoch_from_f64),
        },
        Value::String(s) => parse_event_time(s),
        _ => None,
    }
}

fn split_links(v: &Value) -> Vec<String> {
    let mut out: Vec<String> = match v {
        Value::String(s) => s.split('|').map(|l| l.trim().to_string()).collect(),
        Value::Array(items) => items.iter().filter_map(|i| i.as_str().map(|s| s.trim().to_string())).collect(),
        _ => Vec::new(),
    };
    out.retain(|l| !l.is_empty());
    // Keep first-seen order while removing repeats of the same link in one post.
    let mut seen = std::collections::HashSet::new();
    out.retain(|l| seen.insert(l.clone()));
    out
}

/// Parse one JSONL line. `local_time` wins over `timestamp_utc` when both parse.
pub fn parse_post(line: &str) -> Result<Post, DropReason> {
    let raw: RawPost = serde_json::from_str(line).map_err(|_| DropReason::Malformed)?;
    let id = raw.id.as_ref().and_then(scalar_string).ok_or(DropReason::MissingId)?;
    let event_time = raw
        .local_time
        .as_ref()
        .and_then(event_time)
        .or_else(|| raw.timestamp_utc.as_ref().and_then(event_time))
        .ok_or(DropReason::BadTimestamp)?;
    Ok(Post {
        id,
        event_time,
        user_id: raw.user_id.as_ref().and_then(scalar_string),
        reposted_id: raw.retweeted_id.as_ref().and_then(scalar_string),
        links: raw.links.as_ref().map(split_links).unwrap_or_default(),
    })
}

/// One (post, link) pair after URL normalization. This is the row type of a
/// partition relation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    #[serde(rename = "id")]
    pub post_id: String,
    #[serde(rename = "ts")]
    pub event_time: i64,
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "rt", default, skip_serializing_if = "Option::is_none")]
    pub reposted_id: Option<String>,
    #[serde(rename = "l")]
    pub link: String,
    #[serde(rename = "nu")]
    pub normalized_url: String,
    #[serde(rename = "d")]
    pub domain: String,
    #[serde(rename = "ch", default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Record fields addressable from schema expressions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    PostId,
    UserId,
    RepostedId,
    Link,
    NormalizedUrl,
    Domain,
    ChannelId,
    EventTime,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::PostId,
        Field::UserId,
        Field::RepostedId,
        Field::Link,
        Field::NormalizedUrl,
        Field::Domain,
        Field::ChannelId,
        Field::EventTime,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::PostId => "post_id",
            Field::UserId => "user_id",
            Field::RepostedId => "reposted_id",
            Field::Link => "link",
            Field::NormalizedUrl => "normalized_url",
            Field::Domain => "domain",
            Field::ChannelId => "channel_id",
            Field::EventTime => "event_time",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let alias = match s {
            "tweet_id" | "id" => "post_id",
            "retweeted_id" => "reposted_id",
            "domain_name" => "domain",
            "local_time" => "event_time",
            other => other,
        };
        Field::ALL.into_iter().find(|f| f.name() == alias)
    }

    /// A field is partition-aligned when a given value can only ever occur in
    /// one partition. Posts carry exactly one event time, so their ids are.
    pub fn is_partition_aligned(self) -> bool {
        matches!(self, Field::PostId | Field::EventTime)
    }

    /// The field's value as text, if present.
    pub fn get<'a>(self, rec: &'a PostRecord) -> Option<Cow<'a, str>> {
        match self {
            Field::PostId => Some(Cow::Borrowed(rec.post_id.as_str())),
            Field::UserId => rec.user_id.as_deref().map(Cow::Borrowed),
            Field::RepostedId => rec.reposted_id.as_deref().map(Cow::Borrowed),
            Field::Link => Some(Cow::Borrowed(rec.link.as_str())),
            Field::NormalizedUrl => Some(Cow::Borrowed(rec.normalized_url.as_str())),
            Field::Domain => Some(Cow::Borrowed(rec.domain.as_str())),
            Field::ChannelId => rec.channel_id.as_deref().map(Cow::Borrowed),
            Field::EventTime => Some(Cow::Owned(rec.event_time.to_string())),
        }
    }
}
