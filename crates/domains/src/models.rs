//! # Domain Models
//!
//! These structs represent the core entities of threadboard.
//! Threads and posts share a single numeric id sequence held in the
//! [`SystemRecord`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw form submission, keyed by wire field name.
pub type RawSubmission = BTreeMap<String, String>;

/// Persistent store keys used by the content store.
pub mod keys {
    /// The system record (id counter and salt).
    pub const SYSTEM: &str = "SYS";

    const THREAD_PREFIX: &str = "thread-";
    const POST_PREFIX: &str = "post-";

    pub fn thread(id: u64) -> String {
        format!("{THREAD_PREFIX}{id}")
    }

    pub fn post(id: u64) -> String {
        format!("{POST_PREFIX}{id}")
    }

    /// Returns the id encoded in a `thread-{id}` key.
    pub fn parse_thread(key: &str) -> Option<u64> {
        parse_numbered(key, THREAD_PREFIX)
    }

    /// Returns the id encoded in a `post-{id}` key.
    pub fn parse_post(key: &str) -> Option<u64> {
        parse_numbered(key, POST_PREFIX)
    }

    fn parse_numbered(key: &str, prefix: &str) -> Option<u64> {
        let digits = key.strip_prefix(prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

/// The root post of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: u64,
    /// Board identifier (e.g. "b" for /b/)
    pub board: String,
    pub subject: String,
    pub email: String,
    pub body: String,
    /// Derived signature tag, rendered as `name!digest` or `name!!digest`
    #[serde(rename = "tripcode", default, skip_serializing_if = "Option::is_none")]
    pub signature_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    /// Reply ids in insertion order. Append-only except for moderator deletes.
    #[serde(default)]
    pub reply_ids: Vec<u64>,
}

impl Thread {
    /// Timestamp of the most recent activity: the last reply's creation
    /// time, or the thread's own when it has no replies.
    ///
    /// `reply_created_at` resolves a reply id to its creation time; replies
    /// that cannot be resolved are skipped.
    pub fn last_activity<F>(&self, reply_created_at: F) -> DateTime<Utc>
    where
        F: Fn(u64) -> Option<DateTime<Utc>>,
    {
        self.reply_ids
            .iter()
            .rev()
            .find_map(|id| reply_created_at(*id))
            .unwrap_or(self.created_at)
    }
}

/// A reply belonging to exactly one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: u64,
    pub thread_id: u64,
    /// Denormalized from the parent thread.
    pub board: String,
    pub email: String,
    pub body: String,
    #[serde(rename = "tripcode", default, skip_serializing_if = "Option::is_none")]
    pub signature_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Global id counter plus the installation-wide signature salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRecord {
    pub post_count: u64,
    pub salt: String,
}

/// Submitted content after sanitization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanContent {
    pub subject: String,
    pub email: String,
    pub body: String,
    /// `None` when the submitter left the signature field empty.
    pub signature_request: Option<String>,
}

/// Which kind of record a submission produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Thread,
    Post,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Thread => f.write_str("thread"),
            ContentKind::Post => f.write_str("post"),
        }
    }
}

/// One entry of the recent-activity feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FeedItem {
    Thread(Thread),
    Post(Post),
}

impl FeedItem {
    pub fn id(&self) -> u64 {
        match self {
            FeedItem::Thread(t) => t.id,
            FeedItem::Post(p) => p.id,
        }
    }
}

/// A thread together with its replies, in `reply_ids` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadDetail {
    pub op: Thread,
    pub replies: Vec<Post>,
}

/// Counters exposed on the index page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub post_count: u64,
    pub threads: usize,
}

/// A post whose parent thread does not list it in `reply_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    pub post_id: u64,
    pub thread_id: u64,
    /// Whether the parent thread record still exists.
    pub thread_exists: bool,
}
