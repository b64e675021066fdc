use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram chat id (numeric, negative for channels).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Telegram update id used to deduplicate membership events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateId(pub i64);

macro_rules! local_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

local_id!(
    /// Local channel record id.
    ChannelId
);
local_id!(GroupId);
local_id!(
    /// Multi-channel post id.
    PostId
);
local_id!(
    /// Per-channel variant id.
    ChannelPostId
);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the bot may do in a channel. Events always carry the full set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotPermissions {
    pub can_post: bool,
    pub can_edit: bool,
    pub can_delete: bool,
}

impl BotPermissions {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub chat_id: ChatId,
    pub title: String,
    pub username: Option<String>,
    pub chat_type: Option<String>,
    pub language: String,
    pub is_active: bool,
    pub bot_is_admin: bool,
    pub permissions: BotPermissions,
    pub group_id: Option<GroupId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named cluster of channels with exactly one primary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub id: GroupId,
    pub name: String,
    pub primary_channel_id: ChannelId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    pub disable_web_page_preview: bool,
    pub disable_notification: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    ReadyForPublish,
    Publishing,
    PartiallyPublished,
    Published,
    Failed,
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::ReadyForPublish => write!(f, "ready_for_publish"),
            Self::Publishing => write!(f, "publishing"),
            Self::PartiallyPublished => write!(f, "partially_published"),
            Self::Published => write!(f, "published"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-channel publish state.
///
/// `draft -> translating -> ready -> publishing -> published`, with `failed`
/// reachable from `translating` and `publishing`. `failed` only leaves via an
/// explicit re-publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPostStatus {
    Draft,
    Translating,
    Ready,
    Publishing,
    Published,
    Failed,
}

impl ChannelPostStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed)
    }

    /// Still waiting for text (either not requested or in flight).
    pub fn is_pending_text(&self) -> bool {
        matches!(self, Self::Draft | Self::Translating)
    }
}

impl fmt::Display for ChannelPostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Translating => write!(f, "translating"),
            Self::Ready => write!(f, "ready"),
            Self::Publishing => write!(f, "publishing"),
            Self::Published => write!(f, "published"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ChannelPostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "translating" => Ok(Self::Translating),
            "ready" => Ok(Self::Ready),
            "publishing" => Ok(Self::Publishing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid channel post status: {s}")),
        }
    }
}

/// Where a channel post's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    Primary,
    AutoTranslated,
    ManualOverride,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiChannelPost {
    pub id: PostId,
    pub group_id: GroupId,
    pub primary_channel_id: ChannelId,
    pub primary_text: String,
    pub source_language: String,
    pub auto_translate: bool,
    pub options: PublishOptions,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelPost {
    pub id: ChannelPostId,
    pub post_id: PostId,
    pub channel_id: ChannelId,
    pub text: String,
    pub source: TextSource,
    pub status: ChannelPostStatus,
    /// Set by a manual edit; translation passes never overwrite a locked row.
    pub locked: bool,
    pub message_id: Option<MessageId>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Which statistics source produced a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Rich,
    Degraded,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rich => write!(f, "rich"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub count: u64,
}

/// Point-in-time channel measurement. `None` metrics mean "not computed".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatsSnapshot {
    pub channel_id: ChannelId,
    pub subscribers: u64,
    pub posts_sampled: u32,
    pub avg_views: Option<f64>,
    pub er: Option<f64>,
    pub err: Option<f64>,
    pub provenance: Provenance,
    pub captured_at: DateTime<Utc>,
}

/// Point-in-time message measurement. `None` metrics mean "not computed".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostStats {
    pub channel_post_id: ChannelPostId,
    pub views: Option<u64>,
    pub forwards: Option<u64>,
    pub comments: Option<u64>,
    pub reactions_total: Option<u64>,
    pub reactions: Vec<Reaction>,
    pub er: Option<f64>,
    pub err: Option<f64>,
    pub provenance: Provenance,
    pub captured_at: DateTime<Utc>,
}

/// Aggregate a post's status from its children.
///
/// Total over every combination: any child still waiting for text keeps the
/// post a `draft`, then `publishing` while any attempt is in flight, then
/// all-published, then any published child (the rest failed or ready), then
/// all-failed. Whatever remains is a mix of `ready` and `failed`, which is
/// publishable.
pub fn rollup_status(children: &[ChannelPostStatus]) -> PostStatus {
    use ChannelPostStatus as C;

    if children.is_empty() {
        return PostStatus::Draft;
    }
    let count = |s: C| children.iter().filter(|c| **c == s).count();

    if children.iter().any(|c| c.is_pending_text()) {
        return PostStatus::Draft;
    }
    if count(C::Publishing) > 0 {
        return PostStatus::Publishing;
    }
    let published = count(C::Published);
    if published == children.len() {
        return PostStatus::Published;
    }
    if published > 0 {
        return PostStatus::PartiallyPublished;
    }
    if count(C::Failed) == children.len() {
        return PostStatus::Failed;
    }
    PostStatus::ReadyForPublish
}
