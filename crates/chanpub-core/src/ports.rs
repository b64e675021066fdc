//! Ports (traits) implemented by adapter crates, plus their payload types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        BotPermissions, Channel, ChannelGroup, ChannelId, ChannelPost, ChannelPostId,
        ChannelPostStatus, ChannelStatsSnapshot, ChatId, GroupId, MessageId, MessageRef,
        MultiChannelPost, PostId, PostStatus, PostStats, Provenance, Reaction, TextSource,
        UpdateId,
    },
    Result,
};

// ============== Messaging gateway ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub chat_id: ChatId,
    pub html: String,
    pub disable_web_page_preview: bool,
    pub disable_notification: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub title: Option<String>,
    pub username: Option<String>,
    pub chat_type: Option<String>,
    pub member_count: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BotMembership {
    pub is_member: bool,
    pub is_admin: bool,
    pub permissions: BotPermissions,
}

/// Outbound messaging. Implementations honor the idempotency key when the
/// upstream supports one.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send(&self, req: &SendRequest, idempotency_key: Option<&str>) -> Result<MessageRef>;
    async fn edit(&self, msg: MessageRef, html: &str, idempotency_key: Option<&str>)
        -> Result<()>;
    async fn delete(&self, msg: MessageRef) -> Result<()>;
    async fn channel_info(&self, chat_id: ChatId) -> Result<ChannelInfo>;
    async fn permissions(&self, chat_id: ChatId) -> Result<BotMembership>;
}

// ============== Translation service ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationRequest {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchTranslationRequest {
    pub text: String,
    pub source_language: String,
    pub target_languages: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    pub language: String,
    pub text: String,
    pub warnings: Vec<String>,
    pub tokens_used: u32,
}

/// A language the batch call reported as failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageFailure {
    pub language: String,
    pub reason: String,
    /// `false` for unsupported-language style rejections.
    pub retryable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchTranslation {
    pub translations: Vec<Translation>,
    pub failures: Vec<LanguageFailure>,
    pub total_tokens_used: u32,
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Longest input the service accepts, in characters.
    fn max_input_chars(&self) -> usize;
    /// Most target languages per batch call.
    fn max_batch_languages(&self) -> usize;

    async fn translate(&self, req: &TranslationRequest) -> Result<Translation>;
    async fn translate_batch(&self, req: &BatchTranslationRequest) -> Result<BatchTranslation>;
}

// ============== Statistics sources ==============

/// Totals over the trailing window of recent posts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecentPostTotals {
    pub posts: u32,
    pub views: u64,
    pub forwards: u64,
    pub reactions: u64,
    pub replies: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelMetrics {
    pub subscribers: u64,
    pub title: Option<String>,
    /// Only rich sources can see per-post history.
    pub recent: Option<RecentPostTotals>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageMetrics {
    pub views: Option<u64>,
    pub forwards: Option<u64>,
    pub replies: Option<u64>,
    pub reactions_total: Option<u64>,
    pub reactions: Vec<Reaction>,
}

/// One statistics source. The engine walks an ordered list of these.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    fn provenance(&self) -> Provenance;

    /// Cheap capability check (enabled and connected).
    async fn probe(&self) -> Result<bool>;

    async fn fetch_channel_stats(&self, chat_id: ChatId, recent_posts: u32)
        -> Result<ChannelMetrics>;
    async fn fetch_post_stats(&self, msg: MessageRef) -> Result<MessageMetrics>;
}

// ============== Membership updates ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    BotAdded,
    BotRemoved,
    BotPermissionsChanged,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub update_id: UpdateId,
    pub action: MembershipAction,
    pub chat_id: ChatId,
    pub title: Option<String>,
    pub username: Option<String>,
    pub chat_type: Option<String>,
    pub is_admin: bool,
    pub permissions: BotPermissions,
}

/// Pull source of pending membership events.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch_pending(&self) -> Result<Vec<MembershipEvent>>;
}

// ============== Persistence ==============

/// Conditional channel-post transition: applied only when the current status
/// is one of `from` (and, if `require_unlocked`, the row is not locked).
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub from: Vec<ChannelPostStatus>,
    pub to: ChannelPostStatus,
    pub require_unlocked: bool,
    pub patch: ChannelPostPatch,
}

impl Transition {
    pub fn new(from: &[ChannelPostStatus], to: ChannelPostStatus) -> Self {
        Self {
            from: from.to_vec(),
            to,
            require_unlocked: false,
            patch: ChannelPostPatch::default(),
        }
    }

    pub fn unlocked_only(mut self) -> Self {
        self.require_unlocked = true;
        self
    }

    pub fn with_patch(mut self, patch: ChannelPostPatch) -> Self {
        self.patch = patch;
        self
    }
}

/// Field updates; `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelPostPatch {
    pub text: Option<String>,
    pub source: Option<TextSource>,
    pub locked: Option<bool>,
    pub message_id: Option<Option<MessageId>>,
    pub published_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
}

/// Absolute-value channel update keyed by `chat_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelUpsert {
    pub chat_id: ChatId,
    pub title: Option<String>,
    pub username: Option<String>,
    pub chat_type: Option<String>,
    pub is_active: Option<bool>,
    pub bot_is_admin: Option<bool>,
    pub permissions: Option<BotPermissions>,
    /// Create the record when absent, with this language.
    pub create_with_language: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewPost {
    pub group_id: GroupId,
    pub primary_channel_id: ChannelId,
    pub primary_text: String,
    pub source_language: String,
    pub auto_translate: bool,
    pub options: crate::domain::PublishOptions,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewChannelPost {
    pub channel_id: ChannelId,
    pub text: String,
    pub source: TextSource,
    pub status: ChannelPostStatus,
}

/// Durable storage with atomic conditional transitions.
#[async_trait]
pub trait Store: Send + Sync {
    // Channels and groups
    async fn channel(&self, id: ChannelId) -> Result<Option<Channel>>;
    async fn channel_by_chat(&self, chat_id: ChatId) -> Result<Option<Channel>>;
    async fn active_channels(&self) -> Result<Vec<Channel>>;
    /// Returns the resulting record and whether it was created, or `None` when
    /// absent and creation was not requested.
    async fn upsert_channel(&self, upsert: ChannelUpsert) -> Result<Option<(Channel, bool)>>;
    async fn create_group(&self, name: &str, primary: ChannelId) -> Result<ChannelGroup>;
    async fn group(&self, id: GroupId) -> Result<Option<ChannelGroup>>;
    async fn assign_channel(&self, channel_id: ChannelId, group_id: Option<GroupId>)
        -> Result<()>;
    async fn channels_in_group(&self, group_id: GroupId) -> Result<Vec<Channel>>;

    // Posts
    async fn create_post(
        &self,
        post: NewPost,
        children: Vec<NewChannelPost>,
    ) -> Result<(MultiChannelPost, Vec<ChannelPost>)>;
    async fn post(&self, id: PostId) -> Result<Option<MultiChannelPost>>;
    async fn set_post_status(&self, id: PostId, status: PostStatus) -> Result<()>;
    async fn channel_post(&self, id: ChannelPostId) -> Result<Option<ChannelPost>>;
    async fn channel_posts(&self, post_id: PostId) -> Result<Vec<ChannelPost>>;
    async fn channel_posts_in_status(&self, status: ChannelPostStatus)
        -> Result<Vec<ChannelPost>>;
    async fn published_since(&self, since: DateTime<Utc>) -> Result<Vec<ChannelPost>>;
    /// Compare-and-set; `Error::Conflict` when the precondition does not hold.
    async fn transition(&self, id: ChannelPostId, t: Transition) -> Result<ChannelPost>;

    // Statistics (append-only series)
    async fn append_channel_snapshot(&self, s: ChannelStatsSnapshot) -> Result<()>;
    async fn latest_channel_snapshot(&self, id: ChannelId)
        -> Result<Option<ChannelStatsSnapshot>>;
    async fn channel_snapshot_at_or_before(
        &self,
        id: ChannelId,
        at: DateTime<Utc>,
    ) -> Result<Option<ChannelStatsSnapshot>>;
    async fn append_post_stats(&self, s: PostStats) -> Result<()>;
    async fn latest_post_stats(&self, id: ChannelPostId) -> Result<Option<PostStats>>;
    async fn prune_stats_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // Update dedup
    /// Atomically record an update id; `false` when it was already recorded.
    async fn mark_update_processed(&self, id: UpdateId) -> Result<bool>;
    async fn forget_update(&self, id: UpdateId) -> Result<()>;
}
