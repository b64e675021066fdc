//! In-process store with compare-and-set transitions.
//!
//! State lives behind one async mutex, so every method is atomic with respect
//! to the others. When a snapshot path is configured the whole state is
//! written as JSON after each mutation and reloaded by [`MemoryStore::open`].
//! A mutation is applied to a copy first and only becomes visible once that
//! copy is on disk, so a failed write leaves the previous state in place.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{
        Channel, ChannelGroup, ChannelId, ChannelPost, ChannelPostId, ChannelPostStatus,
        ChannelStatsSnapshot, ChatId, GroupId, MultiChannelPost, PostId, PostStats, PostStatus,
        UpdateId,
    },
    errors::Error,
    ports::{ChannelUpsert, NewChannelPost, NewPost, Store, Transition},
    Result,
};

/// Processed update ids kept before the oldest are folded into the floor.
pub const DEFAULT_UPDATE_WINDOW: usize = 10_000;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    channels: BTreeMap<u64, Channel>,
    groups: BTreeMap<u64, ChannelGroup>,
    posts: BTreeMap<u64, MultiChannelPost>,
    channel_posts: BTreeMap<u64, ChannelPost>,
    channel_snapshots: Vec<ChannelStatsSnapshot>,
    post_stats: Vec<PostStats>,
    processed_updates: BTreeSet<i64>,
    /// Every id at or below this was processed and evicted from the window.
    #[serde(default)]
    update_floor: Option<i64>,
}

impl StoreState {
    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Whether a mutation touched the state.
enum Change<R> {
    Changed(R),
    Unchanged(R),
}

impl<R> Change<R> {
    fn into_inner(self) -> R {
        match self {
            Change::Changed(r) | Change::Unchanged(r) => r,
        }
    }
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
    snapshot_path: Option<PathBuf>,
    update_window: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot_path: None,
            update_window: DEFAULT_UPDATE_WINDOW,
        }
    }

    /// Load a previous snapshot if present and keep persisting to `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), "store opened");
        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path),
            update_window: DEFAULT_UPDATE_WINDOW,
        })
    }

    /// Number of recent update ids remembered individually.
    pub fn with_update_window(mut self, window: usize) -> Self {
        self.update_window = window.max(1);
        self
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let json = serde_json::to_vec(state)?;
        // Write-then-rename so a crash never leaves a torn file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Run `f` against the state, persisting before the change becomes visible.
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<Change<R>>,
    ) -> Result<R> {
        let mut state = self.state.lock().await;
        if self.snapshot_path.is_none() {
            return f(&mut *state).map(Change::into_inner);
        }
        let mut next = state.clone();
        match f(&mut next)? {
            Change::Unchanged(out) => Ok(out),
            Change::Changed(out) => {
                self.persist(&next).await?;
                *state = next;
                Ok(out)
            }
        }
    }
}

fn post_not_found(id: PostId) -> Error {
    Error::NotFound(format!("post {id}"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        Ok(self.state.lock().await.channels.get(&id.0).cloned())
    }

    async fn channel_by_chat(&self, chat_id: ChatId) -> Result<Option<Channel>> {
        let state = self.state.lock().await;
        Ok(state
            .channels
            .values()
            .find(|c| c.chat_id == chat_id)
            .cloned())
    }

    async fn active_channels(&self) -> Result<Vec<Channel>> {
        let state = self.state.lock().await;
        Ok(state
            .channels
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }

    async fn upsert_channel(&self, u: ChannelUpsert) -> Result<Option<(Channel, bool)>> {
        self.mutate(|state| {
            let now = Utc::now();

            let existing = state
                .channels
                .values()
                .find(|c| c.chat_id == u.chat_id)
                .map(|c| c.id.0);

            let (id, created) = match (existing, &u.create_with_language) {
                (Some(id), _) => (id, false),
                (None, Some(language)) => {
                    let id = state.alloc();
                    let channel = Channel {
                        id: ChannelId(id),
                        chat_id: u.chat_id,
                        title: format!("Channel {}", u.chat_id),
                        username: None,
                        chat_type: None,
                        language: language.clone(),
                        is_active: true,
                        bot_is_admin: false,
                        permissions: Default::default(),
                        group_id: None,
                        created_at: now,
                        updated_at: now,
                    };
                    state.channels.insert(id, channel);
                    (id, true)
                }
                (None, None) => return Ok(Change::Unchanged(None)),
            };

            let channel = state
                .channels
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("channel {id}")))?;
            if let Some(title) = u.title.filter(|t| !t.trim().is_empty()) {
                channel.title = title;
            }
            if u.username.is_some() {
                channel.username = u.username;
            }
            if u.chat_type.is_some() {
                channel.chat_type = u.chat_type;
            }
            if let Some(active) = u.is_active {
                channel.is_active = active;
            }
            if let Some(admin) = u.bot_is_admin {
                channel.bot_is_admin = admin;
            }
            if let Some(perms) = u.permissions {
                channel.permissions = perms;
            }
            channel.updated_at = now;
            Ok(Change::Changed(Some((channel.clone(), created))))
        })
        .await
    }

    async fn create_group(&self, name: &str, primary: ChannelId) -> Result<ChannelGroup> {
        self.mutate(|state| {
            let primary_group = state
                .channels
                .get(&primary.0)
                .ok_or_else(|| Error::NotFound(format!("channel {primary}")))?
                .group_id;
            if let Some(g) = primary_group {
                return Err(Error::Validation(format!(
                    "channel {primary} already belongs to group {g}"
                )));
            }

            let id = GroupId(state.alloc());
            let group = ChannelGroup {
                id,
                name: name.to_string(),
                primary_channel_id: primary,
            };
            state.groups.insert(id.0, group.clone());
            if let Some(c) = state.channels.get_mut(&primary.0) {
                c.group_id = Some(id);
                c.updated_at = Utc::now();
            }
            Ok(Change::Changed(group))
        })
        .await
    }

    async fn group(&self, id: GroupId) -> Result<Option<ChannelGroup>> {
        Ok(self.state.lock().await.groups.get(&id.0).cloned())
    }

    async fn assign_channel(&self, channel_id: ChannelId, group_id: Option<GroupId>) -> Result<()> {
        self.mutate(|state| {
            if let Some(g) = group_id {
                if !state.groups.contains_key(&g.0) {
                    return Err(Error::NotFound(format!("group {g}")));
                }
            }
            if let Some(g) = state
                .groups
                .values()
                .find(|g| g.primary_channel_id == channel_id && Some(g.id) != group_id)
            {
                return Err(Error::Validation(format!(
                    "channel {channel_id} is the primary of group {}",
                    g.id
                )));
            }

            let channel = state
                .channels
                .get_mut(&channel_id.0)
                .ok_or_else(|| Error::NotFound(format!("channel {channel_id}")))?;
            channel.group_id = group_id;
            channel.updated_at = Utc::now();
            Ok(Change::Changed(()))
        })
        .await
    }

    async fn channels_in_group(&self, group_id: GroupId) -> Result<Vec<Channel>> {
        let state = self.state.lock().await;
        Ok(state
            .channels
            .values()
            .filter(|c| c.group_id == Some(group_id))
            .cloned()
            .collect())
    }

    async fn create_post(
        &self,
        post: NewPost,
        children: Vec<NewChannelPost>,
    ) -> Result<(MultiChannelPost, Vec<ChannelPost>)> {
        let mut seen = BTreeSet::new();
        for c in &children {
            if !seen.insert(c.channel_id) {
                return Err(Error::Validation(format!(
                    "duplicate channel {} in post",
                    c.channel_id
                )));
            }
        }

        self.mutate(|state| {
            let now = Utc::now();
            let id = PostId(state.alloc());
            let statuses: Vec<ChannelPostStatus> = children.iter().map(|c| c.status).collect();
            let parent = MultiChannelPost {
                id,
                group_id: post.group_id,
                primary_channel_id: post.primary_channel_id,
                primary_text: post.primary_text,
                source_language: post.source_language,
                auto_translate: post.auto_translate,
                options: post.options,
                status: crate::domain::rollup_status(&statuses),
                created_at: now,
                updated_at: now,
            };
            state.posts.insert(id.0, parent.clone());

            let mut rows = Vec::with_capacity(children.len());
            for c in children {
                let row = ChannelPost {
                    id: ChannelPostId(state.alloc()),
                    post_id: id,
                    channel_id: c.channel_id,
                    text: c.text,
                    source: c.source,
                    status: c.status,
                    locked: false,
                    message_id: None,
                    published_at: None,
                    last_error: None,
                    updated_at: now,
                };
                state.channel_posts.insert(row.id.0, row.clone());
                rows.push(row);
            }
            Ok(Change::Changed((parent, rows)))
        })
        .await
    }

    async fn post(&self, id: PostId) -> Result<Option<MultiChannelPost>> {
        Ok(self.state.lock().await.posts.get(&id.0).cloned())
    }

    async fn set_post_status(&self, id: PostId, status: PostStatus) -> Result<()> {
        self.mutate(|state| {
            let post = state.posts.get_mut(&id.0).ok_or_else(|| post_not_found(id))?;
            if post.status == status {
                return Ok(Change::Unchanged(()));
            }
            post.status = status;
            post.updated_at = Utc::now();
            Ok(Change::Changed(()))
        })
        .await
    }

    async fn channel_post(&self, id: ChannelPostId) -> Result<Option<ChannelPost>> {
        Ok(self.state.lock().await.channel_posts.get(&id.0).cloned())
    }

    async fn channel_posts(&self, post_id: PostId) -> Result<Vec<ChannelPost>> {
        let state = self.state.lock().await;
        Ok(state
            .channel_posts
            .values()
            .filter(|p| p.post_id == post_id)
            .cloned()
            .collect())
    }

    async fn channel_posts_in_status(&self, status: ChannelPostStatus) -> Result<Vec<ChannelPost>> {
        let state = self.state.lock().await;
        Ok(state
            .channel_posts
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect())
    }

    async fn published_since(&self, since: DateTime<Utc>) -> Result<Vec<ChannelPost>> {
        let state = self.state.lock().await;
        Ok(state
            .channel_posts
            .values()
            .filter(|p| {
                p.status == ChannelPostStatus::Published
                    && p.message_id.is_some()
                    && p.published_at.is_some_and(|t| t >= since)
            })
            .cloned()
            .collect())
    }

    async fn transition(&self, id: ChannelPostId, t: Transition) -> Result<ChannelPost> {
        self.mutate(|state| {
            let row = state
                .channel_posts
                .get_mut(&id.0)
                .ok_or_else(|| Error::NotFound(format!("channel post {id}")))?;

            if !t.from.contains(&row.status) {
                return Err(Error::Conflict(format!(
                    "channel post {id} is {}, expected one of {:?}",
                    row.status, t.from
                )));
            }
            if t.require_unlocked && row.locked {
                return Err(Error::Conflict(format!(
                    "channel post {id} is locked by a manual edit"
                )));
            }

            let p = t.patch;
            row.status = t.to;
            if let Some(text) = p.text {
                row.text = text;
            }
            if let Some(source) = p.source {
                row.source = source;
            }
            if let Some(locked) = p.locked {
                row.locked = locked;
            }
            if let Some(message_id) = p.message_id {
                row.message_id = message_id;
            }
            if let Some(published_at) = p.published_at {
                row.published_at = published_at;
            }
            if let Some(last_error) = p.last_error {
                row.last_error = last_error;
            }
            row.updated_at = Utc::now();
            Ok(Change::Changed(row.clone()))
        })
        .await
    }

    async fn append_channel_snapshot(&self, s: ChannelStatsSnapshot) -> Result<()> {
        self.mutate(|state| {
            state.channel_snapshots.push(s);
            Ok(Change::Changed(()))
        })
        .await
    }

    async fn latest_channel_snapshot(&self, id: ChannelId) -> Result<Option<ChannelStatsSnapshot>> {
        let state = self.state.lock().await;
        Ok(state
            .channel_snapshots
            .iter()
            .filter(|s| s.channel_id == id)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }

    async fn channel_snapshot_at_or_before(
        &self,
        id: ChannelId,
        at: DateTime<Utc>,
    ) -> Result<Option<ChannelStatsSnapshot>> {
        let state = self.state.lock().await;
        Ok(state
            .channel_snapshots
            .iter()
            .filter(|s| s.channel_id == id && s.captured_at <= at)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }

    async fn append_post_stats(&self, s: PostStats) -> Result<()> {
        self.mutate(|state| {
            state.post_stats.push(s);
            Ok(Change::Changed(()))
        })
        .await
    }

    async fn latest_post_stats(&self, id: ChannelPostId) -> Result<Option<PostStats>> {
        let state = self.state.lock().await;
        Ok(state
            .post_stats
            .iter()
            .filter(|s| s.channel_post_id == id)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }

    async fn prune_stats_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.mutate(|state| {
            let before = state.channel_snapshots.len() + state.post_stats.len();
            state.channel_snapshots.retain(|s| s.captured_at >= cutoff);
            state.post_stats.retain(|s| s.captured_at >= cutoff);
            let removed = before - state.channel_snapshots.len() - state.post_stats.len();
            Ok(if removed > 0 {
                Change::Changed(removed)
            } else {
                Change::Unchanged(0)
            })
        })
        .await
    }

    async fn mark_update_processed(&self, id: UpdateId) -> Result<bool> {
        let window = self.update_window;
        self.mutate(|state| {
            if state.update_floor.is_some_and(|floor| id.0 <= floor)
                || !state.processed_updates.insert(id.0)
            {
                return Ok(Change::Unchanged(false));
            }
            while state.processed_updates.len() > window {
                let Some(oldest) = state.processed_updates.pop_first() else {
                    break;
                };
                state.update_floor = Some(state.update_floor.map_or(oldest, |f| f.max(oldest)));
            }
            Ok(Change::Changed(true))
        })
        .await
    }

    async fn forget_update(&self, id: UpdateId) -> Result<()> {
        self.mutate(|state| {
            Ok(if state.processed_updates.remove(&id.0) {
                Change::Changed(())
            } else {
                Change::Unchanged(())
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Provenance, PublishOptions, TextSource};
    use crate::ports::ChannelPostPatch;

    async fn channel(store: &MemoryStore, chat: i64) -> Channel {
        store
            .upsert_channel(ChannelUpsert {
                chat_id: ChatId(chat),
                create_with_language: Some("en".into()),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap()
            .0
    }

    async fn one_post(store: &MemoryStore) -> ChannelPost {
        let c = channel(store, -100).await;
        let g = store.create_group("g", c.id).await.unwrap();
        let (_, rows) = store
            .create_post(
                NewPost {
                    group_id: g.id,
                    primary_channel_id: c.id,
                    primary_text: "hi".into(),
                    source_language: "en".into(),
                    auto_translate: false,
                    options: PublishOptions::default(),
                },
                vec![NewChannelPost {
                    channel_id: c.id,
                    text: "hi".into(),
                    source: TextSource::Primary,
                    status: ChannelPostStatus::Ready,
                }],
            )
            .await
            .unwrap();
        rows[0].clone()
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_chat_id() {
        let store = MemoryStore::new();
        let a = channel(&store, -100).await;
        let b = channel(&store, -100).await;
        assert_eq!(a.id, b.id);
        assert_eq!(store.active_channels().await.unwrap().len(), 1);
        assert_eq!(a.title, "Channel -100");

        let missing = store
            .upsert_channel(ChannelUpsert {
                chat_id: ChatId(-200),
                is_active: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let row = one_post(&store).await;

        let t = Transition::new(&[ChannelPostStatus::Ready], ChannelPostStatus::Publishing);
        store.transition(row.id, t.clone()).await.unwrap();
        let err = store.transition(row.id, t).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn locked_rows_reject_unlocked_only_transitions() {
        let store = MemoryStore::new();
        let row = one_post(&store).await;
        store
            .transition(
                row.id,
                Transition::new(&[ChannelPostStatus::Ready], ChannelPostStatus::Ready).with_patch(
                    ChannelPostPatch {
                        locked: Some(true),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();

        let err = store
            .transition(
                row.id,
                Transition::new(&[ChannelPostStatus::Ready], ChannelPostStatus::Ready)
                    .unlocked_only(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn primary_cannot_leave_its_group() {
        let store = MemoryStore::new();
        let c = channel(&store, -100).await;
        store.create_group("g", c.id).await.unwrap();
        assert!(matches!(
            store.assign_channel(c.id, None).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn latest_snapshot_is_newest_by_timestamp() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (subs, age) in [(10, 2), (30, 0), (20, 1)] {
            store
                .append_channel_snapshot(ChannelStatsSnapshot {
                    channel_id: ChannelId(1),
                    subscribers: subs,
                    posts_sampled: 0,
                    avg_views: None,
                    er: None,
                    err: None,
                    provenance: Provenance::Degraded,
                    captured_at: now - chrono::Duration::hours(age),
                })
                .await
                .unwrap();
        }
        let latest = store.latest_channel_snapshot(ChannelId(1)).await.unwrap();
        assert_eq!(latest.unwrap().subscribers, 30);

        let removed = store
            .prune_stats_before(now - chrono::Duration::minutes(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn update_ids_are_recorded_once() {
        let store = MemoryStore::new();
        assert!(store.mark_update_processed(UpdateId(7)).await.unwrap());
        assert!(!store.mark_update_processed(UpdateId(7)).await.unwrap());
        store.forget_update(UpdateId(7)).await.unwrap();
        assert!(store.mark_update_processed(UpdateId(7)).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_file_round_trips() {
        let path = std::env::temp_dir().join(format!(
            "chanpub-store-test-{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        {
            let store = MemoryStore::open(&path).await.unwrap();
            channel(&store, -42).await;
        }
        let reopened = MemoryStore::open(&path).await.unwrap();
        assert!(reopened.channel_by_chat(ChatId(-42)).await.unwrap().is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn update_window_evicts_old_ids_but_still_suppresses_them() {
        let store = MemoryStore::new().with_update_window(3);
        for id in 1..=5 {
            assert!(store.mark_update_processed(UpdateId(id)).await.unwrap());
        }
        {
            let state = store.state.lock().await;
            assert_eq!(state.processed_updates.len(), 3);
            assert_eq!(state.update_floor, Some(2));
        }

        assert!(!store.mark_update_processed(UpdateId(5)).await.unwrap());
        assert!(!store.mark_update_processed(UpdateId(1)).await.unwrap());
        assert!(!store.mark_update_processed(UpdateId(2)).await.unwrap());
        assert!(store.mark_update_processed(UpdateId(6)).await.unwrap());
        assert_eq!(store.state.lock().await.processed_updates.len(), 3);
    }

    #[tokio::test]
    async fn failed_write_leaves_state_untouched() {
        let dir = std::env::temp_dir()
            .join(format!("chanpub-store-fail-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let store = MemoryStore::open(dir.join("state.json")).await.unwrap();
        let row = one_post(&store).await;

        std::fs::remove_dir_all(&dir).unwrap();

        let err = store
            .upsert_channel(ChannelUpsert {
                chat_id: ChatId(-300),
                create_with_language: Some("de".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(store.channel_by_chat(ChatId(-300)).await.unwrap().is_none());

        let t = Transition::new(&[ChannelPostStatus::Ready], ChannelPostStatus::Publishing);
        assert!(store.transition(row.id, t).await.is_err());
        let unchanged = store.channel_post(row.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, ChannelPostStatus::Ready);
        assert!(store.mark_update_processed(UpdateId(9)).await.is_err());
        assert!(store.state.lock().await.processed_updates.is_empty());
    }
}
