//! Stats reconciliation: rich source first, degraded fallback, provenance on
//! every record.
//!
//! Providers are tried in order. A provider is only used when its capability
//! probe says so; probe results are cached for a short TTL instead of living
//! in a process-wide flag. Failure of every source is reported as a skipped
//! cycle and leaves the previous snapshot current.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

use crate::{
    domain::{
        ChannelId, ChannelPostId, ChannelPostStatus, ChannelStatsSnapshot, PostStats, Provenance,
    },
    errors::Error,
    ports::{ChannelMetrics, ChannelUpsert, MessageMetrics, StatsProvider, Store},
    retry::RetryPolicy,
    Result,
};

#[derive(Clone, Debug, PartialEq)]
pub enum StatsOutcome {
    Recorded { provenance: Provenance },
    /// No source produced data this cycle.
    Skipped { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelStatsResult {
    pub channel_id: ChannelId,
    pub outcome: StatsOutcome,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PostStatsResult {
    pub channel_post_id: ChannelPostId,
    pub outcome: StatsOutcome,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelGrowth {
    pub channel_id: ChannelId,
    pub current: u64,
    pub previous: u64,
    pub delta: i64,
    /// `None` when the baseline had no subscribers.
    pub percent: Option<f64>,
}

#[derive(Clone, Copy)]
struct CacheEntry<T> {
    data: T,
    at: Instant,
}

pub struct StatsEngine {
    store: Arc<dyn Store>,
    providers: Vec<Arc<dyn StatsProvider>>,
    retry: RetryPolicy,
    capability_ttl: Duration,
    recent_posts: u32,
    capabilities: Mutex<HashMap<usize, CacheEntry<bool>>>,
}

impl StatsEngine {
    /// `providers` is the fallback order, richest first.
    pub fn new(
        store: Arc<dyn Store>,
        providers: Vec<Arc<dyn StatsProvider>>,
        retry: RetryPolicy,
        capability_ttl: Duration,
        recent_posts: u32,
    ) -> Self {
        Self {
            store,
            providers,
            retry,
            capability_ttl,
            recent_posts: recent_posts.max(1),
            capabilities: Mutex::new(HashMap::new()),
        }
    }

    pub async fn refresh_channel_stats(
        &self,
        channel_id: ChannelId,
        prefer_rich: bool,
    ) -> Result<StatsOutcome> {
        let channel = self
            .store
            .channel(channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {channel_id}")))?;

        let mut last_error = None;
        for (idx, provider) in self.candidates(prefer_rich) {
            if !self.is_available(idx, provider.as_ref()).await {
                continue;
            }
            let provenance = provider.provenance();
            let fetched = self
                .retry
                .run("channel_stats", |_| {
                    provider.fetch_channel_stats(channel.chat_id, self.recent_posts)
                })
                .await;
            match fetched {
                Ok(metrics) => {
                    let snapshot = channel_snapshot(channel_id, provenance, &metrics);
                    tracing::info!(
                        channel_id = %channel_id,
                        %provenance,
                        subscribers = snapshot.subscribers,
                        er = ?snapshot.er,
                        err = ?snapshot.err,
                        "channel stats recorded"
                    );
                    self.store.append_channel_snapshot(snapshot).await?;
                    if let Some(title) = metrics.title.filter(|t| *t != channel.title) {
                        self.store
                            .upsert_channel(ChannelUpsert {
                                chat_id: channel.chat_id,
                                title: Some(title),
                                ..Default::default()
                            })
                            .await?;
                    }
                    return Ok(StatsOutcome::Recorded { provenance });
                }
                Err(e) => {
                    tracing::warn!(
                        channel_id = %channel_id,
                        %provenance,
                        error = %e,
                        "stats source failed, falling back"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        let reason = last_error.unwrap_or_else(|| "no statistics source available".to_string());
        tracing::warn!(channel_id = %channel_id, %reason, "channel stats cycle skipped");
        Ok(StatsOutcome::Skipped { reason })
    }

    pub async fn refresh_post_stats(
        &self,
        channel_post_id: ChannelPostId,
        prefer_rich: bool,
    ) -> Result<StatsOutcome> {
        let row = self
            .store
            .channel_post(channel_post_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel post {channel_post_id}")))?;
        let message_id = match (row.status, row.message_id) {
            (ChannelPostStatus::Published, Some(m)) => m,
            _ => {
                return Ok(StatsOutcome::Skipped {
                    reason: format!("channel post is {} without a message", row.status),
                })
            }
        };
        let channel = self
            .store
            .channel(row.channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {}", row.channel_id)))?;
        let subscribers = self
            .store
            .latest_channel_snapshot(channel.id)
            .await?
            .map(|s| s.subscribers);
        let msg = crate::domain::MessageRef {
            chat_id: channel.chat_id,
            message_id,
        };

        let mut last_error = None;
        for (idx, provider) in self.candidates(prefer_rich) {
            if !self.is_available(idx, provider.as_ref()).await {
                continue;
            }
            let provenance = provider.provenance();
            match self
                .retry
                .run("post_stats", |_| provider.fetch_post_stats(msg))
                .await
            {
                Ok(metrics) => {
                    let stats = post_stats(channel_post_id, provenance, metrics, subscribers);
                    tracing::info!(
                        channel_post_id = %channel_post_id,
                        %provenance,
                        views = ?stats.views,
                        er = ?stats.er,
                        "post stats recorded"
                    );
                    self.store.append_post_stats(stats).await?;
                    return Ok(StatsOutcome::Recorded { provenance });
                }
                Err(e) => {
                    tracing::warn!(
                        channel_post_id = %channel_post_id,
                        %provenance,
                        error = %e,
                        "stats source failed, falling back"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        let reason = last_error.unwrap_or_else(|| "no statistics source available".to_string());
        tracing::warn!(channel_post_id = %channel_post_id, %reason, "post stats cycle skipped");
        Ok(StatsOutcome::Skipped { reason })
    }

    /// Sweep every active channel; one channel's failure never stops the rest.
    pub async fn refresh_all_channel_stats(
        &self,
        prefer_rich: bool,
    ) -> Result<Vec<ChannelStatsResult>> {
        let channels = self.store.active_channels().await?;
        let mut results = Vec::with_capacity(channels.len());
        for channel in channels {
            let outcome = self
                .refresh_channel_stats(channel.id, prefer_rich)
                .await
                .unwrap_or_else(|e| StatsOutcome::Skipped {
                    reason: e.to_string(),
                });
            results.push(ChannelStatsResult {
                channel_id: channel.id,
                outcome,
            });
        }
        tracing::info!(channels = results.len(), "channel stats sweep finished");
        Ok(results)
    }

    /// Sweep posts published within `window`.
    pub async fn refresh_recent_post_stats(
        &self,
        window: chrono::Duration,
        prefer_rich: bool,
    ) -> Result<Vec<PostStatsResult>> {
        let rows = self.store.published_since(Utc::now() - window).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let outcome = self
                .refresh_post_stats(row.id, prefer_rich)
                .await
                .unwrap_or_else(|e| StatsOutcome::Skipped {
                    reason: e.to_string(),
                });
            results.push(PostStatsResult {
                channel_post_id: row.id,
                outcome,
            });
        }
        tracing::info!(posts = results.len(), "post stats sweep finished");
        Ok(results)
    }

    /// Subscriber change between the current snapshot and the newest one at
    /// least `days` old.
    pub async fn channel_growth(
        &self,
        channel_id: ChannelId,
        days: i64,
    ) -> Result<Option<ChannelGrowth>> {
        let Some(current) = self.store.latest_channel_snapshot(channel_id).await? else {
            return Ok(None);
        };
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let Some(previous) = self
            .store
            .channel_snapshot_at_or_before(channel_id, cutoff)
            .await?
        else {
            return Ok(None);
        };
        let delta = current.subscribers as i64 - previous.subscribers as i64;
        let percent = (previous.subscribers > 0)
            .then(|| round2(delta as f64 / previous.subscribers as f64 * 100.0));
        Ok(Some(ChannelGrowth {
            channel_id,
            current: current.subscribers,
            previous: previous.subscribers,
            delta,
            percent,
        }))
    }

    pub async fn prune_stats_older_than(&self, days: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let removed = self.store.prune_stats_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, days, "pruned old statistics");
        }
        Ok(removed)
    }

    fn candidates(
        &self,
        prefer_rich: bool,
    ) -> impl Iterator<Item = (usize, &Arc<dyn StatsProvider>)> {
        self.providers
            .iter()
            .enumerate()
            .filter(move |(_, p)| prefer_rich || p.provenance() != Provenance::Rich)
    }

    async fn is_available(&self, idx: usize, provider: &dyn StatsProvider) -> bool {
        let now = Instant::now();
        if let Some(hit) = self
            .capabilities
            .lock()
            .await
            .get(&idx)
            .filter(|e| now.duration_since(e.at) < self.capability_ttl)
        {
            return hit.data;
        }

        let available = match timeout(self.retry.call_timeout, provider.probe()).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                tracing::debug!(
                    provenance = %provider.provenance(),
                    error = %e,
                    "capability probe failed"
                );
                false
            }
            Err(_) => {
                tracing::debug!(provenance = %provider.provenance(), "capability probe timed out");
                false
            }
        };
        self.capabilities.lock().await.insert(
            idx,
            CacheEntry {
                data: available,
                at: Instant::now(),
            },
        );
        available
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Percentage of `per_post` against the subscriber base, if computable.
fn rate(per_post: f64, subscribers: u64) -> Option<f64> {
    (subscribers > 0).then(|| round2(per_post / subscribers as f64 * 100.0))
}

fn channel_snapshot(
    channel_id: ChannelId,
    provenance: Provenance,
    m: &ChannelMetrics,
) -> ChannelStatsSnapshot {
    let recent = match provenance {
        Provenance::Rich => m.recent.filter(|r| r.posts > 0),
        Provenance::Degraded => None,
    };
    let (posts_sampled, avg_views, er, err) = match recent {
        Some(r) => {
            let posts = f64::from(r.posts);
            let avg_views = r.views as f64 / posts;
            let avg_interactions = (r.reactions + r.replies + r.forwards) as f64 / posts;
            (
                r.posts,
                Some(round2(avg_views)),
                rate(avg_views, m.subscribers),
                rate(avg_interactions, m.subscribers),
            )
        }
        None => (0, None, None, None),
    };
    ChannelStatsSnapshot {
        channel_id,
        subscribers: m.subscribers,
        posts_sampled,
        avg_views,
        er,
        err,
        provenance,
        captured_at: Utc::now(),
    }
}

fn post_stats(
    channel_post_id: ChannelPostId,
    provenance: Provenance,
    m: MessageMetrics,
    subscribers: Option<u64>,
) -> PostStats {
    let (er, err) = match (provenance, subscribers) {
        (Provenance::Rich, Some(subs)) => {
            let er = m.views.and_then(|v| rate(v as f64, subs));
            // Channels without comments report no replies; that is zero, not unknown.
            let err = m.reactions_total.and_then(|r| {
                let engagement = r + m.replies.unwrap_or(0) + m.forwards.unwrap_or(0);
                rate(engagement as f64, subs)
            });
            (er, err)
        }
        _ => (None, None),
    };
    PostStats {
        channel_post_id,
        views: m.views,
        forwards: m.forwards,
        comments: m.replies,
        reactions_total: m.reactions_total,
        reactions: m.reactions,
        er,
        err,
        provenance,
        captured_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId, MessageRef, Reaction};
    use crate::ports::{ChannelUpsert, RecentPostTotals, Transition, ChannelPostPatch};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        provenance: Provenance,
        capable: bool,
        failing: bool,
        subscribers: u64,
        probes: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl FakeProvider {
        fn new(provenance: Provenance, subscribers: u64) -> Self {
            Self {
                provenance,
                capable: true,
                failing: false,
                subscribers,
                probes: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
            }
        }

        fn failing(mut self) -> Self {
            self.failing = true;
            self
        }

        fn incapable(mut self) -> Self {
            self.capable = false;
            self
        }
    }

    #[async_trait]
    impl StatsProvider for FakeProvider {
        fn provenance(&self) -> Provenance {
            self.provenance
        }

        async fn probe(&self) -> Result<bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.capable)
        }

        async fn fetch_channel_stats(&self, _chat_id: ChatId, recent_posts: u32) -> Result<ChannelMetrics> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                return Err(Error::Permission("provider unavailable".into()));
            }
            Ok(ChannelMetrics {
                subscribers: self.subscribers,
                title: Some("Daily News".into()),
                recent: Some(RecentPostTotals {
                    posts: recent_posts,
                    views: 5000,
                    forwards: 50,
                    reactions: 100,
                    replies: 50,
                }),
            })
        }

        async fn fetch_post_stats(&self, _msg: MessageRef) -> Result<MessageMetrics> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                return Err(Error::Permission("provider unavailable".into()));
            }
            Ok(MessageMetrics {
                views: Some(400),
                forwards: Some(5),
                replies: Some(3),
                reactions_total: Some(12),
                reactions: vec![Reaction {
                    emoji: "🔥".into(),
                    count: 12,
                }],
            })
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn engine(store: Arc<MemoryStore>, providers: Vec<Arc<FakeProvider>>) -> StatsEngine {
        StatsEngine::new(
            store,
            providers
                .into_iter()
                .map(|p| p as Arc<dyn StatsProvider>)
                .collect(),
            retry(),
            Duration::from_secs(30),
            10,
        )
    }

    async fn channel(store: &MemoryStore) -> ChannelId {
        store
            .upsert_channel(ChannelUpsert {
                chat_id: ChatId(-100),
                create_with_language: Some("en".into()),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap()
            .0
            .id
    }

    #[tokio::test]
    async fn rich_source_computes_engagement() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let rich = Arc::new(FakeProvider::new(Provenance::Rich, 1000));
        let eng = engine(store.clone(), vec![rich]);

        let outcome = eng.refresh_channel_stats(id, true).await.unwrap();

        assert_eq!(outcome, StatsOutcome::Recorded { provenance: Provenance::Rich });
        let snap = store.latest_channel_snapshot(id).await.unwrap().unwrap();
        assert_eq!(snap.posts_sampled, 10);
        assert_eq!(snap.avg_views, Some(500.0));
        assert_eq!(snap.er, Some(50.0));
        assert_eq!(snap.err, Some(2.0));
        assert_eq!(store.channel(id).await.unwrap().unwrap().title, "Daily News");
    }

    #[tokio::test]
    async fn failing_rich_source_falls_back_to_degraded() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let rich = Arc::new(FakeProvider::new(Provenance::Rich, 1000).failing());
        let degraded = Arc::new(FakeProvider::new(Provenance::Degraded, 990));
        let eng = engine(store.clone(), vec![rich, degraded]);

        let outcome = eng.refresh_channel_stats(id, true).await.unwrap();

        assert_eq!(outcome, StatsOutcome::Recorded { provenance: Provenance::Degraded });
        let snap = store.latest_channel_snapshot(id).await.unwrap().unwrap();
        assert_eq!(snap.provenance, Provenance::Degraded);
        assert_eq!(snap.subscribers, 990);
        assert_eq!(snap.er, None);
        assert_eq!(snap.err, None);
        assert_eq!(snap.avg_views, None);
    }

    #[tokio::test]
    async fn both_sources_failing_is_a_skipped_cycle() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let good = engine(
            store.clone(),
            vec![Arc::new(FakeProvider::new(Provenance::Degraded, 10))],
        );
        good.refresh_channel_stats(id, true).await.unwrap();

        let eng = engine(
            store.clone(),
            vec![
                Arc::new(FakeProvider::new(Provenance::Rich, 1).failing()),
                Arc::new(FakeProvider::new(Provenance::Degraded, 2).failing()),
            ],
        );
        let outcome = eng.refresh_channel_stats(id, true).await.unwrap();

        assert!(matches!(outcome, StatsOutcome::Skipped { .. }));
        let snap = store.latest_channel_snapshot(id).await.unwrap().unwrap();
        assert_eq!(snap.subscribers, 10);
    }

    #[tokio::test]
    async fn prefer_rich_false_skips_the_rich_source() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let rich = Arc::new(FakeProvider::new(Provenance::Rich, 1000));
        let degraded = Arc::new(FakeProvider::new(Provenance::Degraded, 1000));
        let eng = engine(store.clone(), vec![rich.clone(), degraded]);

        let outcome = eng.refresh_channel_stats(id, false).await.unwrap();

        assert_eq!(outcome, StatsOutcome::Recorded { provenance: Provenance::Degraded });
        assert_eq!(rich.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(rich.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capability_probe_is_cached_for_its_ttl() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let rich = Arc::new(FakeProvider::new(Provenance::Rich, 1000).incapable());
        let degraded = Arc::new(FakeProvider::new(Provenance::Degraded, 1000));
        let eng = engine(store.clone(), vec![rich.clone(), degraded]);

        eng.refresh_channel_stats(id, true).await.unwrap();
        eng.refresh_channel_stats(id, true).await.unwrap();
        assert_eq!(rich.probes.load(Ordering::SeqCst), 1);
        assert_eq!(rich.fetches.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        eng.refresh_channel_stats(id, true).await.unwrap();
        assert_eq!(rich.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_subscribers_leave_rates_uncomputed() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let eng = engine(
            store.clone(),
            vec![Arc::new(FakeProvider::new(Provenance::Rich, 0))],
        );

        eng.refresh_channel_stats(id, true).await.unwrap();

        let snap = store.latest_channel_snapshot(id).await.unwrap().unwrap();
        assert_eq!(snap.avg_views, Some(500.0));
        assert_eq!(snap.er, None);
    }

    async fn published_row(store: &MemoryStore, channel_id: ChannelId) -> ChannelPostId {
        let group = store.create_group("g", channel_id).await.unwrap();
        let (_, rows) = store
            .create_post(
                crate::ports::NewPost {
                    group_id: group.id,
                    primary_channel_id: channel_id,
                    primary_text: "hi".into(),
                    source_language: "en".into(),
                    auto_translate: false,
                    options: Default::default(),
                },
                vec![crate::ports::NewChannelPost {
                    channel_id,
                    text: "hi".into(),
                    source: crate::domain::TextSource::Primary,
                    status: ChannelPostStatus::Publishing,
                }],
            )
            .await
            .unwrap();
        store
            .transition(
                rows[0].id,
                Transition::new(&[ChannelPostStatus::Publishing], ChannelPostStatus::Published)
                    .with_patch(ChannelPostPatch {
                        message_id: Some(Some(MessageId(7))),
                        published_at: Some(Some(Utc::now())),
                        ..Default::default()
                    }),
            )
            .await
            .unwrap();
        rows[0].id
    }

    #[tokio::test]
    async fn post_stats_use_latest_subscriber_count() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let row = published_row(&store, id).await;
        let rich = Arc::new(FakeProvider::new(Provenance::Rich, 2000));
        let eng = engine(store.clone(), vec![rich]);
        eng.refresh_channel_stats(id, true).await.unwrap();

        let results = eng
            .refresh_recent_post_stats(chrono::Duration::days(7), true)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        let stats = store.latest_post_stats(row).await.unwrap().unwrap();
        assert_eq!(stats.views, Some(400));
        assert_eq!(stats.er, Some(20.0));
        assert_eq!(stats.err, Some(1.0));
        assert_eq!(stats.reactions.len(), 1);
    }

    #[tokio::test]
    async fn degraded_post_stats_have_no_rates() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let row = published_row(&store, id).await;
        let eng = engine(
            store.clone(),
            vec![Arc::new(FakeProvider::new(Provenance::Degraded, 2000))],
        );
        eng.refresh_channel_stats(id, true).await.unwrap();

        let outcome = eng.refresh_post_stats(row, true).await.unwrap();

        assert_eq!(outcome, StatsOutcome::Recorded { provenance: Provenance::Degraded });
        let stats = store.latest_post_stats(row).await.unwrap().unwrap();
        assert_eq!(stats.er, None);
        assert_eq!(stats.err, None);
    }

    #[tokio::test]
    async fn growth_compares_against_older_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let id = channel(&store).await;
        let snap = |subs: u64, days_ago: i64| ChannelStatsSnapshot {
            channel_id: id,
            subscribers: subs,
            posts_sampled: 0,
            avg_views: None,
            er: None,
            err: None,
            provenance: Provenance::Degraded,
            captured_at: Utc::now() - chrono::Duration::days(days_ago),
        };
        store.append_channel_snapshot(snap(800, 10)).await.unwrap();
        store.append_channel_snapshot(snap(900, 3)).await.unwrap();
        store.append_channel_snapshot(snap(1000, 0)).await.unwrap();
        let eng = engine(store.clone(), vec![]);

        let growth = eng.channel_growth(id, 7).await.unwrap().unwrap();
        assert_eq!(growth.previous, 800);
        assert_eq!(growth.delta, 200);
        assert_eq!(growth.percent, Some(25.0));
        assert!(eng.channel_growth(id, 30).await.unwrap().is_none());

        assert_eq!(eng.prune_stats_older_than(5).await.unwrap(), 1);
    }
}
