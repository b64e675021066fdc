//! Job queue and worker pool.
//!
//! Workers hold no state of their own: every job re-reads entity state from
//! the store and coordinates through compare-and-set transitions and the
//! idempotency ledger, so any worker can run any job. Periodic producers feed
//! membership polling, channel sync, stats sweeps, translation sweeps and
//! retention pruning into the same queue.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    discovery::ChannelReconciler,
    domain::{ChannelId, ChannelPostId, PostId},
    errors::Error,
    ports::UpdateSource,
    publication::PublicationEngine,
    stats::StatsEngine,
    translation::TranslationOrchestrator,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Job {
    RequestTranslations(PostId),
    PublishAll(PostId),
    PublishReady(PostId),
    RetryChannelPost(ChannelPostId),
    RefreshChannelStats { channel_id: ChannelId, prefer_rich: bool },
    RefreshPostStats { channel_post_id: ChannelPostId, prefer_rich: bool },
    RefreshAllChannels,
    RefreshRecentPosts,
    PollMembership,
    SyncChannels,
    TranslationSweep,
    PruneStats,
    RecoverInterrupted,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::RequestTranslations(_) => "request_translations",
            Job::PublishAll(_) => "publish_all",
            Job::PublishReady(_) => "publish_ready",
            Job::RetryChannelPost(_) => "retry_channel_post",
            Job::RefreshChannelStats { .. } => "refresh_channel_stats",
            Job::RefreshPostStats { .. } => "refresh_post_stats",
            Job::RefreshAllChannels => "refresh_all_channels",
            Job::RefreshRecentPosts => "refresh_recent_posts",
            Job::PollMembership => "poll_membership",
            Job::SyncChannels => "sync_channels",
            Job::TranslationSweep => "translation_sweep",
            Job::PruneStats => "prune_stats",
            Job::RecoverInterrupted => "recover_interrupted",
        }
    }
}

/// Everything a job may need.
#[derive(Clone)]
pub struct Services {
    pub translation: TranslationOrchestrator,
    pub publication: PublicationEngine,
    pub stats: Arc<StatsEngine>,
    pub reconciler: Arc<ChannelReconciler>,
    /// Pull source for membership events; `None` when only webhooks are used.
    pub updates: Option<Arc<dyn UpdateSource>>,
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub workers: usize,
    pub queue_size: usize,
    pub prefer_rich: bool,
    pub post_window_days: i64,
    pub retention_days: i64,
    /// A zero interval disables that producer.
    pub updates_poll_interval: Duration,
    pub stats_refresh_interval: Duration,
    pub translation_sweep_interval: Duration,
    pub channel_sync_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            workers: cfg.worker_count,
            queue_size: cfg.worker_queue_size,
            prefer_rich: cfg.use_rich_stats,
            post_window_days: cfg.stats_post_window_days,
            retention_days: cfg.stats_retention_days,
            updates_poll_interval: cfg.updates_poll_interval,
            stats_refresh_interval: cfg.stats_refresh_interval,
            translation_sweep_interval: cfg.translation_sweep_interval,
            channel_sync_interval: cfg.channel_sync_interval,
        }
    }
}

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(services: Services, settings: WorkerSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();
        let settings = Arc::new(settings);
        let mut handles = Vec::new();

        for worker in 0..settings.workers.max(1) {
            let rx = rx.clone();
            let cancel = cancel.clone();
            let services = services.clone();
            let settings = settings.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker, rx, services, settings, cancel).await;
            }));
        }

        let mut periodic = vec![
            (
                settings.stats_refresh_interval,
                vec![Job::RefreshAllChannels, Job::RefreshRecentPosts, Job::PruneStats],
            ),
            (settings.translation_sweep_interval, vec![Job::TranslationSweep]),
            (settings.channel_sync_interval, vec![Job::SyncChannels]),
        ];
        if services.updates.is_some() {
            periodic.push((settings.updates_poll_interval, vec![Job::PollMembership]));
        }
        for (every, jobs) in periodic {
            if every.is_zero() {
                continue;
            }
            let tx = tx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                producer_loop(every, jobs, tx, cancel).await;
            }));
        }

        tracing::info!(
            workers = settings.workers.max(1),
            queue = settings.queue_size,
            "worker pool started"
        );
        Self {
            tx,
            cancel,
            handles,
        }
    }

    /// Enqueue without waiting; a full queue is reported as transient.
    pub fn submit(&self, job: Job) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => Error::Transient {
                reason: format!("job queue full, dropped {}", job.name()),
                retry_after: None,
            },
            mpsc::error::TrySendError::Closed(job) => {
                Error::Conflict(format!("worker pool stopped, dropped {}", job.name()))
            }
        })
    }

    /// Stop producers and workers. Jobs already running finish first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.tx);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker task ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    services: Services,
    settings: Arc<WorkerSettings>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(job) = job else { break };

        let name = job.name();
        tracing::debug!(worker, job = name, "job started");
        if let Err(e) = run_job(&services, &settings, job).await {
            tracing::error!(worker, job = name, error = %e, "job failed");
        }
    }
    tracing::debug!(worker, "worker exiting");
}

async fn producer_loop(
    every: Duration,
    jobs: Vec<Job>,
    tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = tick.tick() => {
            for job in &jobs {
                if tx.try_send(job.clone()).is_err() {
                    tracing::warn!(job = job.name(), "queue full, periodic job skipped");
                }
            }
          }
        }
    }
}

async fn run_job(services: &Services, settings: &WorkerSettings, job: Job) -> Result<()> {
    match job {
        Job::RequestTranslations(post_id) => {
            services.translation.request_translations(post_id).await?;
        }
        Job::PublishAll(post_id) => {
            services.publication.publish_all(post_id).await?;
        }
        Job::PublishReady(post_id) => {
            services.publication.publish_ready(post_id).await?;
        }
        Job::RetryChannelPost(id) => {
            services.publication.retry_channel_post(id).await?;
        }
        Job::RefreshChannelStats {
            channel_id,
            prefer_rich,
        } => {
            services.stats.refresh_channel_stats(channel_id, prefer_rich).await?;
        }
        Job::RefreshPostStats {
            channel_post_id,
            prefer_rich,
        } => {
            services.stats.refresh_post_stats(channel_post_id, prefer_rich).await?;
        }
        Job::RefreshAllChannels => {
            services.stats.refresh_all_channel_stats(settings.prefer_rich).await?;
        }
        Job::RefreshRecentPosts => {
            let window = chrono::Duration::days(settings.post_window_days);
            services
                .stats
                .refresh_recent_post_stats(window, settings.prefer_rich)
                .await?;
        }
        Job::PollMembership => {
            if let Some(source) = &services.updates {
                services.reconciler.poll(source.as_ref()).await?;
            }
        }
        Job::SyncChannels => {
            services.reconciler.sync_all_channels().await?;
        }
        Job::TranslationSweep => {
            for post_id in services.translation.posts_awaiting_translation().await? {
                if let Err(e) = services.translation.request_translations(post_id).await {
                    tracing::warn!(post_id = %post_id, error = %e, "translation sweep item failed");
                }
            }
        }
        Job::PruneStats => {
            services.stats.prune_stats_older_than(settings.retention_days).await?;
        }
        Job::RecoverInterrupted => {
            services.publication.recover_interrupted().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        BotPermissions, ChannelPostStatus, ChatId, MessageId, MessageRef, PostStatus, UpdateId,
    };
    use crate::ledger::IdempotencyLedger;
    use crate::ports::{
        BatchTranslation, BatchTranslationRequest, BotMembership, ChannelInfo, ChannelUpsert,
        MembershipAction, MembershipEvent, MessagingGateway, SendRequest, Store, Translation,
        TranslationRequest, Translator,
    };
    use crate::publication::PostDraft;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTranslator;

    #[async_trait]
    impl Translator for EchoTranslator {
        fn max_input_chars(&self) -> usize {
            4096
        }
        fn max_batch_languages(&self) -> usize {
            20
        }
        async fn translate(&self, req: &TranslationRequest) -> Result<Translation> {
            Ok(Translation {
                language: req.target_language.clone(),
                text: format!("[{}] {}", req.target_language, req.text),
                warnings: vec![],
                tokens_used: 1,
            })
        }
        async fn translate_batch(&self, req: &BatchTranslationRequest) -> Result<BatchTranslation> {
            Ok(BatchTranslation {
                translations: req
                    .target_languages
                    .iter()
                    .map(|l| Translation {
                        language: l.clone(),
                        text: format!("[{l}] {}", req.text),
                        warnings: vec![],
                        tokens_used: 1,
                    })
                    .collect(),
                failures: vec![],
                total_tokens_used: req.target_languages.len() as u32,
            })
        }
    }

    #[derive(Default)]
    struct CountingGateway {
        sends: AtomicUsize,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl MessagingGateway for CountingGateway {
        async fn send(&self, req: &SendRequest, _key: Option<&str>) -> Result<MessageRef> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(MessageRef {
                chat_id: req.chat_id,
                message_id: MessageId(n as i32 + 1),
            })
        }
        async fn edit(&self, _m: MessageRef, _h: &str, _k: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _m: MessageRef) -> Result<()> {
            Ok(())
        }
        async fn channel_info(&self, _c: ChatId) -> Result<ChannelInfo> {
            Ok(ChannelInfo::default())
        }
        async fn permissions(&self, _c: ChatId) -> Result<BotMembership> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(BotMembership {
                is_member: true,
                is_admin: true,
                permissions: BotPermissions {
                    can_post: true,
                    can_edit: false,
                    can_delete: false,
                },
            })
        }
    }

    #[derive(Default)]
    struct CountingSource {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl UpdateSource for CountingSource {
        async fn fetch_pending(&self) -> Result<Vec<MembershipEvent>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![MembershipEvent {
                update_id: UpdateId(n as i64),
                action: MembershipAction::BotAdded,
                chat_id: ChatId(-500),
                title: None,
                username: None,
                chat_type: Some("channel".into()),
                is_admin: true,
                permissions: BotPermissions::default(),
            }])
        }
    }

    fn services(store: Arc<MemoryStore>, updates: Option<Arc<dyn UpdateSource>>) -> Services {
        services_with(store, Arc::new(CountingGateway::default()), updates)
    }

    fn services_with(
        store: Arc<MemoryStore>,
        gateway: Arc<CountingGateway>,
        updates: Option<Arc<dyn UpdateSource>>,
    ) -> Services {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        };
        Services {
            translation: TranslationOrchestrator::new(
                store.clone(),
                Arc::new(EchoTranslator),
                retry,
                20,
            ),
            publication: PublicationEngine::new(
                store.clone(),
                gateway.clone(),
                IdempotencyLedger::new(Duration::from_secs(60)),
                retry,
            ),
            stats: Arc::new(StatsEngine::new(
                store.clone(),
                vec![],
                retry,
                Duration::from_secs(30),
                10,
            )),
            reconciler: Arc::new(ChannelReconciler::new(store, gateway, retry, "en")),
            updates,
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            workers: 2,
            queue_size: 16,
            prefer_rich: true,
            post_window_days: 7,
            retention_days: 90,
            updates_poll_interval: Duration::ZERO,
            stats_refresh_interval: Duration::ZERO,
            translation_sweep_interval: Duration::ZERO,
            channel_sync_interval: Duration::ZERO,
        }
    }

    async fn wait_for<F, Fut>(mut done: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if done().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn translate_then_publish_through_the_queue() {
        let store = Arc::new(MemoryStore::new());
        let all = BotPermissions {
            can_post: true,
            can_edit: true,
            can_delete: true,
        };
        let mut ids = Vec::new();
        for (chat, lang) in [(-1, "en"), (-2, "de")] {
            let c = store
                .upsert_channel(ChannelUpsert {
                    chat_id: ChatId(chat),
                    permissions: Some(all),
                    create_with_language: Some(lang.into()),
                    ..Default::default()
                })
                .await
                .unwrap()
                .unwrap()
                .0;
            ids.push(c.id);
        }
        let group = store.create_group("g", ids[0]).await.unwrap();
        store.assign_channel(ids[1], Some(group.id)).await.unwrap();

        let services = services(store.clone(), None);
        let (post, _) = services
            .publication
            .create_post(PostDraft {
                group_id: group.id,
                text: "hello".into(),
                source_language: None,
                auto_translate: true,
                options: Default::default(),
            })
            .await
            .unwrap();
        let pool = WorkerPool::start(services, settings());

        pool.submit(Job::RequestTranslations(post.id)).unwrap();
        wait_for(|| {
            let store = store.clone();
            async move {
                store.post(post.id).await.unwrap().unwrap().status == PostStatus::ReadyForPublish
            }
        })
        .await;

        pool.submit(Job::PublishAll(post.id)).unwrap();
        wait_for(|| {
            let store = store.clone();
            async move { store.post(post.id).await.unwrap().unwrap().status == PostStatus::Published }
        })
        .await;

        let rows = store.channel_posts(post.id).await.unwrap();
        assert!(rows.iter().all(|r| r.status == ChannelPostStatus::Published));
        assert_eq!(rows[1].text, "[de] hello");
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_producer_polls_membership() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(CountingSource::default());
        let mut s = settings();
        s.updates_poll_interval = Duration::from_secs(30);
        let pool = WorkerPool::start(services(store.clone(), Some(source.clone())), s);

        tokio::time::sleep(Duration::from_secs(65)).await;

        assert!(source.polls.load(Ordering::SeqCst) >= 3);
        assert_eq!(store.active_channels().await.unwrap().len(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_workers_stop_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut pool = WorkerPool::start(services(store, None), settings());
        pool.submit(Job::PruneStats).unwrap();

        pool.cancel.cancel();
        for h in std::mem::take(&mut pool.handles) {
            h.await.unwrap();
        }

        assert!(matches!(pool.submit(Job::PruneStats), Err(Error::Conflict(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_channel_sync_checks_permissions() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_channel(ChannelUpsert {
                chat_id: ChatId(-7),
                permissions: Some(BotPermissions {
                    can_post: true,
                    can_edit: true,
                    can_delete: true,
                }),
                create_with_language: Some("en".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let gateway = Arc::new(CountingGateway::default());
        let mut s = settings();
        s.channel_sync_interval = Duration::from_secs(3_600);
        let pool = WorkerPool::start(services_with(store.clone(), gateway.clone(), None), s);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(gateway.lookups.load(Ordering::SeqCst), 1);
        let channel = store.channel_by_chat(ChatId(-7)).await.unwrap().unwrap();
        assert!(channel.bot_is_admin);
        assert!(!channel.permissions.can_edit);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn recover_job_settles_stranded_rows() {
        let store = Arc::new(MemoryStore::new());
        let channel = store
            .upsert_channel(ChannelUpsert {
                chat_id: ChatId(-1),
                create_with_language: Some("en".into()),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap()
            .0;
        let group = store.create_group("g", channel.id).await.unwrap();
        let services = services(store.clone(), None);
        let (post, rows) = services
            .publication
            .create_post(PostDraft {
                group_id: group.id,
                text: "hello".into(),
                source_language: None,
                auto_translate: false,
                options: Default::default(),
            })
            .await
            .unwrap();
        store
            .transition(
                rows[0].id,
                crate::ports::Transition::new(
                    &[ChannelPostStatus::Ready],
                    ChannelPostStatus::Publishing,
                ),
            )
            .await
            .unwrap();
        let pool = WorkerPool::start(services, settings());

        pool.submit(Job::RecoverInterrupted).unwrap();
        wait_for(|| {
            let store = store.clone();
            async move { store.post(post.id).await.unwrap().unwrap().status == PostStatus::Failed }
        })
        .await;

        let row = store.channel_post(rows[0].id).await.unwrap().unwrap();
        assert_eq!(row.status, ChannelPostStatus::Failed);
        pool.shutdown().await;
    }
}
