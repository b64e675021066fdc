use std::sync::Arc;

use anyhow::Context;
use teloxide::Bot;

use chanpub_core::{
    config::{Config, GatewayMode},
    discovery::ChannelReconciler,
    ledger::IdempotencyLedger,
    ports::{MessagingGateway, StatsProvider, Store, UpdateSource},
    publication::PublicationEngine,
    stats::StatsEngine,
    store::MemoryStore,
    throttle::ThrottledGateway,
    translation::TranslationOrchestrator,
    worker::{Services, WorkerPool, WorkerSettings},
};
use chanpub_gateway::{DegradedStats, GatewayClient, GatewayUpdates, RichStats};
use chanpub_telegram::{DirectStats, TelegramGateway, TelegramUpdateSource};
use chanpub_translate::TranslationClient;

type Adapters = (
    Arc<dyn MessagingGateway>,
    Vec<Arc<dyn StatsProvider>>,
    Arc<dyn UpdateSource>,
);

fn build_adapters(cfg: &Config) -> anyhow::Result<Adapters> {
    match cfg.gateway_mode {
        GatewayMode::Service => {
            let client = GatewayClient::new(
                cfg.gateway_url.clone(),
                cfg.gateway_token.clone().unwrap_or_default(),
                cfg.gateway_idempotency,
                cfg.retry.call_timeout,
            )
            .context("building gateway client")?;
            let mut providers: Vec<Arc<dyn StatsProvider>> = Vec::new();
            if cfg.use_rich_stats {
                providers.push(Arc::new(RichStats::new(client.clone())));
            }
            providers.push(Arc::new(DegradedStats::new(client.clone())));
            let updates: Arc<dyn UpdateSource> =
                Arc::new(GatewayUpdates::new(client.clone()));
            let gateway: Arc<dyn MessagingGateway> = Arc::new(client);
            Ok((gateway, providers, updates))
        }
        GatewayMode::Direct => {
            let bot = Bot::new(cfg.telegram_bot_token.clone().unwrap_or_default());
            let gateway: Arc<dyn MessagingGateway> =
                Arc::new(TelegramGateway::new(bot.clone()));
            let providers: Vec<Arc<dyn StatsProvider>> =
                vec![Arc::new(DirectStats::new(bot.clone()))];
            let updates: Arc<dyn UpdateSource> = Arc::new(TelegramUpdateSource::new(bot));
            Ok((gateway, providers, updates))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chanpub_core::logging::init("chanpub")?;

    let cfg = Config::load().context("loading configuration")?;
    tracing::info!(
        mode = ?cfg.gateway_mode,
        rich_stats = cfg.use_rich_stats,
        workers = cfg.worker_count,
        "chanpub starting"
    );

    let store = match &cfg.store_snapshot_path {
        Some(path) => MemoryStore::open(path)
            .await
            .with_context(|| format!("opening store at {}", path.display()))?,
        None => MemoryStore::new(),
    };
    let store: Arc<dyn Store> = Arc::new(store);

    let (gateway, providers, updates) = build_adapters(&cfg)?;
    let gateway: Arc<dyn MessagingGateway> =
        Arc::new(ThrottledGateway::new(gateway, cfg.throttle));

    let translator = Arc::new(
        TranslationClient::new(
            cfg.translation_url.clone(),
            cfg.translation_token.clone(),
            cfg.translation_tone.clone(),
            cfg.translation_context.clone(),
            cfg.retry.call_timeout,
        )
        .context("building translation client")?,
    );

    let services = Services {
        translation: TranslationOrchestrator::new(
            store.clone(),
            translator,
            cfg.retry,
            cfg.translation_batch_size,
        ),
        publication: PublicationEngine::new(
            store.clone(),
            gateway.clone(),
            IdempotencyLedger::new(cfg.idempotency_ttl),
            cfg.retry,
        ),
        stats: Arc::new(StatsEngine::new(
            store.clone(),
            providers,
            cfg.retry,
            cfg.stats_capability_ttl,
            cfg.stats_recent_posts,
        )),
        reconciler: Arc::new(ChannelReconciler::new(
            store.clone(),
            gateway,
            cfg.retry,
            cfg.default_language.clone(),
        )),
        updates: Some(updates),
    };

    let recovered = services
        .publication
        .recover_interrupted()
        .await
        .context("recovering interrupted publishes")?;
    if !recovered.is_empty() {
        tracing::warn!(rows = recovered.len(), "interrupted publishes recovered");
    }

    let pool = WorkerPool::start(services, WorkerSettings::from_config(&cfg));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    pool.shutdown().await;
    tracing::info!("chanpub stopped");
    Ok(())
}
