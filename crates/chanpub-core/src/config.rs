use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, retry::RetryPolicy, throttle::ThrottleConfig, Result};

/// Which adapter talks to Telegram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayMode {
    /// HTTP Bot Gateway service (idempotency keys, rich stats).
    Service,
    /// Direct Bot API through teloxide (degraded stats only).
    Direct,
}

/// Typed configuration loaded from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    // Gateway
    pub gateway_mode: GatewayMode,
    pub gateway_url: String,
    pub gateway_token: Option<String>,
    pub gateway_idempotency: bool,
    pub telegram_bot_token: Option<String>,

    // Translation service
    pub translation_url: String,
    pub translation_token: Option<String>,
    pub translation_context: String,
    pub translation_tone: String,
    pub translation_batch_size: usize,

    // Channels
    pub default_language: String,

    // Stats
    pub use_rich_stats: bool,
    pub stats_capability_ttl: Duration,
    pub stats_recent_posts: u32,
    pub stats_post_window_days: i64,
    pub stats_retention_days: i64,

    // External calls
    pub retry: RetryPolicy,
    pub idempotency_ttl: Duration,
    pub throttle: ThrottleConfig,

    // Workers
    pub worker_count: usize,
    pub worker_queue_size: usize,
    pub updates_poll_interval: Duration,
    pub stats_refresh_interval: Duration,
    pub translation_sweep_interval: Duration,
    pub channel_sync_interval: Duration,

    // Persistence
    pub store_snapshot_path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let gateway_mode = match env_str("GATEWAY_MODE")
            .unwrap_or_else(|| "service".to_string())
            .trim()
            .to_lowercase()
            .as_str()
        {
            "service" => GatewayMode::Service,
            "direct" => GatewayMode::Direct,
            other => {
                return Err(Error::Config(format!(
                    "GATEWAY_MODE must be `service` or `direct`, got `{other}`"
                )))
            }
        };

        let gateway_url = env_str("TELEGRAM_BOT_SERVICE_URL")
            .unwrap_or_else(|| "http://localhost:8001".to_string());
        let gateway_token = env_str("TELEGRAM_BOT_SERVICE_TOKEN").and_then(non_empty);
        let gateway_idempotency = env_bool("TELEGRAM_BOT_ENABLE_IDEMPOTENCY").unwrap_or(true);
        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").and_then(non_empty);

        match gateway_mode {
            GatewayMode::Service if gateway_token.is_none() => {
                return Err(Error::Config(
                    "TELEGRAM_BOT_SERVICE_TOKEN environment variable is required".to_string(),
                ));
            }
            GatewayMode::Direct if telegram_bot_token.is_none() => {
                return Err(Error::Config(
                    "TELEGRAM_BOT_TOKEN environment variable is required in direct mode"
                        .to_string(),
                ));
            }
            _ => {}
        }

        let translation_url = env_str("TRANSLATION_SERVICE_URL")
            .unwrap_or_else(|| "http://localhost:8002".to_string());
        let translation_token = env_str("TRANSLATION_SERVICE_TOKEN").and_then(non_empty);
        let translation_context =
            env_str("TRANSLATION_CONTEXT").unwrap_or_else(|| "news channel".to_string());
        let translation_tone =
            env_str("TRANSLATION_TONE").unwrap_or_else(|| "professional".to_string());
        let translation_batch_size = env_usize("TRANSLATION_BATCH_SIZE").unwrap_or(20).clamp(1, 20);

        let default_language = env_str("DEFAULT_LANGUAGE")
            .and_then(non_empty)
            .unwrap_or_else(|| "en".to_string())
            .to_lowercase();

        // Direct mode has no rich source regardless of the flag.
        let use_rich_stats = gateway_mode == GatewayMode::Service
            && env_bool("TELEGRAM_USE_MTPROTO_STATS").unwrap_or(true);
        let stats_capability_ttl =
            Duration::from_secs(env_u64("STATS_CAPABILITY_TTL_SECS").unwrap_or(30));
        let stats_recent_posts = env_u32("STATS_RECENT_POSTS").unwrap_or(10).max(1);
        let stats_post_window_days = env_i64("STATS_POST_WINDOW_DAYS").unwrap_or(7);
        let stats_retention_days = env_i64("STATS_RETENTION_DAYS").unwrap_or(90);

        let retry = RetryPolicy {
            max_attempts: env_u32("RETRY_MAX_ATTEMPTS").unwrap_or(3).max(1),
            base_delay: Duration::from_millis(env_u64("RETRY_BASE_DELAY_MS").unwrap_or(1_000)),
            max_delay: Duration::from_millis(env_u64("RETRY_MAX_DELAY_MS").unwrap_or(30_000)),
            call_timeout: Duration::from_millis(
                env_u64("EXTERNAL_CALL_TIMEOUT_MS").unwrap_or(10_000),
            ),
        };
        let idempotency_ttl =
            Duration::from_secs(env_u64("IDEMPOTENCY_TTL_SECS").unwrap_or(24 * 60 * 60));
        let throttle = ThrottleConfig {
            global_min_interval: Duration::from_millis(env_u64("THROTTLE_GLOBAL_MS").unwrap_or(40)),
            per_chat_min_interval: Duration::from_millis(
                env_u64("THROTTLE_PER_CHAT_MS").unwrap_or(1_050),
            ),
        };

        let worker_count = env_usize("WORKER_COUNT").unwrap_or(4).max(1);
        let worker_queue_size = env_usize("WORKER_QUEUE_SIZE").unwrap_or(256).max(1);
        let updates_poll_interval =
            Duration::from_secs(env_u64("UPDATES_POLL_INTERVAL_SECS").unwrap_or(30).max(1));
        let stats_refresh_interval =
            Duration::from_secs(env_u64("STATS_REFRESH_INTERVAL_SECS").unwrap_or(900).max(1));
        let translation_sweep_interval =
            Duration::from_secs(env_u64("TRANSLATION_SWEEP_INTERVAL_SECS").unwrap_or(60).max(1));
        let channel_sync_interval =
            Duration::from_secs(env_u64("CHANNEL_SYNC_INTERVAL_SECS").unwrap_or(3_600).max(1));

        let store_snapshot_path = match env_str("STORE_SNAPSHOT_PATH") {
            Some(p) if p.trim().is_empty() => None,
            Some(p) => Some(PathBuf::from(p)),
            None => Some(PathBuf::from("/tmp/chanpub-store.json")),
        };
        if let Some(parent) = store_snapshot_path.as_deref().and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(Self {
            gateway_mode,
            gateway_url,
            gateway_token,
            gateway_idempotency,
            telegram_bot_token,
            translation_url,
            translation_token,
            translation_context,
            translation_tone,
            translation_batch_size,
            default_language,
            use_rich_stats,
            stats_capability_ttl,
            stats_recent_posts,
            stats_post_window_days,
            stats_retention_days,
            retry,
            idempotency_ttl,
            throttle,
            worker_count,
            worker_queue_size,
            updates_poll_interval,
            stats_refresh_interval,
            translation_sweep_interval,
            channel_sync_interval,
            store_snapshot_path,
        })
    }
}

/// Minimal `.env` loader: `KEY=VALUE` lines, `#` comments, optional quotes.
/// Existing environment variables win.
fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_none() {
            env::set_var(key, val);
        }
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut val = val.trim();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = &val[1..val.len() - 1];
        }
        out.push((key.to_string(), val.to_string()));
    }
    out
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
