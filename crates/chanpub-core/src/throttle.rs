use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    ports::{BotMembership, ChannelInfo, MessagingGateway, SendRequest},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two gateway calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls touching the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return how long to wait for it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = self.next.max(now);
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Gateway decorator that spaces outbound calls globally and per chat.
///
/// Reduces upstream 429s during fan-out publishing; the retry executor still
/// handles the ones that get through.
pub struct ThrottledGateway {
    inner: Arc<dyn MessagingGateway>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<ChatId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledGateway {
    pub fn new(inner: Arc<dyn MessagingGateway>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: ChatId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle(&self, chat_id: ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingGateway for ThrottledGateway {
    async fn send(&self, req: &SendRequest, idempotency_key: Option<&str>) -> Result<MessageRef> {
        self.throttle(req.chat_id).await;
        self.inner.send(req, idempotency_key).await
    }

    async fn edit(
        &self,
        msg: MessageRef,
        html: &str,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        self.throttle(msg.chat_id).await;
        self.inner.edit(msg, html, idempotency_key).await
    }

    async fn delete(&self, msg: MessageRef) -> Result<()> {
        self.throttle(msg.chat_id).await;
        self.inner.delete(msg).await
    }

    async fn channel_info(&self, chat_id: ChatId) -> Result<ChannelInfo> {
        self.throttle(chat_id).await;
        self.inner.channel_info(chat_id).await
    }

    async fn permissions(&self, chat_id: ChatId) -> Result<BotMembership> {
        self.throttle(chat_id).await;
        self.inner.permissions(chat_id).await
    }
}
