//! Statistics providers backed by the gateway.
//!
//! `RichStats` reads the detailed (MTProto-backed) endpoints and is only
//! usable while the gateway reports that backend enabled and connected.
//! `DegradedStats` uses the plain Bot API endpoints: member count for
//! channels, and whatever little the Bot API exposes for messages.

use async_trait::async_trait;
use serde::Deserialize;

use chanpub_core::{
    domain::{ChatId, MessageRef, Provenance, Reaction},
    ports::{ChannelMetrics, MessageMetrics, RecentPostTotals, StatsProvider},
    Result,
};

use crate::GatewayClient;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusResponse {
    enabled: bool,
    connected: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DetailedChannel {
    participants_count: u64,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailedChannelResponse {
    #[serde(default)]
    channel: DetailedChannel,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Totals {
    views: u64,
    forwards: u64,
    reactions: u64,
    replies: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecentPostsResponse {
    count: u32,
    totals: Totals,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReactionCount {
    emoji: String,
    count: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DetailedReactions {
    total_count: u64,
    reactions: Vec<ReactionCount>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DetailedMessageResponse {
    views: Option<u64>,
    forwards: Option<u64>,
    replies: Option<u64>,
    reactions: Option<DetailedReactions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChannelStatsResponse {
    member_count: u64,
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessageStatsResponse {
    views: Option<u64>,
    forwards: Option<u64>,
    reply_count: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct RichStats {
    client: GatewayClient,
}

impl RichStats {
    pub fn new(client: GatewayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatsProvider for RichStats {
    fn provenance(&self) -> Provenance {
        Provenance::Rich
    }

    async fn probe(&self) -> Result<bool> {
        let s: StatusResponse = self.client.get("/stats/status", &[]).await?;
        Ok(s.enabled && s.connected)
    }

    async fn fetch_channel_stats(
        &self,
        chat_id: ChatId,
        recent_posts: u32,
    ) -> Result<ChannelMetrics> {
        let detailed: DetailedChannelResponse = self
            .client
            .get(&format!("/stats/channel/{}", chat_id.0), &[])
            .await?;
        let recent: RecentPostsResponse = self
            .client
            .get(
                &format!("/stats/posts/{}/recent", chat_id.0),
                &[("limit", recent_posts.to_string())],
            )
            .await?;
        Ok(rich_channel_metrics(detailed, recent))
    }

    async fn fetch_post_stats(&self, msg: MessageRef) -> Result<MessageMetrics> {
        let r: DetailedMessageResponse = self
            .client
            .get(
                &format!("/stats/message/{}/{}", msg.chat_id.0, msg.message_id.0),
                &[],
            )
            .await?;
        Ok(rich_message_metrics(r))
    }
}

fn rich_channel_metrics(d: DetailedChannelResponse, r: RecentPostsResponse) -> ChannelMetrics {
    ChannelMetrics {
        subscribers: d.channel.participants_count,
        title: d.channel.title,
        recent: Some(RecentPostTotals {
            posts: r.count,
            views: r.totals.views,
            forwards: r.totals.forwards,
            reactions: r.totals.reactions,
            replies: r.totals.replies,
        }),
    }
}

/// A missing reactions block means the count is unknown, not zero.
fn rich_message_metrics(r: DetailedMessageResponse) -> MessageMetrics {
    let reactions_total = r.reactions.as_ref().map(|x| x.total_count);
    MessageMetrics {
        views: r.views,
        forwards: r.forwards,
        replies: r.replies,
        reactions_total,
        reactions: r
            .reactions
            .map(|x| x.reactions)
            .unwrap_or_default()
            .into_iter()
            .filter(|x| !x.emoji.is_empty())
            .map(|x| Reaction {
                emoji: x.emoji,
                count: x.count,
            })
            .collect(),
    }
}

#[derive(Clone, Debug)]
pub struct DegradedStats {
    client: GatewayClient,
}

impl DegradedStats {
    pub fn new(client: GatewayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatsProvider for DegradedStats {
    fn provenance(&self) -> Provenance {
        Provenance::Degraded
    }

    async fn probe(&self) -> Result<bool> {
        Ok(true)
    }

    async fn fetch_channel_stats(
        &self,
        chat_id: ChatId,
        _recent_posts: u32,
    ) -> Result<ChannelMetrics> {
        let r: ChannelStatsResponse = self
            .client
            .get("/channels/stats", &[("chat_id", chat_id.0.to_string())])
            .await?;
        Ok(ChannelMetrics {
            subscribers: r.member_count,
            title: r.title,
            recent: None,
        })
    }

    async fn fetch_post_stats(&self, msg: MessageRef) -> Result<MessageMetrics> {
        let r: MessageStatsResponse = self
            .client
            .get(
                "/messages/stats",
                &[
                    ("chat_id", msg.chat_id.0.to_string()),
                    ("message_id", msg.message_id.0.to_string()),
                ],
            )
            .await?;
        Ok(MessageMetrics {
            views: r.views,
            forwards: r.forwards,
            replies: r.reply_count,
            reactions_total: None,
            reactions: Vec::new(),
        })
    }
}
