//! Telegram adapter (teloxide).
//!
//! Direct Bot API mode: implements the `chanpub-core` messaging port, a
//! membership update source over `getUpdates`, and a degraded statistics
//! provider. The Bot API exposes no view counts, so only subscriber counts
//! are available here.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{AllowedUpdate, ChatMemberKind, ParseMode, UpdateKind},
    ApiError, RequestError,
};
use tokio::sync::Mutex;

use chanpub_core::{
    domain::{BotPermissions, ChatId, MessageId, MessageRef, Provenance, UpdateId},
    errors::Error,
    ports::{
        BotMembership, ChannelInfo, ChannelMetrics, MembershipAction, MembershipEvent,
        MessageMetrics, MessagingGateway, SendRequest, StatsProvider, UpdateSource,
    },
    Result,
};

fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
    teloxide::types::MessageId(message_id.0)
}

/// Map a teloxide failure onto the core taxonomy. No retries here; the
/// engines own the retry policy.
pub fn map_request_error(e: RequestError) -> Error {
    match e {
        RequestError::RetryAfter(d) => Error::Transient {
            reason: format!("telegram flood control: retry after {}s", d.as_secs()),
            retry_after: Some(d),
        },
        RequestError::Network(e) => Error::transient(format!("telegram network error: {e}")),
        RequestError::Io(e) => Error::transient(format!("telegram i/o error: {e}")),
        RequestError::Api(api) => map_api_error(api),
        other => Error::External(format!("telegram error: {other}")),
    }
}

fn map_api_error(api: ApiError) -> Error {
    match api {
        ApiError::BotKicked
        | ApiError::BotKickedFromSupergroup
        | ApiError::BotBlocked
        | ApiError::NotEnoughRightsToPostMessages
        | ApiError::ChatNotFound => Error::Permission(format!("telegram: {api}")),
        ApiError::NotFound => Error::Config(format!("telegram: {api}")),
        other => Error::Validation(format!("telegram: {other}")),
    }
}

fn chat_type(chat: &teloxide::types::Chat) -> &'static str {
    if chat.is_channel() {
        "channel"
    } else if chat.is_supergroup() {
        "supergroup"
    } else if chat.is_group() {
        "group"
    } else {
        "private"
    }
}

/// Bot's standing in a chat, reduced to what reconciliation needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MemberStatus {
    Absent,
    Member,
    Admin(BotPermissions),
}

impl MemberStatus {
    fn from_kind(kind: &ChatMemberKind) -> Self {
        match kind {
            ChatMemberKind::Owner(_) => MemberStatus::Admin(BotPermissions {
                can_post: true,
                can_edit: true,
                can_delete: true,
            }),
            ChatMemberKind::Administrator(a) => MemberStatus::Admin(BotPermissions {
                can_post: a.can_post_messages,
                can_edit: a.can_edit_messages,
                can_delete: a.can_delete_messages,
            }),
            ChatMemberKind::Member | ChatMemberKind::Restricted(_) => MemberStatus::Member,
            ChatMemberKind::Left | ChatMemberKind::Banned(_) => MemberStatus::Absent,
        }
    }
}

/// Decide which membership event (if any) a status change represents.
fn classify(
    old: MemberStatus,
    new: MemberStatus,
) -> Option<(MembershipAction, bool, BotPermissions)> {
    match (old, new) {
        (MemberStatus::Absent, MemberStatus::Absent) => None,
        (_, MemberStatus::Absent) => Some((
            MembershipAction::BotRemoved,
            false,
            BotPermissions::none(),
        )),
        (MemberStatus::Admin(_), MemberStatus::Admin(p)) => {
            Some((MembershipAction::BotPermissionsChanged, true, p))
        }
        (_, MemberStatus::Admin(p)) => Some((MembershipAction::BotAdded, true, p)),
        (MemberStatus::Admin(_), MemberStatus::Member) => Some((
            MembershipAction::BotPermissionsChanged,
            false,
            BotPermissions::none(),
        )),
        // Plain membership in a channel grants nothing to track.
        (_, MemberStatus::Member) => None,
    }
}

#[derive(Clone)]
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn send(&self, req: &SendRequest, _idempotency_key: Option<&str>) -> Result<MessageRef> {
        let msg = self
            .bot
            .send_message(tg_chat(req.chat_id), req.html.clone())
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(req.disable_web_page_preview)
            .disable_notification(req.disable_notification)
            .await
            .map_err(map_request_error)?;
        Ok(MessageRef {
            chat_id: req.chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn edit(&self, msg: MessageRef, html: &str, _idempotency_key: Option<&str>) -> Result<()> {
        let res = self
            .bot
            .edit_message_text(
                tg_chat(msg.chat_id),
                tg_msg_id(msg.message_id),
                html.to_string(),
            )
            .parse_mode(ParseMode::Html)
            .await;
        match res {
            Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(e) => Err(map_request_error(e)),
        }
    }

    async fn delete(&self, msg: MessageRef) -> Result<()> {
        self.bot
            .delete_message(tg_chat(msg.chat_id), tg_msg_id(msg.message_id))
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    async fn channel_info(&self, chat_id: ChatId) -> Result<ChannelInfo> {
        let chat = self
            .bot
            .get_chat(tg_chat(chat_id))
            .await
            .map_err(map_request_error)?;
        let member_count = match self.bot.get_chat_member_count(tg_chat(chat_id)).await {
            Ok(n) => Some(u64::from(n)),
            Err(e) => {
                tracing::debug!(chat_id = %chat_id, error = %e, "member count unavailable");
                None
            }
        };
        Ok(ChannelInfo {
            title: chat.title().map(str::to_string),
            username: chat.username().map(str::to_string),
            chat_type: Some(chat_type(&chat).to_string()),
            member_count,
        })
    }

    async fn permissions(&self, chat_id: ChatId) -> Result<BotMembership> {
        let me = self.bot.get_me().await.map_err(map_request_error)?;
        let member = self
            .bot
            .get_chat_member(tg_chat(chat_id), me.id)
            .await
            .map_err(map_request_error)?;
        Ok(match MemberStatus::from_kind(&member.kind) {
            MemberStatus::Absent => BotMembership::default(),
            MemberStatus::Member => BotMembership {
                is_member: true,
                ..Default::default()
            },
            MemberStatus::Admin(permissions) => BotMembership {
                is_member: true,
                is_admin: true,
                permissions,
            },
        })
    }
}

/// Long-poll style membership feed. Only `my_chat_member` updates in
/// channels are requested and surfaced.
pub struct TelegramUpdateSource {
    bot: Bot,
    offset: Mutex<Option<i32>>,
}

impl TelegramUpdateSource {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            offset: Mutex::new(None),
        }
    }
}

#[async_trait]
impl UpdateSource for TelegramUpdateSource {
    async fn fetch_pending(&self) -> Result<Vec<MembershipEvent>> {
        // Held across the call so overlapping polls never reuse an offset.
        let mut offset = self.offset.lock().await;
        let mut req = self
            .bot
            .get_updates()
            .timeout(0)
            .allowed_updates(vec![AllowedUpdate::MyChatMember]);
        if let Some(o) = *offset {
            req = req.offset(o);
        }
        let updates = req.await.map_err(map_request_error)?;

        let mut events = Vec::new();
        for update in updates {
            *offset = Some(update.id + 1);
            let UpdateKind::MyChatMember(change) = update.kind else {
                continue;
            };
            if !change.chat.is_channel() {
                continue;
            }
            let old = MemberStatus::from_kind(&change.old_chat_member.kind);
            let new = MemberStatus::from_kind(&change.new_chat_member.kind);
            let Some((action, is_admin, permissions)) = classify(old, new) else {
                continue;
            };
            events.push(MembershipEvent {
                update_id: UpdateId(i64::from(update.id)),
                action,
                chat_id: ChatId(change.chat.id.0),
                title: change.chat.title().map(str::to_string),
                username: change.chat.username().map(str::to_string),
                chat_type: Some(chat_type(&change.chat).to_string()),
                is_admin,
                permissions,
            });
        }
        tracing::debug!(events = events.len(), "membership updates fetched");
        Ok(events)
    }
}

/// Subscriber counts straight from the Bot API.
#[derive(Clone)]
pub struct DirectStats {
    bot: Bot,
}

impl DirectStats {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl StatsProvider for DirectStats {
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
        let count = self
            .bot
            .get_chat_member_count(tg_chat(chat_id))
            .await
            .map_err(map_request_error)?;
        let title = match self.bot.get_chat(tg_chat(chat_id)).await {
            Ok(chat) => chat.title().map(str::to_string),
            Err(_) => None,
        };
        Ok(ChannelMetrics {
            subscribers: u64::from(count),
            title,
            recent: None,
        })
    }

    async fn fetch_post_stats(&self, _msg: MessageRef) -> Result<MessageMetrics> {
        Ok(MessageMetrics::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanpub_core::errors::ErrorKind;
    use std::time::Duration;

    const ALL: BotPermissions = BotPermissions {
        can_post: true,
        can_edit: true,
        can_delete: true,
    };

    #[test]
    fn promotion_is_bot_added() {
        let got = classify(MemberStatus::Absent, MemberStatus::Admin(ALL));
        assert_eq!(got, Some((MembershipAction::BotAdded, true, ALL)));
        let got = classify(MemberStatus::Member, MemberStatus::Admin(ALL));
        assert_eq!(got.map(|g| g.0), Some(MembershipAction::BotAdded));
    }

    #[test]
    fn leaving_is_bot_removed() {
        let got = classify(MemberStatus::Admin(ALL), MemberStatus::Absent);
        assert_eq!(got, Some((MembershipAction::BotRemoved, false, BotPermissions::none())));
        assert_eq!(classify(MemberStatus::Absent, MemberStatus::Absent), None);
    }

    #[test]
    fn rights_change_and_demotion() {
        let post_only = BotPermissions {
            can_post: true,
            ..Default::default()
        };
        let got = classify(MemberStatus::Admin(ALL), MemberStatus::Admin(post_only));
        assert_eq!(got, Some((MembershipAction::BotPermissionsChanged, true, post_only)));

        let got = classify(MemberStatus::Admin(ALL), MemberStatus::Member);
        assert_eq!(
            got,
            Some((MembershipAction::BotPermissionsChanged, false, BotPermissions::none()))
        );
        assert_eq!(classify(MemberStatus::Absent, MemberStatus::Member), None);
    }

    #[test]
    fn request_errors_map_to_taxonomy() {
        let e = map_request_error(RequestError::RetryAfter(Duration::from_secs(5)));
        assert!(e.is_retryable());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(5)));

        let e = map_request_error(RequestError::Api(ApiError::NotEnoughRightsToPostMessages));
        assert_eq!(e.kind(), ErrorKind::TerminalPermission);

        let e = map_request_error(RequestError::Api(ApiError::MessageTextIsEmpty));
        assert_eq!(e.kind(), ErrorKind::Validation);
    }
}
