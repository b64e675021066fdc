//! Channel discovery: applies bot-membership events to channel records.
//!
//! Events arrive pushed (webhook body) or pulled (pending-update queue), and
//! the two paths may overlap. Each update id is applied at most once, and every
//! event writes absolute values keyed by `chat_id`, so any interleaving of
//! duplicate or overlapping events converges to the same record.
//!
//! A periodic sync re-reads channel metadata and the bot's membership from
//! Telegram, so a revoked permission is noticed before the next send fails.

use std::sync::Arc;

use serde::Deserialize;

use crate::{
    domain::{BotPermissions, ChannelId, ChatId, UpdateId},
    errors::Error,
    ports::{
        BotMembership, ChannelUpsert, MembershipAction, MembershipEvent, MessagingGateway, Store,
        UpdateSource,
    },
    retry::RetryPolicy,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created(ChannelId),
    Updated(ChannelId),
    Deactivated(ChannelId),
    /// Update id already applied.
    Duplicate,
    /// Removal or permission change for a chat we never recorded.
    NotFound(ChatId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileItem {
    pub update_id: UpdateId,
    pub chat_id: ChatId,
    pub outcome: std::result::Result<ReconcileOutcome, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced {
        channel_id: ChannelId,
        is_admin: bool,
        permissions: BotPermissions,
    },
    /// The bot is no longer a member; the channel was deactivated.
    Deactivated(ChannelId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncItem {
    pub channel_id: ChannelId,
    pub outcome: std::result::Result<SyncOutcome, String>,
}

pub struct ChannelReconciler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn MessagingGateway>,
    retry: RetryPolicy,
    default_language: String,
}

impl ChannelReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn MessagingGateway>,
        retry: RetryPolicy,
        default_language: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gateway,
            retry,
            default_language: default_language.into(),
        }
    }

    pub async fn reconcile_channel_event(
        &self,
        event: &MembershipEvent,
    ) -> Result<ReconcileOutcome> {
        if !self.store.mark_update_processed(event.update_id).await? {
            tracing::debug!(update_id = %event.update_id, "duplicate membership update");
            return Ok(ReconcileOutcome::Duplicate);
        }

        match self.apply(event).await {
            Ok(outcome) => {
                tracing::info!(
                    update_id = %event.update_id,
                    chat_id = %event.chat_id,
                    action = ?event.action,
                    outcome = ?outcome,
                    "membership event applied"
                );
                Ok(outcome)
            }
            Err(e) => {
                // Let a redelivery of the same update try again.
                if let Err(forget) = self.store.forget_update(event.update_id).await {
                    tracing::warn!(
                        update_id = %event.update_id,
                        error = %forget,
                        "failed to release update id"
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply(&self, event: &MembershipEvent) -> Result<ReconcileOutcome> {
        let upsert = match event.action {
            MembershipAction::BotAdded => ChannelUpsert {
                chat_id: event.chat_id,
                title: event.title.clone(),
                username: event.username.clone(),
                chat_type: event.chat_type.clone(),
                is_active: Some(true),
                bot_is_admin: Some(event.is_admin),
                permissions: Some(event.permissions),
                create_with_language: Some(self.default_language.clone()),
            },
            MembershipAction::BotRemoved => ChannelUpsert {
                chat_id: event.chat_id,
                is_active: Some(false),
                bot_is_admin: Some(false),
                permissions: Some(BotPermissions::none()),
                ..Default::default()
            },
            MembershipAction::BotPermissionsChanged => ChannelUpsert {
                chat_id: event.chat_id,
                bot_is_admin: Some(event.is_admin),
                permissions: Some(event.permissions),
                ..Default::default()
            },
        };

        let Some((channel, created)) = self.store.upsert_channel(upsert).await? else {
            tracing::warn!(
                chat_id = %event.chat_id,
                action = ?event.action,
                "membership event for unknown channel"
            );
            return Ok(ReconcileOutcome::NotFound(event.chat_id));
        };
        Ok(match (event.action, created) {
            (_, true) => ReconcileOutcome::Created(channel.id),
            (MembershipAction::BotRemoved, _) => ReconcileOutcome::Deactivated(channel.id),
            _ => ReconcileOutcome::Updated(channel.id),
        })
    }

    /// Apply a batch; each event is reported on its own.
    pub async fn ingest(&self, events: &[MembershipEvent]) -> Vec<ReconcileItem> {
        let mut items = Vec::with_capacity(events.len());
        for event in events {
            let outcome = self
                .reconcile_channel_event(event)
                .await
                .map_err(|e| e.to_record());
            items.push(ReconcileItem {
                update_id: event.update_id,
                chat_id: event.chat_id,
                outcome,
            });
        }
        items
    }

    /// Re-read one channel's metadata and the bot's membership from Telegram.
    ///
    /// Losing membership (or being refused outright) deactivates the channel
    /// and clears its permissions. Otherwise title, username, chat type, admin
    /// flag and permissions are overwritten with what Telegram reports.
    pub async fn sync_channel(&self, id: ChannelId) -> Result<SyncOutcome> {
        let channel = self
            .store
            .channel(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {id}")))?;
        let chat_id = channel.chat_id;
        let gateway = &self.gateway;

        let membership = match self
            .retry
            .run("permissions", |_| gateway.permissions(chat_id))
            .await
        {
            Ok(m) => m,
            Err(Error::Permission(reason)) => {
                tracing::debug!(
                    channel_id = %id,
                    chat_id = %chat_id,
                    %reason,
                    "membership lookup refused"
                );
                BotMembership::default()
            }
            Err(e) => return Err(e),
        };

        if !membership.is_member {
            self.store
                .upsert_channel(ChannelUpsert {
                    chat_id,
                    is_active: Some(false),
                    bot_is_admin: Some(false),
                    permissions: Some(BotPermissions::none()),
                    ..Default::default()
                })
                .await?;
            tracing::warn!(
                channel_id = %id,
                chat_id = %chat_id,
                "bot is no longer a member, channel deactivated"
            );
            return Ok(SyncOutcome::Deactivated(id));
        }

        let info = self
            .retry
            .run("channel_info", |_| gateway.channel_info(chat_id))
            .await?;
        self.store
            .upsert_channel(ChannelUpsert {
                chat_id,
                title: info.title,
                username: info.username.filter(|u| !u.trim().is_empty()),
                chat_type: info.chat_type,
                bot_is_admin: Some(membership.is_admin),
                permissions: Some(membership.permissions),
                ..Default::default()
            })
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {id}")))?;

        if channel.permissions.can_post && !membership.permissions.can_post {
            tracing::warn!(channel_id = %id, chat_id = %chat_id, "bot lost posting permission");
        }
        tracing::debug!(
            channel_id = %id,
            is_admin = membership.is_admin,
            can_post = membership.permissions.can_post,
            "channel synced"
        );
        Ok(SyncOutcome::Synced {
            channel_id: id,
            is_admin: membership.is_admin,
            permissions: membership.permissions,
        })
    }

    /// Sync every active channel; each channel is reported on its own.
    pub async fn sync_all_channels(&self) -> Result<Vec<SyncItem>> {
        let channels = self.store.active_channels().await?;
        let mut items = Vec::with_capacity(channels.len());
        for channel in channels {
            let outcome = self.sync_channel(channel.id).await.map_err(|e| {
                tracing::warn!(channel_id = %channel.id, error = %e, "channel sync failed");
                e.to_record()
            });
            items.push(SyncItem {
                channel_id: channel.id,
                outcome,
            });
        }
        let deactivated = items
            .iter()
            .filter(|i| matches!(i.outcome, Ok(SyncOutcome::Deactivated(_))))
            .count();
        tracing::info!(channels = items.len(), deactivated, "channel sync finished");
        Ok(items)
    }

    /// Pull pending events from `source` and apply them.
    pub async fn poll(&self, source: &dyn UpdateSource) -> Result<Vec<ReconcileItem>> {
        let events = source.fetch_pending().await?;
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let items = self.ingest(&events).await;
        tracing::info!(events = items.len(), "membership updates polled");
        Ok(items)
    }
}

/// Permission flags as the gateway reports them.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventPermissions {
    pub can_post_messages: bool,
    pub can_edit_messages: bool,
    pub can_delete_messages: bool,
}

/// Membership event as delivered by the gateway webhook and pending-update
/// queue.
#[derive(Clone, Debug, Deserialize)]
pub struct BotEventPayload {
    pub update_id: i64,
    pub event: String,
    pub chat_id: i64,
    #[serde(default)]
    pub chat_title: Option<String>,
    #[serde(default)]
    pub chat_username: Option<String>,
    #[serde(default)]
    pub chat_type: Option<String>,
    #[serde(default)]
    pub new_status: Option<String>,
    #[serde(default)]
    pub permissions: Option<EventPermissions>,
}

impl BotEventPayload {
    /// `None` for event types we do not handle.
    pub fn into_event(self) -> Option<MembershipEvent> {
        let action = match self.event.as_str() {
            "bot_added" => MembershipAction::BotAdded,
            "bot_removed" => MembershipAction::BotRemoved,
            "bot_permissions_changed" => MembershipAction::BotPermissionsChanged,
            other => {
                tracing::warn!(event = other, chat_id = self.chat_id, "ignoring unknown bot event");
                return None;
            }
        };
        let permissions = match (action, self.permissions) {
            (MembershipAction::BotRemoved, _) | (_, None) => BotPermissions::none(),
            (_, Some(p)) => BotPermissions {
                can_post: p.can_post_messages,
                can_edit: p.can_edit_messages,
                can_delete: p.can_delete_messages,
            },
        };
        let is_admin = match action {
            MembershipAction::BotRemoved => false,
            MembershipAction::BotAdded | MembershipAction::BotPermissionsChanged => self
                .new_status
                .as_deref()
                .map_or(true, |s| s == "administrator" || s == "creator"),
        };
        Some(MembershipEvent {
            update_id: UpdateId(self.update_id),
            action,
            chat_id: ChatId(self.chat_id),
            title: self.chat_title.filter(|t| !t.trim().is_empty()),
            username: self.chat_username.filter(|u| !u.trim().is_empty()),
            chat_type: self.chat_type,
            is_admin,
            permissions,
        })
    }
}

/// Decode a pushed webhook body. `Ok(None)` for unknown event types.
pub fn parse_webhook_event(body: &[u8]) -> Result<Option<MembershipEvent>> {
    let payload: BotEventPayload = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("invalid bot event payload: {e}")))?;
    Ok(payload.into_event())
}
