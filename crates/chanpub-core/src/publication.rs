//! Publication engine: post creation, per-channel publishing and roll-up.
//!
//! Every send goes through the idempotency ledger under a key derived from
//! `(channel_post_id, content_hash)` and through the retry executor. Status
//! changes are compare-and-set transitions, so concurrent workers never move a
//! row out from under each other. Channels are published concurrently; each
//! channel post sees at most one attempt at a time.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;

use crate::{
    domain::{
        rollup_status, Channel, ChannelId, ChannelPost, ChannelPostId, ChannelPostStatus, GroupId,
        MessageId, MessageRef, MultiChannelPost, PostId, PostStatus, PublishOptions, TextSource,
    },
    errors::{Error, ErrorKind},
    formatting::{check_length, content_hash, render_post_html},
    ledger::{Claim, IdempotencyLedger, LedgerGuard},
    ports::{
        ChannelPostPatch, MessagingGateway, NewChannelPost, NewPost, SendRequest, Store,
        Transition,
    },
    retry::RetryPolicy,
    Result,
};

/// What the ledger remembers per key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered {
        message: MessageRef,
        at: DateTime<Utc>,
    },
    Failed {
        kind: ErrorKind,
        error: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishSkip {
    NotReady(ChannelPostStatus),
    ChannelInactive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { message_id: MessageId },
    /// Already delivered by an earlier or concurrent attempt; no new send.
    DuplicateSuppressed { message_id: MessageId },
    Failed { kind: ErrorKind, error: String },
    Skipped(PublishSkip),
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            PublishOutcome::Published { .. } | PublishOutcome::DuplicateSuppressed { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishItem {
    pub channel_post_id: ChannelPostId,
    pub channel_id: ChannelId,
    pub outcome: PublishOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReport {
    pub post_id: PostId,
    pub status: PostStatus,
    pub items: Vec<PublishItem>,
}

/// Author input for a new multi-channel post.
#[derive(Clone, Debug, PartialEq)]
pub struct PostDraft {
    pub group_id: GroupId,
    pub text: String,
    /// Defaults to the primary channel's language.
    pub source_language: Option<String>,
    pub auto_translate: bool,
    pub options: PublishOptions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Every unpublished row; failed rows are attempted again.
    All,
    /// Only rows in `ready`; everything else is skipped silently.
    ReadyOnly,
}

/// Ledger key for one delivery of one payload to one channel.
pub fn publish_key(id: ChannelPostId, html: &str) -> String {
    format!("post-{}-{}", id, content_hash(html))
}

fn edit_key(id: ChannelPostId, html: &str) -> String {
    format!("edit-{}-{}", id, content_hash(html))
}

/// Recompute and store a post's status from its children.
pub async fn refresh_post_status(store: &dyn Store, post_id: PostId) -> Result<PostStatus> {
    let statuses: Vec<ChannelPostStatus> = store
        .channel_posts(post_id)
        .await?
        .iter()
        .map(|r| r.status)
        .collect();
    let status = rollup_status(&statuses);
    store.set_post_status(post_id, status).await?;
    Ok(status)
}

#[derive(Clone)]
pub struct PublicationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn Store>,
    gateway: Arc<dyn MessagingGateway>,
    ledger: IdempotencyLedger<AttemptOutcome>,
    retry: RetryPolicy,
}

impl PublicationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn MessagingGateway>,
        ledger: IdempotencyLedger<AttemptOutcome>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                gateway,
                ledger,
                retry,
            }),
        }
    }

    fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    /// Create a post and one channel post per active channel of the group.
    pub async fn create_post(
        &self,
        draft: PostDraft,
    ) -> Result<(MultiChannelPost, Vec<ChannelPost>)> {
        if draft.text.trim().is_empty() {
            return Err(Error::Validation("post text is empty".to_string()));
        }
        let group = self
            .store()
            .group(draft.group_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group {}", draft.group_id)))?;
        let primary = self
            .store()
            .channel(group.primary_channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {}", group.primary_channel_id)))?;
        if primary.group_id != Some(group.id) {
            return Err(Error::Validation(format!(
                "primary channel {} is not a member of group {}",
                primary.id, group.id
            )));
        }
        if !primary.is_active {
            return Err(Error::Validation(format!(
                "primary channel {} is inactive",
                primary.id
            )));
        }

        let mut children = vec![NewChannelPost {
            channel_id: primary.id,
            text: draft.text.clone(),
            source: TextSource::Primary,
            status: ChannelPostStatus::Ready,
        }];
        let others = self
            .store()
            .channels_in_group(group.id)
            .await?
            .into_iter()
            .filter(|c| c.is_active && c.id != primary.id);
        for channel in others {
            children.push(NewChannelPost {
                channel_id: channel.id,
                text: String::new(),
                source: if draft.auto_translate {
                    TextSource::AutoTranslated
                } else {
                    TextSource::ManualOverride
                },
                status: ChannelPostStatus::Draft,
            });
        }

        let source_language = draft
            .source_language
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| primary.language.clone())
            .to_lowercase();
        let created = self
            .store()
            .create_post(
                NewPost {
                    group_id: group.id,
                    primary_channel_id: primary.id,
                    primary_text: draft.text,
                    source_language,
                    auto_translate: draft.auto_translate,
                    options: draft.options,
                },
                children,
            )
            .await?;
        tracing::info!(
            post_id = %created.0.id,
            group_id = %group.id,
            channels = created.1.len(),
            "post created"
        );
        Ok(created)
    }

    /// Replace a channel post's text by hand and lock it against translation.
    ///
    /// Unpublished rows become `ready`. Published rows keep their status; use
    /// [`Self::sync_published_edit`] to push the new text to Telegram.
    pub async fn edit_channel_text(&self, id: ChannelPostId, text: &str) -> Result<ChannelPost> {
        if text.trim().is_empty() {
            return Err(Error::Validation("channel post text is empty".to_string()));
        }
        let row = self.load(id).await?;
        let to = match row.status {
            ChannelPostStatus::Publishing => {
                return Err(Error::Conflict(format!(
                    "channel post {id} is being published"
                )))
            }
            ChannelPostStatus::Published => ChannelPostStatus::Published,
            _ => ChannelPostStatus::Ready,
        };
        let updated = self
            .store()
            .transition(
                id,
                Transition::new(&[row.status], to).with_patch(ChannelPostPatch {
                    text: Some(text.to_string()),
                    source: Some(TextSource::ManualOverride),
                    locked: Some(true),
                    last_error: Some(None),
                    ..Default::default()
                }),
            )
            .await?;
        refresh_post_status(self.store(), row.post_id).await?;
        Ok(updated)
    }

    pub async fn publish_all(&self, post_id: PostId) -> Result<PublishReport> {
        self.publish_post(post_id, Mode::All).await
    }

    pub async fn publish_ready(&self, post_id: PostId) -> Result<PublishReport> {
        self.publish_post(post_id, Mode::ReadyOnly).await
    }

    /// Publish one `ready` channel post.
    pub async fn publish_channel_post(&self, id: ChannelPostId) -> Result<PublishOutcome> {
        let outcome = self.publish_one(id, &[ChannelPostStatus::Ready]).await?;
        let row = self.load(id).await?;
        refresh_post_status(self.store(), row.post_id).await?;
        Ok(outcome)
    }

    /// Explicitly re-attempt a `failed` channel post.
    ///
    /// A row left in `publishing` with no live attempt behind it (the process
    /// stopped mid-send) is resumed as well; a live attempt is joined instead.
    pub async fn retry_channel_post(&self, id: ChannelPostId) -> Result<PublishOutcome> {
        let row = self.load(id).await?;
        if !matches!(
            row.status,
            ChannelPostStatus::Failed | ChannelPostStatus::Publishing
        ) {
            return Err(Error::Validation(format!(
                "channel post {id} is {}, only failed posts can be retried",
                row.status
            )));
        }
        let outcome = self.publish_one(id, &[ChannelPostStatus::Failed]).await?;
        refresh_post_status(self.store(), row.post_id).await?;
        Ok(outcome)
    }

    async fn publish_post(&self, post_id: PostId, mode: Mode) -> Result<PublishReport> {
        if self.store().post(post_id).await?.is_none() {
            return Err(Error::NotFound(format!("post {post_id}")));
        }
        let rows = self.store().channel_posts(post_id).await?;

        let mut items = Vec::with_capacity(rows.len());
        let mut tasks = JoinSet::new();
        let mut channels: HashMap<ChannelPostId, ChannelId> = HashMap::new();

        for row in rows {
            channels.insert(row.id, row.channel_id);
            let allowed: &'static [ChannelPostStatus] = match (mode, row.status) {
                (_, ChannelPostStatus::Published) => {
                    items.push(PublishItem {
                        channel_post_id: row.id,
                        channel_id: row.channel_id,
                        outcome: match row.message_id {
                            Some(message_id) => PublishOutcome::DuplicateSuppressed { message_id },
                            None => PublishOutcome::Skipped(PublishSkip::NotReady(row.status)),
                        },
                    });
                    continue;
                }
                (Mode::All, ChannelPostStatus::Failed) if row.text.trim().is_empty() => {
                    // Translation never produced text; keep its error on the row.
                    items.push(PublishItem {
                        channel_post_id: row.id,
                        channel_id: row.channel_id,
                        outcome: PublishOutcome::Skipped(PublishSkip::NotReady(row.status)),
                    });
                    continue;
                }
                (Mode::All, ChannelPostStatus::Ready | ChannelPostStatus::Failed) => {
                    &[ChannelPostStatus::Ready, ChannelPostStatus::Failed]
                }
                (Mode::ReadyOnly, ChannelPostStatus::Ready) => &[ChannelPostStatus::Ready],
                (Mode::All, ChannelPostStatus::Publishing) => &[],
                (Mode::All, status) => {
                    items.push(PublishItem {
                        channel_post_id: row.id,
                        channel_id: row.channel_id,
                        outcome: PublishOutcome::Failed {
                            kind: ErrorKind::Validation,
                            error: format!("channel post is {status}, not ready to publish"),
                        },
                    });
                    continue;
                }
                (Mode::ReadyOnly, status) => {
                    items.push(PublishItem {
                        channel_post_id: row.id,
                        channel_id: row.channel_id,
                        outcome: PublishOutcome::Skipped(PublishSkip::NotReady(status)),
                    });
                    continue;
                }
            };

            let engine = self.clone();
            let id = row.id;
            tasks.spawn(async move { (id, engine.publish_one(id, allowed).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, result) = joined
                .map_err(|e| Error::External(format!("publish task panicked: {e}")))?;
            let outcome = result.unwrap_or_else(|e| PublishOutcome::Failed {
                kind: e.kind(),
                error: e.to_string(),
            });
            items.push(PublishItem {
                channel_post_id: id,
                channel_id: channels.get(&id).copied().unwrap_or(ChannelId(0)),
                outcome,
            });
        }
        items.sort_by_key(|i| i.channel_post_id);

        let status = refresh_post_status(self.store(), post_id).await?;
        let delivered = items.iter().filter(|i| i.outcome.is_delivered()).count();
        tracing::info!(
            post_id = %post_id,
            mode = ?mode,
            delivered,
            total = items.len(),
            status = %status,
            "publish pass finished"
        );
        Ok(PublishReport {
            post_id,
            status,
            items,
        })
    }

    /// One channel post, attempted only from the `allowed` states. A row that
    /// is already `publishing` joins the in-flight attempt through the ledger,
    /// or is resumed under the same key when no attempt holds it.
    async fn publish_one(
        &self,
        id: ChannelPostId,
        allowed: &[ChannelPostStatus],
    ) -> Result<PublishOutcome> {
        let row = self.load(id).await?;
        if row.status == ChannelPostStatus::Published {
            if let Some(message_id) = row.message_id {
                return Ok(PublishOutcome::DuplicateSuppressed { message_id });
            }
        }
        if !allowed.contains(&row.status) && row.status != ChannelPostStatus::Publishing {
            return Ok(PublishOutcome::Skipped(PublishSkip::NotReady(row.status)));
        }

        let post = self
            .store()
            .post(row.post_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("post {}", row.post_id)))?;
        let channel = self
            .store()
            .channel(row.channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {}", row.channel_id)))?;
        if !channel.is_active {
            return Ok(PublishOutcome::Skipped(PublishSkip::ChannelInactive));
        }

        if let Err(e) = preflight(&row, &channel) {
            return self.fail_before_send(&row, allowed, e).await;
        }

        let html = render_post_html(&row.text);
        let key = publish_key(row.id, &html);
        match self.inner.ledger.claim(&key) {
            Claim::Replay(outcome) => Ok(replayed(outcome)),
            Claim::InFlight(wait) => Ok(match wait.outcome().await {
                Some(outcome) => replayed(outcome),
                None => PublishOutcome::Failed {
                    kind: ErrorKind::Internal,
                    error: "concurrent attempt was abandoned".to_string(),
                },
            }),
            Claim::Owner(guard) => {
                let req = SendRequest {
                    chat_id: channel.chat_id,
                    html,
                    disable_web_page_preview: post.options.disable_web_page_preview,
                    disable_notification: post.options.disable_notification,
                };
                self.attempt(&row, allowed, req, guard).await
            }
        }
    }

    async fn attempt(
        &self,
        row: &ChannelPost,
        allowed: &[ChannelPostStatus],
        req: SendRequest,
        guard: LedgerGuard<AttemptOutcome>,
    ) -> Result<PublishOutcome> {
        // Owning the key for a `publishing` row means its attempt died.
        let mut from = allowed.to_vec();
        if row.status == ChannelPostStatus::Publishing {
            tracing::warn!(channel_post_id = %row.id, "resuming interrupted publish");
            from.push(ChannelPostStatus::Publishing);
        }
        let start = Transition::new(&from, ChannelPostStatus::Publishing).with_patch(
            ChannelPostPatch {
                last_error: Some(None),
                ..Default::default()
            },
        );
        match self.store().transition(row.id, start).await {
            Ok(_) => {}
            Err(Error::Conflict(_)) => {
                // Moved since we loaded it; the guard drop frees the key.
                let now = self.load(row.id).await?;
                return Ok(match (now.status, now.message_id) {
                    (ChannelPostStatus::Published, Some(message_id)) => {
                        PublishOutcome::DuplicateSuppressed { message_id }
                    }
                    (status, _) => PublishOutcome::Skipped(PublishSkip::NotReady(status)),
                });
            }
            Err(e) => return Err(e),
        }
        refresh_post_status(self.store(), row.post_id).await?;

        let key = guard.key().to_string();
        let gateway = &self.inner.gateway;
        let sent = self
            .inner
            .retry
            .run("send", |attempt| {
                tracing::debug!(
                    channel_post_id = %row.id,
                    chat_id = %req.chat_id,
                    attempt,
                    "sending"
                );
                gateway.send(&req, Some(key.as_str()))
            })
            .await;

        match sent {
            Ok(message) => {
                let at = Utc::now();
                // Remember the delivery before anything else can fail.
                guard.commit(AttemptOutcome::Delivered { message, at });
                self.store()
                    .transition(
                        row.id,
                        Transition::new(&[ChannelPostStatus::Publishing], ChannelPostStatus::Published)
                            .with_patch(ChannelPostPatch {
                                message_id: Some(Some(message.message_id)),
                                published_at: Some(Some(at)),
                                last_error: Some(None),
                                ..Default::default()
                            }),
                    )
                    .await?;
                tracing::info!(
                    channel_post_id = %row.id,
                    chat_id = %message.chat_id,
                    message_id = message.message_id.0,
                    "published"
                );
                Ok(PublishOutcome::Published {
                    message_id: message.message_id,
                })
            }
            Err(e) => {
                let kind = e.kind();
                let error = e.to_record();
                tracing::warn!(
                    channel_post_id = %row.id,
                    chat_id = %req.chat_id,
                    %kind,
                    error = %e,
                    "publish failed"
                );
                self.store()
                    .transition(
                        row.id,
                        Transition::new(&[ChannelPostStatus::Publishing], ChannelPostStatus::Failed)
                            .with_patch(ChannelPostPatch {
                                last_error: Some(Some(error.clone())),
                                ..Default::default()
                            }),
                    )
                    .await?;
                guard.release(AttemptOutcome::Failed {
                    kind,
                    error: error.clone(),
                });
                Ok(PublishOutcome::Failed { kind, error })
            }
        }
    }

    /// Record a terminal problem found before any send.
    async fn fail_before_send(
        &self,
        row: &ChannelPost,
        allowed: &[ChannelPostStatus],
        e: Error,
    ) -> Result<PublishOutcome> {
        let kind = e.kind();
        let error = e.to_record();
        tracing::warn!(channel_post_id = %row.id, %kind, error = %e, "not publishable");
        let t = Transition::new(allowed, ChannelPostStatus::Failed).with_patch(ChannelPostPatch {
            last_error: Some(Some(error.clone())),
            ..Default::default()
        });
        match self.store().transition(row.id, t).await {
            Ok(_) | Err(Error::Conflict(_)) => Ok(PublishOutcome::Failed { kind, error }),
            Err(e) => Err(e),
        }
    }

    /// Settle rows left in `publishing` by a previous process.
    ///
    /// Rows with a live attempt in this process are left alone. A row whose
    /// delivery was already committed to the ledger becomes `published`; any
    /// other becomes `failed` with a retryable error, so `retry_channel_post`
    /// or a publish-all pass sends it again under the same idempotency key.
    pub async fn recover_interrupted(&self) -> Result<Vec<ChannelPostId>> {
        let stuck = self
            .store()
            .channel_posts_in_status(ChannelPostStatus::Publishing)
            .await?;
        let mut recovered = Vec::new();
        let mut posts = Vec::new();

        for row in stuck {
            let key = publish_key(row.id, &render_post_html(&row.text));
            let settled = match self.inner.ledger.claim(&key) {
                Claim::InFlight(_) => continue,
                Claim::Replay(AttemptOutcome::Delivered { message, at }) => {
                    Transition::new(&[ChannelPostStatus::Publishing], ChannelPostStatus::Published)
                        .with_patch(ChannelPostPatch {
                            message_id: Some(Some(message.message_id)),
                            published_at: Some(Some(at)),
                            last_error: Some(None),
                            ..Default::default()
                        })
                }
                Claim::Replay(AttemptOutcome::Failed { error, .. }) => {
                    Transition::new(&[ChannelPostStatus::Publishing], ChannelPostStatus::Failed)
                        .with_patch(ChannelPostPatch {
                            last_error: Some(Some(error)),
                            ..Default::default()
                        })
                }
                Claim::Owner(guard) => {
                    let error = Error::transient("interrupted before delivery was confirmed")
                        .to_record();
                    let t = Transition::new(
                        &[ChannelPostStatus::Publishing],
                        ChannelPostStatus::Failed,
                    )
                    .with_patch(ChannelPostPatch {
                        last_error: Some(Some(error.clone())),
                        ..Default::default()
                    });
                    let applied = self.store().transition(row.id, t).await;
                    guard.release(AttemptOutcome::Failed {
                        kind: ErrorKind::RetryableTransient,
                        error,
                    });
                    match applied {
                        Ok(_) => {
                            tracing::warn!(
                                channel_post_id = %row.id,
                                "interrupted publish marked failed"
                            );
                            recovered.push(row.id);
                            posts.push(row.post_id);
                        }
                        Err(Error::Conflict(_)) => {}
                        Err(e) => return Err(e),
                    }
                    continue;
                }
            };
            match self.store().transition(row.id, settled).await {
                Ok(updated) => {
                    tracing::info!(
                        channel_post_id = %row.id,
                        status = %updated.status,
                        "interrupted publish settled"
                    );
                    recovered.push(row.id);
                    posts.push(row.post_id);
                }
                Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        posts.sort();
        posts.dedup();
        for post_id in posts {
            refresh_post_status(self.store(), post_id).await?;
        }
        Ok(recovered)
    }

    /// Push the current text of a published channel post to Telegram.
    pub async fn sync_published_edit(&self, id: ChannelPostId) -> Result<()> {
        let row = self.load(id).await?;
        let (message_id, channel) = self.published_target(&row).await?;
        if !channel.permissions.can_edit {
            return Err(Error::Permission(format!(
                "bot cannot edit messages in channel {}",
                channel.id
            )));
        }
        check_length(&row.text)?;

        let html = render_post_html(&row.text);
        let msg = MessageRef {
            chat_id: channel.chat_id,
            message_id,
        };
        let key = edit_key(id, &html);
        let guard = match self.inner.ledger.claim(&key) {
            Claim::Replay(_) => return Ok(()),
            Claim::InFlight(wait) => {
                return match wait.outcome().await {
                    Some(AttemptOutcome::Delivered { .. }) => Ok(()),
                    Some(AttemptOutcome::Failed { error, .. }) => Err(Error::External(error)),
                    None => Err(Error::Conflict("concurrent edit was abandoned".to_string())),
                }
            }
            Claim::Owner(guard) => guard,
        };

        let gateway = &self.inner.gateway;
        match self
            .inner
            .retry
            .run("edit", |_| gateway.edit(msg, &html, Some(key.as_str())))
            .await
        {
            Ok(()) => {
                guard.commit(AttemptOutcome::Delivered {
                    message: msg,
                    at: Utc::now(),
                });
                tracing::info!(channel_post_id = %id, message_id = message_id.0, "edit synced");
                Ok(())
            }
            Err(e) => {
                guard.release(AttemptOutcome::Failed {
                    kind: e.kind(),
                    error: e.to_record(),
                });
                Err(e)
            }
        }
    }

    /// Delete a published message and return the row to `ready`.
    pub async fn unpublish_channel_post(&self, id: ChannelPostId) -> Result<ChannelPost> {
        let row = self.load(id).await?;
        let (message_id, channel) = self.published_target(&row).await?;
        if !channel.permissions.can_delete {
            return Err(Error::Permission(format!(
                "bot cannot delete messages in channel {}",
                channel.id
            )));
        }

        let msg = MessageRef {
            chat_id: channel.chat_id,
            message_id,
        };
        let gateway = &self.inner.gateway;
        self.inner
            .retry
            .run("delete", |_| gateway.delete(msg))
            .await?;

        let updated = self
            .store()
            .transition(
                id,
                Transition::new(&[ChannelPostStatus::Published], ChannelPostStatus::Ready)
                    .with_patch(ChannelPostPatch {
                        message_id: Some(None),
                        published_at: Some(None),
                        ..Default::default()
                    }),
            )
            .await?;
        self.inner
            .ledger
            .forget(&publish_key(id, &render_post_html(&row.text)));
        refresh_post_status(self.store(), row.post_id).await?;
        tracing::info!(channel_post_id = %id, message_id = message_id.0, "unpublished");
        Ok(updated)
    }

    async fn published_target(&self, row: &ChannelPost) -> Result<(MessageId, Channel)> {
        let message_id = match (row.status, row.message_id) {
            (ChannelPostStatus::Published, Some(m)) => m,
            _ => {
                return Err(Error::Validation(format!(
                    "channel post {} is not published",
                    row.id
                )))
            }
        };
        let channel = self
            .store()
            .channel(row.channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {}", row.channel_id)))?;
        Ok((message_id, channel))
    }

    async fn load(&self, id: ChannelPostId) -> Result<ChannelPost> {
        self.store()
            .channel_post(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel post {id}")))
    }
}

fn preflight(row: &ChannelPost, channel: &Channel) -> Result<()> {
    if !channel.permissions.can_post {
        return Err(Error::Permission(
            "bot does not have posting permissions".to_string(),
        ));
    }
    check_length(&row.text)?;
    Ok(())
}

fn replayed(outcome: AttemptOutcome) -> PublishOutcome {
    match outcome {
        AttemptOutcome::Delivered { message, .. } => PublishOutcome::DuplicateSuppressed {
            message_id: message.message_id,
        },
        AttemptOutcome::Failed { kind, error } => PublishOutcome::Failed { kind, error },
    }
}
