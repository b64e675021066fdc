//! Translation fan-out / fan-in.
//!
//! One translation per distinct target language, requested in batches. Each
//! language commits independently: a bad language never sinks the batch, and
//! rows locked by a manual edit are never overwritten.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};

use crate::{
    domain::{
        ChannelId, ChannelPost, ChannelPostId, ChannelPostStatus, PostId, PostStatus, TextSource,
    },
    errors::{ContentError, Error},
    ports::{
        BatchTranslationRequest, ChannelPostPatch, Store, Transition, Translation,
        TranslationRequest, Translator,
    },
    publication::refresh_post_status,
    retry::RetryPolicy,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Primary,
    Locked,
    /// Text already settled (ready, publishing, published or failed).
    NotPending(ChannelPostStatus),
    /// Someone else moved the row while we were working on it.
    Changed,
    /// Another pass in this process is already translating the row.
    InFlight,
    ChannelMissing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranslationOutcome {
    Committed { warnings: Vec<String> },
    /// Target language equals the source; primary text copied.
    Copied,
    /// Left in `translating` with the error recorded; a later run retries.
    PendingRetry { error: String },
    /// Terminal for this row until the author acts.
    Rejected { error: String },
    Skipped(SkipReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationItem {
    pub channel_post_id: ChannelPostId,
    pub channel_id: ChannelId,
    pub language: Option<String>,
    pub outcome: TranslationOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationReport {
    pub post_id: PostId,
    pub status: PostStatus,
    pub items: Vec<TranslationItem>,
}

impl TranslationReport {
    pub fn committed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| {
                matches!(
                    i.outcome,
                    TranslationOutcome::Committed { .. } | TranslationOutcome::Copied
                )
            })
            .count()
    }
}

enum LanguageResult {
    Translated(Translation),
    Pending(String),
    Unsupported(String),
    TooLong(String),
}

/// Rows currently held by a translation pass.
#[derive(Clone, Default)]
struct InFlightRows(Arc<Mutex<HashSet<ChannelPostId>>>);

impl InFlightRows {
    fn try_hold(&self, id: ChannelPostId) -> Option<RowHold> {
        let inserted = self
            .0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        inserted.then(|| RowHold {
            rows: self.clone(),
            id,
        })
    }
}

/// Releases the row when dropped.
struct RowHold {
    rows: InFlightRows,
    id: ChannelPostId,
}

impl Drop for RowHold {
    fn drop(&mut self) {
        self.rows
            .0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

#[derive(Clone)]
pub struct TranslationOrchestrator {
    store: Arc<dyn Store>,
    translator: Arc<dyn Translator>,
    retry: RetryPolicy,
    batch_size: usize,
    in_flight: InFlightRows,
}

impl TranslationOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        translator: Arc<dyn Translator>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            translator,
            retry,
            batch_size: batch_size.max(1),
            in_flight: InFlightRows::default(),
        }
    }

    /// Translate every pending row of a post.
    ///
    /// A row already held by a concurrent pass is reported as
    /// [`SkipReason::InFlight`] and never reaches the translator twice.
    pub async fn request_translations(&self, post_id: PostId) -> Result<TranslationReport> {
        let post = self
            .store
            .post(post_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("post {post_id}")))?;
        let rows = self.store.channel_posts(post_id).await?;

        let mut items = Vec::new();
        let mut by_language: BTreeMap<String, Vec<ChannelPost>> = BTreeMap::new();
        let mut held = Vec::new();

        for row in rows {
            let skip = |reason, language: Option<String>| TranslationItem {
                channel_post_id: row.id,
                channel_id: row.channel_id,
                language,
                outcome: TranslationOutcome::Skipped(reason),
            };

            let Some(channel) = self.store.channel(row.channel_id).await? else {
                items.push(skip(SkipReason::ChannelMissing, None));
                continue;
            };
            let language = channel.language.to_lowercase();
            if row.channel_id == post.primary_channel_id || row.source == TextSource::Primary {
                items.push(skip(SkipReason::Primary, Some(language)));
                continue;
            }
            if row.locked {
                items.push(skip(SkipReason::Locked, Some(language)));
                continue;
            }
            if !row.status.is_pending_text() {
                items.push(skip(SkipReason::NotPending(row.status), Some(language)));
                continue;
            }

            let Some(hold) = self.in_flight.try_hold(row.id) else {
                items.push(skip(SkipReason::InFlight, Some(language)));
                continue;
            };
            let claim = Transition::new(
                &[ChannelPostStatus::Draft, ChannelPostStatus::Translating],
                ChannelPostStatus::Translating,
            )
            .unlocked_only();
            match self.store.transition(row.id, claim).await {
                Ok(claimed) => {
                    held.push(hold);
                    by_language.entry(language).or_default().push(claimed)
                }
                Err(Error::Conflict(_)) => items.push(skip(SkipReason::Changed, Some(language))),
                Err(e) => return Err(e),
            }
        }

        if !by_language.is_empty() {
            let results = self
                .translate_all(&post.primary_text, &post.source_language, &by_language)
                .await;
            for (language, rows) in by_language {
                let result = results.get(&language);
                for row in rows {
                    let outcome = self.apply(&row, &post.primary_text, result).await?;
                    items.push(TranslationItem {
                        channel_post_id: row.id,
                        channel_id: row.channel_id,
                        language: Some(language.clone()),
                        outcome,
                    });
                }
            }
        }

        drop(held);

        let status = refresh_post_status(self.store.as_ref(), post_id).await?;
        let report = TranslationReport {
            post_id,
            status,
            items,
        };
        tracing::info!(
            post_id = %post_id,
            committed = report.committed(),
            total = report.items.len(),
            status = %status,
            "translation pass finished"
        );
        Ok(report)
    }

    /// Posts that still have rows waiting for a translation pass.
    pub async fn posts_awaiting_translation(&self) -> Result<Vec<PostId>> {
        let mut ids = Vec::new();
        for row in self
            .store
            .channel_posts_in_status(ChannelPostStatus::Translating)
            .await?
        {
            ids.push(row.post_id);
        }
        for row in self.store.channel_posts_in_status(ChannelPostStatus::Draft).await? {
            if row.locked || !row.text.is_empty() || row.last_error.is_some() {
                continue;
            }
            if let Some(post) = self.store.post(row.post_id).await? {
                if post.auto_translate {
                    ids.push(row.post_id);
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn translate_all(
        &self,
        text: &str,
        source_language: &str,
        by_language: &BTreeMap<String, Vec<ChannelPost>>,
    ) -> BTreeMap<String, LanguageResult> {
        let source = source_language.to_lowercase();
        let mut results = BTreeMap::new();

        let len = text.chars().count();
        let max = self.translator.max_input_chars();
        if len > max {
            let reason = Error::Content(ContentError::TooLong { len, max }).to_record();
            for language in by_language.keys().filter(|l| **l != source) {
                results.insert(language.clone(), LanguageResult::TooLong(reason.clone()));
            }
            return results;
        }

        let targets: Vec<String> = by_language
            .keys()
            .filter(|l| **l != source)
            .cloned()
            .collect();
        let chunk = self
            .batch_size
            .min(self.translator.max_batch_languages())
            .max(1);

        for languages in targets.chunks(chunk) {
            self.translate_chunk(text, &source, languages, &mut results)
                .await;
        }
        results
    }

    async fn translate_chunk(
        &self,
        text: &str,
        source: &str,
        languages: &[String],
        results: &mut BTreeMap<String, LanguageResult>,
    ) {
        let req = BatchTranslationRequest {
            text: text.to_string(),
            source_language: source.to_string(),
            target_languages: languages.to_vec(),
        };

        match self
            .retry
            .run("translate_batch", |_| self.translator.translate_batch(&req))
            .await
        {
            Ok(batch) => {
                for t in batch.translations {
                    let language = t.language.to_lowercase();
                    if t.text.trim().is_empty() {
                        let pending = LanguageResult::Pending("empty translation".into());
                        results.insert(language, pending);
                    } else {
                        results.insert(language, LanguageResult::Translated(t));
                    }
                }
                for f in batch.failures {
                    let language = f.language.to_lowercase();
                    let result = if f.retryable {
                        LanguageResult::Pending(f.reason)
                    } else {
                        LanguageResult::Unsupported(f.reason)
                    };
                    results.entry(language).or_insert(result);
                }
                for language in languages {
                    results
                        .entry(language.clone())
                        .or_insert_with(|| {
                            LanguageResult::Pending("missing from batch response".into())
                        });
                }
            }
            Err(e @ Error::Content(ContentError::TooLong { .. })) => {
                let reason = e.to_record();
                for language in languages {
                    results.insert(language.clone(), LanguageResult::TooLong(reason.clone()));
                }
            }
            Err(
                e @ (Error::Content(ContentError::UnsupportedLanguage(_)) | Error::Validation(_)),
            ) => {
                // Isolate the offending language with single calls.
                tracing::warn!(
                    error = %e,
                    languages = ?languages,
                    "batch rejected, falling back to single translations"
                );
                for language in languages {
                    let result = self.translate_one(text, source, language).await;
                    results.insert(language.clone(), result);
                }
            }
            Err(e) => {
                let reason = e.to_record();
                tracing::warn!(error = %e, languages = ?languages, "batch translation failed");
                for language in languages {
                    results.insert(language.clone(), LanguageResult::Pending(reason.clone()));
                }
            }
        }
    }

    async fn translate_one(&self, text: &str, source: &str, language: &str) -> LanguageResult {
        let req = TranslationRequest {
            text: text.to_string(),
            source_language: source.to_string(),
            target_language: language.to_string(),
        };
        match self
            .retry
            .run("translate", |_| self.translator.translate(&req))
            .await
        {
            Ok(t) if t.text.trim().is_empty() => {
                LanguageResult::Pending("empty translation".into())
            }
            Ok(t) => LanguageResult::Translated(t),
            Err(e @ Error::Content(ContentError::TooLong { .. })) => {
                LanguageResult::TooLong(e.to_record())
            }
            Err(e @ (Error::Content(_) | Error::Validation(_))) => {
                LanguageResult::Unsupported(e.to_record())
            }
            Err(e) => LanguageResult::Pending(e.to_record()),
        }
    }

    async fn apply(
        &self,
        row: &ChannelPost,
        primary_text: &str,
        result: Option<&LanguageResult>,
    ) -> Result<TranslationOutcome> {
        let from = [ChannelPostStatus::Translating];
        let (transition, outcome) = match result {
            // Same language as the source: nothing was sent out.
            None => (
                Transition::new(&from, ChannelPostStatus::Ready)
                    .unlocked_only()
                    .with_patch(ChannelPostPatch {
                        text: Some(primary_text.to_string()),
                        source: Some(TextSource::AutoTranslated),
                        last_error: Some(None),
                        ..Default::default()
                    }),
                TranslationOutcome::Copied,
            ),
            Some(LanguageResult::Translated(t)) => {
                for w in &t.warnings {
                    tracing::warn!(
                        channel_post_id = %row.id,
                        language = %t.language,
                        warning = %w,
                        "translation warning"
                    );
                }
                (
                    Transition::new(&from, ChannelPostStatus::Ready)
                        .unlocked_only()
                        .with_patch(ChannelPostPatch {
                            text: Some(t.text.clone()),
                            source: Some(TextSource::AutoTranslated),
                            last_error: Some(None),
                            ..Default::default()
                        }),
                    TranslationOutcome::Committed {
                        warnings: t.warnings.clone(),
                    },
                )
            }
            Some(LanguageResult::Pending(reason)) => (
                Transition::new(&from, ChannelPostStatus::Translating).with_patch(ChannelPostPatch {
                    last_error: Some(Some(reason.clone())),
                    ..Default::default()
                }),
                TranslationOutcome::PendingRetry {
                    error: reason.clone(),
                },
            ),
            Some(LanguageResult::Unsupported(reason)) => (
                Transition::new(&from, ChannelPostStatus::Failed).with_patch(ChannelPostPatch {
                    last_error: Some(Some(reason.clone())),
                    ..Default::default()
                }),
                TranslationOutcome::Rejected {
                    error: reason.clone(),
                },
            ),
            Some(LanguageResult::TooLong(reason)) => (
                Transition::new(&from, ChannelPostStatus::Draft).with_patch(ChannelPostPatch {
                    last_error: Some(Some(reason.clone())),
                    ..Default::default()
                }),
                TranslationOutcome::Rejected {
                    error: reason.clone(),
                },
            ),
        };

        match self.store.transition(row.id, transition).await {
            Ok(_) => Ok(outcome),
            // A manual edit landed while the translation was in flight.
            Err(Error::Conflict(_)) => Ok(TranslationOutcome::Skipped(SkipReason::Changed)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, PublishOptions};
    use crate::ports::{
        BatchTranslation, ChannelUpsert, LanguageFailure, NewChannelPost, NewPost,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        FailRetryable,
        Unsupported,
    }

    #[derive(Default)]
    struct FakeTranslator {
        behavior: HashMap<String, Behavior>,
        batch_calls: Mutex<Vec<Vec<String>>>,
        single_calls: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl FakeTranslator {
        fn with(langs: &[(&str, Behavior)]) -> Self {
            Self {
                behavior: langs.iter().map(|(l, b)| (l.to_string(), *b)).collect(),
                ..Default::default()
            }
        }

        fn translation(lang: &str, text: &str) -> Translation {
            Translation {
                language: lang.to_string(),
                text: format!("[{lang}] {text}"),
                warnings: vec![],
                tokens_used: 1,
            }
        }
    }

    #[async_trait]
    impl Translator for FakeTranslator {
        fn max_input_chars(&self) -> usize {
            100
        }

        fn max_batch_languages(&self) -> usize {
            20
        }

        async fn translate(&self, req: &TranslationRequest) -> Result<Translation> {
            self.single_calls
                .lock()
                .unwrap()
                .push(req.target_language.clone());
            match self.behavior.get(&req.target_language).copied().unwrap_or(Behavior::Ok) {
                Behavior::Ok => Ok(Self::translation(&req.target_language, &req.text)),
                Behavior::FailRetryable => Err(Error::transient("provider unavailable")),
                Behavior::Unsupported => Err(Error::Content(ContentError::UnsupportedLanguage(
                    req.target_language.clone(),
                ))),
            }
        }

        async fn translate_batch(&self, req: &BatchTranslationRequest) -> Result<BatchTranslation> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.batch_calls
                .lock()
                .unwrap()
                .push(req.target_languages.clone());
            let mut out = BatchTranslation::default();
            for lang in &req.target_languages {
                match self.behavior.get(lang).copied().unwrap_or(Behavior::Ok) {
                    Behavior::Ok => out.translations.push(Self::translation(lang, &req.text)),
                    Behavior::FailRetryable => out.failures.push(LanguageFailure {
                        language: lang.clone(),
                        reason: "provider unavailable".into(),
                        retryable: true,
                    }),
                    Behavior::Unsupported => {
                        return Err(Error::Content(ContentError::UnsupportedLanguage(lang.clone())))
                    }
                }
            }
            Ok(out)
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Duration::from_secs(1),
        }
    }

    /// Primary "en" channel plus one draft row per extra language.
    async fn setup(store: &MemoryStore, text: &str, languages: &[&str]) -> (PostId, Vec<ChannelPost>) {
        let mut chat = -1000;
        let mut add = |lang: &str| {
            chat -= 1;
            ChannelUpsert {
                chat_id: ChatId(chat),
                create_with_language: Some(lang.to_string()),
                ..Default::default()
            }
        };
        let primary = store.upsert_channel(add("en")).await.unwrap().unwrap().0;
        let group = store.create_group("news", primary.id).await.unwrap();

        let mut children = vec![NewChannelPost {
            channel_id: primary.id,
            text: text.to_string(),
            source: TextSource::Primary,
            status: ChannelPostStatus::Ready,
        }];
        for lang in languages {
            let c = store.upsert_channel(add(lang)).await.unwrap().unwrap().0;
            store.assign_channel(c.id, Some(group.id)).await.unwrap();
            children.push(NewChannelPost {
                channel_id: c.id,
                text: String::new(),
                source: TextSource::AutoTranslated,
                status: ChannelPostStatus::Draft,
            });
        }

        let (post, rows) = store
            .create_post(
                NewPost {
                    group_id: group.id,
                    primary_channel_id: primary.id,
                    primary_text: text.to_string(),
                    source_language: "en".into(),
                    auto_translate: true,
                    options: PublishOptions::default(),
                },
                children,
            )
            .await
            .unwrap();
        (post.id, rows)
    }

    fn item_for<'a>(report: &'a TranslationReport, id: ChannelPostId) -> &'a TranslationItem {
        report
            .items
            .iter()
            .find(|i| i.channel_post_id == id)
            .expect("item present")
    }

    #[tokio::test]
    async fn one_failing_language_does_not_sink_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let (post_id, rows) = setup(&store, "hello", &["de", "fr", "es"]).await;
        let translator = Arc::new(FakeTranslator::with(&[("fr", Behavior::FailRetryable)]));
        let orch = TranslationOrchestrator::new(store.clone(), translator.clone(), fast_retry(), 20);

        let report = orch.request_translations(post_id).await.unwrap();

        assert_eq!(translator.batch_calls.lock().unwrap().len(), 1);
        assert_eq!(report.committed(), 2);
        assert_eq!(report.status, PostStatus::Draft);

        for row in &rows[1..] {
            let now = store.channel_post(row.id).await.unwrap().unwrap();
            let lang = item_for(&report, row.id).language.clone().unwrap();
            if lang == "fr" {
                assert_eq!(now.status, ChannelPostStatus::Translating);
                assert!(now.last_error.as_deref().unwrap().contains("provider unavailable"));
                assert!(now.text.is_empty());
            } else {
                assert_eq!(now.status, ChannelPostStatus::Ready);
                assert_eq!(now.text, format!("[{lang}] hello"));
                assert_eq!(now.source, TextSource::AutoTranslated);
            }
        }
    }

    #[tokio::test]
    async fn manual_edits_survive_a_rerun() {
        let store = Arc::new(MemoryStore::new());
        let (post_id, rows) = setup(&store, "hello", &["de"]).await;
        store
            .transition(
                rows[1].id,
                Transition::new(&[ChannelPostStatus::Draft], ChannelPostStatus::Ready).with_patch(
                    ChannelPostPatch {
                        text: Some("Hallo von Hand".into()),
                        source: Some(TextSource::ManualOverride),
                        locked: Some(true),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();

        let translator = Arc::new(FakeTranslator::default());
        let orch = TranslationOrchestrator::new(store.clone(), translator.clone(), fast_retry(), 20);
        let report = orch.request_translations(post_id).await.unwrap();

        assert_eq!(
            item_for(&report, rows[1].id).outcome,
            TranslationOutcome::Skipped(SkipReason::Locked)
        );
        assert!(translator.batch_calls.lock().unwrap().is_empty());
        let row = store.channel_post(rows[1].id).await.unwrap().unwrap();
        assert_eq!(row.text, "Hallo von Hand");
        assert_eq!(row.source, TextSource::ManualOverride);
        assert_eq!(report.status, PostStatus::ReadyForPublish);
    }

    #[tokio::test]
    async fn unsupported_language_falls_back_to_single_calls() {
        let store = Arc::new(MemoryStore::new());
        let (post_id, rows) = setup(&store, "hello", &["de", "xx"]).await;
        let translator = Arc::new(FakeTranslator::with(&[("xx", Behavior::Unsupported)]));
        let orch = TranslationOrchestrator::new(store.clone(), translator.clone(), fast_retry(), 20);

        let report = orch.request_translations(post_id).await.unwrap();

        let mut singles = translator.single_calls.lock().unwrap().clone();
        singles.sort();
        assert_eq!(singles, vec!["de".to_string(), "xx".to_string()]);

        let de = store.channel_post(rows[1].id).await.unwrap().unwrap();
        let xx = store.channel_post(rows[2].id).await.unwrap().unwrap();
        assert_eq!(de.status, ChannelPostStatus::Ready);
        assert_eq!(xx.status, ChannelPostStatus::Failed);
        assert!(matches!(
            item_for(&report, rows[2].id).outcome,
            TranslationOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn same_language_copies_primary_text() {
        let store = Arc::new(MemoryStore::new());
        let (post_id, rows) = setup(&store, "hello", &["en"]).await;
        let translator = Arc::new(FakeTranslator::default());
        let orch = TranslationOrchestrator::new(store.clone(), translator.clone(), fast_retry(), 20);

        let report = orch.request_translations(post_id).await.unwrap();

        assert_eq!(item_for(&report, rows[1].id).outcome, TranslationOutcome::Copied);
        assert!(translator.batch_calls.lock().unwrap().is_empty());
        let row = store.channel_post(rows[1].id).await.unwrap().unwrap();
        assert_eq!(row.text, "hello");
        assert_eq!(row.status, ChannelPostStatus::Ready);
    }

    #[tokio::test]
    async fn too_long_is_rejected_without_calling_the_service() {
        let store = Arc::new(MemoryStore::new());
        let long = "x".repeat(101);
        let (post_id, rows) = setup(&store, &long, &["de"]).await;
        let translator = Arc::new(FakeTranslator::default());
        let orch = TranslationOrchestrator::new(store.clone(), translator.clone(), fast_retry(), 20);

        let report = orch.request_translations(post_id).await.unwrap();

        assert!(translator.batch_calls.lock().unwrap().is_empty());
        let row = store.channel_post(rows[1].id).await.unwrap().unwrap();
        assert_eq!(row.status, ChannelPostStatus::Draft);
        assert!(row.last_error.unwrap().starts_with("[terminal_content]"));
        assert!(matches!(
            item_for(&report, rows[1].id).outcome,
            TranslationOutcome::Rejected { .. }
        ));
        assert!(orch.posts_awaiting_translation().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batches_respect_the_size_limit() {
        let store = Arc::new(MemoryStore::new());
        let (post_id, _) = setup(&store, "hello", &["de", "fr", "es", "it", "pt"]).await;
        let translator = Arc::new(FakeTranslator::default());
        let orch = TranslationOrchestrator::new(store.clone(), translator.clone(), fast_retry(), 2);

        assert_eq!(orch.posts_awaiting_translation().await.unwrap(), vec![post_id]);
        let report = orch.request_translations(post_id).await.unwrap();

        let sizes: Vec<usize> = translator
            .batch_calls
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(report.committed(), 5);
        assert_eq!(report.status, PostStatus::ReadyForPublish);
    }

    #[tokio::test]
    async fn concurrent_requests_translate_each_row_once() {
        let store = Arc::new(MemoryStore::new());
        let (post_id, rows) = setup(&store, "hello", &["de"]).await;
        let translator = Arc::new(FakeTranslator {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let orch = TranslationOrchestrator::new(store.clone(), translator.clone(), fast_retry(), 20);

        let (a, b) = tokio::join!(
            orch.request_translations(post_id),
            orch.request_translations(post_id)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(translator.batch_calls.lock().unwrap().len(), 1);
        assert!(translator.single_calls.lock().unwrap().is_empty());
        assert_eq!(a.committed() + b.committed(), 1);
        let skipped = [&a, &b]
            .iter()
            .filter(|r| {
                item_for(r, rows[1].id).outcome == TranslationOutcome::Skipped(SkipReason::InFlight)
            })
            .count();
        assert_eq!(skipped, 1);

        let row = store.channel_post(rows[1].id).await.unwrap().unwrap();
        assert_eq!(row.status, ChannelPostStatus::Ready);
        assert_eq!(row.text, "[de] hello");
    }
}
