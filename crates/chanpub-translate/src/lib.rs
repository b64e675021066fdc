//! Translation service adapter (HTTP).
//!
//! Talks to the LLM-backed translation service (`/api/v1/translate` and
//! `/api/v1/translate/batch`) and maps its error codes onto the core error
//! taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use chanpub_core::{
    errors::{ContentError, Error},
    ports::{
        BatchTranslation, BatchTranslationRequest, LanguageFailure, Translation,
        TranslationRequest, Translator,
    },
    Result,
};

/// Service-side input limit.
pub const MAX_INPUT_CHARS: usize = 12_000;
/// Service-side cap on target languages per batch call.
pub const MAX_BATCH_LANGUAGES: usize = 20;

#[derive(Clone, Debug)]
pub struct TranslationClient {
    base_url: String,
    token: Option<String>,
    tone: String,
    context: String,
    http: reqwest::Client,
}

impl TranslationClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        tone: impl Into<String>,
        context: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("chanpub/0.1")
            .build()
            .map_err(|e| Error::Config(format!("translation http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            tone: tone.into(),
            context: context.into(),
            http,
        })
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let mut req = self
            .http
            .post(format!("{}/api/v1{}", self.base_url, path))
            .json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(map_transport)?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.map_err(map_transport)?;
        decode_response(status, &body, retry_after)
    }

    fn context(&self) -> Option<&str> {
        Some(self.context.as_str()).filter(|c| !c.trim().is_empty())
    }
}

fn map_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::transient(format!("translation service unreachable: {e}"))
    } else {
        Error::External(format!("translation request error: {e}"))
    }
}

#[derive(Debug, Serialize)]
struct TranslateBody<'a> {
    text: &'a str,
    source_language: &'a str,
    target_language: &'a str,
    tone: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
    preserve_formatting: bool,
}

#[derive(Debug, Serialize)]
struct BatchBody<'a> {
    text: &'a str,
    source_language: &'a str,
    target_languages: &'a [String],
    tone: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
    preserve_formatting: bool,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translation: String,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    tokens_used: u32,
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    target_language: String,
    #[serde(default)]
    translation: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    tokens_used: u32,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<BatchItem>,
    #[serde(default)]
    total_tokens_used: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

fn decode_response<T: DeserializeOwned>(
    status: StatusCode,
    body: &str,
    retry_after_header: Option<u64>,
) -> Result<T> {
    if !status.is_success() {
        let err: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        return Err(map_service_error(status, &err, retry_after_header));
    }
    serde_json::from_str(body).map_err(|e| {
        Error::External(format!(
            "unexpected translation response: {e}: {}",
            body.chars().take(200).collect::<String>()
        ))
    })
}

fn detail_u64(details: Option<&serde_json::Value>, key: &str) -> Option<u64> {
    details.and_then(|d| d.get(key)).and_then(|v| v.as_u64())
}

fn map_service_error(
    status: StatusCode,
    err: &ErrorBody,
    retry_after_header: Option<u64>,
) -> Error {
    let code = err
        .code
        .clone()
        .unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
    let message = err
        .error
        .clone()
        .unwrap_or_else(|| format!("translation service returned {status}"));
    let reason = format!("[{code}] {message}");
    let details = err.details.as_ref();
    let retry_after = detail_u64(details, "retry_after")
        .or(retry_after_header)
        .map(Duration::from_secs);

    match code.as_str() {
        "LLM_RATE_LIMIT" | "LLM_UNAVAILABLE" | "LLM_TIMEOUT" => Error::Transient {
            reason,
            retry_after,
        },
        "TEXT_TOO_LONG" => ContentError::TooLong {
            len: detail_u64(details, "length").unwrap_or_default() as usize,
            max: detail_u64(details, "max_length").unwrap_or(MAX_INPUT_CHARS as u64) as usize,
        }
        .into(),
        "UNSUPPORTED_LANGUAGE" => {
            let language = details
                .and_then(|d| d.get("language"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            ContentError::UnsupportedLanguage(language).into()
        }
        "UNAUTHORIZED" | "INVALID_API_KEY" => Error::Config(reason),
        _ => match status {
            StatusCode::TOO_MANY_REQUESTS => Error::Transient {
                reason,
                retry_after,
            },
            s if s.is_server_error() => Error::Transient {
                reason,
                retry_after,
            },
            s if s.is_client_error() => Error::Validation(reason),
            _ => Error::External(reason),
        },
    }
}

fn batch_result(resp: BatchResponse) -> BatchTranslation {
    let mut out = BatchTranslation {
        total_tokens_used: resp.total_tokens_used,
        ..Default::default()
    };
    for item in resp.results {
        match (item.translation, item.error) {
            (Some(text), None) => out.translations.push(Translation {
                language: item.target_language,
                text,
                warnings: item.warnings,
                tokens_used: item.tokens_used,
            }),
            (_, error) => out.failures.push(LanguageFailure {
                language: item.target_language,
                reason: error.unwrap_or_else(|| "no translation returned".to_string()),
                retryable: true,
            }),
        }
    }
    out
}

#[async_trait]
impl Translator for TranslationClient {
    fn max_input_chars(&self) -> usize {
        MAX_INPUT_CHARS
    }

    fn max_batch_languages(&self) -> usize {
        MAX_BATCH_LANGUAGES
    }

    async fn translate(&self, req: &TranslationRequest) -> Result<Translation> {
        let body = TranslateBody {
            text: &req.text,
            source_language: &req.source_language,
            target_language: &req.target_language,
            tone: &self.tone,
            context: self.context(),
            preserve_formatting: true,
        };
        let resp: TranslateResponse = self.post("/translate", &body).await?;
        tracing::debug!(
            target_language = %req.target_language,
            tokens = resp.tokens_used,
            "translation received"
        );
        Ok(Translation {
            language: req.target_language.clone(),
            text: resp.translation,
            warnings: resp.warnings,
            tokens_used: resp.tokens_used,
        })
    }

    async fn translate_batch(&self, req: &BatchTranslationRequest) -> Result<BatchTranslation> {
        if req.target_languages.len() > MAX_BATCH_LANGUAGES {
            return Err(Error::Validation(format!(
                "{} target languages, batch limit is {MAX_BATCH_LANGUAGES}",
                req.target_languages.len()
            )));
        }
        let body = BatchBody {
            text: &req.text,
            source_language: &req.source_language,
            target_languages: &req.target_languages,
            tone: &self.tone,
            context: self.context(),
            preserve_formatting: true,
        };
        let resp: BatchResponse = self.post("/translate/batch", &body).await?;
        let out = batch_result(resp);
        tracing::debug!(
            translated = out.translations.len(),
            failed = out.failures.len(),
            tokens = out.total_tokens_used,
            "batch translation received"
        );
        Ok(out)
    }
}
