//! Telegram Bot Gateway adapter (HTTP).
//!
//! Implements the `chanpub-core` messaging port, the statistics providers and
//! the pending-update source over the gateway service's REST API. Gateway
//! error codes are mapped onto the core error taxonomy here so the engines
//! can tell retryable failures from terminal ones.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use chanpub_core::{
    discovery::BotEventPayload,
    domain::{BotPermissions, ChatId, MessageId, MessageRef},
    errors::Error,
    ports::{
        BotMembership, ChannelInfo, MembershipEvent, MessagingGateway, SendRequest, UpdateSource,
    },
    Result,
};

pub mod stats;

pub use stats::{DegradedStats, RichStats};

#[derive(Clone, Debug)]
pub struct GatewayClient {
    base_url: String,
    token: String,
    /// Forward idempotency keys as `Idempotency-Key`.
    idempotency: bool,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        idempotency: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("chanpub/0.1")
            .build()
            .map_err(|e| Error::Config(format!("gateway http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            idempotency,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let req = self.http.get(self.url(path)).query(query);
        self.execute(req).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<T> {
        let mut req = self.http.post(self.url(path)).json(body);
        if let Some(key) = idempotency_key.filter(|_| self.idempotency) {
            req = req.header("Idempotency-Key", key);
        }
        self.execute(req).await
    }

    async fn execute<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_transport)?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.map_err(map_transport)?;
        decode_body(status, &body, retry_after)
    }
}

fn map_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::transient(format!("gateway unreachable: {e}"))
    } else {
        Error::External(format!("gateway request error: {e}"))
    }
}

/// Error fields shared by every gateway response.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

fn default_success() -> bool {
    true
}

/// Decode a gateway response body into `T`, or map its error envelope.
pub fn decode_body<T: DeserializeOwned>(
    status: StatusCode,
    body: &str,
    retry_after_header: Option<u64>,
) -> Result<T> {
    let envelope: Envelope = serde_json::from_str(body).unwrap_or_default();
    if !status.is_success() || !envelope.success {
        return Err(map_gateway_error(status, &envelope, retry_after_header));
    }
    serde_json::from_str(body).map_err(|e| {
        Error::External(format!(
            "unexpected gateway response: {e}: {}",
            body.chars().take(200).collect::<String>()
        ))
    })
}

fn map_gateway_error(
    status: StatusCode,
    env: &Envelope,
    retry_after_header: Option<u64>,
) -> Error {
    let code = env.code.as_deref().unwrap_or("UNKNOWN_ERROR");
    let message = env
        .error
        .clone()
        .unwrap_or_else(|| format!("gateway returned {status}"));
    let reason = format!("[{code}] {message}");
    let retry_after = env
        .details
        .as_ref()
        .and_then(|d| d.get("retry_after"))
        .and_then(|v| v.as_u64())
        .or(retry_after_header)
        .map(Duration::from_secs);

    match code {
        "TELEGRAM_RATE_LIMIT" | "TELEGRAM_UNAVAILABLE" | "TIMEOUT" | "RATE_LIMITED" => {
            Error::Transient {
                reason,
                retry_after,
            }
        }
        "BOT_NOT_ADMIN" | "BOT_CANNOT_POST" | "BOT_NOT_MEMBER" | "UNAUTHORIZED" | "FORBIDDEN" => {
            Error::Permission(reason)
        }
        "IDEMPOTENCY_CONFLICT" => Error::Conflict(reason),
        "VALIDATION_ERROR" | "TELEGRAM_BAD_REQUEST" | "MESSAGE_NOT_FOUND" => {
            Error::Validation(reason)
        }
        c if c.starts_with("INVALID_") => Error::Validation(reason),
        _ => match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Error::Transient {
                reason,
                retry_after,
            },
            s if s.is_server_error() => Error::Transient {
                reason,
                retry_after,
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Permission(reason),
            s if s.is_client_error() => Error::Validation(reason),
            _ => Error::External(reason),
        },
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct Ack {}

#[derive(Debug, Deserialize)]
struct ChannelInfoResponse {
    title: Option<String>,
    username: Option<String>,
    #[serde(rename = "type")]
    chat_type: Option<String>,
    member_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PermissionsResponse {
    is_member: bool,
    is_admin: bool,
    can_post_messages: bool,
    can_edit_messages: bool,
    can_delete_messages: bool,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    updates: Vec<BotEventPayload>,
}

#[async_trait]
impl MessagingGateway for GatewayClient {
    async fn send(&self, req: &SendRequest, idempotency_key: Option<&str>) -> Result<MessageRef> {
        let body = serde_json::json!({
            "chat_id": req.chat_id.0,
            "text": req.html,
            "parse_mode": "HTML",
            "disable_web_page_preview": req.disable_web_page_preview,
            "disable_notification": req.disable_notification,
        });
        let resp: SendResponse = self.post("/messages/send", &body, idempotency_key).await?;
        let message_id = resp
            .message_id
            .ok_or_else(|| Error::External("gateway send returned no message_id".to_string()))?;
        Ok(MessageRef {
            chat_id: req.chat_id,
            message_id: MessageId(message_id),
        })
    }

    async fn edit(&self, msg: MessageRef, html: &str, idempotency_key: Option<&str>) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": msg.chat_id.0,
            "message_id": msg.message_id.0,
            "text": html,
            "parse_mode": "HTML",
        });
        let _: Ack = self.post("/messages/edit", &body, idempotency_key).await?;
        Ok(())
    }

    async fn delete(&self, msg: MessageRef) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": msg.chat_id.0,
            "message_id": msg.message_id.0,
        });
        let _: Ack = self.post("/messages/delete", &body, None).await?;
        Ok(())
    }

    async fn channel_info(&self, chat_id: ChatId) -> Result<ChannelInfo> {
        let r: ChannelInfoResponse = self
            .get("/channels/info", &[("chat_id", chat_id.0.to_string())])
            .await?;
        Ok(ChannelInfo {
            title: r.title,
            username: r.username,
            chat_type: r.chat_type,
            member_count: r.member_count,
        })
    }

    async fn permissions(&self, chat_id: ChatId) -> Result<BotMembership> {
        let r: PermissionsResponse = self
            .get("/channels/permissions", &[("chat_id", chat_id.0.to_string())])
            .await?;
        Ok(membership(r))
    }
}

fn membership(r: PermissionsResponse) -> BotMembership {
    BotMembership {
        is_member: r.is_member,
        is_admin: r.is_admin,
        permissions: BotPermissions {
            can_post: r.can_post_messages,
            can_edit: r.can_edit_messages,
            can_delete: r.can_delete_messages,
        },
    }
}

/// Pending membership events queued by the gateway.
#[derive(Clone, Debug)]
pub struct GatewayUpdates {
    client: GatewayClient,
}

impl GatewayUpdates {
    pub fn new(client: GatewayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpdateSource for GatewayUpdates {
    async fn fetch_pending(&self) -> Result<Vec<MembershipEvent>> {
        let r: UpdatesResponse = self.client.get("/bot/updates", &[]).await?;
        Ok(r.updates
            .into_iter()
            .filter_map(BotEventPayload::into_event)
            .collect())
    }
}
