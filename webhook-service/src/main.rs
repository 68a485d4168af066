// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use lambda_http::run as lambda_run;
use scoreboard_common::{
    Command, NO_REGISTERED_USERS, NO_SCORES_YET, REGISTER_FIRST, REGISTER_NAME_REQUIRED,
    ReplyMessageRequest, SCORE_OUT_OF_RANGE, UserRecord, WebhookEvent, WebhookRequest,
    format_ranking, parse_command, registered_reply, total_reply,
};
use sha2::Sha256;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const SIGNATURE_HEADER: &str = "x-line-signature";
const MAX_APPEND_ATTEMPTS: usize = 5;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
struct AppState {
    interpreter: CommandInterpreter,
    replies: Arc<dyn ReplySender>,
    channel_secret: String,
}

impl AppState {
    async fn from_env() -> anyhow::Result<Self> {
        let channel_secret =
            std::env::var("CHANNEL_SECRET").context("CHANNEL_SECRET must be set")?;

        let ledger: Arc<dyn LedgerStore> = match DynamoLedgerStore::from_env().await {
            Some(store) => Arc::new(store),
            None => {
                warn!("DYNAMODB_ENDPOINT/AWS_REGION not set; keeping score ledger in memory");
                Arc::new(InMemoryLedgerStore::default())
            }
        };

        Ok(Self {
            interpreter: CommandInterpreter::new(ledger),
            replies: Arc::new(LineReplyClient::from_env()?),
            channel_secret,
        })
    }
}

/// Conditional append of one score.
///
/// The write only lands while the stored record is registered and still has
/// `expected_len` scores; otherwise the store reports a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScoreAppend {
    expected_len: usize,
    delta: i64,
    new_total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppendOutcome {
    Applied,
    Conflict,
}

#[async_trait]
trait LedgerStore: Send + Sync {
    async fn get(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>>;

    /// Upsert the name, leaving any scores untouched.
    async fn set_name(&self, user_id: &str, name: &str) -> anyhow::Result<()>;

    async fn append_score(
        &self,
        user_id: &str,
        append: ScoreAppend,
    ) -> anyhow::Result<AppendOutcome>;

    async fn list_all(&self) -> anyhow::Result<Vec<UserRecord>>;
}

#[derive(Clone)]
struct DynamoLedgerStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoLedgerStore {
    async fn from_env() -> Option<Self> {
        if std::env::var("DYNAMODB_ENDPOINT").is_err() && std::env::var("AWS_REGION").is_err() {
            return None;
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let table_name = std::env::var("USERS_TABLE")
            .ok()
            .unwrap_or_else(|| "users".to_string());

        info!(table_name = %table_name, "DynamoDB score ledger enabled");
        Some(Self {
            client: DynamoClient::new(&config),
            table_name,
        })
    }

    fn key(user_id: &str) -> AttributeValue {
        AttributeValue::S(user_id.to_string())
    }
}

#[async_trait]
impl LedgerStore for DynamoLedgerStore {
    async fn get(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("user_id", Self::key(user_id))
            .consistent_read(true)
            .send()
            .await
            .context("failed to get user record")?;

        output.item().map(record_from_item).transpose()
    }

    async fn set_name(&self, user_id: &str, name: &str) -> anyhow::Result<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("user_id", Self::key(user_id))
            .update_expression("SET #name = :name")
            .expression_attribute_names("#name", "name")
            .expression_attribute_values(":name", AttributeValue::S(name.to_string()))
            .send()
            .await
            .context("failed to update user name")?;
        Ok(())
    }

    async fn append_score(
        &self,
        user_id: &str,
        append: ScoreAppend,
    ) -> anyhow::Result<AppendOutcome> {
        let condition = if append.expected_len == 0 {
            "attribute_exists(#name) AND (attribute_not_exists(scores) OR size(scores) = :expected_len)"
        } else {
            "attribute_exists(#name) AND size(scores) = :expected_len"
        };

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("user_id", Self::key(user_id))
            .update_expression(
                "SET scores = list_append(if_not_exists(scores, :empty), :delta), #total = :total",
            )
            .condition_expression(condition)
            .expression_attribute_names("#name", "name")
            .expression_attribute_names("#total", "total")
            .expression_attribute_values(":empty", AttributeValue::L(Vec::new()))
            .expression_attribute_values(
                ":delta",
                AttributeValue::L(vec![AttributeValue::N(append.delta.to_string())]),
            )
            .expression_attribute_values(":total", AttributeValue::N(append.new_total.to_string()))
            .expression_attribute_values(
                ":expected_len",
                AttributeValue::N(append.expected_len.to_string()),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(AppendOutcome::Applied),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_conditional_check_failed_exception()) =>
            {
                Ok(AppendOutcome::Conflict)
            }
            Err(error) => Err(anyhow::Error::new(error).context("failed to append score")),
        }
    }

    async fn list_all(&self) -> anyhow::Result<Vec<UserRecord>> {
        let mut records = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .consistent_read(true)
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .context("failed to scan user records")?;

            for item in output.items() {
                records.push(record_from_item(item)?);
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(records)
    }
}

fn record_from_item(item: &HashMap<String, AttributeValue>) -> anyhow::Result<UserRecord> {
    let user_id = match item.get("user_id") {
        Some(AttributeValue::S(value)) => value.clone(),
        other => anyhow::bail!("user record has invalid user_id: {other:?}"),
    };

    let name = match item.get("name") {
        None | Some(AttributeValue::Null(_)) => None,
        Some(AttributeValue::S(value)) => Some(value.clone()),
        Some(other) => anyhow::bail!("user record {user_id} has invalid name: {other:?}"),
    };

    let scores = match item.get("scores") {
        None | Some(AttributeValue::Null(_)) => Vec::new(),
        Some(AttributeValue::L(values)) => values
            .iter()
            .map(number_from_attribute)
            .collect::<anyhow::Result<Vec<_>>>()
            .with_context(|| format!("user record {user_id} has invalid scores"))?,
        Some(other) => anyhow::bail!("user record {user_id} has invalid scores: {other:?}"),
    };

    let total = match item.get("total") {
        None | Some(AttributeValue::Null(_)) => 0,
        Some(value) => number_from_attribute(value)
            .with_context(|| format!("user record {user_id} has invalid total"))?,
    };

    Ok(UserRecord {
        user_id,
        name,
        scores,
        total,
    })
}

fn number_from_attribute(value: &AttributeValue) -> anyhow::Result<i64> {
    match value {
        AttributeValue::N(number) => number
            .parse()
            .with_context(|| format!("number {number} does not fit in i64")),
        other => anyhow::bail!("expected number attribute, got {other:?}"),
    }
}

/// Process-local ledger, used when no DynamoDB table is configured.
#[derive(Default)]
struct InMemoryLedgerStore {
    records: Mutex<Vec<UserRecord>>,
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.user_id == user_id).cloned())
    }

    async fn set_name(&self, user_id: &str, name: &str) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|r| r.user_id == user_id) {
            Some(record) => record.name = Some(name.to_string()),
            None => records.push(UserRecord {
                name: Some(name.to_string()),
                ..UserRecord::new(user_id)
            }),
        }
        Ok(())
    }

    async fn append_score(
        &self,
        user_id: &str,
        append: ScoreAppend,
    ) -> anyhow::Result<AppendOutcome> {
        let mut records = self.records.lock().await;
        let Some(record) = records
            .iter_mut()
            .find(|r| r.user_id == user_id && r.registered_name().is_some())
        else {
            return Ok(AppendOutcome::Conflict);
        };
        if record.scores.len() != append.expected_len {
            return Ok(AppendOutcome::Conflict);
        }

        record.scores.push(append.delta);
        record.total = append.new_total;
        Ok(AppendOutcome::Applied)
    }

    async fn list_all(&self) -> anyhow::Result<Vec<UserRecord>> {
        Ok(self.records.lock().await.clone())
    }
}

#[async_trait]
trait ReplySender: Send + Sync {
    async fn reply(&self, reply_token: &str, text: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct LineReplyClient {
    client: reqwest::Client,
    api_base_url: String,
    channel_access_token: String,
}

impl LineReplyClient {
    fn from_env() -> anyhow::Result<Self> {
        let channel_access_token = std::env::var("CHANNEL_ACCESS_TOKEN")
            .context("CHANNEL_ACCESS_TOKEN must be set")?;
        let api_base_url = std::env::var("LINE_API_BASE_URL")
            .ok()
            .unwrap_or_else(|| "https://api.line.me".to_string());
        Ok(Self {
            client: reqwest::Client::new(),
            api_base_url,
            channel_access_token,
        })
    }
}

#[async_trait]
impl ReplySender for LineReplyClient {
    async fn reply(&self, reply_token: &str, text: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}/v2/bot/message/reply",
            self.api_base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.channel_access_token)
            .json(&ReplyMessageRequest::text(reply_token, text))
            .send()
            .await
            .context("LINE reply request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LINE reply returned {status}: {body}");
        }
        Ok(())
    }
}

/// Runs parsed commands against the score ledger and produces reply text.
#[derive(Clone)]
struct CommandInterpreter {
    ledger: Arc<dyn LedgerStore>,
}

impl CommandInterpreter {
    fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// `Ok(None)` means the message gets no reply.
    async fn execute(&self, user_id: &str, command: Command) -> anyhow::Result<Option<String>> {
        match command {
            Command::Register { name } => self.register(user_id, &name).await.map(Some),
            Command::ScoreSubmission { delta } => self.submit_score(user_id, delta).await.map(Some),
            Command::Ranking => self.ranking().await.map(Some),
            Command::Ignore => Ok(None),
        }
    }

    async fn register(&self, user_id: &str, name: &str) -> anyhow::Result<String> {
        if name.is_empty() {
            return Ok(REGISTER_NAME_REQUIRED.to_string());
        }

        self.ledger.set_name(user_id, name).await?;
        info!(user_id = %user_id, name = %name, "user registered");
        Ok(registered_reply(name))
    }

    async fn submit_score(&self, user_id: &str, delta: i64) -> anyhow::Result<String> {
        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let Some(record) = self.ledger.get(user_id).await? else {
                return Ok(REGISTER_FIRST.to_string());
            };
            let Some(name) = record.registered_name() else {
                return Ok(REGISTER_FIRST.to_string());
            };
            let Some(new_total) = record.total.checked_add(delta) else {
                warn!(user_id = %user_id, total = record.total, delta, "score rejected: total out of range");
                return Ok(SCORE_OUT_OF_RANGE.to_string());
            };

            let append = ScoreAppend {
                expected_len: record.scores.len(),
                delta,
                new_total,
            };
            match self.ledger.append_score(user_id, append).await? {
                AppendOutcome::Applied => {
                    info!(user_id = %user_id, delta, total = new_total, "score recorded");
                    return Ok(total_reply(name, new_total));
                }
                AppendOutcome::Conflict => {
                    debug!(user_id = %user_id, attempt, "score append raced another write; retrying");
                }
            }
        }

        anyhow::bail!("score append for {user_id} conflicted {MAX_APPEND_ATTEMPTS} times")
    }

    async fn ranking(&self) -> anyhow::Result<String> {
        let records = self.ledger.list_all().await?;
        if records.is_empty() {
            return Ok(NO_SCORES_YET.to_string());
        }
        Ok(format_ranking(&records).unwrap_or_else(|| NO_REGISTERED_USERS.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "webhook_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env().await?;

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running webhook-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = resolve_bind_addr()?;
    info!(%bind_addr, "webhook-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Hosting platforms hand out the port through `PORT`; it wins over the
/// explicit bind address.
fn resolve_bind_addr() -> anyhow::Result<SocketAddr> {
    if let Ok(port) = std::env::var("PORT") {
        return format!("0.0.0.0:{port}").parse().context("invalid PORT");
    }
    parse_bind_addr("WEBHOOK_SERVICE_BIND", "0.0.0.0:3000")
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "webhook-service"}))
}

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing X-Line-Signature header"))?;
    if !verify_signature(&state.channel_secret, &body, signature) {
        return Err(ApiError::unauthorized("signature validation failed"));
    }

    let request: WebhookRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid webhook body: {e}")))?;

    for event in &request.events {
        handle_event(&state, event).await;
    }

    Ok(StatusCode::OK)
}

/// Failures stay scoped to the event: they are logged and the delivery is
/// still acknowledged, so a redelivery cannot re-apply earlier scores.
async fn handle_event(state: &AppState, event: &WebhookEvent) {
    let Some(text) = event.text_message() else {
        debug!(event_type = %event.event_type, "skipping non-text event");
        return;
    };
    let (Some(user_id), Some(reply_token)) = (event.user_id(), event.reply_token.as_deref())
    else {
        warn!("text message without userId or replyToken; skipping");
        return;
    };

    let command = parse_command(text);
    let reply = match state.interpreter.execute(user_id, command).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return,
        Err(error) => {
            warn!(user_id = %user_id, error = %format!("{error:#}"), "failed to process message event");
            return;
        }
    };

    if let Err(error) = state.replies.reply(reply_token, &reply).await {
        warn!(user_id = %user_id, error = %format!("{error:#}"), "failed to send reply");
    }
}

fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
