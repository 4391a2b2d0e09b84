//! JSON-over-HTTP server exchange.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ExchangeAck, ExchangeError, ServerExchange};
use crate::error::{Error, Result};
use crate::models::QueueItem;
use crate::util::{excerpt, is_http_url, non_blank};

/// Posts mutations to `{base}/v1/mutations`
#[derive(Clone)]
pub struct HttpServerExchange {
    endpoint: String,
    api_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpServerExchange {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpServerExchange")
            .field("endpoint", &self.endpoint)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpServerExchange {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Result<Self> {
        let endpoint = mutation_endpoint(base_url.into())?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Config(format!("HTTP client: {error}")))?;
        Ok(Self {
            endpoint,
            api_token: non_blank(api_token),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ServerExchange for HttpServerExchange {
    async fn submit(&self, item: &QueueItem) -> std::result::Result<ExchangeAck, ExchangeError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(&MutationBody::from(item));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                ExchangeError::Timeout
            } else {
                ExchangeError::Transport(error.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        interpret_response(status, &body)
    }
}

#[derive(Debug, Serialize)]
struct MutationBody<'a> {
    mutation_id: String,
    entity_type: &'static str,
    entity_id: &'a str,
    action: &'static str,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved_conflict_id: Option<String>,
}

impl<'a> From<&'a QueueItem> for MutationBody<'a> {
    fn from(item: &'a QueueItem) -> Self {
        Self {
            mutation_id: item.id.as_str(),
            entity_type: item.entity_type().as_str(),
            entity_id: &item.entity_id,
            action: item.action.as_str(),
            data: item.local_snapshot(),
            resolved_conflict_id: item.conflict_id.map(|id| id.as_str()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AckBody {
    server_updated_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    server_version: Value,
    server_updated_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn interpret_response(
    status: StatusCode,
    body: &str,
) -> std::result::Result<ExchangeAck, ExchangeError> {
    if status.is_success() {
        let ack = serde_json::from_str::<AckBody>(body).unwrap_or_default();
        return Ok(ExchangeAck {
            server_modified_at: ack.server_updated_at.as_ref().and_then(parse_timestamp),
        });
    }

    if status == StatusCode::CONFLICT {
        return match serde_json::from_str::<ConflictBody>(body) {
            Ok(conflict) => Err(ExchangeError::VersionConflict {
                server_modified_at: conflict.server_updated_at.as_ref().and_then(parse_timestamp),
                server_version: conflict.server_version,
            }),
            Err(error) => Err(ExchangeError::Transport(format!(
                "unreadable conflict response: {error}"
            ))),
        };
    }

    Err(ExchangeError::Transport(parse_api_error(status, body)))
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => chrono::DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|at| at.timestamp_millis()),
        _ => None,
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", excerpt(trimmed, 180), status.as_u16())
    }
}

fn mutation_endpoint(raw: String) -> Result<String> {
    let base = non_blank(Some(raw))
        .ok_or_else(|| Error::Config("server URL must not be empty".to_string()))?;
    if !is_http_url(&base) {
        return Err(Error::Config(
            "server URL must include http:// or https://".to_string(),
        ));
    }
    Ok(format!("{}/v1/mutations", base.trim_end_matches('/')))
}
