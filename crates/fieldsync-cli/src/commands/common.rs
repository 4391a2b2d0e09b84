use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use fieldsync_core::api::ApiResponse;
use fieldsync_core::exchange::{ExchangeAck, ExchangeError};
use fieldsync_core::models::QueueItem;
use fieldsync_core::util::non_blank;
pub use fieldsync_core::util::unix_millis_now as now_millis;
use fieldsync_core::{CoreConfig, HttpServerExchange, ServerExchange, Store, SyncRuntime};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

/// Where the CLI keeps its data and which server it talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub server_url: Option<String>,
    pub api_token: Option<String>,
}

impl RuntimeOptions {
    pub fn resolve(
        db_path: Option<PathBuf>,
        config_path: Option<PathBuf>,
        server_url: Option<String>,
        api_token: Option<String>,
    ) -> Self {
        Self::resolve_with(db_path, config_path, server_url, api_token, |key| {
            env::var(key).ok()
        })
    }

    /// Command-line values win over the `FIELDSYNC_*` lookup, which wins over defaults.
    pub fn resolve_with(
        db_path: Option<PathBuf>,
        config_path: Option<PathBuf>,
        server_url: Option<String>,
        api_token: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let read = |key: &str| non_blank(lookup(key));
        Self {
            db_path: db_path
                .or_else(|| read("FIELDSYNC_DB_PATH").map(PathBuf::from))
                .unwrap_or_else(default_db_path),
            config_path: config_path
                .or_else(|| read("FIELDSYNC_CONFIG").map(PathBuf::from))
                .unwrap_or_else(default_config_path),
            server_url: non_blank(server_url).or_else(|| read("FIELDSYNC_SERVER_URL")),
            api_token: non_blank(api_token).or_else(|| read("FIELDSYNC_API_TOKEN")),
        }
    }
}

fn data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
}

pub fn default_db_path() -> PathBuf {
    data_root().join("fieldsync.db")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map_or_else(data_root, |dir| dir.join("fieldsync"))
        .join("config.json")
}

pub fn load_config(path: &Path) -> Result<CoreConfig, CliError> {
    let mut config = CoreConfig::load_from_path(path)?;
    config.apply_env_overrides()?;
    Ok(config)
}

/// Stands in for the server when none is configured; every submission fails transiently.
struct UnconfiguredExchange;

#[async_trait]
impl ServerExchange for UnconfiguredExchange {
    async fn submit(&self, _item: &QueueItem) -> Result<ExchangeAck, ExchangeError> {
        Err(ExchangeError::Transport(
            "no sync server configured".to_string(),
        ))
    }
}

pub fn open_runtime(options: &RuntimeOptions) -> Result<SyncRuntime, CliError> {
    let config = load_config(&options.config_path)?;
    let store = Store::open_path(&options.db_path)?;
    let exchange: Arc<dyn ServerExchange> = match &options.server_url {
        Some(url) => Arc::new(HttpServerExchange::new(
            url.clone(),
            options.api_token.clone(),
        )?),
        None => Arc::new(UnconfiguredExchange),
    };

    Ok(SyncRuntime::builder(config)
        .store(store)
        .exchange(exchange)
        .build()?)
}

/// Print a response envelope, or its rendered lines, and surface its failure.
pub fn emit<T: Serialize>(
    response: ApiResponse<T>,
    as_json: bool,
    render: impl FnOnce(&T) -> Vec<String>,
) -> Result<(), CliError> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    let data = response_data(response)?;
    if !as_json {
        for line in render(&data) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn response_data<T>(response: ApiResponse<T>) -> Result<T, CliError> {
    match response.data {
        Some(data) if response.success => Ok(data),
        _ => Err(CliError::Api {
            code: response.error_code.unwrap_or("UNKNOWN"),
            message: response
                .error
                .unwrap_or_else(|| "empty response".to_string()),
        }),
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn parse_id<T: FromStr>(kind: &'static str, value: &str) -> Result<T, CliError> {
    value.trim().parse().map_err(|_| CliError::InvalidId {
        kind,
        value: value.to_string(),
    })
}

pub fn parse_json(field: &'static str, raw: &str) -> Result<Value, CliError> {
    serde_json::from_str(raw).map_err(|error| CliError::InvalidJson {
        field,
        reason: error.to_string(),
    })
}

pub fn parse_optional_json(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<Value>, CliError> {
    raw.map(|raw| parse_json(field, raw)).transpose()
}

/// JSON when the text parses as JSON, otherwise the text itself
pub fn json_or_text(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(non_blank(Some(buffer)))
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
