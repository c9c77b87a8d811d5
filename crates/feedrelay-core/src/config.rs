//! Relay configuration
//!
//! Built once at startup: an optional TOML file, then `FEEDRELAY_*`
//! environment overrides, then validation. The resulting value is immutable
//! and shared by `Arc`.

use anyhow::Context;
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::chunker::TRANSPORT_HARD_LIMIT;
use crate::error::{RelayError, Result};
use crate::outbound::ChunkedSend;
use crate::retry::RetryPolicy;
use crate::routing::RoutingTable;

const ENV_PREFIX: &str = "FEEDRELAY_";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File holding the previously persisted transport credential.
    pub bot_token_file: Option<PathBuf>,
    pub session_name: String,
    pub data_dir: PathBuf,
    pub temp_dir: Option<PathBuf>,

    pub monitored_origins: Vec<String>,
    pub routing: HashMap<String, String>,
    pub default_destination: String,
    pub status_destination: Option<String>,

    pub processor_url: Option<String>,
    pub processor_api_key: Option<String>,

    pub max_document_mb: u64,
    pub request_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: f64,
    pub retry_backoff: f64,

    pub max_message_len: usize,
    pub chunk_send_delay_ms: u64,
    /// Ceiling on concurrently handled messages; unbounded when unset.
    pub max_in_flight: Option<usize>,

    pub status_interval_hours: u64,
    pub daily_summary_time: String,
    pub daily_summary_tz: String,

    pub feeds: Vec<FeedConfig>,
    pub apis: Vec<ApiConfig>,

    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_feed_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_api_interval")]
    pub poll_interval_secs: u64,
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// JSON pointer to the array of items, e.g. `/coins`. Empty means the
    /// response itself.
    #[serde(default)]
    pub items_pointer: String,
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    pub url_field: Option<String>,
}

fn default_feed_interval() -> u64 {
    15 * 60
}

fn default_api_interval() -> u64 {
    30 * 60
}

fn default_max_age_hours() -> u64 {
    24
}

fn default_api_key_header() -> String {
    "Authorization".to_string()
}

fn default_text_field() -> String {
    "text".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feedrelay");

        Self {
            bot_token_file: None,
            session_name: "feedrelay".to_string(),
            data_dir,
            temp_dir: None,
            monitored_origins: Vec::new(),
            routing: HashMap::new(),
            default_destination: String::new(),
            status_destination: None,
            processor_url: None,
            processor_api_key: None,
            max_document_mb: 50,
            request_timeout_secs: 60,
            retry_attempts: 3,
            retry_delay_secs: 2.0,
            retry_backoff: 2.0,
            max_message_len: crate::chunker::DEFAULT_MAX_LEN,
            chunk_send_delay_ms: 1_000,
            max_in_flight: None,
            status_interval_hours: 4,
            daily_summary_time: "09:00".to_string(),
            daily_summary_tz: "UTC".to_string(),
            feeds: Vec::new(),
            apis: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file plus the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config
            .apply_env(|key| std::env::var(key).ok())
            .context("Invalid environment override")?;
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config at {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RelayError::Validation(e.to_string()))
    }

    /// Override fields from `FEEDRELAY_*` variables resolved through `lookup`.
    ///
    /// Lists are comma separated; routing is `origin=destination,...`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = get("BOT_TOKEN_FILE") {
            self.bot_token_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SESSION_NAME") {
            self.session_name = v;
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("TEMP_DIR") {
            self.temp_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("MONITORED_ORIGINS") {
            self.monitored_origins = split_list(&v);
        }
        if let Some(v) = get("ROUTING") {
            self.routing = parse_routing(&v)?;
        }
        if let Some(v) = get("DEFAULT_DESTINATION") {
            self.default_destination = v;
        }
        if let Some(v) = get("STATUS_DESTINATION") {
            self.status_destination = Some(v);
        }
        if let Some(v) = get("PROCESSOR_URL") {
            self.processor_url = Some(v);
        }
        if let Some(v) = get("PROCESSOR_API_KEY") {
            self.processor_api_key = Some(v);
        }
        if let Some(v) = get("MAX_DOCUMENT_MB") {
            self.max_document_mb = parse_num("MAX_DOCUMENT_MB", &v)?;
        }
        if let Some(v) = get("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_num("REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("RETRY_ATTEMPTS") {
            self.retry_attempts = parse_num("RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RETRY_DELAY_SECS") {
            self.retry_delay_secs = parse_num("RETRY_DELAY_SECS", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF") {
            self.retry_backoff = parse_num("RETRY_BACKOFF", &v)?;
        }
        if let Some(v) = get("MAX_MESSAGE_LEN") {
            self.max_message_len = parse_num("MAX_MESSAGE_LEN", &v)?;
        }
        if let Some(v) = get("CHUNK_SEND_DELAY_MS") {
            self.chunk_send_delay_ms = parse_num("CHUNK_SEND_DELAY_MS", &v)?;
        }
        if let Some(v) = get("MAX_IN_FLIGHT") {
            self.max_in_flight = Some(parse_num("MAX_IN_FLIGHT", &v)?);
        }
        if let Some(v) = get("STATUS_INTERVAL_HOURS") {
            self.status_interval_hours = parse_num("STATUS_INTERVAL_HOURS", &v)?;
        }
        if let Some(v) = get("DAILY_SUMMARY_TIME") {
            self.daily_summary_time = v;
        }
        if let Some(v) = get("DAILY_SUMMARY_TZ") {
            self.daily_summary_tz = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }

        debug!("Applied environment overrides");
        Ok(())
    }

    /// Fail fast on anything that would only surface after connecting.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.default_destination.trim().is_empty() {
            errors.push("default_destination is required".to_string());
        }
        if self.session_name.trim().is_empty() {
            errors.push("session_name is required".to_string());
        }
        if self.max_message_len == 0 || self.max_message_len > TRANSPORT_HARD_LIMIT {
            errors.push(format!(
                "max_message_len must be between 1 and {}",
                TRANSPORT_HARD_LIMIT
            ));
        }
        if self.max_in_flight == Some(0) {
            errors.push("max_in_flight must be at least 1 when set".to_string());
        }
        if self.status_interval_hours == 0 {
            errors.push("status_interval_hours must be at least 1".to_string());
        }
        if let Err(e) = self.retry_policy() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.daily_time() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.daily_timezone() {
            errors.push(e.to_string());
        }
        if let Some(url) = &self.processor_url {
            check_url("processor_url", url, &mut errors);
            if self.processor_api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
                errors.push("processor_api_key is required when processor_url is set".to_string());
            }
        }
        for feed in &self.feeds {
            check_url(&format!("feed '{}'", feed.name), &feed.url, &mut errors);
            if feed.poll_interval_secs == 0 {
                errors.push(format!("feed '{}' poll interval must be positive", feed.name));
            }
        }
        for api in &self.apis {
            check_url(&format!("api '{}'", api.name), &api.url, &mut errors);
            if api.poll_interval_secs == 0 {
                errors.push(format!("api '{}' poll interval must be positive", api.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Validation(
                errors
                    .iter()
                    .map(|e| format!("\n  - {}", e))
                    .collect::<String>(),
            ))
        }
    }

    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::new(self.routing.clone(), self.default_destination.clone())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy<RelayError>> {
        if !self.retry_delay_secs.is_finite() || self.retry_delay_secs <= 0.0 {
            return Err(RelayError::Validation("retry_delay_secs must be positive".into()));
        }
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_secs_f64(self.retry_delay_secs),
            self.retry_backoff,
        )
    }

    pub fn chunking(&self) -> ChunkedSend {
        ChunkedSend {
            max_len: self.max_message_len,
            part_delay: Duration::from_millis(self.chunk_send_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_document_bytes(&self) -> u64 {
        self.max_document_mb.saturating_mul(1024 * 1024)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_hours.saturating_mul(3_600))
    }

    pub fn daily_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.daily_summary_time, "%H:%M").map_err(|e| {
            RelayError::Validation(format!(
                "daily_summary_time '{}' is not HH:MM: {}",
                self.daily_summary_time, e
            ))
        })
    }

    pub fn daily_timezone(&self) -> Result<Tz> {
        self.daily_summary_tz
            .parse()
            .map_err(|_| RelayError::Validation(format!("unknown timezone: {}", self.daily_summary_tz)))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.lock", self.session_name))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("temp"))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_routing(value: &str) -> Result<HashMap<String, String>> {
    let mut routes = HashMap::new();
    for entry in split_list(value) {
        let (origin, destination) = entry
            .split_once('=')
            .ok_or_else(|| RelayError::Validation(format!("routing entry '{}' is not origin=destination", entry)))?;
        routes.insert(origin.trim().to_string(), destination.trim().to_string());
    }
    Ok(routes)
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Validation(format!("{}{} has invalid value '{}'", ENV_PREFIX, name, value)))
}

fn check_url(what: &str, value: &str, errors: &mut Vec<String>) {
    match url::Url::parse(value) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
        Ok(u) => errors.push(format!("{} url has unsupported scheme '{}'", what, u.scheme())),
        Err(e) => errors.push(format!("{} url '{}' is invalid: {}", what, value, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn valid() -> Config {
        Config {
            default_destination: "@out".into(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_validate_once_destination_set() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_env_overrides() -> Result<()> {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("FEEDRELAY_DEFAULT_DESTINATION", "@defaultnotifs"),
            ("FEEDRELAY_MONITORED_ORIGINS", "-1001, -1002 ,"),
            ("FEEDRELAY_ROUTING", "-1001=@crypto,-1002=@equities"),
            ("FEEDRELAY_RETRY_ATTEMPTS", "5"),
            ("FEEDRELAY_MAX_IN_FLIGHT", "8"),
            ("FEEDRELAY_CHUNK_SEND_DELAY_MS", "250"),
            ("FEEDRELAY_STATUS_DESTINATION", ""),
        ]))?;

        assert_eq!(config.default_destination, "@defaultnotifs");
        assert_eq!(config.monitored_origins, vec!["-1001", "-1002"]);
        assert_eq!(config.routing_table().resolve("-1002"), "@equities");
        assert_eq!(config.routing_table().resolve("-9"), "@defaultnotifs");
        assert_eq!(config.retry_attempts, 5);
        assert_eq!(config.max_in_flight, Some(8));
        assert_eq!(config.chunking().part_delay, Duration::from_millis(250));
        assert!(config.status_destination.is_none());
        config.validate()
    }

    #[test]
    fn test_bad_env_number_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("FEEDRELAY_RETRY_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_bad_routing_entry_rejected() {
        let mut config = Config::default();
        assert!(config.apply_env(env(&[("FEEDRELAY_ROUTING", "-1001@crypto")])).is_err());
    }

    #[test]
    fn test_from_toml() -> Result<()> {
        let config = Config::from_toml_str(
            r#"
            default_destination = "@out"
            daily_summary_time = "18:30"
            daily_summary_tz = "Asia/Singapore"

            [routing]
            "-1001" = "@crypto"

            [[feeds]]
            name = "Example"
            url = "https://example.com/feed.json"

            [[apis]]
            name = "Trending"
            url = "https://api.example.com/trending"
            items_pointer = "/coins"
            text_field = "name"
            "#,
        )?;

        config.validate()?;
        assert_eq!(config.feeds[0].poll_interval_secs, 900);
        assert_eq!(config.apis[0].id_field, "id");
        assert_eq!(config.daily_time()?, NaiveTime::from_hms_opt(18, 30, 0).unwrap());
        assert_eq!(config.daily_timezone()?, chrono_tz::Asia::Singapore);
        Ok(())
    }

    #[test]
    fn test_validation_collects_errors() {
        let config = Config {
            max_message_len: 5000,
            retry_attempts: 0,
            daily_summary_tz: "Mars/Olympus".into(),
            processor_url: Some("ftp://nope".into()),
            ..valid()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("max_message_len"));
        assert!(msg.contains("max_attempts"));
        assert!(msg.contains("unknown timezone"));
        assert!(msg.contains("unsupported scheme"));
        assert!(msg.contains("processor_api_key"));
    }

    #[test]
    fn test_derived_paths() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/feedrelay"),
            session_name: "prod".into(),
            ..valid()
        };
        assert_eq!(config.lock_path(), PathBuf::from("/var/lib/feedrelay/prod.lock"));
        assert_eq!(config.temp_dir(), PathBuf::from("/var/lib/feedrelay/temp"));
        assert_eq!(config.max_document_bytes(), 50 * 1024 * 1024);
    }
}
