use config::{Config, ConfigError, File};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Source {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_source_table")]
    pub table: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
}

fn default_source_table() -> String {
    "bi.all_data_competitors_materialized".to_string()
}
fn default_key_column() -> String {
    "id".to_string()
}

impl Default for Source {
    fn default() -> Self {
        Self {
            url: String::new(),
            table: default_source_table(),
            key_column: default_key_column(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Sink {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_sink_table")]
    pub table: String,
    /// Create the sink table on start when it does not exist
    #[serde(default = "default_true")]
    pub create_table: bool,
}

fn default_sink_table() -> String {
    "analytics.all_data_competitors".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Sink {
    fn default() -> Self {
        Self {
            url: String::new(),
            table: default_sink_table(),
            create_table: default_true(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Connection {
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_max_retries() -> usize {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    2500 // first retry after 5s
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Transfer {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Sleep after every N batches
    #[serde(default = "default_throttle_every_batches")]
    pub throttle_every_batches: u64,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_error_log_dir")]
    pub error_log_dir: PathBuf,
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_batch_size() -> usize {
    50_000
}
fn default_throttle_every_batches() -> u64 {
    10
}
fn default_throttle_ms() -> u64 {
    100
}
fn default_error_log_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            throttle_every_batches: default_throttle_every_batches(),
            throttle_ms: default_throttle_ms(),
            error_log_dir: default_error_log_dir(),
            show_progress: default_true(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Enrichment {
    #[serde(default = "default_enrichment_table")]
    pub table: String,
    /// Maximum number of pending (chain, address, date) tuples per run
    #[serde(default = "default_selection_limit")]
    pub selection_limit: usize,
    /// Geocoding request budget per run
    #[serde(default)]
    pub max_requests: Option<u64>,
    /// Pause after each processed address
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
    /// Source column with a measured floor area, if the source has one
    #[serde(default)]
    pub area_column: Option<String>,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    /// Fixed seed for floor area draws (reproducible runs)
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_enrichment_table() -> String {
    "bi.store_characteristics".to_string()
}
fn default_selection_limit() -> usize {
    100
}
fn default_pause_ms() -> u64 {
    1000
}
fn default_country_code() -> String {
    "RU".to_string()
}

impl Default for Enrichment {
    fn default() -> Self {
        Self {
            table: default_enrichment_table(),
            selection_limit: default_selection_limit(),
            max_requests: None,
            pause_ms: default_pause_ms(),
            area_column: None,
            country_code: default_country_code(),
            random_seed: None,
            show_progress: default_true(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Geocoder {
    #[serde(default = "default_geocoder_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Appended to every address before it is sent
    #[serde(default = "default_country_suffix")]
    pub country_suffix: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_results")]
    pub results: u32,
    #[serde(default = "default_geocoder_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_geocoder_base_url() -> String {
    "https://geocode-maps.yandex.ru/1.x/".to_string()
}
fn default_country_suffix() -> String {
    "Россия".to_string()
}
fn default_lang() -> String {
    "ru_RU".to_string()
}
fn default_results() -> u32 {
    1
}
fn default_geocoder_timeout_secs() -> u64 {
    10
}
fn default_requests_per_second() -> u32 {
    5
}

impl Default for Geocoder {
    fn default() -> Self {
        Self {
            base_url: default_geocoder_base_url(),
            api_keys: Vec::new(),
            country_suffix: default_country_suffix(),
            lang: default_lang(),
            results: default_results(),
            timeout_secs: default_geocoder_timeout_secs(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub sink: Sink,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub transfer: Transfer,
    #[serde(default)]
    pub enrichment: Enrichment,
    #[serde(default)]
    pub geocoder: Geocoder,
}

impl Settings {
    /// Loads `Config.toml` from the working directory (if present) plus env overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("SYNC_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url.trim().to_string();
            }
        }
        if let Ok(url) = env::var("SYNC_SINK_URL") {
            if !url.trim().is_empty() {
                self.sink.url = url.trim().to_string();
            }
        }
        if let Ok(url) = env::var("SYNC_GEOCODER_BASE_URL") {
            if !url.trim().is_empty() {
                self.geocoder.base_url = url.trim().to_string();
            }
        }
        // Keys: JSON list or comma separated
        if let Ok(raw_keys) = env::var("SYNC_GEOCODER_API_KEYS") {
            if let Some(list) = parse_string_list(&raw_keys) {
                if !list.is_empty() {
                    self.geocoder.api_keys = list;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.url.trim().is_empty() {
            return Err(ConfigError::Message(
                "source.url is empty (set it in the config file or SYNC_SOURCE_URL)".into(),
            ));
        }
        if self.sink.url.trim().is_empty() {
            return Err(ConfigError::Message(
                "sink.url is empty (set it in the config file or SYNC_SINK_URL)".into(),
            ));
        }
        if self.transfer.batch_size == 0 {
            return Err(ConfigError::Message("transfer.batch_size must be > 0".into()));
        }
        // Table and column names end up inside SQL text
        let identifiers = [
            ("source.table", Some(&self.source.table)),
            ("source.key_column", Some(&self.source.key_column)),
            ("sink.table", Some(&self.sink.table)),
            ("enrichment.table", Some(&self.enrichment.table)),
            ("enrichment.area_column", self.enrichment.area_column.as_ref()),
        ];
        for (name, value) in identifiers {
            if let Some(value) = value {
                if !is_sql_identifier(value) {
                    return Err(ConfigError::Message(format!(
                        "{} '{}' is not a plain [schema.]name identifier",
                        name, value
                    )));
                }
            }
        }
        if self.geocoder.requests_per_second == 0 {
            return Err(ConfigError::Message(
                "geocoder.requests_per_second must be > 0".into(),
            ));
        }
        Ok(())
    }
}

static SQL_IDENTIFIER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").ok());

fn is_sql_identifier(value: &str) -> bool {
    SQL_IDENTIFIER
        .as_ref()
        .map_or(false, |re| re.is_match(value))
}

pub(crate) fn parse_string_list(input: &str) -> Option<Vec<String>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(vec![]);
    }

    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Some(v);
        }
        // Not valid JSON: strip the brackets and fall through to the comma split
        let without_brackets = trimmed.trim_start_matches('[').trim_end_matches(']');
        return Some(split_list(without_brackets));
    }

    Some(split_list(trimmed))
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
