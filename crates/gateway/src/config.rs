//! Gateway configuration, read once from the environment at start-up.

use crate::error::{GatewayError, Result};
use crate::keyspace::RecordClass;
use record_store::Backoff;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Name of the list-backed feed class.
pub const LIST_FEED_CLASS: &str = "feed";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    /// Store URLs, tried in order.
    pub redis_urls: Vec<String>,
    pub keyspace_db: u32,
    pub enable_keyspace_events: bool,
    pub record_classes: Vec<RecordClass>,
    /// Optional list-backed feed.
    pub feed_list_key: Option<String>,
    pub feed_list_max_len: usize,
    /// Default K for latest-records queries.
    pub latest_limit: usize,
    /// Upper bound on a caller-supplied K.
    pub max_latest_limit: usize,
    pub debounce_window: Duration,
    pub debounce_sweep_interval: Duration,
    pub keepalive_interval: Duration,
    pub reconnect: Backoff,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8082,
            metrics_port: 9093,
            redis_urls: vec!["redis://127.0.0.1:6379".to_string()],
            keyspace_db: 0,
            enable_keyspace_events: true,
            record_classes: vec![
                RecordClass::new("token", "token/"),
                RecordClass::new("transaction", "transaction/"),
            ],
            feed_list_key: None,
            feed_list_max_len: 500,
            latest_limit: 30,
            max_latest_limit: 500,
            debounce_window: Duration::from_millis(5000),
            debounce_sweep_interval: Duration::from_millis(60_000),
            keepalive_interval: Duration::from_secs(30),
            reconnect: Backoff::default(),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let http_port = match get("PORT") {
            Some(port) => parse("PORT", &port)?,
            None => parse_or(get("HTTP_PORT"), "HTTP_PORT", defaults.http_port)?,
        };

        let redis_urls = match get("REDIS_URLS") {
            Some(raw) => parse_list(&raw),
            None => defaults.redis_urls,
        };
        if redis_urls.is_empty() {
            return Err(GatewayError::Config("REDIS_URLS is empty".to_string()));
        }

        let record_classes = match get("RECORD_CLASSES") {
            Some(raw) => parse_classes(&raw)?,
            None => defaults.record_classes,
        };

        let latest_limit = parse_or(get("LATEST_LIMIT"), "LATEST_LIMIT", defaults.latest_limit)?;
        let max_latest_limit =
            parse_or(get("MAX_LATEST_LIMIT"), "MAX_LATEST_LIMIT", defaults.max_latest_limit)?;
        if latest_limit == 0 || latest_limit > max_latest_limit {
            return Err(GatewayError::Config(format!(
                "LATEST_LIMIT must be in 1..={}",
                max_latest_limit
            )));
        }

        let debounce_ms: u64 = parse_or(get("DEBOUNCE_WINDOW_MS"), "DEBOUNCE_WINDOW_MS", 5000)?;
        let sweep_ms: u64 = parse_or(get("DEBOUNCE_SWEEP_MS"), "DEBOUNCE_SWEEP_MS", 60_000)?;
        let keepalive_secs: u64 = parse_or(get("KEEPALIVE_SECS"), "KEEPALIVE_SECS", 30)?;
        if sweep_ms == 0 || keepalive_secs == 0 {
            return Err(GatewayError::Config(
                "DEBOUNCE_SWEEP_MS and KEEPALIVE_SECS must be positive".to_string(),
            ));
        }

        let reconnect = Backoff {
            initial_delay: Duration::from_millis(parse_or(
                get("RECONNECT_INITIAL_MS"),
                "RECONNECT_INITIAL_MS",
                1000u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                get("RECONNECT_MAX_MS"),
                "RECONNECT_MAX_MS",
                30_000u64,
            )?),
            max_attempts: parse_or(
                get("RECONNECT_MAX_ATTEMPTS"),
                "RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            )?,
        };

        Ok(Self {
            http_port,
            metrics_port: parse_or(get("METRICS_PORT"), "METRICS_PORT", defaults.metrics_port)?,
            redis_urls,
            keyspace_db: parse_or(get("KEYSPACE_DB"), "KEYSPACE_DB", defaults.keyspace_db)?,
            enable_keyspace_events: parse_or(
                get("ENABLE_KEYSPACE_EVENTS"),
                "ENABLE_KEYSPACE_EVENTS",
                defaults.enable_keyspace_events,
            )?,
            record_classes,
            feed_list_key: get("FEED_LIST_KEY"),
            feed_list_max_len: parse_or(
                get("FEED_LIST_MAX_LEN"),
                "FEED_LIST_MAX_LEN",
                defaults.feed_list_max_len,
            )?,
            latest_limit,
            max_latest_limit,
            debounce_window: Duration::from_millis(debounce_ms),
            debounce_sweep_interval: Duration::from_millis(sweep_ms),
            keepalive_interval: Duration::from_secs(keepalive_secs),
            reconnect,
        })
    }
}

fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{} has an invalid value: {:?}", name, raw)))
}

fn parse_or<T: FromStr>(raw: Option<String>, name: &str, default: T) -> Result<T> {
    match raw {
        Some(raw) => parse(name, &raw),
        None => Ok(default),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `name=prefix,name=prefix`
fn parse_classes(raw: &str) -> Result<Vec<RecordClass>> {
    let mut classes: Vec<RecordClass> = Vec::new();
    for item in parse_list(raw) {
        let (name, prefix) = item
            .split_once('=')
            .map(|(n, p)| (n.trim(), p.trim()))
            .filter(|(n, p)| !n.is_empty() && !p.is_empty())
            .ok_or_else(|| {
                GatewayError::Config(format!("RECORD_CLASSES entry {:?} is not name=prefix", item))
            })?;

        if let Some(reason) = crate::subscription::validate_channel(name) {
            return Err(GatewayError::Config(format!("class {:?}: {}", name, reason)));
        }
        if name == LIST_FEED_CLASS || classes.iter().any(|c| c.name == name) {
            return Err(GatewayError::Config(format!("class name {:?} is reserved or duplicated", name)));
        }
        classes.push(RecordClass::new(name, prefix));
    }

    if classes.is_empty() {
        return Err(GatewayError::Config("RECORD_CLASSES is empty".to_string()));
    }
    Ok(classes)
}
