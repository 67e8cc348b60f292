use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/pmu-forwarder/config.json";

fn config_path() -> PathBuf {
    if let Ok(path) = env::var("PMU_FORWARDER_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    destination_addr: Option<String>,
    #[serde(default)]
    mongo_uri: Option<String>,
    #[serde(default)]
    mongo_database: Option<String>,
    #[serde(default)]
    mongo_collection: Option<String>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    max_inflight_sends: Option<usize>,
}

fn load_overrides() -> Option<ConfigOverrides> {
    let path = config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read config file; using env defaults");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(overrides) => Some(overrides),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to parse config file; using env defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub destination_addr: String,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub mongo_collection: String,
    pub poll_interval_ms: u64,
    pub max_inflight_sends: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let destination_addr =
            env_string("PMU_DESTINATION_ADDR", Some("127.0.0.1:4410".to_string()))?;
        let mongo_uri = env_string(
            "PMU_MONGO_URI",
            Some("mongodb://127.0.0.1:27017".to_string()),
        )?;
        let mongo_database = env_string("PMU_MONGO_DATABASE", Some("upmu_database".to_string()))?;
        let mongo_collection =
            env_string("PMU_MONGO_COLLECTION", Some("received_files".to_string()))?;
        let poll_interval_ms = env_u64("PMU_POLL_INTERVAL_MS", Some(1000))?;
        let max_inflight_sends = env_u64("PMU_MAX_INFLIGHT_SENDS", Some(64))? as usize;
        if max_inflight_sends == 0 {
            return Err(anyhow!("PMU_MAX_INFLIGHT_SENDS must be at least 1"));
        }

        let mut config = Self {
            destination_addr,
            mongo_uri,
            mongo_database,
            mongo_collection,
            poll_interval_ms,
            max_inflight_sends,
        };
        if let Some(overrides) = load_overrides() {
            config.apply(&overrides);
        }
        Ok(config)
    }

    /// Env vars win over the config file; only unset keys take overrides.
    fn apply(&mut self, overrides: &ConfigOverrides) {
        let env_allows = |key: &str| {
            env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .is_none()
        };

        if env_allows("PMU_DESTINATION_ADDR") {
            if let Some(addr) = overrides
                .destination_addr
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                self.destination_addr = addr.to_string();
            }
        }
        if env_allows("PMU_MONGO_URI") {
            if let Some(uri) = overrides
                .mongo_uri
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                self.mongo_uri = uri.to_string();
            }
        }
        if env_allows("PMU_MONGO_DATABASE") {
            if let Some(database) = overrides
                .mongo_database
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                self.mongo_database = database.to_string();
            }
        }
        if env_allows("PMU_MONGO_COLLECTION") {
            if let Some(collection) = overrides
                .mongo_collection
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                self.mongo_collection = collection.to_string();
            }
        }
        if env_allows("PMU_POLL_INTERVAL_MS") {
            if let Some(value) = overrides.poll_interval_ms.filter(|v| *v != 0) {
                self.poll_interval_ms = value;
            }
        }
        if env_allows("PMU_MAX_INFLIGHT_SENDS") {
            if let Some(value) = overrides.max_inflight_sends.filter(|v| *v != 0) {
                self.max_inflight_sends = value;
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}
