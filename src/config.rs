//! Application configuration.
//!
//! Settings come from an optional JSON file and from environment variables,
//! the latter taking precedence:
//! - `DRIFTNET_VENUE`: registered venue name (default `binance`)
//! - `DRIFTNET_ENDPOINT`: overrides the venue's stream endpoint
//! - `DRIFTNET_SYMBOLS`: comma-separated symbol list
//! - `DRIFTNET_UPDATE_INTERVAL_MS`, `DRIFTNET_MAX_RETRIES`,
//!   `DRIFTNET_RETRY_DELAY_MS`, `DRIFTNET_MAX_RETRY_DELAY_MS`,
//!   `DRIFTNET_JITTER`, `DRIFTNET_CACHE_SIZE`: collector tuning
//! - `DRIFTNET_STORAGE`: `memory`, `ttl` or `postgres`
//! - `DRIFTNET_STORAGE_CAPACITY`, `DRIFTNET_TTL_SECS`: bounded backends
//! - `DATABASE_URL`: required by the `postgres` backend

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::collector::CollectorConfig;
use crate::storage::{DEFAULT_CAPACITY, MemoryStorage, PostgresStorage, StorageGateway, TtlStorage};
use crate::{DriftnetError, Result};

/// Which [`StorageGateway`] implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Ttl,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = DriftnetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "ttl" => Ok(Self::Ttl),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(DriftnetError::Config(format!(
                "unknown storage backend {other:?}, expected memory, ttl or postgres"
            ))),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Ttl => "ttl",
            Self::Postgres => "postgres",
        })
    }
}

/// Storage backend selection and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Trades kept per symbol by the bounded backends.
    pub capacity: usize,
    pub ttl: Duration,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            capacity: DEFAULT_CAPACITY,
            ttl: crate::storage::DEFAULT_TTL,
            database_url: None,
            max_connections: 10,
        }
    }
}

impl StorageSettings {
    /// Builds the configured backend. The caller connects it.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Config`] if the `postgres` backend has no database URL.
    pub fn build(&self) -> Result<Arc<dyn StorageGateway>> {
        let storage: Arc<dyn StorageGateway> = match self.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new(self.capacity)),
            StorageBackend::Ttl => Arc::new(TtlStorage::new(self.ttl, self.capacity)),
            StorageBackend::Postgres => {
                let url = self.database_url.as_deref().ok_or_else(|| {
                    DriftnetError::Config("postgres storage requires DATABASE_URL".to_string())
                })?;
                Arc::new(PostgresStorage::new(url).with_max_connections(self.max_connections))
            }
        };
        Ok(storage)
    }

    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(DriftnetError::Config("storage capacity must be at least 1".into()));
        }
        if self.backend == StorageBackend::Ttl && self.ttl.is_zero() {
            return Err(DriftnetError::Config("ttl must be non-zero".into()));
        }
        if self.backend == StorageBackend::Postgres && self.database_url.is_none() {
            return Err(DriftnetError::Config(
                "postgres storage requires DATABASE_URL".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    pub collector: CollectorConfig,
    pub storage: StorageSettings,
}

/// On-disk form. Every field is optional; missing ones keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    venue: Option<String>,
    endpoint: Option<String>,
    symbols: Option<Vec<String>>,
    update_interval_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    max_retry_delay_ms: Option<u64>,
    jitter: Option<bool>,
    cache_size: Option<usize>,
    connect_timeout_ms: Option<u64>,
    subscribe_timeout_ms: Option<u64>,
    receive_timeout_ms: Option<u64>,
    storage_timeout_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
    max_decode_failures: Option<u32>,
    #[serde(default)]
    storage: FileStorage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStorage {
    backend: Option<StorageBackend>,
    capacity: Option<usize>,
    ttl_secs: Option<u64>,
    database_url: Option<String>,
    max_connections: Option<u32>,
}

impl AppConfig {
    /// Loads a JSON configuration file, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`DriftnetError::Config`] if the file cannot be read or any
    /// value is invalid, [`DriftnetError::Decode`] if it is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DriftnetError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let file: FileConfig = serde_json::from_str(&contents)?;

        let mut config = Self::default();
        config.apply_file(file);
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks collector and storage settings together.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Config`] naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.collector.validate()?;
        self.storage.validate()
    }

    fn apply_file(&mut self, file: FileConfig) {
        let c = &mut self.collector;
        let ms = Duration::from_millis;

        if let Some(venue) = file.venue {
            c.venue = venue;
        }
        if file.endpoint.is_some() {
            c.endpoint = file.endpoint;
        }
        if let Some(symbols) = file.symbols {
            c.symbols = symbols;
        }
        c.update_interval = file.update_interval_ms.map_or(c.update_interval, ms);
        c.max_retries = file.max_retries.unwrap_or(c.max_retries);
        c.retry_delay = file.retry_delay_ms.map_or(c.retry_delay, ms);
        c.max_retry_delay = file.max_retry_delay_ms.map_or(c.max_retry_delay, ms);
        c.jitter = file.jitter.unwrap_or(c.jitter);
        c.cache_size = file.cache_size.unwrap_or(c.cache_size);
        c.connect_timeout = file.connect_timeout_ms.map_or(c.connect_timeout, ms);
        c.subscribe_timeout = file.subscribe_timeout_ms.map_or(c.subscribe_timeout, ms);
        c.receive_timeout = file.receive_timeout_ms.map_or(c.receive_timeout, ms);
        c.storage_timeout = file.storage_timeout_ms.map_or(c.storage_timeout, ms);
        c.stop_grace = file.stop_grace_ms.map_or(c.stop_grace, ms);
        c.max_decode_failures = file.max_decode_failures.unwrap_or(c.max_decode_failures);

        let s = &mut self.storage;
        let storage = file.storage;
        s.backend = storage.backend.unwrap_or(s.backend);
        s.capacity = storage.capacity.unwrap_or(s.capacity);
        s.ttl = storage.ttl_secs.map_or(s.ttl, Duration::from_secs);
        if storage.database_url.is_some() {
            s.database_url = storage.database_url;
        }
        s.max_connections = storage.max_connections.unwrap_or(s.max_connections);
    }

    fn apply_env(&mut self) -> Result<()> {
        let c = &mut self.collector;
        if let Some(venue) = non_empty_var("DRIFTNET_VENUE") {
            c.venue = venue;
        }
        if let Some(endpoint) = non_empty_var("DRIFTNET_ENDPOINT") {
            c.endpoint = Some(endpoint);
        }
        if let Some(symbols) = non_empty_var("DRIFTNET_SYMBOLS") {
            c.symbols = symbols.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = parse_var::<u64>("DRIFTNET_UPDATE_INTERVAL_MS")? {
            c.update_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var("DRIFTNET_MAX_RETRIES")? {
            c.max_retries = v;
        }
        if let Some(v) = parse_var::<u64>("DRIFTNET_RETRY_DELAY_MS")? {
            c.retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>("DRIFTNET_MAX_RETRY_DELAY_MS")? {
            c.max_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var("DRIFTNET_JITTER")? {
            c.jitter = v;
        }
        if let Some(v) = parse_var("DRIFTNET_CACHE_SIZE")? {
            c.cache_size = v;
        }

        let s = &mut self.storage;
        if let Some(backend) = parse_var("DRIFTNET_STORAGE")? {
            s.backend = backend;
        }
        if let Some(v) = parse_var("DRIFTNET_STORAGE_CAPACITY")? {
            s.capacity = v;
        }
        if let Some(v) = parse_var::<u64>("DRIFTNET_TTL_SECS")? {
            s.ttl = Duration::from_secs(v);
        }
        if let Some(url) = non_empty_var("DATABASE_URL") {
            s.database_url = Some(url);
        }
        Ok(())
    }
}

/// Loads the application configuration from environment variables alone.
///
/// # Errors
///
/// Returns [`DriftnetError::Config`] if a variable cannot be parsed or the
/// resulting configuration is invalid (for instance no symbols).
pub fn fetch_config() -> Result<AppConfig> {
    let mut config = AppConfig::default();
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Parses a non-empty environment variable.
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    non_empty_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| DriftnetError::Config(format!("{name}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Mutex, PoisonError};

    use super::*;

    const VARS: &[&str] = &[
        "DRIFTNET_VENUE",
        "DRIFTNET_ENDPOINT",
        "DRIFTNET_SYMBOLS",
        "DRIFTNET_UPDATE_INTERVAL_MS",
        "DRIFTNET_MAX_RETRIES",
        "DRIFTNET_RETRY_DELAY_MS",
        "DRIFTNET_MAX_RETRY_DELAY_MS",
        "DRIFTNET_JITTER",
        "DRIFTNET_CACHE_SIZE",
        "DRIFTNET_STORAGE",
        "DRIFTNET_STORAGE_CAPACITY",
        "DRIFTNET_TTL_SECS",
        "DATABASE_URL",
    ];

    /// Serializes tests that touch the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Helper that temporarily sets env vars, runs `f`, then restores originals.
    /// Every variable the loader reads and `vars` does not mention is cleared.
    ///
    /// # Safety
    ///
    /// Holds [`ENV_LOCK`] throughout; nothing else in the crate reads these
    /// variables.
    fn with_env<F: FnOnce()>(vars: &[(&str, Option<&str>)], f: F) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let originals: Vec<(&str, Option<String>)> = VARS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        for k in VARS {
            let value = vars.iter().find(|(name, _)| name == k).and_then(|(_, v)| *v);
            // SAFETY: ENV_LOCK is held, no other test touches the environment.
            unsafe {
                match value {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }

        f();

        for (k, original) in originals {
            // SAFETY: restoring original values under the same lock.
            unsafe {
                match original {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn env_symbols_with_defaults() {
        with_env(&[("DRIFTNET_SYMBOLS", Some("BTCUSDT, ETHUSDT"))], || {
            let config = fetch_config().unwrap();
            assert_eq!(config.collector.venue, "binance");
            assert_eq!(config.collector.symbols, vec!["BTCUSDT", "ETHUSDT"]);
            assert_eq!(config.collector.max_retries, 5);
            assert_eq!(config.storage.backend, StorageBackend::Memory);
            assert_eq!(config.storage.capacity, DEFAULT_CAPACITY);
        });
    }

    #[test]
    fn missing_symbols_is_a_config_error() {
        with_env(&[], || {
            let err = fetch_config().unwrap_err();
            assert!(matches!(err, DriftnetError::Config(_)));
            assert!(err.to_string().contains("symbol set is empty"));
        });
    }

    #[test]
    fn malformed_symbol_is_rejected() {
        with_env(&[("DRIFTNET_SYMBOLS", Some("BTC/USD,ETH/"))], || {
            let err = fetch_config().unwrap_err();
            assert!(err.to_string().contains("ETH/"));
        });
    }

    #[test]
    fn unparsable_number_names_the_variable() {
        with_env(
            &[
                ("DRIFTNET_SYMBOLS", Some("BTCUSDT")),
                ("DRIFTNET_MAX_RETRIES", Some("many")),
            ],
            || {
                let err = fetch_config().unwrap_err();
                assert!(err.to_string().contains("DRIFTNET_MAX_RETRIES"));
            },
        );
    }

    #[test]
    fn postgres_requires_database_url() {
        with_env(
            &[
                ("DRIFTNET_SYMBOLS", Some("BTCUSDT")),
                ("DRIFTNET_STORAGE", Some("postgres")),
            ],
            || {
                let err = fetch_config().unwrap_err();
                assert!(err.to_string().contains("DATABASE_URL"));
            },
        );
        with_env(
            &[
                ("DRIFTNET_SYMBOLS", Some("BTCUSDT")),
                ("DRIFTNET_STORAGE", Some("postgres")),
                ("DATABASE_URL", Some("postgres://localhost/driftnet")),
            ],
            || {
                let config = fetch_config().unwrap();
                assert_eq!(config.storage.backend, StorageBackend::Postgres);
                assert_eq!(config.storage.build().unwrap().name(), "postgres");
            },
        );
    }

    #[test]
    fn loads_file_and_env_overrides_it() {
        let file = write_config(
            r#"{
                "venue": "kraken",
                "symbols": ["BTC/USD"],
                "max_retries": 3,
                "retry_delay_ms": 250,
                "storage": {"backend": "ttl", "ttl_secs": 60, "capacity": 500}
            }"#,
        );

        with_env(&[("DRIFTNET_MAX_RETRIES", Some("7"))], || {
            let config = AppConfig::load(file.path()).unwrap();
            assert_eq!(config.collector.venue, "kraken");
            assert_eq!(config.collector.symbols, vec!["BTC/USD"]);
            assert_eq!(config.collector.max_retries, 7);
            assert_eq!(config.collector.retry_delay, Duration::from_millis(250));
            assert_eq!(config.storage.backend, StorageBackend::Ttl);
            assert_eq!(config.storage.ttl, Duration::from_secs(60));
            assert_eq!(config.storage.build().unwrap().name(), "ttl");
        });
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let file = write_config(r#"{"symbols": ["BTCUSDT"], "retries": 3}"#);
        with_env(&[], || {
            let err = AppConfig::load(file.path()).unwrap_err();
            assert!(matches!(err, DriftnetError::Decode(_)));
        });
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = AppConfig::load(Path::new("/nonexistent/driftnet.json")).unwrap_err();
        assert!(matches!(err, DriftnetError::Config(_)));
    }

    #[test]
    fn storage_backend_parses_case_insensitively() {
        assert_eq!("TTL".parse::<StorageBackend>().unwrap(), StorageBackend::Ttl);
        assert_eq!(
            "postgresql".parse::<StorageBackend>().unwrap(),
            StorageBackend::Postgres
        );
        assert!("redis".parse::<StorageBackend>().is_err());
    }
}
