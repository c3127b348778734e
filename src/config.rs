//! Environment-driven configuration, following this codebase's existing
//! `Config::from_env()` convention: every field has a hardcoded default and
//! is overridden by an optional env var, parsed with `.parse().unwrap_or()`
//! so a malformed value degrades to the default instead of panicking.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

/// Top-level aggregate handed to the `Supervisor`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_connections: usize,
    pub reconnect_interval: Duration,
    pub health_check_interval: Duration,
    pub symbols: Vec<String>,
    pub collection_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff: f64,
    pub worker_pool_size: usize,
    pub channel_buffer_size: usize,
    pub websocket_url: String,

    pub processor: ProcessorConfig,
    pub persistence: PersistenceConfig,
    pub cache: CacheConfig,
    pub receiver: ReceiverConfig,
    pub anomaly_rules: AnomalyRules,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            reconnect_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(30),
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            collection_interval: Duration::from_secs(1),
            batch_size: 100,
            max_retries: 3,
            retry_backoff: 2.0,
            worker_pool_size: 5,
            channel_buffer_size: 1000,
            websocket_url: "wss://stream.binance.com:9443/ws".to_string(),
            processor: ProcessorConfig::default(),
            persistence: PersistenceConfig::default(),
            cache: CacheConfig::default(),
            receiver: ReceiverConfig::default(),
            anomaly_rules: AnomalyRules::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();
        Self {
            max_connections: env_or("TICKSTREAM_MAX_CONNECTIONS", defaults.max_connections),
            reconnect_interval: Duration::from_millis(env_or(
                "TICKSTREAM_RECONNECT_INTERVAL_MS",
                defaults.reconnect_interval.as_millis() as u64,
            )),
            health_check_interval: Duration::from_millis(env_or(
                "TICKSTREAM_HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval.as_millis() as u64,
            )),
            symbols: env_list(
                "TICKSTREAM_SYMBOLS",
                &defaults
                    .symbols
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>(),
            ),
            collection_interval: Duration::from_millis(env_or(
                "TICKSTREAM_COLLECTION_INTERVAL_MS",
                defaults.collection_interval.as_millis() as u64,
            )),
            batch_size: env_or("TICKSTREAM_BATCH_SIZE", defaults.batch_size),
            max_retries: env_or("TICKSTREAM_MAX_RETRIES", defaults.max_retries),
            retry_backoff: env_or("TICKSTREAM_RETRY_BACKOFF", defaults.retry_backoff),
            worker_pool_size: env_or("TICKSTREAM_WORKER_POOL_SIZE", defaults.worker_pool_size),
            channel_buffer_size: env_or(
                "TICKSTREAM_CHANNEL_BUFFER_SIZE",
                defaults.channel_buffer_size,
            ),
            websocket_url: std::env::var("TICKSTREAM_WEBSOCKET_URL")
                .unwrap_or(defaults.websocket_url),
            processor: ProcessorConfig::from_env(),
            persistence: PersistenceConfig::from_env(),
            cache: CacheConfig::from_env(),
            receiver: ReceiverConfig::from_env(),
            anomaly_rules: AnomalyRules::from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub time_windows: Vec<Duration>,
    pub max_price_change: f64,
    pub anomaly_threshold: f64,
    pub data_retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            time_windows: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
            max_price_change: 50.0,
            anomaly_threshold: 10.0,
            data_retention: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl ProcessorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            time_windows: d.time_windows.clone(),
            max_price_change: env_or("TICKSTREAM_MAX_PRICE_CHANGE", d.max_price_change),
            anomaly_threshold: env_or("TICKSTREAM_ANOMALY_THRESHOLD", d.anomaly_threshold),
            data_retention: Duration::from_secs(env_or(
                "TICKSTREAM_DATA_RETENTION_SECS",
                d.data_retention.as_secs(),
            )),
            cleanup_interval: Duration::from_secs(env_or(
                "TICKSTREAM_CLEANUP_INTERVAL_SECS",
                d.cleanup_interval.as_secs(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub queue_size: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub retry_backoff: f64,
    pub max_retry_delay: Duration,
    pub enable_deduplication: bool,
    pub deduplication_window: Duration,
    pub enable_integrity_check: bool,
    pub worker_count: usize,
    pub max_memory_usage: u64,
    pub cleanup_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            batch_size: 100,
            batch_timeout: Duration::from_secs(1),
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            retry_backoff: 2.0,
            max_retry_delay: Duration::from_secs(30),
            enable_deduplication: true,
            deduplication_window: Duration::from_secs(5 * 60),
            enable_integrity_check: true,
            worker_count: 5,
            max_memory_usage: 100 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PersistenceConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_size: env_or("TICKSTREAM_PERSIST_QUEUE_SIZE", d.queue_size),
            batch_size: env_or("TICKSTREAM_PERSIST_BATCH_SIZE", d.batch_size),
            batch_timeout: Duration::from_millis(env_or(
                "TICKSTREAM_PERSIST_BATCH_TIMEOUT_MS",
                d.batch_timeout.as_millis() as u64,
            )),
            flush_interval: Duration::from_millis(env_or(
                "TICKSTREAM_PERSIST_FLUSH_INTERVAL_MS",
                d.flush_interval.as_millis() as u64,
            )),
            max_retries: env_or("TICKSTREAM_PERSIST_MAX_RETRIES", d.max_retries),
            retry_interval: Duration::from_millis(env_or(
                "TICKSTREAM_PERSIST_RETRY_INTERVAL_MS",
                d.retry_interval.as_millis() as u64,
            )),
            retry_backoff: env_or("TICKSTREAM_PERSIST_RETRY_BACKOFF", d.retry_backoff),
            max_retry_delay: Duration::from_millis(env_or(
                "TICKSTREAM_PERSIST_MAX_RETRY_DELAY_MS",
                d.max_retry_delay.as_millis() as u64,
            )),
            enable_deduplication: env_or(
                "TICKSTREAM_PERSIST_ENABLE_DEDUP",
                d.enable_deduplication,
            ),
            deduplication_window: Duration::from_secs(env_or(
                "TICKSTREAM_PERSIST_DEDUP_WINDOW_SECS",
                d.deduplication_window.as_secs(),
            )),
            enable_integrity_check: env_or(
                "TICKSTREAM_PERSIST_ENABLE_INTEGRITY",
                d.enable_integrity_check,
            ),
            worker_count: env_or("TICKSTREAM_PERSIST_WORKER_COUNT", d.worker_count),
            max_memory_usage: env_or("TICKSTREAM_PERSIST_MAX_MEMORY_BYTES", d.max_memory_usage),
            cleanup_interval: Duration::from_secs(env_or(
                "TICKSTREAM_PERSIST_CLEANUP_INTERVAL_SECS",
                d.cleanup_interval.as_secs(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    pub pool_size: usize,
    pub min_idle_conns: usize,
    pub max_retries: u32,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub default_ttl: Duration,
    pub price_ttl: Duration,
    pub change_rate_ttl: Duration,
    pub symbol_ttl: Duration,
    pub status_ttl: Duration,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub enable_write_through: bool,
    pub enable_write_behind: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            pool_size: 10,
            min_idle_conns: 2,
            max_retries: 3,
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            default_ttl: Duration::from_secs(3600),
            price_ttl: Duration::from_secs(5 * 60),
            change_rate_ttl: Duration::from_secs(3600),
            symbol_ttl: Duration::from_secs(24 * 3600),
            status_ttl: Duration::from_secs(10 * 60),
            batch_size: 100,
            batch_timeout: Duration::from_secs(1),
            enable_write_through: true,
            enable_write_behind: false,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            host: std::env::var("TICKSTREAM_CACHE_HOST").unwrap_or(d.host),
            port: env_or("TICKSTREAM_CACHE_PORT", d.port),
            pool_size: env_or("TICKSTREAM_CACHE_POOL_SIZE", d.pool_size),
            min_idle_conns: env_or("TICKSTREAM_CACHE_MIN_IDLE_CONNS", d.min_idle_conns),
            max_retries: env_or("TICKSTREAM_CACHE_MAX_RETRIES", d.max_retries),
            dial_timeout: Duration::from_millis(env_or(
                "TICKSTREAM_CACHE_DIAL_TIMEOUT_MS",
                d.dial_timeout.as_millis() as u64,
            )),
            read_timeout: Duration::from_millis(env_or(
                "TICKSTREAM_CACHE_READ_TIMEOUT_MS",
                d.read_timeout.as_millis() as u64,
            )),
            write_timeout: Duration::from_millis(env_or(
                "TICKSTREAM_CACHE_WRITE_TIMEOUT_MS",
                d.write_timeout.as_millis() as u64,
            )),
            default_ttl: Duration::from_secs(env_or(
                "TICKSTREAM_CACHE_DEFAULT_TTL_SECS",
                d.default_ttl.as_secs(),
            )),
            price_ttl: Duration::from_secs(env_or(
                "TICKSTREAM_CACHE_PRICE_TTL_SECS",
                d.price_ttl.as_secs(),
            )),
            change_rate_ttl: Duration::from_secs(env_or(
                "TICKSTREAM_CACHE_CHANGE_RATE_TTL_SECS",
                d.change_rate_ttl.as_secs(),
            )),
            symbol_ttl: Duration::from_secs(env_or(
                "TICKSTREAM_CACHE_SYMBOL_TTL_SECS",
                d.symbol_ttl.as_secs(),
            )),
            status_ttl: Duration::from_secs(env_or(
                "TICKSTREAM_CACHE_STATUS_TTL_SECS",
                d.status_ttl.as_secs(),
            )),
            batch_size: env_or("TICKSTREAM_CACHE_BATCH_SIZE", d.batch_size),
            batch_timeout: Duration::from_millis(env_or(
                "TICKSTREAM_CACHE_BATCH_TIMEOUT_MS",
                d.batch_timeout.as_millis() as u64,
            )),
            enable_write_through: env_or(
                "TICKSTREAM_CACHE_ENABLE_WRITE_THROUGH",
                d.enable_write_through,
            ),
            enable_write_behind: env_or(
                "TICKSTREAM_CACHE_ENABLE_WRITE_BEHIND",
                d.enable_write_behind,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub buffer_size: usize,
    pub worker_count: usize,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub connection_timeout: Duration,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub data_sources: Vec<DataSourceConfig>,
    pub symbols: Vec<String>,
    pub heartbeat_interval: Duration,
    pub parse_error_rate_threshold: f64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            worker_count: 5,
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(30),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            data_sources: vec![DataSourceConfig {
                name: "binance".to_string(),
                kind: SourceKind::WebSocket,
                url: "wss://stream.binance.com:9443/ws".to_string(),
            }],
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            heartbeat_interval: Duration::from_secs(30),
            parse_error_rate_threshold: 0.1,
        }
    }
}

impl ReceiverConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            buffer_size: env_or("TICKSTREAM_RECV_BUFFER_SIZE", d.buffer_size),
            worker_count: env_or("TICKSTREAM_RECV_WORKER_COUNT", d.worker_count),
            max_retries: env_or("TICKSTREAM_RECV_MAX_RETRIES", d.max_retries),
            retry_interval: Duration::from_millis(env_or(
                "TICKSTREAM_RECV_RETRY_INTERVAL_MS",
                d.retry_interval.as_millis() as u64,
            )),
            connection_timeout: Duration::from_millis(env_or(
                "TICKSTREAM_RECV_CONNECTION_TIMEOUT_MS",
                d.connection_timeout.as_millis() as u64,
            )),
            batch_size: env_or("TICKSTREAM_RECV_BATCH_SIZE", d.batch_size),
            flush_interval: Duration::from_millis(env_or(
                "TICKSTREAM_RECV_FLUSH_INTERVAL_MS",
                d.flush_interval.as_millis() as u64,
            )),
            data_sources: d.data_sources,
            symbols: env_list(
                "TICKSTREAM_RECV_SYMBOLS",
                &d.symbols.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            ),
            heartbeat_interval: Duration::from_millis(env_or(
                "TICKSTREAM_RECV_HEARTBEAT_INTERVAL_MS",
                d.heartbeat_interval.as_millis() as u64,
            )),
            parse_error_rate_threshold: env_or(
                "TICKSTREAM_RECV_PARSE_ERROR_RATE_THRESHOLD",
                d.parse_error_rate_threshold,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    WebSocket,
    Rest,
    File,
}

#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
}

/// Category-enabled flags and thresholds for the `AnomalyDetector` (§4.4).
#[derive(Debug, Clone)]
pub struct AnomalyRules {
    pub history_size: usize,
    pub future_time_allowed: Duration,
    pub duplicate_time_threshold: Duration,
    pub max_time_gap: Duration,
    pub min_time_gap: Duration,
    pub spike_threshold: f64,
    pub drop_threshold: f64,
    pub outlier_threshold: f64,
    pub zero_volume_allowed: bool,
    pub volume_spike_threshold: f64,
    pub volume_drop_threshold: f64,
    pub moving_average_window: usize,
    pub z_score_threshold: f64,
    pub iqr_multiplier: f64,
    pub trend_change_threshold: f64,
    pub cyclical_pattern_threshold: f64,
    pub cycle_length: usize,
}

impl Default for AnomalyRules {
    fn default() -> Self {
        Self {
            history_size: 200,
            future_time_allowed: Duration::from_secs(60),
            duplicate_time_threshold: Duration::from_millis(100),
            max_time_gap: Duration::from_secs(300),
            min_time_gap: Duration::from_millis(10),
            spike_threshold: 0.1,
            drop_threshold: -0.1,
            outlier_threshold: 3.0,
            zero_volume_allowed: false,
            volume_spike_threshold: 5.0,
            volume_drop_threshold: 0.2,
            moving_average_window: 20,
            z_score_threshold: 3.0,
            iqr_multiplier: 1.5,
            trend_change_threshold: 0.05,
            cyclical_pattern_threshold: 0.1,
            cycle_length: 5,
        }
    }
}

impl AnomalyRules {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            history_size: env_or("TICKSTREAM_ANOMALY_HISTORY_SIZE", d.history_size),
            future_time_allowed: Duration::from_millis(env_or(
                "TICKSTREAM_ANOMALY_FUTURE_TIME_ALLOWED_MS",
                d.future_time_allowed.as_millis() as u64,
            )),
            duplicate_time_threshold: Duration::from_millis(env_or(
                "TICKSTREAM_ANOMALY_DUPLICATE_TIME_THRESHOLD_MS",
                d.duplicate_time_threshold.as_millis() as u64,
            )),
            max_time_gap: Duration::from_millis(env_or(
                "TICKSTREAM_ANOMALY_MAX_TIME_GAP_MS",
                d.max_time_gap.as_millis() as u64,
            )),
            min_time_gap: Duration::from_millis(env_or(
                "TICKSTREAM_ANOMALY_MIN_TIME_GAP_MS",
                d.min_time_gap.as_millis() as u64,
            )),
            spike_threshold: env_or("TICKSTREAM_ANOMALY_SPIKE_THRESHOLD", d.spike_threshold),
            drop_threshold: env_or("TICKSTREAM_ANOMALY_DROP_THRESHOLD", d.drop_threshold),
            outlier_threshold: env_or(
                "TICKSTREAM_ANOMALY_OUTLIER_THRESHOLD",
                d.outlier_threshold,
            ),
            zero_volume_allowed: env_or(
                "TICKSTREAM_ANOMALY_ZERO_VOLUME_ALLOWED",
                d.zero_volume_allowed,
            ),
            volume_spike_threshold: env_or(
                "TICKSTREAM_ANOMALY_VOLUME_SPIKE_THRESHOLD",
                d.volume_spike_threshold,
            ),
            volume_drop_threshold: env_or(
                "TICKSTREAM_ANOMALY_VOLUME_DROP_THRESHOLD",
                d.volume_drop_threshold,
            ),
            moving_average_window: env_or(
                "TICKSTREAM_ANOMALY_MOVING_AVERAGE_WINDOW",
                d.moving_average_window,
            ),
            z_score_threshold: env_or(
                "TICKSTREAM_ANOMALY_Z_SCORE_THRESHOLD",
                d.z_score_threshold,
            ),
            iqr_multiplier: env_or("TICKSTREAM_ANOMALY_IQR_MULTIPLIER", d.iqr_multiplier),
            trend_change_threshold: env_or(
                "TICKSTREAM_ANOMALY_TREND_CHANGE_THRESHOLD",
                d.trend_change_threshold,
            ),
            cyclical_pattern_threshold: env_or(
                "TICKSTREAM_ANOMALY_CYCLICAL_PATTERN_THRESHOLD",
                d.cyclical_pattern_threshold,
            ),
            cycle_length: env_or("TICKSTREAM_ANOMALY_CYCLE_LENGTH", d.cycle_length),
        }
    }
}

/// Structural/range validation rules consumed by the `Validator`.
#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub min_price: f64,
    pub max_price: f64,
    pub min_volume: f64,
    pub max_latency: Duration,
    pub allowed_future: Duration,
    pub max_spread_pct: f64,
    pub extreme_price_multiple: f64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_price: 0.0,
            max_price: 10_000_000.0,
            min_volume: 0.0,
            max_latency: Duration::from_secs(5),
            allowed_future: Duration::from_secs(60),
            max_spread_pct: 5.0,
            extreme_price_multiple: 10.0,
        }
    }
}

/// Rounding rules consumed by the `Cleaner`.
#[derive(Debug, Clone)]
pub struct CleaningRules {
    pub price_precision: u32,
    pub time_precision_ms: i64,
    pub time_alignment: bool,
    pub rounding: RoundingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    Round,
    Floor,
    Ceil,
}

impl Default for CleaningRules {
    fn default() -> Self {
        Self {
            price_precision: 8,
            time_precision_ms: 1,
            time_alignment: false,
            rounding: RoundingMode::Round,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = PersistenceConfig::default();
        assert_eq!(p.queue_size, 1000);
        assert_eq!(p.batch_size, 100);
        assert_eq!(p.deduplication_window, Duration::from_secs(300));
        assert_eq!(p.retry_backoff, 2.0);
        assert_eq!(p.max_retry_delay, Duration::from_secs(30));

        let c = CacheConfig::default();
        assert_eq!(c.price_ttl, Duration::from_secs(300));
        assert_eq!(c.change_rate_ttl, Duration::from_secs(3600));
        assert_eq!(c.symbol_ttl, Duration::from_secs(86400));
        assert_eq!(c.status_ttl, Duration::from_secs(600));
        assert!(c.enable_write_through);
        assert!(!c.enable_write_behind);
    }

    #[test]
    fn malformed_env_var_falls_back_to_default() {
        std::env::set_var("TICKSTREAM_TEST_NUM", "not-a-number");
        let v: u32 = env_or("TICKSTREAM_TEST_NUM", 42);
        assert_eq!(v, 42);
        std::env::remove_var("TICKSTREAM_TEST_NUM");
    }
}
