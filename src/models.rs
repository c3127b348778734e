//! Core data model shared across pipeline stages.
//!
//! A `Tick` is immutable once produced by the `Receiver`; every downstream
//! stage attaches a sidecar report (`ValidationReport`, `CleaningDiff`,
//! `AnomalyResult`) rather than mutating it. The `Cleaner` is the one
//! exception: it produces a new `Tick` plus a diff against the original.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single observed price sample for a symbol at an instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub latency: Duration,
}

impl Tick {
    /// Structural well-formedness independent of `Validator` rules:
    /// non-empty symbol/source, positive price, non-zero timestamp,
    /// non-negative volume, and ask >= bid when both are present.
    pub fn is_structurally_sound(&self) -> bool {
        !self.symbol.is_empty()
            && !self.source.is_empty()
            && self.price > 0.0
            && self.volume >= 0.0
            && self.timestamp.timestamp_millis() != 0
            && match (self.bid, self.ask) {
                (Some(bid), Some(ask)) => ask >= bid && bid >= 0.0,
                (Some(bid), None) => bid >= 0.0,
                (None, Some(ask)) => ask >= 0.0,
                (None, None) => true,
            }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub code: String,
    pub severity: Severity,
    pub message: String,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub code: String,
    pub message: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub score: f64,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// A tick is invalid iff any error-severity item exists OR score<60.
    pub fn compute_validity(errors: &[ValidationError], score: f64) -> bool {
        score >= 60.0 && !errors.iter().any(|e| e.severity == Severity::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub original_value: String,
    pub cleaned_value: String,
    pub reason: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningDiff {
    pub changes: Vec<FieldChange>,
    pub quality: f64,
    pub confidence: f64,
}

impl CleaningDiff {
    pub fn empty() -> Self {
        Self {
            changes: Vec::new(),
            quality: 100.0,
            confidence: 1.0,
        }
    }

    /// Quality starts at 100, -5 per change, -10 extra for a price change,
    /// -5 extra for a timestamp change; confidence -0.1 per change, floor 0.1.
    pub fn record(&mut self, change: FieldChange) {
        self.quality -= 5.0;
        if change.field == "price" || change.field == "bidPrice" || change.field == "askPrice" {
            self.quality -= 10.0;
        }
        if change.field == "timestamp" {
            self.quality -= 5.0;
        }
        self.quality = self.quality.clamp(0.0, 100.0);
        self.confidence = (self.confidence - 0.1).max(0.1);
        self.changes.push(change);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnomalyType {
    PriceSpike,
    PriceDrop,
    PriceOutlier,
    FutureTime,
    DuplicateTime,
    TimeGap,
    ZeroVolume,
    VolumeSpike,
    VolumeDrop,
    Statistical,
    Trend,
    Cyclical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    /// Base score by severity: 30/60/80/95.
    pub fn base_score(self) -> f64 {
        match self {
            AnomalySeverity::Low => 30.0,
            AnomalySeverity::Medium => 60.0,
            AnomalySeverity::High => 80.0,
            AnomalySeverity::Critical => 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub anomaly_type: Option<AnomalyType>,
    pub severity: Option<AnomalySeverity>,
    pub score: f64,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub suggestions: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl AnomalyResult {
    pub fn normal() -> Self {
        Self {
            is_anomaly: false,
            anomaly_type: None,
            severity: None,
            score: 0.0,
            confidence: 1.0,
            reasons: Vec::new(),
            suggestions: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Rolling-window key for change-rate computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeWindow {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
}

impl ChangeWindow {
    pub fn duration(self) -> Duration {
        match self {
            ChangeWindow::OneMinute => Duration::from_secs(60),
            ChangeWindow::FiveMinutes => Duration::from_secs(300),
            ChangeWindow::FifteenMinutes => Duration::from_secs(900),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChangeWindow::OneMinute => "1m",
            ChangeWindow::FiveMinutes => "5m",
            ChangeWindow::FifteenMinutes => "15m",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRate {
    pub symbol: String,
    pub window: ChangeWindow,
    pub start_price: f64,
    pub end_price: f64,
    pub change_rate: f64,
    pub timestamp: DateTime<Utc>,
    pub is_valid: bool,
    pub is_anomaly: bool,
}

impl ChangeRate {
    pub fn invalid(symbol: &str, window: ChangeWindow, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            window,
            start_price: 0.0,
            end_price: 0.0,
            change_rate: 0.0,
            timestamp,
            is_valid: false,
            is_anomaly: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistenceItemType {
    Price,
    ChangeRate,
    Symbol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceItem {
    pub id: String,
    pub item_type: PersistenceItemType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl PersistenceItem {
    pub fn new(item_type: PersistenceItemType, id: impl Into<String>, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            item_type,
            data,
            timestamp: now,
            priority: 0,
            retry_count: 0,
            created_at: now,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchErrorEntry {
    pub item_id: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub success_count: usize,
    pub error_count: usize,
    pub durations: Vec<Duration>,
    pub errors: Vec<BatchErrorEntry>,
}

/// TTL key families for the cache (§3/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeyFamily {
    Price,
    ChangeRate,
    Symbol,
    Status,
}

impl CacheKeyFamily {
    pub fn prefix(self) -> &'static str {
        match self {
            CacheKeyFamily::Price => "price",
            CacheKeyFamily::ChangeRate => "changerate",
            CacheKeyFamily::Symbol => "symbol",
            CacheKeyFamily::Status => "status",
        }
    }
}

pub fn cache_key_price(symbol: &str) -> String {
    format!("price:{symbol}")
}

pub fn cache_key_change_rate(symbol: &str, window: ChangeWindow) -> String {
    format!("changerate:{}:{}", symbol, window.label())
}

pub fn cache_key_symbol(symbol: &str) -> String {
    format!("symbol:{symbol}")
}

pub fn cache_key_status(name: &str) -> String {
    format!("status:{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            level,
            title: title.into(),
            message: message.into(),
            source: source.into(),
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub condition: String,
    pub threshold: f64,
    pub duration: Duration,
    pub level: AlertLevel,
    pub enabled: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub metadata: HashMap<String, String>,
}

/// Aggregate rule from §3: all-healthy -> healthy; majority-healthy ->
/// degraded; else unhealthy.
pub fn aggregate_health(checks: &[HealthCheck]) -> HealthStatus {
    if checks.is_empty() {
        return HealthStatus::Healthy;
    }
    let healthy = checks
        .iter()
        .filter(|c| c.status == HealthStatus::Healthy)
        .count();
    if healthy == checks.len() {
        HealthStatus::Healthy
    } else if healthy * 2 > checks.len() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64) -> Tick {
        Tick {
            symbol: "BTCUSDT".into(),
            price,
            bid: Some(price - 1.0),
            ask: Some(price + 1.0),
            volume: 1.0,
            timestamp: Utc::now(),
            source: "binance".into(),
            latency: Duration::from_millis(5),
        }
    }

    #[test]
    fn structurally_sound_tick_passes() {
        assert!(tick(100.0).is_structurally_sound());
    }

    #[test]
    fn negative_price_fails() {
        assert!(!tick(-1.0).is_structurally_sound());
    }

    #[test]
    fn cleaning_diff_quality_floor() {
        let mut diff = CleaningDiff::empty();
        for _ in 0..30 {
            diff.record(FieldChange {
                field: "price".into(),
                original_value: "1".into(),
                cleaned_value: "1.0".into(),
                reason: "rounding".into(),
                confidence: 1.0,
            });
        }
        assert_eq!(diff.quality, 0.0);
        assert_eq!(diff.confidence, 0.1);
    }

    #[test]
    fn health_aggregation_matches_spec() {
        let mk = |s: HealthStatus| HealthCheck {
            name: "x".into(),
            status: s,
            message: String::new(),
            timestamp: Utc::now(),
            duration: Duration::from_millis(1),
            metadata: HashMap::new(),
        };
        assert_eq!(
            aggregate_health(&[mk(HealthStatus::Healthy), mk(HealthStatus::Healthy)]),
            HealthStatus::Healthy
        );
        assert_eq!(
            aggregate_health(&[
                mk(HealthStatus::Healthy),
                mk(HealthStatus::Healthy),
                mk(HealthStatus::Unhealthy)
            ]),
            HealthStatus::Degraded
        );
        assert_eq!(
            aggregate_health(&[mk(HealthStatus::Unhealthy), mk(HealthStatus::Healthy)]),
            HealthStatus::Unhealthy
        );
    }
}
