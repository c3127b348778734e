//! Per-symbol rolling history and priority-ordered anomaly tests (§4.4).
//!
//! Categories are tested in a strict order — time, price, volume,
//! statistical, pattern — and the first match wins. History is a ring of
//! the last `historySize` ticks per symbol, read and written under a
//! single `parking_lot::RwLock` per symbol-history map (matches the
//! "single reader/writer lock per component" guidance in §5).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::config::AnomalyRules;
use crate::models::{AnomalyResult, AnomalySeverity, AnomalyType, Tick};

/// Welford's online mean/variance, matching the rolling-stats pattern used
/// elsewhere in this codebase for streaming statistical thresholds.
#[derive(Debug, Clone, Default)]
struct RollingStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RollingStats {
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count as f64 - 1.0)).sqrt()
        }
    }
}

/// Bounded per-symbol ring of recent ticks. Invariant: all three rings
/// stay equal-length and aligned by index; oldest entries are trimmed
/// from the front on overflow.
#[derive(Debug)]
pub struct SymbolHistory {
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    timestamps: VecDeque<DateTime<Utc>>,
    capacity: usize,
    stats: RollingStats,
}

impl SymbolHistory {
    fn new(capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity),
            volumes: VecDeque::with_capacity(capacity),
            timestamps: VecDeque::with_capacity(capacity),
            capacity,
            stats: RollingStats::default(),
        }
    }

    fn push(&mut self, tick: &Tick) {
        self.prices.push_back(tick.price);
        self.volumes.push_back(tick.volume);
        self.timestamps.push_back(tick.timestamp);
        self.stats.update(tick.price);
        if self.prices.len() > self.capacity {
            self.prices.pop_front();
            self.volumes.pop_front();
            self.timestamps.pop_front();
            // The running Welford stats intentionally track the
            // full-lifetime history, not just the retained window; see
            // DESIGN.md for the rationale.
        }
    }

    fn len(&self) -> usize {
        self.prices.len()
    }

    fn last_price(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.back().copied()
    }

    fn last_volume(&self) -> Option<f64> {
        self.volumes.back().copied()
    }

    fn moving_average(&self, window: usize) -> Option<f64> {
        if self.prices.is_empty() {
            return None;
        }
        let window = window.min(self.prices.len());
        if window == 0 {
            return None;
        }
        let sum: f64 = self.prices.iter().rev().take(window).sum();
        Some(sum / window as f64)
    }

    fn quartiles(&self) -> Option<(f64, f64)> {
        if self.prices.len() < 4 {
            return None;
        }
        let mut sorted: Vec<f64> = self.prices.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let q1 = percentile(&sorted, 0.25);
        let q3 = percentile(&sorted, 0.75);
        Some((q1, q3))
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = p * (sorted.len() as f64 - 1.0);
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = idx - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}

#[derive(Debug, Default)]
pub struct AnomalyStats {
    pub total_checked: AtomicU64,
    pub total_anomalies: AtomicU64,
}

impl AnomalyStats {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.total_checked.load(Ordering::Relaxed),
            self.total_anomalies.load(Ordering::Relaxed),
        )
    }
}

pub struct AnomalyDetector {
    rules: RwLock<AnomalyRules>,
    history: RwLock<HashMap<String, SymbolHistory>>,
    stats: AnomalyStats,
}

impl AnomalyDetector {
    pub fn new(rules: AnomalyRules) -> Self {
        Self {
            rules: RwLock::new(rules),
            history: RwLock::new(HashMap::new()),
            stats: AnomalyStats::default(),
        }
    }

    pub fn set_rules(&self, rules: AnomalyRules) {
        *self.rules.write() = rules;
    }

    pub fn reset(&self) {
        self.history.write().clear();
    }

    pub fn stats(&self) -> (u64, u64) {
        self.stats.snapshot()
    }

    /// Appends the tick to its symbol's history ring. Callers run this
    /// after `detect` regardless of outcome, matching §4.4: "after
    /// detection the tick is appended to the rings."
    pub fn update_history(&self, tick: &Tick) {
        let rules = self.rules.read();
        let mut history = self.history.write();
        history
            .entry(tick.symbol.clone())
            .or_insert_with(|| SymbolHistory::new(rules.history_size))
            .push(tick);
    }

    pub fn detect(&self, tick: &Tick) -> AnomalyResult {
        self.detect_at(tick, Utc::now())
    }

    pub fn detect_at(&self, tick: &Tick, now: DateTime<Utc>) -> AnomalyResult {
        self.stats.total_checked.fetch_add(1, Ordering::Relaxed);
        let rules = self.rules.read();
        let history = self.history.read();
        let hist = history.get(&tick.symbol);

        let result = detect_time(tick, hist, &rules, now)
            .or_else(|| detect_price(tick, hist, &rules))
            .or_else(|| detect_volume(tick, hist, &rules))
            .or_else(|| detect_statistical(tick, hist, &rules))
            .or_else(|| detect_pattern(tick, hist, &rules))
            .unwrap_or_else(AnomalyResult::normal);

        if result.is_anomaly {
            self.stats.total_anomalies.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

fn score_for(severity: AnomalySeverity, anomaly_type: AnomalyType) -> f64 {
    use AnomalyType::*;
    let bonus = match anomaly_type {
        PriceSpike | PriceDrop | PriceOutlier => 20.0,
        Statistical => 10.0,
        TimeGap => 5.0,
        _ => 0.0,
    };
    (severity.base_score() + bonus).min(100.0)
}

fn result(
    anomaly_type: AnomalyType,
    severity: AnomalySeverity,
    reason: impl Into<String>,
) -> AnomalyResult {
    let score = score_for(severity, anomaly_type);
    AnomalyResult {
        is_anomaly: true,
        anomaly_type: Some(anomaly_type),
        severity: Some(severity),
        score,
        confidence: score / 100.0,
        reasons: vec![reason.into()],
        suggestions: Vec::new(),
        metadata: HashMap::new(),
    }
}

fn detect_time(
    tick: &Tick,
    hist: Option<&SymbolHistory>,
    rules: &AnomalyRules,
    now: DateTime<Utc>,
) -> Option<AnomalyResult> {
    let future_allowed = chrono::Duration::from_std(rules.future_time_allowed).ok()?;
    if tick.timestamp > now + future_allowed {
        return Some(result(
            AnomalyType::FutureTime,
            AnomalySeverity::High,
            "timestamp is further in the future than allowed",
        ));
    }

    let prev_ts = hist.and_then(|h| h.last_timestamp())?;
    let delta = tick.timestamp - prev_ts;
    let delta_ms = delta.num_milliseconds();

    let dup_threshold = rules.duplicate_time_threshold.as_millis() as i64;
    if delta_ms.abs() < dup_threshold {
        return Some(result(
            AnomalyType::DuplicateTime,
            AnomalySeverity::Low,
            "timestamp is within the duplicate-time threshold of the previous tick",
        ));
    }

    let max_gap = rules.max_time_gap.as_millis() as i64;
    if delta_ms > max_gap {
        return Some(result(
            AnomalyType::TimeGap,
            AnomalySeverity::Medium,
            "gap since previous tick exceeds the configured maximum",
        ));
    }

    let min_gap = rules.min_time_gap.as_millis() as i64;
    if delta_ms < min_gap {
        // No dedicated AnomalyType exists for "too close together but not a
        // byte-identical duplicate"; treated as DuplicateTime per the
        // closest category (documented in DESIGN.md).
        return Some(result(
            AnomalyType::DuplicateTime,
            AnomalySeverity::Low,
            "gap since previous tick is below the configured minimum",
        ));
    }

    None
}

fn detect_price(
    tick: &Tick,
    hist: Option<&SymbolHistory>,
    rules: &AnomalyRules,
) -> Option<AnomalyResult> {
    let hist = hist?;
    if hist.len() < 2 {
        return None;
    }
    let prev = hist.last_price()?;
    if prev == 0.0 {
        return None;
    }
    let change = (tick.price - prev) / prev;

    if change > rules.spike_threshold {
        return Some(result(
            AnomalyType::PriceSpike,
            AnomalySeverity::High,
            format!("price rose {:.2}% since previous tick", change * 100.0),
        ));
    }
    if change < rules.drop_threshold {
        return Some(result(
            AnomalyType::PriceDrop,
            AnomalySeverity::High,
            format!("price fell {:.2}% since previous tick", change * 100.0),
        ));
    }

    if hist.len() >= 10 {
        let mean = hist.stats.mean;
        let sigma = hist.stats.std_dev();
        if sigma > 0.0 && (tick.price - mean).abs() > rules.outlier_threshold * sigma {
            return Some(result(
                AnomalyType::PriceOutlier,
                AnomalySeverity::Medium,
                "price deviates from historical mean beyond the outlier threshold",
            ));
        }
    }

    None
}

fn detect_volume(
    tick: &Tick,
    hist: Option<&SymbolHistory>,
    rules: &AnomalyRules,
) -> Option<AnomalyResult> {
    let hist = hist?;
    if hist.len() < 2 {
        return None;
    }

    if tick.volume == 0.0 && !rules.zero_volume_allowed {
        return Some(result(
            AnomalyType::ZeroVolume,
            AnomalySeverity::Medium,
            "volume is zero",
        ));
    }

    let prev_volume = hist.last_volume()?;
    if prev_volume > 0.0 {
        let change = (tick.volume - prev_volume) / prev_volume;
        if change > rules.volume_spike_threshold {
            return Some(result(
                AnomalyType::VolumeSpike,
                AnomalySeverity::High,
                format!("volume rose {:.0}% since previous tick", change * 100.0),
            ));
        }
        if change < -rules.volume_drop_threshold {
            return Some(result(
                AnomalyType::VolumeDrop,
                AnomalySeverity::Medium,
                format!("volume fell {:.0}% since previous tick", change * 100.0),
            ));
        }
    }

    None
}

fn detect_statistical(
    tick: &Tick,
    hist: Option<&SymbolHistory>,
    rules: &AnomalyRules,
) -> Option<AnomalyResult> {
    let hist = hist?;
    if hist.len() < rules.moving_average_window {
        return None;
    }

    let mean = hist.stats.mean;
    let sigma = hist.stats.std_dev();
    if sigma > 0.0 {
        let z = (tick.price - mean) / sigma;
        if z.abs() > rules.z_score_threshold {
            return Some(result(
                AnomalyType::Statistical,
                AnomalySeverity::Medium,
                format!("price z-score {z:.2} exceeds configured threshold"),
            ));
        }
    }

    if let Some((q1, q3)) = hist.quartiles() {
        let iqr = q3 - q1;
        let lower = q1 - rules.iqr_multiplier * iqr;
        let upper = q3 + rules.iqr_multiplier * iqr;
        if tick.price < lower || tick.price > upper {
            return Some(result(
                AnomalyType::Statistical,
                AnomalySeverity::Medium,
                "price falls outside the interquartile-range fence",
            ));
        }
    }

    None
}

fn detect_pattern(
    tick: &Tick,
    hist: Option<&SymbolHistory>,
    rules: &AnomalyRules,
) -> Option<AnomalyResult> {
    let hist = hist?;

    if let Some(trend_avg) = hist.moving_average(rules.moving_average_window) {
        if trend_avg > 0.0 {
            let deviation = (tick.price - trend_avg).abs() / trend_avg;
            if deviation > rules.trend_change_threshold {
                return Some(result(
                    AnomalyType::Trend,
                    AnomalySeverity::Medium,
                    "price deviates from its recent moving average beyond the trend threshold",
                ));
            }
        }
    }

    if let Some(cycle_avg) = hist.moving_average(rules.cycle_length) {
        if cycle_avg > 0.0 {
            let deviation = (tick.price - cycle_avg).abs() / cycle_avg;
            if deviation > rules.cyclical_pattern_threshold {
                return Some(result(
                    AnomalyType::Cyclical,
                    AnomalySeverity::Medium,
                    "price deviates from its last-cycle mean beyond the cyclical threshold",
                ));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn tick_at(symbol: &str, price: f64, ts: DateTime<Utc>) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            bid: None,
            ask: None,
            volume: 1.0,
            timestamp: ts,
            source: "binance".to_string(),
            latency: StdDuration::from_millis(1),
        }
    }

    #[test]
    fn price_spike_is_detected_as_high_severity() {
        let rules = AnomalyRules {
            spike_threshold: 0.1,
            ..Default::default()
        };
        let detector = AnomalyDetector::new(rules);
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let prev = tick_at("BTCUSDT", 100.0, t0);
        detector.update_history(&prev);

        let incoming = tick_at("BTCUSDT", 150.0, t0 + chrono::Duration::minutes(1));
        let res = detector.detect(&incoming);
        assert!(res.is_anomaly);
        assert_eq!(res.anomaly_type, Some(AnomalyType::PriceSpike));
        assert_eq!(res.severity, Some(AnomalySeverity::High));
    }

    #[test]
    fn future_timestamp_is_detected() {
        let rules = AnomalyRules {
            future_time_allowed: StdDuration::from_secs(60),
            ..Default::default()
        };
        let detector = AnomalyDetector::new(rules);
        let now = Utc::now();
        let incoming = tick_at("BTCUSDT", 100.0, now + chrono::Duration::minutes(2));
        let res = detector.detect_at(&incoming, now);
        assert!(res.is_anomaly);
        assert_eq!(res.anomaly_type, Some(AnomalyType::FutureTime));
        assert_eq!(res.severity, Some(AnomalySeverity::High));
    }

    #[test]
    fn normal_tick_has_zero_score_and_full_confidence() {
        let detector = AnomalyDetector::new(AnomalyRules::default());
        let now = Utc::now();
        let prev = tick_at("ETHUSDT", 2000.0, now - chrono::Duration::minutes(1));
        detector.update_history(&prev);
        let incoming = tick_at("ETHUSDT", 2001.0, now);
        let res = detector.detect_at(&incoming, now);
        assert!(!res.is_anomaly);
        assert_eq!(res.score, 0.0);
        assert_eq!(res.confidence, 1.0);
    }

    #[test]
    fn history_ring_trims_from_the_front() {
        let detector = AnomalyDetector::new(AnomalyRules {
            history_size: 3,
            ..Default::default()
        });
        let now = Utc::now();
        for i in 0..5 {
            let t = tick_at("BTCUSDT", 100.0 + i as f64, now + chrono::Duration::seconds(i));
            detector.update_history(&t);
        }
        let history = detector.history.read();
        let h = history.get("BTCUSDT").unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h.prices, VecDeque::from(vec![102.0, 103.0, 104.0]));
    }
}
