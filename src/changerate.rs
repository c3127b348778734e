//! Rolling-window percentage change rate across 1m/5m/15m windows (§4.5).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::{ChangeRate, ChangeWindow, Tick};

const WINDOWS: [ChangeWindow; 3] = [
    ChangeWindow::OneMinute,
    ChangeWindow::FiveMinutes,
    ChangeWindow::FifteenMinutes,
];

/// Time-ordered `(timestamp, price)` buffer limited to `window` duration.
/// Invariant: every retained entry satisfies `now - t <= window`; purged
/// on every insert.
#[derive(Debug, Default)]
struct ChangeRateBuffer {
    entries: VecDeque<(DateTime<Utc>, f64)>,
    last_seen: Option<DateTime<Utc>>,
}

impl ChangeRateBuffer {
    fn push(&mut self, ts: DateTime<Utc>, price: f64, window: Duration) {
        self.entries.push_back((ts, price));
        self.last_seen = Some(ts);
        self.purge(ts, window);
    }

    fn purge(&mut self, now: DateTime<Utc>, window: Duration) {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        while let Some(&(t, _)) = self.entries.front() {
            if now - t > window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn compute(&self, symbol: &str, window: ChangeWindow, max_price_change: f64) -> ChangeRate {
        if self.entries.len() < 2 {
            let ts = self.entries.back().map(|(t, _)| *t).unwrap_or_else(Utc::now);
            return ChangeRate::invalid(symbol, window, ts);
        }
        let (_, start_price) = *self.entries.front().unwrap();
        let (end_ts, end_price) = *self.entries.back().unwrap();
        let change_rate = if start_price != 0.0 {
            (end_price - start_price) / start_price * 100.0
        } else {
            0.0
        };
        ChangeRate {
            symbol: symbol.to_string(),
            window,
            start_price,
            end_price,
            change_rate,
            timestamp: end_ts,
            is_valid: true,
            is_anomaly: change_rate.abs() > max_price_change,
        }
    }
}

struct SymbolBuffers {
    buffers: HashMap<ChangeWindow, ChangeRateBuffer>,
    last_seen: DateTime<Utc>,
}

pub struct ChangeRateEngine {
    max_price_change: f64,
    data_retention: Duration,
    buffers: RwLock<HashMap<String, SymbolBuffers>>,
}

impl ChangeRateEngine {
    pub fn new(max_price_change: f64, data_retention: Duration) -> Self {
        Self {
            max_price_change,
            data_retention,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Appends a valid, cleaned tick to every configured window's buffer.
    pub fn process_tick(&self, tick: &Tick) {
        self.process_tick_at(tick, tick.timestamp);
    }

    fn process_tick_at(&self, tick: &Tick, now: DateTime<Utc>) {
        let mut buffers = self.buffers.write();
        let entry = buffers
            .entry(tick.symbol.clone())
            .or_insert_with(|| SymbolBuffers {
                buffers: WINDOWS
                    .iter()
                    .map(|w| (*w, ChangeRateBuffer::default()))
                    .collect(),
                last_seen: now,
            });
        entry.last_seen = now;
        for window in WINDOWS {
            let buf = entry.buffers.entry(window).or_default();
            buf.push(now, tick.price, window.duration());
        }
    }

    pub fn change_rate(&self, symbol: &str, window: ChangeWindow) -> ChangeRate {
        let buffers = self.buffers.read();
        match buffers.get(symbol).and_then(|s| s.buffers.get(&window)) {
            Some(buf) => buf.compute(symbol, window, self.max_price_change),
            None => ChangeRate::invalid(symbol, window, Utc::now()),
        }
    }

    pub fn change_rates(&self, symbol: &str) -> HashMap<ChangeWindow, ChangeRate> {
        WINDOWS
            .iter()
            .map(|w| (*w, self.change_rate(symbol, *w)))
            .collect()
    }

    /// Removes buffers for symbols not seen within `data_retention`;
    /// intended to run on a `cleanup_interval` cadence from the supervisor.
    pub fn cleanup_stale(&self) {
        self.cleanup_stale_at(Utc::now());
    }

    fn cleanup_stale_at(&self, now: DateTime<Utc>) {
        let retention =
            chrono::Duration::from_std(self.data_retention).unwrap_or(chrono::Duration::zero());
        let mut buffers = self.buffers.write();
        buffers.retain(|_, s| now - s.last_seen <= retention);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, price: f64, ts: DateTime<Utc>) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            bid: None,
            ask: None,
            volume: 1.0,
            timestamp: ts,
            source: "binance".to_string(),
            latency: Duration::from_millis(1),
        }
    }

    #[test]
    fn one_minute_up_two_percent() {
        let engine = ChangeRateEngine::new(50.0, Duration::from_secs(86400));
        let t0 = Utc::now();
        engine.process_tick_at(&tick("BTCUSDT", 50_000.0, t0), t0);
        engine.process_tick_at(
            &tick("BTCUSDT", 51_000.0, t0 + chrono::Duration::seconds(10)),
            t0 + chrono::Duration::seconds(10),
        );
        let rate = engine.change_rate("BTCUSDT", ChangeWindow::OneMinute);
        assert_eq!(rate.start_price, 50_000.0);
        assert_eq!(rate.end_price, 51_000.0);
        assert!((rate.change_rate - 2.0).abs() < 1e-9);
        assert!(rate.is_valid);
        assert!(!rate.is_anomaly);
    }

    #[test]
    fn negative_change_within_tolerance() {
        let engine = ChangeRateEngine::new(50.0, Duration::from_secs(86400));
        let t0 = Utc::now();
        engine.process_tick_at(&tick("BTCUSDT", 55_000.0, t0), t0);
        engine.process_tick_at(
            &tick("BTCUSDT", 50_000.0, t0 + chrono::Duration::seconds(30)),
            t0 + chrono::Duration::seconds(30),
        );
        let rate = engine.change_rate("BTCUSDT", ChangeWindow::OneMinute);
        assert!((rate.change_rate - (-9.0909)).abs() < 0.01);
    }

    #[test]
    fn single_sample_is_invalid() {
        let engine = ChangeRateEngine::new(50.0, Duration::from_secs(86400));
        let t0 = Utc::now();
        engine.process_tick_at(&tick("BTCUSDT", 50_000.0, t0), t0);
        let rate = engine.change_rate("BTCUSDT", ChangeWindow::OneMinute);
        assert!(!rate.is_valid);
    }

    #[test]
    fn entries_older_than_window_are_purged() {
        let engine = ChangeRateEngine::new(50.0, Duration::from_secs(86400));
        let t0 = Utc::now();
        engine.process_tick_at(&tick("BTCUSDT", 100.0, t0), t0);
        let much_later = t0 + chrono::Duration::minutes(5);
        engine.process_tick_at(&tick("BTCUSDT", 110.0, much_later), much_later);
        // the 1m window should have purged the first sample; only one
        // entry remains, so the rate reports invalid.
        let rate = engine.change_rate("BTCUSDT", ChangeWindow::OneMinute);
        assert!(!rate.is_valid);
    }

    #[test]
    fn unknown_symbol_returns_invalid() {
        let engine = ChangeRateEngine::new(50.0, Duration::from_secs(86400));
        let rate = engine.change_rate("UNKNOWN", ChangeWindow::FiveMinutes);
        assert!(!rate.is_valid);
    }
}
