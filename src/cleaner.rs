//! Rounds/normalizes a `Tick` and records a diff against the original
//! (§4.3). Operations are order-independent; each produces at most one
//! diff entry per field.

use chrono::{DateTime, Utc};

use crate::config::{CleaningRules, RoundingMode};
use crate::models::{CleaningDiff, FieldChange, Tick};

pub struct Cleaner {
    rules: CleaningRules,
}

impl Cleaner {
    pub fn new(rules: CleaningRules) -> Self {
        Self { rules }
    }

    pub fn clean(&self, tick: &Tick) -> (Tick, CleaningDiff) {
        let mut cleaned = tick.clone();
        let mut diff = CleaningDiff::empty();

        let rounded_price = self.round(tick.price);
        if rounded_price != tick.price {
            diff.record(field_change("price", tick.price, rounded_price, "precision"));
            cleaned.price = rounded_price;
        }

        if let Some(bid) = tick.bid {
            let rounded = self.round(bid);
            if rounded != bid {
                diff.record(field_change("bidPrice", bid, rounded, "precision"));
                cleaned.bid = Some(rounded);
            }
        }
        if let Some(ask) = tick.ask {
            let rounded = self.round(ask);
            if rounded != ask {
                diff.record(field_change("askPrice", ask, rounded, "precision"));
                cleaned.ask = Some(rounded);
            }
        }

        let rounded_volume = round_to(tick.volume, 2, RoundingMode::Round);
        if rounded_volume != tick.volume {
            diff.record(field_change(
                "volume",
                tick.volume,
                rounded_volume,
                "precision",
            ));
            cleaned.volume = rounded_volume;
        }

        let aligned_ts = self.align_timestamp(tick.timestamp);
        if aligned_ts != tick.timestamp {
            diff.record(FieldChange {
                field: "timestamp".to_string(),
                original_value: tick.timestamp.to_rfc3339(),
                cleaned_value: aligned_ts.to_rfc3339(),
                reason: "alignment".to_string(),
                confidence: 1.0,
            });
            cleaned.timestamp = aligned_ts;
        }

        let rounded_latency_ms = tick.latency.as_millis() as u64;
        let rounded_latency = std::time::Duration::from_millis(rounded_latency_ms);
        if rounded_latency != tick.latency {
            diff.record(FieldChange {
                field: "latency".to_string(),
                original_value: format!("{:?}", tick.latency),
                cleaned_value: format!("{:?}", rounded_latency),
                reason: "precision".to_string(),
                confidence: 1.0,
            });
            cleaned.latency = rounded_latency;
        }

        let normalized_source = tick.source.to_lowercase();
        if normalized_source != tick.source {
            diff.record(FieldChange {
                field: "source".to_string(),
                original_value: tick.source.clone(),
                cleaned_value: normalized_source.clone(),
                reason: "normalization".to_string(),
                confidence: 1.0,
            });
            cleaned.source = normalized_source;
        }

        (cleaned, diff)
    }

    pub fn clean_batch(&self, ticks: &[Tick]) -> Vec<(Tick, CleaningDiff)> {
        ticks.iter().map(|t| self.clean(t)).collect()
    }

    fn round(&self, value: f64) -> f64 {
        round_to(value, self.rules.price_precision, self.rules.rounding)
    }

    fn align_timestamp(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let precision_ms = self.rules.time_precision_ms.max(1);
        let millis = ts.timestamp_millis();
        let aligned = if self.rules.time_alignment {
            (millis / precision_ms) * precision_ms
        } else {
            round_half_up_i64(millis, precision_ms)
        };
        DateTime::from_timestamp_millis(aligned).unwrap_or(ts)
    }
}

fn round_to(value: f64, precision: u32, mode: RoundingMode) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let scaled = value * factor;
    let rounded = match mode {
        RoundingMode::Round => round_half_up(scaled),
        RoundingMode::Floor => scaled.floor(),
        RoundingMode::Ceil => scaled.ceil(),
    };
    rounded / factor
}

fn round_half_up(value: f64) -> f64 {
    (value + 0.5 * value.signum()).trunc()
}

fn round_half_up_i64(value: i64, step: i64) -> i64 {
    let half = step / 2;
    ((value + half) / step) * step
}

fn field_change(field: &str, original: f64, cleaned: f64, reason: &str) -> FieldChange {
    FieldChange {
        field: field.to_string(),
        original_value: original.to_string(),
        cleaned_value: cleaned.to_string(),
        reason: reason.to_string(),
        confidence: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_tick() -> Tick {
        Tick {
            symbol: "BTCUSDT".into(),
            price: 50_000.123_456_789,
            bid: Some(49_999.1),
            ask: Some(50_001.1),
            volume: 1.23456,
            timestamp: Utc::now(),
            source: "BINANCE".into(),
            latency: Duration::from_micros(5_400),
        }
    }

    /// A tick whose volume/timestamp/latency/source already match the
    /// default cleaning rules exactly, so only `price` changes under
    /// rounding — isolates the price-specific quality penalty.
    fn price_only_tick() -> Tick {
        Tick {
            price: 50_000.123_456_789,
            volume: 1.0,
            timestamp: DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap(),
            latency: Duration::from_millis(5),
            source: "binance".into(),
            ..sample_tick()
        }
    }

    #[test]
    fn rounds_price_to_configured_precision() {
        let cleaner = Cleaner::new(CleaningRules {
            price_precision: 2,
            ..Default::default()
        });
        let mut tick = price_only_tick();
        tick.bid = None;
        tick.ask = None;
        let (cleaned, diff) = cleaner.clean(&tick);
        assert_eq!(cleaned.price, 50_000.12);
        assert!(diff.changes.iter().any(|c| c.field == "price"));
        assert_eq!(diff.quality, 100.0 - 5.0 - 10.0);
    }

    #[test]
    fn normalizes_source_to_lowercase() {
        let cleaner = Cleaner::new(CleaningRules::default());
        let (cleaned, diff) = cleaner.clean(&sample_tick());
        assert_eq!(cleaned.source, "binance");
        assert!(diff.changes.iter().any(|c| c.field == "source"));
    }

    #[test]
    fn quality_and_confidence_stay_in_bounds() {
        let cleaner = Cleaner::new(CleaningRules {
            price_precision: 0,
            ..Default::default()
        });
        let (_, diff) = cleaner.clean(&sample_tick());
        assert!(diff.quality >= 0.0 && diff.quality <= 100.0);
        assert!(diff.confidence >= 0.1 && diff.confidence <= 1.0);
    }
}
