//! Structural + range + timestamp validation (§4.2). Pure function over a
//! single `Tick` plus a rule set; no shared state, no locking.

use chrono::{DateTime, Utc};

use crate::config::ValidationRules;
use crate::models::{Severity, Tick, ValidationError, ValidationReport, ValidationWarning};

pub struct Validator {
    rules: ValidationRules,
}

impl Validator {
    pub fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }

    pub fn validate(&self, tick: &Tick) -> ValidationReport {
        self.validate_at(tick, Utc::now())
    }

    pub fn validate_at(&self, tick: &Tick, now: DateTime<Utc>) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut score: f64 = 100.0;

        if tick.symbol.is_empty() {
            errors.push(err("symbol", "required", "symbol must not be empty"));
            score -= 40.0;
        }
        if tick.source.is_empty() {
            errors.push(err("source", "required", "source must not be empty"));
            score -= 20.0;
        }

        if tick.price <= 0.0 {
            errors.push(err("price", "range", "price must be > 0"));
            score -= 40.0;
        } else if tick.price < self.rules.min_price || tick.price > self.rules.max_price {
            errors.push(err(
                "price",
                "range",
                &format!(
                    "price {} outside configured range [{}, {}]",
                    tick.price, self.rules.min_price, self.rules.max_price
                ),
            ));
            score -= 30.0;
        }

        if tick.volume < self.rules.min_volume {
            errors.push(err("volume", "range", "volume below configured minimum"));
            score -= 20.0;
        }

        if tick.latency > self.rules.max_latency {
            warnings.push(warn(
                "latency",
                "high_latency",
                "latency exceeds configured maximum",
                0.6,
            ));
            score -= 5.0;
        }

        let allowed_future =
            chrono::Duration::from_std(self.rules.allowed_future).unwrap_or_default();
        if tick.timestamp > now + allowed_future {
            errors.push(err(
                "timestamp",
                "future",
                "timestamp is further in the future than allowed",
            ));
            score -= 30.0;
        }
        if tick.timestamp.timestamp_millis() == 0 {
            errors.push(err("timestamp", "required", "timestamp must be non-zero"));
            score -= 40.0;
        }

        if let (Some(bid), Some(ask)) = (tick.bid, tick.ask) {
            if ask < bid {
                errors.push(err("ask", "range", "ask must be >= bid"));
                score -= 20.0;
            } else if bid > 0.0 {
                let spread_pct = (ask - bid) / bid * 100.0;
                if spread_pct > self.rules.max_spread_pct {
                    warnings.push(warn(
                        "spread",
                        "wide_spread",
                        "bid/ask spread exceeds configured percentage",
                        0.5,
                    ));
                    score -= 5.0;
                }
            }
        }

        let extreme_cutoff = self.rules.max_price / self.rules.extreme_price_multiple;
        if tick.price > extreme_cutoff {
            warnings.push(warn(
                "price",
                "extreme_price",
                "price is an extreme outlier relative to configured bounds",
                0.4,
            ));
            score -= 5.0;
        }

        score = score.clamp(0.0, 100.0);
        let is_valid = ValidationReport::compute_validity(&errors, score);

        ValidationReport {
            is_valid,
            score,
            errors,
            warnings,
        }
    }

    pub fn validate_batch(&self, ticks: &[Tick]) -> Vec<ValidationReport> {
        ticks.iter().map(|t| self.validate(t)).collect()
    }
}

fn err(field: &str, code: &str, message: &str) -> ValidationError {
    ValidationError {
        field: field.to_string(),
        code: code.to_string(),
        severity: Severity::Error,
        message: message.to_string(),
        suggestion: None,
    }
}

fn warn(field: &str, code: &str, message: &str, confidence: f64) -> ValidationWarning {
    ValidationWarning {
        field: field.to_string(),
        code: code.to_string(),
        message: message.to_string(),
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_tick() -> Tick {
        Tick {
            symbol: "BTCUSDT".into(),
            price: 50_000.0,
            bid: Some(49_999.0),
            ask: Some(50_001.0),
            volume: 1.5,
            timestamp: Utc::now(),
            source: "binance".into(),
            latency: Duration::from_millis(10),
        }
    }

    #[test]
    fn valid_tick_passes() {
        let v = Validator::new(ValidationRules::default());
        let report = v.validate(&sample_tick());
        assert!(report.is_valid);
        assert_eq!(report.score, 100.0);
    }

    #[test]
    fn zero_price_is_invalid() {
        let v = Validator::new(ValidationRules::default());
        let mut t = sample_tick();
        t.price = 0.0;
        let report = v.validate(&t);
        assert!(!report.is_valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.field == "price" && e.severity == Severity::Error));
    }

    #[test]
    fn far_future_timestamp_is_invalid() {
        let rules = ValidationRules {
            allowed_future: Duration::from_secs(60),
            ..Default::default()
        };
        let v = Validator::new(rules);
        let mut t = sample_tick();
        t.timestamp = Utc::now() + chrono::Duration::minutes(5);
        let report = v.validate(&t);
        assert!(!report.is_valid);
    }

    #[test]
    fn ask_below_bid_is_invalid() {
        let v = Validator::new(ValidationRules::default());
        let mut t = sample_tick();
        t.bid = Some(100.0);
        t.ask = Some(90.0);
        let report = v.validate(&t);
        assert!(!report.is_valid);
    }
}
