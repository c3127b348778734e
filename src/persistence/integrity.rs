//! Per-item format validation and per-batch consistency checks (§4.7).

use chrono::{DateTime, Utc};

use crate::models::PersistenceItem;

pub struct IntegrityChecker;

impl IntegrityChecker {
    /// `{non-empty id/type, non-nil data, timestamp within [now-24h,
    /// now+1h], priority in [0,10], retryCount in [0,10]}`.
    pub fn validate_format(item: &PersistenceItem) -> Result<(), String> {
        Self::validate_format_at(item, Utc::now())
    }

    fn validate_format_at(item: &PersistenceItem, now: DateTime<Utc>) -> Result<(), String> {
        if item.id.is_empty() {
            return Err("item id must not be empty".to_string());
        }
        if item.data.is_null() {
            return Err("item data must not be null".to_string());
        }
        let lower = now - chrono::Duration::hours(24);
        let upper = now + chrono::Duration::hours(1);
        if item.timestamp < lower || item.timestamp > upper {
            return Err(format!(
                "timestamp {} outside allowed window [{lower}, {upper}]",
                item.timestamp
            ));
        }
        if item.priority > 10 {
            return Err("priority must be in [0,10]".to_string());
        }
        if item.retry_count > 10 {
            return Err("retryCount must be in [0,10]".to_string());
        }
        Ok(())
    }

    /// Strictly non-decreasing timestamps within the batch, no duplicate
    /// ids. Applies within a batch only; inter-batch ordering is not
    /// guaranteed (§5).
    pub fn check_consistency(batch: &[PersistenceItem]) -> Result<(), String> {
        let mut seen_ids = std::collections::HashSet::new();
        let mut prev_ts: Option<DateTime<Utc>> = None;
        for item in batch {
            if !seen_ids.insert(&item.id) {
                return Err(format!("duplicate id '{}' within batch", item.id));
            }
            if let Some(prev) = prev_ts {
                if item.timestamp < prev {
                    return Err("batch timestamps are not non-decreasing".to_string());
                }
            }
            prev_ts = Some(item.timestamp);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PersistenceItemType;
    use serde_json::json;

    fn item(id: &str, ts: DateTime<Utc>) -> PersistenceItem {
        let mut item = PersistenceItem::new(PersistenceItemType::Price, id, json!({"v": 1}));
        item.timestamp = ts;
        item
    }

    #[test]
    fn rejects_empty_id() {
        let mut i = item("X", Utc::now());
        i.id = String::new();
        assert!(IntegrityChecker::validate_format(&i).is_err());
    }

    #[test]
    fn rejects_timestamp_too_far_in_past() {
        let i = item("X", Utc::now() - chrono::Duration::hours(48));
        assert!(IntegrityChecker::validate_format(&i).is_err());
    }

    #[test]
    fn accepts_timestamp_within_window() {
        let i = item("X", Utc::now());
        assert!(IntegrityChecker::validate_format(&i).is_ok());
    }

    #[test]
    fn detects_duplicate_ids_in_batch() {
        let now = Utc::now();
        let batch = vec![item("X", now), item("X", now)];
        assert!(IntegrityChecker::check_consistency(&batch).is_err());
    }

    #[test]
    fn detects_non_monotonic_timestamps() {
        let now = Utc::now();
        let batch = vec![
            item("A", now),
            item("B", now - chrono::Duration::seconds(5)),
        ];
        assert!(IntegrityChecker::check_consistency(&batch).is_err());
    }

    #[test]
    fn accepts_well_formed_batch() {
        let now = Utc::now();
        let batch = vec![
            item("A", now),
            item("B", now + chrono::Duration::seconds(1)),
        ];
        assert!(IntegrityChecker::check_consistency(&batch).is_ok());
    }
}
