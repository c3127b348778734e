//! `alerts`/`rules` maps and rule evaluation (§4.10).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::TickstreamError;
use crate::models::{Alert, AlertLevel, AlertRule};

pub struct AlertManager {
    alerts: RwLock<HashMap<String, Alert>>,
    rules: RwLock<HashMap<String, AlertRule>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.write().insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, id: &str) {
        self.rules.write().remove(id);
    }

    pub fn create_alert(&self, alert: Alert) -> Result<(), TickstreamError> {
        let mut alerts = self.alerts.write();
        if alerts.contains_key(&alert.id) {
            return Err(TickstreamError::Data {
                symbol: alert.id.clone(),
                message: "alert with this id already exists".to_string(),
            });
        }
        alerts.insert(alert.id.clone(), alert);
        Ok(())
    }

    pub fn resolve_alert(&self, id: &str) -> Result<(), TickstreamError> {
        let mut alerts = self.alerts.write();
        match alerts.get_mut(id) {
            None => Err(TickstreamError::Data {
                symbol: id.to_string(),
                message: "no such alert".to_string(),
            }),
            Some(alert) if alert.resolved => Err(TickstreamError::Data {
                symbol: id.to_string(),
                message: "alert already resolved".to_string(),
            }),
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(chrono::Utc::now());
                Ok(())
            }
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .values()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Evaluates every enabled rule once against the supplied metric
    /// lookup, raising an alert for any rule whose `condition` metric
    /// exceeds `threshold`. `condition` is treated as a metric name —
    /// richer expression evaluation is out of scope here.
    pub fn check_alerts(&self, metric_value: impl Fn(&str) -> Option<f64>) -> Vec<Alert> {
        let rules: Vec<AlertRule> = self
            .rules
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        let mut raised = Vec::new();
        for rule in rules {
            if let Some(value) = metric_value(&rule.condition) {
                if value > rule.threshold {
                    let alert = Alert::new(
                        rule.level,
                        rule.name.clone(),
                        format!(
                            "{} = {value} exceeded threshold {}",
                            rule.condition, rule.threshold
                        ),
                        "alert_manager",
                    );
                    if self.create_alert(alert.clone()).is_ok() {
                        raised.push(alert);
                    }
                }
            }
        }
        raised
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rule(id: &str, condition: &str, threshold: f64) -> AlertRule {
        AlertRule {
            id: id.to_string(),
            name: format!("{id}-rule"),
            condition: condition.to_string(),
            threshold,
            duration: Duration::from_secs(0),
            level: AlertLevel::Warning,
            enabled: true,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn duplicate_alert_id_is_rejected() {
        let manager = AlertManager::new();
        let alert = Alert::new(AlertLevel::Info, "t", "m", "s");
        manager.create_alert(alert.clone()).unwrap();
        assert!(manager.create_alert(alert).is_err());
    }

    #[test]
    fn resolving_twice_is_rejected() {
        let manager = AlertManager::new();
        let alert = Alert::new(AlertLevel::Info, "t", "m", "s");
        let id = alert.id.clone();
        manager.create_alert(alert).unwrap();
        manager.resolve_alert(&id).unwrap();
        assert!(manager.resolve_alert(&id).is_err());
    }

    #[test]
    fn check_alerts_raises_when_threshold_exceeded() {
        let manager = AlertManager::new();
        manager.add_rule(rule("high-error-rate", "error_rate", 0.1));
        let raised = manager.check_alerts(|metric| {
            if metric == "error_rate" {
                Some(0.5)
            } else {
                None
            }
        });
        assert_eq!(raised.len(), 1);
        assert_eq!(manager.active_alerts().len(), 1);
    }

    #[test]
    fn disabled_rule_is_never_evaluated() {
        let manager = AlertManager::new();
        let mut r = rule("x", "error_rate", 0.1);
        r.enabled = false;
        manager.add_rule(r);
        let raised = manager.check_alerts(|_| Some(100.0));
        assert!(raised.is_empty());
    }
}
