//! The enriched alert model handed in by the upstream pipeline.
//!
//! An [`EnrichedAlert`] is immutable after construction and shared by
//! reference across the queue, publishers, and the dead-letter store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle phase of an alert. The fingerprint is stable across the
/// transition, which is what lets publishers correlate a resolve with
/// the trigger that preceded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl AlertStatus {
    pub fn is_firing(&self) -> bool {
        matches!(self, AlertStatus::Firing)
    }
}

/// Severity assigned by the classifier or carried in labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "warning" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            _ => Err(()),
        }
    }
}

/// Optional classification attached by the enrichment pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub severity: Severity,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// An alert plus optional classification, as produced by the upstream
/// enrichment pipeline. Not mutated by anything in this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedAlert {
    /// Opaque identifier, stable across the fire/resolve lifecycle.
    pub fingerprint: String,
    pub name: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

impl EnrichedAlert {
    /// Effective severity: classification wins, then the `severity`
    /// label, then `warning`.
    pub fn severity(&self) -> Severity {
        if let Some(c) = &self.classification {
            return c.severity;
        }
        self.labels
            .get("severity")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::Warning)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(status: AlertStatus) -> EnrichedAlert {
        EnrichedAlert {
            fingerprint: "fp1".into(),
            name: "HighLatency".into(),
            status,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            generator_url: None,
            classification: None,
        }
    }

    #[test]
    fn severity_defaults_to_warning() {
        assert_eq!(alert(AlertStatus::Firing).severity(), Severity::Warning);
    }

    #[test]
    fn severity_label_is_consulted() {
        let mut a = alert(AlertStatus::Firing);
        a.labels.insert("severity".into(), "critical".into());
        assert_eq!(a.severity(), Severity::Critical);
    }

    #[test]
    fn classification_overrides_label() {
        let mut a = alert(AlertStatus::Firing);
        a.labels.insert("severity".into(), "critical".into());
        a.classification = Some(Classification {
            severity: Severity::Info,
            confidence: 0.9,
            reasoning: "noise".into(),
            recommendations: vec![],
        });
        assert_eq!(a.severity(), Severity::Info);
    }

    #[test]
    fn unparsable_severity_label_falls_back() {
        let mut a = alert(AlertStatus::Firing);
        a.labels.insert("severity".into(), "page-me-maybe".into());
        assert_eq!(a.severity(), Severity::Warning);
    }

    #[test]
    fn serde_round_trips_status() {
        let json = serde_json::to_string(&AlertStatus::Resolved).unwrap();
        assert_eq!(json, "\"resolved\"");
    }
}
