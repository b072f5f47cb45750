//! Rendering enriched alerts into format-specific payloads.
//!
//! The formatter is pure: no I/O, no clocks. Publishers wrap the
//! rendered payload into their lifecycle envelope (dedup keys, event
//! actions, thread anchors) before it reaches the wire.

use crate::alert::{AlertStatus, EnrichedAlert};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Human-display title limit.
pub const MAX_TITLE_LEN: usize = 200;
/// Free-text body limit.
pub const MAX_TEXT_LEN: usize = 4096;

/// Wire formats, one per target family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadFormat {
    GenericJson,
    Alertmanager,
    IncidentTracker,
    Pager,
    ChatMessage,
}

impl PayloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::GenericJson => "generic-json",
            PayloadFormat::Alertmanager => "alertmanager",
            PayloadFormat::IncidentTracker => "incident-tracker",
            PayloadFormat::Pager => "pager",
            PayloadFormat::ChatMessage => "chat-message",
        }
    }
}

impl std::str::FromStr for PayloadFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic-json" => Ok(PayloadFormat::GenericJson),
            "alertmanager" => Ok(PayloadFormat::Alertmanager),
            "incident-tracker" => Ok(PayloadFormat::IncidentTracker),
            "pager" => Ok(PayloadFormat::Pager),
            "chat-message" => Ok(PayloadFormat::ChatMessage),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("alert is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Render an alert to the payload for the given format.
pub fn format_alert(alert: &EnrichedAlert, format: PayloadFormat) -> Result<Value, FormatError> {
    if alert.fingerprint.is_empty() {
        return Err(FormatError::MissingField("fingerprint"));
    }
    if alert.name.is_empty() {
        return Err(FormatError::MissingField("name"));
    }

    let payload = match format {
        PayloadFormat::GenericJson => generic_json(alert),
        PayloadFormat::Alertmanager => alertmanager(alert),
        PayloadFormat::IncidentTracker => incident_tracker(alert),
        PayloadFormat::Pager => pager(alert),
        PayloadFormat::ChatMessage => chat_message(alert),
    };
    Ok(payload)
}

fn status_str(alert: &EnrichedAlert) -> &'static str {
    match alert.status {
        AlertStatus::Firing => "firing",
        AlertStatus::Resolved => "resolved",
    }
}

fn title(alert: &EnrichedAlert) -> String {
    let title = format!(
        "[{}] [{}] {}",
        status_str(alert).to_uppercase(),
        alert.severity().as_str(),
        alert.name
    );
    truncate(&title, MAX_TITLE_LEN)
}

fn summary_text(alert: &EnrichedAlert) -> String {
    let text = alert
        .annotation("summary")
        .or_else(|| alert.annotation("description"))
        .unwrap_or(&alert.name);
    truncate(text, MAX_TEXT_LEN)
}

fn generic_json(alert: &EnrichedAlert) -> Value {
    let mut payload = json!({
        "fingerprint": alert.fingerprint,
        "alertname": alert.name,
        "status": status_str(alert),
        "severity": alert.severity().as_str(),
        "labels": alert.labels,
        "annotations": alert.annotations,
        "startsAt": alert.starts_at.to_rfc3339(),
    });
    if let Some(url) = &alert.generator_url {
        payload["generatorURL"] = json!(url);
    }
    if let Some(c) = &alert.classification {
        payload["classification"] = json!({
            "severity": c.severity.as_str(),
            "confidence": c.confidence,
            "reasoning": truncate(&c.reasoning, MAX_TEXT_LEN),
            "recommendations": c.recommendations,
        });
    }
    payload
}

fn alertmanager(alert: &EnrichedAlert) -> Value {
    let mut labels = alert.labels.clone();
    labels.insert("alertname".into(), alert.name.clone());
    json!([{
        "labels": labels,
        "annotations": alert.annotations,
        "startsAt": alert.starts_at.to_rfc3339(),
        "generatorURL": alert.generator_url.clone().unwrap_or_default(),
        "status": status_str(alert),
    }])
}

fn incident_tracker(alert: &EnrichedAlert) -> Value {
    let mut description = summary_text(alert);
    if let Some(c) = &alert.classification {
        if !c.reasoning.is_empty() {
            description =
                truncate(&format!("{description}\n\nClassifier: {}", c.reasoning), MAX_TEXT_LEN);
        }
    }
    json!({
        "title": title(alert),
        "description": description,
        "severity": alert.severity().as_str(),
        "status": status_str(alert),
        "fingerprint": alert.fingerprint,
        "labels": alert.labels,
    })
}

fn pager(alert: &EnrichedAlert) -> Value {
    json!({
        "summary": truncate(&format!("{}: {}", alert.name, summary_text(alert)), 1024),
        "severity": alert.severity().as_str(),
        "source": alert.generator_url.clone().unwrap_or_else(|| "alert-history".into()),
        "custom_details": {
            "fingerprint": alert.fingerprint,
            "labels": alert.labels,
            "annotations": alert.annotations,
        },
    })
}

fn chat_message(alert: &EnrichedAlert) -> Value {
    let mut lines = vec![format!("*{}*", title(alert)), summary_text(alert)];
    if let Some(c) = &alert.classification {
        if !c.recommendations.is_empty() {
            lines.push(format!("Recommended: {}", c.recommendations.join("; ")));
        }
    }
    json!({ "text": truncate(&lines.join("\n"), MAX_TEXT_LEN) })
}

/// Truncate on a char boundary, appending an ellipsis when cut.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max.saturating_sub(1);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
