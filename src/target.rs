//! Publishing targets: configured outbound endpoints with identity.
//!
//! A target's identity is its name; two targets with the same name in
//! successive registry refreshes are the same logical endpoint. Headers
//! are opaque to the registry and may carry credentials, so anything
//! user-visible goes through the masking helpers here.

use crate::format::PayloadFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol family of a target, which selects the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    IncidentTracker,
    Pager,
    Chat,
    GenericHttp,
    AlertmanagerCompat,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::IncidentTracker => "incident-tracker",
            TargetKind::Pager => "pager",
            TargetKind::Chat => "chat",
            TargetKind::GenericHttp => "generic-http",
            TargetKind::AlertmanagerCompat => "alertmanager-compat",
        }
    }
}

impl std::str::FromStr for TargetKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incident-tracker" => Ok(TargetKind::IncidentTracker),
            "pager" => Ok(TargetKind::Pager),
            "chat" => Ok(TargetKind::Chat),
            "generic-http" => Ok(TargetKind::GenericHttp),
            "alertmanager-compat" => Ok(TargetKind::AlertmanagerCompat),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured outbound endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingTarget {
    /// Unique key in the registry.
    pub name: String,
    pub kind: TargetKind,
    pub url: String,
    pub enabled: bool,
    /// Payload format override; publishers fall back to the kind's
    /// native format when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<PayloadFormat>,
    /// Opaque headers, passed through verbatim on the wire. May carry
    /// credentials; use [`PublishingTarget::masked_headers`] for logs.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl PublishingTarget {
    /// Bearer token from an `Authorization: Bearer X` header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Pager routing key: a `routing_key` header takes precedence over
    /// the bearer token.
    pub fn routing_key(&self) -> Option<&str> {
        self.header("routing_key")
            .filter(|v| !v.is_empty())
            .or_else(|| self.bearer_token())
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// URL reduced to scheme + host for logging.
    pub fn masked_url(&self) -> String {
        mask_url(&self.url)
    }

    /// Headers with credential-bearing values masked.
    pub fn masked_headers(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .map(|(k, v)| {
                let masked = if is_sensitive_header(k) { mask_token(v) } else { v.clone() };
                (k.clone(), masked)
            })
            .collect()
    }
}

fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("authorization")
        || lower.contains("token")
        || lower.contains("key")
        || lower.contains("secret")
}

/// Reduce a URL to `scheme://host/***`. Paths of chat webhooks embed the
/// credential, so everything past the host is dropped.
pub fn mask_url(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((s, r)) => (s, r),
        None => return "***".to_string(),
    };
    let host = rest.split(['/', '?']).next().unwrap_or("");
    format!("{scheme}://{host}/***")
}

/// Keep the first and last four characters of a token, mask the rest.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_with(headers: &[(&str, &str)]) -> PublishingTarget {
        PublishingTarget {
            name: "t".into(),
            kind: TargetKind::GenericHttp,
            url: "https://hooks.example.com/services/T000/B000/secretpath".into(),
            enabled: true,
            format: None,
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn bearer_token_extracted() {
        let t = target_with(&[("Authorization", "Bearer abcd1234efgh5678")]);
        assert_eq!(t.bearer_token(), Some("abcd1234efgh5678"));
    }

    #[test]
    fn missing_bearer_prefix_yields_none() {
        let t = target_with(&[("Authorization", "Basic dXNlcg==")]);
        assert_eq!(t.bearer_token(), None);
    }

    #[test]
    fn routing_key_header_wins_over_bearer() {
        let t = target_with(&[
            ("Authorization", "Bearer bearer-token-value"),
            ("routing_key", "RK123456"),
        ]);
        assert_eq!(t.routing_key(), Some("RK123456"));
    }

    #[test]
    fn routing_key_falls_back_to_bearer() {
        let t = target_with(&[("Authorization", "Bearer bearer-token-value")]);
        assert_eq!(t.routing_key(), Some("bearer-token-value"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let t = target_with(&[("Content-Type", "application/json")]);
        assert_eq!(t.header("content-type"), Some("application/json"));
    }

    #[test]
    fn url_masking_strips_path_and_query() {
        assert_eq!(
            mask_url("https://hooks.example.com/services/T000/B000/secret?x=1"),
            "https://hooks.example.com/***"
        );
        assert_eq!(mask_url("not a url"), "***");
    }

    #[test]
    fn token_masking_keeps_edges() {
        assert_eq!(mask_token("abcd1234efgh5678"), "abcd...5678");
        assert_eq!(mask_token("short"), "***");
    }

    #[test]
    fn masked_headers_hide_credentials() {
        let t = target_with(&[
            ("Authorization", "Bearer abcd1234efgh5678"),
            ("X-Env", "production"),
        ]);
        let masked = t.masked_headers();
        assert!(!masked["Authorization"].contains("1234efgh"));
        assert_eq!(masked["X-Env"], "production");
    }

    #[test]
    fn kind_parses_all_families() {
        for kind in [
            TargetKind::IncidentTracker,
            TargetKind::Pager,
            TargetKind::Chat,
            TargetKind::GenericHttp,
            TargetKind::AlertmanagerCompat,
        ] {
            assert_eq!(kind.as_str().parse::<TargetKind>().unwrap(), kind);
        }
    }
}
