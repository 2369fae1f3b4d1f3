//! Webhook Ingress (spec §4.9, §6.3): verifies signed external callbacks,
//! maps them onto an approve/reject decision, and hands that decision to
//! `OrchestratorServices::resolve_approval`.
//!
//! Verification and decision derivation are kept as free functions / a small
//! stateful guard so they can be unit-tested without a running server; the
//! HTTP layer (`api.rs`) owns pulling headers off the request.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::OrchestratorConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("unknown webhook channel '{0}'")]
    UnknownChannel(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("timestamp skew exceeds tolerance")]
    StaleTimestamp,
    #[error("no REQUEST_ID tag and no matching external_ref")]
    UnresolvableRequest,
    #[error("payload carries no actionable decision (no directive, reaction, or status)")]
    NoDecision,
}

/// The three headers spec §6.3 requires on every webhook request.
#[derive(Debug, Clone)]
pub struct WebhookHeaders {
    /// `X-Signature: sha256=<hex>`, already stripped of the header name.
    pub signature: String,
    /// `X-Timestamp: <unix>`.
    pub timestamp: i64,
    /// `X-Event-Id: <uuid>`.
    pub event_id: Uuid,
}

/// Channel-specific body, normalized to the three decision sources the spec
/// names: an explicit directive in a comment body, a reaction, or a status
/// change on the referenced object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub comment_body: Option<String>,
    #[serde(default)]
    pub reaction: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// The opaque ref HM handed back from `ApprovalRequest.external_ref`,
    /// used to look up the request when no `REQUEST_ID=` tag is present.
    #[serde(default)]
    pub external_ref: Option<String>,
}

fn verify_signature(secret: &str, timestamp: i64, raw_body: &str, signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{timestamp}.{raw_body}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDecision {
    Approve,
    Reject,
}

fn request_id_tag() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"REQUEST_ID=([0-9a-fA-F-]{36})").expect("valid regex"))
}

/// Extracts the `REQUEST_ID=<uuid>` tag from a comment body, if present.
pub fn extract_request_id(comment_body: &str) -> Option<Uuid> {
    request_id_tag()
        .captures(comment_body)
        .and_then(|c| c.get(1))
        .and_then(|m| Uuid::parse_str(m.as_str()).ok())
}

/// Precedence per spec §4.9: explicit body directive > reaction > status.
pub fn derive_decision(payload: &WebhookPayload) -> Option<WebhookDecision> {
    if let Some(body) = &payload.comment_body {
        if let Some(decision) = directive_from_body(body) {
            return Some(decision);
        }
    }
    if let Some(reaction) = &payload.reaction {
        if let Some(decision) = decision_from_reaction(reaction) {
            return Some(decision);
        }
    }
    payload.status.as_deref().and_then(decision_from_status)
}

fn directive_from_body(body: &str) -> Option<WebhookDecision> {
    let lower = body.to_lowercase();
    if lower.contains("/approve") {
        Some(WebhookDecision::Approve)
    } else if lower.contains("/reject") {
        Some(WebhookDecision::Reject)
    } else {
        None
    }
}

fn decision_from_reaction(reaction: &str) -> Option<WebhookDecision> {
    match reaction {
        "+1" | "thumbsup" | "thumbs_up" => Some(WebhookDecision::Approve),
        "-1" | "thumbsdown" | "thumbs_down" => Some(WebhookDecision::Reject),
        _ => None,
    }
}

fn decision_from_status(status: &str) -> Option<WebhookDecision> {
    match status.to_lowercase().as_str() {
        "approved" | "merged" => Some(WebhookDecision::Approve),
        "closed" | "rejected" | "declined" => Some(WebhookDecision::Reject),
        _ => None,
    }
}

/// Bounded ring of recently-seen event ids. Capacity-bounded rather than
/// time-bounded: the spec only requires duplicate suppression, not a
/// specific retention window.
struct ReplayGuard {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl ReplayGuard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns `true` if this is the first time `event_id` has been seen.
    fn observe(&mut self, event_id: Uuid) -> bool {
        if !self.seen.insert(event_id) {
            return false;
        }
        self.order.push_back(event_id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Fresh,
    /// Duplicate `event_id`: spec §6.3 says no-op with 200, not an error.
    Duplicate,
}

pub struct WebhookIngress {
    secrets: HashMap<String, String>,
    skew_tolerance: Duration,
    replay: Mutex<ReplayGuard>,
}

impl WebhookIngress {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            secrets: config.webhook_secrets.clone(),
            skew_tolerance: config.replay_reject,
            replay: Mutex::new(ReplayGuard::new(config.webhook_replay_lru_capacity)),
        }
    }

    /// Verifies signature and timestamp skew, then checks replay. A stale
    /// signature or bad timestamp is rejected outright; a duplicate
    /// `event_id` is reported so the caller can return 200 without acting.
    pub async fn verify(
        &self,
        channel: &str,
        headers: &WebhookHeaders,
        raw_body: &str,
    ) -> Result<VerifyOutcome, WebhookError> {
        let secret = self
            .secrets
            .get(channel)
            .ok_or_else(|| WebhookError::UnknownChannel(channel.to_string()))?;

        if !verify_signature(secret, headers.timestamp, raw_body, &headers.signature) {
            return Err(WebhookError::BadSignature);
        }

        let skew = (Utc::now().timestamp() - headers.timestamp).unsigned_abs();
        if skew > self.skew_tolerance.as_secs() {
            return Err(WebhookError::StaleTimestamp);
        }

        let mut replay = self.replay.lock().await;
        if replay.observe(headers.event_id) {
            Ok(VerifyOutcome::Fresh)
        } else {
            Ok(VerifyOutcome::Duplicate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_headers(secret: &str, timestamp: i64, body: &str, event_id: Uuid) -> WebhookHeaders {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{body}").as_bytes());
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        WebhookHeaders { signature, timestamp, event_id }
    }

    fn config_with_secret(channel: &str, secret: &str) -> OrchestratorConfig {
        let mut cfg = OrchestratorConfig::default();
        cfg.webhook_secrets.insert(channel.to_string(), secret.to_string());
        cfg
    }

    #[tokio::test]
    async fn valid_signature_and_fresh_event_is_accepted() {
        let cfg = config_with_secret("github", "s3cr3t");
        let ingress = WebhookIngress::new(&cfg);
        let body = r#"{"comment":"/approve"}"#;
        let headers = signed_headers("s3cr3t", Utc::now().timestamp(), body, Uuid::now_v7());
        let outcome = ingress.verify("github", &headers, body).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Fresh);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let cfg = config_with_secret("github", "s3cr3t");
        let ingress = WebhookIngress::new(&cfg);
        let body = "{}";
        let headers = signed_headers("wrong-secret", Utc::now().timestamp(), body, Uuid::now_v7());
        let err = ingress.verify("github", &headers, body).await.unwrap_err();
        assert!(matches!(err, WebhookError::BadSignature));
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let cfg = config_with_secret("github", "s3cr3t");
        let ingress = WebhookIngress::new(&cfg);
        let body = "{}";
        let old_timestamp = Utc::now().timestamp() - 600;
        let headers = signed_headers("s3cr3t", old_timestamp, body, Uuid::now_v7());
        let err = ingress.verify("github", &headers, body).await.unwrap_err();
        assert!(matches!(err, WebhookError::StaleTimestamp));
    }

    #[tokio::test]
    async fn duplicate_event_id_is_a_noop_not_an_error() {
        let cfg = config_with_secret("github", "s3cr3t");
        let ingress = WebhookIngress::new(&cfg);
        let body = "{}";
        let event_id = Uuid::now_v7();
        let headers = signed_headers("s3cr3t", Utc::now().timestamp(), body, event_id);
        assert_eq!(ingress.verify("github", &headers, body).await.unwrap(), VerifyOutcome::Fresh);
        assert_eq!(ingress.verify("github", &headers, body).await.unwrap(), VerifyOutcome::Duplicate);
    }

    #[test]
    fn request_id_tag_is_extracted_from_comment() {
        let body = "Looks good. REQUEST_ID=01890a5d-ac96-774b-bcce-b302099a8057 approved.";
        let id = extract_request_id(body).unwrap();
        assert_eq!(id.to_string(), "01890a5d-ac96-774b-bcce-b302099a8057");
    }

    #[test]
    fn body_directive_takes_precedence_over_reaction_and_status() {
        let payload = WebhookPayload {
            comment_body: Some("/reject, blocked by compliance".to_string()),
            reaction: Some("+1".to_string()),
            status: Some("approved".to_string()),
            external_ref: None,
        };
        assert_eq!(derive_decision(&payload), Some(WebhookDecision::Reject));
    }

    #[test]
    fn reaction_takes_precedence_over_status() {
        let payload = WebhookPayload {
            comment_body: None,
            reaction: Some("-1".to_string()),
            status: Some("approved".to_string()),
            external_ref: None,
        };
        assert_eq!(derive_decision(&payload), Some(WebhookDecision::Reject));
    }

    #[test]
    fn status_used_when_nothing_else_present() {
        let payload = WebhookPayload {
            comment_body: None,
            reaction: None,
            status: Some("merged".to_string()),
            external_ref: None,
        };
        assert_eq!(derive_decision(&payload), Some(WebhookDecision::Approve));
    }

    #[test]
    fn no_signal_yields_no_decision() {
        let payload = WebhookPayload::default();
        assert_eq!(derive_decision(&payload), None);
    }
}
