use tracing::{error, info, warn};

/// Structured records for security-relevant relay events, under `target: "audit"`.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn challenge_verified(&self, client_ip: &str, nonce: &str) {
        info!(target: "audit", event = "challenge_verified", client_ip, nonce);
    }

    pub fn challenge_malformed(&self, client_ip: &str, missing: &str) {
        warn!(target: "audit", event = "challenge_malformed", client_ip, missing);
    }

    pub fn signature_invalid(&self, client_ip: &str, nonce: &str) {
        warn!(target: "audit", event = "signature_invalid", client_ip, nonce);
    }

    pub fn decrypt_failed(&self, client_ip: &str, kind: &str, detail: &str) {
        warn!(target: "audit", event = "decrypt_failed", client_ip, kind, detail);
    }

    pub fn event_accepted(&self, client_ip: &str) {
        info!(target: "audit", event = "event_accepted", client_ip);
    }

    pub fn event_rejected(&self, client_ip: &str, reason: &str) {
        warn!(target: "audit", event = "event_rejected", client_ip, reason);
    }

    pub fn push_delivered(&self, msgid: Option<&str>) {
        info!(target: "audit", event = "push_delivered", msgid = msgid.unwrap_or(""));
    }

    pub fn push_failed(&self, kind: &str, error_msg: &str) {
        error!(target: "audit", event = "push_failed", kind, error = error_msg);
    }
}
