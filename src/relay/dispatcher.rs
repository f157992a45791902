use std::sync::Arc;

use chrono::Local;
use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};
use crate::relay::config::Config;
use crate::relay::content::extract_content;
use crate::relay::message::{NewsMessage, PushReceipt};
use crate::security::audit_log::AuditLogger;
use crate::security::credential_cache::CredentialCache;
use crate::security::token_issuer::{HttpTokenIssuer, TokenIssuer};

// errcodes meaning the access token itself is no longer accepted
const TOKEN_REJECTED_CODES: &[i64] = &[40014, 42001];

/// Forwards NAS events to the push API.
pub struct NotificationDispatcher<I = HttpTokenIssuer> {
    http_client: Client,
    credentials: CredentialCache<I>,
    audit: AuditLogger,
}

impl<I> Clone for NotificationDispatcher<I> {
    fn clone(&self) -> Self {
        Self {
            http_client: self.http_client.clone(),
            credentials: self.credentials.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl<I> std::fmt::Debug for NotificationDispatcher<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl<I: TokenIssuer + 'static> NotificationDispatcher<I> {
    pub fn new(http_client: Client, credentials: CredentialCache<I>) -> Self {
        Self {
            http_client,
            credentials,
            audit: AuditLogger::new(),
        }
    }

    pub fn credentials(&self) -> &CredentialCache<I> {
        &self.credentials
    }

    /// Deliver one event and report what the push API said.
    pub async fn dispatch(&self, config: &Config, event: &Value) -> RelayResult<PushReceipt> {
        if !config.is_ready() {
            return Err(RelayError::NotConfigured);
        }

        let token = self
            .credentials
            .get_or_refresh(&config.credential_key())
            .await?;

        let content = extract_content(event);
        let message = NewsMessage::for_event(config, &content, Local::now());
        let url = format!("{}/cgi-bin/message/send", config.base_url());

        let response = self
            .http_client
            .post(&url)
            .query(&[("access_token", token.as_str())])
            .json(&message)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = %status, body = %body, "push API response");

        match PushReceipt::from_body(&body) {
            Err(RelayError::PushRejected { errcode, errmsg }) => {
                if TOKEN_REJECTED_CODES.contains(&errcode) {
                    warn!(errcode, "push API rejected cached token, dropping it");
                    self.credentials.invalidate().await;
                }
                Err(RelayError::PushRejected { errcode, errmsg })
            }
            other => other,
        }
    }

    /// Fire-and-forget delivery; the outcome only reaches the logs.
    pub fn spawn(&self, config: Arc<Config>, event: Value) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            match dispatcher.dispatch(&config, &event).await {
                Ok(receipt) => dispatcher.audit.push_delivered(receipt.msgid.as_deref()),
                Err(err) => dispatcher.audit.push_failed(err.kind(), &err.to_string()),
            }
        })
    }
}
