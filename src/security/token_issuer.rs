use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};

pub const DEFAULT_EXPIRES_IN: i64 = 7200;

/// Identity a credential is issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub corp_id: String,
    pub corp_secret: String,
    pub base_url: String,
}

impl CredentialKey {
    pub fn new(
        corp_id: impl Into<String>,
        corp_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            corp_id: corp_id.into(),
            corp_secret: corp_secret.into(),
            base_url: base_url.into(),
        }
    }
}

/// Token handed out by the issuance endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: i64,
}

/// Source of fresh access tokens.
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, key: &CredentialKey) -> impl Future<Output = RelayResult<IssuedToken>> + Send;
}

/// `GET {base_url}/cgi-bin/gettoken` response.
#[derive(Debug, Deserialize)]
struct GetTokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
    access_token: Option<String>,
    expires_in: Option<i64>,
}

/// Token issuer backed by the push API's `gettoken` endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenIssuer {
    http_client: Client,
}

impl HttpTokenIssuer {
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }

    pub fn with_timeout(timeout: Duration) -> RelayResult<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self::new(http_client))
    }
}

impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self, key: &CredentialKey) -> RelayResult<IssuedToken> {
        let url = format!("{}/cgi-bin/gettoken", key.base_url);
        debug!(corp_id = %key.corp_id, url = %url, "requesting access token");

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("corpid", key.corp_id.as_str()),
                ("corpsecret", key.corp_secret.as_str()),
            ])
            .send()
            .await?;

        let body = response.text().await?;
        let parsed: GetTokenResponse = serde_json::from_str(&body)
            .map_err(|e| RelayError::InvalidResponse(format!("gettoken: {e}")))?;

        if parsed.errcode != 0 {
            let errmsg = parsed.errmsg.unwrap_or_default();
            return Err(RelayError::RemoteToken(format!(
                "errcode {}: {}",
                parsed.errcode, errmsg
            )));
        }

        let access_token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(RelayError::MissingAccessToken)?;

        let expires_in = match parsed.expires_in {
            Some(secs) if secs > 0 => secs,
            Some(secs) => {
                warn!(expires_in = secs, "non-positive token lifetime, using default");
                DEFAULT_EXPIRES_IN
            }
            None => DEFAULT_EXPIRES_IN,
        };

        Ok(IssuedToken {
            access_token,
            expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn key(base_url: &str) -> CredentialKey {
        CredentialKey::new("ww1234", "s3cr3t", base_url)
    }

    #[tokio::test]
    async fn test_issue_parses_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/cgi-bin/gettoken")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("corpid".into(), "ww1234".into()),
                Matcher::UrlEncoded("corpsecret".into(), "s3cr3t".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"tok-1","expires_in":3600}"#)
            .create_async()
            .await;

        let issuer = HttpTokenIssuer::with_timeout(Duration::from_secs(5)).unwrap();
        let token = issuer.issue(&key(&server.url())).await.unwrap();

        assert_eq!(token.access_token, "tok-1");
        assert_eq!(token.expires_in, 3600);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_issue_defaults_expiry() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/cgi-bin/gettoken")
            .match_query(Matcher::Any)
            .with_body(r#"{"access_token":"tok-2"}"#)
            .create_async()
            .await;

        let issuer = HttpTokenIssuer::with_timeout(Duration::from_secs(5)).unwrap();
        let token = issuer.issue(&key(&server.url())).await.unwrap();
        assert_eq!(token.expires_in, DEFAULT_EXPIRES_IN);
    }

    #[tokio::test]
    async fn test_issue_replaces_non_positive_expiry() {
        let issuer = HttpTokenIssuer::with_timeout(Duration::from_secs(5)).unwrap();
        for expires_in in [-7200, 0] {
            let mut server = Server::new_async().await;
            let _mock = server
                .mock("GET", "/cgi-bin/gettoken")
                .match_query(Matcher::Any)
                .with_body(format!(
                    r#"{{"errcode":0,"access_token":"tok-3","expires_in":{expires_in}}}"#
                ))
                .create_async()
                .await;

            let token = issuer.issue(&key(&server.url())).await.unwrap();
            assert_eq!(token.access_token, "tok-3");
            assert_eq!(token.expires_in, DEFAULT_EXPIRES_IN);
        }
    }

    #[tokio::test]
    async fn test_issue_surfaces_errcode() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/cgi-bin/gettoken")
            .match_query(Matcher::Any)
            .with_body(r#"{"errcode":40001,"errmsg":"invalid credential"}"#)
            .create_async()
            .await;

        let issuer = HttpTokenIssuer::with_timeout(Duration::from_secs(5)).unwrap();
        let err = issuer.issue(&key(&server.url())).await.unwrap_err();
        match err {
            RelayError::RemoteToken(msg) => assert!(msg.contains("invalid credential")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_issue_without_token_field() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/cgi-bin/gettoken")
            .match_query(Matcher::Any)
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;

        let issuer = HttpTokenIssuer::with_timeout(Duration::from_secs(5)).unwrap();
        let err = issuer.issue(&key(&server.url())).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingAccessToken));
    }

    #[tokio::test]
    async fn test_issue_rejects_non_json() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/cgi-bin/gettoken")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("<html>bad gateway</html>")
            .create_async()
            .await;

        let issuer = HttpTokenIssuer::with_timeout(Duration::from_secs(5)).unwrap();
        let err = issuer.issue(&key(&server.url())).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidResponse(_)));
    }
}
