use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::relay::config::Config;

pub const CARD_TITLE: &str = "NAS 通知中心";
pub const DEFAULT_CARD_URL: &str = "https://www.synology.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub description: String,
    pub url: String,
    pub picurl: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct News {
    pub articles: Vec<Article>,
}

/// Body of `POST /cgi-bin/message/send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsMessage {
    pub touser: String,
    pub msgtype: String,
    pub agentid: i64,
    pub news: News,
}

impl NewsMessage {
    /// Single-card broadcast to every member of the application.
    pub fn for_event(config: &Config, content: &str, at: DateTime<Local>) -> Self {
        let url = if config.nas_url.is_empty() {
            DEFAULT_CARD_URL.to_string()
        } else {
            config.nas_url.clone()
        };
        let picurl = if config.photo_url.is_empty() {
            let nonce = at.timestamp_nanos_opt().unwrap_or_else(|| at.timestamp());
            format!("https://picsum.photos/600/300?random={nonce}")
        } else {
            config.photo_url.clone()
        };

        Self {
            touser: "@all".to_string(),
            msgtype: "news".to_string(),
            agentid: config.agent_id_number(),
            news: News {
                articles: vec![Article {
                    title: CARD_TITLE.to_string(),
                    description: format!("[{}]\n{}", at.format("%H:%M"), content),
                    url,
                    picurl,
                }],
            },
        }
    }
}

/// Push API reply. Only `errcode` decides success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushReceipt {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub invaliduser: Option<String>,
    #[serde(default)]
    pub msgid: Option<String>,
}

impl PushReceipt {
    pub fn from_body(body: &str) -> RelayResult<Self> {
        let receipt: PushReceipt = serde_json::from_str(body)
            .map_err(|e| RelayError::InvalidResponse(format!("message/send: {e}")))?;
        if receipt.errcode != 0 {
            return Err(RelayError::PushRejected {
                errcode: receipt.errcode,
                errmsg: receipt.errmsg,
            });
        }
        Ok(receipt)
    }
}
