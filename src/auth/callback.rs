//! HTTP policy callback
//!
//! On publish the server POSTs to the configured URL with an empty body and
//! an `rtmp-event` header carrying an HS256 JWT describing the event. The
//! start endpoint must answer 200 with a `stream-id` header; any other
//! status, a timeout, or an unreachable endpoint denies the publish. Stop
//! events are fire-and-forget.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::Config;

use super::{PublishDecision, PublishGate};

/// Event tokens expire two minutes after issue
const TOKEN_LIFETIME_SECS: u64 = 120;

/// Gate answers are awaited for at most this long
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(20);

/// Claims carried in the `rtmp-event` header token
#[derive(Debug, Serialize, Deserialize)]
pub struct EventClaims {
    pub sub: String,
    pub event: String,
    pub channel: String,
    pub key: String,
    pub client_ip: String,
    pub rtmp_host: String,
    pub rtmp_port: u16,
    pub exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

/// Publish gate backed by an HTTP policy endpoint
pub struct HttpCallback {
    client: reqwest::Client,
    url: String,
    secret: String,
    subject: String,
    rtmp_host: String,
    rtmp_port: u16,
}

impl HttpCallback {
    /// Build from config; `None` when no callback URL is set
    pub fn from_config(config: &Config) -> Option<Self> {
        let url = config.callback_url.clone()?;
        let client = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Some(Self {
            client,
            url,
            secret: config.jwt_secret.clone(),
            subject: config.jwt_subject.clone(),
            rtmp_host: config.rtmp_host.clone(),
            rtmp_port: config.rtmp_port,
        })
    }

    fn now_unix() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn sign_token(&self, claims: &EventClaims) -> Option<String> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| tracing::error!(error = %e, "could not sign event token"))
        .ok()
    }

    fn make_claims(
        &self,
        event: &str,
        channel: &str,
        key: &str,
        client_ip: IpAddr,
        stream_id: Option<String>,
    ) -> EventClaims {
        EventClaims {
            sub: self.subject.clone(),
            event: event.to_string(),
            channel: channel.to_string(),
            key: key.to_string(),
            client_ip: client_ip.to_string(),
            rtmp_host: self.rtmp_host.clone(),
            rtmp_port: self.rtmp_port,
            exp: Self::now_unix() + TOKEN_LIFETIME_SECS,
            stream_id,
        }
    }

    async fn post_event(&self, token: String) -> Option<reqwest::Response> {
        self.client
            .post(&self.url)
            .header("rtmp-event", token)
            .send()
            .await
            .map_err(|e| tracing::error!(error = %e, "callback request failed"))
            .ok()
    }
}

#[async_trait]
impl PublishGate for HttpCallback {
    async fn authorize(&self, channel: &str, key: &str, client_ip: IpAddr) -> PublishDecision {
        tracing::debug!(url = %self.url, channel, "POST callback | event: start");

        let claims = self.make_claims("start", channel, key, client_ip, None);
        let Some(token) = self.sign_token(&claims) else {
            return PublishDecision::Denied;
        };

        let Some(response) = self.post_event(token).await else {
            return PublishDecision::Denied;
        };

        if response.status() != reqwest::StatusCode::OK {
            tracing::debug!(status = %response.status(), "callback denied publish");
            return PublishDecision::Denied;
        }

        let stream_id = response
            .headers()
            .get("stream-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        tracing::debug!(stream_id = %stream_id, "callback accepted publish");
        PublishDecision::Accepted { stream_id }
    }

    async fn publish_ended(&self, channel: &str, stream_id: &str) -> bool {
        tracing::debug!(url = %self.url, channel, "POST callback | event: stop");

        // The stop claims have no meaningful client address
        let claims = EventClaims {
            sub: self.subject.clone(),
            event: "stop".to_string(),
            channel: channel.to_string(),
            key: String::new(),
            client_ip: String::new(),
            rtmp_host: self.rtmp_host.clone(),
            rtmp_port: self.rtmp_port,
            exp: Self::now_unix() + TOKEN_LIFETIME_SECS,
            stream_id: Some(stream_id.to_string()),
        };

        let Some(token) = self.sign_token(&claims) else {
            return false;
        };
        let Some(response) = self.post_event(token).await else {
            return false;
        };

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), channel, "stop callback rejected");
            return false;
        }
        true
    }
}
