//! External policy adapters
//!
//! A publish attempt is authorized by exactly one gate: the coordinator
//! connection when configured, the HTTP callback otherwise, or the built-in
//! allow-all when neither is set. The gate round-trip always happens with no
//! lock held; a gate that cannot answer within its timeout denies.

pub mod bus;
pub mod callback;
pub mod coordinator;

use std::net::IpAddr;

use async_trait::async_trait;

pub use callback::HttpCallback;
pub use coordinator::Coordinator;

/// Decision returned by a publish gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishDecision {
    /// Publishing may begin; `stream_id` is the externally issued token
    Accepted { stream_id: String },
    Denied,
}

/// Policy seam for publish admission and stop events
#[async_trait]
pub trait PublishGate: Send + Sync {
    /// Ask whether `client_ip` may publish `key` on `channel`
    async fn authorize(&self, channel: &str, key: &str, client_ip: IpAddr) -> PublishDecision;

    /// Report the end of a publishing session; returns true when the event
    /// was delivered
    async fn publish_ended(&self, channel: &str, stream_id: &str) -> bool;
}

/// Gate used when no callback or coordinator is configured
pub struct AllowAll;

#[async_trait]
impl PublishGate for AllowAll {
    async fn authorize(&self, _channel: &str, _key: &str, _client_ip: IpAddr) -> PublishDecision {
        PublishDecision::Accepted {
            stream_id: String::new(),
        }
    }

    async fn publish_ended(&self, _channel: &str, _stream_id: &str) -> bool {
        true
    }
}
