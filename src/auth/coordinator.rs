//! Coordinator connection
//!
//! A long-lived WebSocket session to a coordinator server replaces the HTTP
//! callback when `CONTROL_BASE_URL` is configured. Requests and responses
//! are correlated by a `Request-Id`; the server heartbeats every 20 seconds
//! and reconnects after 10 seconds on any failure. On (re)connect every
//! active publisher is killed so the coordinator's view starts clean.
//!
//! Messages are text frames with a line-oriented layout: the first line is
//! the method name, each following line a `Key: value` parameter. Parameter
//! lookup is case-insensitive.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{Config, ControlConfig};
use crate::registry::ChannelRegistry;

use super::{PublishDecision, PublishGate};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Line-oriented RPC message exchanged with the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub method: String,
    /// Keys stored lowercase for case-insensitive lookup
    params: HashMap<String, String>,
}

impl RpcMessage {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn param(&self, key: &str) -> &str {
        self.params
            .get(&key.to_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn serialize(&self) -> String {
        let mut out = self.method.clone();
        for (key, value) in &self.params {
            out.push('\n');
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
        }
        out
    }

    pub fn parse(text: &str) -> Self {
        let mut lines = text.lines();
        let method = lines.next().unwrap_or("").trim().to_uppercase();

        let mut params = HashMap::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                params.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        Self { method, params }
    }
}

struct PublishResponse {
    accepted: bool,
    stream_id: String,
}

/// Publish gate backed by the coordinator WebSocket session
pub struct Coordinator {
    registry: Arc<ChannelRegistry>,
    url: String,
    control: ControlConfig,
    outbound: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    next_request_id: AtomicU64,
    pending: StdMutex<HashMap<String, oneshot::Sender<PublishResponse>>>,
}

#[derive(Serialize)]
struct ControlClaims<'a> {
    sub: &'a str,
}

impl Coordinator {
    /// Build from config; `None` when no coordinator is configured
    pub fn from_config(config: &Config, registry: Arc<ChannelRegistry>) -> Option<Arc<Self>> {
        let control = config.control.clone()?;
        let url = format!("{}/ws/control/rtmp", control.base_url.trim_end_matches('/'));

        Some(Arc::new(Self {
            registry,
            url,
            control,
            outbound: StdMutex::new(None),
            next_request_id: AtomicU64::new(0),
            pending: StdMutex::new(HashMap::new()),
        }))
    }

    /// Start the connection and heartbeat tasks
    pub fn spawn(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.run_connection_loop().await });

        let beat = Arc::clone(self);
        tokio::spawn(async move { beat.run_heartbeat_loop().await });
    }

    /// Authentication token for the connection handshake
    fn auth_token(&self) -> Option<String> {
        if self.control.secret.is_empty() {
            return None;
        }
        encode(
            &Header::new(Algorithm::HS256),
            &ControlClaims { sub: "rtmp-control" },
            &EncodingKey::from_secret(self.control.secret.as_bytes()),
        )
        .map_err(|e| tracing::error!(error = %e, "could not sign control token"))
        .ok()
    }

    async fn run_connection_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.connect_once().await {
                tracing::warn!(error = %e, "coordinator connection error");
            }
            tracing::info!(
                delay_secs = RECONNECT_DELAY.as_secs(),
                "waiting to reconnect to coordinator"
            );
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_once(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(url = %self.url, "connecting to coordinator");

        let mut request = self.url.clone().into_client_request()?;
        {
            let headers = request.headers_mut();
            if let Some(token) = self.auth_token() {
                headers.insert("x-control-auth-token", HeaderValue::from_str(&token)?);
            }
            if let Some(ref ip) = self.control.external_ip {
                headers.insert("x-external-ip", HeaderValue::from_str(ip)?);
            }
            if let Some(ref port) = self.control.external_port {
                headers.insert("x-custom-port", HeaderValue::from_str(port)?);
            }
            if self.control.external_ssl {
                headers.insert("x-ssl-use", HeaderValue::from_static("true"));
            }
        }

        let (stream, _) = connect_async(request).await?;
        let (mut sink, mut source) = stream.split();

        // The coordinator believed this server was down; its view of our
        // publishers is stale and they must go.
        self.registry.kill_all_publishers();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().unwrap() = Some(tx);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let result = loop {
            let frame = match tokio::time::timeout(READ_DEADLINE, source.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => break Err(e.into()),
                Ok(None) => break Ok(()),
                Err(_) => break Err("coordinator read deadline expired".into()),
            };

            if let Message::Text(text) = frame {
                tracing::debug!(message = %text, "coordinator <<<");
                self.handle_message(RpcMessage::parse(&text));
            }
        };

        *self.outbound.lock().unwrap() = None;
        // Outstanding waiters resolve as denied when their senders drop
        self.pending.lock().unwrap().clear();
        writer.abort();

        result
    }

    fn handle_message(&self, msg: RpcMessage) {
        match msg.method.as_str() {
            "ERROR" => {
                tracing::error!(
                    code = msg.param("Error-Code"),
                    details = msg.param("Error-Message"),
                    "coordinator remote error"
                );
            }
            "PUBLISH-ACCEPT" => {
                self.resolve_pending(msg.param("Request-Id"), true, msg.param("Stream-Id"));
            }
            "PUBLISH-DENY" => {
                self.resolve_pending(msg.param("Request-Id"), false, "");
            }
            "STREAM-KILL" => {
                self.handle_stream_kill(msg.param("Stream-Channel"), msg.param("Stream-Id"));
            }
            _ => {}
        }
    }

    fn resolve_pending(&self, request_id: &str, accepted: bool, stream_id: &str) {
        let waiter = self.pending.lock().unwrap().remove(request_id);
        if let Some(tx) = waiter {
            let _ = tx.send(PublishResponse {
                accepted,
                stream_id: stream_id.to_string(),
            });
        }
    }

    /// Kill the channel's publisher when the stream id matches, or any
    /// publisher on the channel for the `*` wildcard
    pub fn handle_stream_kill(&self, channel: &str, stream_id: &str) {
        let Some(publisher) = self.registry.get_publisher(channel) else {
            return;
        };

        if stream_id == "*" || stream_id.is_empty() {
            publisher.kill();
            return;
        }

        if self.registry.publisher_stream_id(channel).as_deref() == Some(stream_id) {
            publisher.kill();
        }
    }

    fn send(&self, msg: RpcMessage) -> bool {
        let outbound = self.outbound.lock().unwrap();
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        tracing::debug!(message = %msg.serialize(), "coordinator >>>");
        tx.send(Message::Text(msg.serialize().into())).is_ok()
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.send(RpcMessage::new("HEARTBEAT"));
        }
    }
}

#[async_trait]
impl PublishGate for Coordinator {
    async fn authorize(&self, channel: &str, key: &str, client_ip: IpAddr) -> PublishDecision {
        let request_id = self
            .next_request_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id.clone(), tx);

        let msg = RpcMessage::new("PUBLISH-REQUEST")
            .with_param("Request-Id", &request_id)
            .with_param("Stream-Channel", channel)
            .with_param("Stream-Key", key)
            .with_param("User-IP", &client_ip.to_string());

        if !self.send(msg) {
            self.pending.lock().unwrap().remove(&request_id);
            return PublishDecision::Denied;
        }

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx).await;
        self.pending.lock().unwrap().remove(&request_id);

        match response {
            Ok(Ok(r)) if r.accepted => PublishDecision::Accepted {
                stream_id: r.stream_id,
            },
            // Denied, disconnected mid-wait, or timed out
            _ => PublishDecision::Denied,
        }
    }

    async fn publish_ended(&self, channel: &str, stream_id: &str) -> bool {
        self.send(
            RpcMessage::new("PUBLISH-END")
                .with_param("Stream-Channel", channel)
                .with_param("Stream-ID", stream_id),
        )
    }
}
