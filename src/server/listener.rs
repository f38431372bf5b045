//! Listener accept loops and the ping ticker
//!
//! One task runs accept per listener (plain TCP, and TLS when certificates
//! are configured); every accepted socket passes the per-IP concurrency
//! check, gets a session id from a monotonic counter, and is handed to its
//! own session task. A single ticker task pings every live session on a
//! 30-second cadence.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::error::Result;
use crate::protocol::constants::PING_TIME_MS;
use crate::registry::IpLimiter;
use crate::server::tls::CertificateLoader;
use crate::server::ServerContext;
use crate::session::{now_ms, run_session};

/// RTMP ingest and fan-out server
pub struct RtmpServer {
    ctx: Arc<ServerContext>,
    limiter: Arc<IpLimiter>,
    next_session_id: AtomicU64,
}

impl RtmpServer {
    pub fn new(ctx: Arc<ServerContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            limiter: Arc::new(IpLimiter::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    fn bind_host(&self) -> &str {
        if self.ctx.config.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            &self.ctx.config.bind_address
        }
    }

    /// Bind the listeners, start the background tasks, and serve forever
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let plain_addr = format!("{}:{}", self.bind_host(), self.ctx.config.rtmp_port);
        let plain = TcpListener::bind(&plain_addr).await?;
        tracing::info!(addr = %plain_addr, "RTMP listening");

        let tls = match (&self.ctx.config.ssl_cert, &self.ctx.config.ssl_key) {
            (Some(cert), Some(key)) => {
                let loader = CertificateLoader::new(
                    cert.clone(),
                    key.clone(),
                    self.ctx.config.ssl_check_reload_seconds,
                )?;
                loader.spawn_reload_task();

                let tls_addr = format!("{}:{}", self.bind_host(), self.ctx.config.ssl_port);
                let listener = TcpListener::bind(&tls_addr).await?;
                tracing::info!(addr = %tls_addr, "RTMPS listening");
                Some((listener, loader))
            }
            _ => None,
        };

        let ping_ctx = Arc::clone(&self.ctx);
        tokio::spawn(run_ping_loop(ping_ctx));

        if let Some((listener, loader)) = tls {
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.accept_tls_loop(listener, loader).await });
        }

        self.accept_plain_loop(plain).await
    }

    async fn accept_plain_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    continue;
                }
            };

            let Some(id) = self.admit(peer.ip()) else {
                continue;
            };

            let _ = socket.set_nodelay(true);
            let ctx = Arc::clone(&self.ctx);
            let limiter = Arc::clone(&self.limiter);
            let ip = peer.ip();

            tokio::spawn(async move {
                run_session(Arc::clone(&ctx), id, ip, socket).await;
                limiter.remove(ip, &ctx.config);
            });
        }
    }

    async fn accept_tls_loop(
        self: Arc<Self>,
        listener: TcpListener,
        loader: Arc<CertificateLoader>,
    ) {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "TLS accept failed");
                    continue;
                }
            };

            let Some(id) = self.admit(peer.ip()) else {
                continue;
            };

            let _ = socket.set_nodelay(true);
            let ctx = Arc::clone(&self.ctx);
            let limiter = Arc::clone(&self.limiter);
            let acceptor = loader.acceptor();
            let ip = peer.ip();

            tokio::spawn(async move {
                match acceptor.accept(socket).await {
                    Ok(stream) => run_session(Arc::clone(&ctx), id, ip, stream).await,
                    Err(e) => {
                        tracing::debug!(session_id = id, ip = %ip, error = %e, "TLS handshake failed")
                    }
                }
                limiter.remove(ip, &ctx.config);
            });
        }
    }

    /// Per-IP admission; `None` rejects the connection
    fn admit(&self, ip: IpAddr) -> Option<u64> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        if !self.limiter.try_add(ip, &self.ctx.config) {
            tracing::info!(session_id = id, ip = %ip, "connection rejected: too many requests");
            return None;
        }

        tracing::debug!(session_id = id, ip = %ip, "connection accepted");
        Some(id)
    }
}

/// Ping every live session on the 30-second tick
async fn run_ping_loop(ctx: Arc<ServerContext>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(PING_TIME_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = now_ms();
        for session in ctx.registry.sessions() {
            session.send_ping_request(now).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::config::Config;
    use crate::registry::ChannelRegistry;

    fn make_server(pairs: &[(&str, &str)]) -> Arc<RtmpServer> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|name| map.get(name).cloned());
        RtmpServer::new(Arc::new(ServerContext {
            config,
            registry: Arc::new(ChannelRegistry::new()),
            gate: Arc::new(AllowAll),
        }))
    }

    #[test]
    fn test_admit_applies_ip_limit() {
        let server = make_server(&[("MAX_IP_CONCURRENT_CONNECTIONS", "1")]);
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        assert!(server.admit(ip).is_some());
        assert!(server.admit(ip).is_none());

        server.limiter.remove(ip, &server.ctx.config);
        assert!(server.admit(ip).is_some());
    }

    #[test]
    fn test_session_ids_are_monotonic() {
        let server = make_server(&[]);
        let ip: IpAddr = "203.0.113.6".parse().unwrap();
        let a = server.admit(ip).unwrap();
        let b = server.admit(ip).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_bind_host_default() {
        let server = make_server(&[]);
        assert_eq!(server.bind_host(), "0.0.0.0");
        let server = make_server(&[("BIND_ADDRESS", "127.0.0.1")]);
        assert_eq!(server.bind_host(), "127.0.0.1");
    }
}
