//! rtmp-relay server binary
//!
//! Loads configuration from the environment, wires the publish gate
//! (coordinator when configured, HTTP callback otherwise), starts the
//! operator command bus, and serves RTMP/RTMPS until terminated.

use std::sync::Arc;

use rtmp_relay::auth::{self, AllowAll, Coordinator, HttpCallback, PublishGate};
use rtmp_relay::{ChannelRegistry, Config, RtmpServer, ServerContext};

fn init_logging(config: &Config) {
    let default_level = if config.log_debug {
        "debug"
    } else if config.log_requests {
        "info"
    } else {
        "warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    // Several dependencies enable different rustls crypto backends; pin the
    // process-wide default before any TLS config is built.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = Config::from_env();
    init_logging(&config);

    tracing::info!("rtmp-relay (version {})", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(ChannelRegistry::new());

    // Coordinator replaces the HTTP callback when both are configured
    let gate: Arc<dyn PublishGate> =
        if let Some(coordinator) = Coordinator::from_config(&config, Arc::clone(&registry)) {
            coordinator.spawn();
            coordinator
        } else if let Some(callback) = HttpCallback::from_config(&config) {
            Arc::new(callback)
        } else {
            tracing::warn!("no publish gate configured; accepting all publishers");
            Arc::new(AllowAll)
        };

    if let Some(redis) = config.redis.clone() {
        tokio::spawn(auth::bus::run(redis, Arc::clone(&registry)));
    }

    let ctx = Arc::new(ServerContext {
        config,
        registry,
        gate,
    });

    if let Err(e) = RtmpServer::new(ctx).run().await {
        tracing::error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}
