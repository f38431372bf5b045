//! Operator command bus
//!
//! When enabled, the server subscribes to a Redis pub/sub channel carrying
//! line-oriented operator commands of the form `COMMAND>ARG1|ARG2`. A lost
//! connection is retried after a 10-second backoff; malformed input is
//! logged and dropped. Nothing here ever fails a session other than the one
//! an operator explicitly targets.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use crate::config::RedisConfig;
use crate::registry::ChannelRegistry;

const RETRY_DELAY: Duration = Duration::from_secs(10);

/// A parsed operator command
#[derive(Debug, PartialEq, Eq)]
pub enum BusCommand {
    /// Forcibly end any publisher on the channel
    KillSession { channel: String },
    /// End the publisher only when its current stream id matches
    CloseStream { channel: String, stream_id: String },
}

/// Parse `COMMAND>ARG1|ARG2|...`; `None` for anything malformed
pub fn parse_command(line: &str) -> Option<BusCommand> {
    let (name, arg_str) = line.split_once('>')?;
    let args: Vec<&str> = arg_str.split('|').collect();

    match name {
        "kill-session" => {
            let channel = args.first().filter(|a| !a.is_empty())?;
            Some(BusCommand::KillSession {
                channel: channel.to_string(),
            })
        }
        "close-stream" => {
            if args.len() < 2 {
                return None;
            }
            Some(BusCommand::CloseStream {
                channel: args[0].to_string(),
                stream_id: args[1].to_string(),
            })
        }
        _ => None,
    }
}

/// Apply a parsed command against the registry
pub fn apply_command(registry: &ChannelRegistry, command: BusCommand) {
    match command {
        BusCommand::KillSession { channel } => {
            if let Some(publisher) = registry.get_publisher(&channel) {
                tracing::info!(channel = %channel, session_id = publisher.id, "operator kill-session");
                publisher.kill();
            }
        }
        BusCommand::CloseStream { channel, stream_id } => {
            if registry.publisher_stream_id(&channel).as_deref() != Some(stream_id.as_str()) {
                return;
            }
            if let Some(publisher) = registry.get_publisher(&channel) {
                tracing::info!(channel = %channel, session_id = publisher.id, "operator close-stream");
                publisher.kill();
            }
        }
    }
}

fn redis_url(config: &RedisConfig) -> String {
    let scheme = if config.tls { "rediss" } else { "redis" };
    if config.password.is_empty() {
        format!("{}://{}:{}/", scheme, config.host, config.port)
    } else {
        format!("{}://:{}@{}:{}/", scheme, config.password, config.host, config.port)
    }
}

/// Subscribe and dispatch until the connection drops
async fn listen_once(
    config: &RedisConfig,
    registry: &ChannelRegistry,
) -> redis::RedisResult<()> {
    let client = redis::Client::open(redis_url(config))?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(&config.channel).await?;

    tracing::info!(channel = %config.channel, "listening for operator commands");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable bus message");
                continue;
            }
        };

        match parse_command(&payload) {
            Some(command) => apply_command(registry, command),
            None => tracing::warn!(message = %payload, "invalid bus message"),
        }
    }

    Ok(())
}

/// Run the command bus forever, reconnecting after a backoff
pub async fn run(config: RedisConfig, registry: Arc<ChannelRegistry>) {
    loop {
        if let Err(e) = listen_once(&config, &registry).await {
            tracing::warn!(error = %e, "command bus connection failed");
        } else {
            tracing::warn!("command bus connection lost");
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}
