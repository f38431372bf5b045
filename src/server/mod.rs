//! Server assembly
//!
//! Listeners (plain TCP and TLS), the shared server context handed to every
//! session, and the ping ticker.

pub mod listener;
pub mod tls;

use std::sync::Arc;

use crate::auth::PublishGate;
use crate::config::Config;
use crate::registry::ChannelRegistry;

pub use listener::RtmpServer;
pub use tls::CertificateLoader;

/// Immutable state shared by every session
pub struct ServerContext {
    pub config: Config,
    pub registry: Arc<ChannelRegistry>,
    /// Active publish gate: coordinator, HTTP callback, or allow-all
    pub gate: Arc<dyn PublishGate>,
}
