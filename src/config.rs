//! Server configuration
//!
//! A single immutable `Config` is built from the environment at startup and
//! passed by reference to every component that needs it. Parsing goes
//! through a name/value lookup closure so tests never touch the process
//! environment.

use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::IpNet;

use crate::protocol::constants::DEFAULT_CHUNK_SIZE;

/// A CIDR allow-list option
#[derive(Debug, Clone, PartialEq)]
pub enum IpList {
    /// Option not configured
    Unset,
    /// `*`: every address matches
    All,
    /// Explicit ranges
    Ranges(Vec<IpNet>),
}

impl IpList {
    /// Parse a comma-separated CIDR list; bare addresses become host routes
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            return IpList::Unset;
        }
        if value == "*" {
            return IpList::All;
        }

        let mut ranges = Vec::new();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Ok(net) = part.parse::<IpNet>() {
                ranges.push(net);
            } else if let Ok(addr) = part.parse::<IpAddr>() {
                ranges.push(IpNet::from(addr));
            } else {
                tracing::warn!(entry = part, "ignoring unparsable IP range");
            }
        }
        IpList::Ranges(ranges)
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, IpList::Unset)
    }

    /// True when the address is covered by the list
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpList::Unset => false,
            IpList::All => true,
            IpList::Ranges(ranges) => ranges.iter().any(|net| net.contains(&ip)),
        }
    }
}

/// Operator command bus settings
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub channel: String,
    pub tls: bool,
}

/// Coordinator connection settings
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub base_url: String,
    pub secret: String,
    pub external_ip: Option<String>,
    pub external_port: Option<String>,
    pub external_ssl: bool,
}

/// Immutable server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub rtmp_port: u16,
    pub ssl_port: u16,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_check_reload_seconds: u64,

    /// Outbound chunk size; values at or below 128 clamp to 128
    pub chunk_size: u32,
    /// Maximum length for channel ids and stream keys
    pub id_max_length: usize,

    pub max_ip_concurrent: u32,
    pub concurrent_whitelist: IpList,
    pub play_whitelist: IpList,

    /// GOP cache byte budget per publisher; zero disables caching
    pub gop_cache_limit: u64,

    pub log_requests: bool,
    pub log_debug: bool,

    pub callback_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_subject: String,
    pub rtmp_host: String,

    pub redis: Option<RedisConfig>,
    pub control: Option<ControlConfig>,
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .as_deref()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Build from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from a name/value lookup
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let chunk_size: u32 = parse_or(get("RTMP_CHUNK_SIZE"), DEFAULT_CHUNK_SIZE);
        let gop_cache_mb: u64 = parse_or(get("GOP_CACHE_SIZE_MB"), 256);

        let redis = if get("REDIS_USE").as_deref() == Some("YES") {
            Some(RedisConfig {
                host: get("REDIS_HOST").unwrap_or_else(|| "localhost".into()),
                port: parse_or(get("REDIS_PORT"), 6379),
                password: get("REDIS_PASSWORD").unwrap_or_default(),
                channel: get("REDIS_CHANNEL").unwrap_or_else(|| "rtmp_commands".into()),
                tls: get("REDIS_TLS").as_deref() == Some("YES"),
            })
        } else {
            None
        };

        let control = get("CONTROL_BASE_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|base_url| ControlConfig {
                base_url,
                secret: get("CONTROL_SECRET").unwrap_or_default(),
                external_ip: get("EXTERNAL_IP").filter(|v| !v.is_empty()),
                external_port: get("EXTERNAL_PORT").filter(|v| !v.is_empty()),
                external_ssl: get("EXTERNAL_SSL").as_deref() == Some("YES"),
            });

        Self {
            bind_address: get("BIND_ADDRESS").unwrap_or_default(),
            rtmp_port: parse_or(get("RTMP_PORT"), 1935),
            ssl_port: parse_or(get("SSL_PORT"), 443),
            ssl_cert: get("SSL_CERT").filter(|v| !v.is_empty()).map(PathBuf::from),
            ssl_key: get("SSL_KEY").filter(|v| !v.is_empty()).map(PathBuf::from),
            ssl_check_reload_seconds: parse_or(get("SSL_CHECK_RELOAD_SECONDS"), 60),
            chunk_size: chunk_size.max(DEFAULT_CHUNK_SIZE),
            id_max_length: parse_or(get("ID_MAX_LENGTH"), 128),
            max_ip_concurrent: parse_or(get("MAX_IP_CONCURRENT_CONNECTIONS"), 4),
            concurrent_whitelist: IpList::parse(
                &get("CONCURRENT_LIMIT_WHITELIST").unwrap_or_default(),
            ),
            play_whitelist: IpList::parse(&get("RTMP_PLAY_WHITELIST").unwrap_or_default()),
            gop_cache_limit: gop_cache_mb * 1024 * 1024,
            log_requests: get("LOG_REQUESTS").as_deref() != Some("NO"),
            log_debug: get("LOG_DEBUG").as_deref() == Some("YES"),
            callback_url: get("CALLBACK_URL").filter(|v| !v.is_empty()),
            jwt_secret: get("JWT_SECRET").unwrap_or_default(),
            jwt_subject: get("CUSTOM_JWT_SUBJECT")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "rtmp_event".into()),
            rtmp_host: get("RTMP_HOST").unwrap_or_default(),
            redis,
            control,
        }
    }

    /// True when the address may start playback
    pub fn can_play(&self, ip: IpAddr) -> bool {
        self.play_whitelist.is_unset() || self.play_whitelist.matches(ip)
    }

    /// True when the address is exempt from the per-IP connection cap
    pub fn is_ip_exempt(&self, ip: IpAddr) -> bool {
        self.concurrent_whitelist.matches(ip)
    }
}

/// Validate a channel id or stream key: `^[A-Za-z0-9_-]{1,max}$`
pub fn validate_stream_id(id: &str, max_length: usize) -> bool {
    !id.is_empty()
        && id.len() <= max_length
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
