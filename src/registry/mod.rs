//! Channel registry and session table
//!
//! Process-wide map of streaming channel -> publisher/players plus the
//! session table (id -> shared handle). A single exclusive lock guards both:
//! a `publish` that succeeds is totally ordered before any later `play` that
//! observes it, because both pass through here.
//!
//! Channels are created lazily when the first publisher or player touches
//! the id and removed once they have neither. Player stream keys are checked
//! against the publisher's key in constant time, never against the channel
//! id.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::session::shared::SessionShared;

/// One streaming channel
#[derive(Debug)]
struct Channel {
    /// Publisher-provided stream key players must match
    key: String,
    /// External stream id issued by the policy gate
    stream_id: String,
    publisher: Option<u64>,
    players: HashSet<u64>,
}

impl Channel {
    fn empty() -> Self {
        Self {
            key: String::new(),
            stream_id: String::new(),
            publisher: None,
            players: HashSet::new(),
        }
    }

    fn is_publishing(&self) -> bool {
        self.publisher.is_some()
    }

    fn is_empty(&self) -> bool {
        self.publisher.is_none() && self.players.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    channels: HashMap<String, Channel>,
    sessions: HashMap<u64, Arc<SessionShared>>,
}

/// Constant-time stream key comparison
pub fn keys_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Outcome of adding a player to a channel
#[derive(Debug, PartialEq, Eq)]
pub enum AddPlayerOutcome {
    /// Publisher live, key accepted: the player starts immediately
    Active,
    /// No publisher yet: the player waits
    Idle,
    /// Key mismatch against the live publisher
    InvalidKey,
}

/// Process-wide registry of channels and sessions
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    inner: Mutex<Inner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, session: Arc<SessionShared>) {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id, session);
    }

    pub fn remove_session(&self, id: u64) {
        self.inner.lock().unwrap().sessions.remove(&id);
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Snapshot of every live session (for the ping ticker)
    pub fn sessions(&self) -> Vec<Arc<SessionShared>> {
        self.inner.lock().unwrap().sessions.values().cloned().collect()
    }

    /// True when the channel currently has a publisher
    pub fn is_publishing(&self, channel: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .channels
            .get(channel)
            .map(|c| c.is_publishing())
            .unwrap_or(false)
    }

    /// The channel's current publisher session, if any
    pub fn get_publisher(&self, channel: &str) -> Option<Arc<SessionShared>> {
        let inner = self.inner.lock().unwrap();
        let chan = inner.channels.get(channel)?;
        let id = chan.publisher?;
        inner.sessions.get(&id).cloned()
    }

    /// External stream id of the channel's publisher
    pub fn publisher_stream_id(&self, channel: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let chan = inner.channels.get(channel)?;
        chan.publisher?;
        Some(chan.stream_id.clone())
    }

    /// Install a publisher. Returns false when the channel already has one.
    pub fn set_publisher(
        &self,
        channel: &str,
        key: &str,
        stream_id: &str,
        session_id: u64,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let chan = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(Channel::empty);

        if chan.is_publishing() {
            return false;
        }

        chan.key = key.to_string();
        chan.stream_id = stream_id.to_string();
        chan.publisher = Some(session_id);
        true
    }

    /// Drop the channel's publisher; every player falls back to idle and the
    /// channel is reaped when nobody is left
    pub fn remove_publisher(&self, channel: &str) {
        let mut inner = self.inner.lock().unwrap();
        let (player_ids, remove) = {
            let Some(chan) = inner.channels.get_mut(channel) else {
                return;
            };
            chan.publisher = None;
            let ids: Vec<u64> = chan.players.iter().copied().collect();
            (ids, chan.is_empty())
        };

        for id in player_ids {
            if let Some(player) = inner.sessions.get(&id) {
                let mut flags = player.flags.lock().unwrap();
                flags.idling = true;
                flags.playing = false;
            }
        }

        if remove {
            inner.channels.remove(channel);
        }
    }

    /// Add a player to a channel.
    ///
    /// With a live publisher the player's key must match the publisher's in
    /// constant time; without one the player joins idle.
    pub fn add_player(
        &self,
        channel: &str,
        key: &str,
        session: &Arc<SessionShared>,
    ) -> AddPlayerOutcome {
        let mut inner = self.inner.lock().unwrap();
        let chan = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(Channel::empty);

        let outcome = if chan.is_publishing() {
            if keys_match(key, &chan.key) {
                AddPlayerOutcome::Active
            } else {
                return AddPlayerOutcome::InvalidKey;
            }
        } else {
            AddPlayerOutcome::Idle
        };

        chan.players.insert(session.id);
        {
            let mut flags = session.flags.lock().unwrap();
            flags.idling = outcome == AddPlayerOutcome::Idle;
        }
        outcome
    }

    /// Remove a player and reap the channel if it is now empty
    pub fn remove_player(&self, channel: &str, session: &Arc<SessionShared>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(chan) = inner.channels.get_mut(channel) else {
            return;
        };

        chan.players.remove(&session.id);
        {
            let mut flags = session.flags.lock().unwrap();
            flags.idling = false;
            flags.playing = false;
        }

        if chan.is_empty() {
            inner.channels.remove(channel);
        }
    }

    /// Players of the channel currently in the playing state
    pub fn get_players(&self, channel: &str) -> Vec<Arc<SessionShared>> {
        self.collect_players(channel, |flags| flags.playing)
    }

    /// Players of the channel waiting for a publisher
    pub fn get_idle_players(&self, channel: &str) -> Vec<Arc<SessionShared>> {
        self.collect_players(channel, |flags| flags.idling)
    }

    fn collect_players<F>(&self, channel: &str, want: F) -> Vec<Arc<SessionShared>>
    where
        F: Fn(&crate::session::shared::SessionFlags) -> bool,
    {
        let inner = self.inner.lock().unwrap();
        let Some(chan) = inner.channels.get(channel) else {
            return Vec::new();
        };

        chan.players
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|session| want(&session.flags.lock().unwrap()))
            .cloned()
            .collect()
    }

    /// Kill every session currently publishing (coordinator resync)
    pub fn kill_all_publishers(&self) {
        let publishers: Vec<Arc<SessionShared>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .channels
                .values()
                .filter_map(|chan| chan.publisher)
                .filter_map(|id| inner.sessions.get(&id))
                .cloned()
                .collect()
        };

        for publisher in publishers {
            tracing::info!(session_id = publisher.id, "killing publisher");
            publisher.kill();
        }
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().unwrap().channels.len()
    }
}

/// Per-IP connection counter guarding the accept path
#[derive(Debug, Default)]
pub struct IpLimiter {
    counts: Mutex<HashMap<IpAddr, u32>>,
}

impl IpLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the address in; false when it is over the limit and not
    /// exempted by the allow-list
    pub fn try_add(&self, ip: IpAddr, config: &Config) -> bool {
        if config.is_ip_exempt(ip) {
            return true;
        }

        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(ip).or_insert(0);
        if *count >= config.max_ip_concurrent {
            return false;
        }
        *count += 1;
        true
    }

    /// Decrement on session teardown regardless of exit reason
    pub fn remove(&self, ip: IpAddr, config: &Config) {
        if config.is_ip_exempt(ip) {
            return;
        }

        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(&ip) {
            if *count <= 1 {
                counts.remove(&ip);
            } else {
                *count -= 1;
            }
        }
    }
}
