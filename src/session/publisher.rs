//! Publisher-side operations
//!
//! These run against a publisher's shared handle, sometimes from another
//! session's task (a player joining calls `start_player` on the publisher it
//! found in the registry). They all follow the crate lock order: the player
//! snapshot is taken from the registry before the publish-state lock is
//! acquired, and sends happen under each target's own send lock.

use std::sync::Arc;

use bytes::Bytes;

use crate::auth::PublishGate;
use crate::protocol::constants::*;
use crate::registry::{keys_match, ChannelRegistry};
use crate::session::shared::SessionShared;

impl SessionShared {
    /// Promote every idle player of the channel after publishing starts.
    ///
    /// Players whose key does not match get `NetStream.Play.BadName` and are
    /// killed, mirroring the rejection a live-key mismatch gets at join.
    pub async fn start_idle_players(self: &Arc<Self>, registry: &ChannelRegistry) {
        let channel = { self.publish.lock().await.channel.clone() };
        let idle_players = registry.get_idle_players(&channel);
        if idle_players.is_empty() {
            return;
        }

        let mut state = self.publish.lock().await;
        if !state.publishing {
            return;
        }

        for player in idle_players {
            let player_key = { player.flags.lock().unwrap().key.clone() };

            if !keys_match(&state.key, &player_key) {
                tracing::info!(
                    session_id = player.id,
                    ip = %player.ip,
                    "player rejected: invalid stream key"
                );
                let stream_id = player.play_stream_id();
                player
                    .send_status(stream_id, "error", NS_PLAY_BAD_NAME, "Invalid stream key provided")
                    .await;
                player.kill();
                continue;
            }

            tracing::info!(session_id = player.id, ip = %player.ip, channel = %channel, "PLAY START");

            player.send_metadata(&state.metadata, 0).await;
            player
                .send_audio_codec_header(state.audio_codec, &state.aac_sequence_header, 0)
                .await;
            player
                .send_video_codec_header(state.video_codec, &state.avc_sequence_header, 0)
                .await;

            let (skip_cache, clear_cache) = {
                let mut flags = player.flags.lock().unwrap();
                flags.playing = true;
                flags.idling = false;
                (flags.gop_play_no, flags.gop_play_clear)
            };

            if !skip_cache {
                for cached in state.cache.iter() {
                    player.send_cache_packet(cached).await;
                }
            }
            if clear_cache {
                state.cache.disable();
            }
        }
    }

    /// Start one player against this publisher. Falls back to idle when
    /// publishing already stopped between the registry lookup and here.
    pub async fn start_player(self: &Arc<Self>, player: &Arc<SessionShared>) {
        let mut state = self.publish.lock().await;

        if !state.publishing {
            let mut flags = player.flags.lock().unwrap();
            flags.playing = false;
            flags.idling = true;
            drop(flags);
            tracing::info!(session_id = player.id, ip = %player.ip, "PLAY IDLE");
            return;
        }

        tracing::info!(
            session_id = player.id,
            ip = %player.ip,
            channel = %state.channel,
            "PLAY START"
        );

        player.send_metadata(&state.metadata, 0).await;
        player
            .send_audio_codec_header(state.audio_codec, &state.aac_sequence_header, 0)
            .await;
        player
            .send_video_codec_header(state.video_codec, &state.avc_sequence_header, 0)
            .await;

        let (skip_cache, clear_cache) = {
            let mut flags = player.flags.lock().unwrap();
            flags.playing = true;
            flags.idling = false;
            (flags.gop_play_no, flags.gop_play_clear)
        };

        if !skip_cache {
            for cached in state.cache.iter() {
                player.send_cache_packet(cached).await;
            }
        }
        if clear_cache {
            state.cache.disable();
        }
    }

    /// Re-send codec headers at the current clock for a player resuming
    /// from pause
    pub async fn resume_player(self: &Arc<Self>, player: &Arc<SessionShared>) {
        let state = self.publish.lock().await;
        player
            .send_audio_codec_header(state.audio_codec, &state.aac_sequence_header, state.clock)
            .await;
        player
            .send_video_codec_header(state.video_codec, &state.avc_sequence_header, state.clock)
            .await;
    }

    /// Record new channel metadata and broadcast it to current players
    pub async fn set_metadata(self: &Arc<Self>, registry: &ChannelRegistry, metadata: Bytes) {
        let channel = { self.publish.lock().await.channel.clone() };
        let players = registry.get_players(&channel);

        let mut state = self.publish.lock().await;
        if !state.publishing {
            return;
        }
        state.metadata = metadata.clone();
        drop(state);

        for player in players {
            player.send_metadata(&metadata, 0).await;
        }
    }

    /// Finish a publishing session.
    ///
    /// `is_close` is true when the socket already went away, in which case
    /// no status is sent to the publisher itself. Players are notified and
    /// fall back to idle; the stop event goes to the policy gate with no
    /// lock held.
    pub async fn end_publish(
        self: &Arc<Self>,
        registry: &ChannelRegistry,
        gate: &dyn PublishGate,
        is_close: bool,
    ) {
        let channel = { self.publish.lock().await.channel.clone() };
        let players = registry.get_players(&channel);

        let mut state = self.publish.lock().await;
        if !state.publishing {
            return;
        }
        state.publishing = false;
        let stream_id = std::mem::take(&mut state.stream_id);
        let publish_stream_id = state.publish_stream_id;
        let stream_path = format!("/{}/{}", state.channel, state.key);
        state.cache.clear();
        drop(state);

        tracing::info!(session_id = self.id, ip = %self.ip, channel = %channel, "PUBLISH END");

        if !is_close {
            self.send_status(
                publish_stream_id,
                "status",
                NS_UNPUBLISH_SUCCESS,
                &format!("{} is now unpublished.", stream_path),
            )
            .await;
        }

        for player in players {
            {
                let mut flags = player.flags.lock().unwrap();
                flags.idling = true;
                flags.playing = false;
            }
            tracing::info!(session_id = player.id, ip = %player.ip, channel = %channel, "PLAY IDLE");
            let play_stream_id = player.play_stream_id();
            player
                .send_status(
                    play_stream_id,
                    "status",
                    NS_PLAY_UNPUBLISH_NOTIFY,
                    "stream is now unpublished.",
                )
                .await;
            player.send_stream_status(UC_STREAM_EOF, play_stream_id).await;
        }

        registry.remove_publisher(&channel);

        if gate.publish_ended(&channel, &stream_id).await {
            tracing::debug!(session_id = self.id, "stop event sent");
        } else {
            tracing::debug!(session_id = self.id, "could not send stop event");
        }
    }
}
