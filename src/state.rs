//! Canonical playback state and its synchronization from server updates.
//!
//! The [`Synchronizer`] is the single writer of [`PlaybackState`]. Servers may
//! send partial updates, so [`ServerUpdate`] mirrors the state with optional
//! fields and merging is field-wise: whatever an update leaves out keeps its
//! previous value.

use std::{collections::BTreeSet, fmt, time::Duration};

use serde::Deserialize;
use serde_with::{rust::double_option, serde_as, DurationMilliSeconds};
use url::Url;

use tokio::time::Instant;

use crate::{command::CommandKind, progress::ProgressEstimator, subscribers::Registry};

/// Connection lifecycle of the session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPlaybackState {
    Playing,
    Paused,
    Stopped,
}

/// Metadata of the current track.
///
/// Text fields stay `None` until some update provides them.
#[derive(Clone, Debug, PartialEq)]
pub struct NowPlaying {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Absolute artwork URL.
    pub artwork_url: Option<String>,
    pub duration: Duration,
    /// Position, extrapolated between updates.
    pub progress: Duration,
    pub playback_speed: f64,
    pub repeat: RepeatMode,
    pub shuffle: bool,
}

impl Default for NowPlaying {
    fn default() -> Self {
        Self {
            title: None,
            artist: None,
            album: None,
            artwork_url: None,
            duration: Duration::ZERO,
            progress: Duration::ZERO,
            playback_speed: 1.0,
            repeat: RepeatMode::Off,
            shuffle: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: Option<String>,
    pub playback_state: Option<GroupPlaybackState>,
}

/// Snapshot handed to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackState {
    pub connection: ConnectionState,
    pub is_playing: bool,
    /// Volume in percent, `0..=100`.
    pub volume: u8,
    pub muted: bool,
    /// `None` until the server has sent track metadata.
    pub now_playing: Option<NowPlaying>,
    pub group: Option<Group>,
    pub supported_commands: BTreeSet<CommandKind>,
    /// Last connection failure as `"<kind>: <detail>"`.
    pub connection_error: Option<String>,
    pub server_url: Option<String>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Idle,
            is_playing: false,
            volume: 100,
            muted: false,
            now_playing: None,
            group: None,
            supported_commands: BTreeSet::new(),
            connection_error: None,
            server_url: None,
        }
    }
}

impl PlaybackState {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Whether the server advertises `command`.
    #[must_use]
    pub fn supports(&self, command: CommandKind) -> bool {
        self.supported_commands.contains(&command)
    }
}

/// Partial track metadata.
#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NowPlayingUpdate {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    #[serde(alias = "image_url", alias = "artwork_url")]
    pub artwork: Option<String>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "duration_ms")]
    pub duration: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "position_ms", alias = "progress_ms")]
    pub position: Option<Duration>,
    pub playback_speed: Option<f64>,
    pub repeat: Option<RepeatMode>,
    pub shuffle: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GroupUpdate {
    #[serde(alias = "group_id")]
    pub id: Option<String>,
    pub name: Option<String>,
    pub playback_state: Option<GroupPlaybackState>,
}

/// Partial state pushed by the server.
///
/// `now_playing` and `group` distinguish an absent field (keep) from an
/// explicit `null` (clear).
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerUpdate {
    pub is_playing: Option<bool>,
    pub volume: Option<f64>,
    pub muted: Option<bool>,
    #[serde(with = "double_option")]
    pub now_playing: Option<Option<NowPlayingUpdate>>,
    #[serde(with = "double_option")]
    pub group: Option<Option<GroupUpdate>>,
    /// Unknown command names are ignored.
    pub supported_commands: Option<Vec<String>>,
}

/// Single writer of the canonical [`PlaybackState`].
///
/// Every mutation is published to the [`Registry`] exactly once. Access goes
/// through `&mut self`, so a progress tick can never interleave with a merge.
#[derive(Debug)]
pub struct Synchronizer {
    state: PlaybackState,
    transport_playing: bool,
    server_url: Option<Url>,
    progress: ProgressEstimator,
    registry: Registry,
}

impl Synchronizer {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            state: PlaybackState::default(),
            transport_playing: false,
            server_url: None,
            progress: ProgressEstimator::new(),
            registry,
        }
    }

    #[must_use]
    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// Sets the server that relative artwork paths resolve against.
    pub fn set_server_url(&mut self, server_url: Option<Url>) {
        self.state.server_url = server_url
            .as_ref()
            .map(|url| url.as_str().trim_end_matches('/').to_owned());
        self.server_url = server_url;
    }

    /// Merges `update` into the state and publishes the result.
    pub fn apply(&mut self, update: ServerUpdate, now: Instant) {
        // Rebase on the current estimate so updates without a position do
        // not rewind the progress to the last authoritative value.
        if let (Some(now_playing), Some(estimate)) =
            (self.state.now_playing.as_mut(), self.progress.estimate(now))
        {
            now_playing.progress = estimate;
        }

        if let Some(playing) = update.is_playing {
            self.transport_playing = playing;
        }

        if let Some(volume) = update.volume.filter(|volume| volume.is_finite()) {
            #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let volume = volume.round().clamp(0.0, 100.0) as u8;
            self.state.volume = volume;
        }

        if let Some(muted) = update.muted {
            self.state.muted = muted;
        }

        match update.now_playing {
            Some(Some(now_playing)) => self.merge_now_playing(now_playing),
            Some(None) => self.state.now_playing = None,
            None => {}
        }

        match update.group {
            Some(Some(group)) => self.merge_group(group),
            Some(None) => self.state.group = None,
            None => {}
        }

        if let Some(commands) = update.supported_commands {
            self.state.supported_commands = commands
                .iter()
                .filter_map(|name| match name.parse() {
                    Ok(command) => Some(command),
                    Err(_) => {
                        trace!("ignoring unknown command {name}");
                        None
                    }
                })
                .collect();
        }

        self.state.is_playing = match self.state.group.as_ref().and_then(|g| g.playback_state) {
            Some(group_state) => group_state == GroupPlaybackState::Playing,
            None => self.transport_playing,
        };

        self.rebase_progress(now);
        self.publish();
    }

    fn merge_now_playing(&mut self, update: NowPlayingUpdate) {
        let artwork_url = update.artwork.and_then(|artwork| self.resolve_artwork(&artwork));
        let now_playing = self.state.now_playing.get_or_insert_with(NowPlaying::default);

        let track_changed = update.title.is_some() && update.title != now_playing.title;
        if track_changed && update.position.is_none() {
            now_playing.progress = Duration::ZERO;
        }

        if let Some(title) = update.title {
            now_playing.title = Some(title);
        }
        if let Some(artist) = update.artist {
            now_playing.artist = Some(artist);
        }
        if let Some(album) = update.album {
            now_playing.album = Some(album);
        }
        if let Some(artwork_url) = artwork_url {
            now_playing.artwork_url = Some(artwork_url);
        }
        if let Some(duration) = update.duration {
            now_playing.duration = duration;
        }
        if let Some(position) = update.position {
            now_playing.progress = position;
        }
        if let Some(speed) = update.playback_speed.filter(|speed| speed.is_finite()) {
            now_playing.playback_speed = speed.max(0.0);
        }
        if let Some(repeat) = update.repeat {
            now_playing.repeat = repeat;
        }
        if let Some(shuffle) = update.shuffle {
            now_playing.shuffle = shuffle;
        }

        if !now_playing.duration.is_zero() {
            now_playing.progress = now_playing.progress.min(now_playing.duration);
        }
    }

    fn merge_group(&mut self, update: GroupUpdate) {
        match self.state.group.as_mut() {
            Some(group) => {
                if let Some(id) = update.id {
                    group.id = id;
                }
                if let Some(name) = update.name {
                    group.name = Some(name);
                }
                if let Some(playback_state) = update.playback_state {
                    group.playback_state = Some(playback_state);
                }
            }
            None => {
                self.state.group = Some(Group {
                    id: update.id.unwrap_or_default(),
                    name: update.name,
                    playback_state: update.playback_state,
                });
            }
        }
    }

    /// Makes `artwork` absolute. Relative paths are appended to the server
    /// URL, keeping its path prefix.
    fn resolve_artwork(&self, artwork: &str) -> Option<String> {
        let artwork = artwork.trim();
        if artwork.is_empty() {
            return None;
        }

        if Url::parse(artwork).is_ok() {
            return Some(artwork.to_owned());
        }

        let Some(server_url) = self.server_url.as_ref() else {
            debug!("cannot resolve artwork {artwork} without a server");
            return None;
        };

        let mut base = server_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        match base.join(artwork.trim_start_matches('/')) {
            Ok(url) => Some(url.into()),
            Err(e) => {
                debug!("cannot resolve artwork {artwork}: {e}");
                None
            }
        }
    }

    fn rebase_progress(&mut self, now: Instant) {
        match self.state.now_playing.as_ref() {
            Some(now_playing) => self.progress.reset(
                now_playing.progress,
                now_playing.duration,
                now_playing.playback_speed,
                self.state.is_playing,
                now,
            ),
            None => self.progress.clear(),
        }
    }

    /// Whether [`tick`](Self::tick) would advance the progress.
    #[must_use]
    pub fn is_progressing(&self) -> bool {
        self.progress.is_active()
    }

    /// Refreshes the extrapolated progress. Publishes and returns `true` only
    /// if the position changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let Some(estimate) = self.progress.estimate(now) else {
            return false;
        };

        match self.state.now_playing.as_mut() {
            Some(now_playing) if now_playing.progress != estimate => {
                now_playing.progress = estimate;
            }
            _ => return false,
        }

        self.publish();
        true
    }

    /// Records a connection transition and publishes it.
    ///
    /// `error` replaces the current connection error; reaching
    /// [`ConnectionState::Connected`] always clears it.
    pub fn set_connection(&mut self, connection: ConnectionState, error: Option<String>) {
        self.state.connection = connection;
        self.state.connection_error = match connection {
            ConnectionState::Connected => None,
            _ => error,
        };

        self.publish();
    }

    /// Empties the state after a disconnect. Volume and mute are kept, they
    /// belong to the local player rather than the session.
    pub fn reset(&mut self) {
        let PlaybackState { volume, muted, .. } = self.state;
        self.state = PlaybackState {
            volume,
            muted,
            ..PlaybackState::default()
        };
        self.transport_playing = false;
        self.server_url = None;
        self.progress.clear();

        self.publish();
    }

    /// Seeds the local volume, for instance from persisted settings.
    pub fn set_local_volume(&mut self, volume: u8, muted: bool) {
        self.state.volume = volume.min(100);
        self.state.muted = muted;
        self.publish();
    }

    fn publish(&self) {
        self.registry.publish(&self.state);
    }
}
