//! Coarse playback and connection events.
//!
//! Events are derived by comparing consecutive [`PlaybackState`] snapshots,
//! so listeners that only care about transitions do not have to track state
//! themselves. A [`Hook`] runs an external program for each event.

use std::{fmt, path::PathBuf};

use tokio::process::Command;

use crate::{
    error::{Error, Result},
    state::PlaybackState,
};

/// Significant changes of the playback state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The session connected to a server.
    Connected,

    /// The session lost or closed its connection.
    Disconnected,

    /// Playback started or resumed.
    Play,

    /// Playback paused or stopped.
    Pause,

    /// Title, artist or album of the current item changed.
    TrackChanged,

    /// Volume or mute flag changed.
    VolumeChanged,
}

impl Event {
    /// Events that lead from `prev` to `next`, in the order they should be
    /// reported.
    #[must_use]
    pub fn diff(prev: &PlaybackState, next: &PlaybackState) -> Vec<Self> {
        let mut events = Vec::new();

        let connected = next.is_connected();
        if connected && !prev.is_connected() {
            events.push(Self::Connected);
        }

        if let Some(now_playing) = next.now_playing.as_ref() {
            let changed = prev.now_playing.as_ref().is_none_or(|previous| {
                (&previous.title, &previous.artist, &previous.album)
                    != (&now_playing.title, &now_playing.artist, &now_playing.album)
            });
            if changed {
                events.push(Self::TrackChanged);
            }
        }

        match (prev.is_playing, next.is_playing) {
            (false, true) => events.push(Self::Play),
            (true, false) => events.push(Self::Pause),
            _ => {}
        }

        if (prev.volume, prev.muted) != (next.volume, next.muted) {
            events.push(Self::VolumeChanged);
        }

        if prev.is_connected() && !connected {
            events.push(Self::Disconnected);
        }

        events
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Play => "playing",
            Self::Pause => "paused",
            Self::TrackChanged => "track_changed",
            Self::VolumeChanged => "volume_changed",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs a program on every event.
///
/// The program receives the event name in `EVENT` and, depending on the
/// event:
///
/// | Event            | Variables                     |
/// |------------------|-------------------------------|
/// | `connected`      | `SERVER_URL`                  |
/// | `disconnected`   | `SERVER_URL`                  |
/// | `track_changed`  | `TITLE`, `ARTIST`, `ALBUM`    |
/// | `volume_changed` | `VOLUME` (0 when muted)       |
///
/// Missing values are passed as empty strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hook {
    program: PathBuf,
}

impl Hook {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, event: Event, state: &PlaybackState) -> Command {
        let mut command = Command::new(&self.program);
        command.env("EVENT", event.as_str()).kill_on_drop(true);

        match event {
            Event::Connected | Event::Disconnected => {
                command.env("SERVER_URL", state.server_url.as_deref().unwrap_or_default());
            }
            Event::TrackChanged => {
                let (title, artist, album) =
                    state.now_playing.as_ref().map_or((None, None, None), |np| {
                        (np.title.as_deref(), np.artist.as_deref(), np.album.as_deref())
                    });
                command
                    .env("TITLE", title.unwrap_or_default())
                    .env("ARTIST", artist.unwrap_or_default())
                    .env("ALBUM", album.unwrap_or_default());
            }
            Event::VolumeChanged => {
                let volume = if state.muted { 0 } else { state.volume };
                command.env("VOLUME", volume.to_string());
            }
            Event::Play | Event::Pause => {}
        }

        command
    }

    /// Runs the program for `event` and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be started or exits
    /// unsuccessfully.
    pub async fn run(&self, event: Event, state: &PlaybackState) -> Result<()> {
        debug!("running hook {} for {event}", self.program.display());

        let status = self.command(event, state).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "hook {} {status}",
                self.program.display()
            )))
        }
    }
}
