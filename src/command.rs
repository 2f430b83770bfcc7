//! Playback commands and their local validation.
//!
//! Commands are checked before anything touches the network:
//!
//! * Without an active transport every command is rejected.
//! * `next` and `previous` are only available when the server advertises
//!   them in the state's supported commands.
//! * `play`, `pause`, `stop`, `volume` and `mute` are always attempted while
//!   connected.
//!
//! Volumes are rounded to whole percentages before they are sent. Fractional
//! volumes make some servers loop forever while redistributing group volume,
//! so this rounding is not optional.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    protocol::{ClientMessage, CommandPayload},
    state::PlaybackState,
    transport::Transport,
};

/// Names of the commands a server can advertise.
#[derive(
    Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Volume,
    Mute,
}

impl CommandKind {
    /// Whether the command is only available when advertised by the server.
    #[must_use]
    pub fn is_conditional(self) -> bool {
        matches!(self, Self::Next | Self::Previous)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::Volume => "volume",
            Self::Mute => "mute",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "stop" => Ok(Self::Stop),
            "next" => Ok(Self::Next),
            "previous" => Ok(Self::Previous),
            "volume" => Ok(Self::Volume),
            "mute" => Ok(Self::Mute),
            _ => Err(Error::invalid_argument(format!("{s} is not a known command"))),
        }
    }
}

/// A command with its parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    /// Volume in percent. Rounded to an integer before sending.
    Volume(f64),
    Mute(bool),
}

impl Command {
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Play => CommandKind::Play,
            Self::Pause => CommandKind::Pause,
            Self::Stop => CommandKind::Stop,
            Self::Next => CommandKind::Next,
            Self::Previous => CommandKind::Previous,
            Self::Volume(_) => CommandKind::Volume,
            Self::Mute(_) => CommandKind::Mute,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Volume(volume) => write!(f, "volume {volume}"),
            Self::Mute(mute) => write!(f, "mute {mute}"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Rounds a volume to the nearest whole percentage in `0..=100`.
///
/// # Errors
///
/// Returns [`Error::command_rejected`] for NaN or infinite input.
pub fn round_volume(volume: f64) -> Result<u8> {
    if !volume.is_finite() {
        return Err(Error::command_rejected(format!(
            "volume {volume} is not a number"
        )));
    }

    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rounded = volume.round().clamp(0.0, 100.0) as u8;
    Ok(rounded)
}

/// Validates commands and forwards them to the active transport.
#[derive(Copy, Clone, Debug, Default)]
pub struct Dispatcher;

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Checks `command` against the current state and builds its payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::command_rejected`] if not connected, if a conditional
    /// command is not advertised, or if the volume is not a number.
    pub fn prepare(
        &self,
        command: Command,
        state: &PlaybackState,
        connected: bool,
    ) -> Result<CommandPayload> {
        if !connected {
            return Err(Error::command_rejected(format!(
                "cannot send {command}: not connected"
            )));
        }

        let kind = command.kind();
        if kind.is_conditional() && !state.supported_commands.contains(&kind) {
            return Err(Error::command_rejected(format!(
                "{kind} is not supported by the server"
            )));
        }

        let payload = match command {
            Command::Volume(volume) => CommandPayload {
                command: kind,
                volume: Some(round_volume(volume)?),
                mute: None,
            },
            Command::Mute(mute) => CommandPayload {
                command: kind,
                volume: None,
                mute: Some(mute),
            },
            _ => CommandPayload {
                command: kind,
                volume: None,
                mute: None,
            },
        };

        Ok(payload)
    }

    /// Validates `command` and sends it over `transport`.
    ///
    /// Rejected commands are logged and never reach the transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::command_rejected`] for validation failures, or the
    /// transport's error if sending fails.
    pub async fn dispatch<T>(
        &self,
        command: Command,
        state: &PlaybackState,
        transport: Option<&mut T>,
    ) -> Result<()>
    where
        T: Transport,
    {
        let payload = match self.prepare(command, state, transport.is_some()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{e}");
                return Err(e);
            }
        };

        match transport {
            Some(transport) => {
                debug!("sending {command}");
                transport.send(ClientMessage::Command(payload)).await
            }
            None => Err(Error::internal("transport vanished during dispatch")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn state_with(commands: &[CommandKind]) -> PlaybackState {
        PlaybackState {
            supported_commands: commands.iter().copied().collect(),
            ..PlaybackState::default()
        }
    }

    #[test]
    fn unadvertised_previous_is_rejected() {
        let state = state_with(&[CommandKind::Play, CommandKind::Pause]);
        let err = Dispatcher::new()
            .prepare(Command::Previous, &state, true)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CommandRejected);
    }

    #[test]
    fn transport_commands_need_no_advertisement() {
        let state = state_with(&[]);
        let dispatcher = Dispatcher::new();
        for command in [
            Command::Play,
            Command::Pause,
            Command::Stop,
            Command::Volume(30.0),
            Command::Mute(true),
        ] {
            assert!(dispatcher.prepare(command, &state, true).is_ok(), "{command}");
        }
    }

    #[test]
    fn nothing_is_accepted_while_disconnected() {
        let state = state_with(&[CommandKind::Play]);
        let err = Dispatcher::new()
            .prepare(Command::Play, &state, false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CommandRejected);
    }

    #[test]
    fn advertised_next_is_accepted() {
        let state = state_with(&[CommandKind::Next]);
        let payload = Dispatcher::new()
            .prepare(Command::Next, &state, true)
            .unwrap();
        assert_eq!(payload.command, CommandKind::Next);
    }

    #[test]
    fn volume_is_rounded() {
        let state = state_with(&[]);
        let payload = Dispatcher::new()
            .prepare(Command::Volume(41.6), &state, true)
            .unwrap();
        assert_eq!(payload.volume, Some(42));

        assert_eq!(round_volume(-3.0).unwrap(), 0);
        assert_eq!(round_volume(250.4).unwrap(), 100);
        assert_eq!(
            round_volume(f64::NAN).unwrap_err().kind,
            ErrorKind::CommandRejected
        );
    }

    #[test]
    fn command_names_parse() {
        assert_eq!("Previous".parse::<CommandKind>().unwrap(), CommandKind::Previous);
        assert!("shuffle".parse::<CommandKind>().is_err());
    }

    proptest! {
        #[test]
        fn rounded_volume_is_nearest_integer(volume in -1_000.0f64..1_000.0) {
            let rounded = f64::from(round_volume(volume).unwrap());
            prop_assert!((0.0..=100.0).contains(&rounded));
            prop_assert_eq!(rounded.fract(), 0.0);
            prop_assert!((rounded - volume.clamp(0.0, 100.0)).abs() <= 0.5);
        }
    }
}
