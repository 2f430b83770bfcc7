//! Control channel messages.
//!
//! Every frame is a JSON envelope:
//!
//! ```text
//! {"type": "client/hello", "payload": {"client_id": "...", "name": "..."}}
//! ```
//!
//! Outbound messages are [`ClientMessage`]s, inbound ones [`ServerMessage`]s.
//! Inbound types this client does not understand decode to
//! [`ServerMessage::Other`] so newer servers do not break older players.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    command::CommandKind,
    error::{Error, Result},
    state::ServerUpdate,
};

/// Handshake sent right after the transport opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientHello {
    pub client_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandPayload {
    pub command: CommandKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

/// Local player volume as reported to the server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlayerReport {
    pub volume: u8,
    pub muted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    #[serde(rename = "client/hello")]
    Hello(ClientHello),
    #[serde(rename = "client/command")]
    Command(CommandPayload),
    #[serde(rename = "client/state")]
    State(PlayerReport),
}

impl ClientMessage {
    /// Encodes the message as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::internal`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::internal)
    }
}

/// Acknowledgement of the handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ServerHello {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Hello(ServerHello),
    State(ServerUpdate),
    /// A message type this client does not handle.
    Other(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ServerMessage {
    /// Decodes a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::protocol`] if the frame is not an envelope or the
    /// payload of a known message type is malformed.
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text).map_err(Error::protocol)?;
        let payload = match envelope.payload {
            Value::Null => Value::Object(serde_json::Map::new()),
            payload => payload,
        };

        let message = match envelope.kind.as_str() {
            "server/hello" => Self::Hello(serde_json::from_value(payload).map_err(Error::protocol)?),
            "server/state" => Self::State(serde_json::from_value(payload).map_err(Error::protocol)?),
            _ => Self::Other(envelope.kind),
        };

        Ok(message)
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Hello(_) => "server/hello",
            Self::State(_) => "server/state",
            Self::Other(kind) => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn hello_omits_missing_token() {
        let hello = ClientMessage::Hello(ClientHello {
            client_id: "sendspin-browser-1234".to_owned(),
            name: "Kitchen".to_owned(),
            auth_token: None,
        });

        let encoded: Value = serde_json::from_str(&hello.to_json().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "client/hello",
                "payload": {"client_id": "sendspin-browser-1234", "name": "Kitchen"},
            })
        );
    }

    #[test]
    fn volume_command_is_integral() {
        let command = ClientMessage::Command(CommandPayload {
            command: CommandKind::Volume,
            volume: Some(42),
            mute: None,
        });

        let encoded: Value = serde_json::from_str(&command.to_json().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "client/command", "payload": {"command": "volume", "volume": 42}})
        );
    }

    #[test]
    fn decodes_partial_state() {
        let message =
            ServerMessage::from_json(r#"{"type":"server/state","payload":{"volume":42}}"#).unwrap();

        let ServerMessage::State(update) = message else {
            panic!("expected a state update");
        };
        assert_eq!(update.volume, Some(42.0));
        assert!(update.now_playing.is_none());
    }

    #[test]
    fn hello_without_payload_is_accepted() {
        let message = ServerMessage::from_json(r#"{"type":"server/hello"}"#).unwrap();
        assert_eq!(message, ServerMessage::Hello(ServerHello::default()));
    }

    #[test]
    fn unknown_types_are_passed_through() {
        let message =
            ServerMessage::from_json(r#"{"type":"server/time","payload":{"t":1}}"#).unwrap();
        assert_eq!(message.kind(), "server/time");
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        for frame in ["not json", r#"{"payload":{}}"#, r#"{"type":"server/state","payload":{"volume":"loud"}}"#] {
            let err = ServerMessage::from_json(frame).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Protocol, "frame {frame}");
        }
    }
}
