//! Message types exchanged between the Supervisor and its device workers.
//!
//! Every worker has a private duplex link: commands flow Supervisor → worker,
//! responses flow worker → Supervisor. Both directions are closed vocabularies with a
//! typed payload per variant.
//!
//! # Wire Form
//!
//! Messages can also be rendered as JSON objects of the shape
//! `{"state": "<snake_case name>", "data": {...}}`:
//!
//! ```rust
//! use daq_supervisor::protocol::Command;
//!
//! let cmd = Command::from_json(r#"{"state": "ping", "data": {"id": "abc"}}"#).unwrap();
//! assert_eq!(cmd.state(), "ping");
//! assert!(Command::from_json(r#"{"state": "reboot", "data": {}}"#).is_err());
//! ```
//!
//! Decoding is strict about the `state`: an unknown name is rejected with
//! [`ProtocolError::UnknownState`] instead of being ignored. Missing payload keys fall
//! back to the defaults documented on each payload type.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::packet::Sample;

/// `configure` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureParams {
    /// Channel selector, e.g. `"X"` or `"XY"`. Defaults to `"X"`.
    pub channels: String,
    /// Requested sample rate in Hz. Defaults to 1000.
    pub rate: u32,
    /// Device-specific packet size selector. Defaults to 0.
    pub packet_size: u32,
}

impl Default for ConfigureParams {
    fn default() -> Self {
        Self {
            channels: "X".to_string(),
            rate: 1000,
            packet_size: 0,
        }
    }
}

/// `start_collection` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartParams {
    /// Requested collection length in seconds. Defaults to 10.
    pub duration: f64,
    /// Output sink reference, passed through untouched.
    pub file: Option<String>,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            duration: 10.0,
            file: None,
        }
    }
}

/// `ping` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingParams {
    /// Opaque probe id echoed back in the pong.
    #[serde(default = "unknown_id")]
    pub id: String,
}

fn unknown_id() -> String {
    "unknown".to_string()
}

/// Commands sent from the Supervisor to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Bind a transport and store the acquisition settings.
    Configure(ConfigureParams),
    /// Clear the buffer and begin ingesting packets.
    StartCollection(StartParams),
    /// Stop ingesting; the transport stays open.
    StopCollection,
    /// Flush the buffer back as a `data` response (no reply when empty).
    GetData,
    /// Liveness probe.
    Ping(PingParams),
    /// Close the transport and exit the worker loop.
    Shutdown,
}

impl Command {
    /// Helper to create a Ping command
    pub fn ping(id: impl Into<String>) -> Self {
        Self::Ping(PingParams { id: id.into() })
    }

    /// The snake_case state name used on the wire.
    pub fn state(&self) -> &'static str {
        match self {
            Command::Configure(_) => "configure",
            Command::StartCollection(_) => "start_collection",
            Command::StopCollection => "stop_collection",
            Command::GetData => "get_data",
            Command::Ping(_) => "ping",
            Command::Shutdown => "shutdown",
        }
    }

    /// Renders the command as a `{state, data}` JSON value.
    pub fn to_json(&self) -> Result<Value, ProtocolError> {
        let data = match self {
            Command::Configure(params) => serde_json::to_value(params)?,
            Command::StartCollection(params) => serde_json::to_value(params)?,
            Command::Ping(params) => serde_json::to_value(params)?,
            Command::StopCollection | Command::GetData | Command::Shutdown => empty_data(),
        };
        Ok(envelope(self.state(), data))
    }

    /// Parses a `{state, data}` JSON document.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(text)?;
        match raw.state.as_str() {
            "configure" => Ok(Command::Configure(payload(raw.data)?)),
            "start_collection" => Ok(Command::StartCollection(payload(raw.data)?)),
            "stop_collection" => Ok(Command::StopCollection),
            "get_data" => Ok(Command::GetData),
            "ping" => Ok(Command::Ping(payload(raw.data)?)),
            "shutdown" => Ok(Command::Shutdown),
            _ => Err(ProtocolError::UnknownState(raw.state)),
        }
    }
}

/// `pong` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    /// The id carried by the ping being answered.
    pub id: String,
    /// Name of the answering worker.
    pub name: String,
}

/// `data` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    /// Samples accumulated since the previous flush, in arrival order.
    pub buffer: Vec<Sample>,
}

/// Responses sent from a worker back to the Supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Answer to [`Command::Ping`].
    Pong(PongPayload),
    /// Answer to [`Command::GetData`] when the buffer held samples.
    Data(DataPayload),
}

impl Response {
    /// The snake_case state name used on the wire.
    pub fn state(&self) -> &'static str {
        match self {
            Response::Pong(_) => "pong",
            Response::Data(_) => "data",
        }
    }

    /// Returns the pong payload if this is a pong for `id`.
    pub fn as_pong_for(&self, id: &str) -> Option<&PongPayload> {
        match self {
            Response::Pong(pong) if pong.id == id => Some(pong),
            _ => None,
        }
    }

    /// Renders the response as a `{state, data}` JSON value.
    pub fn to_json(&self) -> Result<Value, ProtocolError> {
        let data = match self {
            Response::Pong(pong) => serde_json::to_value(pong)?,
            Response::Data(data) => serde_json::to_value(data)?,
        };
        Ok(envelope(self.state(), data))
    }

    /// Parses a `{state, data}` JSON document.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(text)?;
        match raw.state.as_str() {
            "pong" => Ok(Response::Pong(payload(raw.data)?)),
            "data" => Ok(Response::Data(payload(raw.data)?)),
            _ => Err(ProtocolError::UnknownState(raw.state)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    state: String,
    #[serde(default)]
    data: Value,
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, ProtocolError> {
    // An absent `data` key means "all defaults".
    let data = if data.is_null() { empty_data() } else { data };
    Ok(serde_json::from_value(data)?)
}

fn empty_data() -> Value {
    Value::Object(serde_json::Map::new())
}

fn envelope(state: &str, data: Value) -> Value {
    serde_json::json!({ "state": state, "data": data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use chrono::Utc;

    #[test]
    fn configure_defaults_fill_missing_keys() {
        let cmd = Command::from_json(r#"{"state": "configure", "data": {"rate": 500}}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Configure(ConfigureParams {
                channels: "X".into(),
                rate: 500,
                packet_size: 0,
            })
        );
    }

    #[test]
    fn start_collection_keeps_opaque_file() {
        let cmd = Command::from_json(
            r#"{"state": "start_collection", "data": {"duration": 12, "file": "thread1.csv"}}"#,
        )
        .unwrap();
        match cmd {
            Command::StartCollection(params) => {
                assert_eq!(params.duration, 12.0);
                assert_eq!(params.file.as_deref(), Some("thread1.csv"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unit_commands_accept_empty_or_missing_data() {
        assert_eq!(
            Command::from_json(r#"{"state": "get_data", "data": {}}"#).unwrap(),
            Command::GetData
        );
        assert_eq!(
            Command::from_json(r#"{"state": "shutdown"}"#).unwrap(),
            Command::Shutdown
        );
    }

    #[test]
    fn ping_without_id_uses_unknown() {
        let cmd = Command::from_json(r#"{"state": "ping"}"#).unwrap();
        assert_eq!(cmd, Command::ping("unknown"));
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = Command::from_json(r#"{"state": "self_destruct", "data": {}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownState(state) if state == "self_destruct"));
    }

    #[test]
    fn command_json_carries_state_and_data() {
        let json = Command::StopCollection.to_json().unwrap();
        assert_eq!(json["state"], "stop_collection");
        assert!(json["data"].as_object().unwrap().is_empty());

        let json = Command::ping("ping-1").to_json().unwrap();
        assert_eq!(json["data"]["id"], "ping-1");
    }

    #[test]
    fn data_response_parses_back() {
        let response = Response::Data(DataPayload {
            buffer: vec![Packet::filled(0, 1.0).into_sample(Utc::now())],
        });
        let text = response.to_json().unwrap().to_string();

        let parsed = Response::from_json(&text).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn pong_matching_checks_id() {
        let pong = Response::Pong(PongPayload {
            id: "a".into(),
            name: "dev".into(),
        });
        assert!(pong.as_pong_for("a").is_some());
        assert!(pong.as_pong_for("b").is_none());
    }
}
