//! Engine.IO v4 / Socket.IO v5 text packets, as spoken by the room server.
//!
//! Over a websocket each text message carries exactly one Engine.IO packet:
//!
//! | text            | meaning                                   |
//! |-----------------|-------------------------------------------|
//! | `0{...}`        | open, with the handshake parameters       |
//! | `1`             | close                                     |
//! | `2` / `3`       | ping / pong (the server pings)            |
//! | `40{auth}`      | Socket.IO connect to the default namespace |
//! | `41`            | Socket.IO disconnect                      |
//! | `42["ev",data]` | Socket.IO event                           |
//! | `44{message}`   | Socket.IO connect refused                 |
//!
//! Only the default namespace is used. Binary packets are not supported.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::protocol::Frame;

/// Engine.IO protocol revision this client speaks.
pub const ENGINE_IO_VERSION: &str = "4";

/// Path the server mounts its endpoint on unless the URL names one.
pub const DEFAULT_PATH: &str = "/socket.io/";

/// Parameters from the server's open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl Handshake {
    /// How long to wait for the next server ping before calling the
    /// connection dead.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Connect(Option<Value>),
    Disconnect,
    Event(Frame),
    ConnectError(String),
    /// Valid but irrelevant to this client (acks, upgrades, noops, other namespaces).
    Ignored,
}

impl Packet {
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            Packet::Open(_) | Packet::ConnectError(_) | Packet::Ignored => {
                return Err(SyncError::protocol("server-only packet cannot be sent"))
            }
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Connect(None) => "40".to_string(),
            Packet::Connect(Some(auth)) => format!("40{auth}"),
            Packet::Disconnect => "41".to_string(),
            Packet::Event(frame) => {
                let args = if frame.data.is_null() {
                    Value::Array(vec![Value::String(frame.event.clone())])
                } else {
                    Value::Array(vec![Value::String(frame.event.clone()), frame.data.clone()])
                };
                format!("42{args}")
            }
        })
    }

    pub fn decode(text: &str) -> Result<Packet> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SyncError::protocol("empty engine.io packet"))?;
        let rest = chars.as_str();
        match kind {
            '0' => serde_json::from_str(rest)
                .map(Packet::Open)
                .map_err(|e| SyncError::protocol(format!("bad open packet: {e}"))),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_message(rest),
            '5' | '6' => Ok(Packet::Ignored),
            other => Err(SyncError::protocol(format!("unknown engine.io packet type '{other}'"))),
        }
    }
}

fn decode_message(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| SyncError::protocol("empty socket.io packet"))?;
    let body = chars.as_str();

    // Non-default namespaces prefix the payload with "/name,".
    if body.starts_with('/') {
        return Ok(Packet::Ignored);
    }

    match kind {
        '0' => {
            if body.is_empty() {
                return Ok(Packet::Connect(None));
            }
            serde_json::from_str(body)
                .map(|v| Packet::Connect(Some(v)))
                .map_err(|e| SyncError::protocol(format!("bad connect packet: {e}")))
        }
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(body),
        '4' => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| match v {
                    Value::String(s) => Some(s),
                    v => v.get("message").and_then(Value::as_str).map(str::to_string),
                })
                .unwrap_or_else(|| "connection refused".to_string());
            Ok(Packet::ConnectError(message))
        }
        '3' | '5' | '6' => Ok(Packet::Ignored),
        other => Err(SyncError::protocol(format!("unknown socket.io packet type '{other}'"))),
    }
}

fn decode_event(body: &str) -> Result<Packet> {
    // An ack id may precede the argument array.
    let args = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut values: Vec<Value> = serde_json::from_str(args)
        .map_err(|e| SyncError::protocol(format!("bad event packet: {e}")))?;
    if values.is_empty() {
        return Err(SyncError::protocol("event packet without a name"));
    }
    let Value::String(event) = values.remove(0) else {
        return Err(SyncError::protocol("event name is not a string"));
    };
    let data = if values.is_empty() {
        Value::Null
    } else {
        values.remove(0)
    };
    Ok(Packet::Event(Frame::new(event, data)))
}

/// Turn a configured server URL into its websocket endpoint.
///
/// `wss://host` becomes `wss://host/socket.io/?EIO=4&transport=websocket`;
/// an explicit path is kept, and an existing `EIO` query is left alone.
pub fn endpoint(base: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| SyncError::Config(format!("socket_url '{base}' is not a URL: {e}")))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_PATH);
    }
    let has_eio = url.query_pairs().any(|(k, _)| k == "EIO");
    if !has_eio {
        url.query_pairs_mut()
            .append_pair("EIO", ENGINE_IO_VERSION)
            .append_pair("transport", "websocket");
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_decode_open_packet() {
        let packet = Packet::decode(
            r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":5000,"maxPayload":1000000}"#,
        )
        .unwrap();
        let Packet::Open(hs) = packet else {
            panic!("expected open, got {packet:?}");
        };
        assert_eq!(hs.sid, "lv_VI97HAXpY6yYWAAAC");
        assert_eq!(hs.liveness_window(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_open_without_timings_uses_defaults() {
        let Packet::Open(hs) = Packet::decode(r#"0{"sid":"x"}"#).unwrap() else {
            panic!("expected open");
        };
        assert_eq!(hs.ping_interval, 25_000);
        assert_eq!(hs.ping_timeout, 20_000);
    }

    #[rstest]
    #[case("1", Packet::Close)]
    #[case("2", Packet::Ping)]
    #[case("3", Packet::Pong)]
    #[case("6", Packet::Ignored)]
    #[case("40", Packet::Connect(None))]
    #[case("41", Packet::Disconnect)]
    #[case("43[\"ok\"]", Packet::Ignored)]
    #[case("42/admin,[\"x\"]", Packet::Ignored)]
    fn test_decode_control_packets(#[case] text: &str, #[case] expected: Packet) {
        assert_eq!(Packet::decode(text).unwrap(), expected);
    }

    #[test]
    fn test_decode_connect_ack_carries_sid() {
        let packet = Packet::decode(r#"40{"sid":"abc"}"#).unwrap();
        assert_eq!(packet, Packet::Connect(Some(json!({"sid": "abc"}))));
    }

    #[test]
    fn test_decode_event_into_frame() {
        let packet = Packet::decode(r#"42["new_comment",{"id":"c1","lead_id":"42","content":"hi"}]"#).unwrap();
        let Packet::Event(frame) = packet else {
            panic!("expected event");
        };
        assert_eq!(frame.event, "new_comment");
        assert_eq!(frame.data["id"], "c1");
        assert_eq!(frame.lead_id().as_deref(), Some("42"));
    }

    #[test]
    fn test_decode_event_with_ack_id() {
        let Packet::Event(frame) = Packet::decode(r#"4213["ping_room"]"#).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(frame.event, "ping_room");
        assert!(frame.data.is_null());
    }

    #[rstest]
    #[case(r#"44{"message":"Not authorized"}"#, "Not authorized")]
    #[case(r#"44"bad token""#, "bad token")]
    #[case("44", "connection refused")]
    fn test_decode_connect_error(#[case] text: &str, #[case] message: &str) {
        assert_eq!(Packet::decode(text).unwrap(), Packet::ConnectError(message.to_string()));
    }

    #[rstest]
    #[case("")]
    #[case("9")]
    #[case("42not json")]
    #[case("42[]")]
    #[case("42[7]")]
    #[case("0{broken")]
    fn test_decode_rejects_malformed(#[case] text: &str) {
        assert!(matches!(Packet::decode(text), Err(SyncError::Protocol { .. })));
    }

    #[test]
    fn test_encode_client_packets() {
        assert_eq!(Packet::Pong.encode().unwrap(), "3");
        assert_eq!(Packet::Disconnect.encode().unwrap(), "41");
        assert_eq!(
            Packet::Connect(Some(json!({"token": "t1"}))).encode().unwrap(),
            r#"40{"token":"t1"}"#
        );
        assert_eq!(
            Packet::Event(Frame::join("lead-42")).encode().unwrap(),
            r#"42["join_lead",{"lead_id":"lead-42"}]"#
        );
    }

    #[test]
    fn test_server_packets_are_not_encodable() {
        assert!(Packet::Ignored.encode().is_err());
        assert!(Packet::ConnectError("x".into()).encode().is_err());
    }

    #[rstest]
    #[case("wss://klientel-backend.onrender.com", "wss://klientel-backend.onrender.com/socket.io/?EIO=4&transport=websocket")]
    #[case("ws://127.0.0.1:5000/", "ws://127.0.0.1:5000/socket.io/?EIO=4&transport=websocket")]
    #[case("ws://host/custom/", "ws://host/custom/?EIO=4&transport=websocket")]
    #[case("ws://host/socket.io/?EIO=4&transport=websocket", "ws://host/socket.io/?EIO=4&transport=websocket")]
    fn test_endpoint(#[case] base: &str, #[case] expected: &str) {
        assert_eq!(endpoint(base).unwrap(), expected);
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        assert!(matches!(endpoint("not a url"), Err(SyncError::Config(_))));
    }
}
