//! Wire message types and the opcode registry for the game protocol.
//!
//! Message bodies are JSON (so fields are self-describing in captures and
//! easy to extend), framed by [`frame_codec`]'s binary length-prefixed
//! header. [`encode_message`]/[`decode_message`] glue the two together.
//!
//! Opcode ranges are frozen for this protocol version; see [`opcode`].

use frame_codec::{Codec, Frame, FrameError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Opcode ranges
// ---------------------------------------------------------------------------

/// Frozen v1 opcode values, partitioned by family.
pub mod opcode {
    pub const LOGIN_REQUEST: u16 = 0x0001;
    pub const LOGIN_RESPONSE: u16 = 0x0002;

    pub const PING: u16 = 0x0100;
    pub const PONG: u16 = 0x0101;

    pub const PUSH_STATE: u16 = 0x0200;

    pub const ACTION: u16 = 0x0300;
    pub const ACTION_ACK: u16 = 0x0301;

    pub const ERROR: u16 = 0x0400;

    pub(crate) const HANDSHAKE_RANGE: std::ops::RangeInclusive<u16> = 0x0001..=0x00FF;
    pub(crate) const HEARTBEAT_RANGE: std::ops::RangeInclusive<u16> = 0x0100..=0x01FF;
    pub(crate) const BUSINESS_PUSH_RANGE: std::ops::RangeInclusive<u16> = 0x0200..=0x02FF;
    pub(crate) const BUSINESS_ACTION_RANGE: std::ops::RangeInclusive<u16> = 0x0300..=0x03FF;
    pub(crate) const ERROR_RANGE: std::ops::RangeInclusive<u16> = 0x0400..=0x04FF;
}

/// Coarse classification of an opcode's family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    Handshake,
    Heartbeat,
    BusinessPush,
    BusinessAction,
    Error,
}

/// Registry entry: which family an opcode belongs to, plus a debug name.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub category: MessageCategory,
    pub name: &'static str,
}

/// An opcode not recognized by the registry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown opcode {0:#06x}")]
pub struct UnknownOpcode(pub u16);

/// Process-local (not global) map from opcode to its category.
///
/// Built explicitly via [`OpcodeRegistry::default_registry`] rather than a
/// lazily-initialized static, so tests and multiple drivers in one process
/// each own their own registry value.
#[derive(Debug, Clone)]
pub struct OpcodeRegistry {
    entries: HashMap<u16, OpcodeInfo>,
}

impl OpcodeRegistry {
    /// The frozen v1 opcode set.
    pub fn default_registry() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            opcode::LOGIN_REQUEST,
            OpcodeInfo {
                category: MessageCategory::Handshake,
                name: "login_request",
            },
        );
        entries.insert(
            opcode::LOGIN_RESPONSE,
            OpcodeInfo {
                category: MessageCategory::Handshake,
                name: "login_response",
            },
        );
        entries.insert(
            opcode::PING,
            OpcodeInfo {
                category: MessageCategory::Heartbeat,
                name: "ping",
            },
        );
        entries.insert(
            opcode::PONG,
            OpcodeInfo {
                category: MessageCategory::Heartbeat,
                name: "pong",
            },
        );
        entries.insert(
            opcode::PUSH_STATE,
            OpcodeInfo {
                category: MessageCategory::BusinessPush,
                name: "push_state",
            },
        );
        entries.insert(
            opcode::ACTION,
            OpcodeInfo {
                category: MessageCategory::BusinessAction,
                name: "action",
            },
        );
        entries.insert(
            opcode::ACTION_ACK,
            OpcodeInfo {
                category: MessageCategory::BusinessAction,
                name: "action_ack",
            },
        );
        entries.insert(
            opcode::ERROR,
            OpcodeInfo {
                category: MessageCategory::Error,
                name: "error",
            },
        );
        OpcodeRegistry { entries }
    }

    /// True if `opcode` falls within a known family range, even if it
    /// isn't one of the specific registered values.
    pub fn is_valid(&self, opcode: u16) -> bool {
        opcode::HANDSHAKE_RANGE.contains(&opcode)
            || opcode::HEARTBEAT_RANGE.contains(&opcode)
            || opcode::BUSINESS_PUSH_RANGE.contains(&opcode)
            || opcode::BUSINESS_ACTION_RANGE.contains(&opcode)
            || opcode::ERROR_RANGE.contains(&opcode)
    }

    /// Look up the registered info for a specific opcode value.
    pub fn info(&self, opcode: u16) -> Option<&OpcodeInfo> {
        self.entries.get(&opcode)
    }

    /// Classify an opcode, returning [`UnknownOpcode`] if it's outside
    /// every registered family range. A client receiving `UnknownOpcode`
    /// must not close the connection; see `client-engine`.
    pub fn new_message(&self, opcode: u16) -> Result<MessageCategory, UnknownOpcode> {
        if let Some(info) = self.entries.get(&opcode) {
            return Ok(info.category);
        }
        if opcode::HANDSHAKE_RANGE.contains(&opcode) {
            return Ok(MessageCategory::Handshake);
        }
        if opcode::HEARTBEAT_RANGE.contains(&opcode) {
            return Ok(MessageCategory::Heartbeat);
        }
        if opcode::BUSINESS_PUSH_RANGE.contains(&opcode) {
            return Ok(MessageCategory::BusinessPush);
        }
        if opcode::BUSINESS_ACTION_RANGE.contains(&opcode) {
            return Ok(MessageCategory::BusinessAction);
        }
        if opcode::ERROR_RANGE.contains(&opcode) {
            return Ok(MessageCategory::Error);
        }
        Err(UnknownOpcode(opcode))
    }
}

impl Default for OpcodeRegistry {
    fn default() -> Self {
        Self::default_registry()
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Client -> server login request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub token: String,
    pub client_version: String,
    pub device_id: String,
}

/// Server -> client login response. `ok = false` rejects the handshake;
/// `player_id`/`session_id` are empty in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub ok: bool,
    #[serde(default)]
    pub player_id: String,
    #[serde(default)]
    pub session_id: String,
    pub server_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFrame>,
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Client -> server ping. `ping_seq` increments per ping from this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub client_unix_ms: u64,
    pub ping_seq: u64,
}

/// Server -> client pong, echoing the ping's fields so RTT can be computed
/// client-side as `now - client_unix_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub client_unix_ms: u64,
    pub ping_seq: u64,
}

// ---------------------------------------------------------------------------
// Business push / action
// ---------------------------------------------------------------------------

/// One opaque game-state unit inside a push. The schema of `data` is owned
/// by the concrete game and out of scope for this core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Server -> client business push. `seq` MUST be strictly monotone per
/// connection, and continues (never resets) across a client's reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushState {
    pub seq: u64,
    pub business_id: String,
    pub state_fingerprint: String,
    #[serde(default)]
    pub units: Vec<Unit>,
    pub server_time_ms: u64,
}

/// Client -> server business action. `action_seq` is assigned by the
/// client and strictly monotone per (client, connection session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_seq: u64,
    pub player_id: String,
    pub action_kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub client_time_ms: u64,
}

/// Server -> client acknowledgement of an [`Action`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAck {
    pub action_seq: u64,
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Carries an integer code, a human-readable message, and an optional
/// correlating request id (e.g. the `action_seq` that triggered it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Frame <-> message glue
// ---------------------------------------------------------------------------

/// Errors from encoding/decoding a typed message onto/from a [`Frame`].
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Unknown(#[from] UnknownOpcode),
}

/// Serialize `msg` as JSON and wrap it in a length-prefixed frame.
pub fn encode_message<T: Serialize>(
    codec: &Codec,
    opcode: u16,
    msg: &T,
) -> Result<Vec<u8>, ProtoError> {
    let body = serde_json::to_vec(msg)?;
    Ok(codec.encode(opcode, Some(&body)))
}

/// Decode a complete wire buffer into `(opcode, T)`.
pub fn decode_message<T: for<'de> Deserialize<'de>>(
    codec: &Codec,
    buf: &[u8],
) -> Result<(u16, T), ProtoError> {
    let frame = codec.decode(buf)?;
    let msg = serde_json::from_slice(&frame.body)?;
    Ok((frame.opcode, msg))
}

/// Decode the JSON body of an already-extracted [`Frame`].
pub fn decode_frame_body<T: for<'de> Deserialize<'de>>(frame: &Frame) -> Result<T, ProtoError> {
    Ok(serde_json::from_slice(&frame.body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_classifies_known_opcodes() {
        let reg = OpcodeRegistry::default_registry();
        assert_eq!(
            reg.new_message(opcode::LOGIN_REQUEST).unwrap(),
            MessageCategory::Handshake
        );
        assert_eq!(
            reg.new_message(opcode::PUSH_STATE).unwrap(),
            MessageCategory::BusinessPush
        );
        assert_eq!(
            reg.new_message(opcode::ACTION).unwrap(),
            MessageCategory::BusinessAction
        );
        assert_eq!(
            reg.new_message(opcode::PING).unwrap(),
            MessageCategory::Heartbeat
        );
        assert_eq!(
            reg.new_message(opcode::ERROR).unwrap(),
            MessageCategory::Error
        );
    }

    #[test]
    fn registry_classifies_unregistered_value_in_a_known_range() {
        let reg = OpcodeRegistry::default_registry();
        // 0x0210 is in the business-push range but not a specific registered value.
        assert_eq!(
            reg.new_message(0x0210).unwrap(),
            MessageCategory::BusinessPush
        );
        assert!(reg.is_valid(0x0210));
    }

    #[test]
    fn registry_rejects_opcode_outside_every_range() {
        let reg = OpcodeRegistry::default_registry();
        assert!(!reg.is_valid(0xFFFF));
        assert_eq!(reg.new_message(0xFFFF), Err(UnknownOpcode(0xFFFF)));
    }

    #[test]
    fn push_state_roundtrips_through_frame() {
        let codec = Codec::default();
        let push = PushState {
            seq: 7,
            business_id: "match-1".to_owned(),
            state_fingerprint: "abc123".to_owned(),
            units: vec![Unit {
                unit_id: "u1".to_owned(),
                data: serde_json::json!({"hp": 100}),
            }],
            server_time_ms: 1_700_000_000_000,
        };
        let buf = encode_message(&codec, opcode::PUSH_STATE, &push).unwrap();
        let (decoded_opcode, decoded): (u16, PushState) =
            decode_message(&codec, &buf).unwrap();
        assert_eq!(decoded_opcode, opcode::PUSH_STATE);
        assert_eq!(decoded, push);
    }

    #[test]
    fn pong_echoes_ping_fields_by_construction() {
        let ping = Ping {
            client_unix_ms: 123,
            ping_seq: 4,
        };
        let pong = Pong {
            client_unix_ms: ping.client_unix_ms,
            ping_seq: ping.ping_seq,
        };
        assert_eq!(pong.client_unix_ms, ping.client_unix_ms);
        assert_eq!(pong.ping_seq, ping.ping_seq);
    }

    #[test]
    fn login_response_reject_has_empty_ids() {
        let json = serde_json::json!({
            "ok": false,
            "server_time_ms": 1,
            "error": {"code": 401, "message": "bad token"}
        });
        let resp: LoginResponse = serde_json::from_value(json).unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.player_id, "");
        assert_eq!(resp.session_id, "");
        assert_eq!(resp.error.unwrap().code, 401);
    }
}
