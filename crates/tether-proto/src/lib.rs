//! Shared wire and storage types for the tether signaling relay.
//! Kept in a dedicated crate so the relay front-end and endpoint-side
//! session engine agree on shapes without pulling in runtime code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which party authored a signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Controller,
    Device,
    /// Registry/sweeper-originated signals (kick, expiry bye). Never
    /// subject to echo suppression.
    System,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Controller => "controller",
            Side::Device => "device",
            Side::System => "system",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Side::Controller),
            "device" => Ok(Side::Device),
            "system" => Ok(Side::System),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Signal message kinds exchanged over the relay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Offer,
    Answer,
    Ice,
    Kick,
    Bye,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Offer => "offer",
            MsgType::Answer => "answer",
            MsgType::Ice => "ice",
            MsgType::Kick => "kick",
            MsgType::Bye => "bye",
        }
    }
}

/// Opaque negotiation payloads. The relay never interprets SDP or
/// candidate contents; it only routes them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SignalPayload {
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u32>,
    },
    Sdp {
        sdp: String,
    },
    Teardown {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_controller_type: Option<String>,
    },
}

impl SignalPayload {
    pub fn sdp(sdp: impl Into<String>) -> Self {
        SignalPayload::Sdp { sdp: sdp.into() }
    }

    pub fn teardown(reason: impl Into<String>) -> Self {
        SignalPayload::Teardown {
            reason: reason.into(),
            new_controller_type: None,
        }
    }
}

/// One negotiation message as stored by the relay. Immutable once
/// written; `id` is the dedup key and `seq` the per-session insertion
/// order both delivery paths sort by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub from_side: Side,
    pub msg_type: MsgType,
    pub payload: SignalPayload,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
}

/// A signal as submitted by a party; the store assigns id/seq/created_at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSignal {
    pub session_id: Uuid,
    pub from_side: Side,
    pub msg_type: MsgType,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
    Expired,
}

impl SessionStatus {
    /// Terminal sessions are eligible for hard deletion by the sweeper.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Expired => "expired",
        }
    }
}

/// One controller↔device pairing. Support sessions use the same shape
/// with `device_id` unset; they are addressed by PIN instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    #[serde(default)]
    pub device_id: Option<String>,
    pub created_by: String,
    pub status: SessionStatus,
    /// SHA-256 of the one-time access code. Plaintext is returned only
    /// in the create response.
    pub pin_hash: String,
    /// SHA-256 of the opaque bearer token.
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        matches!(self.status, SessionStatus::Pending | SessionStatus::Active)
    }
}

/// Identity known to both sides. `holder` is the single piece of
/// contended state: the controller currently claiming the device. All
/// mutation of it goes through the store's compare-and-swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub holder: Option<String>,
    #[serde(default)]
    pub holder_type: Option<String>,
}

/// One ICE server entry of the connection-setup configuration handed to
/// session creators. Opaque to the relay core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: impl Into<String>) -> Self {
        Self {
            urls: urls.into(),
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
    pub ttl: u64,
    pub expires: i64,
}

/// Response to session creation: credentials plus connection-setup
/// configuration, plaintext PIN/token included exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: Uuid,
    pub token: String,
    pub pin: String,
    pub expires_at: DateTime<Utc>,
    pub ice_server_config: IceConfig,
}

/// Outcome of an atomic claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub claimed: bool,
    pub kicked_sessions: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_wire_shapes() {
        let sdp = serde_json::to_value(SignalPayload::sdp("v=0")).unwrap();
        assert_eq!(sdp, serde_json::json!({"sdp": "v=0"}));

        let cand = serde_json::to_value(SignalPayload::Candidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        })
        .unwrap();
        assert_eq!(cand["sdpMid"], "0");
        assert_eq!(cand["sdpMLineIndex"], 0);

        let kick = serde_json::to_value(SignalPayload::Teardown {
            reason: "displaced".into(),
            new_controller_type: Some("controller".into()),
        })
        .unwrap();
        assert_eq!(kick["reason"], "displaced");
    }

    #[test]
    fn payload_roundtrip_distinguishes_variants() {
        let raw = r#"{"candidate":"candidate:1","sdpMid":"0"}"#;
        let parsed: SignalPayload = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, SignalPayload::Candidate { .. }));

        let raw = r#"{"reason":"session_expired"}"#;
        let parsed: SignalPayload = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, SignalPayload::Teardown { .. }));
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Ended.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }

    #[test]
    fn side_parses_from_str() {
        assert_eq!("controller".parse::<Side>().unwrap(), Side::Controller);
        assert_eq!("system".parse::<Side>().unwrap(), Side::System);
        assert!("dashboard".parse::<Side>().is_err());
    }
}
