use serde::{Deserialize, Serialize};

use crate::types::{PeerId, SessionDescription};

/// Messages exchanged with the signaling relay
///
/// A missing or empty `to` addresses every connected endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Announce the sender's identity to the relay
    Register { from: PeerId },

    /// Offer or answer for the peer connection between `from` and `to`
    Sdp {
        #[serde(default)]
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        sdp: SessionDescription,
    },

    /// Trickled ICE candidate
    Candidate {
        #[serde(default)]
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: String,
    },
}

impl SignalingMessage {
    pub fn register(from: PeerId) -> Self {
        Self::Register { from }
    }

    pub fn sdp(from: PeerId, to: PeerId, sdp: SessionDescription) -> Self {
        Self::Sdp {
            from,
            to: Some(to),
            sdp,
        }
    }

    pub fn candidate(from: PeerId, to: PeerId, candidate: String, sdp_mid: String) -> Self {
        Self::Candidate {
            from,
            to: Some(to),
            candidate,
            sdp_mid,
        }
    }

    pub fn from(&self) -> &PeerId {
        match self {
            Self::Register { from } => from,
            Self::Sdp { from, .. } => from,
            Self::Candidate { from, .. } => from,
        }
    }

    /// Recipient, or `None` for a broadcast
    pub fn to(&self) -> Option<&PeerId> {
        match self {
            Self::Register { .. } => None,
            Self::Sdp { to, .. } | Self::Candidate { to, .. } => to.as_ref().filter(|t| !t.is_empty()),
        }
    }
}

/// The routing fields common to every message, parsed without committing to a
/// message type. The relay forwards on these alone; the client filters on them
/// before decoding the full message.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

impl Envelope {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn is_register(&self) -> bool {
        self.kind == "register"
    }

    /// Non-empty recipient, if any
    pub fn recipient(&self) -> Option<&str> {
        self.to.as_deref().filter(|to| !to.is_empty())
    }

    /// Whether an endpoint named `local_id` should act on this message
    pub fn is_for(&self, local_id: &PeerId) -> bool {
        match self.recipient() {
            Some(to) => local_id == to,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_format() {
        let msg = SignalingMessage::register(PeerId::from("alice"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "register", "from": "alice"}));
    }

    #[test]
    fn test_sdp_wire_format() {
        let msg = SignalingMessage::sdp(
            "alice".into(),
            "bob".into(),
            SessionDescription::offer("v=0\r\n"),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "sdp",
                "from": "alice",
                "to": "bob",
                "sdp": {"type": "offer", "sdp": "v=0\r\n"}
            })
        );
    }

    #[test]
    fn test_candidate_uses_camel_case_mid() {
        let text = r#"{"type":"candidate","from":"bob","to":"alice","candidate":"candidate:1 1 UDP 1 10.0.0.1 5000 typ host","sdpMid":"0"}"#;
        let msg: SignalingMessage = serde_json::from_str(text).unwrap();
        match msg {
            SignalingMessage::Candidate { from, sdp_mid, .. } => {
                assert_eq!(from, "bob");
                assert_eq!(sdp_mid, "0");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_missing_or_empty_to_is_broadcast() {
        let msg: SignalingMessage = serde_json::from_str(
            r#"{"type":"sdp","from":"bob","sdp":{"type":"answer","sdp":"x"}}"#,
        )
        .unwrap();
        assert!(msg.to().is_none());

        let msg: SignalingMessage = serde_json::from_str(
            r#"{"type":"sdp","from":"bob","to":"","sdp":{"type":"answer","sdp":"x"}}"#,
        )
        .unwrap();
        assert!(msg.to().is_none());
    }

    #[test]
    fn test_envelope_addressing() {
        let alice = PeerId::from("alice");

        let direct = Envelope::parse(r#"{"type":"sdp","from":"bob","to":"alice"}"#).unwrap();
        assert!(direct.is_for(&alice));

        let other = Envelope::parse(r#"{"type":"sdp","from":"bob","to":"carol"}"#).unwrap();
        assert!(!other.is_for(&alice));

        let broadcast = Envelope::parse(r#"{"type":"candidate","from":"bob","to":""}"#).unwrap();
        assert!(broadcast.is_for(&alice));
        assert!(broadcast.recipient().is_none());
    }

    #[test]
    fn test_envelope_rejects_invalid_json() {
        assert!(Envelope::parse("{not json").is_err());
    }
}
