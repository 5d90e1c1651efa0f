//! Signaling protocol messages
//!
//! Messages are JSON objects with exactly one of two shapes:
//! `{"sdp": <session description>}` or `{"candidate": <ICE candidate>}`.
//! The nested objects use the browser JSON forms so a browser-side viewer
//! can consume them unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tilecast_core::{Result, TileCastError};

/// SDP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Answer
    Answer,
    /// Rollback
    Rollback,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Raw SDP
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// A signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalMessage {
    /// `{"sdp": ...}`
    Sdp(SessionDescription),
    /// `{"candidate": ...}`
    Candidate(IceCandidate),
}

impl SignalMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| TileCastError::Encoding {
            reason: e.to_string(),
        })
    }

    /// Decode an inbound text frame
    ///
    /// A non-null `sdp` field takes precedence over `candidate`. Valid JSON
    /// carrying neither yields `Ok(None)`.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text).map_err(|e| invalid(text, e))?;

        if let Some(sdp) = present(&value, "sdp") {
            let description = SessionDescription::deserialize(sdp).map_err(|e| invalid(text, e))?;
            return Ok(Some(SignalMessage::Sdp(description)));
        }

        if let Some(candidate) = present(&value, "candidate") {
            let candidate = IceCandidate::deserialize(candidate).map_err(|e| invalid(text, e))?;
            return Ok(Some(SignalMessage::Candidate(candidate)));
        }

        Ok(None)
    }

    /// Message type name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Sdp(_) => "sdp",
            SignalMessage::Candidate(_) => "candidate",
        }
    }
}

fn present<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    value.get(field).filter(|v| !v.is_null())
}

fn invalid(text: &str, error: serde_json::Error) -> TileCastError {
    TileCastError::InvalidMessage {
        message: text.to_string(),
        source: error.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_shape() {
        let message = SignalMessage::Sdp(SessionDescription::offer("v=0\r\n"));
        let json: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["sdp"]["type"], "offer");
        assert_eq!(json["sdp"]["sdp"], "v=0\r\n");
        assert!(json.get("candidate").is_none());
    }

    #[test]
    fn test_candidate_wire_shape() {
        let message = SignalMessage::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        let json: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
        assert!(json["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn test_parse_browser_answer() {
        let parsed = SignalMessage::parse(r#"{"sdp":{"type":"answer","sdp":"v=0"}}"#).unwrap();
        assert_eq!(
            parsed,
            Some(SignalMessage::Sdp(SessionDescription::answer("v=0")))
        );
    }

    #[test]
    fn test_parse_browser_candidate_with_nulls() {
        let parsed = SignalMessage::parse(
            r#"{"candidate":{"candidate":"candidate:0","sdpMid":null,"sdpMLineIndex":null,"usernameFragment":null}}"#,
        )
        .unwrap();
        match parsed {
            Some(SignalMessage::Candidate(candidate)) => {
                assert_eq!(candidate.candidate, "candidate:0");
                assert!(candidate.sdp_mid.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sdp_takes_precedence_over_candidate() {
        let parsed = SignalMessage::parse(
            r#"{"sdp":{"type":"answer","sdp":"v=0"},"candidate":{"candidate":"candidate:0"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(parsed.kind(), "sdp");
    }

    #[test]
    fn test_null_fields_are_absent() {
        assert_eq!(SignalMessage::parse(r#"{"candidate":null}"#).unwrap(), None);
        let parsed = SignalMessage::parse(r#"{"sdp":null,"candidate":{"candidate":"c"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.kind(), "candidate");
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let err = SignalMessage::parse("{not json").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MESSAGE");
        let err = SignalMessage::parse(r#"{"sdp":{"type":"bogus","sdp":""}}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MESSAGE");
    }

    #[test]
    fn test_unrelated_json_is_ignored() {
        assert_eq!(SignalMessage::parse(r#"{"hello":"world"}"#).unwrap(), None);
        assert_eq!(SignalMessage::parse("[]").unwrap(), None);
    }
}
