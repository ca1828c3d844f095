//! Live-channel wire frames.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::session::{SessionId, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Input,
    Resize,
    Ping,
    Output,
    Status,
    Error,
    Pong,
    Connected,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Input => "input",
            MessageType::Resize => "resize",
            MessageType::Ping => "ping",
            MessageType::Output => "output",
            MessageType::Status => "status",
            MessageType::Error => "error",
            MessageType::Pong => "pong",
            MessageType::Connected => "connected",
        }
    }

    /// Types a client may send.
    pub fn is_client_type(&self) -> bool {
        matches!(
            self,
            MessageType::Input | MessageType::Resize | MessageType::Ping
        )
    }
}

impl FromStr for MessageType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(MessageType::Input),
            "resize" => Ok(MessageType::Resize),
            "ping" => Ok(MessageType::Ping),
            "output" => Ok(MessageType::Output),
            "status" => Ok(MessageType::Status),
            "error" => Ok(MessageType::Error),
            "pong" => Ok(MessageType::Pong),
            "connected" => Ok(MessageType::Connected),
            other => Err(HubError::InvalidMessageType(other.to_string())),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame on the live channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl WsMessage {
    fn new(kind: MessageType, session_id: Option<&SessionId>) -> Self {
        Self {
            kind,
            data: None,
            session_id: session_id.cloned(),
            timestamp: Utc::now(),
            rows: None,
            cols: None,
            status: None,
            error: None,
            retryable: None,
        }
    }

    pub fn connected(session_id: &SessionId) -> Self {
        Self::new(MessageType::Connected, Some(session_id))
    }

    pub fn output(session_id: &SessionId, data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::new(MessageType::Output, Some(session_id))
        }
    }

    pub fn status(session_id: &SessionId, status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::new(MessageType::Status, Some(session_id))
        }
    }

    /// Error frame carrying only the safe message and the retry hint.
    pub fn error(session_id: Option<&SessionId>, error: &HubError) -> Self {
        Self {
            error: Some(error.to_string()),
            retryable: Some(error.is_retryable()),
            ..Self::new(MessageType::Error, session_id)
        }
    }

    pub fn pong(session_id: &SessionId, echo: Option<DateTime<Utc>>) -> Self {
        let mut message = Self::new(MessageType::Pong, Some(session_id));
        if let Some(timestamp) = echo {
            message.timestamp = timestamp;
        }
        message
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A validated client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Input(String),
    Resize { rows: u16, cols: u16 },
    Ping { timestamp: Option<DateTime<Utc>> },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    rows: Option<i64>,
    #[serde(default)]
    cols: Option<i64>,
}

/// Parses an inbound text frame. Any `session_id` in the frame is ignored;
/// the connection decides which session a frame belongs to.
pub fn parse_client_frame(text: &str) -> Result<ClientRequest, HubError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(|_| HubError::InvalidMessage)?;
    let kind: MessageType = raw.kind.parse()?;
    match kind {
        MessageType::Input => Ok(ClientRequest::Input(raw.data.unwrap_or_default())),
        MessageType::Resize => {
            let (rows, cols) = validate_resize(raw.rows.unwrap_or(0), raw.cols.unwrap_or(0))?;
            Ok(ClientRequest::Resize { rows, cols })
        }
        MessageType::Ping => Ok(ClientRequest::Ping {
            timestamp: raw
                .timestamp
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
        }),
        other => Err(HubError::UnsupportedMessageType(other.to_string())),
    }
}

/// Rows and cols must both be in `1..=u16::MAX`.
pub fn validate_resize(rows: i64, cols: i64) -> Result<(u16, u16), HubError> {
    let invalid = || HubError::InvalidResize { rows, cols };
    let r = u16::try_from(rows).map_err(|_| invalid())?;
    let c = u16::try_from(cols).map_err(|_| invalid())?;
    if r == 0 || c == 0 {
        return Err(invalid());
    }
    Ok((r, c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_input() {
        let request = parse_client_frame(r#"{"type":"input","data":"echo hi\n"}"#).unwrap();
        assert_eq!(request, ClientRequest::Input("echo hi\n".to_string()));
    }

    #[test]
    fn test_parse_input_without_data_is_empty() {
        let request = parse_client_frame(r#"{"type":"input"}"#).unwrap();
        assert_eq!(request, ClientRequest::Input(String::new()));
    }

    #[test]
    fn test_parse_ignores_client_session_id() {
        let request =
            parse_client_frame(r#"{"type":"input","data":"x","session_id":"someone-else"}"#)
                .unwrap();
        assert_eq!(request, ClientRequest::Input("x".to_string()));
    }

    #[test]
    fn test_parse_rejections() {
        assert_eq!(
            parse_client_frame("not json"),
            Err(HubError::InvalidMessage)
        );
        assert_eq!(
            parse_client_frame(r#"{"type":"bogus"}"#),
            Err(HubError::InvalidMessageType("bogus".to_string()))
        );
        assert_eq!(
            parse_client_frame(r#"{"type":"output","data":"x"}"#),
            Err(HubError::UnsupportedMessageType("output".to_string()))
        );
        assert_eq!(
            parse_client_frame(r#"{"type":"resize","rows":0,"cols":80}"#),
            Err(HubError::InvalidResize { rows: 0, cols: 80 })
        );
        assert!(matches!(
            parse_client_frame(r#"{"type":"resize","rows":40}"#),
            Err(HubError::InvalidResize { .. })
        ));
    }

    #[test]
    fn test_parse_ping_echoes_timestamp() {
        let request =
            parse_client_frame(r#"{"type":"ping","timestamp":"2024-01-02T03:04:05Z"}"#).unwrap();
        let ClientRequest::Ping { timestamp } = request else {
            panic!("expected ping");
        };
        let pong = WsMessage::pong(&SessionId::from("s"), timestamp);
        assert_eq!(pong.timestamp.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert_eq!(pong.kind, MessageType::Pong);
    }

    #[test]
    fn test_server_frames_serialize_compactly() {
        let id = SessionId::from("abc");
        let json = serde_json::to_value(WsMessage::output(&id, "hi")).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["data"], "hi");
        assert_eq!(json["session_id"], "abc");
        assert!(json.get("rows").is_none());
        assert!(json.get("error").is_none());

        let json = serde_json::to_value(WsMessage::status(&id, SessionStatus::Running)).unwrap();
        assert_eq!(json["status"], "running");

        let json =
            serde_json::to_value(WsMessage::error(Some(&id), &HubError::InvalidMessage)).unwrap();
        assert_eq!(json["error"], "Invalid message format");
        assert_eq!(json["retryable"], false);
    }

    #[test]
    fn test_message_type_round_trip() {
        for kind in [
            MessageType::Input,
            MessageType::Resize,
            MessageType::Ping,
            MessageType::Output,
            MessageType::Status,
            MessageType::Error,
            MessageType::Pong,
            MessageType::Connected,
        ] {
            assert_eq!(kind.as_str().parse::<MessageType>(), Ok(kind));
        }
    }

    proptest! {
        #[test]
        fn prop_resize_accepts_only_positive_u16(rows in -70_000i64..70_000, cols in -70_000i64..70_000) {
            let valid = (1..=i64::from(u16::MAX)).contains(&rows)
                && (1..=i64::from(u16::MAX)).contains(&cols);
            let result = validate_resize(rows, cols);
            prop_assert_eq!(result.is_ok(), valid);
            if let Ok((r, c)) = result {
                prop_assert_eq!((i64::from(r), i64::from(c)), (rows, cols));
            }
        }
    }
}
