//! Wire messages exchanged over a terminal session's duplex transport.
//!
//! Each frame is one JSON object tagged by `type`. Client and server use
//! separate closed enums, so every handler match is exhaustive.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::plans::PlanTier;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Raw keystrokes, written to the shell unvalidated.
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    /// A full command line; validated before it reaches the shell.
    Command {
        data: String,
        #[serde(default)]
        plan: Option<PlanTier>,
    },
}

impl ClientMessage {
    /// Parses one text frame. Malformed frames yield `None`; the caller
    /// drops them and keeps the connection open.
    pub fn parse(frame: &str) -> Option<Self> {
        match serde_json::from_str(frame) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("Dropping malformed terminal frame: {e}");
                None
            }
        }
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// First message of every session.
    #[serde(rename_all = "camelCase")]
    Session { session_id: String },
    Output { data: String },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Exit { exit_code: Option<i32> },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Serializing these variants can't fail: all fields are strings/ints
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_input() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"input","data":"ls\r"}"#),
            Some(ClientMessage::Input { data: "ls\r".into() })
        );
    }

    #[test]
    fn test_parse_resize() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"resize","cols":120,"rows":40}"#),
            Some(ClientMessage::Resize { cols: 120, rows: 40 })
        );
    }

    #[test]
    fn test_parse_command_plan_optional() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"command","data":"ls"}"#),
            Some(ClientMessage::Command { data: "ls".into(), plan: None })
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"command","data":"ls","plan":"pro"}"#),
            Some(ClientMessage::Command { data: "ls".into(), plan: Some(PlanTier::Pro) })
        );
        // Unknown tiers degrade to free instead of dropping the frame
        assert_eq!(
            ClientMessage::parse(r#"{"type":"command","data":"ls","plan":"gold"}"#),
            Some(ClientMessage::Command { data: "ls".into(), plan: Some(PlanTier::Free) })
        );
    }

    #[test]
    fn test_malformed_frames_dropped() {
        for frame in [
            "not json",
            r#"{"data":"x"}"#,
            r#"{"type":"launch","data":"x"}"#,
            r#"{"type":"resize","cols":-1,"rows":40}"#,
            r#"{"type":"input"}"#,
        ] {
            assert_eq!(ClientMessage::parse(frame), None, "{frame}");
        }
    }

    #[test]
    fn test_server_message_shapes() {
        let cases = [
            (
                ServerMessage::Session { session_id: "abc".into() },
                json!({"type": "session", "sessionId": "abc"}),
            ),
            (
                ServerMessage::Output { data: "hi".into() },
                json!({"type": "output", "data": "hi"}),
            ),
            (
                ServerMessage::Error { message: "no".into(), suggestion: None },
                json!({"type": "error", "message": "no"}),
            ),
            (
                ServerMessage::Error { message: "no".into(), suggestion: Some("try".into()) },
                json!({"type": "error", "message": "no", "suggestion": "try"}),
            ),
            (
                ServerMessage::Exit { exit_code: Some(0) },
                json!({"type": "exit", "exitCode": 0}),
            ),
            (
                ServerMessage::Exit { exit_code: None },
                json!({"type": "exit", "exitCode": null}),
            ),
        ];
        for (message, expected) in cases {
            let value: serde_json::Value = serde_json::from_str(&message.to_json()).unwrap();
            assert_eq!(value, expected);
        }
    }
}
