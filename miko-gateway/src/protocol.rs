use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type alias for turn identifiers.
pub type TurnId = String;

/// Type alias for session identifiers.
pub type SessionId = String;

/// Error code for malformed or invalid inbound messages.
pub const CODE_BAD_REQUEST: u16 = 400;
/// Error code for operations referencing an unknown or finished turn.
pub const CODE_NOT_FOUND: u16 = 404;
/// Error code for upstream (agent) failures surfaced on an active turn.
pub const CODE_INTERNAL: u16 = 500;

/// Messages sent from the client to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authorize {
        token: String,
    },
    Pong,
    ChatMessage {
        content: String,
        user_id: String,
        agent_id: String,
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        persona: Option<String>,
        #[serde(default)]
        images: Vec<String>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    InterruptStream {
        #[serde(default)]
        turn_id: Option<TurnId>,
    },
    FetchBackgrounds,
    FetchAvatarConfigs,
    SwitchAvatarConfig {
        file: String,
    },
}

/// Events sent from the gateway to the client.
///
/// Agent `tool_call`/`tool_result` events are deliberately absent: they are
/// logged server-side and never cross the client boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthorizeSuccess {
        connection_id: Uuid,
    },
    AuthorizeError {
        error: String,
    },
    Ping,
    Error {
        code: u16,
        error: String,
    },
    StreamStart {
        turn_id: TurnId,
        session_id: SessionId,
    },
    TtsReadyChunk {
        chunk: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emotion: Option<String>,
    },
    StreamEnd {
        turn_id: TurnId,
        session_id: SessionId,
        content: String,
    },
    Interrupted {
        turn_id: TurnId,
        reason: String,
    },
    BackgroundFiles {
        files: Vec<String>,
    },
    AvatarConfigFiles {
        configs: Vec<String>,
    },
    AvatarConfigSwitched {
        file: String,
    },
    SetModelAndConf {
        model: String,
        conf_name: String,
    },
}

impl ServerEvent {
    /// Whether this event terminates its turn's outbound stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerEvent::StreamEnd { .. }
                | ServerEvent::Interrupted { .. }
                | ServerEvent::Error { .. }
        )
    }
}

/// Decode a raw inbound text frame into a validated [`ClientMessage`].
///
/// Unknown `type` tags and missing required fields are decode errors; callers
/// translate the error string into an `error{code:400}` outbound event.
pub fn decode_client_message(raw: &str) -> Result<ClientMessage, String> {
    let message: ClientMessage =
        serde_json::from_str(raw).map_err(|e| format!("invalid message: {}", e))?;
    validate(&message)?;
    Ok(message)
}

/// Field-level validation beyond what the schema can express.
fn validate(message: &ClientMessage) -> Result<(), String> {
    if let ClientMessage::ChatMessage {
        user_id, agent_id, ..
    } = message
    {
        if user_id.trim().is_empty() {
            return Err("user_id is required and must be a non-empty string".to_string());
        }
        if agent_id.trim().is_empty() {
            return Err("agent_id is required and must be a non-empty string".to_string());
        }
    }
    if let ClientMessage::SwitchAvatarConfig { file } = message {
        if file.trim().is_empty() {
            return Err("file is required and must be a non-empty string".to_string());
        }
    }
    Ok(())
}

/// Serialize a [`ServerEvent`] to its JSON wire form.
pub fn encode_server_event(event: &ServerEvent) -> String {
    // ServerEvent contains only JSON-representable fields, so serialization
    // cannot fail outside of allocation errors.
    serde_json::to_string(event).unwrap_or_else(|e| {
        format!(
            r#"{{"type":"error","code":{},"error":"encode failure: {}"}}"#,
            CODE_INTERNAL, e
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- ClientMessage decoding ---

    #[test]
    fn test_decode_authorize() {
        let msg = decode_client_message(r#"{"type":"authorize","token":"t-1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Authorize {
                token: "t-1".into()
            }
        );
    }

    #[test]
    fn test_decode_pong() {
        let msg = decode_client_message(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Pong);
    }

    #[test]
    fn test_decode_chat_message_minimal() {
        let raw = r#"{"type":"chat_message","content":"Hi","user_id":"u1","agent_id":"a1"}"#;
        let msg = decode_client_message(raw).unwrap();
        match msg {
            ClientMessage::ChatMessage {
                content,
                user_id,
                agent_id,
                session_id,
                persona,
                images,
                metadata,
            } => {
                assert_eq!(content, "Hi");
                assert_eq!(user_id, "u1");
                assert_eq!(agent_id, "a1");
                assert_eq!(session_id, None);
                assert_eq!(persona, None);
                assert!(images.is_empty());
                assert_eq!(metadata, None);
            }
            other => panic!("Expected ChatMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_chat_message_full() {
        let raw = r#"{
            "type": "chat_message",
            "content": "look at this",
            "user_id": "u1",
            "agent_id": "a1",
            "session_id": "s-9",
            "persona": "cheerful",
            "images": ["aGVsbG8="],
            "metadata": {"client": "desktop"}
        }"#;
        let msg = decode_client_message(raw).unwrap();
        match msg {
            ClientMessage::ChatMessage {
                session_id,
                persona,
                images,
                metadata,
                ..
            } => {
                assert_eq!(session_id.as_deref(), Some("s-9"));
                assert_eq!(persona.as_deref(), Some("cheerful"));
                assert_eq!(images, vec!["aGVsbG8=".to_string()]);
                assert_eq!(metadata.unwrap()["client"], "desktop");
            }
            other => panic!("Expected ChatMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_interrupt_with_and_without_turn() {
        let msg = decode_client_message(r#"{"type":"interrupt_stream","turn_id":"t-7"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::InterruptStream {
                turn_id: Some("t-7".into())
            }
        );

        let msg = decode_client_message(r#"{"type":"interrupt_stream"}"#).unwrap();
        assert_eq!(msg, ClientMessage::InterruptStream { turn_id: None });
    }

    #[test]
    fn test_decode_config_messages() {
        assert_eq!(
            decode_client_message(r#"{"type":"fetch_backgrounds"}"#).unwrap(),
            ClientMessage::FetchBackgrounds
        );
        assert_eq!(
            decode_client_message(r#"{"type":"fetch_avatar_configs"}"#).unwrap(),
            ClientMessage::FetchAvatarConfigs
        );
        assert_eq!(
            decode_client_message(r#"{"type":"switch_avatar_config","file":"mio.yaml"}"#).unwrap(),
            ClientMessage::SwitchAvatarConfig {
                file: "mio.yaml".into()
            }
        );
    }

    #[test]
    fn test_unknown_type_tag_fails() {
        let result = decode_client_message(r#"{"type":"upload_audio","data":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_required_field_fails() {
        let result = decode_client_message(r#"{"type":"authorize"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_json_fails() {
        assert!(decode_client_message("not json").is_err());
        assert!(decode_client_message("").is_err());
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let raw = r#"{"type":"chat_message","content":"Hi","user_id":"  ","agent_id":"a1"}"#;
        let err = decode_client_message(raw).unwrap_err();
        assert!(err.contains("user_id"));
    }

    #[test]
    fn test_empty_agent_id_rejected() {
        let raw = r#"{"type":"chat_message","content":"Hi","user_id":"u1","agent_id":""}"#;
        let err = decode_client_message(raw).unwrap_err();
        assert!(err.contains("agent_id"));
    }

    #[test]
    fn test_empty_avatar_file_rejected() {
        let err =
            decode_client_message(r#"{"type":"switch_avatar_config","file":" "}"#).unwrap_err();
        assert!(err.contains("file"));
    }

    // --- ServerEvent encoding ---

    #[test]
    fn test_encode_snake_case_tags() {
        let json = encode_server_event(&ServerEvent::Ping);
        assert_eq!(json, r#"{"type":"ping"}"#);

        let json = encode_server_event(&ServerEvent::StreamStart {
            turn_id: "t-1".into(),
            session_id: "s-1".into(),
        });
        assert!(json.contains(r#""type":"stream_start""#));
        assert!(json.contains(r#""turn_id":"t-1""#));
    }

    #[test]
    fn test_encode_tts_chunk_omits_absent_emotion() {
        let json = encode_server_event(&ServerEvent::TtsReadyChunk {
            chunk: "Hello there.".into(),
            emotion: None,
        });
        assert!(!json.contains("emotion"));

        let json = encode_server_event(&ServerEvent::TtsReadyChunk {
            chunk: "Hello!".into(),
            emotion: Some("joyful".into()),
        });
        assert!(json.contains(r#""emotion":"joyful""#));
    }

    #[test]
    fn test_server_event_roundtrip() {
        let events = vec![
            ServerEvent::AuthorizeSuccess {
                connection_id: Uuid::new_v4(),
            },
            ServerEvent::AuthorizeError {
                error: "bad token".into(),
            },
            ServerEvent::Error {
                code: CODE_BAD_REQUEST,
                error: "nope".into(),
            },
            ServerEvent::StreamEnd {
                turn_id: "t".into(),
                session_id: "s".into(),
                content: "Hello there. How are you?".into(),
            },
            ServerEvent::Interrupted {
                turn_id: "t".into(),
                reason: "client_requested".into(),
            },
            ServerEvent::BackgroundFiles {
                files: vec!["room.png".into()],
            },
            ServerEvent::AvatarConfigFiles {
                configs: vec!["mio.yaml".into()],
            },
            ServerEvent::AvatarConfigSwitched {
                file: "mio.yaml".into(),
            },
            ServerEvent::SetModelAndConf {
                model: "live2d-mio".into(),
                conf_name: "mio".into(),
            },
        ];
        for event in events {
            let json = encode_server_event(&event);
            let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(event, parsed);
        }
    }

    #[test]
    fn test_terminal_event_classification() {
        assert!(ServerEvent::StreamEnd {
            turn_id: "t".into(),
            session_id: "s".into(),
            content: String::new(),
        }
        .is_terminal());
        assert!(ServerEvent::Interrupted {
            turn_id: "t".into(),
            reason: "superseded".into(),
        }
        .is_terminal());
        assert!(ServerEvent::Error {
            code: CODE_INTERNAL,
            error: "agent failure".into(),
        }
        .is_terminal());
        assert!(!ServerEvent::Ping.is_terminal());
        assert!(!ServerEvent::TtsReadyChunk {
            chunk: "hi".into(),
            emotion: None,
        }
        .is_terminal());
    }

    #[test]
    fn test_unicode_content_roundtrip() {
        let event = ServerEvent::TtsReadyChunk {
            chunk: "こんにちは。".into(),
            emotion: Some("joyful".into()),
        };
        let json = encode_server_event(&event);
        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
