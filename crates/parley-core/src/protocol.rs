//! Realtime voice protocol.
//!
//! JSON text frames over a WebSocket. Every frame is an object whose `type`
//! field names the event. Audio travels both ways as base64-encoded pcm16
//! (24 kHz, 16-bit, mono).

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::ToolDefinition;

/// Audio encoding name used for both directions.
pub const PCM16: &str = "pcm16";

// --- Session configuration ---

/// Body of a `session.update` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    pub input_audio_format: String,

    pub output_audio_format: String,

    /// `null` disables server-side turn detection; turns are then committed
    /// explicitly by the client.
    pub turn_detection: Option<TurnDetection>,

    pub tools: Vec<FunctionTool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            modalities: vec!["text".into(), "audio".into()],
            instructions: None,
            voice: None,
            input_audio_format: PCM16.into(),
            output_audio_format: PCM16.into(),
            turn_detection: None,
            tools: Vec::new(),
            tool_choice: None,
        }
    }
}

/// Server-side turn detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
}

/// Function tool as advertised in `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl From<&ToolDefinition> for FunctionTool {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            kind: "function".into(),
            name: def.name.clone(),
            description: def.description.clone(),
            parameters: def.parameters.clone(),
        }
    }
}

// --- Client events ---

/// Item submitted with `conversation.item.create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundItem {
    FunctionCallOutput {
        call_id: String,
        /// JSON-encoded result.
        output: String,
    },
}

/// Events sent to the realtime service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64 pcm16.
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: OutboundItem },
}

impl ClientEvent {
    /// Audio append event from raw pcm16 bytes.
    pub fn audio_append(pcm: &[u8]) -> Self {
        Self::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(pcm),
        }
    }

    /// Function result submission. `output` is JSON-encoded on the wire.
    pub fn function_output(call_id: impl Into<String>, output: &serde_json::Value) -> Self {
        Self::ConversationItemCreate {
            item: OutboundItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.to_string(),
            },
        }
    }

    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioBufferCommit => "input_audio_buffer.commit",
            Self::ResponseCreate => "response.create",
            Self::ResponseCancel => "response.cancel",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
        }
    }

    /// Encode as a text frame carrying `event_id`, which the service echoes
    /// back in any `error` it raises for this event.
    pub fn to_frame(&self, event_id: &str) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("event_id".into(), event_id.into());
        }
        serde_json::to_string(&value)
    }
}

// --- Server events ---

/// Error detail carried by a server `error` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub param: Option<String>,
    /// Id of the client event that caused the error.
    #[serde(default)]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// One content part of a conversation item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
}

/// Conversation item as reported by `conversation.item.created`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// Concatenated text or transcript of all content parts.
    pub fn text(&self) -> Option<String> {
        let text: String = self
            .content
            .iter()
            .filter_map(|p| p.text.as_deref().or(p.transcript.as_deref()))
            .collect();
        (!text.is_empty()).then_some(text)
    }
}

/// Events received from the realtime service.
///
/// Event types the session does not act on decode as [`ServerEvent::Unknown`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated { item: ConversationItem },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
        /// Base64 pcm16.
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        call_id: String,
        delta: String,
        #[serde(default)]
        name: Option<String>,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        #[serde(default)]
        arguments: String,
        #[serde(default)]
        name: Option<String>,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Wire name of the event (`"unknown"` for unrecognised types).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::ConversationItemCreated { .. } => "conversation.item.created",
            Self::ResponseCreated { .. } => "response.created",
            Self::AudioDelta { .. } => "response.audio.delta",
            Self::AudioDone { .. } => "response.audio.done",
            Self::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::FunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
            Self::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            Self::ResponseDone { .. } => "response.done",
            Self::Unknown => "unknown",
        }
    }
}

/// Decode a base64 audio payload.
pub fn decode_audio(b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_STANDARD.decode(b64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_update_shape() {
        let settings = SessionSettings {
            voice: Some("alloy".into()),
            instructions: Some("Be brief.".into()),
            tools: vec![FunctionTool::from(&ToolDefinition {
                name: "write_note".into(),
                description: "Save a note".into(),
                parameters: json!({"type": "object", "required": ["title"]}),
            })],
            ..SessionSettings::default()
        };
        let event = ClientEvent::SessionUpdate { session: settings };
        let value: serde_json::Value =
            serde_json::from_str(&event.to_frame("evt_1").unwrap()).unwrap();

        assert_eq!(value["type"], "session.update");
        assert_eq!(value["event_id"], "evt_1");
        assert_eq!(value["session"]["modalities"], json!(["text", "audio"]));
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert_eq!(value["session"]["output_audio_format"], "pcm16");
        assert!(value["session"]["turn_detection"].is_null());
        assert_eq!(value["session"]["tools"][0]["type"], "function");
        assert_eq!(value["session"]["tools"][0]["name"], "write_note");
    }

    #[test]
    fn test_unit_events_serialize_type_only() {
        let commit = serde_json::to_value(ClientEvent::InputAudioBufferCommit).unwrap();
        assert_eq!(commit, json!({"type": "input_audio_buffer.commit"}));
        let cancel = serde_json::to_value(ClientEvent::ResponseCancel).unwrap();
        assert_eq!(cancel, json!({"type": "response.cancel"}));
    }

    #[test]
    fn test_audio_append_base64() {
        let event = ClientEvent::audio_append(&[0, 1, 2, 3]);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        assert_eq!(value["audio"], "AAECAw==");
        assert_eq!(decode_audio("AAECAw==").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_function_output_is_stringified_json() {
        let event = ClientEvent::function_output("call_9", &json!({"success": true}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "conversation.item.create");
        assert_eq!(value["item"]["type"], "function_call_output");
        assert_eq!(value["item"]["call_id"], "call_9");
        assert_eq!(value["item"]["output"], r#"{"success":true}"#);
    }

    #[test]
    fn test_parse_function_call_events() {
        let delta = ServerEvent::parse(
            r#"{"type":"response.function_call_arguments.delta","call_id":"c1","delta":"{\"ti","response_id":"r1"}"#,
        )
        .unwrap();
        assert_eq!(
            delta,
            ServerEvent::FunctionCallArgumentsDelta {
                call_id: "c1".into(),
                delta: "{\"ti".into(),
                name: None,
            }
        );

        let done = ServerEvent::parse(
            r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"write_note","arguments":"{}"}"#,
        )
        .unwrap();
        assert_eq!(done.kind(), "response.function_call_arguments.done");
    }

    #[test]
    fn test_parse_error_event() {
        let event = ServerEvent::parse(
            r#"{"type":"error","event_id":"srv_1","error":{"type":"invalid_request_error","code":"bad","message":"nope","event_id":"evt_7"}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.kind, "invalid_request_error");
                assert_eq!(error.message, "nope");
                assert_eq!(error.event_id.as_deref(), Some("evt_7"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_type_is_tolerated() {
        let event = ServerEvent::parse(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
        assert!(ServerEvent::parse("not json").is_err());
    }

    #[test]
    fn test_conversation_item_text() {
        let event = ServerEvent::parse(
            r#"{"type":"conversation.item.created","item":{"id":"i1","type":"message","role":"assistant","content":[{"type":"audio","transcript":"Hello"},{"type":"text","text":" there"}]}}"#,
        )
        .unwrap();
        let ServerEvent::ConversationItemCreated { item } = event else {
            panic!("expected conversation item");
        };
        assert_eq!(item.role.as_deref(), Some("assistant"));
        assert_eq!(item.text().as_deref(), Some("Hello there"));
    }
}
