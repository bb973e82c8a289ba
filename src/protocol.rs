//! JSON messages of the bidirectional live model API.
//!
//! Outbound frames are externally tagged (`{"setup": {...}}`,
//! `{"realtimeInput": {...}}`, `{"toolResponse": {...}}`). Inbound frames may
//! carry several signals at once; [`ServerMessage::into_events`] flattens them
//! into [`InboundEvent`]s in a fixed order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid UTF-8 in frame")]
    InvalidString,
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// One frame of microphone audio.
    pub fn audio_frame(data: String, sample_rate: u32) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                data,
                mime_type: format!("audio/pcm;rate={}", sample_rate),
            },
        })
    }

    /// Completion of a tool call, success or failure.
    pub fn tool_result(id: String, name: String, response: Value) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse { id, name, response }],
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
    pub input_audio_transcription: TranscriptionConfig,
    pub output_audio_transcription: TranscriptionConfig,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    pub fn prebuilt(voice_name: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.into(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

/// Serialises as `{}`; its presence switches the transcription channel on.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallRequest>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    /// Top-level fields this client does not act on
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Everything the conversation reacts to, one variant per signal.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SetupComplete,
    ToolCall(Vec<FunctionCall>),
    ToolCallCancellation(Vec<String>),
    /// Speech-to-text of the learner's microphone audio
    InputTranscript(String),
    /// Text the model is speaking
    OutputTranscript(String),
    /// Base64 16-bit PCM of model speech
    Audio {
        data: String,
        mime_type: Option<String>,
    },
    TurnComplete,
    Interrupted,
    GoAway {
        time_left: Option<String>,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Binary frames carry the same JSON as text frames.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)?;
        Self::parse(text)
    }

    pub fn into_events(self) -> Vec<InboundEvent> {
        let mut events = Vec::new();

        if !self.extra.is_empty() {
            let mut fields: Vec<&str> = self.extra.keys().map(String::as_str).collect();
            fields.sort_unstable();
            log::debug!("Ignoring server fields: {}", fields.join(", "));
        }

        if self.setup_complete.is_some() {
            events.push(InboundEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                events.push(InboundEvent::InputTranscript(text));
            }
            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                events.push(InboundEvent::OutputTranscript(text));
            }
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(inline) = part.inline_data {
                        events.push(InboundEvent::Audio {
                            data: inline.data,
                            mime_type: inline.mime_type,
                        });
                    }
                }
            }
            if content.interrupted {
                events.push(InboundEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(InboundEvent::TurnComplete);
            }
        }

        if let Some(call) = self.tool_call {
            if !call.function_calls.is_empty() {
                events.push(InboundEvent::ToolCall(call.function_calls));
            }
        }

        if let Some(cancellation) = self.tool_call_cancellation {
            events.push(InboundEvent::ToolCallCancellation(cancellation.ids));
        }

        if let Some(go_away) = self.go_away {
            events.push(InboundEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}

/// Sample rate from a mime type such as `audio/pcm;rate=24000`.
pub fn pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("rate="))
        .and_then(|rate| rate.parse().ok())
}
