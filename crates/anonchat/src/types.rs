//! Wire types.
//!
//! Three families live here:
//! - the OpenAI-style request accepted from clients and the completion /
//!   chunk objects sent back;
//! - the conversation request and requirements response of the anonymous
//!   upstream;
//! - the JSON error envelopes the proxy writes itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";
pub const FINISH_STOP: &str = "stop";

// ---------------------------------------------------------------------------
// Client-facing (OpenAI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Text only; structured content arrays are rejected at parse time.
    pub content: String,
}

/// Request body for `/v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Accepted for compatibility; the reported model comes from config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// True when `content` is a verbatim copy of one of the input messages.
    pub fn echoes_input(&self, content: &str) -> bool {
        self.messages.iter().any(|m| m.content == content)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// One `data:` frame of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

/// Token accounting is not available upstream; always zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response body for a non-streamed completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// Proxy error envelopes
// ---------------------------------------------------------------------------

/// Written when a request fails after it reached the completion handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: bool,
    pub error: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            status: false,
            error: kind.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidRequestBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Written for unknown routes and unparseable request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidRequestEnvelope {
    pub status: bool,
    pub error: InvalidRequestBody,
}

impl InvalidRequestEnvelope {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: false,
            error: InvalidRequestBody {
                message: message.into(),
                kind: "invalid_request_error".to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Author {
    pub role: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamContent {
    pub content_type: String,
    pub parts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamMessage {
    pub id: String,
    pub author: Author,
    pub content: UpstreamContent,
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationMode {
    pub kind: String,
}

/// Body posted to `backend-anon/conversation`.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRequest {
    pub action: String,
    pub messages: Vec<UpstreamMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub parent_message_id: String,
    pub model: String,
    pub timezone_offset_min: i32,
    pub suggestions: Vec<String>,
    pub history_and_training_disabled: bool,
    pub conversation_mode: ConversationMode,
    pub force_nulligen: bool,
    pub force_paragen: bool,
    pub force_paragen_model_slug: String,
    pub force_rate_limit: bool,
    pub websocket_request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProofOfWorkChallenge {
    #[serde(default)]
    pub required: Option<bool>,
    pub seed: String,
    pub difficulty: String,
}

impl ProofOfWorkChallenge {
    /// Upstream sometimes sends a challenge it does not enforce.
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(true)
    }
}

/// Response of `backend-anon/sentinel/chat-requirements`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequirements {
    pub token: String,
    #[serde(default)]
    pub proofofwork: Option<ProofOfWorkChallenge>,
}

/// The parts of an upstream conversation event the proxy cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationEvent {
    /// First text part of the message, empty when absent.
    pub text: String,
    pub conversation_id: Option<String>,
}

impl ConversationEvent {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(payload)?;
        let text = value
            .pointer("/message/content/parts/0")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let conversation_id = value
            .get("conversation_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        Ok(Self {
            text,
            conversation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(!req.is_stream());
        assert!(req.conversation_id.is_none());
        assert!(req.echoes_input("hi"));
        assert!(!req.echoes_input("hi there"));
    }

    #[test]
    fn test_structured_content_is_rejected() {
        let result = serde_json::from_str::<ChatCompletionRequest>(
            r#"{"messages":[{"role":"user","content":[{"type":"text","text":"hi"}]}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_event_parse() {
        let event = ConversationEvent::parse(
            r#"{"message":{"author":{"role":"assistant"},"content":{"content_type":"text","parts":["Hello"]}},"conversation_id":"c-1"}"#,
        )
        .unwrap();
        assert_eq!(event.text, "Hello");
        assert_eq!(event.conversation_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn test_event_parse_tolerates_missing_parts() {
        let event = ConversationEvent::parse(r#"{"type":"moderation","message":null}"#).unwrap();
        assert_eq!(event, ConversationEvent::default());

        let event = ConversationEvent::parse(r#"{"message":{"content":{"parts":[{"img":1}]}}}"#)
            .unwrap();
        assert_eq!(event.text, "");

        assert!(ConversationEvent::parse("not json").is_err());
    }

    #[test]
    fn test_chunk_serializes_null_finish_reason() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-x".into(),
            object: CHUNK_OBJECT.into(),
            created: 1,
            model: "gpt-3.5-turbo".into(),
            conversation_id: None,
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    content: "Hi".into(),
                },
                finish_reason: None,
            }],
        };
        let v = serde_json::to_value(&chunk).unwrap();
        assert!(v["choices"][0]["finish_reason"].is_null());
        assert!(v.get("conversation_id").is_none());
    }

    #[test]
    fn test_requirements_without_challenge() {
        let req: ChatRequirements = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert!(req.proofofwork.is_none());

        let req: ChatRequirements = serde_json::from_str(
            r#"{"token":"abc","proofofwork":{"required":false,"seed":"s","difficulty":"0fffff"}}"#,
        )
        .unwrap();
        assert!(!req.proofofwork.unwrap().is_required());
    }

    #[test]
    fn test_invalid_request_envelope_shape() {
        let v = serde_json::to_value(InvalidRequestEnvelope::new("nope")).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "status": false,
                "error": {"message": "nope", "type": "invalid_request_error"}
            })
        );
    }
}
