//! One chat completion, end to end.
//!
//! A request goes through `build → auth → dispatch → stream → finalize`:
//! the client messages are wrapped into the upstream conversation envelope,
//! the current session credentials are attached, the conversation call is
//! opened, and its event stream is turned into OpenAI-shaped output.
//!
//! Upstream repeats the whole answer-so-far in every event (and sometimes
//! echoes the prompt back first), so each event is diffed against the
//! longest content seen in this request and only the new tail is emitted.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::refresher::SessionRefresher;
use crate::session::SessionState;
use crate::stream::{decode_event_stream, is_heartbeat};
use crate::types::{
    AssistantMessage, Author, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest,
    ChunkChoice, CompletionChoice, ConversationEvent, ConversationMode, ConversationRequest, Delta,
    ErrorEnvelope, UpstreamContent, UpstreamMessage, Usage, CHUNK_OBJECT, COMPLETION_OBJECT,
    FINISH_STOP,
};
use crate::upstream::UpstreamClient;

const COMPLETION_ID_PREFIX: &str = "chatcmpl-";
const COMPLETION_ID_LEN: usize = 28;
const TIMEZONE_OFFSET_MIN: i32 = -480;

pub fn completion_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COMPLETION_ID_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", COMPLETION_ID_PREFIX, suffix)
}

/// Wrap the client messages into the upstream conversation body.
///
/// The client's conversation id is only forwarded once upstream has
/// confirmed a conversation for the current device id.
pub fn build_conversation_request(
    request: &ChatCompletionRequest,
    keep_conversation: bool,
    model: &str,
) -> ConversationRequest {
    let messages = request
        .messages
        .iter()
        .map(|message| UpstreamMessage {
            id: Uuid::new_v4().to_string(),
            author: Author {
                role: message.role.clone(),
            },
            content: UpstreamContent {
                content_type: "text".to_string(),
                parts: vec![message.content.clone()],
            },
            metadata: serde_json::Map::new(),
        })
        .collect();

    let conversation_id = request
        .conversation_id
        .clone()
        .filter(|id| keep_conversation && !id.is_empty());

    ConversationRequest {
        action: "next".to_string(),
        messages,
        conversation_id,
        parent_message_id: Uuid::new_v4().to_string(),
        model: model.to_string(),
        timezone_offset_min: TIMEZONE_OFFSET_MIN,
        suggestions: Vec::new(),
        history_and_training_disabled: false,
        conversation_mode: ConversationMode {
            kind: "primary_assistant".to_string(),
        },
        force_nulligen: false,
        force_paragen: false,
        force_paragen_model_slug: String::new(),
        force_rate_limit: false,
        websocket_request_id: Uuid::new_v4().to_string(),
    }
}

/// Per-request response state. Never shared between requests.
#[derive(Debug, Clone)]
pub struct CompletionAccumulator {
    id: String,
    created: i64,
    longest: String,
}

impl CompletionAccumulator {
    pub fn new() -> Self {
        Self::with_id(completion_id(), Utc::now().timestamp())
    }

    pub fn with_id(id: String, created: i64) -> Self {
        Self {
            id,
            created,
            longest: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Longest content observed so far; the final answer once the stream ends.
    pub fn content(&self) -> &str {
        &self.longest
    }

    /// Record `content` and return the part of it not yet emitted.
    ///
    /// Content extending the longest one yields just the new suffix. Content
    /// that is not longer yields nothing and leaves the state alone. Longer
    /// content that does not share the prefix is emitted whole.
    pub fn observe(&mut self, content: &str) -> String {
        let delta = match content.strip_prefix(self.longest.as_str()) {
            Some(suffix) => suffix,
            None if content.len() <= self.longest.len() => "",
            None => content,
        }
        .to_string();

        if content.len() > self.longest.len() {
            self.longest = content.to_string();
        }
        delta
    }

    pub fn chunk(
        &self,
        model: &str,
        delta: String,
        conversation_id: Option<String>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.created,
            model: model.to_string(),
            conversation_id,
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta { content: delta },
                finish_reason: None,
            }],
        }
    }

    pub fn stop_chunk(&self, model: &str) -> ChatCompletionChunk {
        let mut chunk = self.chunk(model, String::new(), None);
        chunk.choices[0].finish_reason = Some(FINISH_STOP.to_string());
        chunk
    }

    pub fn completion(&self, model: &str) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: COMPLETION_OBJECT.to_string(),
            created: self.created,
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: self.longest.clone(),
                },
                finish_reason: FINISH_STOP.to_string(),
            }],
            usage: Usage::default(),
        }
    }
}

impl Default for CompletionAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sse_frame(chunk: &ChatCompletionChunk) -> Result<Bytes> {
    let json = serde_json::to_string(chunk)?;
    Ok(Bytes::from(format!("data: {}\n\n", json)))
}

pub fn error_body(error: &ProxyError) -> Bytes {
    let envelope = ErrorEnvelope::new(error.kind(), error.to_string());
    Bytes::from(serde_json::to_vec(&envelope).unwrap_or_default())
}

/// What the HTTP layer should send back.
pub enum CompletionReply {
    /// `text/event-stream` frames, ending with the stop chunk (or an error
    /// envelope when composing failed midway).
    Stream(BoxStream<'static, Bytes>),
    Complete(ChatCompletion),
    Failed(ErrorEnvelope),
}

pub struct CompletionResponder {
    upstream: UpstreamClient,
    refresher: Arc<SessionRefresher>,
    state: Arc<SessionState>,
    upstream_model: String,
    response_model: String,
    refresh_before_request: bool,
    refresh_after_request: bool,
}

impl CompletionResponder {
    pub fn new(
        config: &ProxyConfig,
        upstream: UpstreamClient,
        refresher: Arc<SessionRefresher>,
    ) -> Self {
        Self {
            upstream,
            state: refresher.state().clone(),
            refresher,
            upstream_model: config.upstream_model.clone(),
            response_model: config.response_model.clone(),
            refresh_before_request: config.refresh_before_request,
            refresh_after_request: config.refresh_after_request,
        }
    }

    pub async fn respond(self: &Arc<Self>, request: ChatCompletionRequest) -> CompletionReply {
        info!(
            messages = request.messages.len(),
            stream = request.is_stream(),
            "chat completion request"
        );

        let keep_conversation = self.state.keep_conversation().await;
        let body = build_conversation_request(&request, keep_conversation, &self.upstream_model);

        if self.refresh_before_request {
            if let Err(e) = self.refresher.refresh().await {
                warn!(error = %e, "inline token refresh failed, using the current token");
            }
        }
        let device_id = self.state.device_id().await;
        let credentials = self.state.credentials().await;

        debug!(conversation_id = ?body.conversation_id, "dispatching conversation");
        let response = match self
            .upstream
            .conversation(&body, &device_id, credentials.as_ref())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "conversation request failed");
                self.schedule_refresh();
                return CompletionReply::Failed(ErrorEnvelope::new(e.kind(), e.to_string()));
            }
        };

        if request.is_stream() {
            return CompletionReply::Stream(self.clone().stream_frames(request, response));
        }

        let reply = match self.collect_completion(&request, response).await {
            Ok(completion) => CompletionReply::Complete(completion),
            Err(e) => {
                error!(error = %e, "failed to compose completion");
                CompletionReply::Failed(ErrorEnvelope::new(e.kind(), e.to_string()))
            }
        };
        self.schedule_refresh();
        reply
    }

    /// Apply one upstream payload to the accumulator. Returns the chunk to
    /// stream, if the payload added anything new.
    async fn apply_event(
        &self,
        payload: &str,
        request: &ChatCompletionRequest,
        acc: &mut CompletionAccumulator,
    ) -> Result<Option<ChatCompletionChunk>> {
        if is_heartbeat(payload) {
            return Ok(None);
        }

        let event = ConversationEvent::parse(payload)?;
        self.state
            .set_keep_conversation(event.conversation_id.is_some())
            .await;

        if event.text.is_empty() || request.echoes_input(&event.text) {
            return Ok(None);
        }

        let delta = acc.observe(&event.text);
        if delta.is_empty() {
            return Ok(None);
        }
        Ok(Some(acc.chunk(
            &self.response_model,
            delta,
            event.conversation_id,
        )))
    }

    async fn collect_completion(
        &self,
        request: &ChatCompletionRequest,
        response: reqwest::Response,
    ) -> Result<ChatCompletion> {
        let mut acc = CompletionAccumulator::new();
        let mut payloads = Box::pin(decode_event_stream(response.bytes_stream()));

        while let Some(payload) = payloads.next().await {
            self.apply_event(&payload?, request, &mut acc).await?;
        }
        Ok(acc.completion(&self.response_model))
    }

    fn stream_frames(
        self: Arc<Self>,
        request: ChatCompletionRequest,
        response: reqwest::Response,
    ) -> BoxStream<'static, Bytes> {
        let frames = async_stream::stream! {
            let mut acc = CompletionAccumulator::new();
            let mut payloads = Box::pin(decode_event_stream(response.bytes_stream()));
            let mut failure: Option<ProxyError> = None;

            while let Some(payload) = payloads.next().await {
                let applied = match payload {
                    Ok(payload) => self.apply_event(&payload, &request, &mut acc).await,
                    Err(e) => Err(e),
                };
                match applied.and_then(|chunk| chunk.map(|c| sse_frame(&c)).transpose()) {
                    Ok(Some(frame)) => yield frame,
                    Ok(None) => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if failure.is_none() {
                match sse_frame(&acc.stop_chunk(&self.response_model)) {
                    Ok(frame) => yield frame,
                    Err(e) => failure = Some(e),
                }
            }
            if let Some(e) = failure {
                error!(error = %e, completion_id = %acc.id(), "failed to compose streamed completion");
                yield error_body(&e);
            }

            self.schedule_refresh();
        };
        frames.boxed()
    }

    /// Best-effort refresh in anticipation of the next request.
    fn schedule_refresh(&self) {
        if !self.refresh_after_request {
            return;
        }
        let refresher = self.refresher.clone();
        tokio::spawn(async move {
            debug!("preparing a new token for the next request");
            if let Err(e) = refresher.refresh().await {
                warn!(error = %e, "failed to renew the session token, continuing with the old one");
            }
        });
    }
}
