//! Streaming normalizer.
//!
//! Endpoints stream one of three wire formats depending on their task type.
//! Each format gets an accumulator that folds raw chunks into complete
//! [`WireMessage`]s; the [`TurnRunner`] drives the fold, redraws the surface
//! after every chunk and falls back to a single non-streaming query when the
//! stream breaks.

use crate::render::{self, Block};
use crate::serving::{EndpointInfo, InvocationRequest, ServingEndpoint, ServingError};
use crate::surface::Surface;
use crate::transcript::{AssistantTurn, ConversationTurn, Session};
use crate::types::{Role, TaskType, ToolCall, WireMessage};
use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RETRY_NOTICE: &str = "_Ran into an error. Retrying without streaming..._";

/// Request id the endpoint attaches for feedback correlation.
pub fn correlation_id(chunk: &Value) -> Option<&str> {
    chunk
        .pointer("/databricks_output/databricks_request_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Chat-completion deltas: one logical message.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    content: String,
}

impl DeltaAccumulator {
    pub fn apply(&mut self, chunk: &Value) {
        if let Some(text) = chunk.pointer("/choices/0/delta/content").and_then(Value::as_str) {
            self.content.push_str(text);
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn view(&self) -> Vec<WireMessage> {
        vec![WireMessage::assistant(self.content())]
    }

    pub fn finish(self) -> Vec<WireMessage> {
        vec![WireMessage::assistant(self.content)]
    }
}

#[derive(Debug, Deserialize)]
struct AgentChunk {
    delta: AgentDelta,
}

#[derive(Debug, Deserialize)]
struct AgentDelta {
    id: String,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Chunks seen so far for one message id, and what they add up to.
#[derive(Debug)]
pub struct MessageBuffer {
    chunks: usize,
    role_seen: bool,
    message: WireMessage,
    tool_call_index: HashMap<String, usize>,
}

impl MessageBuffer {
    fn new(id: String) -> Self {
        let mut message = WireMessage::assistant("");
        message.id = Some(id);
        Self {
            chunks: 0,
            role_seen: false,
            message,
            tool_call_index: HashMap::new(),
        }
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn message(&self) -> &WireMessage {
        &self.message
    }

    fn push(&mut self, delta: AgentDelta) {
        self.chunks += 1;

        if let (false, Some(role)) = (self.role_seen, delta.role) {
            self.message.role = role;
            self.role_seen = true;
        }
        if self.message.name.is_none() {
            self.message.name = delta.name;
        }
        if let Some(text) = delta.content.filter(|text| !text.is_empty()) {
            self.message.content.get_or_insert_with(String::new).push_str(&text);
        }

        for call in delta.tool_calls.unwrap_or_default() {
            let Some(call_id) = call.id.filter(|id| !id.is_empty()) else {
                continue;
            };
            let function = call.function.unwrap_or_default();
            let name = function.name.unwrap_or_default();
            let arguments = function.arguments.unwrap_or_default();

            match self.tool_call_index.get(&call_id) {
                Some(&idx) => {
                    let existing = &mut self.message.tool_calls[idx].function;
                    existing.arguments.push_str(&arguments);
                    // A fragment without a name never clears a known one.
                    if !name.is_empty() {
                        existing.name = name;
                    }
                }
                None => {
                    let mut tool_call = ToolCall::function(call_id.clone(), name, arguments);
                    if let Some(kind) = call.kind {
                        tool_call.kind = kind;
                    }
                    self.tool_call_index.insert(call_id, self.message.tool_calls.len());
                    self.message.tool_calls.push(tool_call);
                }
            }
        }

        if let Some(id) = delta.tool_call_id.filter(|id| !id.is_empty()) {
            self.message.tool_call_id = Some(id);
        }
    }
}

/// Chat-agent deltas keyed by message id, kept in first-seen order.
#[derive(Debug, Default)]
pub struct KeyedAccumulator {
    buffers: Vec<MessageBuffer>,
    index: HashMap<String, usize>,
}

impl KeyedAccumulator {
    pub fn apply(&mut self, chunk: &Value) -> Result<(), ServingError> {
        let chunk = AgentChunk::deserialize(chunk)
            .map_err(|err| ServingError::MalformedChunk(err.to_string()))?;
        let delta = chunk.delta;
        let slot = match self.index.get(&delta.id) {
            Some(&slot) => slot,
            None => {
                let slot = self.buffers.len();
                self.index.insert(delta.id.clone(), slot);
                self.buffers.push(MessageBuffer::new(delta.id.clone()));
                slot
            }
        };
        self.buffers[slot].push(delta);
        Ok(())
    }

    pub fn buffers(&self) -> &[MessageBuffer] {
        &self.buffers
    }

    pub fn view(&self) -> Vec<WireMessage> {
        self.buffers().iter().map(|buffer| buffer.message().clone()).collect()
    }

    pub fn finish(self) -> Vec<WireMessage> {
        let chunks: usize = self.buffers.iter().map(MessageBuffer::chunks).sum();
        debug!(messages = self.buffers.len(), chunks, "chat agent stream folded");
        self.buffers.into_iter().map(|buffer| buffer.message).collect()
    }
}

/// Responses-agent events; every item arrives complete.
#[derive(Debug, Default)]
pub struct EventAccumulator {
    messages: Vec<WireMessage>,
}

impl EventAccumulator {
    pub fn apply(&mut self, event: &Value) -> Result<(), ServingError> {
        let Some(kind) = event.get("type") else {
            return Ok(());
        };
        if !kind.is_string() {
            return Err(ServingError::MalformedChunk(format!(
                "event type must be a string, got {kind}"
            )));
        }
        match event.get("item") {
            None | Some(Value::Null) => {}
            Some(item @ Value::Object(_)) => self.messages.extend(item_messages(item)),
            Some(other) => {
                return Err(ServingError::MalformedChunk(format!(
                    "event item must be an object, got {other}"
                )));
            }
        }
        Ok(())
    }

    pub fn view(&self) -> Vec<WireMessage> {
        self.messages.clone()
    }

    pub fn finish(self) -> Vec<WireMessage> {
        self.messages
    }
}

/// Converts one responses-format output item into wire messages.
pub fn item_messages(item: &Value) -> Vec<WireMessage> {
    let text_field = |key: &str| -> Option<String> {
        match item.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        }
    };

    match item.get("type").and_then(Value::as_str) {
        Some("message") => item
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .filter(|text| !text.is_empty())
                    .map(WireMessage::assistant)
                    .collect()
            })
            .unwrap_or_default(),
        Some("function_call") => {
            let mut msg = WireMessage::assistant("");
            msg.tool_calls.push(ToolCall::function(
                text_field("call_id").unwrap_or_default(),
                text_field("name").unwrap_or_default(),
                text_field("arguments").unwrap_or_default(),
            ));
            vec![msg]
        }
        Some("function_call_output") => vec![WireMessage::tool(
            text_field("output").unwrap_or_default(),
            text_field("call_id"),
        )],
        _ => Vec::new(),
    }
}

#[derive(Debug)]
pub enum Accumulator {
    Delta(DeltaAccumulator),
    Keyed(KeyedAccumulator),
    Events(EventAccumulator),
}

impl Accumulator {
    pub fn for_task(task_type: TaskType) -> Self {
        match task_type {
            TaskType::ChatCompletions => Accumulator::Delta(DeltaAccumulator::default()),
            TaskType::ChatAgent => Accumulator::Keyed(KeyedAccumulator::default()),
            TaskType::Responses => Accumulator::Events(EventAccumulator::default()),
        }
    }

    pub fn apply(&mut self, chunk: &Value) -> Result<(), ServingError> {
        match self {
            Accumulator::Delta(acc) => {
                acc.apply(chunk);
                Ok(())
            }
            Accumulator::Keyed(acc) => acc.apply(chunk),
            Accumulator::Events(acc) => acc.apply(chunk),
        }
    }

    pub fn view(&self) -> Vec<WireMessage> {
        match self {
            Accumulator::Delta(acc) => acc.view(),
            Accumulator::Keyed(acc) => acc.view(),
            Accumulator::Events(acc) => acc.view(),
        }
    }

    pub fn finish(self) -> Vec<WireMessage> {
        match self {
            Accumulator::Delta(acc) => acc.finish(),
            Accumulator::Keyed(acc) => acc.finish(),
            Accumulator::Events(acc) => acc.finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
    Completed,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn: AssistantTurn,
    pub state: TurnState,
    pub fell_back: bool,
}

pub struct TurnRunner {
    endpoint: Arc<dyn ServingEndpoint>,
    info: EndpointInfo,
}

impl TurnRunner {
    pub fn new(endpoint: Arc<dyn ServingEndpoint>, info: EndpointInfo) -> Self {
        Self { endpoint, info }
    }

    pub fn endpoint(&self) -> &dyn ServingEndpoint {
        self.endpoint.as_ref()
    }

    pub fn supports_feedback(&self) -> bool {
        self.info.supports_feedback
    }

    /// Full user turn: query with the transcript plus the prompt, then append
    /// both turns. A failed turn leaves the session untouched.
    pub async fn handle_prompt<S>(
        &self,
        session: &mut Session,
        surface: &mut S,
        prompt: &str,
    ) -> Result<TurnOutcome>
    where
        S: Surface + ?Sized,
    {
        let user_turn = ConversationTurn::user(prompt);
        let mut input = session.transcript().to_wire_messages();
        input.extend(user_turn.to_wire_messages());

        let outcome = self.respond(input, surface).await?;
        session.commit(user_turn, ConversationTurn::Assistant(outcome.turn.clone()));
        Ok(outcome)
    }

    pub async fn respond<S>(&self, messages: Vec<WireMessage>, surface: &mut S) -> Result<TurnOutcome>
    where
        S: Surface + ?Sized,
    {
        let request = InvocationRequest {
            task_type: self.info.task_type,
            messages,
            return_traces: self.info.supports_feedback,
        };
        let mut state = TurnState::Idle;

        surface.begin().await?;
        transition(&mut state, TurnState::Streaming);

        match self.stream_turn(&request, surface).await {
            Ok(turn) => {
                transition(&mut state, TurnState::Completed);
                info!(
                    messages = turn.messages.len(),
                    request_id = turn.correlation_id.as_deref().unwrap_or("-"),
                    "streamed turn complete"
                );
                Ok(TurnOutcome {
                    turn,
                    state,
                    fell_back: false,
                })
            }
            Err(err) => {
                transition(&mut state, TurnState::Failed);
                warn!(error = %err, "streaming failed, retrying without streaming");
                surface.discard(RETRY_NOTICE).await?;

                transition(&mut state, TurnState::Retrying);
                let result = self
                    .endpoint
                    .query(&request)
                    .await
                    .with_context(|| format!("non-streaming query to {} failed", self.endpoint.name()))?;
                surface.redraw(&render::render_messages(&result.messages)).await?;
                surface.finish().await?;

                transition(&mut state, TurnState::Completed);
                let correlation_id = result.correlation_id.filter(|_| request.return_traces);
                Ok(TurnOutcome {
                    turn: AssistantTurn::new(result.messages, correlation_id),
                    state,
                    fell_back: true,
                })
            }
        }
    }

    async fn stream_turn<S>(&self, request: &InvocationRequest, surface: &mut S) -> Result<AssistantTurn>
    where
        S: Surface + ?Sized,
    {
        let mut chunks = self.endpoint.stream(request).await?;
        let mut accumulator = Accumulator::for_task(request.task_type);
        let mut request_id: Option<String> = None;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if request.return_traces {
                if let Some(id) = correlation_id(&chunk) {
                    request_id = Some(id.to_string());
                }
            }
            accumulator.apply(&chunk)?;

            let blocks: Vec<Block> = render::render_messages(&accumulator.view());
            if !blocks.is_empty() {
                surface.redraw(&blocks).await?;
            }
        }

        surface.finish().await?;
        Ok(AssistantTurn::new(accumulator.finish(), request_id))
    }
}

fn transition(state: &mut TurnState, next: TurnState) {
    let from = *state;
    debug!(?from, to = ?next, "turn state");
    *state = next;
}
