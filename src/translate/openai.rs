//! `OpenAI` Chat Completions codec.
//!
//! Chat Completions has no content blocks: text, reasoning and tool calls all
//! arrive on one flat `delta` per chunk. The stream decoder therefore opens and
//! closes schema blocks itself, switching block whenever the kind of content
//! changes or a new tool call begins.

use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent,
    ChatErrorResponse, ChatFunction, ChatMessage, ChatTool, ChatToolCall, ChatToolCallFunction,
    ChatToolChoice, ChatToolChoiceFunction, ChatToolChoiceSpecific, ChatUsage, Choice,
    ChoiceMessage, ChunkChoice, ChunkDelta, ChunkToolCall, ChunkToolCallFunction,
    CompletionTokensDetails, ContentPart, ImageUrlDetail, StopSequences, StreamOptions,
};
use super::{parse_object, to_json_bytes, to_json_string, SseFrame, StreamDecoder, StreamEncoder};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::schema::{
    BlockKind, ContentBlock, Delta, Effort, ImageSource, Message, Reasoning, Request, Response,
    Role, StopReason, StreamEvent, ToolChoice, ToolSpec, Usage,
};
use bytes::Bytes;
use serde_json::Value;

/// `max_tokens` assumed when a Chat Completions request leaves it out.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Prefix marking a failed tool result, which Chat Completions cannot flag.
const TOOL_ERROR_PREFIX: &str = "ERROR: ";

pub const CONTENT_FILTER_WARNING: &str =
    "content_filter: the backend withheld part of the response under its content policy";
pub const REDACTED_THINKING_WARNING: &str =
    "redacted_thinking_dropped: encrypted reasoning has no Chat Completions equivalent";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn decode_request(body: &[u8]) -> Result<Request> {
    let map = parse_object(body, &["model", "messages"])?;
    let wire: ChatCompletionRequest =
        serde_json::from_value(Value::Object(map)).map_err(|e| GatewayError::decode_body(&e))?;

    let max_tokens = match wire.max_completion_tokens.or(wire.max_tokens) {
        Some(n) if n < 0 => {
            return Err(GatewayError::malformed("max_tokens must not be negative"));
        }
        Some(n) => n.unsigned_abs(),
        None => DEFAULT_MAX_TOKENS,
    };
    check_range("temperature", wire.temperature, 2.0)?;
    check_range("top_p", wire.top_p, 1.0)?;

    let mut system: Option<String> = None;
    let mut messages: Vec<Message> = Vec::with_capacity(wire.messages.len());
    let mut last_was_tool = false;

    for msg in wire.messages {
        let role = msg.role.clone();
        match role.as_str() {
            "system" | "developer" => {
                let text = msg.content.map(|c| c.text()).unwrap_or_default();
                if messages.is_empty() {
                    system = Some(match system {
                        Some(prev) => format!("{prev}\n\n{text}"),
                        None => text,
                    });
                } else {
                    messages.push(Message::text(Role::System, text));
                }
            }
            "user" => messages.push(Message::new(
                Role::User,
                msg.content.map(decode_user_content).unwrap_or_default(),
            )),
            "assistant" => messages.push(Message::new(Role::Assistant, decode_assistant(msg))),
            "tool" => {
                let raw = msg.content.map(|c| c.text()).unwrap_or_default();
                let (content, is_error) = match raw.strip_prefix(TOOL_ERROR_PREFIX) {
                    Some(rest) => (rest.to_string(), true),
                    None => (raw, false),
                };
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.unwrap_or_default(),
                    content,
                    is_error,
                };
                // Consecutive tool messages answer one assistant turn.
                match messages.last_mut() {
                    Some(last) if last_was_tool => last.content.push(block),
                    _ => messages.push(Message::new(Role::User, vec![block])),
                }
            }
            other => {
                return Err(GatewayError::decode(
                    "messages.role",
                    format!("unknown role '{other}'"),
                ))
            }
        }
        last_was_tool = role == "tool";
    }

    let req = Request {
        model: wire.model,
        messages,
        max_tokens,
        temperature: wire.temperature,
        top_p: wire.top_p,
        top_k: None,
        tools: wire
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|t| ToolSpec {
                name: t.function.name,
                description: t.function.description,
                input_schema: t.function.parameters,
            })
            .collect(),
        tool_choice: wire.tool_choice.map(|c| match c {
            ChatToolChoice::String(s) => match s.as_str() {
                "required" => ToolChoice::Any,
                "none" => ToolChoice::None,
                _ => ToolChoice::Auto,
            },
            ChatToolChoice::Specific(s) => ToolChoice::Tool(s.function.name),
        }),
        stream: wire.stream.unwrap_or(false),
        system,
        stop_sequences: wire.stop.map(StopSequences::into_vec).unwrap_or_default(),
        reasoning: wire
            .reasoning_effort
            .as_deref()
            .and_then(Effort::parse)
            .map(Reasoning::Effort),
        user: wire.user,
    };
    req.validate()?;
    Ok(req)
}

fn check_range(field: &str, value: Option<f64>, max: f64) -> Result<()> {
    match value {
        Some(v) if !(0.0..=max).contains(&v) => Err(GatewayError::malformed(format!(
            "{field} must be between 0 and {max}, got {v}"
        ))),
        _ => Ok(()),
    }
}

fn decode_user_content(content: ChatContent) -> Vec<ContentBlock> {
    match content {
        ChatContent::Text(text) => vec![ContentBlock::Text { text }],
        ChatContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(ContentBlock::Text { text }),
                ContentPart::ImageUrl { image_url } => Some(ContentBlock::Image {
                    source: match parse_data_url(&image_url.url) {
                        Some((media_type, data)) => ImageSource::Base64 { media_type, data },
                        None => ImageSource::Url(image_url.url),
                    },
                }),
                ContentPart::Unsupported => None,
            })
            .collect(),
    }
}

fn decode_assistant(msg: ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if let Some(text) = msg.reasoning_content.filter(|t| !t.is_empty()) {
        blocks.push(ContentBlock::Thinking {
            text,
            signature: None,
        });
    }
    if let Some(text) = msg.content.map(|c| c.text()).filter(|t| !t.is_empty()) {
        blocks.push(ContentBlock::Text { text });
    }
    for call in msg.tool_calls.unwrap_or_default() {
        blocks.push(tool_use_block(call));
    }
    blocks
}

fn tool_use_block(call: ChatToolCall) -> ContentBlock {
    let arguments = if call.function.arguments.trim().is_empty() {
        "{}".to_string()
    } else {
        call.function.arguments
    };
    ContentBlock::ToolUse {
        id: call.id,
        name: call.function.name,
        arguments,
    }
}

/// Split `data:<media type>;base64,<payload>` into its parts.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type.to_string(), data.to_string()))
}

/// Thinking and redacted blocks are dropped: Chat Completions requests have
/// no field for prior reasoning. `top_k` is dropped for the same reason.
pub fn encode_request(req: &Request) -> Bytes {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    if let Some(ref system) = req.system {
        messages.push(ChatMessage::new(
            "system",
            Some(ChatContent::Text(system.clone())),
        ));
    }
    for msg in &req.messages {
        match msg.role {
            Role::System => messages.push(ChatMessage::new(
                "system",
                Some(ChatContent::Text(collect_text(&msg.content))),
            )),
            Role::User => encode_user(&msg.content, &mut messages),
            Role::Assistant => messages.push(encode_assistant(&msg.content)),
        }
    }

    let out = ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: Some(i64::try_from(req.max_tokens).unwrap_or(i64::MAX)),
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream.then_some(true),
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools: if req.tools.is_empty() {
            None
        } else {
            Some(
                req.tools
                    .iter()
                    .map(|t| ChatTool {
                        tool_type: "function".to_string(),
                        function: ChatFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: clean_schema(&t.input_schema),
                        },
                    })
                    .collect(),
            )
        },
        tool_choice: req.tool_choice.as_ref().map(|c| match c {
            ToolChoice::Auto => ChatToolChoice::String("auto".to_string()),
            ToolChoice::Any => ChatToolChoice::String("required".to_string()),
            ToolChoice::None => ChatToolChoice::String("none".to_string()),
            ToolChoice::Tool(name) => ChatToolChoice::Specific(ChatToolChoiceSpecific {
                choice_type: "function".to_string(),
                function: ChatToolChoiceFunction { name: name.clone() },
            }),
        }),
        stop: if req.stop_sequences.is_empty() {
            None
        } else {
            Some(StopSequences::Many(req.stop_sequences.clone()))
        },
        user: req.user.clone(),
        reasoning_effort: req.reasoning.map(|r| r.effort().as_str().to_string()),
    };
    to_json_bytes(&out)
}

/// Tool results become separate `tool` messages, emitted before any text the
/// same turn carried.
fn encode_user(blocks: &[ContentBlock], out: &mut Vec<ChatMessage>) {
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut produced = false;

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => {
                let url = match source {
                    ImageSource::Base64 { media_type, data } => {
                        format!("data:{media_type};base64,{data}")
                    }
                    ImageSource::Url(url) => url.clone(),
                };
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail { url, detail: None },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if !parts.is_empty() {
                    out.push(ChatMessage::new("user", Some(collapse_parts(&parts))));
                    parts.clear();
                }
                let text = if *is_error {
                    format!("{TOOL_ERROR_PREFIX}{content}")
                } else {
                    content.clone()
                };
                let mut msg = ChatMessage::new("tool", Some(ChatContent::Text(text)));
                msg.tool_call_id = Some(tool_use_id.clone());
                out.push(msg);
                produced = true;
            }
            ContentBlock::ToolUse { .. }
            | ContentBlock::Thinking { .. }
            | ContentBlock::Redacted { .. } => {}
        }
    }

    if !parts.is_empty() {
        out.push(ChatMessage::new("user", Some(collapse_parts(&parts))));
    } else if !produced {
        out.push(ChatMessage::new("user", Some(ChatContent::Text(String::new()))));
    }
}

fn encode_assistant(blocks: &[ContentBlock]) -> ChatMessage {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse {
                id,
                name,
                arguments,
            } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }),
            _ => {}
        }
    }
    let content = if text.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(ChatContent::Text(text))
    };
    let mut msg = ChatMessage::new("assistant", content);
    if !tool_calls.is_empty() {
        msg.tool_calls = Some(tool_calls);
    }
    msg
}

fn collapse_parts(parts: &[ContentPart]) -> ChatContent {
    if let [ContentPart::Text { text }] = parts {
        return ChatContent::Text(text.clone());
    }
    ChatContent::Parts(parts.to_vec())
}

fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop `"format": "uri"` from a JSON schema; several compatible backends
/// reject it.
pub fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, v)| !(k.as_str() == "format" && v.as_str() == Some("uri")))
                .map(|(k, v)| (k.clone(), clean_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

/// Split a trailing reasoning-effort suffix off a model id:
/// `o3-mini-high` becomes `("o3-mini", Some(High))`.
pub fn split_effort_suffix(model: &str) -> (String, Option<Effort>) {
    if let Some((base, suffix)) = model.rsplit_once('-') {
        if let Some(effort) = Effort::parse(suffix) {
            if !base.is_empty() {
                return (base.to_string(), Some(effort));
            }
        }
    }
    (model.to_string(), None)
}

// ---------------------------------------------------------------------------
// Responses and errors
// ---------------------------------------------------------------------------

pub fn decode_response(body: &[u8]) -> Result<Response> {
    let map = parse_object(body, &["choices"])?;
    let wire: ChatCompletionResponse =
        serde_json::from_value(Value::Object(map)).map_err(|e| GatewayError::decode_body(&e))?;

    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::decode("choices", "response has no choices"))?;

    let mut warnings = wire.gateway_warnings;
    let mut content = Vec::new();
    let message = choice.message;
    if let Some(text) = message.reasoning_content.filter(|t| !t.is_empty()) {
        content.push(ContentBlock::Thinking {
            text,
            signature: None,
        });
    }
    if let Some(text) = message.content.filter(|t| !t.is_empty()) {
        content.push(ContentBlock::Text { text });
    }
    if let Some(refusal) = message.refusal.filter(|t| !t.is_empty()) {
        content.push(ContentBlock::Text { text: refusal });
    }
    for call in message.tool_calls.unwrap_or_default() {
        content.push(tool_use_block(call));
    }

    let stop_reason = parse_finish_reason(choice.finish_reason.as_deref());
    if choice.finish_reason.as_deref() == Some("content_filter") {
        warnings.push(CONTENT_FILTER_WARNING.to_string());
    }

    let resp = Response {
        id: wire.id,
        model: wire.model,
        stop_reason,
        stop_sequence: None,
        content,
        usage: wire.usage.map(usage_from_wire).unwrap_or_default(),
        warnings,
    };
    resp.validate()?;
    Ok(resp)
}

pub fn encode_response(resp: &Response) -> Bytes {
    let mut warnings = resp.warnings.clone();
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &resp.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::Thinking { text: t, .. } => reasoning.push_str(t),
            ContentBlock::ToolUse {
                id,
                name,
                arguments,
            } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }),
            ContentBlock::Redacted { .. } => {
                if !warnings.iter().any(|w| w == REDACTED_THINKING_WARNING) {
                    warnings.push(REDACTED_THINKING_WARNING.to_string());
                }
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Image { .. } => {}
        }
    }

    let out = ChatCompletionResponse {
        id: completion_id(&resp.id),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                },
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                refusal: None,
            },
            finish_reason: Some(finish_reason_str(resp.stop_reason).to_string()),
        }],
        usage: Some(usage_to_wire(&resp.usage)),
        gateway_warnings: warnings,
    };
    to_json_bytes(&out)
}

pub fn encode_error(err: &GatewayError) -> Bytes {
    let code = match err {
        GatewayError::Upstream { .. } => None,
        other => Some(other.kind().as_str()),
    };
    to_json_bytes(&ChatErrorResponse::new(
        ChatErrorResponse::type_for_status(err.status()),
        code,
        err.client_message(),
    ))
}

pub fn decode_error_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ChatErrorResponse>(body)
        .ok()
        .map(|e| e.error.message)
        .filter(|m| !m.is_empty())
}

/// `content_filter` has no Anthropic counterpart and maps to `Error`.
pub fn parse_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls" | "function_call") => StopReason::ToolUse,
        Some("content_filter") => StopReason::Error,
        _ => StopReason::EndTurn,
    }
}

/// `StopSequence` collapses into `stop`; Chat Completions does not separate them.
pub fn finish_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
        StopReason::Error => "content_filter",
    }
}

fn usage_from_wire(usage: ChatUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        reasoning_tokens: usage
            .completion_tokens_details
            .and_then(|d| d.reasoning_tokens),
    }
}

fn usage_to_wire(usage: &Usage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens.saturating_add(usage.output_tokens),
        completion_tokens_details: usage.reasoning_tokens.map(|r| CompletionTokensDetails {
            reasoning_tokens: Some(r),
        }),
    }
}

fn completion_id(id: &str) -> String {
    if id.starts_with("chatcmpl-") {
        id.to_string()
    } else if id.is_empty() {
        format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
    } else {
        format!("chatcmpl-{}", id.trim_start_matches("msg_"))
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text(usize),
    Thinking(usize),
    /// Block index and the tool-call index it belongs to.
    Tool(usize, usize),
}

impl OpenBlock {
    fn index(self) -> usize {
        match self {
            OpenBlock::Text(i) | OpenBlock::Thinking(i) | OpenBlock::Tool(i, _) => i,
        }
    }
}

/// Decodes `OpenAI` chunks into block-structured schema events.
///
/// A finish reason closes the message but `MessageStop` waits for `[DONE]`
/// (or the end of the byte stream), since the usage chunk follows the finish
/// chunk when `stream_options.include_usage` is set.
#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder {
    started: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    /// Block index and call id per tool-call index.
    tool_blocks: Vec<Option<(usize, String)>>,
    usage: Usage,
    finished: bool,
    stopped: bool,
}

impl OpenAiStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(block) = self.open.take() {
            events.push(StreamEvent::BlockStop {
                index: block.index(),
            });
        }
    }

    fn open_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> usize {
        self.close_open(events);
        let index = self.next_index;
        self.next_index += 1;
        events.push(StreamEvent::BlockStart { index, kind });
        index
    }

    fn text_delta(&mut self, text: String, thinking: bool, events: &mut Vec<StreamEvent>) {
        let index = match self.open {
            Some(OpenBlock::Thinking(i)) if thinking => i,
            Some(OpenBlock::Text(i)) if !thinking => i,
            _ if thinking => {
                let i = self.open_block(BlockKind::Thinking, events);
                self.open = Some(OpenBlock::Thinking(i));
                i
            }
            _ => {
                let i = self.open_block(BlockKind::Text, events);
                self.open = Some(OpenBlock::Text(i));
                i
            }
        };
        events.push(StreamEvent::BlockDelta {
            index,
            delta: Delta::Text(text),
        });
    }

    fn tool_delta(&mut self, call: ChunkToolCall, events: &mut Vec<StreamEvent>) -> Result<()> {
        let (name, arguments) = match call.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        // Some backends reuse a tool-call index for the next call; a new id
        // starts a new block.
        let known = self
            .tool_blocks
            .get(call.index)
            .cloned()
            .flatten()
            .filter(|(_, id)| call.id.as_ref().map_or(true, |new| new == id))
            .map(|(index, _)| index);
        let index = match known {
            Some(index) => {
                if self.open != Some(OpenBlock::Tool(index, call.index)) {
                    return Err(GatewayError::malformed(format!(
                        "arguments for tool call {} arrived after its block {index} was stopped",
                        call.index
                    )));
                }
                index
            }
            None => {
                if call.id.is_none() && name.is_none() {
                    return Err(GatewayError::malformed(format!(
                        "arguments for tool call {} arrived before the call was started",
                        call.index
                    )));
                }
                let id = call
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                let kind = BlockKind::ToolUse {
                    id: id.clone(),
                    name: name.unwrap_or_default(),
                };
                let index = self.open_block(kind, events);
                self.open = Some(OpenBlock::Tool(index, call.index));
                if self.tool_blocks.len() <= call.index {
                    self.tool_blocks.resize(call.index + 1, None);
                }
                self.tool_blocks[call.index] = Some((index, id));
                index
            }
        };
        if let Some(args) = arguments.filter(|a| !a.is_empty()) {
            events.push(StreamEvent::BlockDelta {
                index,
                delta: Delta::ArgumentsJson(args),
            });
        }
        Ok(())
    }

    fn stop(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: String::new(),
                model: String::new(),
            });
        }
        self.stopped = true;
        events.push(StreamEvent::MessageStop {
            usage: self.usage.clone(),
        });
    }
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        if self.stopped {
            return Ok(events);
        }
        if frame.is_done() {
            self.stop(&mut events);
            return Ok(events);
        }

        let value: Value = serde_json::from_str(&frame.data)
            .map_err(|e| GatewayError::decode("stream chunk", e.to_string()))?;
        if value.get("error").is_some_and(Value::is_object) {
            let message = decode_error_message(frame.data.as_bytes())
                .unwrap_or_else(|| "backend reported an error mid-stream".to_string());
            events.push(StreamEvent::error(ErrorKind::UpstreamDisconnected, message));
            return Ok(events);
        }
        let chunk: ChatCompletionChunk = serde_json::from_value(value)
            .map_err(|e| GatewayError::decode("stream chunk", e.to_string()))?;

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
            });
        }
        if let Some(usage) = chunk.usage {
            self.usage = usage_from_wire(usage);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(events);
        };
        if self.finished {
            return Ok(events);
        }

        if let Some(reasoning) = choice.delta.reasoning_content.filter(|s| !s.is_empty()) {
            self.text_delta(reasoning, true, &mut events);
        }
        if let Some(content) = choice.delta.content.filter(|s| !s.is_empty()) {
            self.text_delta(content, false, &mut events);
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            self.tool_delta(call, &mut events)?;
        }

        if let Some(reason) = choice.finish_reason {
            if reason == "content_filter" {
                tracing::warn!(warning = CONTENT_FILTER_WARNING, "Backend filtered the stream");
            }
            self.close_open(&mut events);
            self.finished = true;
            events.push(StreamEvent::MessageDelta {
                stop_reason: parse_finish_reason(Some(&reason)),
                stop_sequence: None,
            });
        }
        Ok(events)
    }

    /// A stream that reported a finish reason but lost its `[DONE]` line is
    /// complete; anything else is left for the caller to report.
    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished && !self.stopped {
            self.stop(&mut events);
        }
        events
    }
}

/// Encodes schema events as `OpenAI` chunks.
#[derive(Debug)]
pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: i64,
    thinking_blocks: Vec<bool>,
    tool_ordinals: Vec<Option<usize>>,
    next_tool: usize,
}

impl Default for OpenAiStreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiStreamEncoder {
    pub fn new() -> Self {
        Self {
            id: completion_id(""),
            model: String::new(),
            created: chrono::Utc::now().timestamp(),
            thinking_blocks: Vec::new(),
            tool_ordinals: Vec::new(),
            next_tool: 0,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> SseFrame {
        self.frame(
            vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            None,
        )
    }

    fn frame(&self, choices: Vec<ChunkChoice>, usage: Option<ChatUsage>) -> SseFrame {
        SseFrame::data(to_json_string(&ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage,
        }))
    }

    fn tool_chunk(&self, call: ChunkToolCall) -> SseFrame {
        self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![call]),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    fn ordinal(&self, index: usize) -> Option<usize> {
        self.tool_ordinals.get(index).copied().flatten()
    }
}

impl StreamEncoder for OpenAiStreamEncoder {
    fn encode(&mut self, event: &StreamEvent) -> Vec<SseFrame> {
        match event {
            StreamEvent::MessageStart { id, model } => {
                self.id = completion_id(id);
                self.model = model.clone();
                vec![self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                        ..ChunkDelta::default()
                    },
                    None,
                )]
            }
            StreamEvent::BlockStart { index, kind } => {
                if self.thinking_blocks.len() <= *index {
                    self.thinking_blocks.resize(*index + 1, false);
                    self.tool_ordinals.resize(*index + 1, None);
                }
                self.thinking_blocks[*index] = matches!(kind, BlockKind::Thinking);
                match kind {
                    BlockKind::ToolUse { id, name } => {
                        let ordinal = self.next_tool;
                        self.next_tool += 1;
                        self.tool_ordinals[*index] = Some(ordinal);
                        vec![self.tool_chunk(ChunkToolCall {
                            index: ordinal,
                            id: Some(id.clone()),
                            call_type: Some("function".to_string()),
                            function: Some(ChunkToolCallFunction {
                                name: Some(name.clone()),
                                arguments: Some(String::new()),
                            }),
                        })]
                    }
                    BlockKind::Redacted { .. } => {
                        tracing::warn!(
                            warning = REDACTED_THINKING_WARNING,
                            index = *index,
                            "Dropping redacted thinking block"
                        );
                        Vec::new()
                    }
                    BlockKind::Text | BlockKind::Thinking => Vec::new(),
                }
            }
            StreamEvent::BlockDelta { index, delta } => match delta {
                Delta::Text(text) => {
                    let delta = if self.thinking_blocks.get(*index).copied().unwrap_or(false) {
                        ChunkDelta {
                            reasoning_content: Some(text.clone()),
                            ..ChunkDelta::default()
                        }
                    } else {
                        ChunkDelta {
                            content: Some(text.clone()),
                            ..ChunkDelta::default()
                        }
                    };
                    vec![self.chunk(delta, None)]
                }
                Delta::ArgumentsJson(json) => match self.ordinal(*index) {
                    Some(ordinal) => vec![self.tool_chunk(ChunkToolCall {
                        index: ordinal,
                        id: None,
                        call_type: None,
                        function: Some(ChunkToolCallFunction {
                            name: None,
                            arguments: Some(json.clone()),
                        }),
                    })],
                    None => Vec::new(),
                },
                Delta::Signature(_) => Vec::new(),
            },
            StreamEvent::BlockStop { .. } => Vec::new(),
            StreamEvent::MessageDelta { stop_reason, .. } => vec![self.chunk(
                ChunkDelta::default(),
                Some(finish_reason_str(*stop_reason).to_string()),
            )],
            StreamEvent::MessageStop { usage } => vec![
                self.frame(Vec::new(), Some(usage_to_wire(usage))),
                SseFrame::data("[DONE]"),
            ],
            StreamEvent::ErrorEvent { kind, message } => {
                let error = ChatErrorResponse::new(
                    ChatErrorResponse::type_for_status(kind.status()),
                    Some(kind.as_str()),
                    message.clone(),
                );
                vec![SseFrame::data(to_json_string(&error))]
            }
        }
    }
}
