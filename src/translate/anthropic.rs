//! Anthropic Messages codec.

use super::anthropic_types::{self as wire, ErrorResponse};
use super::{
    arguments_value, parse_object, to_json_bytes, to_json_string, SseFrame, StreamDecoder,
    StreamEncoder,
};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::schema::{
    BlockKind, ContentBlock, Delta, ImageSource, Message, Reasoning, Request, Response,
    Role, StopReason, StreamEvent, ToolChoice, ToolSpec, Usage,
};
use bytes::Bytes;

/// Smallest thinking budget the Messages API accepts.
const MIN_THINKING_BUDGET: u64 = 1024;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn decode_request(body: &[u8]) -> Result<Request> {
    let map = parse_object(body, &["model", "messages", "max_tokens"])?;
    let wire: wire::MessagesRequest = serde_json::from_value(serde_json::Value::Object(map))
        .map_err(|e| GatewayError::decode_body(&e))?;

    if wire.max_tokens < 0 {
        return Err(GatewayError::malformed("max_tokens must not be negative"));
    }
    check_unit_range("temperature", wire.temperature)?;
    check_unit_range("top_p", wire.top_p)?;

    let messages = wire
        .messages
        .into_iter()
        .map(|m| Message {
            role: match m.role {
                wire::Role::User => Role::User,
                wire::Role::Assistant => Role::Assistant,
            },
            content: m
                .content
                .into_blocks()
                .into_iter()
                .filter_map(decode_block)
                .collect(),
        })
        .collect();

    let reasoning = wire
        .thinking
        .filter(|t| t.kind == "enabled")
        .map(|t| Reasoning::Budget(t.budget_tokens.unwrap_or(MIN_THINKING_BUDGET)));

    let req = Request {
        model: wire.model,
        messages,
        max_tokens: wire.max_tokens.unsigned_abs(),
        temperature: wire.temperature,
        top_p: wire.top_p,
        top_k: wire.top_k,
        tools: wire
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect(),
        tool_choice: wire.tool_choice.map(|c| match c {
            wire::ToolChoice::Auto => ToolChoice::Auto,
            wire::ToolChoice::Any => ToolChoice::Any,
            wire::ToolChoice::None => ToolChoice::None,
            wire::ToolChoice::Tool { name } => ToolChoice::Tool(name),
        }),
        stream: wire.stream.unwrap_or(false),
        system: wire.system.map(|s| s.as_text()),
        stop_sequences: wire.stop_sequences.unwrap_or_default(),
        reasoning,
        user: wire.metadata.and_then(|m| m.user_id),
    };
    req.validate()?;
    Ok(req)
}

fn check_unit_range(field: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) => Err(GatewayError::malformed(format!(
            "{field} must be between 0 and 1, got {v}"
        ))),
        _ => Ok(()),
    }
}

/// Mid-conversation system messages are folded into the top-level prompt,
/// which is the only place Anthropic accepts system text.
pub fn encode_request(req: &Request) -> Bytes {
    let mut system_parts: Vec<String> = req.system.iter().cloned().collect();
    let mut messages = Vec::with_capacity(req.messages.len());

    for msg in &req.messages {
        let role = match msg.role {
            Role::System => {
                system_parts.push(collect_text(&msg.content));
                continue;
            }
            Role::User => wire::Role::User,
            Role::Assistant => wire::Role::Assistant,
        };
        let content = match msg.content.as_slice() {
            [ContentBlock::Text { text }] => wire::MessageContent::Text(text.clone()),
            blocks => wire::MessageContent::Blocks(blocks.iter().map(encode_block).collect()),
        };
        messages.push(wire::Message { role, content });
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(wire::SystemContent::Text(system_parts.join("\n\n")))
    };

    let thinking = req.reasoning.and_then(|r| thinking_config(r, req.max_tokens));

    let out = wire::MessagesRequest {
        model: req.model.clone(),
        max_tokens: i64::try_from(req.max_tokens).unwrap_or(i64::MAX),
        messages,
        system,
        stream: req.stream.then_some(true),
        temperature: req.temperature.map(|t| t.min(1.0)),
        top_p: req.top_p,
        top_k: req.top_k,
        tools: if req.tools.is_empty() {
            None
        } else {
            Some(
                req.tools
                    .iter()
                    .map(|t| wire::Tool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.input_schema.clone(),
                    })
                    .collect(),
            )
        },
        tool_choice: req.tool_choice.as_ref().map(|c| match c {
            ToolChoice::Auto => wire::ToolChoice::Auto,
            ToolChoice::Any => wire::ToolChoice::Any,
            ToolChoice::None => wire::ToolChoice::None,
            ToolChoice::Tool(name) => wire::ToolChoice::Tool { name: name.clone() },
        }),
        metadata: req.user.as_ref().map(|u| wire::Metadata {
            user_id: Some(u.clone()),
        }),
        stop_sequences: if req.stop_sequences.is_empty() {
            None
        } else {
            Some(req.stop_sequences.clone())
        },
        thinking,
    };
    to_json_bytes(&out)
}

/// An effort level becomes a budget that fits under `max_tokens`; when no
/// legal budget fits, extended thinking is left off.
fn thinking_config(reasoning: Reasoning, max_tokens: u64) -> Option<wire::ThinkingConfig> {
    let budget = match reasoning {
        Reasoning::Budget(b) => b,
        Reasoning::Effort(_) => {
            let budget = reasoning.budget_tokens().min(max_tokens.saturating_sub(1));
            if budget < MIN_THINKING_BUDGET {
                return None;
            }
            budget
        }
    };
    Some(wire::ThinkingConfig {
        kind: "enabled".to_string(),
        budget_tokens: Some(budget),
    })
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

fn decode_block(block: wire::ContentBlock) -> Option<ContentBlock> {
    let block = match block {
        wire::ContentBlock::Text { text } => ContentBlock::Text { text },
        wire::ContentBlock::Image { source } => ContentBlock::Image {
            source: match source {
                wire::ImageSource::Base64 { media_type, data } => {
                    ImageSource::Base64 { media_type, data }
                }
                wire::ImageSource::Url { url } => ImageSource::Url(url),
            },
        },
        wire::ContentBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
            id,
            name,
            arguments: to_json_string(&input),
        },
        wire::ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_use_id,
            content: match content {
                Some(wire::ToolResultContent::Text(t)) => t,
                Some(wire::ToolResultContent::Blocks(blocks)) => blocks
                    .into_iter()
                    .filter_map(|b| match b {
                        wire::ContentBlock::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => String::new(),
            },
            is_error: is_error.unwrap_or(false),
        },
        wire::ContentBlock::Thinking {
            thinking,
            signature,
        } => ContentBlock::Thinking {
            text: thinking,
            signature,
        },
        wire::ContentBlock::RedactedThinking { data } => ContentBlock::Redacted { data },
        wire::ContentBlock::Unsupported => return None,
    };
    Some(block)
}

fn encode_block(block: &ContentBlock) -> wire::ContentBlock {
    match block {
        ContentBlock::Text { text } => wire::ContentBlock::Text { text: text.clone() },
        ContentBlock::ToolUse {
            id,
            name,
            arguments,
        } => wire::ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: arguments_value(arguments),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => wire::ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: Some(wire::ToolResultContent::Text(content.clone())),
            is_error: is_error.then_some(true),
        },
        ContentBlock::Thinking { text, signature } => wire::ContentBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        },
        ContentBlock::Redacted { data } => wire::ContentBlock::RedactedThinking { data: data.clone() },
        ContentBlock::Image { source } => wire::ContentBlock::Image {
            source: match source {
                ImageSource::Base64 { media_type, data } => wire::ImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                ImageSource::Url(url) => wire::ImageSource::Url { url: url.clone() },
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Responses and errors
// ---------------------------------------------------------------------------

pub fn decode_response(body: &[u8]) -> Result<Response> {
    let map = parse_object(body, &["id", "content"])?;
    let wire: wire::MessagesResponse = serde_json::from_value(serde_json::Value::Object(map))
        .map_err(|e| GatewayError::decode_body(&e))?;

    let resp = Response {
        id: wire.id,
        model: wire.model,
        stop_reason: parse_stop_reason(wire.stop_reason.as_deref()),
        stop_sequence: wire.stop_sequence,
        content: wire.content.into_iter().filter_map(decode_block).collect(),
        usage: Usage {
            input_tokens: wire.usage.input_tokens,
            output_tokens: wire.usage.output_tokens,
            reasoning_tokens: None,
        },
        warnings: wire.gateway_warnings,
    };
    resp.validate()?;
    Ok(resp)
}

pub fn encode_response(resp: &Response) -> Bytes {
    let out = wire::MessagesResponse {
        id: message_id(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content: resp.content.iter().map(encode_block).collect(),
        model: resp.model.clone(),
        stop_reason: Some(stop_reason_str(resp.stop_reason).to_string()),
        stop_sequence: resp.stop_sequence.clone(),
        usage: wire::Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
        gateway_warnings: resp.warnings.clone(),
    };
    to_json_bytes(&out)
}

pub fn encode_error(err: &GatewayError) -> Bytes {
    to_json_bytes(&ErrorResponse::new(
        ErrorResponse::type_for_status(err.status()),
        err.client_message(),
    ))
}

pub fn decode_error_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorResponse>(body)
        .ok()
        .map(|e| e.error.message)
        .filter(|m| !m.is_empty())
}

pub fn parse_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("max_tokens" | "model_context_window_exceeded") => StopReason::MaxTokens,
        Some("tool_use") => StopReason::ToolUse,
        Some("stop_sequence") => StopReason::StopSequence,
        Some("refusal") => StopReason::Error,
        _ => StopReason::EndTurn,
    }
}

pub fn stop_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::ToolUse => "tool_use",
        StopReason::StopSequence => "stop_sequence",
        StopReason::Error => "refusal",
    }
}

fn message_id(id: &str) -> String {
    if id.starts_with("msg_") {
        id.to_string()
    } else if id.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else {
        format!("msg_{}", id.trim_start_matches("chatcmpl-"))
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Decodes Anthropic SSE frames. Usage arrives in two halves (input tokens on
/// `message_start`, output tokens on `message_delta`) and is reported whole
/// on `MessageStop`.
///
/// Blocks of a type with no mapping (server tools, documents) are skipped
/// along with their deltas, and later blocks are renumbered to stay dense.
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder {
    usage: Usage,
    skipped: Vec<usize>,
}

impl AnthropicStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema index of upstream block `index`, or `None` if it was skipped.
    fn local_index(&self, index: usize) -> Option<usize> {
        if self.skipped.contains(&index) {
            return None;
        }
        Some(index - self.skipped.iter().filter(|&&s| s < index).count())
    }
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        let event: wire::StreamEvent = serde_json::from_str(&frame.data)
            .map_err(|e| GatewayError::decode("stream event", e.to_string()))?;

        let events = match event {
            wire::StreamEvent::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                self.usage.output_tokens = message.usage.output_tokens;
                vec![StreamEvent::MessageStart {
                    id: message.id,
                    model: message.model,
                }]
            }
            wire::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let Some(local) = self.local_index(index) else {
                    return Ok(Vec::new());
                };
                match block_start_events(local, content_block) {
                    Some(events) => events,
                    None => {
                        tracing::warn!(index, "Skipping content block of an unsupported type");
                        self.skipped.push(index);
                        Vec::new()
                    }
                }
            }
            wire::StreamEvent::ContentBlockDelta { index, delta } => {
                let Some(index) = self.local_index(index) else {
                    return Ok(Vec::new());
                };
                let delta = match delta {
                    wire::Delta::TextDelta { text } => Delta::Text(text),
                    wire::Delta::ThinkingDelta { thinking } => Delta::Text(thinking),
                    wire::Delta::InputJsonDelta { partial_json } => Delta::ArgumentsJson(partial_json),
                    wire::Delta::SignatureDelta { signature } => Delta::Signature(signature),
                    wire::Delta::Other => return Ok(Vec::new()),
                };
                vec![StreamEvent::BlockDelta { index, delta }]
            }
            wire::StreamEvent::ContentBlockStop { index } => match self.local_index(index) {
                Some(index) => vec![StreamEvent::BlockStop { index }],
                None => Vec::new(),
            },
            wire::StreamEvent::MessageDelta { delta, usage } => {
                self.usage.output_tokens = usage.output_tokens;
                if let Some(input) = usage.input_tokens {
                    self.usage.input_tokens = input;
                }
                vec![StreamEvent::MessageDelta {
                    stop_reason: parse_stop_reason(delta.stop_reason.as_deref()),
                    stop_sequence: delta.stop_sequence,
                }]
            }
            wire::StreamEvent::MessageStop => vec![StreamEvent::MessageStop {
                usage: self.usage.clone(),
            }],
            wire::StreamEvent::Error { error } => vec![StreamEvent::error(
                ErrorKind::UpstreamDisconnected,
                error.message,
            )],
            wire::StreamEvent::Ping | wire::StreamEvent::Unknown => Vec::new(),
        };
        Ok(events)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

/// `None` for block types that have no schema counterpart.
fn block_start_events(index: usize, block: wire::ContentBlock) -> Option<Vec<StreamEvent>> {
    let mut initial = Vec::new();
    let kind = match block {
        wire::ContentBlock::Text { text } => {
            if !text.is_empty() {
                initial.push(Delta::Text(text));
            }
            BlockKind::Text
        }
        wire::ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            if !thinking.is_empty() {
                initial.push(Delta::Text(thinking));
            }
            if let Some(sig) = signature.filter(|s| !s.is_empty()) {
                initial.push(Delta::Signature(sig));
            }
            BlockKind::Thinking
        }
        wire::ContentBlock::ToolUse { id, name, input } => {
            if input.as_object().is_some_and(|o| !o.is_empty()) {
                initial.push(Delta::ArgumentsJson(to_json_string(&input)));
            }
            BlockKind::ToolUse { id, name }
        }
        wire::ContentBlock::RedactedThinking { data } => BlockKind::Redacted { data },
        wire::ContentBlock::Image { .. }
        | wire::ContentBlock::ToolResult { .. }
        | wire::ContentBlock::Unsupported => return None,
    };

    let mut events = vec![StreamEvent::BlockStart { index, kind }];
    events.extend(
        initial
            .into_iter()
            .map(|delta| StreamEvent::BlockDelta { index, delta }),
    );
    Some(events)
}

/// Encodes schema events as Anthropic SSE frames.
///
/// `message_delta` is held back until `MessageStop` so it can carry the final
/// usage, which `OpenAI` sources only report after the finish reason.
#[derive(Debug, Default)]
pub struct AnthropicStreamEncoder {
    kinds: Vec<BlockKind>,
    pending_stop: Option<(StopReason, Option<String>)>,
}

impl AnthropicStreamEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame(event: &wire::StreamEvent) -> SseFrame {
        SseFrame::new(event.event_name(), to_json_string(event))
    }

    fn is_thinking(&self, index: usize) -> bool {
        matches!(self.kinds.get(index), Some(BlockKind::Thinking))
    }
}

impl StreamEncoder for AnthropicStreamEncoder {
    fn encode(&mut self, event: &StreamEvent) -> Vec<SseFrame> {
        match event {
            StreamEvent::MessageStart { id, model } => {
                let start = wire::StreamEvent::MessageStart {
                    message: wire::MessagesResponse {
                        id: message_id(id),
                        response_type: "message".to_string(),
                        role: "assistant".to_string(),
                        content: Vec::new(),
                        model: model.clone(),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: wire::Usage::default(),
                        gateway_warnings: Vec::new(),
                    },
                };
                vec![Self::frame(&start), Self::frame(&wire::StreamEvent::Ping)]
            }
            StreamEvent::BlockStart { index, kind } => {
                if self.kinds.len() <= *index {
                    self.kinds.resize(*index + 1, BlockKind::Text);
                }
                self.kinds[*index] = kind.clone();
                let content_block = match kind {
                    BlockKind::Text => wire::ContentBlock::Text {
                        text: String::new(),
                    },
                    BlockKind::Thinking => wire::ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                    BlockKind::ToolUse { id, name } => wire::ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                    BlockKind::Redacted { data } => {
                        wire::ContentBlock::RedactedThinking { data: data.clone() }
                    }
                };
                vec![Self::frame(&wire::StreamEvent::ContentBlockStart {
                    index: *index,
                    content_block,
                })]
            }
            StreamEvent::BlockDelta { index, delta } => {
                let delta = match delta {
                    Delta::Text(text) if self.is_thinking(*index) => wire::Delta::ThinkingDelta {
                        thinking: text.clone(),
                    },
                    Delta::Text(text) => wire::Delta::TextDelta { text: text.clone() },
                    Delta::ArgumentsJson(json) => wire::Delta::InputJsonDelta {
                        partial_json: json.clone(),
                    },
                    Delta::Signature(signature) => wire::Delta::SignatureDelta {
                        signature: signature.clone(),
                    },
                };
                vec![Self::frame(&wire::StreamEvent::ContentBlockDelta {
                    index: *index,
                    delta,
                })]
            }
            StreamEvent::BlockStop { index } => {
                vec![Self::frame(&wire::StreamEvent::ContentBlockStop { index: *index })]
            }
            StreamEvent::MessageDelta {
                stop_reason,
                stop_sequence,
            } => {
                self.pending_stop = Some((*stop_reason, stop_sequence.clone()));
                Vec::new()
            }
            StreamEvent::MessageStop { usage } => {
                let (stop_reason, stop_sequence) = self
                    .pending_stop
                    .take()
                    .unwrap_or((StopReason::EndTurn, None));
                let delta = wire::StreamEvent::MessageDelta {
                    delta: wire::MessageDeltaBody {
                        stop_reason: Some(stop_reason_str(stop_reason).to_string()),
                        stop_sequence,
                    },
                    usage: wire::DeltaUsage {
                        output_tokens: usage.output_tokens,
                        input_tokens: Some(usage.input_tokens),
                    },
                };
                vec![
                    Self::frame(&delta),
                    Self::frame(&wire::StreamEvent::MessageStop),
                ]
            }
            StreamEvent::ErrorEvent { kind, message } => {
                let error = ErrorResponse::new(ErrorResponse::type_for_status(kind.status()), message);
                vec![Self::frame(&wire::StreamEvent::Error { error: error.error })]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Effort;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> Result<Request> {
        decode_request(value.to_string().as_bytes())
    }

    #[test]
    fn test_decode_simple_request() {
        let req = decode(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "Hi"}],
            "some_future_field": {"x": 1}
        }))
        .unwrap();
        assert_eq!(req.model, "claude-3-5-sonnet");
        assert_eq!(req.max_tokens, 100);
        assert_eq!(req.messages, vec![Message::text(Role::User, "Hi")]);
        assert!(!req.stream);
    }

    #[test]
    fn test_missing_model_is_decode_error() {
        let err = decode(json!({"max_tokens": 10, "messages": []})).unwrap_err();
        assert!(matches!(err, GatewayError::Decode { ref field, .. } if field == "model"));
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        let err = decode_request(b"{\"model\": ").unwrap_err();
        assert!(matches!(err, GatewayError::Decode { .. }));
    }

    #[test]
    fn test_negative_max_tokens_is_malformed() {
        let err = decode(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": -5,
            "messages": []
        }))
        .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedPayload { .. }));
    }

    #[test]
    fn test_temperature_out_of_range_is_malformed() {
        let err = decode(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 5,
            "temperature": 1.5,
            "messages": []
        }))
        .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedPayload { .. }));
    }

    #[test]
    fn test_decode_tool_conversation() {
        let req = decode(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "Be brief."}],
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "tool", "name": "get_weather"},
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [
                {"role": "user", "content": "Weather in Paris?"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "Need the tool.", "signature": "sig"},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "18C"}], "is_error": false}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(req.system.as_deref(), Some("Be brief."));
        assert_eq!(req.tool_choice, Some(ToolChoice::Tool("get_weather".into())));
        assert_eq!(req.reasoning, Some(Reasoning::Budget(2048)));
        assert_eq!(
            req.messages[1].content[1],
            ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "get_weather".into(),
                arguments: r#"{"city":"Paris"}"#.into(),
            }
        );
        assert_eq!(
            req.messages[2].content[0],
            ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: "18C".into(),
                is_error: false,
            }
        );
    }

    #[test]
    fn test_request_round_trip() {
        let mut req = Request::new(
            "claude-3-5-sonnet",
            512,
            vec![
                Message::text(Role::User, "Look at this"),
                Message::new(
                    Role::Assistant,
                    vec![
                        ContentBlock::Thinking {
                            text: "hmm".into(),
                            signature: Some("sig".into()),
                        },
                        ContentBlock::Redacted {
                            data: "opaque".into(),
                        },
                        ContentBlock::ToolUse {
                            id: "toolu_9".into(),
                            name: "lookup".into(),
                            arguments: r#"{"q":"rust","n":3}"#.into(),
                        },
                    ],
                ),
                Message::new(
                    Role::User,
                    vec![
                        ContentBlock::ToolResult {
                            tool_use_id: "toolu_9".into(),
                            content: "no results".into(),
                            is_error: true,
                        },
                        ContentBlock::Image {
                            source: ImageSource::Base64 {
                                media_type: "image/png".into(),
                                data: "iVBORw0".into(),
                            },
                        },
                    ],
                ),
            ],
        );
        req.system = Some("You are terse.".into());
        req.temperature = Some(0.5);
        req.top_k = Some(40);
        req.stream = true;
        req.stop_sequences = vec!["END".into()];
        req.reasoning = Some(Reasoning::Budget(4000));
        req.user = Some("user-1".into());
        req.tools = vec![ToolSpec {
            name: "lookup".into(),
            description: Some("Search".into()),
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        }];
        req.tool_choice = Some(ToolChoice::Any);

        let decoded = decode_request(&encode_request(&req)).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_system_messages_fold_into_prompt() {
        let mut req = Request::new(
            "claude-3-5-sonnet",
            10,
            vec![
                Message::text(Role::User, "a"),
                Message::text(Role::System, "Answer in French."),
            ],
        );
        req.system = Some("Be kind.".into());
        let body: serde_json::Value = serde_json::from_slice(&encode_request(&req)).unwrap();
        assert_eq!(body["system"], "Be kind.\n\nAnswer in French.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_effort_becomes_budget_under_max_tokens() {
        let mut req = Request::new("claude-3-7-sonnet", 4000, vec![Message::text(Role::User, "x")]);
        req.reasoning = Some(Reasoning::Effort(Effort::High));
        let body: serde_json::Value = serde_json::from_slice(&encode_request(&req)).unwrap();
        assert_eq!(body["thinking"]["budget_tokens"], 3999);

        req.max_tokens = 500;
        let body: serde_json::Value = serde_json::from_slice(&encode_request(&req)).unwrap();
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn test_decode_response() {
        let resp = decode_response(
            json!({
                "id": "msg_01",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet",
                "content": [
                    {"type": "text", "text": "Calling"},
                    {"type": "tool_use", "id": "toolu_1", "name": "f", "input": {"a": 1}}
                ],
                "stop_reason": "tool_use",
                "stop_sequence": null,
                "usage": {"input_tokens": 12, "output_tokens": 7}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.usage.input_tokens, 12);
        assert_eq!(resp.content.len(), 2);
    }

    #[test]
    fn test_encode_response_carries_warnings() {
        let resp = Response {
            id: "chatcmpl-xyz".into(),
            model: "claude-3-5-sonnet".into(),
            stop_reason: StopReason::Error,
            stop_sequence: None,
            content: vec![ContentBlock::Text { text: "".into() }],
            usage: Usage::default(),
            warnings: vec!["content_filter: blocked".into()],
        };
        let body: serde_json::Value = serde_json::from_slice(&encode_response(&resp)).unwrap();
        assert_eq!(body["id"], "msg_xyz");
        assert_eq!(body["stop_reason"], "refusal");
        assert_eq!(body["gateway_warnings"][0], "content_filter: blocked");
    }

    #[test]
    fn test_error_envelope() {
        let body: serde_json::Value =
            serde_json::from_slice(&encode_error(&GatewayError::upstream(529, "Overloaded"))).unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "overloaded_error");
        assert_eq!(body["error"]["message"], "Overloaded");
    }

    #[test]
    fn test_stream_decoder_collects_usage() {
        let mut decoder = AnthropicStreamDecoder::new();
        let frames = [
            SseFrame::new("message_start", json!({"type": "message_start", "message": {"id": "msg_1", "type": "message", "role": "assistant", "model": "claude-3-5-sonnet", "content": [], "stop_reason": null, "usage": {"input_tokens": 25, "output_tokens": 1}}}).to_string()),
            SseFrame::new("ping", r#"{"type": "ping"}"#),
            SseFrame::new("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}).to_string()),
            SseFrame::new("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hello"}}).to_string()),
            SseFrame::new("content_block_stop", json!({"type": "content_block_stop", "index": 0}).to_string()),
            SseFrame::new("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null}, "usage": {"output_tokens": 15}}).to_string()),
            SseFrame::new("message_stop", json!({"type": "message_stop"}).to_string()),
        ];
        let events: Vec<StreamEvent> = frames
            .iter()
            .flat_map(|f| decoder.decode(f).unwrap())
            .collect();

        assert_eq!(events.len(), 6);
        assert_eq!(
            events[2],
            StreamEvent::BlockDelta {
                index: 0,
                delta: Delta::Text("Hello".into())
            }
        );
        assert_eq!(
            events[5],
            StreamEvent::MessageStop {
                usage: Usage {
                    input_tokens: 25,
                    output_tokens: 15,
                    reasoning_tokens: None
                }
            }
        );
    }

    #[test]
    fn test_stream_decoder_error_frame() {
        let mut decoder = AnthropicStreamDecoder::new();
        let events = decoder
            .decode(&SseFrame::new(
                "error",
                r#"{"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}"#,
            ))
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::error(ErrorKind::UpstreamDisconnected, "Overloaded")]
        );
    }

    #[test]
    fn test_stream_decoder_skips_unsupported_block() {
        let mut decoder = AnthropicStreamDecoder::new();
        let mut events = Vec::new();
        for data in [
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "server_tool_use", "id": "srvtoolu_1", "name": "web_search", "input": {}}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"query\":\"rust\"}"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "text_delta", "text": "Found it"}}),
            json!({"type": "content_block_stop", "index": 1}),
        ] {
            let name = data["type"].as_str().unwrap().to_string();
            events.extend(decoder.decode(&SseFrame::new(name, data.to_string())).unwrap());
        }

        assert_eq!(
            events,
            vec![
                StreamEvent::BlockStart {
                    index: 0,
                    kind: BlockKind::Text
                },
                StreamEvent::BlockDelta {
                    index: 0,
                    delta: Delta::Text("Found it".into())
                },
                StreamEvent::BlockStop { index: 0 },
            ]
        );
    }

    #[test]
    fn test_stream_encoder_defers_message_delta() {
        let mut encoder = AnthropicStreamEncoder::new();
        let start = encoder.encode(&StreamEvent::MessageStart {
            id: "chatcmpl-1".into(),
            model: "claude-3-5-sonnet".into(),
        });
        assert_eq!(start.len(), 2);
        assert_eq!(start[1].event.as_deref(), Some("ping"));

        encoder.encode(&StreamEvent::BlockStart {
            index: 0,
            kind: BlockKind::Thinking,
        });
        let thinking = encoder.encode(&StreamEvent::BlockDelta {
            index: 0,
            delta: Delta::Text("pondering".into()),
        });
        assert!(thinking[0].data.contains("thinking_delta"));

        let held = encoder.encode(&StreamEvent::MessageDelta {
            stop_reason: StopReason::MaxTokens,
            stop_sequence: None,
        });
        assert!(held.is_empty());

        let end = encoder.encode(&StreamEvent::MessageStop {
            usage: Usage {
                input_tokens: 3,
                output_tokens: 9,
                reasoning_tokens: None,
            },
        });
        assert_eq!(end.len(), 2);
        let delta: serde_json::Value = serde_json::from_str(&end[0].data).unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "max_tokens");
        assert_eq!(delta["usage"]["output_tokens"], 9);
        assert_eq!(end[1].event.as_deref(), Some("message_stop"));
    }
}
