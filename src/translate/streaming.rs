//! Live re-framing of an upstream SSE stream into the client's dialect.
//!
//! The [`Reframer`] sits between a source-dialect [`StreamDecoder`] and a
//! destination-dialect [`StreamEncoder`]. It enforces the block lifecycle on
//! the decoded events, buffers tool-call arguments until their block stops,
//! and guarantees the client stream ends with exactly one terminal event:
//! either a clean `MessageStop` or an `ErrorEvent`.

use super::{stream_decoder, stream_encoder, Dialect, SseFrame, StreamDecoder, StreamEncoder};
use crate::error::{ErrorKind, GatewayError};
use crate::schema::{BlockKind, BlockTable, Delta, StopReason, StreamEvent};
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use std::fmt::Display;

pub struct Reframer {
    decoder: Box<dyn StreamDecoder>,
    encoder: Box<dyn StreamEncoder>,
    blocks: BlockTable,
    /// Pending tool-call arguments, indexed by block.
    arguments: Vec<Option<String>>,
    started: bool,
    saw_message_delta: bool,
    terminated: bool,
    reported_model: Option<String>,
}

impl Reframer {
    /// `reported_model` replaces the backend's model id in `MessageStart`,
    /// so clients see the model they asked for.
    pub fn new(source: Dialect, target: Dialect, reported_model: Option<String>) -> Self {
        Self::with_codecs(stream_decoder(source), stream_encoder(target), reported_model)
    }

    pub fn with_codecs(
        decoder: Box<dyn StreamDecoder>,
        encoder: Box<dyn StreamEncoder>,
        reported_model: Option<String>,
    ) -> Self {
        Self {
            decoder,
            encoder,
            blocks: BlockTable::new(),
            arguments: Vec::new(),
            started: false,
            saw_message_delta: false,
            terminated: false,
            reported_model,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Re-frame one upstream frame. Output is ready to write to the client.
    pub fn push_frame(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
        if self.terminated {
            return Vec::new();
        }
        let events = match self.decoder.decode(frame) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable upstream stream frame");
                vec![StreamEvent::error(e.kind(), e.to_string())]
            }
        };
        self.emit(events)
    }

    /// The upstream byte stream ended.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.terminated {
            return Vec::new();
        }
        let events = self.decoder.finish();
        let mut frames = self.emit(events);
        if !self.terminated {
            tracing::warn!("Upstream stream ended before message_stop");
            frames.extend(self.emit(vec![StreamEvent::error(
                ErrorKind::UpstreamDisconnected,
                "upstream stream ended before the message was complete",
            )]));
        }
        frames
    }

    /// The upstream transport failed mid-stream.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<SseFrame> {
        if self.terminated {
            return Vec::new();
        }
        self.emit(vec![StreamEvent::error(
            ErrorKind::UpstreamDisconnected,
            message,
        )])
    }

    fn emit(&mut self, events: Vec<StreamEvent>) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for event in events {
            for out in self.process_event(event) {
                frames.extend(self.encoder.encode(&out));
            }
            if self.terminated {
                break;
            }
        }
        frames
    }

    /// Validate one decoded event against the block lifecycle and return the
    /// events to encode, in order.
    pub fn process_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.terminated {
            return out;
        }
        if !self.started
            && !matches!(
                event,
                StreamEvent::MessageStart { .. } | StreamEvent::ErrorEvent { .. }
            )
        {
            self.started = true;
            out.push(StreamEvent::MessageStart {
                id: String::new(),
                model: self.reported_model.clone().unwrap_or_default(),
            });
        }

        match event {
            StreamEvent::MessageStart { id, model } => {
                if !self.started {
                    self.started = true;
                    out.push(StreamEvent::MessageStart {
                        id,
                        model: self.reported_model.clone().unwrap_or(model),
                    });
                }
            }
            StreamEvent::BlockStart { index, kind } => {
                if let Err(e) = self.blocks.open(index, kind.clone()) {
                    self.terminate(&mut out, &e);
                    return out;
                }
                if matches!(kind, BlockKind::ToolUse { .. }) {
                    if self.arguments.len() <= index {
                        self.arguments.resize(index + 1, None);
                    }
                    self.arguments[index] = Some(String::new());
                }
                out.push(StreamEvent::BlockStart { index, kind });
            }
            StreamEvent::BlockDelta { index, delta } => {
                if let Err(e) = self.blocks.check_delta(index, &delta) {
                    self.terminate(&mut out, &e);
                    return out;
                }
                match delta {
                    Delta::ArgumentsJson(fragment) => {
                        if let Some(Some(buffer)) = self.arguments.get_mut(index) {
                            buffer.push_str(&fragment);
                        }
                    }
                    other => out.push(StreamEvent::BlockDelta {
                        index,
                        delta: other,
                    }),
                }
            }
            StreamEvent::BlockStop { index } => self.stop_block(index, &mut out),
            StreamEvent::MessageDelta {
                stop_reason,
                stop_sequence,
            } => {
                if self.saw_message_delta {
                    return out;
                }
                self.close_open_blocks(&mut out);
                if self.terminated {
                    return out;
                }
                self.saw_message_delta = true;
                out.push(StreamEvent::MessageDelta {
                    stop_reason,
                    stop_sequence,
                });
            }
            StreamEvent::MessageStop { usage } => {
                self.close_open_blocks(&mut out);
                if self.terminated {
                    return out;
                }
                if !self.saw_message_delta {
                    self.saw_message_delta = true;
                    out.push(StreamEvent::MessageDelta {
                        stop_reason: StopReason::EndTurn,
                        stop_sequence: None,
                    });
                }
                self.terminated = true;
                out.push(StreamEvent::MessageStop { usage });
            }
            StreamEvent::ErrorEvent { kind, message } => {
                self.terminated = true;
                out.push(StreamEvent::ErrorEvent { kind, message });
            }
        }
        out
    }

    /// Close `index`, flushing buffered tool arguments as a single delta.
    fn stop_block(&mut self, index: usize, out: &mut Vec<StreamEvent>) {
        if let Err(e) = self.blocks.close(index) {
            self.terminate(out, &e);
            return;
        }
        if let Some(buffer) = self.arguments.get_mut(index).and_then(Option::take) {
            let arguments = if buffer.trim().is_empty() {
                "{}".to_string()
            } else {
                buffer
            };
            if serde_json::from_str::<serde_json::Value>(&arguments).is_err() {
                let e = GatewayError::malformed(format!(
                    "tool_use block {index} arguments are not valid JSON"
                ));
                self.terminate(out, &e);
                return;
            }
            out.push(StreamEvent::BlockDelta {
                index,
                delta: Delta::ArgumentsJson(arguments),
            });
        }
        out.push(StreamEvent::BlockStop { index });
    }

    /// Text and thinking blocks may be left open by a backend that only
    /// signals the end of the message; a tool call may not.
    fn close_open_blocks(&mut self, out: &mut Vec<StreamEvent>) {
        for index in self.blocks.open_indices() {
            if matches!(self.blocks.kind(index), Some(BlockKind::ToolUse { .. })) {
                let e = GatewayError::UnexpectedStreamTermination { index };
                self.terminate(out, &e);
                return;
            }
            self.stop_block(index, out);
            if self.terminated {
                return;
            }
        }
    }

    fn terminate(&mut self, out: &mut Vec<StreamEvent>, err: &GatewayError) {
        tracing::warn!(error = %err, "Terminating client stream");
        self.terminated = true;
        out.push(StreamEvent::error(err.kind(), err.to_string()));
    }
}

/// Re-frame an upstream SSE byte stream, yielding client frames as soon as
/// each upstream frame has been decoded.
pub fn reframe_stream<S, E>(
    byte_stream: S,
    mut reframer: Reframer,
) -> impl Stream<Item = SseFrame> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let frames = byte_stream.eventsource();
        tokio::pin!(frames);

        while let Some(item) = frames.next().await {
            match item {
                Ok(event) => {
                    let frame = SseFrame::from(event);
                    for out in reframer.push_frame(&frame) {
                        yield out;
                    }
                    if reframer.is_terminated() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Upstream byte stream failed");
                    for out in reframer.fail(format!("upstream connection lost: {e}")) {
                        yield out;
                    }
                    break;
                }
            }
        }

        for out in reframer.finish() {
            yield out;
        }
        tracing::debug!("Stream completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Usage;
    use crate::translate::accumulate::ResponseAssembler;
    use serde_json::{json, Value};

    fn anthropic_frame(value: Value) -> SseFrame {
        let name = value["type"].as_str().unwrap_or_default().to_string();
        SseFrame::new(name, value.to_string())
    }

    fn openai_chunk(delta: Value, finish: Option<&str>) -> SseFrame {
        SseFrame::data(
            json!({
                "id": "chatcmpl-9", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
            })
            .to_string(),
        )
    }

    fn text_stream() -> Vec<SseFrame> {
        vec![
            anthropic_frame(json!({"type": "message_start", "message": {
                "id": "msg_01", "type": "message", "role": "assistant", "content": [],
                "model": "claude-3-5-sonnet", "stop_reason": null, "stop_sequence": null,
                "usage": {"input_tokens": 25, "output_tokens": 1}}})),
            anthropic_frame(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            anthropic_frame(json!({"type": "ping"})),
            anthropic_frame(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hello"}})),
            anthropic_frame(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": " world"}})),
            anthropic_frame(json!({"type": "content_block_stop", "index": 0})),
            anthropic_frame(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null}, "usage": {"output_tokens": 15}})),
            anthropic_frame(json!({"type": "message_stop"})),
        ]
    }

    fn assemble(dialect: Dialect, frames: &[SseFrame]) -> crate::schema::Response {
        let mut decoder = crate::translate::stream_decoder(dialect);
        let mut assembler = ResponseAssembler::new();
        for frame in frames {
            for event in decoder.decode(frame).unwrap() {
                assembler.push(&event).unwrap();
            }
        }
        for event in decoder.finish() {
            assembler.push(&event).unwrap();
        }
        assembler.finish().unwrap()
    }

    fn run(reframer: &mut Reframer, frames: &[SseFrame]) -> Vec<SseFrame> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend(reframer.push_frame(frame));
        }
        out.extend(reframer.finish());
        out
    }

    #[test]
    fn test_text_deltas_are_forwarded_immediately() {
        let mut reframer = Reframer::new(Dialect::Anthropic, Dialect::OpenAi, None);
        let frames = text_stream();
        reframer.push_frame(&frames[0]);
        reframer.push_frame(&frames[1]);
        let out = reframer.push_frame(&frames[3]);
        assert_eq!(out.len(), 1);
        let chunk: Value = serde_json::from_str(&out[0].data).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], "Hello");
    }

    #[test]
    fn test_streaming_equivalence_through_openai() {
        let original = text_stream();

        let mut to_openai = Reframer::new(Dialect::Anthropic, Dialect::OpenAi, None);
        let openai_frames = run(&mut to_openai, &original);
        assert!(openai_frames.last().unwrap().is_done());

        let mut back = Reframer::new(Dialect::OpenAi, Dialect::Anthropic, None);
        let anthropic_frames = run(&mut back, &openai_frames);

        assert_eq!(
            assemble(Dialect::Anthropic, &anthropic_frames),
            assemble(Dialect::Anthropic, &original)
        );
    }

    #[test]
    fn test_split_tool_arguments_reassemble_byte_identical() {
        let arguments = r#"{"location": "San Francisco, CA", "unit": "celsius"}"#;
        let cuts = [0, 3, 11, 19, 36, arguments.len()];

        let mut frames = vec![
            openai_chunk(json!({"role": "assistant", "content": ""}), None),
            openai_chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_abc", "type": "function",
                        "function": {"name": "get_weather", "arguments": ""}}]}),
                None,
            ),
        ];
        for pair in cuts.windows(2) {
            frames.push(openai_chunk(
                json!({"tool_calls": [{"index": 0, "function": {"arguments": &arguments[pair[0]..pair[1]]}}]}),
                None,
            ));
        }
        frames.push(openai_chunk(json!({}), Some("tool_calls")));
        frames.push(SseFrame::data("[DONE]"));

        let mut reframer = Reframer::new(Dialect::OpenAi, Dialect::Anthropic, None);
        let out = run(&mut reframer, &frames);

        let json_deltas: Vec<String> = out
            .iter()
            .filter_map(|f| serde_json::from_str::<Value>(&f.data).ok())
            .filter(|v| v["delta"]["type"] == "input_json_delta")
            .map(|v| v["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(json_deltas, vec![arguments.to_string()]);
        assert_eq!(out.last().unwrap().event.as_deref(), Some("message_stop"));
    }

    #[test]
    fn test_reused_tool_index_keeps_both_calls() {
        let frames = vec![
            openai_chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_a", "type": "function",
                        "function": {"name": "f", "arguments": "{\"x\":1}"}}]}),
                None,
            ),
            openai_chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_b", "type": "function",
                        "function": {"name": "g", "arguments": "{\"y\":2}"}}]}),
                None,
            ),
            openai_chunk(json!({}), Some("tool_calls")),
            SseFrame::data("[DONE]"),
        ];

        let mut reframer = Reframer::new(Dialect::OpenAi, Dialect::Anthropic, None);
        let out = run(&mut reframer, &frames);

        assert!(out.iter().all(|f| f.event.as_deref() != Some("error")));
        let started: Vec<String> = out
            .iter()
            .filter_map(|f| serde_json::from_str::<Value>(&f.data).ok())
            .filter(|v| v["type"] == "content_block_start")
            .map(|v| v["content_block"]["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(started, vec!["call_a", "call_b"]);
        assert_eq!(out.last().unwrap().event.as_deref(), Some("message_stop"));
    }

    #[test]
    fn test_no_delta_after_block_stop() {
        let mut reframer = Reframer::new(Dialect::Anthropic, Dialect::OpenAi, None);
        let mut frames = text_stream();
        frames.insert(
            6,
            anthropic_frame(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "late"}})),
        );
        let out = run(&mut reframer, &frames);
        let last: Value = serde_json::from_str(&out.last().unwrap().data).unwrap();
        assert_eq!(last["error"]["code"], "malformed_payload");
        assert!(out.iter().all(|f| !f.data.contains("late")));
        assert!(out.iter().all(|f| !f.is_done()));
    }

    #[test]
    fn test_open_tool_block_at_message_stop() {
        let mut reframer = Reframer::new(Dialect::OpenAi, Dialect::Anthropic, None);
        reframer.push_frame(&openai_chunk(json!({"role": "assistant"}), None));
        let events = reframer.process_event(StreamEvent::BlockStart {
            index: 0,
            kind: BlockKind::ToolUse {
                id: "call_1".into(),
                name: "f".into(),
            },
        });
        assert_eq!(events.len(), 1);
        let events = reframer.process_event(StreamEvent::MessageStop {
            usage: Usage::default(),
        });
        assert_eq!(
            events,
            vec![StreamEvent::error(
                ErrorKind::UnexpectedStreamTermination,
                "Stream ended with content block 0 still open"
            )]
        );
        assert!(reframer.is_terminated());
    }

    #[test]
    fn test_invalid_tool_arguments_terminate_stream() {
        let mut reframer = Reframer::new(Dialect::OpenAi, Dialect::Anthropic, None);
        let out = run(
            &mut reframer,
            &[
                openai_chunk(
                    json!({"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "f", "arguments": "{\"a\":"}}]}),
                    None,
                ),
                openai_chunk(json!({}), Some("tool_calls")),
                SseFrame::data("[DONE]"),
            ],
        );
        let last = out.last().unwrap();
        assert_eq!(last.event.as_deref(), Some("error"));
        assert!(last.data.contains("not valid JSON"));
    }

    #[test]
    fn test_truncated_stream_reports_disconnect() {
        let mut reframer = Reframer::new(Dialect::Anthropic, Dialect::Anthropic, None);
        let frames = text_stream();
        let out = run(&mut reframer, &frames[..4]);
        let last = out.last().unwrap();
        assert_eq!(last.event.as_deref(), Some("error"));
        assert!(out.iter().all(|f| f.event.as_deref() != Some("message_stop")));
    }

    #[test]
    fn test_error_frame_after_two_deltas() {
        let mut frames = text_stream();
        frames.truncate(5);
        frames.push(anthropic_frame(json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})));

        let mut reframer = Reframer::new(Dialect::Anthropic, Dialect::OpenAi, None);
        let out = run(&mut reframer, &frames);
        let bodies: Vec<Value> = out
            .iter()
            .map(|f| serde_json::from_str(&f.data).unwrap())
            .collect();

        let texts: Vec<&str> = bodies
            .iter()
            .filter_map(|b| b["choices"][0]["delta"]["content"].as_str())
            .filter(|t| !t.is_empty())
            .collect();
        assert_eq!(texts, vec!["Hello", " world"]);
        assert_eq!(bodies.iter().filter(|b| b.get("error").is_some()).count(), 1);
        assert_eq!(bodies.last().unwrap()["error"]["message"], "Overloaded");
        assert!(out.iter().all(|f| !f.is_done()));
    }

    #[test]
    fn test_reported_model_replaces_backend_model() {
        let mut reframer = Reframer::new(
            Dialect::OpenAi,
            Dialect::Anthropic,
            Some("claude-3-5-sonnet".into()),
        );
        let out = reframer.push_frame(&openai_chunk(json!({"role": "assistant"}), None));
        let start: Value = serde_json::from_str(&out[0].data).unwrap();
        assert_eq!(start["message"]["model"], "claude-3-5-sonnet");
    }

    #[tokio::test]
    async fn test_reframe_stream_over_split_bytes() {
        let bytes: Vec<u8> = text_stream()
            .iter()
            .flat_map(|f| f.to_bytes().to_vec())
            .collect();
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = bytes
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let reframer = Reframer::new(Dialect::Anthropic, Dialect::OpenAi, None);
        let out: Vec<SseFrame> = reframe_stream(futures::stream::iter(chunks), reframer)
            .collect()
            .await;
        assert!(out.last().unwrap().is_done());
        let text: String = out
            .iter()
            .filter_map(|f| serde_json::from_str::<Value>(&f.data).ok())
            .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(String::from))
            .collect();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn test_reframe_stream_transport_error() {
        let wire: Vec<u8> = text_stream()[..4]
            .iter()
            .flat_map(|f| f.to_bytes().to_vec())
            .collect();
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(wire)),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let reframer = Reframer::new(Dialect::Anthropic, Dialect::Anthropic, None);
        let out: Vec<SseFrame> = reframe_stream(futures::stream::iter(chunks), reframer)
            .collect()
            .await;
        let errors = out
            .iter()
            .filter(|f| f.event.as_deref() == Some("error"))
            .count();
        assert_eq!(errors, 1);
    }
}
