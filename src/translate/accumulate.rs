//! Folds a sequence of stream events back into a whole [`Response`].

use crate::error::{ErrorKind, GatewayError, Result};
use crate::schema::{BlockKind, BlockTable, ContentBlock, Delta, Response, StopReason, StreamEvent};

#[derive(Debug)]
enum Partial {
    Text(String),
    Thinking {
        text: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        arguments: String,
    },
    Redacted(String),
}

impl Partial {
    fn from_kind(kind: &BlockKind) -> Self {
        match kind {
            BlockKind::Text => Partial::Text(String::new()),
            BlockKind::Thinking => Partial::Thinking {
                text: String::new(),
                signature: None,
            },
            BlockKind::ToolUse { id, name } => Partial::ToolUse {
                id: id.clone(),
                name: name.clone(),
                arguments: String::new(),
            },
            BlockKind::Redacted { data } => Partial::Redacted(data.clone()),
        }
    }

    fn into_block(self) -> ContentBlock {
        match self {
            Partial::Text(text) => ContentBlock::Text { text },
            Partial::Thinking { text, signature } => ContentBlock::Thinking { text, signature },
            Partial::ToolUse {
                id,
                name,
                arguments,
            } => ContentBlock::ToolUse {
                id,
                name,
                arguments: if arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    arguments
                },
            },
            Partial::Redacted(data) => ContentBlock::Redacted { data },
        }
    }
}

/// Builds a [`Response`] from stream events, enforcing the block lifecycle.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    id: String,
    model: String,
    blocks: BlockTable,
    content: Vec<Partial>,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    usage: Option<crate::schema::Usage>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &StreamEvent) -> Result<()> {
        match event {
            StreamEvent::MessageStart { id, model } => {
                self.id = id.clone();
                self.model = model.clone();
            }
            StreamEvent::BlockStart { index, kind } => {
                self.blocks.open(*index, kind.clone())?;
                self.content.push(Partial::from_kind(kind));
            }
            StreamEvent::BlockDelta { index, delta } => {
                self.blocks.check_delta(*index, delta)?;
                match (&mut self.content[*index], delta) {
                    (Partial::Text(buf), Delta::Text(t))
                    | (Partial::Thinking { text: buf, .. }, Delta::Text(t))
                    | (Partial::ToolUse { arguments: buf, .. }, Delta::ArgumentsJson(t)) => {
                        buf.push_str(t);
                    }
                    (Partial::Thinking { signature, .. }, Delta::Signature(s)) => {
                        signature.get_or_insert_with(String::new).push_str(s);
                    }
                    _ => {}
                }
            }
            StreamEvent::BlockStop { index } => {
                self.blocks.close(*index)?;
            }
            StreamEvent::MessageDelta {
                stop_reason,
                stop_sequence,
            } => {
                self.stop_reason = Some(*stop_reason);
                self.stop_sequence = stop_sequence.clone();
            }
            StreamEvent::MessageStop { usage } => self.usage = Some(usage.clone()),
            StreamEvent::ErrorEvent { kind, message } => {
                return Err(match kind {
                    ErrorKind::MalformedPayload => GatewayError::malformed(message.clone()),
                    _ => GatewayError::disconnected(message.clone()),
                });
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<Response> {
        let usage = self.usage.ok_or_else(|| {
            GatewayError::disconnected("stream ended before the message was complete")
        })?;
        if let Some(index) = self.blocks.open_indices().first() {
            return Err(GatewayError::UnexpectedStreamTermination { index: *index });
        }
        let resp = Response {
            id: self.id,
            model: self.model,
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
            stop_sequence: self.stop_sequence,
            content: self.content.into_iter().map(Partial::into_block).collect(),
            usage,
            warnings: Vec::new(),
        };
        resp.validate()?;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Usage;

    fn events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::MessageStart {
                id: "msg_1".into(),
                model: "claude-3-5-sonnet".into(),
            },
            StreamEvent::BlockStart {
                index: 0,
                kind: BlockKind::Text,
            },
            StreamEvent::BlockDelta {
                index: 0,
                delta: Delta::Text("Let me ".into()),
            },
            StreamEvent::BlockDelta {
                index: 0,
                delta: Delta::Text("look.".into()),
            },
            StreamEvent::BlockStop { index: 0 },
            StreamEvent::BlockStart {
                index: 1,
                kind: BlockKind::ToolUse {
                    id: "toolu_1".into(),
                    name: "search".into(),
                },
            },
            StreamEvent::BlockDelta {
                index: 1,
                delta: Delta::ArgumentsJson("{\"q\":".into()),
            },
            StreamEvent::BlockDelta {
                index: 1,
                delta: Delta::ArgumentsJson("\"rust\"}".into()),
            },
            StreamEvent::BlockStop { index: 1 },
            StreamEvent::MessageDelta {
                stop_reason: StopReason::ToolUse,
                stop_sequence: None,
            },
            StreamEvent::MessageStop {
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 20,
                    reasoning_tokens: None,
                },
            },
        ]
    }

    #[test]
    fn test_assembles_text_and_tool_call() {
        let mut assembler = ResponseAssembler::new();
        for event in events() {
            assembler.push(&event).unwrap();
        }
        let resp = assembler.finish().unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(
            resp.content,
            vec![
                ContentBlock::Text {
                    text: "Let me look.".into()
                },
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "search".into(),
                    arguments: "{\"q\":\"rust\"}".into(),
                },
            ]
        );
        assert_eq!(resp.usage.output_tokens, 20);
    }

    #[test]
    fn test_missing_message_stop_is_disconnect() {
        let mut assembler = ResponseAssembler::new();
        for event in &events()[..5] {
            assembler.push(event).unwrap();
        }
        let err = assembler.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamDisconnected);
    }

    #[test]
    fn test_delta_after_stop_rejected() {
        let mut assembler = ResponseAssembler::new();
        for event in &events()[..5] {
            assembler.push(event).unwrap();
        }
        let err = assembler
            .push(&StreamEvent::BlockDelta {
                index: 0,
                delta: Delta::Text("late".into()),
            })
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedPayload { .. }));
    }
}
