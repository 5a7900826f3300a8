//! Dialect-neutral chat model.
//!
//! Both codecs decode into and encode from these types, so translation between
//! dialects is always `decode(source) -> schema -> encode(target)`. Nothing in
//! here performs I/O.

use crate::error::{ErrorKind, GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentBlock::Text { text: text.into() }])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// `arguments` is the raw JSON text of the call, kept verbatim so the
    /// bytes survive a round trip through either dialect.
    ToolUse {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
    Redacted {
        data: String,
    },
    Image {
        source: ImageSource,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolChoice {
    Auto,
    Any,
    None,
    Tool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Minimal,
    Low,
    Medium,
    High,
}

impl Effort {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Some(Effort::Minimal),
            "low" => Some(Effort::Low),
            "medium" => Some(Effort::Medium),
            "high" => Some(Effort::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Effort::Minimal => "minimal",
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
        }
    }
}

/// Extended-reasoning request, in whichever form the source dialect used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reasoning {
    Budget(u64),
    Effort(Effort),
}

impl Reasoning {
    pub fn budget_tokens(self) -> u64 {
        match self {
            Reasoning::Budget(b) => b,
            Reasoning::Effort(Effort::Minimal | Effort::Low) => 2048,
            Reasoning::Effort(Effort::Medium) => 8192,
            Reasoning::Effort(Effort::High) => 24576,
        }
    }

    pub fn effort(self) -> Effort {
        match self {
            Reasoning::Effort(e) => e,
            Reasoning::Budget(b) if b <= 4096 => Effort::Low,
            Reasoning::Budget(b) if b <= 16384 => Effort::Medium,
            Reasoning::Budget(_) => Effort::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u64,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u64>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    pub stream: bool,
    pub system: Option<String>,
    pub stop_sequences: Vec<String>,
    pub reasoning: Option<Reasoning>,
    pub user: Option<String>,
}

impl Request {
    pub fn new(model: impl Into<String>, max_tokens: u64, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens,
            temperature: None,
            top_p: None,
            top_k: None,
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
            system: None,
            stop_sequences: Vec::new(),
            reasoning: None,
            user: None,
        }
    }

    /// Check the schema invariants a codec cannot express in its types.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(GatewayError::malformed("max_tokens must be positive"));
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(GatewayError::malformed(format!(
                    "tool names must be unique within a request: '{}' is declared twice",
                    tool.name
                )));
            }
        }
        for message in &self.messages {
            validate_tool_arguments(&message.content)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub model: String,
    pub stop_reason: StopReason,
    pub stop_sequence: Option<String>,
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    /// Notes about content that could not be represented in the target
    /// dialect and was dropped.
    pub warnings: Vec<String>,
}

impl Response {
    pub fn validate(&self) -> Result<()> {
        validate_tool_arguments(&self.content)
    }
}

fn validate_tool_arguments(blocks: &[ContentBlock]) -> Result<()> {
    for block in blocks {
        if let ContentBlock::ToolUse { id, arguments, .. } = block {
            if serde_json::from_str::<serde::de::IgnoredAny>(arguments).is_err() {
                return Err(GatewayError::malformed(format!(
                    "tool_use '{id}' arguments must be valid JSON"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
    Redacted { data: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    /// Text for a `Text` block, or reasoning text for a `Thinking` block.
    Text(String),
    ArgumentsJson(String),
    Signature(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    MessageStart {
        id: String,
        model: String,
    },
    BlockStart {
        index: usize,
        kind: BlockKind,
    },
    BlockDelta {
        index: usize,
        delta: Delta,
    },
    BlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: StopReason,
        stop_sequence: Option<String>,
    },
    MessageStop {
        usage: Usage,
    },
    ErrorEvent {
        kind: ErrorKind,
        message: String,
    },
}

impl StreamEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        StreamEvent::ErrorEvent {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Open,
    Closed,
}

/// Per-index lifecycle of the content blocks of one response.
///
/// Indices must be opened in order starting at 0, a delta is only legal while
/// its block is open, and a block closes exactly once.
#[derive(Debug, Default)]
pub struct BlockTable {
    blocks: Vec<(BlockKind, BlockState)>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn open(&mut self, index: usize, kind: BlockKind) -> Result<()> {
        if index != self.blocks.len() {
            return Err(GatewayError::malformed(format!(
                "block indices must be contiguous: expected block {}, got {index}",
                self.blocks.len()
            )));
        }
        self.blocks.push((kind, BlockState::Open));
        Ok(())
    }

    /// Returns the kind of the open block `index` if `delta` may be applied to it.
    pub fn check_delta(&self, index: usize, delta: &Delta) -> Result<&BlockKind> {
        let kind = self.open_kind(index, "delta")?;
        let fits = matches!(
            (kind, delta),
            (BlockKind::Text | BlockKind::Thinking, Delta::Text(_))
                | (BlockKind::Thinking, Delta::Signature(_))
                | (BlockKind::ToolUse { .. }, Delta::ArgumentsJson(_))
        );
        if !fits {
            return Err(GatewayError::malformed(format!(
                "delta does not match the kind of block {index}"
            )));
        }
        Ok(kind)
    }

    pub fn close(&mut self, index: usize) -> Result<BlockKind> {
        let kind = self.open_kind(index, "stop")?.clone();
        self.blocks[index].1 = BlockState::Closed;
        Ok(kind)
    }

    pub fn kind(&self, index: usize) -> Option<&BlockKind> {
        self.blocks.get(index).map(|(kind, _)| kind)
    }

    /// Indices of blocks that are still open, lowest first.
    pub fn open_indices(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, (_, state))| *state == BlockState::Open)
            .map(|(i, _)| i)
            .collect()
    }

    fn open_kind(&self, index: usize, what: &str) -> Result<&BlockKind> {
        match self.blocks.get(index) {
            Some((kind, BlockState::Open)) => Ok(kind),
            Some((_, BlockState::Closed)) => Err(GatewayError::malformed(format!(
                "block {index} received a {what} after it was stopped"
            ))),
            None => Err(GatewayError::malformed(format!(
                "block {index} received a {what} before it was started"
            ))),
        }
    }
}
