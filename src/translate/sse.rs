//! Server-Sent-Event frames as exchanged with clients and backends.

use bytes::Bytes;

/// One SSE frame: an optional `event:` name and its `data:` payload.
///
/// OpenAI frames carry no event name; Anthropic frames always do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Wire form: `event: <name>\ndata: <json>\n\n`.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(ref event) = self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

impl From<eventsource_stream::Event> for SseFrame {
    fn from(ev: eventsource_stream::Event) -> Self {
        // The parser reports frames without an `event:` line as "message".
        let event = if ev.event.is_empty() || ev.event == "message" {
            None
        } else {
            Some(ev.event)
        };
        Self {
            event,
            data: ev.data,
        }
    }
}
