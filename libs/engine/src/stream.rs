//! Parsing of the agent CLI's `stream-json` output.
//!
//! Every stdout line is one JSON envelope. Lines that are empty, malformed
//! or of an unknown shape are skipped by callers; nothing here fails hard.

use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::debug;

/// One decoded line of agent output.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An assistant turn with its ordered content blocks.
    Assistant(Vec<ContentBlock>),
    /// Final summary of the invocation.
    Result { result: String, is_error: bool },
    /// Session metadata such as `init`; never rendered.
    System { subtype: Option<String> },
    /// Any other envelope type (`user` tool echoes, rate limit notices, ...).
    Other(String),
}

#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: Option<String>,
        name: String,
        /// Tool input exactly as emitted, so it can be stored verbatim.
        input: Option<Box<RawValue>>,
    },
    ToolResult(String),
    Other(String),
}

// Wire shapes. Kept as plain structs because `RawValue` does not survive
// internally tagged enum deserialization.

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<WireBlock>,
}

#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Box<RawValue>>,
    /// Tool results may carry their payload here instead of in `text`.
    #[serde(default)]
    content: Option<serde_json::Value>,
}

impl From<WireBlock> for ContentBlock {
    fn from(block: WireBlock) -> Self {
        match block.kind.as_str() {
            "text" => ContentBlock::Text(block.text.unwrap_or_default()),
            "tool_use" => ContentBlock::ToolUse {
                id: block.id,
                name: block.name.unwrap_or_default(),
                input: block.input,
            },
            "tool_result" => {
                let text = match block.text {
                    Some(text) if !text.is_empty() => text,
                    _ => block.content.as_ref().map(content_text).unwrap_or_default(),
                };
                ContentBlock::ToolResult(text)
            }
            _ => ContentBlock::Other(block.kind),
        }
    }
}

/// Flatten a tool result `content` field: either a string or a list of
/// `{"type": "text", "text": ...}` parts.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|text| text.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

impl From<WireEvent> for StreamEvent {
    fn from(event: WireEvent) -> Self {
        match event.kind.as_str() {
            "assistant" => StreamEvent::Assistant(
                event
                    .message
                    .map(|message| message.content.into_iter().map(ContentBlock::from).collect())
                    .unwrap_or_default(),
            ),
            "result" => StreamEvent::Result {
                result: event.result.unwrap_or_default(),
                is_error: event.is_error,
            },
            "system" => StreamEvent::System {
                subtype: event.subtype,
            },
            _ => StreamEvent::Other(event.kind),
        }
    }
}

/// Decode a single output line. `None` for blank or malformed lines.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<WireEvent>(line) {
        Ok(event) => Some(event.into()),
        Err(e) => {
            debug!(error = %e, "Skipping malformed stream line");
            None
        }
    }
}

/// Decode every well-formed line, in order.
pub fn parse_lines<S: AsRef<str>>(lines: &[S]) -> impl Iterator<Item = StreamEvent> + '_ {
    lines.iter().filter_map(|line| parse_line(line.as_ref()))
}
