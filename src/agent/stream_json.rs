//! Decoding of the agent's `--output-format stream-json` protocol: one JSON
//! object per line, tagged by `type`.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    User {},
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// What became of one line of agent output
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Parsed(StreamEvent),
    /// Blank line
    Ignored,
    Malformed(String),
}

impl StreamEvent {
    /// Text of an assistant message, if it carries any
    pub fn assistant_text(&self) -> Option<String> {
        let StreamEvent::Assistant { message } = self else {
            return None;
        };
        let text: Vec<&str> = message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text.join("\n"))
        }
    }
}

pub fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Ignored;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return LineOutcome::Malformed(format!("not JSON: {}", e)),
    };
    if !value.is_object() || value.get("type").and_then(Value::as_str).is_none() {
        return LineOutcome::Malformed("missing string `type` field".to_string());
    }

    match serde_json::from_value::<StreamEvent>(value) {
        Ok(event) => LineOutcome::Parsed(event),
        Err(e) => LineOutcome::Malformed(e.to_string()),
    }
}

/// Per-command line tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    pub forwarded: usize,
    pub suppressed: usize,
    pub malformed: usize,
}
