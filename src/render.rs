use crate::format;
use crate::literal;
use crate::transcript::{ConversationTurn, Transcript};
use crate::types::{Role, WireMessage};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

pub const TOOL_PLACEHOLDER: &str = "🧰 Retrieving information...";

/// Citation footnotes such as `【4:0†source】`.
static CITATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"【[^】]*】").expect("valid regex"));

/// Prefixes of retriever dumps that must never reach the user.
const RAW_DUMP_PREFIXES: [&str; 2] = ["[Document(", "[{'chunk_id'"];

/// One displayable unit on a chat surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    User(String),
    Text(String),
    ToolActivity,
    FeedbackControls,
}

impl Block {
    /// Plain markdown for surfaces without HTML.
    pub fn as_markdown(&self) -> &str {
        match self {
            Block::User(text) | Block::Text(text) => text,
            Block::ToolActivity => TOOL_PLACEHOLDER,
            Block::FeedbackControls => "_Was this helpful? Rate it with /good or /bad._",
        }
    }
}

/// Message content after best-effort classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Plain,
    Structured(Value),
}

impl Content {
    pub fn classify(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            if let Ok(value) = literal::parse(trimmed) {
                return Content::Structured(value);
            }
        }
        Content::Plain
    }
}

pub fn strip_citations(text: &str) -> String {
    CITATION.replace_all(text, "").into_owned()
}

pub fn render_message(msg: &WireMessage) -> Vec<Block> {
    match msg.role {
        Role::Assistant => render_assistant(msg.content.as_deref().unwrap_or_default()),
        Role::Tool => vec![Block::ToolActivity],
        Role::User => match msg.content.as_deref() {
            Some(text) if !text.is_empty() => vec![Block::User(text.to_string())],
            _ => Vec::new(),
        },
        Role::System => Vec::new(),
    }
}

pub fn render_messages(messages: &[WireMessage]) -> Vec<Block> {
    messages.iter().flat_map(render_message).collect()
}

fn render_assistant(content: &str) -> Vec<Block> {
    if content.is_empty() {
        return Vec::new();
    }
    let content = strip_citations(content);

    let mut blocks = Vec::new();
    let rendered = match Content::classify(&content) {
        Content::Structured(value) => extract_text(&value, &mut blocks),
        Content::Plain => false,
    };
    if rendered {
        return blocks;
    }

    let trimmed = content.trim_start();
    if RAW_DUMP_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix)) {
        return Vec::new();
    }
    vec![Block::Text(content)]
}

/// Collects user-facing text from a parsed content structure. Returns whether
/// anything counted as rendered, which includes suppressed reasoning.
fn extract_text(value: &Value, out: &mut Vec<Block>) -> bool {
    match value {
        Value::Array(items) => {
            let mut rendered = false;
            for item in items {
                rendered |= extract_text(item, out);
            }
            rendered
        }
        Value::Object(record) => {
            let kind = record.get("type").and_then(Value::as_str).unwrap_or_default();
            match kind {
                "text" | "output_text" | "summary_text" => {
                    match record.get("text").and_then(Value::as_str) {
                        Some(text) => {
                            out.push(Block::Text(text.to_string()));
                            true
                        }
                        None => false,
                    }
                }
                "reasoning" => record.contains_key("summary"),
                _ => match record.get("content") {
                    Some(inner @ (Value::Array(_) | Value::Object(_))) => extract_text(inner, out),
                    _ => false,
                },
            }
        }
        _ => false,
    }
}

/// Standalone HTML page for a whole conversation.
pub fn transcript_html(transcript: &Transcript) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Tropical Forages Research Assistant</title>\
         <style>.table-scroll{overflow-x:auto}.turn{margin:1rem 0}.user{font-weight:600}</style></head><body>\n",
    );
    for turn in transcript.turns() {
        let class = match turn {
            ConversationTurn::User(_) => "turn user",
            ConversationTurn::Assistant(_) => "turn assistant",
        };
        html.push_str(&format!("<div class=\"{class}\">\n"));
        for block in turn.render() {
            match block {
                Block::User(text) => {
                    html.push_str(&format!("<p>{}</p>\n", format::escape_html(&text)))
                }
                Block::Text(text) => {
                    html.push_str(&format!("<div>{}</div>\n", format::to_html(&text)))
                }
                Block::ToolActivity => {
                    html.push_str(&format!("<p><em>{TOOL_PLACEHOLDER}</em></p>\n"))
                }
                Block::FeedbackControls => {}
            }
        }
        html.push_str("</div>\n");
    }
    html.push_str("</body></html>\n");
    html
}
