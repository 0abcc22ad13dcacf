use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// One message in the flat format exchanged with the serving endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    #[serde(
        default,
        deserialize_with = "content_as_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl WireMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        Self {
            tool_call_id,
            ..Self::new(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_tool_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn default_tool_type() -> String {
    "function".to_string()
}

/// Endpoints hand back content either as a string or as a list of typed parts.
/// Non-string content is kept as its JSON text and classified at render time.
fn content_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// Streaming wire format declared by the serving endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    ChatCompletions,
    ChatAgent,
    Responses,
}

impl TaskType {
    pub fn from_task(task: &str) -> Self {
        match task {
            "agent/v1/responses" => TaskType::Responses,
            "agent/v2/chat" => TaskType::ChatAgent,
            _ => TaskType::ChatCompletions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rating {
    Positive,
    Negative,
}

impl Rating {
    pub fn as_str(self) -> &'static str {
        match self {
            Rating::Positive => "positive",
            Rating::Negative => "negative",
        }
    }

    pub fn parse(word: &str) -> Option<Self> {
        match word.trim().to_ascii_lowercase().as_str() {
            "good" | "up" | "yes" | "+1" | "positive" => Some(Rating::Positive),
            "bad" | "down" | "no" | "-1" | "negative" => Some(Rating::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub text: String,
    pub conversation_id: String,
    pub thread_id: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub text: String,
    pub conversation_id: String,
    pub thread_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_structured_content_kept_as_json_text() {
        let msg: WireMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": [{"type": "text", "text": "hi"}]
        }))
        .unwrap();
        assert_eq!(
            msg.content.as_deref(),
            Some(r#"[{"text":"hi","type":"text"}]"#)
        );
    }

    #[test]
    fn test_serialize_omits_absent_fields() {
        let value = serde_json::to_value(WireMessage::user("x")).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "x"}));
    }

    #[test]
    fn test_tool_call_defaults_type() {
        let call: ToolCall = serde_json::from_value(json!({
            "id": "c1",
            "function": {"name": "search", "arguments": "{}"}
        }))
        .unwrap();
        assert_eq!(call, ToolCall::function("c1", "search", "{}"));
    }

    #[test]
    fn test_task_type_from_task() {
        assert_eq!(TaskType::from_task("agent/v1/responses"), TaskType::Responses);
        assert_eq!(TaskType::from_task("agent/v2/chat"), TaskType::ChatAgent);
        assert_eq!(TaskType::from_task("llm/v1/chat"), TaskType::ChatCompletions);
        assert_eq!(TaskType::from_task(""), TaskType::ChatCompletions);
    }

    #[test]
    fn test_rating_parse() {
        assert_eq!(Rating::parse("Good"), Some(Rating::Positive));
        assert_eq!(Rating::parse(" bad "), Some(Rating::Negative));
        assert_eq!(Rating::parse("meh"), None);
    }
}
