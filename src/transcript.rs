//! Conversation turns and the per-session transcript.
//!
//! A transcript only ever grows: turns are appended once complete and are
//! never edited or reordered afterwards.

use crate::render::{self, Block};
use crate::types::{Rating, WireMessage};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct UserTurn {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantTurn {
    pub messages: Vec<WireMessage>,
    /// Request id returned by the endpoint, needed to submit feedback.
    pub correlation_id: Option<String>,
}

impl AssistantTurn {
    pub fn new(messages: Vec<WireMessage>, correlation_id: Option<String>) -> Self {
        Self {
            messages,
            correlation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationTurn {
    User(UserTurn),
    Assistant(AssistantTurn),
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        ConversationTurn::User(UserTurn {
            content: content.into(),
        })
    }

    pub fn to_wire_messages(&self) -> Vec<WireMessage> {
        match self {
            ConversationTurn::User(turn) => vec![WireMessage::user(turn.content.clone())],
            ConversationTurn::Assistant(turn) => turn.messages.clone(),
        }
    }

    pub fn render(&self) -> Vec<Block> {
        match self {
            ConversationTurn::User(turn) => vec![Block::User(turn.content.clone())],
            ConversationTurn::Assistant(turn) => {
                let mut blocks = render::render_messages(&turn.messages);
                if turn.correlation_id.is_some() {
                    blocks.push(Block::FeedbackControls);
                }
                blocks
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<ConversationTurn>,
}

impl Transcript {
    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn to_wire_messages(&self) -> Vec<WireMessage> {
        self.turns
            .iter()
            .flat_map(ConversationTurn::to_wire_messages)
            .collect()
    }
}

/// Everything one user's conversation owns.
#[derive(Debug, Default)]
pub struct Session {
    transcript: Transcript,
    example_prompt: Option<String>,
    ratings: HashMap<usize, Rating>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Appends a finished exchange. Both turns land together or not at all.
    pub fn commit(&mut self, user: ConversationTurn, assistant: ConversationTurn) {
        self.transcript.push(user);
        self.transcript.push(assistant);
    }

    pub fn set_example_prompt(&mut self, prompt: impl Into<String>) {
        self.example_prompt = Some(prompt.into());
    }

    pub fn take_example_prompt(&mut self) -> Option<String> {
        self.example_prompt.take()
    }

    /// Latest assistant turn that can receive feedback, with its index.
    pub fn last_rateable_turn(&self) -> Option<(usize, &str)> {
        self.transcript
            .turns()
            .iter()
            .enumerate()
            .rev()
            .find_map(|(idx, turn)| match turn {
                ConversationTurn::Assistant(AssistantTurn {
                    correlation_id: Some(id),
                    ..
                }) => Some((idx, id.as_str())),
                _ => None,
            })
    }

    pub fn record_rating(&mut self, turn_index: usize, rating: Rating) -> Option<Rating> {
        self.ratings.insert(turn_index, rating)
    }

    pub fn rating(&self, turn_index: usize) -> Option<Rating> {
        self.ratings.get(&turn_index).copied()
    }

    pub fn clear(&mut self) {
        *self = Session::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, ToolCall};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_user_turn_wire_messages() {
        let turn = ConversationTurn::user("x");
        assert_eq!(turn.to_wire_messages(), vec![WireMessage::user("x")]);
        let value = serde_json::to_value(turn.to_wire_messages()).unwrap();
        assert_eq!(value, serde_json::json!([{"role": "user", "content": "x"}]));
    }

    #[test]
    fn test_assistant_turn_messages_verbatim() {
        let mut call = WireMessage::assistant("");
        call.tool_calls.push(ToolCall::function("c1", "lookup", "{\"q\":\"leucaena\"}"));
        let messages = vec![
            call,
            WireMessage::tool("result", Some("c1".to_string())),
            WireMessage::assistant("Leucaena is a legume."),
        ];
        let turn = ConversationTurn::Assistant(AssistantTurn::new(messages.clone(), None));
        assert_eq!(turn.to_wire_messages(), messages);
    }

    #[test]
    fn test_assistant_render_order_then_feedback() {
        let turn = ConversationTurn::Assistant(AssistantTurn::new(
            vec![
                WireMessage::tool("raw", None),
                WireMessage::assistant("answer"),
            ],
            Some("req-1".to_string()),
        ));
        assert_eq!(
            turn.render(),
            vec![
                Block::ToolActivity,
                Block::Text("answer".to_string()),
                Block::FeedbackControls,
            ]
        );
    }

    #[test]
    fn test_transcript_flattens_in_order() {
        let mut session = Session::new();
        session.commit(
            ConversationTurn::user("q1"),
            ConversationTurn::Assistant(AssistantTurn::new(vec![WireMessage::assistant("a1")], None)),
        );
        session.commit(
            ConversationTurn::user("q2"),
            ConversationTurn::Assistant(AssistantTurn::new(vec![WireMessage::assistant("a2")], None)),
        );
        let roles: Vec<Role> = session
            .transcript()
            .to_wire_messages()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(session.transcript().len(), 4);
    }

    #[test]
    fn test_last_rateable_turn_and_ratings() {
        let mut session = Session::new();
        assert!(session.last_rateable_turn().is_none());
        session.commit(
            ConversationTurn::user("q1"),
            ConversationTurn::Assistant(AssistantTurn::new(vec![], Some("req-1".to_string()))),
        );
        session.commit(
            ConversationTurn::user("q2"),
            ConversationTurn::Assistant(AssistantTurn::new(vec![], None)),
        );
        assert_eq!(session.last_rateable_turn(), Some((1, "req-1")));

        assert_eq!(session.record_rating(1, Rating::Positive), None);
        assert_eq!(session.record_rating(1, Rating::Negative), Some(Rating::Positive));
        assert_eq!(session.rating(1), Some(Rating::Negative));
    }

    #[test]
    fn test_example_prompt_taken_once_and_clear() {
        let mut session = Session::new();
        session.set_example_prompt("Best tropical forages for acidic soils");
        assert_eq!(
            session.take_example_prompt().as_deref(),
            Some("Best tropical forages for acidic soils")
        );
        assert_eq!(session.take_example_prompt(), None);

        session.commit(
            ConversationTurn::user("q"),
            ConversationTurn::Assistant(AssistantTurn::new(vec![], None)),
        );
        session.clear();
        assert!(session.transcript().is_empty());
    }
}
