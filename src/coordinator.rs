use crate::slack_adapter::SlackAdapter;
use crate::stream::TurnRunner;
use crate::transcript::Session;
use crate::types::{IncomingMessage, OutgoingMessage, Rating};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct ConversationKey {
    conversation_id: String,
    thread_id: String,
}

impl ConversationKey {
    /// Top-level mentions start a thread rooted at the mention itself.
    fn for_message(msg: &IncomingMessage) -> Option<Self> {
        let thread_id = msg.thread_id.clone().or_else(|| msg.timestamp.clone())?;
        Some(Self {
            conversation_id: msg.conversation_id.clone(),
            thread_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Ask(String),
    Rate(Rating),
    Help,
}

fn parse_command(text: &str) -> Command {
    let text = text.trim();
    if text.is_empty() {
        return Command::Help;
    }
    let mut words = text.split_whitespace();
    if words.next().is_some_and(|w| w.eq_ignore_ascii_case("feedback")) {
        if let (Some(word), None) = (words.next(), words.next()) {
            if let Some(rating) = Rating::parse(word) {
                return Command::Rate(rating);
            }
        }
    }
    Command::Ask(text.to_string())
}

/// Per-thread sessions, dropped once a thread has been idle for `max_idle`.
#[derive(Debug)]
struct ThreadSessions {
    max_idle: Duration,
    entries: HashMap<ConversationKey, (Session, Instant)>,
}

impl ThreadSessions {
    fn new(max_idle: Duration) -> Self {
        Self {
            max_idle,
            entries: HashMap::new(),
        }
    }

    fn get_or_insert(&mut self, key: &ConversationKey, now: Instant) -> &mut Session {
        let (session, seen) = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| (Session::new(), now));
        *seen = now;
        session
    }

    fn get_mut(&mut self, key: &ConversationKey, now: Instant) -> Option<&mut Session> {
        let (session, seen) = self.entries.get_mut(key)?;
        *seen = now;
        Some(session)
    }

    fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let max_idle = self.max_idle;
        self.entries
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) < max_idle);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct Coordinator {
    runner: TurnRunner,
    slack: SlackAdapter,
    example_prompts: Vec<String>,
    sessions: ThreadSessions,
}

impl Coordinator {
    pub fn new(
        runner: TurnRunner,
        slack: SlackAdapter,
        example_prompts: Vec<String>,
        session_idle: Duration,
    ) -> Self {
        Self {
            runner,
            slack,
            example_prompts,
            sessions: ThreadSessions::new(session_idle),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(msg) = self.slack.incoming().recv().await {
            let evicted = self.sessions.evict_idle(Instant::now());
            if evicted > 0 {
                debug!(evicted, remaining = self.sessions.len(), "slack: dropped idle thread sessions");
            }
            if let Err(err) = self.handle_incoming(msg).await {
                error!(error = %format!("{err:#}"), "incoming error");
            }
        }
        info!("slack: incoming channel closed");
        Ok(())
    }

    async fn handle_incoming(&mut self, msg: IncomingMessage) -> Result<()> {
        let key = ConversationKey::for_message(&msg).context("mention without timestamp")?;

        match parse_command(&msg.text) {
            Command::Help => {
                let text = help_text(&self.example_prompts);
                self.reply(&key, text).await
            }
            Command::Rate(rating) => self.rate(&key, rating).await,
            Command::Ask(prompt) => {
                let session = self.sessions.get_or_insert(&key, Instant::now());
                let mut surface = self.slack.surface(&key.conversation_id, &key.thread_id);
                match self.runner.handle_prompt(session, &mut surface, &prompt).await {
                    Ok(outcome) => {
                        info!(
                            channel = %key.conversation_id,
                            thread = %key.thread_id,
                            turns = session.transcript().len(),
                            fell_back = outcome.fell_back,
                            "slack: turn answered"
                        );
                        if outcome.turn.correlation_id.is_some() {
                            self.reply(&key, "_Was this helpful? Reply `feedback good` or `feedback bad`._".to_string())
                                .await?;
                        }
                        Ok(())
                    }
                    Err(err) => {
                        self.reply(&key, format!("Sorry, I could not answer that: {err}")).await?;
                        Err(err)
                    }
                }
            }
        }
    }

    async fn rate(&mut self, key: &ConversationKey, rating: Rating) -> Result<()> {
        let Some(session) = self.sessions.get_mut(key, Instant::now()) else {
            return self.reply(key, "There is no answer to rate in this thread yet.".to_string()).await;
        };
        let Some((turn_index, request_id)) = session.last_rateable_turn() else {
            return self.reply(key, "There is no answer to rate in this thread yet.".to_string()).await;
        };
        let request_id = request_id.to_string();

        match self.runner.endpoint().submit_feedback(&request_id, rating).await {
            Ok(()) => {
                session.record_rating(turn_index, rating);
                self.reply(key, "Thanks for the feedback!".to_string()).await
            }
            Err(err) => {
                warn!(error = %err, request_id = %request_id, "feedback submission failed");
                self.reply(key, format!("Could not send feedback: {err}")).await
            }
        }
    }

    async fn reply(&self, key: &ConversationKey, text: String) -> Result<()> {
        self.slack
            .send(&OutgoingMessage {
                text,
                conversation_id: key.conversation_id.clone(),
                thread_id: Some(key.thread_id.clone()),
            })
            .await
    }
}

fn help_text(example_prompts: &[String]) -> String {
    let mut text = String::from(
        "Ask me about tropical forage species, nutritional values, climate adaptation \
         and management practices. For example:",
    );
    for prompt in example_prompts {
        text.push_str("\n• ");
        text.push_str(prompt);
    }
    text
}
