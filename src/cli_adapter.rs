use crate::render::{self, Block};
use crate::stream::TurnRunner;
use crate::surface::TerminalSurface;
use crate::transcript::{AssistantTurn, Session};
use crate::types::{Rating, WireMessage};
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{error, warn};

const INTRO: &str = "Welcome to the Tropical Forages Research Assistant.\n\
Ask about plant species, nutritional values, climate adaptation and management practices.\n\
Answers are generated by a language model with retrieval and may contain errors; verify \
important information. Please do not enter personal or sensitive information.";

#[derive(Debug, Clone, PartialEq)]
pub enum ChatInput {
    Prompt(String),
    Example(usize),
    Rate(Rating),
    History,
    Save(PathBuf),
    Clear,
    Quit,
}

pub fn parse_input(line: &str) -> Result<ChatInput> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        bail!("empty input");
    }

    let Some(command) = trimmed.strip_prefix('/') else {
        return Ok(ChatInput::Prompt(trimmed.to_string()));
    };

    let mut parts = command.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());

    if let Ok(number) = name.parse::<usize>() {
        if number == 0 {
            bail!("example prompts are numbered from 1");
        }
        return Ok(ChatInput::Example(number - 1));
    }

    match name {
        "good" | "bad" => Ok(ChatInput::Rate(
            Rating::parse(name).context("unknown rating")?,
        )),
        "history" => Ok(ChatInput::History),
        "save" => {
            let path = arg.context("/save requires a file path")?;
            Ok(ChatInput::Save(PathBuf::from(path)))
        }
        "clear" => Ok(ChatInput::Clear),
        "quit" | "exit" => Ok(ChatInput::Quit),
        other => bail!("unknown command: /{other}"),
    }
}

/// Serialised form of an answered turn for `ask --json`.
#[derive(Debug, Serialize)]
pub struct AnswerJson<'a> {
    pub messages: &'a [WireMessage],
    pub correlation_id: Option<&'a str>,
}

pub fn pretty_answer(turn: &AssistantTurn) -> Result<String> {
    let json = serde_json::to_string_pretty(&AnswerJson {
        messages: &turn.messages,
        correlation_id: turn.correlation_id.as_deref(),
    })?;
    Ok(json)
}

fn print_intro<W: Write + Send>(
    surface: &mut TerminalSurface<W>,
    examples: &[String],
    feedback: bool,
) -> Result<()> {
    surface.print_line(INTRO)?;
    surface.print_line("\nEXAMPLE PROMPTS")?;
    for (idx, prompt) in examples.iter().enumerate() {
        surface.print_line(&format!("  /{}  {prompt}", idx + 1))?;
    }
    let rate = if feedback { "/good /bad " } else { "" };
    surface.print_line(&format!("\nCommands: {rate}/history /save <path> /clear /quit"))
}

/// Interactive terminal chat over stdin/stdout.
pub async fn run_chat(runner: &TurnRunner, examples: &[String]) -> Result<()> {
    let mut surface = TerminalSurface::new(std::io::stdout());
    let mut session = Session::new();
    print_intro(&mut surface, examples, runner.supports_feedback())?;

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    while let Some(line) = lines.next().await {
        let line = line.context("failed to read from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let input = match parse_input(&line) {
            Ok(input) => input,
            Err(err) => {
                surface.print_line(&format!("! {err}"))?;
                continue;
            }
        };

        let mut prompt = None;
        match input {
            ChatInput::Prompt(text) => prompt = Some(text),
            ChatInput::Example(idx) => match examples.get(idx) {
                Some(prompt) => {
                    surface.print_line(&format!("you> {prompt}"))?;
                    session.set_example_prompt(prompt.clone());
                }
                None => surface.print_line(&format!("! no example prompt /{}", idx + 1))?,
            },
            ChatInput::Rate(rating) => rate_latest(runner, &mut session, &mut surface, rating).await?,
            ChatInput::History => {
                for (idx, turn) in session.transcript().turns().iter().enumerate() {
                    surface.print_blocks(&turn.render())?;
                    if let Some(rating) = session.rating(idx) {
                        surface.print_line(&format!("(rated {})", rating.as_str()))?;
                    }
                }
            }
            ChatInput::Save(path) => match save_transcript(&session, &path) {
                Ok(()) => surface.print_line(&format!("saved transcript to {}", path.display()))?,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "transcript not saved");
                    surface.print_line(&format!("! {err:#}"))?;
                }
            },
            ChatInput::Clear => {
                session.clear();
                print_intro(&mut surface, examples, runner.supports_feedback())?;
            }
            ChatInput::Quit => break,
        }

        if let Some(prompt) = prompt.or_else(|| session.take_example_prompt()) {
            match runner.handle_prompt(&mut session, &mut surface, &prompt).await {
                Ok(outcome) if outcome.turn.correlation_id.is_some() => {
                    surface.print_line(Block::FeedbackControls.as_markdown())?;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "turn failed");
                    surface.print_line(&format!("! {err:#}"))?;
                }
            }
        }
    }
    Ok(())
}

fn save_transcript(session: &Session, path: &Path) -> Result<()> {
    let html = render::transcript_html(session.transcript());
    std::fs::write(path, html)
        .with_context(|| format!("failed to write transcript: {}", path.display()))
}

async fn rate_latest<W: Write + Send>(
    runner: &TurnRunner,
    session: &mut Session,
    surface: &mut TerminalSurface<W>,
    rating: Rating,
) -> Result<()> {
    let Some((turn_index, request_id)) = session.last_rateable_turn() else {
        return surface.print_line("! nothing to rate yet");
    };
    let request_id = request_id.to_string();
    match runner.endpoint().submit_feedback(&request_id, rating).await {
        Ok(()) => match session.record_rating(turn_index, rating) {
            Some(previous) if previous != rating => surface.print_line("feedback updated"),
            _ => surface.print_line("thanks for the feedback"),
        },
        Err(err) => {
            warn!(error = %err, request_id = %request_id, "feedback submission failed");
            surface.print_line(&format!("! feedback not sent: {err}"))
        }
    }
}
