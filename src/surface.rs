//! Chat surfaces: where rendered blocks end up.

use crate::render::Block;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;

pub const THINKING: &str = "_Thinking..._";

/// Sink for one assistant turn. `redraw` always receives the full current
/// view, never a delta.
#[async_trait]
pub trait Surface: Send {
    /// Shows the placeholder before the first chunk arrives.
    async fn begin(&mut self) -> Result<()>;

    async fn redraw(&mut self, blocks: &[Block]) -> Result<()>;

    /// Drops whatever the turn has drawn so far and shows `notice` instead.
    async fn discard(&mut self, notice: &str) -> Result<()>;

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn blocks_to_markdown(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            Block::User(text) => format!("you> {text}"),
            other => other.as_markdown().to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Line-oriented terminal output. Growth of the current view is printed as
/// it arrives; a view that rewrites earlier text is printed again in full.
pub struct TerminalSurface<W> {
    out: W,
    shown: String,
}

impl<W: Write + Send> TerminalSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            shown: String::new(),
        }
    }

    pub fn print_blocks(&mut self, blocks: &[Block]) -> Result<()> {
        writeln!(self.out, "{}", blocks_to_markdown(blocks)).context("failed to write to terminal")?;
        self.out.flush().context("failed to flush terminal")
    }

    pub fn print_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{line}").context("failed to write to terminal")?;
        self.out.flush().context("failed to flush terminal")
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> Surface for TerminalSurface<W> {
    async fn begin(&mut self) -> Result<()> {
        self.shown.clear();
        self.print_line(THINKING)
    }

    async fn redraw(&mut self, blocks: &[Block]) -> Result<()> {
        let view = blocks_to_markdown(blocks);
        match view.strip_prefix(self.shown.as_str()) {
            Some(growth) => write!(self.out, "{growth}").context("failed to write to terminal")?,
            None => write!(self.out, "\n{view}").context("failed to write to terminal")?,
        }
        self.out.flush().context("failed to flush terminal")?;
        self.shown = view;
        Ok(())
    }

    async fn discard(&mut self, notice: &str) -> Result<()> {
        if !self.shown.is_empty() {
            writeln!(self.out).context("failed to write to terminal")?;
        }
        self.shown.clear();
        self.print_line(notice)
    }

    async fn finish(&mut self) -> Result<()> {
        if !self.shown.is_empty() {
            writeln!(self.out).context("failed to write to terminal")?;
        }
        self.shown.clear();
        self.out.flush().context("failed to flush terminal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn text(s: &str) -> Block {
        Block::Text(s.to_string())
    }

    fn output(surface: TerminalSurface<Vec<u8>>) -> String {
        String::from_utf8(surface.into_inner()).unwrap()
    }

    #[tokio::test]
    async fn test_growth_printed_incrementally() {
        let mut surface = TerminalSurface::new(Vec::new());
        surface.begin().await.unwrap();
        surface.redraw(&[text("Guinea")]).await.unwrap();
        surface.redraw(&[text("Guinea grass")]).await.unwrap();
        surface.finish().await.unwrap();
        assert_eq!(output(surface), "_Thinking..._\nGuinea grass\n");
    }

    #[tokio::test]
    async fn test_rewritten_view_printed_in_full() {
        let mut surface = TerminalSurface::new(Vec::new());
        surface.begin().await.unwrap();
        surface.redraw(&[text("a"), Block::ToolActivity]).await.unwrap();
        surface.redraw(&[text("ab"), Block::ToolActivity]).await.unwrap();
        surface.finish().await.unwrap();
        let out = output(surface);
        assert!(out.ends_with("\nab\n\n🧰 Retrieving information...\n"));
    }

    #[tokio::test]
    async fn test_discard_shows_notice() {
        let mut surface = TerminalSurface::new(Vec::new());
        surface.begin().await.unwrap();
        surface.redraw(&[text("partial")]).await.unwrap();
        surface.discard("retrying").await.unwrap();
        surface.redraw(&[text("full")]).await.unwrap();
        surface.finish().await.unwrap();
        assert_eq!(output(surface), "_Thinking..._\npartial\nretrying\nfull\n");
    }

    #[test]
    fn test_blocks_to_markdown() {
        let md = blocks_to_markdown(&[Block::User("hi".to_string()), text("hello")]);
        assert_eq!(md, "you> hi\n\nhello");
    }
}
