use crate::config::SlackConfig;
use crate::render::Block;
use crate::surface::{self, Surface, THINKING};
use crate::types::{IncomingMessage, OutgoingMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use slack_morphism::prelude::SlackClientHyperHttpsConnector;
use slack_morphism::prelude::*;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type Client = SlackClient<SlackClientHyperHttpsConnector>;

static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[A-Za-z0-9]+(\|[^>]*)?>").expect("valid mention regex"));

#[derive(Clone)]
struct SlackBridge {
    tx: mpsc::UnboundedSender<IncomingMessage>,
}

pub struct SlackAdapter {
    client: Arc<Client>,
    bot_token: SlackApiToken,
    update_interval: Duration,
    rx: mpsc::UnboundedReceiver<IncomingMessage>,
}

impl SlackAdapter {
    pub async fn connect(cfg: &SlackConfig) -> Result<Self> {
        info!("slack: connecting (socket mode)");
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = SlackClientHyperHttpsConnector::new()
            .context("failed to create slack hyper connector")?;
        let client: Arc<Client> = Arc::new(SlackClient::new(connector));
        let bot_token = SlackApiToken::new(SlackApiTokenValue(cfg.bot_token.clone()));
        let app_token = SlackApiToken::new(SlackApiTokenValue(cfg.app_token.clone()));

        let env = Arc::new(
            SlackClientEventsListenerEnvironment::new(client.clone())
                .with_user_state(SlackBridge { tx }),
        );

        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_push_events(push_events_callback::<SlackClientHyperHttpsConnector>);

        let socket_mode_config = SlackClientSocketModeConfig::new();
        let socket_mode_listener =
            SlackClientSocketModeListener::new(&socket_mode_config, env, callbacks);

        socket_mode_listener
            .listen_for(&app_token)
            .await
            .context("failed to register socket mode listener")?;
        info!("slack: socket mode listener registered");

        tokio::spawn(async move {
            socket_mode_listener.start().await;
            warn!("slack: socket mode listener stopped");
        });

        Ok(SlackAdapter {
            client,
            bot_token,
            update_interval: Duration::from_millis(cfg.update_interval_ms),
            rx,
        })
    }

    pub fn incoming(&mut self) -> &mut mpsc::UnboundedReceiver<IncomingMessage> {
        &mut self.rx
    }

    pub async fn send(&self, message: &OutgoingMessage) -> Result<()> {
        debug!(
            channel = %message.conversation_id,
            thread = message.thread_id.as_deref().unwrap_or("-"),
            "slack: sending message"
        );
        post_message(
            &self.client,
            &self.bot_token,
            &message.conversation_id,
            message.thread_id.as_deref(),
            &message.text,
        )
        .await?;
        Ok(())
    }

    /// Surface that answers in `thread_ts` of `channel` by editing one reply.
    pub fn surface(&self, channel: &str, thread_ts: &str) -> SlackSurface {
        SlackSurface {
            client: self.client.clone(),
            bot_token: self.bot_token.clone(),
            channel: channel.to_string(),
            thread_ts: thread_ts.to_string(),
            reply: None,
            throttle: Throttle::new(self.update_interval),
        }
    }
}

fn text_content(text: &str) -> SlackMessageContent {
    SlackMessageContent::new().with_text(text.to_string())
}

async fn post_message(
    client: &Client,
    token: &SlackApiToken,
    channel: &str,
    thread_ts: Option<&str>,
    text: &str,
) -> Result<SlackTs> {
    let session = client.open_session(token);
    let req = SlackApiChatPostMessageRequest::new(SlackChannelId(channel.to_string()), text_content(text))
        .opt_thread_ts(thread_ts.map(|ts| SlackTs(ts.to_string())));

    let resp = session
        .chat_post_message(&req)
        .await
        .context("failed to post slack message")?;
    Ok(resp.ts)
}

/// Spacing between edits of a streamed reply. The latest text that arrived
/// too early is held back until the next allowed edit or `flush`.
#[derive(Debug)]
struct Throttle {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<String>,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Returns the text to send now, if any.
    fn offer(&mut self, text: String, now: Instant) -> Option<String> {
        let due = self
            .last_sent
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.pending = None;
            self.last_sent = Some(now);
            Some(text)
        } else {
            self.pending = Some(text);
            None
        }
    }

    fn flush(&mut self) -> Option<String> {
        self.pending.take()
    }

    fn reset(&mut self) {
        self.last_sent = None;
        self.pending = None;
    }
}

pub struct SlackSurface {
    client: Arc<Client>,
    bot_token: SlackApiToken,
    channel: String,
    thread_ts: String,
    reply: Option<SlackTs>,
    throttle: Throttle,
}

impl SlackSurface {
    async fn edit(&mut self, text: &str) -> Result<()> {
        let Some(ts) = self.reply.clone() else {
            self.reply = Some(
                post_message(
                    &self.client,
                    &self.bot_token,
                    &self.channel,
                    Some(&self.thread_ts),
                    text,
                )
                .await?,
            );
            return Ok(());
        };
        let session = self.client.open_session(&self.bot_token);
        let req = SlackApiChatUpdateRequest::new(
            SlackChannelId(self.channel.clone()),
            text_content(text),
            ts,
        );
        session
            .chat_update(&req)
            .await
            .context("failed to update slack message")?;
        Ok(())
    }
}

#[async_trait]
impl Surface for SlackSurface {
    async fn begin(&mut self) -> Result<()> {
        self.throttle.reset();
        self.reply = None;
        self.edit(THINKING).await
    }

    async fn redraw(&mut self, blocks: &[Block]) -> Result<()> {
        let text = surface::blocks_to_markdown(blocks);
        if let Some(text) = self.throttle.offer(text, Instant::now()) {
            self.edit(&text).await?;
        }
        Ok(())
    }

    async fn discard(&mut self, notice: &str) -> Result<()> {
        self.throttle.reset();
        self.edit(notice).await
    }

    async fn finish(&mut self) -> Result<()> {
        match self.throttle.flush() {
            Some(text) => self.edit(&text).await,
            None => Ok(()),
        }
    }
}

/// Removes user mentions such as `<@U0123>` from a message.
pub fn strip_mentions(text: &str) -> String {
    MENTION.replace_all(text, "").trim().to_string()
}

async fn push_events_callback<SCHC>(
    event: SlackPushEventCallback,
    _client: Arc<SlackClient<SCHC>>,
    state: SlackClientEventsUserState,
) -> UserCallbackResult<()>
where
    SCHC: SlackClientHttpConnector + Send + Sync + 'static,
{
    let bridge = {
        let guard = state.read().await;
        guard
            .get_user_state::<SlackBridge>()
            .cloned()
            .ok_or_else(|| "missing slack bridge")?
    };

    if let SlackEventCallbackBody::AppMention(app_mention) = event.event {
        let text = strip_mentions(app_mention.content.text.as_deref().unwrap_or_default());
        let channel = app_mention
            .origin
            .channel
            .map(|c| c.to_string())
            .unwrap_or_default();
        let thread_id = app_mention.origin.thread_ts.map(|ts| ts.to_string());
        let timestamp = Some(app_mention.origin.ts.to_string());

        if channel.is_empty() {
            warn!("slack: app_mention ignored (no channel)");
            return Ok(());
        }
        debug!(
            channel = %channel,
            thread = thread_id.as_deref().unwrap_or("-"),
            "slack: app_mention -> incoming"
        );
        let _ = bridge.tx.send(IncomingMessage {
            text,
            conversation_id: channel,
            thread_id,
            timestamp,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strip_mentions() {
        assert_eq!(strip_mentions("<@U024BE7LH> What is Leucaena?"), "What is Leucaena?");
        assert_eq!(strip_mentions("<@U024BE7LH|forage-bot>  feedback good "), "feedback good");
        assert_eq!(strip_mentions("<@U1>"), "");
    }

    #[test]
    fn test_throttle_holds_back_early_updates() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(500));

        assert_eq!(throttle.offer("a".to_string(), start), Some("a".to_string()));
        assert_eq!(throttle.offer("ab".to_string(), start + Duration::from_millis(100)), None);
        assert_eq!(throttle.offer("abc".to_string(), start + Duration::from_millis(200)), None);
        assert_eq!(
            throttle.offer("abcd".to_string(), start + Duration::from_millis(600)),
            Some("abcd".to_string())
        );
        assert_eq!(throttle.flush(), None);

        assert_eq!(throttle.offer("abcde".to_string(), start + Duration::from_millis(700)), None);
        assert_eq!(throttle.flush(), Some("abcde".to_string()));
    }

    #[test]
    fn test_throttle_reset_sends_next_immediately() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(10));
        throttle.offer("partial".to_string(), start);
        throttle.offer("dropped".to_string(), start);
        throttle.reset();
        assert_eq!(throttle.flush(), None);
        assert_eq!(throttle.offer("full".to_string(), start), Some("full".to_string()));
    }

    #[test]
    fn test_text_content() {
        let content = text_content("hi");
        assert_eq!(content.text.as_deref(), Some("hi"));
        assert!(content.blocks.is_none());
    }
}
