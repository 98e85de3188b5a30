use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use elephie_core::ChatBackend;
use elephie_core::Config;
use elephie_core::ConfigOverrides;
use elephie_core::Conversation;
use elephie_core::ConversationSnapshot;
use elephie_core::Message;
use elephie_core::RelayClient;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;

use crate::init_tracing;
use crate::render::TerminalRenderer;

/// Interactive chat against a running relay.
#[derive(Parser, Debug, Clone, Default)]
pub struct ChatCli {
    /// Base URL of the relay.
    #[arg(long, value_name = "URL")]
    pub relay: Option<String>,

    /// Credential sent as the `Authorization` cookie.
    #[arg(long)]
    pub token: Option<String>,

    /// Start without asking the relay to verify the session.
    #[arg(long, default_value_t = false)]
    pub skip_verify: bool,
}

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Send(String),
    Revert,
    Reset,
    /// `/save [tag]`: the tag becomes the pending input that is saved.
    Save(String),
    Quit,
    Empty,
}

impl ChatCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return ChatCommand::Empty;
        }
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };
        match head {
            "/revert" => ChatCommand::Revert,
            "/reset" => ChatCommand::Reset,
            "/save" => ChatCommand::Save(rest.to_string()),
            "/quit" | "/exit" => ChatCommand::Quit,
            _ => ChatCommand::Send(line.to_string()),
        }
    }
}

pub async fn run_chat(cli: ChatCli) -> anyhow::Result<()> {
    init_tracing("error");

    let ChatCli {
        relay,
        token,
        skip_verify,
    } = cli;
    let config = Config::load_with_overrides(ConfigOverrides {
        relay_url: relay,
        ..Default::default()
    })?;

    let client = RelayClient::new(&config.client, token);
    if !skip_verify && !client.verify_session().await? {
        bail!(
            "{} did not accept this session; log in again or pass --skip-verify",
            config.client.relay_url
        );
    }

    let backend: Arc<dyn ChatBackend> = Arc::new(client);
    let conversation = Conversation::new(backend, &config.client);
    let (notices, notice_rx) = mpsc::unbounded_channel::<String>();
    let renderer = tokio::spawn(render_updates(conversation.subscribe(), notice_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match ChatCommand::parse(&line) {
            ChatCommand::Empty => {}
            ChatCommand::Quit => break,
            ChatCommand::Reset => conversation.reset(),
            ChatCommand::Revert => conversation.revert().await,
            ChatCommand::Save(tag) => {
                conversation.set_pending_input(tag);
                match conversation.save().await {
                    Ok(outcome) => {
                        if let Some(warning) = outcome.warning() {
                            let _ = notices.send(warning.to_string());
                        }
                    }
                    Err(e) => {
                        error!("save failed: {e}");
                        let _ = notices.send(format!("save failed: {e}"));
                    }
                }
            }
            ChatCommand::Send(text) => {
                if conversation.snapshot().busy {
                    let _ = notices.send("still replying; wait or /revert".to_string());
                    continue;
                }
                let conversation = conversation.clone();
                let notices = notices.clone();
                tokio::spawn(async move {
                    if let Err(e) = conversation.send(Message::user(text)).await {
                        error!("send failed: {e}");
                        let _ = notices.send(format!("request failed: {e}"));
                    }
                });
            }
        }
    }

    debug!("stdin closed, leaving chat");
    renderer.abort();
    Ok(())
}

/// Sole writer to stdout: conversation updates and notices for the user.
async fn render_updates(
    mut updates: watch::Receiver<ConversationSnapshot>,
    mut notices: mpsc::UnboundedReceiver<String>,
) {
    let mut renderer = TerminalRenderer::new();
    let mut stdout = tokio::io::stdout();
    loop {
        let out = tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                renderer.render(&snapshot)
            }
            Some(notice) = notices.recv() => renderer.notice(&notice),
        };
        if out.is_empty() {
            continue;
        }
        if stdout.write_all(out.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}
