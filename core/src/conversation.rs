//! Conversation controller.
//!
//! [`Conversation`] owns the message log and drives one reply per `send`
//! through the [`TranscriptReducer`]. Observers read state through
//! [`Conversation::subscribe`]; every mutation publishes a fresh
//! [`ConversationSnapshot`].

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::client::ChatBackend;
use crate::config::ClientConfig;
use crate::conversation_history::ConversationHistory;
use crate::error::ClientErr;
use crate::models::Message;
use crate::transcript::TranscriptReducer;

/// Marker prefixed to the synthesized message sent by [`Conversation::save`].
pub const SAVE_MARKER: &str = "*SAVE* ";

/// Shown when `save` is attempted on a conversation that is too short.
pub const NOTHING_TO_SAVE: &str = "No messages to save.";

/// State published to observers after every change.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    pub messages: Vec<Arc<Message>>,
    /// A send is outstanding. Advisory only: concurrent sends are not
    /// rejected.
    pub busy: bool,
    /// Set at the start of a send and cleared once the first reply bytes
    /// arrive (or the send ends without any).
    pub loading: bool,
    /// Text in the user's input field.
    pub pending_input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Fewer than two messages were present; nothing changed.
    NothingToSave,
}

impl SaveOutcome {
    /// User-facing warning, if any.
    pub fn warning(self) -> Option<&'static str> {
        match self {
            SaveOutcome::Saved => None,
            SaveOutcome::NothingToSave => Some(NOTHING_TO_SAVE),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    history: ConversationHistory,
    busy: bool,
    loading: bool,
    pending_input: String,
    /// Cancellation tokens of outstanding sends.
    in_flight: Vec<(u64, CancellationToken)>,
    next_turn: u64,
    /// Bumped whenever the log is rewritten by `revert` or `reset`, so a
    /// reply that outlived its turn cannot write into the new log.
    generation: u64,
}

impl State {
    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: self.history.snapshot(),
            busy: self.busy,
            loading: self.loading,
            pending_input: self.pending_input.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Conversation {
    backend: Arc<dyn ChatBackend>,
    state: Arc<Mutex<State>>,
    updates: Arc<watch::Sender<ConversationSnapshot>>,
    revert_grace: Duration,
}

impl Conversation {
    pub fn new(backend: Arc<dyn ChatBackend>, config: &ClientConfig) -> Self {
        Self::with_history(backend, config, ConversationHistory::new())
    }

    /// Starts from an existing log, e.g. one restored by the caller.
    pub fn with_history(
        backend: Arc<dyn ChatBackend>,
        config: &ClientConfig,
        history: ConversationHistory,
    ) -> Self {
        let state = State {
            history,
            ..Default::default()
        };
        let (updates, _) = watch::channel(state.snapshot());
        Self {
            backend,
            state: Arc::new(Mutex::new(state)),
            updates: Arc::new(updates),
            revert_grace: config.revert_grace(),
        }
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.updates.subscribe()
    }

    pub fn pending_input(&self) -> String {
        self.lock().pending_input.clone()
    }

    pub fn set_pending_input(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|state| state.pending_input = text);
    }

    /// Appends `message`, posts the whole log, and reduces the reply into
    /// the log as it streams in.
    ///
    /// The message is in the log before any network activity. On a failed
    /// request no reply is appended. A reply that breaks mid-stream keeps
    /// whatever was reduced and the error is returned.
    pub async fn send(&self, message: Message) -> Result<(), ClientErr> {
        let cancel = CancellationToken::new();
        let (turn, generation, messages) = self.update(|state| {
            state.history.push(message);
            state.busy = true;
            state.loading = true;
            state.next_turn += 1;
            let turn = state.next_turn;
            state.in_flight.push((turn, cancel.clone()));
            (turn, state.generation, state.history.messages())
        });

        let result = self.drive_reply(messages, &cancel, generation).await;

        self.update(|state| {
            state.in_flight.retain(|(t, _)| *t != turn);
            // A reply that outlived a revert must not clear the flags of a
            // newer send that is still streaming.
            if state.in_flight.is_empty() {
                state.busy = false;
                state.loading = false;
            }
        });
        if let Err(e) = &result {
            warn!("chat send failed: {e}");
        }
        result
    }

    async fn drive_reply(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
        generation: u64,
    ) -> Result<(), ClientErr> {
        let mut stream = self.backend.post_chat(messages).await?;
        let mut reducer = TranscriptReducer::new();

        loop {
            if cancel.is_cancelled() {
                debug!("reply cancelled");
                reducer.on_cancelled();
                return Ok(());
            }

            match stream.next().await {
                Some(Ok(chunk)) => self.update(|state| {
                    if state.generation == generation {
                        state.loading = false;
                        reducer.on_chunk(&mut state.history, &chunk);
                    } else {
                        reducer.on_cancelled();
                    }
                }),
                Some(Err(e)) => return Err(e),
                None => {
                    self.update(|state| {
                        if state.generation == generation {
                            reducer.on_stream_end(&mut state.history);
                        }
                    });
                    return Ok(());
                }
            }
        }
    }

    /// Cancels the outstanding reply, waits the grace period, then removes
    /// the most recent user message and everything after it. The removed
    /// text becomes the pending input.
    pub async fn revert(&self) {
        self.request_cancel();
        tokio::time::sleep(self.revert_grace).await;

        self.update(|state| {
            let restored = state.history.truncate_to_last_user();
            state.pending_input = restored.map(|m| m.content).unwrap_or_default();
            state.generation += 1;
            state.busy = false;
        });
    }

    /// Clears the log. An outstanding reply stops writing to it.
    pub fn reset(&self) {
        self.update(|state| {
            state.history.clear();
            state.generation += 1;
        });
    }

    /// Sends the pending input behind [`SAVE_MARKER`] and clears the input.
    /// Requires at least two messages in the log.
    pub async fn save(&self) -> Result<SaveOutcome, ClientErr> {
        let input = {
            let mut state = self.lock();
            if state.history.len() < 2 {
                return Ok(SaveOutcome::NothingToSave);
            }
            std::mem::take(&mut state.pending_input)
        };
        self.send(Message::user(format!("{SAVE_MARKER}{input}")))
            .await?;
        Ok(SaveOutcome::Saved)
    }

    pub(crate) fn request_cancel(&self) {
        let state = self.lock();
        for (_, token) in &state.in_flight {
            token.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` under the lock and publishes the resulting state.
    fn update<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let (result, snapshot) = {
            let mut state = self.lock();
            let result = f(&mut state);
            (result, state.snapshot())
        };
        self.updates.send_replace(snapshot);
        result
    }
}
