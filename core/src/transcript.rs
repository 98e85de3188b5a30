//! Client-side reconstruction of the assistant reply from relayed bytes.

use bytes::BytesMut;

use crate::conversation_history::ConversationHistory;
use crate::models::Message;

const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// Decodes UTF-8 across chunk boundaries.
///
/// A multi-byte character split between two chunks is held back until its
/// remaining bytes arrive. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: BytesMut,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(REPLACEMENT);
                            let _ = self.pending.split_to(valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more.
                            let _ = self.pending.split_to(valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flushes bytes still held back. A truncated trailing sequence becomes
    /// U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Folds relayed byte chunks into the conversation history.
///
/// The first chunk of a turn starts a new assistant message; later chunks
/// replace that message with a copy that has the new text appended.
#[derive(Debug)]
pub struct TranscriptReducer {
    is_first_chunk_of_turn: bool,
    decoder: Utf8ChunkDecoder,
    stopped: bool,
}

impl Default for TranscriptReducer {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptReducer {
    pub fn new() -> Self {
        Self {
            is_first_chunk_of_turn: true,
            decoder: Utf8ChunkDecoder::new(),
            stopped: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn on_chunk(&mut self, history: &mut ConversationHistory, bytes: &[u8]) {
        if self.stopped {
            return;
        }
        let text = self.decoder.decode(bytes);
        self.apply(history, &text);
    }

    /// The reader stopped early. Whatever was reduced so far stays in the
    /// history.
    pub fn on_cancelled(&mut self) {
        self.stopped = true;
    }

    /// The relay closed the reply. Held-back bytes are flushed; a reply that
    /// carried no bytes at all still leaves an (empty) assistant message so
    /// every user turn is answered.
    pub fn on_stream_end(&mut self, history: &mut ConversationHistory) {
        if self.stopped {
            return;
        }
        let tail = self.decoder.finish();
        if self.is_first_chunk_of_turn || !tail.is_empty() {
            self.apply(history, &tail);
        }
        self.stopped = true;
    }

    fn apply(&mut self, history: &mut ConversationHistory, text: &str) {
        if self.is_first_chunk_of_turn {
            history.push(Message::assistant(text));
            self.is_first_chunk_of_turn = false;
        } else {
            history.replace_last_appending(text);
        }
    }
}
