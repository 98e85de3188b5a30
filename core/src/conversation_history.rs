use std::sync::Arc;

use crate::models::Message;
use crate::models::Role;

/// Transcript of the conversation.
///
/// Entries are shared so that snapshots handed to observers stay valid: the
/// in-progress assistant message is replaced by a fresh `Arc` on every
/// update, never edited through an existing one.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    /// The oldest messages are at the beginning of the vector.
    items: Vec<Arc<Message>>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn from_messages<I>(messages: I) -> Self
    where
        I: IntoIterator<Item = Message>,
    {
        Self {
            items: messages.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.items.last().map(Arc::as_ref)
    }

    /// Shared handles to every entry, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Message>> {
        self.items.clone()
    }

    /// Owned copies of every entry, oldest first, e.g. for a request body.
    pub fn messages(&self) -> Vec<Message> {
        self.items.iter().map(|m| m.as_ref().clone()).collect()
    }

    pub fn push(&mut self, message: Message) {
        self.items.push(Arc::new(message));
    }

    /// Replaces the newest entry with a copy whose content has `text`
    /// appended. Does nothing on an empty history.
    pub(crate) fn replace_last_appending(&mut self, text: &str) {
        if let Some(last) = self.items.last_mut() {
            let mut content = String::with_capacity(last.content.len() + text.len());
            content.push_str(&last.content);
            content.push_str(text);
            *last = Arc::new(Message {
                role: last.role,
                content,
            });
        }
    }

    /// Removes the most recent user message and everything after it and
    /// returns that user message. Without any user message the history is
    /// cleared and `None` is returned.
    pub(crate) fn truncate_to_last_user(&mut self) -> Option<Message> {
        match self.items.iter().rposition(|m| m.role == Role::User) {
            Some(idx) => {
                let removed = self.items[idx].as_ref().clone();
                self.items.truncate(idx);
                Some(removed)
            }
            None => {
                self.items.clear();
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
