use std::fmt::Write as _;
use std::sync::Arc;

use elephie_core::ConversationSnapshot;
use elephie_core::Message;
use elephie_core::Role;

const ASSISTANT_PREFIX: &str = "assistant> ";

/// Turns successive conversation snapshots into terminal output.
///
/// Only the difference to the previously rendered snapshot is printed, so a
/// streaming reply shows up as it grows. User messages are not echoed since
/// the user just typed them.
#[derive(Debug, Default)]
pub struct TerminalRenderer {
    shown: Vec<Arc<Message>>,
    line_open: bool,
}

impl TerminalRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, snapshot: &ConversationSnapshot) -> String {
        let mut out = String::new();

        let kept = self
            .shown
            .iter()
            .zip(&snapshot.messages)
            .take_while(|(old, new)| match (old.role, new.role) {
                (Role::User, Role::User) => old.content == new.content,
                (Role::Assistant, Role::Assistant) => {
                    new.content.starts_with(old.content.as_str())
                }
                _ => false,
            })
            .count();
        if kept < self.shown.len() {
            self.close_line(&mut out);
            let _ = writeln!(out, "-- rewound to {kept} message(s) --");
            if !snapshot.pending_input.is_empty() {
                let _ = writeln!(out, "-- edit and resend: {} --", snapshot.pending_input);
            }
            self.shown.truncate(kept);
        }

        for (idx, message) in snapshot.messages.iter().enumerate() {
            let printed = self.shown.get(idx).map(|m| m.content.len());
            match (message.role, printed) {
                (Role::Assistant, Some(len)) => out.push_str(&message.content[len..]),
                (Role::Assistant, None) => {
                    self.close_line(&mut out);
                    out.push_str(ASSISTANT_PREFIX);
                    out.push_str(&message.content);
                    self.line_open = true;
                }
                (Role::User, None) => self.close_line(&mut out),
                (Role::User, Some(_)) => {}
            }
        }

        if !snapshot.busy {
            self.close_line(&mut out);
        }
        self.shown.clone_from(&snapshot.messages);
        out
    }

    /// A message for the user outside the transcript, e.g. a failed send.
    pub fn notice(&mut self, text: &str) -> String {
        let mut out = String::new();
        self.close_line(&mut out);
        let _ = writeln!(out, "-- {text} --");
        out
    }

    fn close_line(&mut self, out: &mut String) {
        if self.line_open {
            out.push('\n');
            self.line_open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot(messages: &[Message], busy: bool) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: messages.iter().cloned().map(Arc::new).collect(),
            busy,
            ..Default::default()
        }
    }

    #[test]
    fn streams_reply_incrementally() {
        let mut renderer = TerminalRenderer::new();

        let first = renderer.render(&snapshot(&[Message::user("hi")], true));
        let second = renderer.render(&snapshot(
            &[Message::user("hi"), Message::assistant("Hel")],
            true,
        ));
        let third = renderer.render(&snapshot(
            &[Message::user("hi"), Message::assistant("Hello")],
            true,
        ));
        let done = renderer.render(&snapshot(
            &[Message::user("hi"), Message::assistant("Hello")],
            false,
        ));

        assert_eq!(first, "");
        assert_eq!(second, "assistant> Hel");
        assert_eq!(third, "lo");
        assert_eq!(done, "\n");
    }

    #[test]
    fn coalesced_updates_print_the_whole_difference() {
        let mut renderer = TerminalRenderer::new();

        let out = renderer.render(&snapshot(
            &[Message::user("hi"), Message::assistant("Hello")],
            false,
        ));

        assert_eq!(out, "assistant> Hello\n");
    }

    #[test]
    fn rewind_is_announced_with_restored_input() {
        let mut renderer = TerminalRenderer::new();
        renderer.render(&snapshot(
            &[Message::user("a"), Message::assistant("b")],
            false,
        ));

        let mut reverted = snapshot(&[], false);
        reverted.pending_input = "a".to_string();
        let out = renderer.render(&reverted);

        assert_eq!(out, "-- rewound to 0 message(s) --\n-- edit and resend: a --\n");
    }

    #[test]
    fn rewind_then_new_reply_in_one_update() {
        let mut renderer = TerminalRenderer::new();
        renderer.render(&snapshot(
            &[Message::user("a"), Message::assistant("first")],
            false,
        ));

        let out = renderer.render(&snapshot(
            &[Message::user("a2"), Message::assistant("second")],
            false,
        ));

        assert_eq!(out, "-- rewound to 0 message(s) --\nassistant> second\n");
    }

    #[test]
    fn notice_closes_an_open_reply_line() {
        let mut renderer = TerminalRenderer::new();
        renderer.render(&snapshot(
            &[Message::user("hi"), Message::assistant("Hel")],
            true,
        ));

        let out = renderer.notice("request failed: relay returned 502 Bad Gateway");

        assert_eq!(out, "\n-- request failed: relay returned 502 Bad Gateway --\n");
        assert_eq!(renderer.notice("No messages to save."), "-- No messages to save. --\n");
    }
}
