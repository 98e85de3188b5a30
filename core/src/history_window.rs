//! Selects how much of the conversation is forwarded upstream.

use crate::models::Message;

/// Character budget applied to the forwarded history when none is
/// configured.
pub const DEFAULT_HISTORY_CHAR_BUDGET: usize = 12_000;

/// Returns the longest suffix of `messages` whose summed content length fits
/// in `budget`, in chronological order.
///
/// The walk starts at the newest message and stops at the first message that
/// would overflow the budget. Messages are never sliced, and nothing older
/// than the first excluded message is admitted even if it would fit, so a
/// newest message that alone exceeds the budget yields an empty window.
pub fn window_history(messages: &[Message], budget: usize) -> Vec<Message> {
    let mut used = 0usize;
    let mut window: Vec<Message> = Vec::new();

    for message in messages.iter().rev() {
        let len = message.char_len();
        if used + len > budget {
            break;
        }
        used += len;
        window.push(message.clone());
    }

    window.reverse();
    window
}
