use std::sync::Arc;

use dashmap::DashMap;

use super::{Role, RuntimeMessage};

/// In-memory conversation history, one entry per thread.
///
/// Each thread keeps at most `max_messages` messages. Older messages fall out
/// of the window first, and a window always starts on caller input, a user
/// or tool message, never in the middle of a reply.
/// System messages are never stored, they are supplied on every run.
#[derive(Debug, Clone)]
pub struct MemoryCheckpointer {
    threads: Arc<DashMap<String, Vec<RuntimeMessage>>>,
    max_messages: usize,
}

impl MemoryCheckpointer {
    pub fn new(max_messages: usize) -> Self {
        Self {
            threads: Arc::new(DashMap::new()),
            max_messages,
        }
    }

    /// Messages stored for a thread, oldest first.
    pub fn history(&self, thread_id: &str) -> Vec<RuntimeMessage> {
        self.threads
            .get(thread_id)
            .map(|messages| messages.value().clone())
            .unwrap_or_default()
    }

    /// Append a completed turn to a thread and apply the window.
    pub fn append(&self, thread_id: &str, messages: impl IntoIterator<Item = RuntimeMessage>) {
        let mut entry = self.threads.entry(thread_id.to_string()).or_default();
        let history = entry.value_mut();

        history.extend(messages.into_iter().filter(|message| message.role != Role::System));

        if history.len() > self.max_messages {
            let overflow = history.len() - self.max_messages;
            history.drain(..overflow);
        }

        let turn_start = history
            .iter()
            .position(|message| matches!(message.role, Role::User | Role::Tool))
            .unwrap_or(0);

        history.drain(..turn_start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(user: &str, assistant: &str) -> Vec<RuntimeMessage> {
        vec![
            RuntimeMessage::text(Role::User, user),
            RuntimeMessage::text(Role::Assistant, assistant),
        ]
    }

    fn texts(messages: &[RuntimeMessage]) -> Vec<String> {
        messages.iter().map(RuntimeMessage::joined_text).collect()
    }

    #[test]
    fn threads_are_isolated() {
        let checkpointer = MemoryCheckpointer::new(10);

        checkpointer.append("a", turn("hi", "hello"));
        checkpointer.append("b", turn("bonjour", "salut"));

        assert_eq!(texts(&checkpointer.history("a")), ["hi", "hello"]);
        assert_eq!(texts(&checkpointer.history("b")), ["bonjour", "salut"]);
        assert!(checkpointer.history("c").is_empty());
    }

    #[test]
    fn keeps_a_sliding_window() {
        let checkpointer = MemoryCheckpointer::new(4);

        for index in 0..3 {
            checkpointer.append("a", turn(&format!("q{index}"), &format!("a{index}")));
        }

        assert_eq!(texts(&checkpointer.history("a")), ["q1", "a1", "q2", "a2"]);
    }

    #[test]
    fn window_starts_on_a_user_message() {
        let checkpointer = MemoryCheckpointer::new(3);

        checkpointer.append("a", turn("q0", "a0"));
        checkpointer.append("a", turn("q1", "a1"));

        assert_eq!(texts(&checkpointer.history("a")), ["q1", "a1"]);
    }

    #[test]
    fn system_messages_are_not_stored() {
        let checkpointer = MemoryCheckpointer::new(10);

        let mut messages = vec![RuntimeMessage::text(Role::System, "be brief")];
        messages.extend(turn("hi", "hello"));

        checkpointer.append("a", messages);
        assert_eq!(texts(&checkpointer.history("a")), ["hi", "hello"]);
    }

    #[test]
    fn tool_only_turn_is_kept() {
        let checkpointer = MemoryCheckpointer::new(40);

        checkpointer.append(
            "t",
            [
                RuntimeMessage::text(Role::Tool, "42 rows"),
                RuntimeMessage::text(Role::Assistant, "There are 42 rows."),
            ],
        );

        assert_eq!(texts(&checkpointer.history("t")), ["42 rows", "There are 42 rows."]);
    }

    #[test]
    fn window_may_start_on_a_tool_message() {
        let checkpointer = MemoryCheckpointer::new(3);

        checkpointer.append("t", turn("q0", "a0"));
        checkpointer.append(
            "t",
            [
                RuntimeMessage::text(Role::Tool, "42 rows"),
                RuntimeMessage::text(Role::Assistant, "There are 42 rows."),
            ],
        );

        assert_eq!(texts(&checkpointer.history("t")), ["42 rows", "There are 42 rows."]);
    }
}
