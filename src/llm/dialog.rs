//! Dialog engine: rolling conversation history plus the streaming reply
//! call against the backend.
//!
//! History keeps the system prompt pinned at position 0 and evicts the
//! oldest (user, assistant) pair once the configured turn budget is
//! exceeded. An interrupted reply is rewound: the partial text the user
//! actually heard is recorded as the assistant turn, so the model sees the
//! conversation the way the user experienced it.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChatBackend, ChatMessage};
use crate::error::PipelineError;

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One exchange entry in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub ts: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            ts: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            ts: Utc::now(),
        }
    }
}

/// Bounded alternating conversation history.
pub struct History {
    system_prompt: String,
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl History {
    pub fn new(system_prompt: impl Into<String>, max_turns: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            turns: VecDeque::new(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push_back(Turn::user(text));
        self.evict();
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push_back(Turn::assistant(text));
        self.evict();
    }

    /// Drop oldest (user, assistant) pairs until within budget. The system
    /// prompt lives outside `turns` and is never evicted.
    fn evict(&mut self) {
        let cap = self.max_turns * 2;
        while self.turns.len() > cap {
            self.turns.pop_front();
            self.turns.pop_front();
        }
    }

    /// Replace the turn list (session restore). The system prompt stays.
    pub fn replace_turns(&mut self, turns: Vec<Turn>) {
        self.turns = turns.into();
        self.evict();
    }

    /// Drop a trailing user turn left dangling by an abandoned exchange.
    pub fn pop_dangling_user(&mut self) {
        if self.turns.back().map(|t| t.role) == Some(Role::User) {
            self.turns.pop_back();
        }
    }

    /// Chat messages for the backend, system prompt first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        messages.push(ChatMessage::system(&self.system_prompt));
        for turn in &self.turns {
            messages.push(match turn.role {
                Role::User => ChatMessage::user(&turn.text),
                Role::Assistant => ChatMessage::assistant(&turn.text),
            });
        }
        messages
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Drives one session's conversation against the chat backend.
pub struct DialogEngine {
    backend: Arc<dyn ChatBackend>,
    history: History,
}

impl DialogEngine {
    pub fn new(backend: Arc<dyn ChatBackend>, system_prompt: &str, max_turns: usize) -> Self {
        Self {
            backend,
            history: History::new(system_prompt, max_turns),
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Load previously saved turns (session restore).
    pub fn restore_history(&mut self, turns: Vec<Turn>) {
        debug!(turns = turns.len(), "restoring conversation history");
        self.history.replace_turns(turns);
    }

    pub fn append_user(&mut self, text: &str) {
        self.history.push_user(text);
    }

    /// Stream the assistant reply, forwarding deltas as they arrive.
    /// Finalizes the assistant turn only on successful completion.
    pub async fn stream_reply(
        &mut self,
        deltas: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let messages = self.history.messages();
        let reply = self.backend.stream_chat(&messages, deltas, cancel).await?;
        self.history.push_assistant(&reply);
        Ok(reply)
    }

    /// Record an interrupted reply. The partial text (possibly empty) is
    /// kept as the assistant turn so alternation stays valid and the model
    /// sees what the user actually heard.
    pub fn rewind_on_interrupt(&mut self, partial: &str) {
        debug!(chars = partial.len(), "recording interrupted reply");
        self.history.push_assistant(partial);
    }

    /// Abandon the current exchange entirely (e.g. a backend failure before
    /// any reply text was produced): the dangling user turn is removed so
    /// alternation holds for the next turn.
    pub fn abandon_turn(&mut self) {
        self.history.pop_dangling_user();
    }

    /// Snapshot of the turns for persistence.
    pub fn turns_snapshot(&self) -> Vec<Turn> {
        self.history.turns().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoBackend;

    #[async_trait]
    impl ChatBackend for EchoBackend {
        async fn stream_chat(
            &self,
            messages: &[ChatMessage],
            deltas: mpsc::Sender<String>,
            _cancel: &CancellationToken,
        ) -> Result<String, PipelineError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let reply = format!("echo: {last}");
            let _ = deltas.send(reply.clone()).await;
            Ok(reply)
        }
    }

    fn alternation_holds(history: &History) -> bool {
        history
            .turns()
            .enumerate()
            .all(|(i, turn)| match turn.role {
                Role::User => i % 2 == 0,
                Role::Assistant => i % 2 == 1,
            })
    }

    #[test]
    fn test_system_prompt_is_first_message() {
        let mut history = History::new("be brief", 4);
        history.push_user("hello");
        let messages = history.messages();
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn test_eviction_removes_exactly_oldest_pair() {
        let mut history = History::new("sys", 2);
        for i in 0..3 {
            history.push_user(format!("u{i}"));
            history.push_assistant(format!("a{i}"));
        }
        // budget is 2 exchanges: u0/a0 must be gone
        assert_eq!(history.len(), 4);
        let texts: Vec<&str> = history.turns().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["u1", "a1", "u2", "a2"]);
        assert!(alternation_holds(&history));
    }

    #[test]
    fn test_eviction_keeps_system_prompt() {
        let mut history = History::new("sys", 1);
        for i in 0..5 {
            history.push_user(format!("u{i}"));
            history.push_assistant(format!("a{i}"));
        }
        assert_eq!(history.messages()[0].content, "sys");
    }

    #[test]
    fn test_restore_applies_budget() {
        let mut history = History::new("sys", 2);
        let turns: Vec<Turn> = (0..4)
            .flat_map(|i| [Turn::user(format!("u{i}")), Turn::assistant(format!("a{i}"))])
            .collect();
        history.replace_turns(turns);
        assert_eq!(history.len(), 4);
        assert_eq!(history.turns().next().unwrap().text, "u2");
    }

    #[tokio::test]
    async fn test_stream_reply_finalizes_assistant_turn() {
        let mut dialog = DialogEngine::new(Arc::new(EchoBackend), "sys", 8);
        dialog.append_user("hi");

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let reply = dialog.stream_reply(tx, &cancel).await.unwrap();

        assert_eq!(reply, "echo: hi");
        assert_eq!(rx.recv().await.unwrap(), "echo: hi");
        assert_eq!(dialog.history().len(), 2);
        assert!(alternation_holds(dialog.history()));
    }

    #[tokio::test]
    async fn test_rewind_keeps_alternation() {
        let mut dialog = DialogEngine::new(Arc::new(EchoBackend), "sys", 8);
        dialog.append_user("tell me a story");
        dialog.rewind_on_interrupt("Once upon a");

        assert_eq!(dialog.history().len(), 2);
        assert!(alternation_holds(dialog.history()));
        let partial = dialog.turns_snapshot().pop().unwrap();
        assert_eq!(partial.role, Role::Assistant);
        assert_eq!(partial.text, "Once upon a");
    }
}
