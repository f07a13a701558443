//! Conversation history for the parley platform.
//!
//! Each session owns an ordered, append-only message log. The store is a
//! collaborator boundary: the coordinator only ever calls [`HistoryStore`],
//! and the bundled [`MemoryHistory`] keeps everything in process memory.
//! A persistent backend slots in behind the same trait.
//!
//! Ordering contract: `get` returns messages in insertion order with dense
//! ordinals; `append` assigns the next ordinal atomically. A session's
//! coordinator is the only writer for that session, so read-before-append
//! sequences never interleave with another writer.

use async_trait::async_trait;
use parley_types::{ConversationMessage, Role};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors that can occur during history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The backing store rejected or lost the operation.
    #[error("history store error: {0}")]
    Store(String),
}

/// Ordered per-session message log.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Returns all messages for a session in insertion order.
    ///
    /// An unknown session is an empty conversation, not an error.
    async fn get(&self, session_id: &str) -> Result<Vec<ConversationMessage>, HistoryError>;

    /// Appends a message and returns it with its assigned ordinal.
    async fn append(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
    ) -> Result<ConversationMessage, HistoryError>;

    /// Discards a session's log. Unknown sessions are a no-op.
    async fn clear(&self, session_id: &str) -> Result<(), HistoryError>;
}

/// In-memory [`HistoryStore`].
#[derive(Debug, Default)]
pub struct MemoryHistory {
    sessions: Mutex<HashMap<String, Vec<ConversationMessage>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn get(&self, session_id: &str) -> Result<Vec<ConversationMessage>, HistoryError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn append(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
    ) -> Result<ConversationMessage, HistoryError> {
        let mut sessions = self.sessions.lock().await;
        let log = sessions.entry(session_id.to_string()).or_default();
        let message = ConversationMessage {
            role,
            text: text.to_string(),
            ordinal: log.len() as u64,
        };
        log.push(message.clone());
        Ok(message)
    }

    async fn clear(&self, session_id: &str) -> Result<(), HistoryError> {
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn unknown_session_reads_empty() {
        let store = MemoryHistory::new();
        assert!(store.get("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_assigns_dense_ordinals() {
        let store = MemoryHistory::new();
        let first = store.append("s1", Role::User, "hello").await.unwrap();
        let second = store.append("s1", Role::Assistant, "hi there").await.unwrap();
        assert_eq!(first.ordinal, 0);
        assert_eq!(second.ordinal, 1);

        let log = store.get("s1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].role, Role::User);
        assert_eq!(log[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = MemoryHistory::new();
        store.append("a", Role::User, "one").await.unwrap();
        store.append("b", Role::User, "two").await.unwrap();

        let a = store.get("a").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].text, "one");
        assert_eq!(store.get("b").await.unwrap()[0].text, "two");
    }

    #[tokio::test]
    async fn clear_discards_only_that_session() {
        let store = MemoryHistory::new();
        store.append("a", Role::User, "one").await.unwrap();
        store.append("b", Role::User, "two").await.unwrap();

        store.clear("a").await.unwrap();
        store.clear("missing").await.unwrap();

        assert!(store.get("a").await.unwrap().is_empty());
        assert_eq!(store.get("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interleaved_appends_keep_insertion_order() {
        let store = Arc::new(MemoryHistory::new());
        let mut handles = Vec::new();
        for i in 0..20u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append("busy", Role::User, &format!("msg-{i}"))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let log = store.get("busy").await.unwrap();
        assert_eq!(log.len(), 20);
        for (i, msg) in log.iter().enumerate() {
            assert_eq!(msg.ordinal, i as u64, "ordinals must be dense and ordered");
        }
    }
}
