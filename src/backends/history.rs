//! Conversation history, one handle per session.
//!
//! A project gets a [`ChatHistoryFactory`] rather than a history object:
//! [`ChatHistoryFactory::for_session`] maps each session id to its own
//! [`ChatHistory`]. Without a configured backend the factory is
//! [`ChatHistoryFactory::Noop`], which accepts and forgets everything.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::sqlite::SqliteChatHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Message log of one session.
#[async_trait]
pub trait ChatHistory: Send + Sync {
    fn session_id(&self) -> &str;
    async fn add_message(&self, message: ChatMessage) -> Result<()>;
    /// Live messages, oldest first.
    async fn messages(&self) -> Result<Vec<ChatMessage>>;
    async fn clear(&self) -> Result<()>;
}

/// Session-keyed history factory selected by the `history` backend.
#[derive(Clone, Default)]
pub enum ChatHistoryFactory {
    /// No backend configured.
    #[default]
    Noop,
    /// Sessions of one project, owned by its factory.
    Memory {
        sessions: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
    },
    Sqlite {
        namespace: String,
        pool: SqlitePool,
        ttl_seconds: Option<u64>,
    },
}

impl ChatHistoryFactory {
    pub fn memory() -> Self {
        ChatHistoryFactory::Memory {
            sessions: Arc::default(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChatHistoryFactory::Noop => "noop",
            ChatHistoryFactory::Memory { .. } => "memory",
            ChatHistoryFactory::Sqlite { .. } => "sqlite",
        }
    }

    pub fn for_session(&self, session_id: &str) -> Arc<dyn ChatHistory> {
        match self {
            ChatHistoryFactory::Noop => Arc::new(NoopHistory {
                session_id: session_id.to_string(),
            }),
            ChatHistoryFactory::Memory { sessions, .. } => Arc::new(InMemoryHistory {
                session_id: session_id.to_string(),
                sessions: sessions.clone(),
            }),
            ChatHistoryFactory::Sqlite {
                namespace,
                pool,
                ttl_seconds,
            } => Arc::new(SqliteChatHistory::new(
                pool.clone(),
                namespace.clone(),
                session_id,
                *ttl_seconds,
            )),
        }
    }
}

impl std::fmt::Debug for ChatHistoryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// History that stores nothing.
pub struct NoopHistory {
    session_id: String,
}

#[async_trait]
impl ChatHistory for NoopHistory {
    fn session_id(&self) -> &str {
        &self.session_id
    }
    async fn add_message(&self, _message: ChatMessage) -> Result<()> {
        Ok(())
    }
    async fn messages(&self) -> Result<Vec<ChatMessage>> {
        Ok(Vec::new())
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

pub struct InMemoryHistory {
    session_id: String,
    sessions: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

#[async_trait]
impl ChatHistory for InMemoryHistory {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn add_message(&self, message: ChatMessage) -> Result<()> {
        self.sessions
            .write()
            .expect("history lock poisoned")
            .entry(self.session_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn messages(&self) -> Result<Vec<ChatMessage>> {
        Ok(self
            .sessions
            .read()
            .expect("history lock poisoned")
            .get(&self.session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self) -> Result<()> {
        self.sessions
            .write()
            .expect("history lock poisoned")
            .remove(&self.session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_factory_accepts_any_session() {
        let factory = ChatHistoryFactory::default();
        for session in ["", "s1", "s2"] {
            let history = factory.for_session(session);
            history
                .add_message(ChatMessage::new(Role::User, "hi"))
                .await
                .unwrap();
            assert!(history.messages().await.unwrap().is_empty());
            history.clear().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_memory_sessions_are_separate() {
        let factory = ChatHistoryFactory::memory();
        let s1 = factory.for_session("s1");
        let s2 = factory.for_session("s2");

        s1.add_message(ChatMessage::new(Role::User, "hello"))
            .await
            .unwrap();
        s1.add_message(ChatMessage::new(Role::Assistant, "hi there"))
            .await
            .unwrap();

        let msgs = factory.for_session("s1").messages().await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(s2.messages().await.unwrap().is_empty());

        s1.clear().await.unwrap();
        assert!(s1.messages().await.unwrap().is_empty());
    }

    #[test]
    fn test_role_roundtrip() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("tool"), None);
    }
}
