use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use index::Row;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One answered question; never modified once appended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTurn {
    pub question: String,
    pub generated_query: String,
    pub result_rows: Vec<Row>,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only conversation memory of a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryHistory {
    turns: Vec<QueryTurn>,
}

impl QueryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, turn: QueryTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[QueryTurn] {
        &self.turns
    }

    /// The last `n` turns, oldest first
    pub fn recent(&self, n: usize) -> &[QueryTurn] {
        &self.turns[self.turns.len().saturating_sub(n)..]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Histories by session id. Turns of one session serialize on its mutex;
/// sessions share nothing else. Once `capacity` sessions exist, starting a
/// new one forgets the least recently used.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    capacity: usize,
}

struct Session {
    history: Arc<Mutex<QueryHistory>>,
    last_used: DateTime<Utc>,
}

const DEFAULT_CAPACITY: usize = 1000;

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// The session's history, created empty on first use
    pub fn session(&self, session_id: &str) -> Arc<Mutex<QueryHistory>> {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_used = Utc::now();
            return Arc::clone(&session.history);
        }

        if self.sessions.len() >= self.capacity {
            self.evict_least_recent();
        }

        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                history: Arc::new(Mutex::new(QueryHistory::new())),
                last_used: Utc::now(),
            });
        Arc::clone(&entry.history)
    }

    pub async fn history(&self, session_id: &str) -> Vec<QueryTurn> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| Arc::clone(&s.history));
        match session {
            Some(session) => session.lock().await.turns().to_vec(),
            None => Vec::new(),
        }
    }

    /// Forget a session's conversation. Returns whether it existed.
    pub fn clear_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            tracing::info!(session_id = %session_id, "Session cleared");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn evict_least_recent(&self) {
        // Iterator shard locks must be released before removing
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|entry| entry.last_used)
            .map(|entry| entry.key().clone());

        if let Some(session_id) = oldest {
            self.sessions.remove(&session_id);
            tracing::debug!(session_id = %session_id, "Evicted least recently used session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(question: &str) -> QueryTurn {
        QueryTurn {
            question: question.to_string(),
            generated_query: "MATCH (n) RETURN n.id".to_string(),
            result_rows: Vec::new(),
            answer: "nothing".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_recent_turns() {
        let mut history = QueryHistory::new();
        assert!(history.recent(3).is_empty());

        for q in ["a", "b", "c", "d"] {
            history.append(turn(q));
        }
        let recent: Vec<_> = history.recent(2).iter().map(|t| t.question.as_str()).collect();
        assert_eq!(recent, vec!["c", "d"]);
        assert_eq!(history.recent(10).len(), 4);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let store = SessionStore::new();
        store.session("alice").lock().await.append(turn("who?"));

        assert_eq!(store.history("alice").await.len(), 1);
        assert!(store.history("bob").await.is_empty());

        assert!(store.clear_session("alice"));
        assert!(!store.clear_session("alice"));
        assert!(store.history("alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_full_store_forgets_least_recent_session() {
        let store = SessionStore::with_capacity(2);
        store.session("alice").lock().await.append(turn("first"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.session("bob").lock().await.append(turn("second"));
        std::thread::sleep(std::time::Duration::from_millis(2));

        // Touching alice makes bob the oldest
        store.session("alice");
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.session("carol");

        assert_eq!(store.len(), 2);
        assert_eq!(store.history("alice").await.len(), 1);
        assert!(store.history("bob").await.is_empty());
    }
}
