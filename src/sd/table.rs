//! Session table shared by every connection.
//!
//! Session ids start at 1 and are never reused, even after the session is
//! closed. Each session owns a map of document name to content. One mutex
//! guards the id counter and all sessions; every operation takes it exactly
//! once and never holds it across an `.await`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Error type for session table operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session {0} is not open")]
    SessionNotOpen(u64),
    #[error("Document {key:?} not found in session {session_id}")]
    KeyNotFound { session_id: u64, key: String },
}

struct Session {
    documents: HashMap<String, String>,
    opened_at: DateTime<Utc>,
}

struct TableState {
    next_session_id: u64,
    sessions: HashMap<u64, Session>,
}

/// Statistics about the session table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub open_sessions: usize,
    /// Ids handed out so far, including closed sessions.
    pub issued_sessions: u64,
    pub stored_documents: usize,
    /// When the longest-lived open session was opened.
    pub oldest_opened_at: Option<DateTime<Utc>>,
}

/// Thread-safe table of open sessions.
pub struct SessionTable {
    inner: Mutex<TableState>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TableState {
                next_session_id: 1,
                sessions: HashMap::new(),
            }),
        }
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new, empty session and return its id.
    pub fn open_session(&self) -> u64 {
        let mut state = self.lock();
        let session_id = state.next_session_id;
        state.next_session_id += 1;
        state.sessions.insert(
            session_id,
            Session {
                documents: HashMap::new(),
                opened_at: Utc::now(),
            },
        );
        session_id
    }

    /// Whether `session_id` names an open session.
    pub fn resume_session(&self, session_id: u64) -> bool {
        self.lock().sessions.contains_key(&session_id)
    }

    /// Close an open session; its id is retired for good.
    pub fn close_session(&self, session_id: u64) -> Result<(), SessionError> {
        self.lock()
            .sessions
            .remove(&session_id)
            .map(|_| ())
            .ok_or(SessionError::SessionNotOpen(session_id))
    }

    /// Copy out the document stored under `key`.
    pub fn get_value(&self, session_id: u64, key: &str) -> Result<String, SessionError> {
        let state = self.lock();
        let session = state
            .sessions
            .get(&session_id)
            .ok_or(SessionError::SessionNotOpen(session_id))?;
        session
            .documents
            .get(key)
            .cloned()
            .ok_or_else(|| SessionError::KeyNotFound {
                session_id,
                key: key.to_string(),
            })
    }

    /// Store `value` under `key`, replacing any previous document.
    pub fn put_value(&self, session_id: u64, key: &str, value: String) -> Result<(), SessionError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::SessionNotOpen(session_id))?;
        session.documents.insert(key.to_string(), value);
        Ok(())
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.lock();
        SessionStats {
            open_sessions: state.sessions.len(),
            issued_sessions: state.next_session_id - 1,
            stored_documents: state.sessions.values().map(|s| s.documents.len()).sum(),
            oldest_opened_at: state.sessions.values().map(|s| s.opened_at).min(),
        }
    }
}
