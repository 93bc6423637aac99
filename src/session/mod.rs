//! Session Store (C6): JSON-per-session persistence with atomic writes
//! (write-temp-then-rename) for crash safety.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::conversation::message::Message;
use crate::error::{PenguinError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub agent_id: String,
    pub parent_session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub title: String,
    pub metadata: serde_json::Value,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
}

impl Session {
    pub fn new(agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            parent_session_id: None,
            created_at: now,
            last_active_at: now,
            title: "New conversation".to_string(),
            metadata: serde_json::json!({}),
            messages: Vec::new(),
            system_prompt: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub title: String,
    pub message_count: usize,
    pub last_active_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            title: session.title.clone(),
            message_count: session.messages.len(),
            last_active_at: session.last_active_at,
        }
    }
}

/// One JSON file per session under `root`. `list()` reads only enough of
/// each file to build a summary, and a corrupt file fails only itself,
/// never the whole listing (§4.6).
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, session_id: Uuid) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(PenguinError::from)?;

        let final_path = self.path_for(session.id);
        let tmp_path = final_path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(session).map_err(PenguinError::from)?;

        tokio::fs::write(&tmp_path, &body).await.map_err(PenguinError::from)?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(PenguinError::from)?;
        Ok(())
    }

    pub async fn load(&self, session_id: Uuid) -> Result<Session> {
        let body = tokio::fs::read(self.path_for(session_id))
            .await
            .map_err(PenguinError::from)?;
        serde_json::from_slice(&body).map_err(PenguinError::from)
    }

    pub async fn delete(&self, session_id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PenguinError::from(e)),
        }
    }

    /// Lists summaries for every valid session file under `root`. A file
    /// that fails to parse is skipped and logged, not propagated.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PenguinError::from(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(PenguinError::from)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_session_file(&path).await {
                Ok(session) => summaries.push(SessionSummary::from(&session)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt session file"),
            }
        }
        summaries.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(summaries)
    }
}

async fn read_session_file(path: &Path) -> Result<Session> {
    let body = tokio::fs::read(path).await.map_err(PenguinError::from)?;
    serde_json::from_slice(&body).map_err(PenguinError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut session = Session::new("agent-1");
        session.messages.push(Message::user("hello"));

        store.save(&session).await.unwrap();
        let loaded = store.load(session.id).await.unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn list_returns_summaries_without_requiring_explicit_load() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = Session::new("agent-1");
        store.save(&session).await.unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, session.id);
    }

    #[tokio::test]
    async fn corrupt_session_file_is_skipped_not_propagated() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let good = Session::new("agent-1");
        store.save(&good).await.unwrap();
        tokio::fs::write(dir.path().join("garbage.json"), b"not json")
            .await
            .unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = Session::new("agent-1");
        store.delete(session.id).await.unwrap();
    }
}
