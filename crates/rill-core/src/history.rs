//! Session history, persisted as a JSON map under the rill home dir.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub project: String,
    pub title: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(project: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project: project.into(),
            title: String::new(),
            summary: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// Open (and create) the store inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            path: dir.join(HISTORY_FILE),
        })
    }

    /// Insert or update a session, bumping `updated_at`.
    pub fn save(&self, session: &Session) -> Result<()> {
        let mut sessions = self.load_all()?;
        let mut session = session.clone();
        session.updated_at = Utc::now();
        sessions.insert(session.id.clone(), session);
        self.write_all(&sessions)
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.load_all()?.remove(id))
    }

    /// Sessions for `project` (all projects when empty), newest first.
    pub fn list(&self, project: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .load_all()?
            .into_values()
            .filter(|session| project.is_empty() || session.project == project)
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut sessions = self.load_all()?;
        let removed = sessions.remove(id).is_some();
        if removed {
            self.write_all(&sessions)?;
        }
        Ok(removed)
    }

    fn load_all(&self) -> Result<BTreeMap<String, Session>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    fn write_all(&self, sessions: &BTreeMap<String, Session>) -> Result<()> {
        let raw = serde_json::to_string_pretty(sessions).context("failed to serialize history")?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}
