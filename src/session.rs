//! Per-session key/value state.
//!
//! Interactive deletion keeps its progress here so it survives between
//! requests. Stores are shared between sessions and keyed by session id.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tempfile::NamedTempFile;
use tracing::debug;

pub trait SessionStore: Send + Sync {
    fn get(&self, session_id: &str, key: &str) -> Option<String>;
    fn set(&self, session_id: &str, key: &str, value: &str);
    fn remove(&self, session_id: &str, key: &str);
    fn save(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    data: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl SessionStore for MemorySessionStore {
    fn get(&self, session_id: &str, key: &str) -> Option<String> {
        self.data
            .lock()
            .map(|guard| guard.get(session_id).and_then(|s| s.get(key)).cloned())
            .unwrap_or_default()
    }

    fn set(&self, session_id: &str, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard
                .entry(session_id.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, session_id: &str, key: &str) {
        if let Ok(mut guard) = self.data.lock() {
            if let Some(session) = guard.get_mut(session_id) {
                session.remove(key);
                if session.is_empty() {
                    guard.remove(session_id);
                }
            }
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type SessionMap = BTreeMap<String, BTreeMap<String, String>>;

/// Session state persisted as one JSON document, rewritten on every save.
pub struct JsonFileSessionStore {
    path: PathBuf,
    data: Mutex<SessionMap>,
}

impl JsonFileSessionStore {
    /// Loads `path` if it exists; a missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => SessionMap::new(),
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parse session file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SessionMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("read session file {}", path.display()))
            }
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for JsonFileSessionStore {
    fn get(&self, session_id: &str, key: &str) -> Option<String> {
        self.data
            .lock()
            .map(|guard| guard.get(session_id).and_then(|s| s.get(key)).cloned())
            .unwrap_or_default()
    }

    fn set(&self, session_id: &str, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard
                .entry(session_id.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, session_id: &str, key: &str) {
        if let Ok(mut guard) = self.data.lock() {
            if let Some(session) = guard.get_mut(session_id) {
                session.remove(key);
                if session.is_empty() {
                    guard.remove(session_id);
                }
            }
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        let json = {
            let guard = self
                .data
                .lock()
                .map_err(|_| anyhow::anyhow!("session store lock poisoned"))?;
            serde_json::to_vec_pretty(&*guard).context("serialize session state")?
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create session directory {}", dir.display()))?;
        let mut tmp = NamedTempFile::new_in(&dir).context("create session temp file")?;
        tmp.write_all(&json).context("write session state")?;
        tmp.as_file().sync_all().context("sync session state")?;
        tmp.persist(&self.path)
            .with_context(|| format!("replace session file {}", self.path.display()))?;
        debug!(
            target: "ticketdesk",
            event = "session_saved",
            path = %self.path.display()
        );
        Ok(())
    }
}

/// A store bound to one session id.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<dyn SessionStore>,
    session_id: String,
}

impl SessionHandle {
    pub fn new(store: Arc<dyn SessionStore>, session_id: impl Into<String>) -> Self {
        Self {
            inner: store,
            session_id: session_id.into(),
        }
    }

    pub fn in_memory(session_id: impl Into<String>) -> Self {
        Self::new(Arc::new(MemorySessionStore::default()), session_id)
    }

    pub fn json_file(
        path: impl Into<PathBuf>,
        session_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(JsonFileSessionStore::open(path)?), session_id))
    }

    /// Another session backed by the same store.
    pub fn for_session(&self, session_id: impl Into<String>) -> Self {
        Self::new(Arc::clone(&self.inner), session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(&self.session_id, key)
    }

    pub fn set(&self, key: &str, value: &str) {
        self.inner.set(&self.session_id, key, value);
    }

    pub fn remove(&self, key: &str) {
        self.inner.remove(&self.session_id, key);
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        self.inner.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_isolated() {
        let alice = SessionHandle::in_memory("alice");
        let bob = alice.for_session("bob");

        alice.set("deleteStep", "2");
        assert_eq!(alice.get("deleteStep").as_deref(), Some("2"));
        assert_eq!(bob.get("deleteStep"), None);

        bob.set("deleteStep", "0");
        alice.remove("deleteStep");
        assert_eq!(alice.get("deleteStep"), None);
        assert_eq!(bob.get("deleteStep").as_deref(), Some("0"));
    }

    #[test]
    fn json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let handle = SessionHandle::json_file(&path, "cli").unwrap();
        handle.set("deleteTable", "ticket");
        handle.set("deleteIdValue", "42");
        handle.persist().unwrap();

        let reopened = SessionHandle::json_file(&path, "cli").unwrap();
        assert_eq!(reopened.get("deleteTable").as_deref(), Some("ticket"));
        assert_eq!(reopened.get("deleteIdValue").as_deref(), Some("42"));
        assert_eq!(reopened.for_session("other").get("deleteTable"), None);

        reopened.remove("deleteTable");
        reopened.remove("deleteIdValue");
        reopened.persist().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim(), "{}");
    }

    #[test]
    fn corrupt_session_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();
        let err = JsonFileSessionStore::open(&path).err().expect("parse failure");
        assert!(err.to_string().contains("parse session file"));
    }
}
