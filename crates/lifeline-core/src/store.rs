use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
struct PersistedState {
    #[serde(default)]
    session_id: Option<String>,
}

/// Durable local state: the id of the session currently in progress.
///
/// Read once at startup to drive `SessionController::resume`, written on
/// session start, cleared on stop and on forced logout. Absence of the id
/// means no session is active.
pub struct SessionStore {
    state: Mutex<PersistedState>,
    file_path: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("session.json");
        let state = Self::load(&file_path);
        Self {
            state: Mutex::new(state),
            file_path,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().unwrap().session_id.clone()
    }

    pub fn set_session_id(&self, id: &str) {
        self.state.lock().unwrap().session_id = Some(id.to_string());
        self.save();
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().session_id = None;
        self.save();
    }

    fn save(&self) {
        let state = self.state.lock().unwrap().clone();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(&state) {
            let _ = std::fs::write(&self.file_path, json);
        }
    }

    fn load(path: &PathBuf) -> PersistedState {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => PersistedState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_new_store_holds_no_session() {
        let dir = temp_dir();
        let store = SessionStore::new(dir.path().to_str().unwrap());
        assert_eq!(store.session_id(), None);
    }

    #[test]
    fn test_session_id_survives_restart() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        {
            let store = SessionStore::new(path);
            store.set_session_id("abc");
        }
        let store = SessionStore::new(path);
        assert_eq!(store.session_id(), Some("abc".to_string()));
    }

    #[test]
    fn test_clear_removes_persisted_id() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        {
            let store = SessionStore::new(path);
            store.set_session_id("abc");
            store.clear();
        }
        let store = SessionStore::new(path);
        assert_eq!(store.session_id(), None);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_empty() {
        let dir = temp_dir();
        fs::write(dir.path().join("session.json"), "not json!!!").unwrap();
        let store = SessionStore::new(dir.path().to_str().unwrap());
        assert_eq!(store.session_id(), None);
    }

    #[test]
    fn test_overwrite_replaces_previous_id() {
        let dir = temp_dir();
        let store = SessionStore::new(dir.path().to_str().unwrap());
        store.set_session_id("first");
        store.set_session_id("second");
        assert_eq!(store.session_id(), Some("second".to_string()));
    }
}
