//! Atomic persistence of the state file.

use crate::migrate;
use crate::types::StateFile;
use fedvpn_core::error::{CoreResult, Error};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STATE_FILE: &str = "state.json";

/// Loads and saves `<state_dir>/state.json`.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing file yields fresh state and a v1 file is
    /// migrated (and immediately persisted as v2).
    pub fn load(&self) -> CoreResult<StateFile> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                return Ok(StateFile::default());
            }
            Err(e) => {
                return Err(Error::file_io(format!(
                    "could not read '{}': {e}",
                    self.path.display()
                )))
            }
        };

        let value: serde_json::Value = serde_json::from_slice(&raw)?;
        if migrate::is_v1(&value) {
            let migrated = migrate::migrate_v1(value);
            // Best-effort: the migrated state is also usable unsaved.
            if let Err(e) = self.save(&migrated) {
                warn!("could not persist migrated state: {e}");
            }
            return Ok(migrated);
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Atomic save: write to a temp file in the target directory, fsync,
    /// then rename over the destination.
    pub fn save(&self, state: &StateFile) -> CoreResult<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::file_io("state path has no parent directory"))?;
        fs::create_dir_all(dir)
            .map_err(|e| Error::file_io(format!("could not create '{}': {e}", dir.display())))?;

        let contents = serde_json::to_vec_pretty(state)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".state")
            .tempfile_in(dir)
            .map_err(|e| Error::file_io(format!("could not create a temp file: {e}")))?;
        tmp.write_all(&contents)
            .map_err(|e| Error::file_io(format!("could not write state: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::file_io(format!("could not sync state: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::file_io(format!("could not replace state file: {e}")))?;

        debug!(path = %self.path.display(), bytes = contents.len(), "state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedvpn_server::types::{ServerKey, ServerRecord, ServerType};

    #[test]
    fn missing_file_yields_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = store.load().unwrap();
        assert!(state.server_list.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        let mut state = StateFile::default();
        let key = ServerKey::new(ServerType::Custom, "https://vpn.example.org/");
        state.insert_server(&key, ServerRecord::default());
        state.set_last_chosen(&key);
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.version, 2);
        assert!(loaded.server(&key).is_some());
        assert_eq!(loaded.last_chosen().unwrap(), key);
    }

    #[test]
    fn repeated_saves_replace_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        let mut state = StateFile::default();
        store.save(&state).unwrap();

        let key = ServerKey::new(ServerType::Custom, "https://vpn.example.org/");
        state.insert_server(&key, ServerRecord::default());
        store.save(&state).unwrap();

        // No stray temp files, and the latest content wins.
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);
        assert!(store.load().unwrap().server(&key).is_some());
    }

    #[test]
    fn v1_file_is_migrated_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = r#"{
          "organizations": {"legacy": true},
          "servers": {
            "custom_servers": {"https://vpn.example.org/": {"profiles": {"current_profile": "p1"}}}
          }
        }"#;
        fs::write(dir.path().join("state.json"), v1).unwrap();

        let store = StateStore::new(dir.path());
        let state = store.load().unwrap();
        let key = ServerKey::new(ServerType::Custom, "https://vpn.example.org/");
        assert_eq!(
            state.server(&key).unwrap().profiles.current.as_deref(),
            Some("p1")
        );

        // The rewritten file is v2 now.
        let raw = fs::read_to_string(dir.path().join("state.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 2);
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("state.json"), b"{ truncated").unwrap();
        let store = StateStore::new(dir.path());
        let err = store.load().unwrap_err();
        assert_eq!(err.kind, fedvpn_core::error::ErrorKind::JsonParse);
    }

    #[test]
    fn save_creates_the_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep").join("dir");
        let store = StateStore::new(&nested);
        store.save(&StateFile::default()).unwrap();
        assert!(nested.join("state.json").exists());
    }
}
