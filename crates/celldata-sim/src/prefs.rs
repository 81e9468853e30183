use std::path::PathBuf;

use celldata_supervisor::collab::PreferenceStore;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrefsFile {
    preferred_apn_id: Option<i64>,
}

/// Preferred-APN id persisted as a small JSON document. A missing or
/// unreadable file reads as no preference.
#[derive(Debug, Clone)]
pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> anyhow::Result<Option<PrefsFile>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn load_preferred(&self) -> Option<i64> {
        match self.read() {
            Ok(file) => file.and_then(|f| f.preferred_apn_id),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable preference file");
                None
            }
        }
    }

    fn store_preferred(&mut self, id: Option<i64>) {
        let doc = PrefsFile {
            preferred_apn_id: id,
        };
        let result = serde_json::to_string_pretty(&doc)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(&self.path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to persist preferred APN");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("celldata-sim-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn store_and_load_round_trip() {
        let path = temp_path("prefs");
        let mut store = FilePreferenceStore::new(&path);
        assert_eq!(store.load_preferred(), None);

        store.store_preferred(Some(42));
        assert_eq!(store.load_preferred(), Some(42));
        store.store_preferred(None);
        assert_eq!(store.load_preferred(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_reads_as_none() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "{not json").unwrap();
        let store = FilePreferenceStore::new(&path);
        assert_eq!(store.load_preferred(), None);
        let _ = std::fs::remove_file(&path);
    }
}
