//! User Preferences - default device record
//!
//! A small JSON record under the product data directory. Loading tolerates
//! a missing or malformed file; saving is best-effort and never surfaces
//! into the scan path.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

const FILE_NAME: &str = "user-settings.json";

/// Persisted preference record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_scanner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_protocol: Option<String>,
}

pub struct PreferencesStore {
    path: PathBuf,
    current: RwLock<UserPreferences>,
}

impl PreferencesStore {
    /// Load from `data_dir`, falling back to defaults
    pub async fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(FILE_NAME);
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(prefs) => prefs,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Malformed preferences, using defaults");
                    UserPreferences::default()
                }
            },
            Err(_) => UserPreferences::default(),
        };
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub async fn get(&self) -> UserPreferences {
        self.current.read().await.clone()
    }

    /// Record the device the user last selected
    pub async fn set_default_device(&self, scanner_id: &str, protocol: &str) {
        {
            let mut current = self.current.write().await;
            current.default_scanner_id = Some(scanner_id.to_string());
            current.default_protocol = Some(protocol.to_string());
        }
        self.save().await;
    }

    /// Best-effort write; failures are logged, never surfaced
    async fn save(&self) {
        let current = self.current.read().await.clone();
        let text = match serde_json::to_string_pretty(&current) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "Preferences serialization failed");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(path = %parent.display(), error = %err, "Preferences directory creation failed");
                return;
            }
        }
        if let Err(err) = tokio::fs::write(&self.path, text).await {
            tracing::warn!(path = %self.path.display(), error = %err, "Preferences write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::load(dir.path()).await;
        let prefs = store.get().await;
        assert!(prefs.default_scanner_id.is_none());
        assert!(prefs.default_protocol.is_none());
    }

    #[tokio::test]
    async fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(FILE_NAME), "{not json")
            .await
            .unwrap();
        let store = PreferencesStore::load(dir.path()).await;
        assert!(store.get().await.default_scanner_id.is_none());
    }

    #[tokio::test]
    async fn set_default_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PreferencesStore::load(dir.path()).await;
            store.set_default_device("a:Front Desk", "a").await;
        }
        let reloaded = PreferencesStore::load(dir.path()).await;
        let prefs = reloaded.get().await;
        assert_eq!(prefs.default_scanner_id.as_deref(), Some("a:Front Desk"));
        assert_eq!(prefs.default_protocol.as_deref(), Some("a"));
    }
}
