use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::session::MediaOptions;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default)]
    pub camera_enabled_on_join: bool,
    #[serde(default)]
    pub screen_share_on_join: bool,
    /// Join timeout for rooms that do not specify one, in seconds.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub debug_logging: bool,
}

fn default_true() -> bool {
    true
}

fn default_join_timeout() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: false,
            screen_share_on_join: false,
            join_timeout_secs: default_join_timeout(),
            debug_logging: true,
        }
    }
}

impl From<&Settings> for MediaOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            microphone: settings.mic_enabled_on_join,
            camera: settings.camera_enabled_on_join,
            screen_share: settings.screen_share_on_join,
        }
    }
}

/// Settings persisted as `settings.json` in the host's data directory.
pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.update(|s| s.display_name = name);
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.update(|s| s.mic_enabled_on_join = enabled);
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.update(|s| s.camera_enabled_on_join = enabled);
    }

    pub fn set_screen_share_on_join(&self, enabled: bool) {
        self.update(|s| s.screen_share_on_join = enabled);
    }

    pub fn set_join_timeout_secs(&self, secs: u64) {
        self.update(|s| s.join_timeout_secs = secs);
    }

    pub fn set_debug_logging(&self, enabled: bool) {
        self.update(|s| s.debug_logging = enabled);
    }

    fn update(&self, change: impl FnOnce(&mut Settings)) {
        let snapshot = {
            let mut settings = self.lock();
            change(&mut settings);
            settings.clone()
        };
        self.save(&snapshot);
    }

    fn save(&self, settings: &Settings) {
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("cannot create settings directory {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("cannot write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("cannot serialize settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring corrupt {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
