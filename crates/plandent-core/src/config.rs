use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const API_KEY_VARS: &[&str] = &["PLANDENT_API_KEY", "GEMINI_API_KEY"];
const MODEL_VAR: &str = "PLANDENT_MODEL";

/// Model credential and generation parameters, read once per gateway.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Upper bound for a whole model call, in seconds
    pub request_timeout_secs: u64,
    /// Typical response length, used only for the progress estimate
    pub expected_response_chars: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            temperature: 0.1,
            max_output_tokens: 8192,
            request_timeout_secs: 120,
            expected_response_chars: 6000,
        }
    }
}

impl std::fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSettings")
            .field("api_key", &if self.has_credential() { "<set>" } else { "<empty>" })
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("expected_response_chars", &self.expected_response_chars)
            .finish()
    }
}

impl ModelSettings {
    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Read settings from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).context("Failed to read settings file")?;
        serde_json::from_str(&content).context("Failed to parse settings JSON")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).context("Failed to write settings file")?;
        Ok(())
    }

    /// Apply `PLANDENT_API_KEY` (or `GEMINI_API_KEY`) and `PLANDENT_MODEL`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(key) = API_KEY_VARS.iter().find_map(|&var| non_empty(var)) {
            self.api_key = key;
        }
        if let Some(model) = non_empty(MODEL_VAR) {
            self.model = model;
        }
        self
    }
}

/// Application directories
#[derive(Debug, Clone)]
pub struct Config {
    /// Settings directory (~/.config/plandent)
    pub config_dir: PathBuf,
    pub settings_file: PathBuf,
    /// Root data directory (~/.local/share/plandent)
    pub data_dir: PathBuf,
    /// One JSON file per saved plan
    pub plans_dir: PathBuf,
}

impl Config {
    /// Load configuration or use defaults
    pub fn load_or_default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plandent");
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plandent");

        Self::at(config_dir, data_dir)
    }

    pub fn at(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            settings_file: config_dir.join("settings.json"),
            plans_dir: data_dir.join("plans"),
            config_dir,
            data_dir,
        }
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.plans_dir)?;
        Ok(())
    }

    /// Settings file plus environment overrides
    pub fn load_settings(&self) -> Result<ModelSettings> {
        Ok(ModelSettings::load(&self.settings_file)?.with_env_overrides())
    }
}

/// Process-wide holder of the current settings snapshot.
///
/// Readers get an `Arc` to an immutable snapshot. `reconfigure` swaps the
/// snapshot; anything built from an earlier snapshot keeps using it.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    current: Arc<RwLock<Arc<ModelSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    pub fn snapshot(&self) -> Arc<ModelSettings> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn reconfigure(&self, settings: ModelSettings) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(settings);
        tracing::info!(model = %guard.model, "Model settings reconfigured");
    }
}

/// Per-session knobs, caller configurable.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Abort the session with a timeout error after this long
    pub timeout: Option<Duration>,
    /// Buffer length treated as 100% for the progress estimate
    pub expected_response_chars: usize,
    /// Highest percentage reported before completion
    pub progress_cap: u8,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            expected_response_chars: ModelSettings::default().expected_response_chars,
            progress_cap: 90,
        }
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            timeout: Some(settings.request_timeout()),
            expected_response_chars: settings.expected_response_chars,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = ModelSettings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, ModelSettings::default());
        assert!(!settings.has_credential());
    }

    #[test]
    fn test_settings_round_trip_with_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"model": "gemini-1.5-pro", "api_key": "k"}"#).unwrap();

        let settings = ModelSettings::load(&path).unwrap();
        assert_eq!(settings.model, "gemini-1.5-pro");
        assert_eq!(settings.max_output_tokens, 8192);

        settings.save(&path).unwrap();
        assert_eq!(ModelSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_env_overrides_prefer_plandent_key() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PLANDENT_API_KEY", "primary"),
            ("GEMINI_API_KEY", "fallback"),
            ("PLANDENT_MODEL", "  "),
        ]);
        let settings =
            ModelSettings::default().with_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(settings.api_key, "primary");
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let settings = ModelSettings {
            api_key: "secret-key".to_string(),
            ..Default::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("<set>"));
    }

    #[test]
    fn test_reconfigure_leaves_old_snapshots_untouched() {
        let handle = SettingsHandle::new(ModelSettings::default());
        let before = handle.snapshot();

        handle.reconfigure(ModelSettings {
            model: "gemini-1.5-pro".to_string(),
            ..Default::default()
        });

        assert_eq!(before.model, DEFAULT_MODEL);
        assert_eq!(handle.snapshot().model, "gemini-1.5-pro");
    }

    #[test]
    fn test_config_paths() {
        let config = Config::at(PathBuf::from("/c"), PathBuf::from("/d"));
        assert_eq!(config.settings_file, PathBuf::from("/c/settings.json"));
        assert_eq!(config.plans_dir, PathBuf::from("/d/plans"));
    }
}
