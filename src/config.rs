//! Configuration loading.
//!
//! Reads a JSON snapshot from `bitty.json` in the user's config directory
//! ($XDG_CONFIG_HOME, falling back to ~/.config). A missing file is normal;
//! a broken one logs and falls back to defaults. Reload notification is an
//! explicit call on the terminal rather than a listener registry.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration snapshot for one terminal process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Font family name; `None` lets the font layer pick.
    pub font_family: Option<String>,
    /// Font size in points.
    pub font_size: f64,
    /// Background opacity in [0, 1]; requires compositor support.
    pub opacity: f64,
    /// Shell to spawn; `None` falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            font_family: None,
            font_size: 14.0,
            opacity: 1.0,
            shell: None,
        }
    }
}

impl Config {
    /// Path to the config file, when a config directory exists.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bitty.json"))
    }

    /// Loads the config file. Absence is not an error.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            log::warn!("could not determine config directory, using defaults");
            return Self::default();
        };

        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Config>(&contents) {
                Ok(config) => {
                    log::info!("loaded config from {path:?}");
                    config
                }
                Err(err) => {
                    log::error!("failed to parse {path:?}: {err}");
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                log::error!("failed to read {path:?}: {err}");
                Self::default()
            }
        }
    }

    /// Opacity clamped to its valid range.
    pub fn opacity(&self) -> f64 {
        self.opacity.clamp(0.0, 1.0)
    }

    /// The shell to exec, resolved against the environment.
    pub fn shell_path(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    /// Point-to-pixel ratio used when sizing the font.
    pub fn pixels_per_pt() -> f64 {
        96.0 / 72.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.font_size, 14.0);
        assert_eq!(config.opacity(), 1.0);
        assert!(config.font_family.is_none());
    }

    #[test]
    fn parses_partial_json() {
        let config: Config = serde_json::from_str(r#"{"font_size": 16.5}"#).unwrap();
        assert_eq!(config.font_size, 16.5);
        assert_eq!(config.opacity, 1.0);
    }

    #[test]
    fn parses_full_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "font_family": "monospace",
                "font_size": 12.0,
                "opacity": 0.9,
                "shell": "/bin/zsh"
            }"#,
        )
        .unwrap();
        assert_eq!(config.font_family.as_deref(), Some("monospace"));
        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.opacity(), 0.9);
    }

    #[test]
    fn opacity_is_clamped() {
        let config: Config = serde_json::from_str(r#"{"opacity": 3.5}"#).unwrap();
        assert_eq!(config.opacity(), 1.0);
        let config: Config = serde_json::from_str(r#"{"opacity": -1.0}"#).unwrap();
        assert_eq!(config.opacity(), 0.0);
    }

    #[test]
    fn explicit_shell_wins() {
        let config: Config = serde_json::from_str(r#"{"shell": "/bin/dash"}"#).unwrap();
        assert_eq!(config.shell_path(), "/bin/dash");
    }
}
