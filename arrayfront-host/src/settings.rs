//! Persistent runner settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use arrayfront_core::{ArrayConfig, EngineConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct HostSettings {
    /// Input device name; `None` picks the first device with enough channels.
    pub input_device: Option<String>,
    /// Replay this recording instead of opening a capture device.
    pub replay_wav: Option<PathBuf>,
    /// Pace WAV replay at the recording's sample rate.
    pub realtime_replay: bool,
    /// Play one clean beam on the default output device.
    pub monitor_channel: Option<usize>,
    pub engine: EngineConfig,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            replay_wav: None,
            realtime_replay: true,
            monitor_channel: None,
            engine: EngineConfig::default(),
        }
    }
}

impl HostSettings {
    pub fn normalize(&mut self) {
        self.input_device = self
            .input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.engine.array.sample_rate = self.engine.array.sample_rate.clamp(8_000, 48_000);
        self.engine.ring_slots = self.engine.ring_slots.clamp(2, 64);
        self.engine.array.energy_window = self.engine.array.energy_window.clamp(10, 2_000);
        if let Err(e) = self.engine.array.validate() {
            warn!(error = %e, "array settings rejected; using defaults");
            self.engine.array = ArrayConfig::default();
        }
        self.monitor_channel = self
            .monitor_channel
            .filter(|c| *c < self.engine.array.beam_channels);
        if let Some(serial) = self.engine.serial.as_mut() {
            serial.idle_backoff_ms = serial.idle_backoff_ms.clamp(1, 1_000);
            serial.read_timeout_ms = serial.read_timeout_ms.clamp(10, 1_000);
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("arrayfront")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("arrayfront")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> HostSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<HostSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "settings file invalid; using defaults");
            HostSettings::default()
        }),
        Err(_) => HostSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &HostSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let settings: HostSettings = serde_json::from_str(
            r#"{ "inputDevice": "  ReSpeaker  ", "engine": { "array": { "energyThreshold": 42 } } }"#,
        )
        .expect("parse");
        let mut settings = settings;
        settings.normalize();

        assert_eq!(settings.input_device.as_deref(), Some("ReSpeaker"));
        assert_eq!(settings.engine.array.energy_threshold, 42);
        assert_eq!(settings.engine.array.beam_channels, 12);
        assert_eq!(settings.engine.ring_slots, 4);
    }

    #[test]
    fn invalid_geometry_falls_back_to_default_array() {
        let mut settings = HostSettings::default();
        settings.engine.array.beam_channels = 7;
        settings.monitor_channel = Some(11);
        settings.normalize();
        assert_eq!(settings.engine.array, ArrayConfig::default());
        assert_eq!(settings.monitor_channel, Some(11));

        settings.monitor_channel = Some(12);
        settings.normalize();
        assert_eq!(settings.monitor_channel, None);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = std::env::temp_dir().join(format!("arrayfront-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let mut settings = HostSettings::default();
        settings.replay_wav = Some("/tmp/mic.wav".into());
        settings.engine.serial = None;

        save_settings(&path, &settings).expect("save");
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn garbage_file_loads_defaults() {
        let dir = std::env::temp_dir().join(format!("arrayfront-garbage-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), HostSettings::default());
        let _ = fs::remove_dir_all(&dir);
    }
}
