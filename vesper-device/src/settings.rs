//! Persistent device settings (JSON file in the user config directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vesper_core::{EngineConfig, ReplyMode};

pub const ENV_SERVER_URL: &str = "VESPER_SERVER_URL";
pub const ENV_SETTINGS_PATH: &str = "VESPER_SETTINGS";

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8765/ws";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DeviceSettings {
    pub server_url: String,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub greeting_cue: Option<PathBuf>,
    pub farewell_cue: Option<PathBuf>,
    pub reply_mode: ReplyMode,
    pub vad_threshold: f32,
    pub vad_hangover_frames: u32,
    pub wake_threshold: f32,
    pub wake_frames: u32,
    pub recording_timeout_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            input_device: None,
            output_device: None,
            greeting_cue: None,
            farewell_cue: None,
            reply_mode: ReplyMode::Streamed,
            vad_threshold: 0.02,
            vad_hangover_frames: 3,
            wake_threshold: 0.08,
            wake_frames: 10,
            recording_timeout_secs: 10,
            connect_timeout_ms: 3_000,
        }
    }
}

impl DeviceSettings {
    pub fn normalize(&mut self) {
        self.server_url = self.server_url.trim().to_string();
        if self.server_url.is_empty() {
            self.server_url = DEFAULT_SERVER_URL.into();
        }
        self.input_device = trimmed(self.input_device.take());
        self.output_device = trimmed(self.output_device.take());
        self.greeting_cue = self
            .greeting_cue
            .take()
            .filter(|p| !p.as_os_str().is_empty());
        self.farewell_cue = self
            .farewell_cue
            .take()
            .filter(|p| !p.as_os_str().is_empty());
        self.vad_threshold = self.vad_threshold.clamp(0.001, 0.5);
        self.vad_hangover_frames = self.vad_hangover_frames.min(50);
        self.wake_threshold = self.wake_threshold.clamp(0.005, 0.9);
        self.wake_frames = self.wake_frames.clamp(1, 100);
        self.recording_timeout_secs = self.recording_timeout_secs.clamp(3, 120);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(250, 30_000);
    }

    /// Apply environment overrides; `lookup` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|u| !u.trim().is_empty()) {
            self.server_url = url.trim().to_string();
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            ..EngineConfig::default()
        };
        config.conversation.reply_mode = self.reply_mode;
        config.conversation.recording_timeout = Duration::from_secs(self.recording_timeout_secs);
        config
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("vesper")
        .join("settings.json")
}

/// `VESPER_SETTINGS` if set, else the default location.
pub fn settings_path() -> PathBuf {
    std::env::var_os(ENV_SETTINGS_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path)
}

pub fn load_settings(path: &Path) -> DeviceSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<DeviceSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &DeviceSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("vesper-settings-{}-{name}", std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/nonexistent/vesper/settings.json"));
        assert_eq!(settings, DeviceSettings::default());
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let path = scratch("malformed");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), DeviceSettings::default());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn saved_settings_load_back_normalized() {
        let path = scratch("roundtrip");
        let settings = DeviceSettings {
            server_url: "  ws://hub.local:9000/ws ".into(),
            input_device: Some("   ".into()),
            reply_mode: ReplyMode::Buffered,
            wake_frames: 0,
            ..DeviceSettings::default()
        };
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.server_url, "ws://hub.local:9000/ws");
        assert_eq!(loaded.input_device, None);
        assert_eq!(loaded.reply_mode, ReplyMode::Buffered);
        assert_eq!(loaded.wake_frames, 1);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn fields_are_camel_case_and_partial_files_fill_defaults() {
        let raw = r#"{"serverUrl":"ws://10.0.0.2/ws","recordingTimeoutSecs":500}"#;
        let mut settings: DeviceSettings = serde_json::from_str(raw).unwrap();
        settings.normalize();
        assert_eq!(settings.server_url, "ws://10.0.0.2/ws");
        assert_eq!(settings.recording_timeout_secs, 120);
        assert_eq!(settings.vad_hangover_frames, 3);
    }

    #[test]
    fn env_override_replaces_server_url() {
        let mut settings = DeviceSettings::default();
        settings.apply_overrides(|key| {
            (key == ENV_SERVER_URL).then(|| "ws://override:1/ws".to_string())
        });
        assert_eq!(settings.server_url, "ws://override:1/ws");

        settings.apply_overrides(|_| Some("  ".into()));
        assert_eq!(settings.server_url, "ws://override:1/ws");
    }

    #[test]
    fn engine_config_carries_device_and_dialog_settings() {
        let settings = DeviceSettings {
            output_device: Some("Speaker".into()),
            recording_timeout_secs: 15,
            ..DeviceSettings::default()
        };
        let config = settings.engine_config();
        assert_eq!(config.output_device.as_deref(), Some("Speaker"));
        assert_eq!(
            config.conversation.recording_timeout,
            Duration::from_secs(15)
        );
    }
}
