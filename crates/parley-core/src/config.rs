//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};
use crate::protocol::TurnDetection;
use crate::types::AudioFormat;

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";
pub const DEFAULT_VOICE: &str = "alloy";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Realtime service connection and session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket endpoint without query string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key (default: `OPENAI_API_KEY`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Inline system instructions. Takes priority over `instructions_file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions_file: Option<String>,

    /// Server-side turn detection. Omit for client-committed turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
}

impl RealtimeConfig {
    /// Resolve the API key: `api_key` first, then the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        let env = self
            .api_key_env
            .clone()
            .or_else(|| Some(DEFAULT_API_KEY_ENV.to_string()));
        resolve_secret_field(&self.api_key, &env)
    }
}

/// Local audio device settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Capture and playback sample rate (default: 24000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,

    /// Capture channel count (default: 1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,

    /// Bytes per captured chunk (default: 4096).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_bytes: Option<usize>,

    /// Size of each playback slice in milliseconds (default: 250).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_slice_ms: Option<u64>,

    /// How far playback may run ahead of real time in milliseconds (default: 500).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_lead_ms: Option<u64>,

    /// Input device name. Default device when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,

    /// Output device name. Default device when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
}

/// How the user can interrupt the assistant while it is speaking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInMode {
    /// Only explicit interrupt commands or server speech events.
    #[default]
    Off,
    /// Keep the microphone open while the assistant speaks and interrupt on
    /// local voice activity.
    Vad,
}

/// Session behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub barge_in: BargeInMode,

    /// RMS energy above which a frame counts as speech (default: 500).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_threshold: Option<f64>,

    /// Consecutive speech frames required before declaring speech (default: 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_speech_frames: Option<usize>,

    /// Restart capture once the assistant's audio has finished playing.
    #[serde(default)]
    pub resume_capture_after_playback: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Endpoint that `write_note` posts to. The tool is disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes_url: Option<String>,

    /// Tool names that are never advertised to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ParleyError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse JSON5 config text.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| ParleyError::Config(e.to_string()))
    }

    /// Default config file location: `~/.parley/config.json`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Full WebSocket URL including the model query parameter.
    pub fn realtime_url(&self) -> String {
        let rt = self.realtime.as_ref();
        let base = rt
            .and_then(|r| r.url.as_deref())
            .unwrap_or(DEFAULT_REALTIME_URL);
        let model = rt
            .and_then(|r| r.model.as_deref())
            .unwrap_or(DEFAULT_MODEL);
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{base}{sep}model={model}")
    }

    pub fn api_key(&self) -> Option<String> {
        match &self.realtime {
            Some(rt) => rt.resolve_api_key(),
            None => RealtimeConfig::default().resolve_api_key(),
        }
    }

    pub fn voice(&self) -> String {
        self.realtime
            .as_ref()
            .and_then(|r| r.voice.clone())
            .unwrap_or_else(|| DEFAULT_VOICE.to_string())
    }

    /// System instructions, read from `instructions_file` when not given inline.
    pub fn instructions(&self) -> Result<Option<String>> {
        let Some(rt) = &self.realtime else {
            return Ok(None);
        };
        if let Some(text) = &rt.instructions {
            return Ok(Some(text.clone()));
        }
        match &rt.instructions_file {
            Some(file) => {
                let path = expand_path(file);
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    ParleyError::Config(format!(
                        "cannot read instructions file {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    pub fn turn_detection(&self) -> Option<TurnDetection> {
        self.realtime.as_ref().and_then(|r| r.turn_detection.clone())
    }

    /// Capture format. Samples are always 16-bit.
    pub fn capture_format(&self) -> AudioFormat {
        let audio = self.audio.as_ref();
        AudioFormat::new(
            audio
                .and_then(|a| a.sample_rate)
                .unwrap_or(AudioFormat::PCM16_24K_MONO.sample_rate),
            16,
            audio.and_then(|a| a.channels).unwrap_or(1),
        )
    }

    /// Playback format: the wire format, since deltas arrive as 24 kHz mono pcm16.
    pub fn playback_format(&self) -> AudioFormat {
        AudioFormat::PCM16_24K_MONO
    }

    pub fn chunk_bytes(&self) -> usize {
        self.audio
            .as_ref()
            .and_then(|a| a.chunk_bytes)
            .unwrap_or(4096)
    }

    pub fn playback_slice_ms(&self) -> u64 {
        self.audio
            .as_ref()
            .and_then(|a| a.playback_slice_ms)
            .unwrap_or(250)
    }

    pub fn playback_lead_ms(&self) -> u64 {
        self.audio
            .as_ref()
            .and_then(|a| a.playback_lead_ms)
            .unwrap_or(500)
    }

    pub fn input_device(&self) -> Option<&str> {
        self.audio.as_ref().and_then(|a| a.input_device.as_deref())
    }

    pub fn output_device(&self) -> Option<&str> {
        self.audio.as_ref().and_then(|a| a.output_device.as_deref())
    }

    pub fn barge_in(&self) -> BargeInMode {
        self.session
            .as_ref()
            .map(|s| s.barge_in)
            .unwrap_or_default()
    }

    pub fn vad_threshold(&self) -> f64 {
        self.session
            .as_ref()
            .and_then(|s| s.vad_threshold)
            .unwrap_or(500.0)
    }

    pub fn vad_speech_frames(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.vad_speech_frames)
            .unwrap_or(3)
    }

    pub fn resume_capture_after_playback(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.resume_capture_after_playback)
    }

    pub fn notes_url(&self) -> Option<&str> {
        self.tools.as_ref().and_then(|t| t.notes_url.as_deref())
    }

    /// Whether a tool may be advertised to the model.
    pub fn tool_allowed(&self, name: &str) -> bool {
        !self
            .tools
            .as_ref()
            .and_then(|t| t.deny.as_ref())
            .is_some_and(|deny| deny.iter().any(|d| d == name))
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.api_key().is_none() {
            warnings.push(format!(
                "No realtime API key configured (set realtime.api_key or {})",
                self.realtime
                    .as_ref()
                    .and_then(|r| r.api_key_env.as_deref())
                    .unwrap_or(DEFAULT_API_KEY_ENV)
            ));
        }

        let url = self.realtime_url();
        if !url.starts_with("wss://") && !url.starts_with("ws://") {
            errors.push(format!("Realtime URL must be ws:// or wss://, got {url}"));
        }

        if let Some(file) = self.realtime.as_ref().and_then(|r| r.instructions_file.as_ref()) {
            if !expand_path(file).exists() {
                errors.push(format!("Instructions file not found: {file}"));
            }
        }

        let capture = self.capture_format();
        if capture.sample_rate != AudioFormat::PCM16_24K_MONO.sample_rate || capture.channels != 1 {
            warnings.push(format!(
                "Capture format {capture} differs from the 24000Hz mono pcm16 the service expects"
            ));
        }

        let chunk = self.chunk_bytes();
        if chunk == 0 || chunk % capture.frame_size().max(1) != 0 {
            errors.push(format!(
                "audio.chunk_bytes must be a non-zero multiple of {} bytes",
                capture.frame_size()
            ));
        }

        if self.playback_slice_ms() == 0 {
            errors.push("audio.playback_slice_ms cannot be 0".to_string());
        }

        if let Some(url) = self.notes_url() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("tools.notes_url must be an http(s) URL, got {url}"));
            }
        }

        (warnings, errors)
    }

    /// Starter config written by `parley config init`.
    pub fn starter() -> Self {
        Self {
            realtime: Some(RealtimeConfig {
                model: Some(DEFAULT_MODEL.into()),
                api_key_env: Some(DEFAULT_API_KEY_ENV.into()),
                voice: Some(DEFAULT_VOICE.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Save config to a file, creating its directory.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_PARLEY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_PARLEY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PARLEY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PARLEY_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.realtime_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01"
        );
        assert_eq!(config.voice(), "alloy");
        assert_eq!(config.capture_format(), AudioFormat::PCM16_24K_MONO);
        assert_eq!(config.chunk_bytes(), 4096);
        assert_eq!(config.barge_in(), BargeInMode::Off);
        assert!(!config.resume_capture_after_playback());
        assert!(config.notes_url().is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/parley/config.json")).unwrap();
        assert!(config.realtime.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                realtime: { model: "gpt-test", voice: "verse", turn_detection: { type: "server_vad", threshold: 0.6 } },
                session: { barge_in: "vad", resume_capture_after_playback: true },
                tools: { notes_url: "https://notes.example/api", deny: ["write_note"] },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.realtime_url().ends_with("?model=gpt-test"));
        assert_eq!(config.voice(), "verse");
        assert!(matches!(
            config.turn_detection(),
            Some(TurnDetection::ServerVad { threshold: Some(t), .. }) if (t - 0.6).abs() < f32::EPSILON
        ));
        assert_eq!(config.barge_in(), BargeInMode::Vad);
        assert!(config.resume_capture_after_playback());
        assert!(!config.tool_allowed("write_note"));
        assert!(config.tool_allowed("other"));
    }

    #[test]
    fn test_invalid_json5_is_config_error() {
        let err = Config::parse("{ realtime: ").unwrap_err();
        assert!(matches!(err, ParleyError::Config(_)));
    }

    #[test]
    fn test_api_key_resolution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_PARLEY_API_KEY", "from-env") };
        let rt = RealtimeConfig {
            api_key_env: Some("TEST_PARLEY_API_KEY".into()),
            ..RealtimeConfig::default()
        };
        assert_eq!(rt.resolve_api_key(), Some("from-env".into()));

        let rt = RealtimeConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_PARLEY_API_KEY".into()),
            ..RealtimeConfig::default()
        };
        // Direct key takes priority
        assert_eq!(rt.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_PARLEY_API_KEY") };
    }

    #[test]
    fn test_instructions_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "You are a tutor.").unwrap();

        let config = Config {
            realtime: Some(RealtimeConfig {
                instructions_file: Some(path.display().to_string()),
                ..RealtimeConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(
            config.instructions().unwrap().as_deref(),
            Some("You are a tutor.")
        );

        let missing = Config {
            realtime: Some(RealtimeConfig {
                instructions_file: Some("/nonexistent/prompt.txt".into()),
                ..RealtimeConfig::default()
            }),
            ..Config::default()
        };
        assert!(missing.instructions().is_err());
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_reports_bad_values() {
        let config = Config {
            realtime: Some(RealtimeConfig {
                url: Some("https://api.example/realtime".into()),
                api_key: Some("k".into()),
                ..RealtimeConfig::default()
            }),
            audio: Some(AudioConfig {
                sample_rate: Some(16_000),
                chunk_bytes: Some(4095),
                ..AudioConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(warnings.iter().any(|w| w.contains("16000Hz")), "{warnings:?}");
        assert!(errors.iter().any(|e| e.contains("ws://")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("chunk_bytes")), "{errors:?}");
    }

    #[test]
    fn test_validate_missing_api_key_warns() {
        let config = Config {
            realtime: Some(RealtimeConfig {
                api_key_env: Some("NONEXISTENT_PARLEY_KEY_VAR".into()),
                ..RealtimeConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(
            warnings.iter().any(|w| w.contains("NONEXISTENT_PARLEY_KEY_VAR")),
            "Expected a warning about the API key, got: {warnings:?}"
        );
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_starter_config_round_trips_through_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        Config::starter().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.voice(), DEFAULT_VOICE);
        assert!(loaded.realtime_url().ends_with(DEFAULT_MODEL));
        assert!(loaded.realtime.unwrap().api_key.is_none());
    }
}
