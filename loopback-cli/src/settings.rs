//! Persistent loopback settings (JSON file in the user config directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use loopback_core::{
    buffering::{DEFAULT_CAPACITY_FRAMES, MAX_CAPACITY_FRAMES},
    DuplexConfig, EngineConfig, LoopbackError,
};
use serde::{Deserialize, Serialize};

use crate::args::CliArgs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct LoopbackSettings {
    /// `"cpal"` (hardware) or `"synthetic"` (no audio device needed).
    pub backend: String,
    pub sample_rate: u32,
    pub block_size: u32,
    pub buffer_capacity_frames: usize,
    pub max_restart_attempts: u32,
    pub restart_backoff_ms: u64,
    pub max_consecutive_faults: u32,
    /// Passed through to backends that can raise callback priority.
    pub realtime_priority: bool,
    /// Test tone fed to the synthetic backend's capture side.
    pub synthetic_tone_hz: f32,
    pub synthetic_amplitude: f32,
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            backend: "cpal".into(),
            sample_rate: 48_000,
            block_size: 128,
            buffer_capacity_frames: DEFAULT_CAPACITY_FRAMES,
            max_restart_attempts: 3,
            restart_backoff_ms: 50,
            max_consecutive_faults: 8,
            realtime_priority: false,
            synthetic_tone_hz: 1_000.0,
            synthetic_amplitude: 0.25,
        }
    }
}

impl LoopbackSettings {
    pub fn normalize(&mut self) {
        self.backend = normalize_backend(&self.backend);
        self.sample_rate = self.sample_rate.clamp(8_000, 192_000);
        self.block_size = self.block_size.clamp(16, 8_192);
        self.buffer_capacity_frames = self
            .buffer_capacity_frames
            .clamp(self.block_size as usize * 2, MAX_CAPACITY_FRAMES);
        self.max_restart_attempts = self.max_restart_attempts.min(20);
        self.restart_backoff_ms = self.restart_backoff_ms.clamp(1, 10_000);
        self.max_consecutive_faults = self.max_consecutive_faults.clamp(1, 1_024);
        let nyquist = self.sample_rate as f32 / 2.0;
        self.synthetic_tone_hz = if self.synthetic_tone_hz.is_finite() {
            self.synthetic_tone_hz.clamp(20.0, nyquist)
        } else {
            1_000.0
        };
        self.synthetic_amplitude = if self.synthetic_amplitude.is_finite() {
            self.synthetic_amplitude.clamp(0.0, 1.0)
        } else {
            0.25
        };
    }

    /// Command-line flags win over file values.
    pub fn apply_overrides(&mut self, args: &CliArgs) {
        if let Some(backend) = &args.backend {
            self.backend = backend.clone();
        }
        if let Some(rate) = args.sample_rate {
            self.sample_rate = rate;
        }
        if let Some(block) = args.block_size {
            self.block_size = block;
        }
        if let Some(capacity) = args.capacity {
            self.buffer_capacity_frames = capacity;
        }
        self.normalize();
    }

    pub fn duplex_config(&self) -> DuplexConfig {
        DuplexConfig {
            sample_rate: self.sample_rate,
            channel_count: 1,
            block_size_hint: self.block_size,
            buffer_capacity_frames: self.buffer_capacity_frames,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_restart_attempts: self.max_restart_attempts,
            restart_backoff: Duration::from_millis(self.restart_backoff_ms),
            max_consecutive_faults: self.max_consecutive_faults,
            request_realtime_priority: self.realtime_priority,
        }
    }
}

pub fn normalize_backend(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "synthetic" | "synth" | "sim" | "simulated" => "synthetic".into(),
        _ => "cpal".into(),
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("loopback")
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
            .join("loopback")
            .join("settings.json")
    }
}

/// Lenient load for the default location: a missing or unreadable file
/// yields defaults.
pub fn load_settings(path: &Path) -> LoopbackSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<LoopbackSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

/// Strict load for a file named on the command line.
pub fn read_settings(path: &Path) -> Result<LoopbackSettings, LoopbackError> {
    let raw = fs::read_to_string(path)?;
    let mut settings = serde_json::from_str::<LoopbackSettings>(&raw).map_err(|e| {
        LoopbackError::InvalidConfig(format!("{}: {e}", path.display()))
    })?;
    settings.normalize();
    Ok(settings)
}

/// File (explicit or default) plus flag overrides.
pub fn resolve(args: &CliArgs) -> Result<(LoopbackSettings, PathBuf), LoopbackError> {
    let (mut settings, path) = match &args.config {
        Some(path) => (read_settings(path)?, path.clone()),
        None => {
            let path = default_settings_path();
            (load_settings(&path), path)
        }
    };
    settings.apply_overrides(args);
    Ok((settings, path))
}
