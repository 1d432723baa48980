//! Renderer configuration.
//!
//! Loaded from TOML at startup. Every field has a default so an empty file
//! (or no file at all) yields a usable configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

/// Fewest frame slots the scheduler will ask the platform for.
pub const MIN_FRAMES_IN_FLIGHT: u32 = 2;

/// Most frame slots the scheduler will ask the platform for.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 3;

/// Render configuration settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// Requested number of frame slots. The platform may return a different
    /// number of presentable images; the actual count always wins.
    pub frames_in_flight: u32,
    /// FIFO presentation when true, otherwise the lowest-latency mode available.
    pub vsync: bool,
    /// Enable the Khronos validation layer and route its messages to `log`.
    pub enable_validation: bool,
    /// Deadline for the per-slot fence wait in `acquire`, in nanoseconds.
    /// `u64::MAX` waits forever.
    pub fence_timeout_ns: u64,
    /// Optional path to a pipeline blueprint (JSON).
    pub blueprint: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            vsync: true,
            enable_validation: cfg!(debug_assertions),
            fence_timeout_ns: u64::MAX,
            blueprint: None,
            window_width: 1280,
            window_height: 720,
        }
    }
}

impl RenderConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file. Relative blueprint paths are resolved
    /// against the directory containing the config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;

        if let (Some(blueprint), Some(dir)) = (config.blueprint.as_mut(), path.parent()) {
            if blueprint.is_relative() {
                *blueprint = dir.join(&*blueprint);
            }
        }

        Ok(config)
    }

    /// Frame-slot count to request from the platform, clamped to 2..=3.
    pub fn requested_frame_count(&self) -> u32 {
        self.frames_in_flight.clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT)
    }
}
