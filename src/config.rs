// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use std::path::Path;

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;

use crate::backend::PresentationConfig;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "swapframe".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub vsync: bool,
    pub msaa_samples: u32,
    /// Empty string means "pick automatically".
    pub color_format: String,
    pub depth_format: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            msaa_samples: 1,
            color_format: String::new(),
            depth_format: String::new(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
            acquire_timeout_ms: 1000,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "swapframe.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Presentation settings for `Presenter::new`
    pub fn presentation(&self) -> PresentationConfig {
        PresentationConfig {
            vsync: self.graphics.vsync,
            sample_count: sample_count(self.graphics.msaa_samples),
            color_format: format_setting(&self.graphics.color_format, "color_format", parse_color_format),
            depth_format: format_setting(&self.graphics.depth_format, "depth_format", parse_depth_format),
        }
    }

    pub fn acquire_timeout_ns(&self) -> u64 {
        self.graphics.acquire_timeout_ms.saturating_mul(1_000_000)
    }
}

fn format_setting(name: &str, key: &str, parse: fn(&str) -> Option<vk::Format>) -> Option<vk::Format> {
    if name.trim().is_empty() {
        return None;
    }
    let format = parse(name);
    if format.is_none() {
        log::warn!("Unknown {} '{}', choosing automatically", key, name);
    }
    format
}

/// Sample count from a config value, rounded down to a power of two in 1..=64.
pub fn sample_count(samples: u32) -> vk::SampleCountFlags {
    let clamped = samples.clamp(1, 64);
    let rounded = 1 << (31 - clamped.leading_zeros());
    if rounded != samples {
        log::warn!("msaa_samples = {} is not valid, using {}", samples, rounded);
    }
    vk::SampleCountFlags::from_raw(rounded)
}

/// Get color format as Vulkan enum
pub fn parse_color_format(name: &str) -> Option<vk::Format> {
    match name.to_lowercase().as_str() {
        "bgra8_srgb" => Some(vk::Format::B8G8R8A8_SRGB),
        "rgba8_srgb" => Some(vk::Format::R8G8B8A8_SRGB),
        "bgra8_unorm" => Some(vk::Format::B8G8R8A8_UNORM),
        "rgba8_unorm" => Some(vk::Format::R8G8B8A8_UNORM),
        "rgb10a2_unorm" => Some(vk::Format::A2B10G10R10_UNORM_PACK32),
        "rgba16_sfloat" => Some(vk::Format::R16G16B16A16_SFLOAT),
        _ => None,
    }
}

/// Get depth format as Vulkan enum
pub fn parse_depth_format(name: &str) -> Option<vk::Format> {
    match name.to_lowercase().as_str() {
        "d32_sfloat" => Some(vk::Format::D32_SFLOAT),
        "d32_sfloat_s8_uint" => Some(vk::Format::D32_SFLOAT_S8_UINT),
        "d24_unorm_s8_uint" => Some(vk::Format::D24_UNORM_S8_UINT),
        "d16_unorm" => Some(vk::Format::D16_UNORM),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert!(config.graphics.vsync);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.presentation(), PresentationConfig::default());
    }

    #[test]
    fn graphics_section_maps_to_presentation() {
        let config = Config::parse(
            r#"
            [graphics]
            vsync = false
            msaa_samples = 4
            color_format = "RGBA8_SRGB"
            depth_format = "d24_unorm_s8_uint"
            acquire_timeout_ms = 250
            "#,
        )
        .unwrap();

        let presentation = config.presentation();
        assert!(!presentation.vsync);
        assert_eq!(presentation.sample_count, vk::SampleCountFlags::TYPE_4);
        assert_eq!(presentation.color_format, Some(vk::Format::R8G8B8A8_SRGB));
        assert_eq!(presentation.depth_format, Some(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(config.acquire_timeout_ns(), 250_000_000);
        // Untouched sections keep their defaults
        assert_eq!(config.window.title, "swapframe");
    }

    #[test]
    fn unknown_format_names_fall_back_to_automatic() {
        let config = Config::parse("[graphics]\ncolor_format = \"neon\"\ndepth_format = \"deep\"").unwrap();
        let presentation = config.presentation();
        assert_eq!(presentation.color_format, None);
        assert_eq!(presentation.depth_format, None);
    }

    #[test]
    fn sample_counts_round_down_to_power_of_two() {
        assert_eq!(sample_count(0), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count(3), vk::SampleCountFlags::TYPE_2);
        assert_eq!(sample_count(6), vk::SampleCountFlags::TYPE_4);
        assert_eq!(sample_count(8), vk::SampleCountFlags::TYPE_8);
        assert_eq!(sample_count(100), vk::SampleCountFlags::TYPE_64);
    }

    #[test]
    fn broken_file_is_an_error() {
        assert!(Config::parse("[graphics\nvsync = maybe").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.debug.log_file, "swapframe.log");
    }
}
