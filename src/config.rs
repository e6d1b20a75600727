// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section has defaults, so a missing file or a partial file both work.
// `validate` catches values the ring would reject later with a less helpful
// error.

use crate::backend::{DeviceDesc, WAIT_FOREVER};
use crate::present::PresentDesc;
use crate::ring::RingDesc;
use anyhow::{bail, Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub ring: RingConfig,
    pub present: PresentConfig,
    pub demo: DemoConfig,
    pub debug: DebugConfig,
}

/// Instance/device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    pub validation_layers: bool,
    /// Enable exportable (fd) semaphores for interop.
    pub external_semaphores: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "frame-pipeline".to_string(),
            validation_layers: cfg!(debug_assertions),
            external_semaphores: false,
        }
    }
}

/// Offscreen ring settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub depth: usize,
    pub width: u32,
    pub height: u32,
    pub color_format: String,
    pub depth_buffer: bool,
    pub readback: bool,
    /// Readback row pitch alignment in bytes.
    pub row_alignment: u32,
    /// Absent means fence waits never time out.
    pub fence_timeout_ms: Option<u64>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            width: 640,
            height: 480,
            color_format: "bgra8_unorm".to_string(),
            depth_buffer: false,
            readback: true,
            row_alignment: 256,
            fence_timeout_ms: None,
        }
    }
}

/// Swapchain settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PresentConfig {
    pub present_mode: String,
    pub acquire_timeout_ms: Option<u64>,
    pub clear_color: [f32; 4],
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            acquire_timeout_ms: None,
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// Headless demo settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub frames: u32,
    /// Drain every buffered frame after the last one is produced.
    pub flush_at_end: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 8,
            flush_at_end: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "frame_pipeline.log".to_string(),
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
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ring = &self.ring;
        if ring.depth == 0 {
            bail!("ring.depth must be at least 1");
        }
        if ring.width == 0 || ring.height == 0 {
            bail!("ring size {}x{} is empty", ring.width, ring.height);
        }
        if ring.row_alignment == 0 || ring.row_alignment % 4 != 0 {
            bail!("ring.row_alignment {} is not a non-zero multiple of 4", ring.row_alignment);
        }
        ring.format()?;
        Ok(())
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.present.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.present.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn device_desc(&self) -> DeviceDesc {
        DeviceDesc {
            app_name: self.device.app_name.clone(),
            validation: self.device.validation_layers,
            external_semaphores: self.device.external_semaphores,
            ..DeviceDesc::default()
        }
    }

    /// Swapchain adapter settings; depth and fence timeout come from `[ring]`.
    pub fn present_desc(&self) -> PresentDesc {
        PresentDesc {
            depth_format: self.ring.depth_buffer.then_some(vk::Format::D32_SFLOAT),
            acquire_timeout_ns: millis_to_nanos(self.present.acquire_timeout_ms),
            fence_timeout_ns: millis_to_nanos(self.ring.fence_timeout_ms),
            ..PresentDesc::default()
        }
    }
}

impl RingConfig {
    pub fn format(&self) -> Result<vk::Format> {
        Ok(match self.color_format.to_lowercase().as_str() {
            "bgra8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "bgra8_srgb" => vk::Format::B8G8R8A8_SRGB,
            "rgba8_unorm" => vk::Format::R8G8B8A8_UNORM,
            "rgba8_srgb" => vk::Format::R8G8B8A8_SRGB,
            other => bail!("unknown color format '{}'", other),
        })
    }

    pub fn to_desc(&self) -> Result<RingDesc> {
        Ok(RingDesc {
            depth: self.depth,
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
            color_format: self.format()?,
            depth_format: self.depth_buffer.then_some(vk::Format::D32_SFLOAT),
            readback: self.readback,
            row_alignment: self.row_alignment,
            fence_timeout_ns: millis_to_nanos(self.fence_timeout_ms),
            ..RingDesc::default()
        })
    }
}

pub fn millis_to_nanos(ms: Option<u64>) -> u64 {
    ms.map_or(WAIT_FOREVER, |ms| ms.saturating_mul(1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.ring.depth, 2);
        assert_eq!(config.demo.frames, 8);
        assert_eq!(config.ring.to_desc().unwrap().fence_timeout_ns, WAIT_FOREVER);
    }

    #[test]
    fn ring_section_maps_to_desc() {
        let config = Config::parse(
            r#"
            [ring]
            depth = 3
            width = 32
            height = 16
            color_format = "rgba8_unorm"
            depth_buffer = true
            row_alignment = 64
            fence_timeout_ms = 250
            "#,
        )
        .unwrap();
        let desc = config.ring.to_desc().unwrap();
        assert_eq!(desc.depth, 3);
        assert_eq!(desc.extent, vk::Extent2D { width: 32, height: 16 });
        assert_eq!(desc.color_format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(desc.depth_format, Some(vk::Format::D32_SFLOAT));
        assert_eq!(desc.row_alignment, 64);
        assert_eq!(desc.fence_timeout_ns, 250_000_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::parse("[ring]\ndepth = 0").is_err());
        assert!(Config::parse("[ring]\nrow_alignment = 6").is_err());
        assert!(Config::parse("[ring]\ncolor_format = \"r5g6b5\"").is_err());
        assert!(Config::parse("[ring]\nwidth = 0").is_err());
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::parse("[present]\npresent_mode = \"sideways\"").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        let config =
            Config::parse("[present]\npresent_mode = \"Mailbox\"\nacquire_timeout_ms = 5").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        let desc = config.present_desc();
        assert_eq!(desc.acquire_timeout_ns, 5_000_000);
        assert_eq!(desc.fence_timeout_ns, WAIT_FOREVER);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.debug.log_level, "info");
    }
}
