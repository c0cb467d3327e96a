//! Driver configuration, loaded from and saved to TOML.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bus::LinkTiming;
use crate::dispatch::DispatchConfig;
use crate::firmware::FirmwareConfig;

/// Physical wiring. Fixed for the lifetime of a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// spidev node, e.g. `/dev/spidev1.0`.
    pub spi_device: String,
    /// SPI clock in Hz.
    pub spi_clock_hz: u32,
    /// GPIO character device holding the control lines.
    pub gpio_chip: String,
    /// Chip-select line offset (active-low).
    pub select_pin: u32,
    /// Chip-enable line offset (active-high).
    pub enable_pin: u32,
    /// Interrupt line offset.
    pub irq_pin: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            spi_device: "/dev/spidev1.0".to_string(),
            spi_clock_hz: 1_000_000,
            gpio_chip: "/dev/gpiochip0".to_string(),
            select_pin: 5,
            enable_pin: 18,
            irq_pin: 22,
        }
    }
}

/// Complete driver configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub hardware: HardwareConfig,
    pub link: LinkTiming,
    pub dispatch: DispatchConfig,
    pub firmware: FirmwareConfig,
}

impl DriverConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: DriverConfig = toml::from_str(
            r#"
            [hardware]
            spi_device = "/dev/spidev0.1"
            irq_pin = 17

            [dispatch]
            notification_timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.hardware.spi_device, "/dev/spidev0.1");
        assert_eq!(config.hardware.irq_pin, 17);
        assert_eq!(config.hardware.select_pin, 5);
        assert_eq!(config.dispatch.notification_timeout_ms, 500);
        assert_eq!(config.dispatch.frame_len, 10);
        assert_eq!(config.link.enable_stabilize_ms, 10);
        assert_eq!(config.firmware.chunk_size, 256);
        assert_eq!(config.firmware.max_attempts, 3);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("uci-config-{}.toml", std::process::id()));
        let mut config = DriverConfig::default();
        config.hardware.spi_clock_hz = 4_000_000;
        config.firmware.image_path = Some("fw/sr150.bin".to_string());

        config.save_to_file(&path).unwrap();
        let loaded = DriverConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.hardware.spi_clock_hz, 4_000_000);
        assert_eq!(loaded.firmware.image_path.as_deref(), Some("fw/sr150.bin"));
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = DriverConfig::load_from_file("/nonexistent/uci.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/uci.toml"));
    }
}
