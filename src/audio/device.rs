//! Audio device enumeration and validation.

use crate::error::{Result, VocalsError};
use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which side of the audio path a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Position in the host's device list for this direction.
    pub index: usize,
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: Direction,
    /// Whether this is the host default for its direction.
    pub is_default: bool,
    /// Largest channel count across supported configurations.
    pub max_channels: u16,
    /// Sample rate of the default configuration, 0 if unknown.
    pub default_sample_rate: u32,
    /// Inclusive sample rate ranges the device accepts.
    pub sample_rate_ranges: Vec<(u32, u32)>,
}

impl DeviceInfo {
    pub fn supports(&self, channels: u16, sample_rate: u32) -> bool {
        channels <= self.max_channels
            && self
                .sample_rate_ranges
                .iter()
                .any(|(min, max)| (*min..=*max).contains(&sample_rate))
    }
}

/// Enumerates devices on the default cpal host.
#[derive(Debug, Default, Clone)]
pub struct DeviceManager;

impl DeviceManager {
    pub fn new() -> Self {
        Self
    }

    pub fn list_input_devices(&self) -> Result<Vec<DeviceInfo>> {
        list(Direction::Input)
    }

    pub fn list_output_devices(&self) -> Result<Vec<DeviceInfo>> {
        list(Direction::Output)
    }

    pub fn default_input_device(&self) -> Result<Option<DeviceInfo>> {
        Ok(list(Direction::Input)?.into_iter().find(|d| d.is_default))
    }

    pub fn default_output_device(&self) -> Result<Option<DeviceInfo>> {
        Ok(list(Direction::Output)?.into_iter().find(|d| d.is_default))
    }

    pub fn device_by_index(&self, index: usize, direction: Direction) -> Result<Option<DeviceInfo>> {
        Ok(list(direction)?.into_iter().find(|d| d.index == index))
    }

    /// Case-insensitive substring match on the device name
    pub fn device_by_name(&self, name: &str, direction: Direction) -> Result<Option<DeviceInfo>> {
        let needle = name.to_ascii_lowercase();
        Ok(list(direction)?
            .into_iter()
            .find(|d| d.name.to_ascii_lowercase().contains(&needle)))
    }

    /// Check that a device exists and accepts the channel count and rate.
    pub fn validate_device(
        &self,
        index: usize,
        channels: u16,
        sample_rate: u32,
        direction: Direction,
    ) -> Result<DeviceInfo> {
        let device = self.device_by_index(index, direction)?.ok_or_else(|| {
            VocalsError::audio_device(format!("no {:?} device at index {}", direction, index))
                .with_detail("device_index", index)
        })?;

        if !device.supports(channels, sample_rate) {
            return Err(VocalsError::audio_device(format!(
                "device '{}' does not support {} channel(s) at {} Hz",
                device.name, channels, sample_rate
            ))
            .with_detail("device_index", index)
            .with_detail("max_channels", device.max_channels)
            .with_detail("sample_rate", sample_rate));
        }

        Ok(device)
    }
}

fn list(direction: Direction) -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let (default_name, devices): (Option<String>, Vec<cpal::Device>) = match direction {
        Direction::Input => (
            host.default_input_device().and_then(|d| d.name().ok()),
            host.input_devices()?.collect(),
        ),
        Direction::Output => (
            host.default_output_device().and_then(|d| d.name().ok()),
            host.output_devices()?.collect(),
        ),
    };

    Ok(devices
        .iter()
        .enumerate()
        .map(|(index, device)| describe(index, device, direction, default_name.as_deref()))
        .collect())
}

fn describe(
    index: usize,
    device: &cpal::Device,
    direction: Direction,
    default_name: Option<&str>,
) -> DeviceInfo {
    let name = device
        .name()
        .unwrap_or_else(|_| format!("{:?} Device {}", direction, index + 1));

    let default_config = match direction {
        Direction::Input => device.default_input_config(),
        Direction::Output => device.default_output_config(),
    };
    let default_sample_rate = default_config.map(|c| c.sample_rate().0).unwrap_or(0);

    let ranges: Vec<(u16, u32, u32)> = match direction {
        Direction::Input => device.supported_input_configs().map(|configs| {
            configs
                .map(|c| (c.channels(), c.min_sample_rate().0, c.max_sample_rate().0))
                .collect()
        }),
        Direction::Output => device.supported_output_configs().map(|configs| {
            configs
                .map(|c| (c.channels(), c.min_sample_rate().0, c.max_sample_rate().0))
                .collect()
        }),
    }
    .unwrap_or_else(|e| {
        warn!("Failed to query configs for {}: {}", name, e);
        Vec::new()
    });

    DeviceInfo {
        index,
        is_default: default_name == Some(name.as_str()),
        name,
        direction,
        max_channels: ranges.iter().map(|r| r.0).max().unwrap_or(0),
        default_sample_rate,
        sample_rate_ranges: ranges.iter().map(|r| (r.1, r.2)).collect(),
    }
}

/// Resolve a cpal device by index, falling back to the host default
pub(crate) fn resolve(index: Option<usize>, direction: Direction) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let device = match (index, direction) {
        (Some(i), Direction::Input) => host.input_devices()?.nth(i),
        (Some(i), Direction::Output) => host.output_devices()?.nth(i),
        (None, Direction::Input) => host.default_input_device(),
        (None, Direction::Output) => host.default_output_device(),
    };

    device.ok_or_else(|| match index {
        Some(i) => VocalsError::audio_device(format!("no {:?} device at index {}", direction, i))
            .with_detail("device_index", i),
        None => VocalsError::audio_device(format!("no default {:?} device", direction)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_checks_channels_and_rate() {
        let info = DeviceInfo {
            index: 0,
            name: "Built-in Microphone".to_string(),
            direction: Direction::Input,
            is_default: true,
            max_channels: 2,
            default_sample_rate: 48000,
            sample_rate_ranges: vec![(8000, 48000)],
        };

        assert!(info.supports(1, 24000));
        assert!(info.supports(2, 48000));
        assert!(!info.supports(4, 24000));
        assert!(!info.supports(1, 96000));
    }
}
