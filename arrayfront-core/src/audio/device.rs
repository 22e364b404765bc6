//! Audio device enumeration.

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio-cpal")]
use crate::error::{ArrayError, Result};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Largest channel count any supported input config offers.
    pub max_channels: u16,
    /// Whether the device can deliver the configured mic channel count.
    pub is_array_capable: bool,
}

/// Pick the device to capture from.
///
/// An exact name match wins. Otherwise the default device is used if it can
/// supply `required_channels`, then the array-capable device with the most
/// channels.
pub fn pick_array_device<'a>(
    devices: &'a [DeviceInfo],
    preferred: Option<&str>,
    required_channels: u16,
) -> Option<&'a DeviceInfo> {
    if let Some(name) = preferred {
        if let Some(d) = devices.iter().find(|d| d.name == name) {
            return Some(d);
        }
        tracing::warn!("preferred input device '{}' not found, falling back", name);
    }
    let capable = || devices.iter().filter(|d| d.max_channels >= required_channels);
    capable()
        .find(|d| d.is_default)
        .or_else(|| capable().max_by_key(|d| d.max_channels))
}

#[cfg(feature = "audio-cpal")]
fn max_input_channels(device: &cpal::Device) -> u16 {
    use cpal::traits::DeviceTrait;

    device
        .supported_input_configs()
        .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

/// List all available audio input devices, flagging those that can supply
/// `required_channels`.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices(required_channels: u16) -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => {
            let mut list = devices
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                    let max_channels = max_input_channels(&device);
                    DeviceInfo {
                        is_default: default_name.as_deref() == Some(name.as_str()),
                        name,
                        max_channels,
                        is_array_capable: max_channels >= required_channels,
                    }
                })
                .collect::<Vec<_>>();

            list.sort_by_key(|d| {
                (
                    !d.is_array_capable,
                    !d.is_default,
                    d.name.to_ascii_lowercase(),
                )
            });
            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            vec![]
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices(_required_channels: u16) -> Vec<DeviceInfo> {
    vec![]
}

/// Resolve a cpal input device by the rules of [`pick_array_device`].
#[cfg(feature = "audio-cpal")]
pub(crate) fn find_input_device(
    host: &cpal::Host,
    preferred: Option<&str>,
    required_channels: u16,
) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let devices = list_input_devices(required_channels);
    let chosen = pick_array_device(&devices, preferred, required_channels)
        .map(|d| d.name.clone())
        .ok_or_else(|| {
            ArrayError::AudioDevice(format!(
                "no input device offers {required_channels} channels"
            ))
        })?;

    host.input_devices()
        .map_err(|e| ArrayError::AudioDevice(e.to_string()))?
        .find(|d| d.name().map(|n| n == chosen).unwrap_or(false))
        .ok_or(ArrayError::NoDefaultInputDevice)
}
