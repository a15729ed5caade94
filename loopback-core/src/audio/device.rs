//! Audio device enumeration for the hosts' `--list-devices`.

use serde::{Deserialize, Serialize};

use crate::adapter::StreamDirection;

/// Metadata about one input or output device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: StreamDirection,
    /// Whether this is the system default for its direction. The engine
    /// only ever opens defaults.
    pub is_default: bool,
    pub default_sample_rate: Option<u32>,
    pub default_channels: Option<u16>,
    /// Whether the device can open an f32 stream at the queried rate, in
    /// mono or with the signal on its first channel.
    pub supports_f32_at_rate: bool,
    /// Heuristic flag for inputs that record the system output; looping one
    /// back to the speakers feeds back.
    pub is_monitor_like: bool,
}

/// Every device the default host reports, per direction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceList {
    pub inputs: Vec<DeviceInfo>,
    pub outputs: Vec<DeviceInfo>,
}

impl DeviceList {
    pub fn default_input(&self) -> Option<&DeviceInfo> {
        self.inputs.iter().find(|d| d.is_default)
    }

    pub fn default_output(&self) -> Option<&DeviceInfo> {
        self.outputs.iter().find(|d| d.is_default)
    }
}

const MONITOR_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "mixage stereo",
    "mezcla estereo",
];

/// Best-effort heuristic for capture devices that record the system output.
pub fn is_monitor_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    MONITOR_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Default first, then usable ones, then alphabetical.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| {
        (
            !d.is_default,
            !d.supports_f32_at_rate,
            d.name.to_ascii_lowercase(),
        )
    });
}

/// List all input and output devices of the default host.
///
/// `sample_rate` is the rate `supports_f32_at_rate` is checked against.
/// Enumeration errors are logged and yield an empty list for that direction.
#[cfg(feature = "audio-cpal")]
pub fn list_devices(sample_rate: u32) -> DeviceList {
    use cpal::traits::{DeviceTrait, HostTrait};

    use super::cpal_backend::{choose, Candidate};
    use crate::adapter::StreamParams;

    let host = cpal::default_host();
    let params = StreamParams {
        sample_rate,
        channels: 1,
        block_size_hint: 0,
    };

    let describe = |index: usize,
                    device: cpal::Device,
                    direction: StreamDirection,
                    default_name: Option<&str>| {
        let name = device
            .name()
            .unwrap_or_else(|_| format!("{} Device {}", direction, index + 1));
        let (default_config, ranges) = match direction {
            StreamDirection::Capture => (
                device.default_input_config().ok(),
                device
                    .supported_input_configs()
                    .map(|r| r.map(|range| Candidate::from(&range)).collect::<Vec<_>>()),
            ),
            StreamDirection::Playback => (
                device.default_output_config().ok(),
                device
                    .supported_output_configs()
                    .map(|r| r.map(|range| Candidate::from(&range)).collect::<Vec<_>>()),
            ),
        };
        let supports_f32_at_rate = ranges
            .map(|candidates| choose(&candidates, &params).is_some())
            .unwrap_or(false);
        DeviceInfo {
            is_default: default_name == Some(name.as_str()),
            is_monitor_like: direction == StreamDirection::Capture && is_monitor_like_name(&name),
            name,
            direction,
            default_sample_rate: default_config.as_ref().map(|c| c.sample_rate().0),
            default_channels: default_config.as_ref().map(|c| c.channels()),
            supports_f32_at_rate,
        }
    };

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let mut inputs = match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                describe(
                    idx,
                    device,
                    StreamDirection::Capture,
                    default_input.as_deref(),
                )
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    };

    let default_output = host.default_output_device().and_then(|d| d.name().ok());
    let mut outputs = match host.output_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                describe(
                    idx,
                    device,
                    StreamDirection::Playback,
                    default_output.as_deref(),
                )
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    };

    sort_devices(&mut inputs);
    sort_devices(&mut outputs);
    DeviceList { inputs, outputs }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices(_sample_rate: u32) -> DeviceList {
    DeviceList::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, is_default: bool, supports_f32_at_rate: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            direction: StreamDirection::Playback,
            is_default,
            default_sample_rate: Some(48_000),
            default_channels: Some(2),
            supports_f32_at_rate,
            is_monitor_like: false,
        }
    }

    #[test]
    fn detects_common_monitor_names() {
        assert!(is_monitor_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_monitor_like_name("Monitor of Built-in Audio Analog Stereo"));
        assert!(!is_monitor_like_name("Microphone Array (USB PnP Audio Device)"));
    }

    #[test]
    fn default_device_sorts_first() {
        let mut list = vec![
            device("b-speakers", false, true),
            device("HDMI", false, false),
            device("Headphones", true, true),
            device("a-speakers", false, true),
        ];
        sort_devices(&mut list);
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Headphones", "a-speakers", "b-speakers", "HDMI"]);

        let devices = DeviceList {
            inputs: Vec::new(),
            outputs: list,
        };
        assert_eq!(devices.default_output().map(|d| d.name.as_str()), Some("Headphones"));
        assert!(devices.default_input().is_none());
    }
}
