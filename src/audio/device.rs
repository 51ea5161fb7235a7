//! Audio device enumeration
//!
//! Device IDs are opaque strings of the form `input:<name>` or
//! `output:<name>`. The media session receives them unchanged.

use crate::protocol::AudioDeviceInfo;

const INPUT_PREFIX: &str = "input:";
const OUTPUT_PREFIX: &str = "output:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
}

/// Build the ID a device is listed under
pub fn device_id(kind: DeviceKind, name: &str) -> String {
    match kind {
        DeviceKind::Input => format!("{}{}", INPUT_PREFIX, name),
        DeviceKind::Output => format!("{}{}", OUTPUT_PREFIX, name),
    }
}

/// Split a device ID into its kind and name. IDs without a prefix are
/// treated as capture devices.
pub fn parse_device_id(id: &str) -> (DeviceKind, &str) {
    if let Some(name) = id.strip_prefix(INPUT_PREFIX) {
        (DeviceKind::Input, name)
    } else if let Some(name) = id.strip_prefix(OUTPUT_PREFIX) {
        (DeviceKind::Output, name)
    } else {
        (DeviceKind::Input, id)
    }
}

/// List all available audio devices
#[cfg(feature = "host-audio")]
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(inputs) => {
            for device in inputs {
                let Ok(name) = device.name() else { continue };
                devices.push(AudioDeviceInfo {
                    id: device_id(DeviceKind::Input, &name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                });
            }
        }
        Err(e) => tracing::warn!("Failed to enumerate input devices: {}", e),
    }

    match host.output_devices() {
        Ok(outputs) => {
            for device in outputs {
                let Ok(name) = device.name() else { continue };
                let is_default = default_output_name.as_ref() == Some(&name);

                // Duplex devices are listed once under their input ID
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }
                devices.push(AudioDeviceInfo {
                    id: device_id(DeviceKind::Output, &name),
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                });
            }
        }
        Err(e) => tracing::warn!("Failed to enumerate output devices: {}", e),
    }

    devices
}

/// List all available audio devices. Without host audio there are none.
#[cfg(not(feature = "host-audio"))]
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    tracing::debug!("Host audio disabled; no devices to list");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefixed_ids() {
        assert_eq!(
            parse_device_id("input:USB Headset"),
            (DeviceKind::Input, "USB Headset")
        );
        assert_eq!(
            parse_device_id("output:Speakers"),
            (DeviceKind::Output, "Speakers")
        );
    }

    #[test]
    fn test_unprefixed_id_is_capture() {
        assert_eq!(parse_device_id("default"), (DeviceKind::Input, "default"));
    }

    #[test]
    fn test_device_id_round_trips_names_with_colons() {
        let id = device_id(DeviceKind::Output, "hw:1,0");
        assert_eq!(id, "output:hw:1,0");
        assert_eq!(parse_device_id(&id), (DeviceKind::Output, "hw:1,0"));
    }

    #[cfg(not(feature = "host-audio"))]
    #[test]
    fn test_no_devices_without_host_audio() {
        assert!(list_devices().is_empty());
    }
}
