//! Audio subsystem module

pub mod device;

pub use device::{device_id, list_devices, parse_device_id, DeviceKind};
