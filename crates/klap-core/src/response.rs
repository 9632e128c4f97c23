//! Typed response structures for decrypted device replies.
//!
//! Every reply is `{"error_code": <i32>, "result": {...}}`; an error code of 0
//! means success. [`DeviceInfo`] mirrors the raw `get_device_info` result and
//! [`DeviceSnapshot`] is the normalized view handed to callers.
//!
//! # Example
//!
//! ```
//! use klap_core::response::{DeviceInfo, ResponseEnvelope};
//!
//! let json = r#"{"error_code":0,"result":{"device_id":"abc","model":"L530","device_on":true}}"#;
//! let envelope: ResponseEnvelope = serde_json::from_str(json).unwrap();
//! let info: DeviceInfo = serde_json::from_value(envelope.result).unwrap();
//! assert!(info.device_on);
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decrypted reply envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseEnvelope {
    /// Application error code (0 = success).
    pub error_code: i32,
    /// Method result; `null` for setters.
    #[serde(default)]
    pub result: Value,
}

impl ResponseEnvelope {
    /// Returns true if the device reported success.
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

/// Raw `get_device_info` result.
///
/// Only the fields this library reads are listed; anything else the device
/// sends is ignored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceInfo {
    /// Unique device ID.
    #[serde(default)]
    pub device_id: String,

    /// User-assigned name, base64-encoded by the device.
    #[serde(default)]
    pub nickname: String,

    /// Device model (e.g., "P110", "L530").
    #[serde(default)]
    pub model: String,

    /// Device type identifier (e.g., "SMART.TAPOBULB").
    #[serde(default, rename = "type")]
    pub device_type: String,

    /// Whether the device is switched on.
    #[serde(default)]
    pub device_on: bool,

    /// Brightness 1-100, absent on plugs.
    #[serde(default)]
    pub brightness: Option<u32>,

    /// Color temperature in Kelvin; 0 while in color mode.
    #[serde(default)]
    pub color_temp: Option<u32>,

    /// Hue 0-360, absent on non-color devices.
    #[serde(default)]
    pub hue: Option<u16>,

    /// Saturation 0-100, absent on non-color devices.
    #[serde(default)]
    pub saturation: Option<u8>,

    /// Signal strength bucket (0-3).
    #[serde(default)]
    pub signal_level: Option<i32>,

    /// WiFi signal strength in dBm.
    #[serde(default)]
    pub rssi: Option<i32>,

    /// MAC address.
    #[serde(default)]
    pub mac: String,

    /// Firmware version.
    #[serde(default)]
    pub fw_ver: String,
}

impl DeviceInfo {
    /// Returns the nickname decoded from base64.
    ///
    /// Falls back to the raw value when it isn't valid base64 UTF-8.
    pub fn decoded_nickname(&self) -> String {
        STANDARD
            .decode(&self.nickname)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| self.nickname.clone())
    }
}

/// Normalized device state returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Unique device ID.
    pub id: String,
    /// Decoded user-assigned name.
    pub name: String,
    /// Device model.
    pub model: String,
    /// Whether the device is switched on.
    pub is_on: bool,
    /// Brightness 1-100, if supported.
    pub brightness: Option<u32>,
    /// Color temperature in Kelvin, if supported.
    pub color_temp: Option<u32>,
    /// Hue 0-360, if supported.
    pub hue: Option<u16>,
    /// Saturation 0-100, if supported.
    pub saturation: Option<u8>,
    /// Signal strength bucket, if reported.
    pub signal_level: Option<i32>,
    /// WiFi signal strength in dBm, if reported.
    pub rssi: Option<i32>,
}

impl From<DeviceInfo> for DeviceSnapshot {
    fn from(info: DeviceInfo) -> Self {
        Self {
            name: info.decoded_nickname(),
            id: info.device_id,
            model: info.model,
            is_on: info.device_on,
            brightness: info.brightness,
            color_temp: info.color_temp,
            hue: info.hue,
            saturation: info.saturation,
            signal_level: info.signal_level,
            rssi: info.rssi,
        }
    }
}
