//! Command envelopes sent over the encrypted request channel.
//!
//! Every request is a JSON object `{"method": ..., "params": ...}`. This module
//! builds the envelopes for the operations the library exposes, clamping
//! values into the ranges devices accept.
//!
//! # Example
//!
//! ```
//! use klap_core::commands;
//!
//! let request = commands::set_brightness(150);
//! assert_eq!(request.method, "set_device_info");
//! assert_eq!(request.params.unwrap()["brightness"], 100);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Get device information and current state.
pub const GET_DEVICE_INFO: &str = "get_device_info";

/// Update device state (power, brightness, color).
pub const SET_DEVICE_INFO: &str = "set_device_info";

/// Lowest brightness accepted by devices (0 is rejected; use power off).
pub const MIN_BRIGHTNESS: u32 = 1;

/// Highest brightness accepted by devices.
pub const MAX_BRIGHTNESS: u32 = 100;

/// Lower bound of the color temperature range in Kelvin.
pub const MIN_COLOR_TEMP: u32 = 2000;

/// Upper bound of the color temperature range in Kelvin.
pub const MAX_COLOR_TEMP: u32 = 9000;

/// Upper bound of hue in degrees.
pub const MAX_HUE: u16 = 360;

/// Upper bound of saturation in percent.
pub const MAX_SATURATION: u8 = 100;

/// A command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method name, e.g. `get_device_info`.
    pub method: String,
    /// Method parameters, omitted when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Creates an envelope with no parameters.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
        }
    }

    /// Attaches parameters to the envelope.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Serializes the envelope to the bytes that get encrypted.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// `get_device_info`
pub fn get_device_info() -> Request {
    Request::new(GET_DEVICE_INFO)
}

/// `set_device_info` with arbitrary parameters.
pub fn set_device_info(params: Value) -> Request {
    Request::new(SET_DEVICE_INFO).with_params(params)
}

/// Turn the device on or off.
pub fn set_power(on: bool) -> Request {
    set_device_info(json!({ "device_on": on }))
}

/// Set brightness, clamped to `[1, 100]`.
pub fn set_brightness(brightness: u32) -> Request {
    set_device_info(json!({ "brightness": clamp_brightness(brightness) }))
}

/// Set hue and saturation.
///
/// `color_temp` is forced to 0 alongside, otherwise bulbs stay in white mode
/// and ignore the color.
pub fn set_hue_saturation(hue: u16, saturation: u8) -> Request {
    set_device_info(json!({
        "hue": hue.min(MAX_HUE),
        "saturation": saturation.min(MAX_SATURATION),
        "color_temp": 0,
    }))
}

/// Set color temperature, clamped to `[2000, 9000]` Kelvin.
pub fn set_color_temp(kelvin: u32) -> Request {
    set_device_info(json!({ "color_temp": clamp_color_temp(kelvin) }))
}

/// Clamp brightness into the accepted range.
pub fn clamp_brightness(brightness: u32) -> u32 {
    brightness.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS)
}

/// Clamp color temperature into the accepted range.
pub fn clamp_color_temp(kelvin: u32) -> u32 {
    kelvin.clamp(MIN_COLOR_TEMP, MAX_COLOR_TEMP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_device_info_serialization() {
        let bytes = get_device_info().to_bytes().unwrap();
        assert_eq!(bytes, br#"{"method":"get_device_info"}"#);
    }

    #[test]
    fn test_set_power() {
        let request = set_power(true);
        assert_eq!(request.method, SET_DEVICE_INFO);
        assert_eq!(request.params, Some(json!({"device_on": true})));
    }

    #[test]
    fn test_brightness_clamped() {
        assert_eq!(set_brightness(150).params.unwrap()["brightness"], 100);
        assert_eq!(set_brightness(0).params.unwrap()["brightness"], 1);
        assert_eq!(set_brightness(55).params.unwrap()["brightness"], 55);
    }

    #[test]
    fn test_color_temp_clamped() {
        assert_eq!(set_color_temp(1500).params.unwrap()["color_temp"], 2000);
        assert_eq!(set_color_temp(12000).params.unwrap()["color_temp"], 9000);
        assert_eq!(set_color_temp(4000).params.unwrap()["color_temp"], 4000);
    }

    #[test]
    fn test_hue_saturation_zeroes_color_temp() {
        let params = set_hue_saturation(400, 120).params.unwrap();
        assert_eq!(params["hue"], 360);
        assert_eq!(params["saturation"], 100);
        assert_eq!(params["color_temp"], 0);
    }

    #[test]
    fn test_request_roundtrip_from_json() {
        let request: Request =
            serde_json::from_str(r#"{"method":"set_device_info","params":{"device_on":false}}"#)
                .unwrap();
        assert_eq!(request, set_power(false));
    }
}
