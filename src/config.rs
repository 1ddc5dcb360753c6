//! Configuration data model consumed by the server core.
//!
//! This module defines the typed shape of the JSON mapping/configuration
//! document and a thin `serde_json`-backed loader. It does not hand-roll a
//! parser: the document is loaded once at startup with `serde_json`, and
//! the hot dispatch path never touches the raw document afterwards (see
//! [`crate::mapping::Mapping::compile`]).
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_listen() -> (String, u16) {
    ("127.0.0.1".to_string(), 7890)
}

fn default_gamma() -> f64 {
    1.0
}

fn default_whitepoint() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

/// Scalar color-correction tuple: a gamma exponent plus a per-channel
/// whitepoint scale. Identity is `gamma = 1.0, whitepoint = [1, 1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorSpec {
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_whitepoint")]
    pub whitepoint: [f64; 3],
}

impl Default for ColorSpec {
    fn default() -> Self {
        ColorSpec {
            gamma: default_gamma(),
            whitepoint: default_whitepoint(),
        }
    }
}

/// One routing rule for a Fadecandy-style device: a contiguous run of
/// `pixel_count` OPC pixels starting at `first_opc_pixel` on `opc_channel`
/// land at `first_device_pixel` on the owning device. `constant_color`, when
/// present, ignores the OPC pixel stream entirely and always writes the
/// given RGB triplet across the range instead.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FcMapEntry {
    pub opc_channel: u8,
    #[serde(default)]
    pub first_opc_pixel: u16,
    #[serde(default)]
    pub first_device_pixel: u16,
    pub pixel_count: u16,
    #[serde(default)]
    pub constant_color: Option<(u8, u8, u8)>,
}

/// One routing rule for a DMX adapter: a single OPC pixel's color component
/// lands on a single DMX channel.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct DmxMapEntry {
    pub opc_channel: u8,
    pub opc_pixel: u16,
    pub component: Component,
    pub dmx_channel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    R,
    G,
    B,
}

/// A configured device binding. Internally tagged on `type`
/// (`{"type": "fadecandy", ...}` / `{"type": "enttec", ...}`), driving
/// which `DeviceDriver` gets to attach to it (see [`crate::devices`]).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceSpec {
    Fadecandy {
        #[serde(default)]
        serial: Option<String>,
        #[serde(default)]
        color: Option<ColorSpec>,
        #[serde(default)]
        map: Vec<FcMapEntry>,
    },
    Enttec {
        #[serde(default)]
        serial: Option<String>,
        #[serde(default)]
        color: Option<ColorSpec>,
        #[serde(default)]
        map: Vec<DmxMapEntry>,
    },
}

impl DeviceSpec {
    pub fn device_type(&self) -> DeviceType {
        match self {
            DeviceSpec::Fadecandy { .. } => DeviceType::Fadecandy,
            DeviceSpec::Enttec { .. } => DeviceType::Enttec,
        }
    }

    pub fn serial(&self) -> Option<&str> {
        match self {
            DeviceSpec::Fadecandy { serial, .. } | DeviceSpec::Enttec { serial, .. } => {
                serial.as_deref()
            }
        }
    }

    /// Resolve this device's effective color correction: its own override,
    /// falling back to the document's global `color`, falling back to
    /// identity. Per-device color is a full override, not composed with the
    /// global value.
    pub fn effective_color(&self, global: Option<ColorSpec>) -> ColorSpec {
        let own = match self {
            DeviceSpec::Fadecandy { color, .. } | DeviceSpec::Enttec { color, .. } => *color,
        };
        own.or(global).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Fadecandy,
    Enttec,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: (String, u16),
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub color: Option<ColorSpec>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            verbose: false,
            color: None,
            devices: Vec::new(),
        }
    }
}

/// Load and validate a configuration document from `path`.
///
/// Maps every failure into a plain `io::Error` with a descriptive message
/// rather than introducing a second error type for the one layer that can
/// actually terminate the process.
pub fn load_config(path: &Path) -> io::Result<Config> {
    let text = fs::read_to_string(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to read config file {}: {e}", path.display()),
        )
    })?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> io::Result<Config> {
    let config: Config = serde_json::from_str(text)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid config: {e}")))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> io::Result<()> {
    if config.listen.1 == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "listen port must be nonzero",
        ));
    }
    for device in &config.devices {
        if let Some(color) = match device {
            DeviceSpec::Fadecandy { color, .. } | DeviceSpec::Enttec { color, .. } => *color,
        } {
            if color.whitepoint.iter().any(|c| !(0.0..=1.0).contains(c)) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "whitepoint components must be within [0, 1]",
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_keys_absent() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.listen, ("127.0.0.1".to_string(), 7890));
        assert!(!config.verbose);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn parses_fadecandy_device_with_map() {
        let doc = r#"{
            "listen": ["0.0.0.0", 7891],
            "color": {"gamma": 2.5, "whitepoint": [1.0, 0.8, 0.6]},
            "devices": [
                {
                    "type": "fadecandy",
                    "serial": "FC001",
                    "map": [
                        {"opc_channel": 0, "first_opc_pixel": 0, "first_device_pixel": 0, "pixel_count": 64}
                    ]
                }
            ]
        }"#;
        let config = parse_config(doc).unwrap();
        assert_eq!(config.listen, ("0.0.0.0".to_string(), 7891));
        assert_eq!(config.devices.len(), 1);
        match &config.devices[0] {
            DeviceSpec::Fadecandy { serial, map, .. } => {
                assert_eq!(serial.as_deref(), Some("FC001"));
                assert_eq!(map.len(), 1);
                assert_eq!(map[0].pixel_count, 64);
            }
            _ => panic!("expected fadecandy device"),
        }
    }

    #[test]
    fn parses_enttec_device_with_map() {
        let doc = r#"{
            "devices": [
                {
                    "type": "enttec",
                    "map": [{"opc_channel": 0, "opc_pixel": 0, "component": "r", "dmx_channel": 0}]
                }
            ]
        }"#;
        let config = parse_config(doc).unwrap();
        match &config.devices[0] {
            DeviceSpec::Enttec { map, .. } => {
                assert_eq!(map[0].component, Component::R);
                assert_eq!(map[0].dmx_channel, 0);
            }
            _ => panic!("expected enttec device"),
        }
    }

    #[test]
    fn rejects_zero_port() {
        let err = parse_config(r#"{"listen": ["127.0.0.1", 0]}"#).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn effective_color_prefers_device_override() {
        let device = DeviceSpec::Fadecandy {
            serial: None,
            color: Some(ColorSpec {
                gamma: 2.2,
                whitepoint: [1.0, 1.0, 1.0],
            }),
            map: Vec::new(),
        };
        let global = Some(ColorSpec {
            gamma: 1.8,
            whitepoint: [0.9, 0.9, 0.9],
        });
        let resolved = device.effective_color(global);
        assert_eq!(resolved.gamma, 2.2);
    }

    #[test]
    fn effective_color_falls_back_to_global_then_identity() {
        let device = DeviceSpec::Enttec {
            serial: None,
            color: None,
            map: Vec::new(),
        };
        let global = Some(ColorSpec {
            gamma: 1.8,
            whitepoint: [0.9, 0.9, 0.9],
        });
        assert_eq!(device.effective_color(global).gamma, 1.8);
        assert_eq!(device.effective_color(None), ColorSpec::default());
    }
}
