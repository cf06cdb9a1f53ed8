//! The driver contract and the dispatch table.
//!
//! A driver is the per-vendor part of a session: it declares the transports
//! it accepts, runs the identify handshake, decodes key frames and encodes
//! display writes. Everything else (framing, the differential writer, retry
//! and lifecycle) is shared.
//!
//! | Code | Driver | Parameters |
//! |------|--------|------------|
//! | `ir` | Iris | none |
//! | `eu` | EuroBraille (Esys, Iris, Clio) | `protocol=auto\|esysiris\|clio` |
//! | `ts` | TSI (Navigator, Power Braille) | `highbaud=yes\|no` |
//! | `np` | NinePoint | none |

use std::collections::BTreeMap;

use serde::Serialize;

use crate::display::{DisplayWriter, FreshenPolicy};
use crate::drivers;
use crate::error::{BrailleError, Result};
use crate::keys::{Decoded, KeyState};
use crate::link::Link;
use crate::model::Identity;
use crate::transport::{ResourceDescriptor, TransportKind};

/// Per-vendor protocol logic.
pub trait Driver: Send {
    /// Connections this driver accepts.
    fn resource(&self) -> ResourceDescriptor;

    /// Largest frame the driver's reader must hold.
    fn packet_capacity(&self) -> usize;

    /// Run the identify handshake. Called once per connection.
    fn identify(&mut self, link: &mut Link) -> Result<Identity>;

    /// Decode the next frame. `Ok(None)` when no frame is available; a frame
    /// that yields nothing returns an empty [`Decoded`].
    fn read_input(&mut self, link: &mut Link, keys: &mut KeyState) -> Result<Option<Decoded>>;

    fn write_window(
        &mut self,
        link: &mut Link,
        display: &mut DisplayWriter,
        cells: &[u8],
    ) -> Result<()>;

    fn write_cursor(
        &mut self,
        _link: &mut Link,
        _display: &mut DisplayWriter,
        _cursor: Option<usize>,
    ) -> Result<()> {
        Ok(())
    }

    fn write_status(
        &mut self,
        _link: &mut Link,
        _display: &mut DisplayWriter,
        _status: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    /// Show `text`, one character per cell, on a model's text display.
    fn write_visual(&mut self, _link: &mut Link, _text: &[char]) -> Result<()> {
        Ok(())
    }

    /// Full-refresh policy once identified. `configured` is the host's
    /// preferred period.
    fn freshen(&self, _configured: u32) -> FreshenPolicy {
        FreshenPolicy::Never
    }

    /// Forget per-connection state before a reconnect.
    fn reset(&mut self);
}

/// Parsed `name=value,name=value` driver parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverParameters {
    values: BTreeMap<String, String>,
}

impl DriverParameters {
    /// Parse `text`, accepting only `names`. Names are case-insensitive.
    pub fn parse(text: &str, names: &[&str]) -> Result<Self> {
        let mut values = BTreeMap::new();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, value) = item.split_once('=').ok_or_else(|| {
                BrailleError::InvalidParameter {
                    name: item.to_string(),
                    value: String::new(),
                    expected: "name=value".to_string(),
                }
            })?;
            let name = name.trim().to_ascii_lowercase();
            if !names.contains(&name.as_str()) {
                let expected = if names.is_empty() {
                    "nothing (this driver takes no parameters)".to_string()
                } else {
                    format!("one of: {}", names.join(", "))
                };
                return Err(BrailleError::InvalidParameter {
                    name: "parameter name".to_string(),
                    value: name,
                    expected,
                });
            }
            values.insert(name, value.trim().to_string());
        }
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// A yes/no parameter, `default` when unset.
    pub fn flag(&self, name: &str, default: bool) -> Result<bool> {
        let Some(value) = self.get(name) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "yes" | "on" | "true" | "1" => Ok(true),
            "no" | "off" | "false" | "0" => Ok(false),
            _ => Err(BrailleError::InvalidParameter {
                name: name.to_string(),
                value: value.to_string(),
                expected: "yes or no".to_string(),
            }),
        }
    }

    /// One of `choices`, `choices[0]` when unset.
    pub fn choice(&self, name: &str, choices: &[&'static str]) -> Result<&'static str> {
        let Some(value) = self.get(name) else {
            return Ok(choices.first().copied().unwrap_or_default());
        };
        choices
            .iter()
            .copied()
            .find(|choice| choice.eq_ignore_ascii_case(value))
            .ok_or_else(|| BrailleError::InvalidParameter {
                name: name.to_string(),
                value: value.to_string(),
                expected: choices.join(", "),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One row of the dispatch table.
#[derive(Clone, Copy)]
pub struct DriverEntry {
    pub code: &'static str,
    pub name: &'static str,
    pub parameters: &'static [&'static str],
    pub create: fn(&DriverParameters) -> Result<Box<dyn Driver>>,
}

impl DriverEntry {
    /// Parse `text` against this driver's parameter names and build it.
    pub fn instantiate(&self, text: &str) -> Result<Box<dyn Driver>> {
        let parameters = DriverParameters::parse(text, self.parameters)?;
        (self.create)(&parameters)
    }

    pub fn info(&self) -> Result<DriverInfo> {
        let driver = (self.create)(&DriverParameters::default())?;
        Ok(DriverInfo {
            code: self.code,
            name: self.name,
            parameters: self.parameters.to_vec(),
            transports: driver.resource().kinds(),
        })
    }
}

impl std::fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverEntry")
            .field("code", &self.code)
            .field("name", &self.name)
            .finish()
    }
}

/// Listing form of a [`DriverEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    pub code: &'static str,
    pub name: &'static str,
    pub parameters: Vec<&'static str>,
    pub transports: Vec<TransportKind>,
}

pub static DRIVER_TABLE: &[DriverEntry] = &[
    DriverEntry {
        code: "ir",
        name: "Iris",
        parameters: &[],
        create: drivers::iris::create,
    },
    DriverEntry {
        code: "eu",
        name: "EuroBraille",
        parameters: &["protocol"],
        create: drivers::eurobraille::create,
    },
    DriverEntry {
        code: "ts",
        name: "TSI",
        parameters: &["highbaud"],
        create: drivers::tsi::create,
    },
    DriverEntry {
        code: "np",
        name: "NinePoint",
        parameters: &[],
        create: drivers::ninepoint::create,
    },
];

pub fn find_driver(code: &str) -> Result<&'static DriverEntry> {
    DRIVER_TABLE
        .iter()
        .find(|entry| entry.code.eq_ignore_ascii_case(code))
        .ok_or_else(|| BrailleError::UnknownDriver(code.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parameters() {
        let parameters = DriverParameters::parse(" highbaud = no ", &["highbaud"]).unwrap();
        assert_eq!(parameters.get("highbaud"), Some("no"));
        assert!(!parameters.flag("highbaud", true).unwrap());
        assert!(DriverParameters::parse("", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_parameter_lists_valid_names() {
        let error = DriverParameters::parse("speed=fast", &["highbaud"]).unwrap_err();
        match error {
            BrailleError::InvalidParameter {
                value, expected, ..
            } => {
                assert_eq!(value, "speed");
                assert!(expected.contains("highbaud"));
            }
            other => panic!("expected InvalidParameter, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_equals_is_rejected() {
        assert!(matches!(
            DriverParameters::parse("highbaud", &["highbaud"]),
            Err(BrailleError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_flag_values() {
        for (text, expected) in [("yes", true), ("ON", true), ("0", false), ("off", false)] {
            let parameters =
                DriverParameters::parse(&format!("highbaud={}", text), &["highbaud"]).unwrap();
            assert_eq!(parameters.flag("highbaud", !expected).unwrap(), expected);
        }
        let parameters = DriverParameters::parse("highbaud=maybe", &["highbaud"]).unwrap();
        assert!(parameters.flag("highbaud", true).is_err());
        assert!(DriverParameters::default().flag("highbaud", true).unwrap());
    }

    #[test]
    fn test_choice() {
        let choices = ["auto", "esysiris", "clio"];
        let parameters = DriverParameters::parse("protocol=Clio", &["protocol"]).unwrap();
        assert_eq!(parameters.choice("protocol", &choices).unwrap(), "clio");
        assert_eq!(
            DriverParameters::default().choice("protocol", &choices).unwrap(),
            "auto"
        );
        let parameters = DriverParameters::parse("protocol=morse", &["protocol"]).unwrap();
        assert!(parameters.choice("protocol", &choices).is_err());
    }

    #[test]
    fn test_find_driver() {
        assert_eq!(find_driver("ts").unwrap().name, "TSI");
        assert_eq!(find_driver("EU").unwrap().code, "eu");
        assert!(matches!(
            find_driver("zz"),
            Err(BrailleError::UnknownDriver(_))
        ));
    }

    #[test]
    fn test_every_driver_lists_transports() {
        for entry in DRIVER_TABLE {
            let info = entry.info().unwrap();
            assert!(
                !info.transports.is_empty(),
                "{} should accept at least one transport",
                entry.code
            );
        }
    }
}
