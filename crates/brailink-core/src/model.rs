//! Static model tables and the identity a session reports.

use serde::{Deserialize, Serialize};

/// One entry of a driver's model table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub name: &'static str,
    pub cells: usize,
    pub status_cells: usize,
    /// Name of the key table a key-table engine should load.
    pub key_table: &'static str,
    pub routing_keys: bool,
    /// Extra settle time after a display write, in driver-defined levels.
    pub slow_update: u8,
    /// Whether the model can be switched to a faster line speed.
    pub high_baud: bool,
}

impl ModelDescriptor {
    pub const fn new(name: &'static str, cells: usize, key_table: &'static str) -> Self {
        Self {
            name,
            cells,
            status_cells: 0,
            key_table,
            routing_keys: false,
            slow_update: 0,
            high_baud: false,
        }
    }

    pub const fn with_status_cells(mut self, count: usize) -> Self {
        self.status_cells = count;
        self
    }

    pub const fn with_routing_keys(mut self) -> Self {
        self.routing_keys = true;
        self
    }

    pub const fn with_slow_update(mut self, level: u8) -> Self {
        self.slow_update = level;
        self
    }

    pub const fn with_high_baud(mut self) -> Self {
        self.high_baud = true;
        self
    }

    /// Some models report their own cell count.
    pub const fn with_cells(mut self, cells: usize) -> Self {
        self.cells = cells;
        self
    }

    /// Highest routing key number.
    pub fn last_routing_key(&self) -> u16 {
        self.cells.saturating_sub(1) as u16
    }

    pub fn identity(&self) -> Identity {
        Identity {
            model: self.name.to_string(),
            cells: self.cells,
            status_cells: self.status_cells,
            key_table: self.key_table.to_string(),
            firmware: None,
        }
    }
}

/// What identification found out about the connected display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub model: String,
    pub cells: usize,
    pub status_cells: usize,
    pub key_table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

impl Identity {
    pub fn with_firmware(mut self, firmware: impl Into<String>) -> Self {
        self.firmware = Some(firmware.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_identity() {
        let model = ModelDescriptor::new("Power Braille 80", 81, "pb65_pb81")
            .with_routing_keys()
            .with_slow_update(2)
            .with_high_baud();
        assert_eq!(model.last_routing_key(), 80);
        assert!(model.routing_keys && model.high_baud);

        let identity = model.identity().with_firmware("1.2");
        assert_eq!(identity.model, "Power Braille 80");
        assert_eq!(identity.cells, 81);
        assert_eq!(identity.key_table, "pb65_pb81");
        assert_eq!(identity.firmware.as_deref(), Some("1.2"));
    }

    #[test]
    fn test_identity_json_omits_missing_firmware() {
        let identity = ModelDescriptor::new("NinePoint", 8, "all").identity();
        let json = serde_json::to_string(&identity).expect("identity serializes");
        assert!(!json.contains("firmware"));
        let parsed: Identity = serde_json::from_str(&json).expect("identity parses");
        assert_eq!(parsed, identity);
    }
}
