//! Iris displays over their native serial protocol.
//!
//! Frames are `SOH payload EOT` with DLE stuffing. The device acknowledges
//! each display write with a bare ACK, and a new write is held back until the
//! previous one is acknowledged or the acknowledgement times out.
//!
//! Simulators may instead send fixed-length key reports
//! `SOH 'K' hi lo pressed`, which are never stuffed.

use std::time::Instant;

use tracing::{info, warn};

use crate::display::DisplayWriter;
use crate::driver::{Driver, DriverParameters};
use crate::error::{BrailleError, Result};
use crate::keys::{Command, Decoded, KeyQueue, KeySet, KeyState};
use crate::link::Link;
use crate::model::{Identity, ModelDescriptor};
use crate::packet::stuffing::{Unstuffer, ACK, SOH, SOH_EOT};
use crate::packet::{hex, PacketVerifier, Verdict};
use crate::session::{exchange, Reply};
use crate::transport::{Parity, ResourceDescriptor, SerialParameters};

/// Navigation key numbers.
pub mod key {
    pub const L1: u16 = 0;
    pub const L2: u16 = 1;
    pub const L3: u16 = 2;
    pub const L4: u16 = 3;
    pub const L5: u16 = 4;
    pub const L6: u16 = 5;
    pub const L7: u16 = 6;
    pub const L8: u16 = 7;
    pub const MENU: u16 = 8;
    pub const Z: u16 = 9;
    pub const DOT1: u16 = 10;
    pub const DOT8: u16 = 17;
    pub const BACKSPACE: u16 = 18;
    pub const SPACE: u16 = 19;
}

const INTERACTIVE_KEY: u8 = b'I';
const XT_KEY_CODE: u8 = b'U';
const LINEAR_KEYS: u8 = b'L';
const BRAILLE_KEYS: u8 = b'B';
const KEY_REPORT: u8 = b'K';
const VERSION: u8 = b'V';
const SERIAL_NUMBER: u8 = b'S';
const WRITE_BRAILLE: u8 = b'B';

const KEY_REPORT_LENGTH: usize = 5;
const SERIAL_NUMBER_LENGTH: usize = 6;
/// Serial number response byte meaning "cell count not reported".
const NO_WINDOW_LENGTH: u8 = b'Y';
const MAXIMUM_WINDOW: usize = 40;

const SERIAL: SerialParameters = SerialParameters::new(57600).with_parity(Parity::Even);

static KB: ModelDescriptor = ModelDescriptor::new("Iris KB", 40, "pc").with_routing_keys();
static LARGE: ModelDescriptor = ModelDescriptor::new("Iris Large", 40, "brl").with_routing_keys();
static SMALL: ModelDescriptor = ModelDescriptor::new("Iris Small", 32, "brl").with_routing_keys();

fn model_for_type(code: u8) -> Option<&'static ModelDescriptor> {
    match code {
        b'a' | b'A' => Some(&KB),
        b'l' | b'L' => Some(&LARGE),
        b's' | b'S' => Some(&SMALL),
        _ => None,
    }
}

/// Stuffed frames, plus the unstuffed fixed-length key report.
#[derive(Debug, Clone)]
struct IrisVerifier {
    unstuffer: Unstuffer,
    key_report: bool,
}

impl IrisVerifier {
    fn new() -> Self {
        Self {
            unstuffer: Unstuffer::new(SOH_EOT),
            key_report: false,
        }
    }
}

impl PacketVerifier for IrisVerifier {
    fn verify(&mut self, bytes: &[u8], length: &mut usize) -> Verdict {
        if self.key_report {
            return Verdict::Include;
        }
        if bytes.len() == 2
            && bytes[0] == SOH
            && bytes[1] == KEY_REPORT
            && !self.unstuffer.escape_pending()
        {
            self.key_report = true;
            *length = KEY_REPORT_LENGTH;
            return Verdict::Include;
        }
        self.unstuffer.verify(bytes, length)
    }

    fn reset(&mut self) {
        self.key_report = false;
        self.unstuffer.reset();
    }
}

pub struct IrisDriver {
    verifier: IrisVerifier,
    model: ModelDescriptor,
    waiting_for_ack: bool,
    last_write: Option<Instant>,
}

pub fn create(_parameters: &DriverParameters) -> Result<Box<dyn Driver>> {
    Ok(Box::new(IrisDriver::new()))
}

impl IrisDriver {
    pub fn new() -> Self {
        Self {
            verifier: IrisVerifier::new(),
            model: LARGE,
            waiting_for_ack: false,
            last_write: None,
        }
    }

    fn note_acknowledgement(&mut self) {
        if self.verifier.unstuffer.take_control() == Some(ACK) {
            if !self.waiting_for_ack {
                warn!("unexpected acknowledgement");
            }
            self.waiting_for_ack = false;
        }
    }

    /// Send a one-byte request and return the payload of the matching
    /// response.
    fn request(&mut self, link: &mut Link, code: u8) -> Result<Vec<u8>> {
        let timing = link.timing().clone();
        let verifier = &mut self.verifier;
        let frame = exchange(
            link,
            timing.retry_limit,
            timing.identify_timeout(),
            |link| link.write_packet(&SOH_EOT.encode(&[code])).map(|_| true),
            |link| link.read_packet(&mut *verifier),
            |frame| match SOH_EOT.payload(frame).first() {
                Some(&first) if first == code => Reply::Done,
                _ => Reply::Unexpected,
            },
        )?
        .ok_or(BrailleError::IdentifyTimeout {
            attempts: timing.retry_limit,
        })?;
        Ok(SOH_EOT.payload(&frame).to_vec())
    }

    fn decode(&self, frame: &[u8], keys: &mut KeyState) -> Option<Decoded> {
        let mut queue = KeyQueue::new();

        if frame.len() == KEY_REPORT_LENGTH && frame[1] == KEY_REPORT {
            let number = u16::from_be_bytes([frame[2], frame[3]]);
            queue.enqueue_key_event(KeySet::Navigation, number, frame[4] != 0);
            return Some(Decoded::keys(queue));
        }

        let command = match *SOH_EOT.payload(frame) {
            [INTERACTIVE_KEY, b'W'] => {
                queue.enqueue_key(KeySet::Navigation, key::Z);
                None
            }
            [INTERACTIVE_KEY, b'Q'] => {
                queue.enqueue_key(KeySet::Navigation, key::MENU);
                Some(Command::Offline)
            }
            [INTERACTIVE_KEY, number] if (1..=self.model.cells).contains(&usize::from(number)) => {
                let cell = u16::from(number - 1);
                queue.enqueue_key(KeySet::Routing, cell);
                Some(Command::Route { cell })
            }
            [XT_KEY_CODE, escape, code] => {
                if !queue.enqueue_xt_scan_code(code, escape) {
                    return None;
                }
                None
            }
            [LINEAR_KEYS, high, low] => {
                let bits = u32::from(u16::from_be_bytes([high, low]));
                queue.enqueue_updated_keys(bits, &mut keys.navigation, KeySet::Navigation, key::L1);
                None
            }
            [BRAILLE_KEYS, high, low] => {
                let bits = u32::from(u16::from_be_bytes([high, low]));
                queue.enqueue_keys(bits, KeySet::Navigation, key::DOT1);
                None
            }
            _ => return None,
        };

        Some(Decoded::keys(queue).with_command(command))
    }
}

impl Default for IrisDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for IrisDriver {
    fn resource(&self) -> ResourceDescriptor {
        ResourceDescriptor::serial(SERIAL)
    }

    fn packet_capacity(&self) -> usize {
        128
    }

    fn identify(&mut self, link: &mut Link) -> Result<Identity> {
        let version = self.request(link, VERSION)?;
        if version.len() < 3 {
            return Err(BrailleError::UnknownModel(format!(
                "short version response: {}",
                hex(&version)
            )));
        }
        let model = model_for_type(version[1]).ok_or_else(|| {
            BrailleError::UnknownModel(format!("Iris device type {:02X}", version[1]))
        })?;
        let firmware = String::from_utf8_lossy(&version[2..])
            .trim_end_matches('\0')
            .to_string();

        let serial = self.request(link, SERIAL_NUMBER)?;
        if serial.len() != SERIAL_NUMBER_LENGTH {
            return Err(BrailleError::UnknownModel(format!(
                "invalid serial number response: {}",
                hex(&serial)
            )));
        }
        let cells = match serial[1] {
            NO_WINDOW_LENGTH => model.cells,
            count => usize::from(count),
        };
        if cells == 0 || cells > MAXIMUM_WINDOW {
            return Err(BrailleError::UnknownModel(format!(
                "Iris with {} cells",
                cells
            )));
        }

        info!(
            "Iris serial number {}, firmware {}",
            String::from_utf8_lossy(&serial[2..]),
            firmware
        );
        self.model = model.with_cells(cells);
        Ok(self.model.identity().with_firmware(firmware))
    }

    fn read_input(&mut self, link: &mut Link, keys: &mut KeyState) -> Result<Option<Decoded>> {
        let packet = link.read_packet(&mut self.verifier)?;
        self.note_acknowledgement();
        let Some(frame) = packet else {
            return Ok(None);
        };

        match self.decode(&frame, keys) {
            Some(decoded) => Ok(Some(decoded)),
            None => {
                link.log_unexpected_packet(&frame);
                Ok(Some(Decoded::default()))
            }
        }
    }

    fn write_window(
        &mut self,
        link: &mut Link,
        display: &mut DisplayWriter,
        cells: &[u8],
    ) -> Result<()> {
        if display.plan(cells).is_none() {
            return Ok(());
        }

        if self.waiting_for_ack {
            let timeout = link.timing().ack_timeout_ms;
            let elapsed = self
                .last_write
                .map_or(u128::MAX, |at| at.elapsed().as_millis());
            if elapsed < u128::from(timeout) {
                display.mark_for_rewrite();
                return Ok(());
            }
            warn!("no acknowledgement after {} ms", timeout);
            self.waiting_for_ack = false;
        }

        let mut payload = Vec::with_capacity(MAXIMUM_WINDOW + 1);
        payload.push(WRITE_BRAILLE);
        payload.resize(1 + MAXIMUM_WINDOW.saturating_sub(cells.len()), 0);
        payload.extend(cells.iter().rev());
        link.write_packet(&SOH_EOT.encode(&payload))?;

        display.commit(cells, 0..cells.len());
        self.waiting_for_ack = true;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    fn reset(&mut self) {
        self.verifier.reset();
        self.waiting_for_ack = false;
        self.last_write = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::stuffing::{DLE, EOT};
    use crate::packet::PacketReader;

    fn frames(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut reader = PacketReader::new(128);
        let mut verifier = IrisVerifier::new();
        bytes
            .iter()
            .filter_map(|&b| reader.push_byte(b, &mut verifier))
            .collect()
    }

    /// The frame the reader hands to the driver for `payload`, after
    /// stuffing it on the wire.
    fn received(payload: &[u8]) -> Vec<u8> {
        let mut found = frames(&SOH_EOT.encode(payload));
        assert_eq!(found.len(), 1, "one frame for {:02X?}", payload);
        found.remove(0)
    }

    fn decode(payload_or_frame: &[u8]) -> Option<Decoded> {
        let driver = IrisDriver::new();
        let mut keys = KeyState::new();
        driver.decode(payload_or_frame, &mut keys)
    }

    #[test]
    fn test_key_report_is_fixed_length() {
        // 0x01 inside a key report is data, not a new frame.
        let found = frames(&[SOH, b'K', 0x00, 0x01, 0x01]);
        assert_eq!(found, vec![vec![SOH, b'K', 0x00, 0x01, 0x01]]);
    }

    #[test]
    fn test_escaped_k_is_a_stuffed_frame() {
        let found = frames(&[SOH, DLE, b'K', 0x20, EOT]);
        assert_eq!(found, vec![vec![SOH, b'K', 0x20, EOT]]);
    }

    #[test]
    fn test_key_report_decodes() {
        let decoded = decode(&[SOH, b'K', 0x00, 0x41, 0x01]).unwrap();
        assert_eq!(
            decoded.keys,
            vec![crate::keys::KeyEvent::press(KeySet::Navigation, 0x41)]
        );
        assert_eq!(decoded.command, None);
    }

    #[test]
    fn test_routing_and_z_keys() {
        let decoded = decode(&received(&[INTERACTIVE_KEY, 5])).unwrap();
        assert_eq!(decoded.command, Some(Command::Route { cell: 4 }));
        assert_eq!(decoded.keys.len(), 2);

        let decoded = decode(&received(&[INTERACTIVE_KEY, b'W'])).unwrap();
        assert_eq!(decoded.keys[0].number, key::Z);

        let decoded = decode(&received(&[INTERACTIVE_KEY, b'Q'])).unwrap();
        assert_eq!(decoded.command, Some(Command::Offline));
    }

    #[test]
    fn test_routing_key_past_window_is_unexpected() {
        // 41 is beyond the 40 cells of the default model.
        assert!(decode(&received(&[INTERACTIVE_KEY, 41])).is_none());
    }

    #[test]
    fn test_linear_keys_track_state() {
        let driver = IrisDriver::new();
        let mut keys = KeyState::new();
        let pressed = driver
            .decode(&received(&[LINEAR_KEYS, 0x00, 0b0000_0011]), &mut keys)
            .unwrap();
        assert_eq!(pressed.keys.len(), 2);
        assert!(pressed.keys.iter().all(|k| k.pressed));
        assert_eq!(keys.navigation, 0b11);

        let released = driver
            .decode(&received(&[LINEAR_KEYS, 0x00, 0x00]), &mut keys)
            .unwrap();
        assert!(released.keys.iter().all(|k| !k.pressed));
        assert_eq!(keys.navigation, 0);
    }

    #[test]
    fn test_braille_keys_include_space() {
        let decoded = decode(&received(&[BRAILLE_KEYS, 0x02, 0x01])).unwrap();
        let numbers: Vec<u16> = decoded.keys.iter().map(|k| k.number).collect();
        assert_eq!(numbers, vec![key::DOT1, key::SPACE, key::SPACE, key::DOT1]);
    }

    #[test]
    fn test_xt_scan_code() {
        let decoded = decode(&received(&[XT_KEY_CODE, 0xE0, 0x48])).unwrap();
        assert_eq!(decoded.keys[0].set, KeySet::KeyboardE0);
        assert!(decode(&received(&[XT_KEY_CODE, 0x42, 0x48])).is_none());
    }

    #[test]
    fn test_model_types() {
        assert_eq!(model_for_type(b'a').map(|m| m.key_table), Some("pc"));
        assert_eq!(model_for_type(b'S').map(|m| m.cells), Some(32));
        assert!(model_for_type(b'x').is_none());
    }
}
