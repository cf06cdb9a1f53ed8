//! The Clio protocol, spoken by Clio, NoteBraille, Scriba and Iris models
//! with firmware up to 1.70.
//!
//! Frames are SOH/EOT stuffed. Each carries a packet number and an XOR
//! parity byte after the payload; the receiver acknowledges every frame
//! with ACK or, on a parity error, NAK. A frame whose number repeats the
//! previous one is a retransmission and is dropped after acknowledging it.

use tracing::{debug, info};

use super::Protocol;
use crate::display::DisplayWriter;
use crate::error::{BrailleError, Result};
use crate::keys::{Command, Decoded, KeyQueue, KeySet, KeyState};
use crate::link::Link;
use crate::model::{Identity, ModelDescriptor};
use crate::packet::hex;
use crate::packet::stuffing::{Unstuffer, ACK, NAK, SOH_EOT};
use crate::session::{exchange, Reply};

const PARITY_ERROR: u8 = 0x01;

const FIRST_OUTPUT_NUMBER: u8 = 127;
const OUTPUT_NUMBER_WRAP: u8 = 128;

const SYSTEM_IDENTIFY: [u8; 3] = [0x02, b'S', b'I'];
const SYSTEM_RECORD_LENGTH: usize = 22;
const FIRMWARE_LENGTH: usize = 20;

static MODELS: [(&[u8; 3], ModelDescriptor); 22] = [
    (b"CE2", ModelDescriptor::new("Clio-EuroBraille 20", 20, "clio")),
    (b"CE4", ModelDescriptor::new("Clio-EuroBraille 40", 40, "clio")),
    (b"CE8", ModelDescriptor::new("Clio-EuroBraille 80", 80, "clio")),
    (b"CN2", ModelDescriptor::new("Clio-NoteBraille 20", 20, "clio")),
    (b"CN4", ModelDescriptor::new("Clio-NoteBraille 40", 40, "clio")),
    (b"CN8", ModelDescriptor::new("Clio-NoteBraille 80", 80, "clio")),
    (b"Cp2", ModelDescriptor::new("Clio-PupiBraille 20", 20, "clio")),
    (b"Cp4", ModelDescriptor::new("Clio-PupiBraille 40", 40, "clio")),
    (b"Cp8", ModelDescriptor::new("Clio-PupiBraille 80", 80, "clio")),
    (b"CZ4", ModelDescriptor::new("Clio-AzerBraille 40", 40, "clio")),
    (b"JN2", ModelDescriptor::new("NoteBraille 20", 20, "clio")),
    (b"NB2", ModelDescriptor::new("NoteBraille 20", 20, "clio")),
    (b"NB4", ModelDescriptor::new("NoteBraille 40", 40, "clio")),
    (b"NB8", ModelDescriptor::new("NoteBraille 80", 80, "clio")),
    (b"SB2", ModelDescriptor::new("Scriba 20", 20, "clio")),
    (b"SB4", ModelDescriptor::new("Scriba 40", 40, "clio")),
    (b"SC2", ModelDescriptor::new("Scriba 20", 20, "clio")),
    (b"SC4", ModelDescriptor::new("Scriba 40", 40, "clio")),
    (b"IR2", ModelDescriptor::new("Iris 20", 20, "clio")),
    (b"IR4", ModelDescriptor::new("Iris 40", 40, "clio")),
    (b"IS2", ModelDescriptor::new("Iris S20", 20, "clio")),
    (b"IS3", ModelDescriptor::new("Iris S32", 32, "clio")),
];

fn model_for_code(code: &[u8]) -> Option<ModelDescriptor> {
    MODELS
        .iter()
        .find(|(model_code, _)| code.starts_with(*model_code))
        .map(|(_, model)| model.with_routing_keys())
}

/// The firmware string of a system information packet. The packet is a
/// sequence of `length bytes...` records.
fn firmware(packet: &[u8]) -> Option<&[u8]> {
    let mut rest = packet;
    while let [length, tail @ ..] = rest {
        let length = usize::from(*length);
        if length == 0 || length > tail.len() {
            break;
        }
        let record = &tail[..length];
        if length == SYSTEM_RECORD_LENGTH && (record.starts_with(b"SI") || record.starts_with(b"si"))
        {
            return Some(&record[2..2 + FIRMWARE_LENGTH]);
        }
        rest = &tail[length..];
    }
    None
}

/// Cell count from the firmware string, when it states one.
fn firmware_cells(firmware: &[u8]) -> Option<usize> {
    match firmware.get(2)? {
        b'2' => Some(20),
        b'3' => Some(32),
        b'4' => Some(40),
        b'8' => Some(80),
        _ => None,
    }
}

fn parity(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |parity, byte| parity ^ byte)
}

/// Receiving half: frame assembly, acknowledgement and duplicate removal.
#[derive(Debug)]
struct Receiver {
    unstuffer: Unstuffer,
    last_number: Option<u8>,
}

impl Receiver {
    fn new() -> Self {
        Self {
            unstuffer: Unstuffer::new(SOH_EOT),
            last_number: None,
        }
    }

    /// The next new packet: `length type subtype data...`.
    fn read(&mut self, link: &mut Link) -> Result<Option<Vec<u8>>> {
        loop {
            let frame = link.read_packet(&mut self.unstuffer)?;
            if let Some(control) = self.unstuffer.take_control() {
                debug!("acknowledgement {:02X}", control);
            }
            let Some(frame) = frame else {
                return Ok(None);
            };

            let body = SOH_EOT.payload(&frame);
            if body.len() < 3 {
                link.log_unexpected_packet(&frame);
                continue;
            }
            if parity(body) != 0 {
                debug!("parity error: {}", hex(body));
                link.write_packet(&[NAK, PARITY_ERROR])?;
                continue;
            }
            link.write_packet(&[ACK])?;

            let (packet, trailer) = body.split_at(body.len() - 2);
            let number = trailer[0];
            if self.last_number == Some(number) {
                debug!("duplicate packet {}", number);
                continue;
            }
            self.last_number = Some(number);
            return Ok(Some(packet.to_vec()));
        }
    }
}

/// Sending half: packet numbering and framing.
#[derive(Debug)]
struct Sender {
    next_number: u8,
}

impl Sender {
    fn new() -> Self {
        Self {
            next_number: FIRST_OUTPUT_NUMBER,
        }
    }

    fn number(&mut self) -> u8 {
        let number = self.next_number;
        self.next_number = number.checked_add(1).unwrap_or(OUTPUT_NUMBER_WRAP);
        number
    }

    /// `SOH payload number parity EOT`. Packet numbers are at least 127 and
    /// never need escaping.
    fn frame(&mut self, payload: &[u8]) -> Vec<u8> {
        let number = self.number();
        let parity = parity(payload) ^ number;

        let mut frame = Vec::with_capacity(payload.len() * 2 + 5);
        frame.push(SOH_EOT.start);
        SOH_EOT.escape_into(&mut frame, payload);
        frame.push(number);
        SOH_EOT.escape_into(&mut frame, &[parity]);
        frame.push(SOH_EOT.end);
        frame
    }

    fn send(&mut self, link: &mut Link, payload: &[u8]) -> Result<()> {
        let frame = self.frame(payload);
        link.write_packet(&frame)
    }
}

pub struct ClioProtocol {
    receiver: Receiver,
    sender: Sender,
    force_rewrite: bool,
    visual: Vec<char>,
    force_visual: bool,
}

impl ClioProtocol {
    pub fn new() -> Self {
        Self {
            receiver: Receiver::new(),
            sender: Sender::new(),
            force_rewrite: true,
            visual: Vec::new(),
            force_visual: true,
        }
    }

    fn decode(&mut self, packet: &[u8]) -> Option<Decoded> {
        let mut queue = KeyQueue::new();
        let command = match *packet {
            [_, b'S', ..] => {
                debug!("late system information");
                None
            }
            [_, b'R', b'B', ..] => {
                self.force_rewrite = true;
                self.force_visual = true;
                None
            }
            [_, b'K', b'B', low, high, ..] => {
                let bits = u32::from(u16::from_be_bytes([high, low])) & 0x3FF;
                queue.enqueue_keys(bits, KeySet::Braille, 0);
                None
            }
            [_, b'K', b'I', key, ..] if key >= 0x88 => {
                queue.enqueue_key(KeySet::Status, u16::from(key - 0x88));
                None
            }
            [_, b'K', b'I', key, ..] if key >= 0x81 => {
                queue.enqueue_key(KeySet::Separator, u16::from(key - 0x81));
                None
            }
            [_, b'K', b'I', key, ..] if key >= 1 => {
                let cell = u16::from(key - 1);
                queue.enqueue_key(KeySet::Routing, cell);
                Some(Command::Route { cell })
            }
            [_, b'K', b'T', key, ..] => {
                queue.enqueue_key(KeySet::Navigation, u16::from(key));
                None
            }
            _ => return None,
        };
        Some(Decoded::keys(queue).with_command(command))
    }
}

impl Default for ClioProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for ClioProtocol {
    fn name(&self) -> &'static str {
        "clio"
    }

    fn identify(&mut self, link: &mut Link) -> Result<Identity> {
        let timing = link.timing().clone();
        *self = Self::new();
        let Self {
            receiver, sender, ..
        } = self;

        let packet = exchange(
            link,
            timing.retry_limit,
            timing.identify_timeout(),
            |link| sender.send(link, &SYSTEM_IDENTIFY).map(|_| true),
            |link| receiver.read(link),
            |packet| match packet.get(1) {
                Some(b'S') => Reply::Done,
                _ => Reply::Unexpected,
            },
        )?
        .ok_or(BrailleError::IdentifyTimeout {
            attempts: timing.retry_limit,
        })?;

        let firmware = firmware(&packet).ok_or_else(|| {
            BrailleError::UnknownModel(format!("no firmware record in {}", hex(&packet)))
        })?;
        let version = String::from_utf8_lossy(firmware)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        let mut model = model_for_code(firmware)
            .ok_or_else(|| BrailleError::UnknownModel(version.clone()))?;
        if let Some(cells) = firmware_cells(firmware) {
            model = model.with_cells(cells);
        }

        info!("Clio firmware {}", version);
        Ok(model.identity().with_firmware(version))
    }

    fn read_input(&mut self, link: &mut Link, _keys: &mut KeyState) -> Result<Option<Decoded>> {
        let Some(packet) = self.receiver.read(link)? else {
            return Ok(None);
        };
        match self.decode(&packet) {
            Some(decoded) => Ok(Some(decoded)),
            None => {
                link.log_unexpected_packet(&packet);
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
        if std::mem::take(&mut self.force_rewrite) {
            display.mark_for_rewrite();
        }
        if display.plan(cells).is_none() {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(cells.len() + 3);
        payload.extend_from_slice(&[(cells.len() + 2) as u8, b'D', b'P']);
        payload.extend_from_slice(cells);
        self.sender.send(link, &payload)?;

        display.commit(cells, 0..cells.len());
        Ok(())
    }

    /// Text for the display's LCD, Latin-1 with `?` for anything else.
    fn write_visual(&mut self, link: &mut Link, text: &[char]) -> Result<()> {
        if !self.force_visual && self.visual == text {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(text.len() + 3);
        payload.extend_from_slice(&[(text.len() + 2) as u8, b'D', b'L']);
        payload.extend(text.iter().map(|&c| u8::try_from(c).unwrap_or(b'?')));
        self.sender.send(link, &payload)?;

        self.visual = text.to_vec();
        self.force_visual = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::keys::KeyEvent;
    use crate::packet::stuffing::{DLE, EOT, SOH};
    use crate::transport::{Endpoint, MockHandle, MockTransport};

    fn link() -> (Link, MockHandle) {
        let (transport, handle) = MockTransport::new();
        let timing = Timing::immediate();
        let endpoint = Endpoint::from_transport(Box::new(transport), 0, &timing);
        (Link::new(endpoint, 256, timing), handle)
    }

    /// A frame as the display would send it.
    fn device_frame(packet: &[u8], number: u8) -> Vec<u8> {
        let mut body = packet.to_vec();
        body.push(number);
        body.push(parity(&body));
        SOH_EOT.encode(&body)
    }

    fn system_information(firmware: &[u8; 20]) -> Vec<u8> {
        let mut packet = vec![SYSTEM_RECORD_LENGTH as u8, b'S', b'I'];
        packet.extend_from_slice(firmware);
        packet
    }

    #[test]
    fn test_output_numbers_wrap_to_128() {
        let mut sender = Sender::new();
        assert_eq!(sender.number(), 127);
        assert_eq!(sender.number(), 128);
        sender.next_number = 255;
        assert_eq!(sender.number(), 255);
        assert_eq!(sender.number(), 128);
    }

    #[test]
    fn test_frame_escapes_parity_but_not_number() {
        let mut sender = Sender::new();
        // 0x7F ^ 0x7B = 0x04, which is EOT and must be escaped.
        let frame = sender.frame(&[0x7B]);
        assert_eq!(frame, vec![SOH, 0x7B, 0x7F, DLE, EOT, EOT]);
    }

    #[test]
    fn test_read_acknowledges_and_drops_duplicates() {
        let (mut link, handle) = link();
        let mut receiver = Receiver::new();
        let packet = [0x04, b'K', b'T', 0x03];

        handle.push_input(&device_frame(&packet, 0x20));
        handle.push_input(&device_frame(&packet, 0x20));
        handle.push_input(&device_frame(&packet, 0x21));

        assert_eq!(receiver.read(&mut link).unwrap(), Some(packet.to_vec()));
        assert_eq!(receiver.read(&mut link).unwrap(), Some(packet.to_vec()));
        assert_eq!(receiver.read(&mut link).unwrap(), None);
        assert_eq!(handle.written(), vec![vec![ACK], vec![ACK], vec![ACK]]);
    }

    #[test]
    fn test_parity_error_is_refused() {
        let (mut link, handle) = link();
        let mut receiver = Receiver::new();
        let mut bad = device_frame(&[0x04, b'K', b'T', 0x03], 0x20);
        let length = bad.len();
        bad[length - 2] ^= 0x40;

        handle.push_input(&bad);
        assert_eq!(receiver.read(&mut link).unwrap(), None);
        assert_eq!(handle.written(), vec![vec![NAK, PARITY_ERROR]]);
    }

    #[test]
    fn test_firmware_record_search() {
        let mut packet = vec![3, b'S', b'X', 0];
        packet.extend(system_information(b"NB4 1.2             "));
        assert_eq!(firmware(&packet), Some(&b"NB4 1.2             "[..]));
        assert_eq!(firmware(&[5, b'S', b'I']), None);
        assert_eq!(firmware(&[0]), None);
    }

    #[test]
    fn test_model_and_cells_from_firmware() {
        let model = model_for_code(b"IS3 1.00").unwrap();
        assert_eq!(model.name, "Iris S32");
        assert_eq!(firmware_cells(b"IS3 1.00"), Some(32));
        assert_eq!(firmware_cells(b"CEx"), None);
        assert!(model_for_code(b"XX4").is_none());
    }

    #[test]
    fn test_identify_reads_system_information() {
        let (mut link, handle) = link();
        let reply = device_frame(&system_information(b"CE4 2.07            "), 0x30);
        handle.set_responder(move |written: &[u8], _baud: Option<u32>| {
            if written.first() == Some(&SOH) {
                reply.clone()
            } else {
                Vec::new()
            }
        });

        let mut protocol = ClioProtocol::new();
        let identity = protocol.identify(&mut link).unwrap();
        assert_eq!(identity.model, "Clio-EuroBraille 40");
        assert_eq!(identity.cells, 40);
        assert_eq!(identity.firmware.as_deref(), Some("CE4 2.07"));

        let written = handle.written();
        assert_eq!(written[0], Sender::new().frame(&SYSTEM_IDENTIFY));
        assert_eq!(written[1], vec![ACK]);
    }

    #[test]
    fn test_key_packets() {
        let mut protocol = ClioProtocol::new();
        let decoded = protocol.decode(&[0x03, b'K', b'I', 0x05]).unwrap();
        assert_eq!(decoded.command, Some(Command::Route { cell: 4 }));

        let decoded = protocol.decode(&[0x03, b'K', b'I', 0x89]).unwrap();
        assert_eq!(
            decoded.keys,
            vec![
                KeyEvent::press(KeySet::Status, 1),
                KeyEvent::release(KeySet::Status, 1)
            ]
        );
        let decoded = protocol.decode(&[0x03, b'K', b'I', 0x82]).unwrap();
        assert_eq!(decoded.keys[0], KeyEvent::press(KeySet::Separator, 1));

        let decoded = protocol.decode(&[0x04, b'K', b'B', 0x01, 0x02]).unwrap();
        assert_eq!(
            decoded.keys,
            vec![
                KeyEvent::press(KeySet::Braille, 0),
                KeyEvent::press(KeySet::Braille, 9),
                KeyEvent::release(KeySet::Braille, 9),
                KeyEvent::release(KeySet::Braille, 0)
            ]
        );
        assert!(protocol.decode(&[0x03, b'K', b'I', 0x00]).is_none());
        assert!(protocol.decode(&[0x03, b'X', b'I', 0x00]).is_none());
    }

    #[test]
    fn test_mode_report_forces_rewrite() {
        let (mut link, handle) = link();
        let mut protocol = ClioProtocol::new();
        let mut display = DisplayWriter::new(5);
        let cells = [0x11, 0x22, 0x33, 0x44, 0x55];

        protocol.write_window(&mut link, &mut display, &cells).unwrap();
        protocol.write_window(&mut link, &mut display, &cells).unwrap();
        assert_eq!(handle.take_written().len(), 1);

        assert!(protocol.decode(&[0x02, b'R', b'B']).unwrap().is_empty());
        protocol.write_window(&mut link, &mut display, &cells).unwrap();
        let written = handle.take_written();
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][1..4], &[7, b'D', b'P']);
    }

    #[test]
    fn test_visual_text_is_latin1() {
        let (mut link, handle) = link();
        let mut protocol = ClioProtocol::new();
        let text = ['h', '\u{e9}', '\u{20ac}', ' ', ' '];

        protocol.write_visual(&mut link, &text).unwrap();
        let written = handle.take_written();
        assert_eq!(written.len(), 1);
        assert_eq!(
            &written[0][1..9],
            &[7, b'D', b'L', b'h', 0xE9, b'?', b' ', b' ']
        );

        protocol.write_visual(&mut link, &text).unwrap();
        assert!(handle.take_written().is_empty(), "unchanged text is not resent");
    }

    #[test]
    fn test_mode_report_forces_visual_rewrite() {
        let (mut link, handle) = link();
        let mut protocol = ClioProtocol::new();
        let text = ['o', 'k', '!'];

        protocol.write_visual(&mut link, &text).unwrap();
        protocol.write_visual(&mut link, &text).unwrap();
        assert_eq!(handle.take_written().len(), 1);

        protocol.decode(&[0x02, b'R', b'B']).unwrap();
        protocol.write_visual(&mut link, &text).unwrap();
        let written = handle.take_written();
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][1..7], &[5, b'D', b'L', b'o', b'k', b'!']);
    }
}
