//! Byte stuffing for SOH/EOT framed protocols.
//!
//! A frame is `start payload end`. Any payload byte that equals a control
//! byte is preceded by the escape byte. Unescaped acknowledgement bytes may
//! arrive between frames and are reported separately from frames.

use super::{PacketVerifier, Verdict};

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const DLE: u8 = 0x10;
pub const NAK: u8 = 0x15;

/// Control bytes of a stuffed framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stuffing {
    pub start: u8,
    pub end: u8,
    pub escape: u8,
    /// Every byte that must be escaped inside a frame.
    pub controls: &'static [u8],
}

/// SOH ... EOT with DLE escapes, used by Iris and Clio.
pub const SOH_EOT: Stuffing = Stuffing {
    start: SOH,
    end: EOT,
    escape: DLE,
    controls: &[SOH, EOT, DLE, ACK, NAK],
};

impl Stuffing {
    pub fn needs_escape(&self, byte: u8) -> bool {
        self.controls.contains(&byte)
    }

    /// Append `bytes` to `frame`, escaping control bytes.
    pub fn escape_into(&self, frame: &mut Vec<u8>, bytes: &[u8]) {
        for &byte in bytes {
            if self.needs_escape(byte) {
                frame.push(self.escape);
            }
            frame.push(byte);
        }
    }

    /// Build a complete frame around `payload`.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() * 2 + 2);
        frame.push(self.start);
        self.escape_into(&mut frame, payload);
        frame.push(self.end);
        frame
    }

    /// The payload of a frame accepted by an [`Unstuffer`].
    pub fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        match frame {
            [start, payload @ .., end] if *start == self.start && *end == self.end => payload,
            _ => &[],
        }
    }
}

/// Verifier for a stuffed framing.
///
/// Frames are stored with their start and end markers and without escape
/// bytes.
#[derive(Debug, Clone)]
pub struct Unstuffer {
    stuffing: Stuffing,
    escape_pending: bool,
    control: Option<u8>,
}

impl Unstuffer {
    pub fn new(stuffing: Stuffing) -> Self {
        Self {
            stuffing,
            escape_pending: false,
            control: None,
        }
    }

    pub fn stuffing(&self) -> &Stuffing {
        &self.stuffing
    }

    pub fn escape_pending(&self) -> bool {
        self.escape_pending
    }

    /// The last control byte (ACK, NAK) seen between frames, if any.
    pub fn take_control(&mut self) -> Option<u8> {
        self.control.take()
    }

    fn is_standalone_control(&self, byte: u8) -> bool {
        byte != self.stuffing.start
            && byte != self.stuffing.end
            && byte != self.stuffing.escape
            && self.stuffing.needs_escape(byte)
    }
}

impl PacketVerifier for Unstuffer {
    fn verify(&mut self, bytes: &[u8], length: &mut usize) -> Verdict {
        let count = bytes.len();
        let byte = bytes[count - 1];

        if count == 1 {
            self.escape_pending = false;
            if byte == self.stuffing.start {
                *length = 2;
                return Verdict::Include;
            }
            if self.is_standalone_control(byte) {
                self.control = Some(byte);
                return Verdict::Exclude;
            }
            return Verdict::Invalid;
        }

        if self.escape_pending {
            self.escape_pending = false;
            *length = count + 1;
            return Verdict::Include;
        }

        if byte == self.stuffing.escape {
            self.escape_pending = true;
            return Verdict::Exclude;
        }

        if byte == self.stuffing.end {
            *length = count;
            return Verdict::Include;
        }

        if self.stuffing.needs_escape(byte) {
            // An unescaped control byte cannot be payload.
            return Verdict::Invalid;
        }

        *length = count + 1;
        Verdict::Include
    }

    fn reset(&mut self) {
        self.escape_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FrameFault, PacketReader};

    fn decode_all(bytes: &[u8]) -> (Vec<Vec<u8>>, PacketReader, Unstuffer) {
        let mut reader = PacketReader::new(64);
        let mut unstuffer = Unstuffer::new(SOH_EOT);
        let frames = bytes
            .iter()
            .filter_map(|&b| reader.push_byte(b, &mut unstuffer))
            .collect();
        (frames, reader, unstuffer)
    }

    #[test]
    fn test_round_trip_with_every_control_byte() {
        let payload = [b'B', SOH, 0x20, EOT, DLE, ACK, NAK, 0xFF, EOT];
        let frame = SOH_EOT.encode(&payload);
        let (frames, _, _) = decode_all(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(SOH_EOT.payload(&frames[0]), &payload);
    }

    #[test]
    fn test_round_trip_all_byte_values() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = SOH_EOT.encode(&payload);
        let mut reader = PacketReader::new(300);
        let mut unstuffer = Unstuffer::new(SOH_EOT);
        let frames: Vec<Vec<u8>> = frame
            .iter()
            .filter_map(|&b| reader.push_byte(b, &mut unstuffer))
            .collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(SOH_EOT.payload(&frames[0]), payload.as_slice());
    }

    #[test]
    fn test_escaped_end_marker_does_not_complete() {
        // Escaped EOT is payload; the frame completes only at the real EOT.
        let bytes = [SOH, b'X', DLE, EOT];
        let (frames, reader, unstuffer) = decode_all(&bytes);
        assert!(frames.is_empty());
        assert!(reader.in_frame());
        assert!(!unstuffer.escape_pending());

        let mut all = bytes.to_vec();
        all.push(EOT);
        let (frames, _, _) = decode_all(&all);
        assert_eq!(frames, vec![vec![SOH, b'X', EOT, EOT]]);
    }

    #[test]
    fn test_ack_between_frames_is_reported() {
        let mut bytes = vec![ACK];
        bytes.extend(SOH_EOT.encode(b"ok"));
        let (frames, _, mut unstuffer) = decode_all(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(unstuffer.take_control(), Some(ACK));
        assert_eq!(unstuffer.take_control(), None);
    }

    #[test]
    fn test_unescaped_start_resyncs() {
        // A frame cut short by a new SOH is dropped; the new frame survives.
        let mut bytes = vec![SOH, b'A', b'B'];
        bytes.extend(SOH_EOT.encode(b"CD"));
        let (frames, mut reader, _) = decode_all(&bytes);
        assert_eq!(frames, vec![vec![SOH, b'C', b'D', EOT]]);
        assert_eq!(reader.take_faults(), vec![FrameFault::Short]);
    }

    #[test]
    fn test_payload_of_malformed_frame_is_empty() {
        assert!(SOH_EOT.payload(&[SOH]).is_empty());
        assert!(SOH_EOT.payload(&[0x00, 1, 2]).is_empty());
    }
}
