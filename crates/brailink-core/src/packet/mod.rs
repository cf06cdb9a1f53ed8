//! Frame assembly from a byte stream.
//!
//! Every protocol supplies a [`PacketVerifier`] that judges each new byte in
//! the context of the bytes before it and adjusts the expected frame length.
//! [`PacketReader`] owns the bounded buffer and the recovery rules:
//!
//! - a byte rejected before any other byte was accepted is ignored;
//! - a byte rejected mid-frame (a bad footer included) ends that frame as
//!   short and is examined again as the possible start of the next one;
//! - a frame longer than the buffer is dropped as too long;
//! - a timeout mid-frame drops the partial frame.
//!
//! The rejected byte is carried in an explicit pushback slot so no input is
//! lost while resynchronizing.

pub mod stuffing;

use std::fmt::Write as _;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::Endpoint;

/// What a verifier decided about the newest byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The byte cannot belong to this frame.
    Invalid,
    /// Keep the byte.
    Include,
    /// Accept the byte but do not store it.
    Exclude,
}

/// Protocol-specific frame checker.
pub trait PacketVerifier {
    /// Judge the last byte of `bytes`. `length` is the expected frame length
    /// (1 at the start of a frame) and may be raised as header fields arrive.
    fn verify(&mut self, bytes: &[u8], length: &mut usize) -> Verdict;

    /// Forget per-frame state after a frame completes or is dropped.
    fn reset(&mut self) {}
}

impl<F> PacketVerifier for F
where
    F: FnMut(&[u8], &mut usize) -> Verdict,
{
    fn verify(&mut self, bytes: &[u8], length: &mut usize) -> Verdict {
        self(bytes, length)
    }
}

/// Why a frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFault {
    /// A byte mid-frame failed its check.
    Short,
    /// The input stopped mid-frame.
    Partial,
    /// The frame would not fit the buffer.
    TooLong,
}

/// Hex dump used by packet logging.
pub fn hex(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 3);
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            text.push(' ');
        }
        let _ = write!(text, "{:02X}", byte);
    }
    text
}

/// Bounded frame accumulator with a one-byte pushback slot.
#[derive(Debug)]
pub struct PacketReader {
    buffer: Vec<u8>,
    capacity: usize,
    length: usize,
    held: Option<u8>,
    faults: Vec<FrameFault>,
}

impl PacketReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            length: 1,
            held: None,
            faults: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a frame has been started.
    pub fn in_frame(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Faults seen since the last call, oldest first.
    pub fn take_faults(&mut self) -> Vec<FrameFault> {
        std::mem::take(&mut self.faults)
    }

    fn reset<V: PacketVerifier + ?Sized>(&mut self, verifier: &mut V) {
        self.buffer.clear();
        self.length = 1;
        verifier.reset();
    }

    fn drop_frame<V: PacketVerifier + ?Sized>(&mut self, fault: FrameFault, verifier: &mut V) {
        match fault {
            FrameFault::Short => warn!("short packet: {}", hex(&self.buffer)),
            FrameFault::TooLong => warn!(
                "packet too long ({} > {}): {}",
                self.length.max(self.buffer.len() + 1),
                self.capacity,
                hex(&self.buffer)
            ),
            FrameFault::Partial => warn!("partial packet: {}", hex(&self.buffer)),
        }
        self.faults.push(fault);
        self.reset(verifier);
    }

    /// Feed one byte. Returns the frame it completes, if any.
    pub fn push_byte<V: PacketVerifier + ?Sized>(
        &mut self,
        byte: u8,
        verifier: &mut V,
    ) -> Option<Vec<u8>> {
        self.held = Some(byte);

        while let Some(byte) = self.held.take() {
            if self.buffer.len() == self.capacity {
                self.drop_frame(FrameFault::TooLong, verifier);
                self.held = Some(byte);
                continue;
            }

            self.buffer.push(byte);
            match verifier.verify(&self.buffer, &mut self.length) {
                Verdict::Include => {}
                Verdict::Exclude => {
                    self.buffer.pop();
                }
                Verdict::Invalid => {
                    self.buffer.pop();
                    if self.buffer.is_empty() {
                        debug!("ignored byte: {:02X}", byte);
                        verifier.reset();
                    } else {
                        self.drop_frame(FrameFault::Short, verifier);
                        self.held = Some(byte);
                    }
                    continue;
                }
            }

            if self.length > self.capacity {
                self.drop_frame(FrameFault::TooLong, verifier);
                continue;
            }

            if !self.buffer.is_empty() && self.buffer.len() >= self.length {
                let packet = std::mem::take(&mut self.buffer);
                self.buffer.reserve(self.capacity);
                self.length = 1;
                verifier.reset();
                debug!("input packet: {}", hex(&packet));
                return Some(packet);
            }
        }

        None
    }

    /// Read bytes from `endpoint` until a frame completes or input stops.
    pub fn read_packet<V: PacketVerifier + ?Sized>(
        &mut self,
        endpoint: &mut Endpoint,
        verifier: &mut V,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            let started = self.in_frame();
            match endpoint.read_byte(started)? {
                Some(byte) => {
                    if let Some(packet) = self.push_byte(byte, verifier) {
                        return Ok(Some(packet));
                    }
                }
                None => {
                    if started {
                        self.drop_frame(FrameFault::Partial, verifier);
                    }
                    return Ok(None);
                }
            }
        }
    }
}
