//! Packet-level access to an endpoint.
//!
//! A [`Link`] is what drivers talk to: it reads frames through a verifier,
//! writes frames while accounting for the time the link needs to carry them,
//! and counts consecutive malformed frames.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Timing;
use crate::error::{BrailleError, Result};
use crate::packet::{hex, PacketReader, PacketVerifier};
use crate::transport::{Endpoint, SerialParameters, TransportKind};

#[derive(Debug)]
pub struct Link {
    endpoint: Endpoint,
    reader: PacketReader,
    write_delay_ms: u64,
    consecutive_faults: u32,
    timing: Timing,
}

impl Link {
    /// `capacity` bounds the frames this link will assemble.
    pub fn new(endpoint: Endpoint, capacity: usize, timing: Timing) -> Self {
        Self {
            endpoint,
            reader: PacketReader::new(capacity),
            write_delay_ms: 0,
            consecutive_faults: 0,
            timing,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.endpoint.kind()
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.endpoint.bytes_per_second()
    }

    /// Read one frame. `Ok(None)` means no complete frame arrived in time.
    pub fn read_packet<V: PacketVerifier + ?Sized>(
        &mut self,
        verifier: &mut V,
    ) -> Result<Option<Vec<u8>>> {
        let packet = self.reader.read_packet(&mut self.endpoint, verifier)?;
        let faults = self.reader.take_faults();
        if packet.is_some() {
            self.consecutive_faults = 0;
        } else if !faults.is_empty() {
            self.consecutive_faults += faults.len() as u32;
            debug!(
                "{} consecutive malformed frames ({:?})",
                self.consecutive_faults, faults
            );
        }
        Ok(packet)
    }

    /// Write one frame and add its transfer time to the write delay.
    pub fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        debug!("output packet: {}", hex(packet));
        self.endpoint
            .write_data(packet)
            .map_err(|e| BrailleError::WriteFailed(e.to_string()))?;
        self.write_delay_ms += self.endpoint.millis_to_transfer(packet.len());
        Ok(())
    }

    pub fn add_delay(&mut self, millis: u64) {
        self.write_delay_ms += millis;
    }

    pub fn write_delay_ms(&self) -> u64 {
        self.write_delay_ms
    }

    /// Wait for written data to leave the link, at least `minimum_ms`.
    pub fn drain_output(&mut self, minimum_ms: u64) {
        let millis = (self.write_delay_ms + 1).max(minimum_ms);
        self.write_delay_ms = 0;
        thread::sleep(Duration::from_millis(millis));
    }

    pub fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        Ok(self.endpoint.await_input(timeout)?)
    }

    pub fn reconfigure(&mut self, parameters: &SerialParameters) -> Result<()> {
        Ok(self.endpoint.reconfigure(parameters)?)
    }

    pub fn discard_input(&mut self) -> Result<()> {
        Ok(self.endpoint.discard_input()?)
    }

    pub fn log_unexpected_packet(&self, packet: &[u8]) {
        warn!("unexpected packet: {}", hex(packet));
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive_faults
    }

    pub fn exceeded_fault_limit(&self) -> bool {
        self.timing.fault_limit > 0 && self.consecutive_faults >= self.timing.fault_limit
    }

    pub fn close(&mut self) -> Result<()> {
        Ok(self.endpoint.close()?)
    }
}
