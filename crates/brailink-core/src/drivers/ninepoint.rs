//! NinePoint, an eight cell display.
//!
//! There is no identify exchange. Input is either a single routing key byte
//! or the three byte `FD 2F x` status report, which carries nothing we use.
//! Every write resends all eight cells as `FC cell` pairs followed by
//! `FD 10`.

use tracing::debug;

use crate::display::DisplayWriter;
use crate::driver::{Driver, DriverParameters};
use crate::error::Result;
use crate::keys::{Command, Decoded, KeyQueue, KeySet, KeyState};
use crate::link::Link;
use crate::model::{Identity, ModelDescriptor};
use crate::packet::Verdict;
use crate::transport::{ResourceDescriptor, SerialParameters};

const CELL_PREFIX: u8 = 0xFC;
const COMMAND: u8 = 0xFD;
const STATUS: u8 = 0x2F;
const REFRESH: u8 = 0x10;

const ROUTING_FIRST: u8 = 0x80;
const ROUTING_LAST: u8 = 0x87;

static MODEL: ModelDescriptor = ModelDescriptor::new("NinePoint", 8, "all").with_routing_keys();

fn is_routing_key(byte: u8) -> bool {
    (ROUTING_FIRST..=ROUTING_LAST).contains(&byte)
}

fn verify(bytes: &[u8], length: &mut usize) -> Verdict {
    match *bytes {
        [COMMAND] => {
            *length = 2;
            Verdict::Include
        }
        [byte] if is_routing_key(byte) => Verdict::Include,
        [_] => Verdict::Invalid,
        [COMMAND, STATUS] => {
            *length = 3;
            Verdict::Include
        }
        [COMMAND, _] => Verdict::Invalid,
        _ => Verdict::Include,
    }
}

pub struct NinePointDriver;

pub fn create(_parameters: &DriverParameters) -> Result<Box<dyn Driver>> {
    Ok(Box::new(NinePointDriver))
}

impl NinePointDriver {
    fn decode(frame: &[u8]) -> Option<Decoded> {
        match *frame {
            [COMMAND, STATUS, status] => {
                debug!("status report: {:02X}", status);
                Some(Decoded::default())
            }
            [byte] if is_routing_key(byte) => {
                let cell = u16::from(byte - ROUTING_FIRST);
                let mut queue = KeyQueue::new();
                queue.enqueue_key(KeySet::Routing, cell);
                Some(Decoded::keys(queue).with_command(Some(Command::Route { cell })))
            }
            _ => None,
        }
    }
}

impl Driver for NinePointDriver {
    fn resource(&self) -> ResourceDescriptor {
        ResourceDescriptor::serial(SerialParameters::new(9600)).with_bluetooth(1)
    }

    fn packet_capacity(&self) -> usize {
        3
    }

    fn identify(&mut self, _link: &mut Link) -> Result<Identity> {
        Ok(MODEL.identity())
    }

    fn read_input(&mut self, link: &mut Link, _keys: &mut KeyState) -> Result<Option<Decoded>> {
        let mut verifier = verify;
        let Some(frame) = link.read_packet(&mut verifier)? else {
            return Ok(None);
        };
        match Self::decode(&frame) {
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

        let mut packet = Vec::with_capacity(cells.len() * 2 + 2);
        for &cell in cells {
            packet.extend_from_slice(&[CELL_PREFIX, cell]);
        }
        packet.extend_from_slice(&[COMMAND, REFRESH]);
        link.write_packet(&packet)?;

        display.commit(cells, 0..cells.len());
        Ok(())
    }

    fn reset(&mut self) {}
}
