//! USB displays through Linux hidraw nodes.
//!
//! Devices are found by walking `/sys/class/hidraw` and matching the
//! `HID_ID` line of each node's `uevent` file against the driver's channel
//! table, in table order. Output is split into fixed-size reports padded with
//! the channel's filler byte.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::{poll_readable, Transport, TransportKind, UsbChannelDefinition};

const HIDRAW_CLASS: &str = "/sys/class/hidraw";
const MAX_INPUT_REPORT: usize = 256;

/// Identity of one hidraw node as reported by sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HidNode {
    vendor: u16,
    product: u16,
    serial_number: Option<String>,
}

/// Parse a hidraw `uevent` file.
///
/// `HID_ID` has the form `BUS:VENDOR:PRODUCT` with 32-bit hex fields.
fn parse_uevent(text: &str) -> Option<HidNode> {
    let mut node = None;
    let mut serial_number = None;
    for line in text.lines() {
        if let Some(id) = line.strip_prefix("HID_ID=") {
            let mut fields = id.split(':').skip(1);
            let vendor = u32::from_str_radix(fields.next()?, 16).ok()?;
            let product = u32::from_str_radix(fields.next()?, 16).ok()?;
            node = Some((vendor as u16, product as u16));
        } else if let Some(uniq) = line.strip_prefix("HID_UNIQ=") {
            if !uniq.is_empty() {
                serial_number = Some(uniq.to_string());
            }
        }
    }
    node.map(|(vendor, product)| HidNode {
        vendor,
        product,
        serial_number,
    })
}

fn matching_channel(
    node: &HidNode,
    channels: &[UsbChannelDefinition],
    serial_number: Option<&str>,
) -> Option<UsbChannelDefinition> {
    if let Some(wanted) = serial_number {
        if node.serial_number.as_deref() != Some(wanted) {
            return None;
        }
    }
    channels
        .iter()
        .find(|c| c.vendor == node.vendor && c.product == node.product)
        .copied()
}

fn hidraw_nodes(class_dir: &Path) -> io::Result<Vec<(PathBuf, HidNode)>> {
    let mut nodes = Vec::new();
    for entry in fs::read_dir(class_dir)? {
        let entry = entry?;
        let uevent = entry.path().join("device").join("uevent");
        let Ok(text) = fs::read_to_string(&uevent) else {
            continue;
        };
        if let Some(node) = parse_uevent(&text) {
            nodes.push((Path::new("/dev").join(entry.file_name()), node));
        }
    }
    nodes.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(nodes)
}

/// Split `data` into reports of `size` bytes, each prefixed by report id 0.
fn output_reports(data: &[u8], size: usize, filler: u8) -> Vec<Vec<u8>> {
    if size == 0 {
        let mut report = Vec::with_capacity(data.len() + 1);
        report.push(0);
        report.extend_from_slice(data);
        return vec![report];
    }
    data.chunks(size)
        .map(|chunk| {
            let mut report = vec![filler; size + 1];
            report[0] = 0;
            report[1..=chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

pub struct HidTransport {
    file: Option<File>,
    channel: UsbChannelDefinition,
    pending: Vec<u8>,
}

impl HidTransport {
    /// Open the first hidraw node matching one of `channels`.
    pub fn open(
        channels: &[UsbChannelDefinition],
        serial_number: Option<&str>,
    ) -> io::Result<(Self, UsbChannelDefinition)> {
        for (path, node) in hidraw_nodes(Path::new(HIDRAW_CLASS))? {
            let Some(channel) = matching_channel(&node, channels, serial_number) else {
                continue;
            };
            debug!(
                "claiming {} ({:04X}:{:04X})",
                path.display(),
                node.vendor,
                node.product
            );
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let transport = Self {
                file: Some(file),
                channel,
                pending: Vec::new(),
            };
            return Ok((transport, channel));
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no matching USB display found",
        ))
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "USB device closed"))
    }

    /// Wait for the device to have a report ready.
    fn poll(&mut self, timeout: Duration) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let fd = self.file()?.as_raw_fd();
        poll_readable(fd, timeout)
    }
}

impl Transport for HidTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.pending.is_empty() {
            if !self.poll(timeout)? {
                return Ok(0);
            }
            let mut report = [0u8; MAX_INPUT_REPORT];
            let count = self.file()?.read(&mut report)?;
            self.pending.extend_from_slice(&report[..count]);
        }
        let count = buf.len().min(self.pending.len());
        buf[..count].copy_from_slice(&self.pending[..count]);
        self.pending.drain(..count);
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let reports = output_reports(data, self.channel.report_size, self.channel.report_filler);
        let file = self.file()?;
        for report in reports {
            file.write_all(&report)?;
        }
        Ok(data.len())
    }

    fn await_input(&mut self, timeout: Duration) -> io::Result<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        self.poll(timeout)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        let mut scratch = [0u8; MAX_INPUT_REPORT];
        while self.poll(Duration::ZERO)? {
            if self.file()?.read(&mut scratch)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.file = None;
        Ok(())
    }
}
