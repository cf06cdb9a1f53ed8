//! Byte transports and the buffered endpoint drivers read from.
//!
//! A driver declares the connections it accepts with a
//! [`ResourceDescriptor`]; the host supplies a device identifier string.
//! [`Endpoint::connect`] parses the identifier, checks it against the
//! descriptor and opens the matching [`Transport`].
//!
//! | Identifier | Transport |
//! |------------|-----------|
//! | `serial:/dev/ttyUSB0`, `/dev/ttyS0`, `ttyS0` | [`serial::SerialTransport`] |
//! | `usb:`, `usb:SERIAL` | [`usb::HidTransport`] (Linux hidraw) |
//! | `bluetooth:ADDR`, `bt:ADDR` | [`bluetooth::RfcommTransport`] |
//! | `net:HOST:PORT`, `HOST:PORT` | [`network::NetworkTransport`] |

pub mod bluetooth;
pub mod mock;
pub mod network;
pub mod serial;
pub mod usb;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Timing;
use crate::error::{BrailleError, Result};

pub use mock::{MockHandle, MockTransport};

/// Which kind of connection a transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Serial,
    Usb,
    Bluetooth,
    Network,
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Serial => "serial",
            TransportKind::Usb => "usb",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Network => "network",
            TransportKind::Mock => "mock",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    Hardware,
}

/// Line settings for a serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParameters {
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl SerialParameters {
    /// 8 data bits, no parity, 1 stop bit.
    pub const fn new(baud: u32) -> Self {
        Self {
            baud,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }

    pub const fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub const fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Bits on the wire per character, start bit included.
    pub fn character_size(&self) -> u32 {
        let parity = match self.parity {
            Parity::None => 0,
            Parity::Odd | Parity::Even => 1,
        };
        1 + u32::from(self.data_bits) + parity + u32::from(self.stop_bits)
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.baud / self.character_size()
    }
}

/// A USB device a driver can claim, matched by vendor and product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbChannelDefinition {
    pub vendor: u16,
    pub product: u16,
    /// Serial settings of the device's internal UART, if it has one.
    pub serial: Option<SerialParameters>,
    /// Output report size; writes are split into reports of this size.
    /// Zero writes the data unchanged.
    pub report_size: usize,
    /// Byte used to pad the last output report.
    pub report_filler: u8,
}

/// Connections a driver accepts and how to set them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub serial: Option<SerialParameters>,
    pub usb: &'static [UsbChannelDefinition],
    pub bluetooth_channel: Option<u8>,
    pub network_port: Option<u16>,
    /// Pause after opening before the first byte is sent.
    pub ready_delay_ms: u64,
}

impl ResourceDescriptor {
    pub const fn serial(parameters: SerialParameters) -> Self {
        Self {
            serial: Some(parameters),
            usb: &[],
            bluetooth_channel: None,
            network_port: None,
            ready_delay_ms: 0,
        }
    }

    pub const fn with_usb(mut self, channels: &'static [UsbChannelDefinition]) -> Self {
        self.usb = channels;
        self
    }

    pub const fn with_bluetooth(mut self, channel: u8) -> Self {
        self.bluetooth_channel = Some(channel);
        self
    }

    pub const fn with_network(mut self, port: u16) -> Self {
        self.network_port = Some(port);
        self
    }

    pub const fn with_ready_delay(mut self, millis: u64) -> Self {
        self.ready_delay_ms = millis;
        self
    }

    /// Connection kinds this descriptor allows.
    pub fn kinds(&self) -> Vec<TransportKind> {
        let mut kinds = Vec::new();
        if self.serial.is_some() {
            kinds.push(TransportKind::Serial);
        }
        if !self.usb.is_empty() {
            kinds.push(TransportKind::Usb);
        }
        if self.bluetooth_channel.is_some() {
            kinds.push(TransportKind::Bluetooth);
        }
        if self.network_port.is_some() {
            kinds.push(TransportKind::Network);
        }
        kinds
    }
}

/// A parsed device identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdentifier {
    Serial(PathBuf),
    Usb { serial_number: Option<String> },
    Bluetooth { address: String },
    Network { host: String, port: Option<u16> },
}

impl DeviceIdentifier {
    pub fn parse(identifier: &str) -> Result<Self> {
        let unsupported = || BrailleError::UnsupportedIdentifier(identifier.to_string());
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(unsupported());
        }

        if let Some((prefix, rest)) = identifier.split_once(':') {
            match prefix {
                "serial" => {
                    if rest.is_empty() {
                        return Err(unsupported());
                    }
                    return Ok(DeviceIdentifier::Serial(serial_path(rest)));
                }
                "usb" => {
                    let serial_number = (!rest.is_empty()).then(|| rest.to_string());
                    return Ok(DeviceIdentifier::Usb { serial_number });
                }
                "bluetooth" | "bt" => {
                    if rest.is_empty() {
                        return Err(unsupported());
                    }
                    return Ok(DeviceIdentifier::Bluetooth {
                        address: rest.to_string(),
                    });
                }
                "net" => return parse_network(rest).ok_or_else(unsupported),
                _ => return parse_network(identifier).ok_or_else(unsupported),
            }
        }

        if identifier.starts_with('/') || identifier.starts_with("tty") {
            return Ok(DeviceIdentifier::Serial(serial_path(identifier)));
        }

        Err(unsupported())
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            DeviceIdentifier::Serial(_) => TransportKind::Serial,
            DeviceIdentifier::Usb { .. } => TransportKind::Usb,
            DeviceIdentifier::Bluetooth { .. } => TransportKind::Bluetooth,
            DeviceIdentifier::Network { .. } => TransportKind::Network,
        }
    }
}

fn serial_path(name: &str) -> PathBuf {
    if name.starts_with('/') {
        PathBuf::from(name)
    } else {
        PathBuf::from("/dev").join(name)
    }
}

fn parse_network(text: &str) -> Option<DeviceIdentifier> {
    let (host, port) = match text.rsplit_once(':') {
        Some((host, port)) => (host, Some(port.parse::<u16>().ok()?)),
        None => (text, None),
    };
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some(DeviceIdentifier::Network {
        host: host.to_string(),
        port,
    })
}

/// A byte stream to or from a display.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Read whatever is available, waiting at most `timeout`.
    /// Returns 0 when the timeout expires with nothing read.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Wait until input is available or the timeout expires.
    fn await_input(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Change line settings. Only serial-like transports support this.
    fn reconfigure(&mut self, _parameters: &SerialParameters) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} transport cannot change line settings", self.kind()),
        ))
    }

    fn discard_input(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// Wait until `fd` is readable or `timeout` expires.
fn poll_readable(fd: std::os::unix::io::RawFd, timeout: Duration) -> io::Result<bool> {
    let mut descriptor = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: descriptor is a valid pollfd for the duration of the call and
    // the count passed is 1.
    let ready = unsafe { libc::poll(&mut descriptor, 1, millis) };
    if ready < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(error);
    }
    if descriptor.revents & libc::POLLIN == 0
        && descriptor.revents & (libc::POLLERR | libc::POLLHUP) != 0
    {
        return Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "device disconnected",
        ));
    }
    Ok(ready > 0)
}

const INPUT_BUFFER_SIZE: usize = 64;

/// A transport plus a small input buffer and link-speed bookkeeping.
pub struct Endpoint {
    transport: Box<dyn Transport>,
    input: [u8; INPUT_BUFFER_SIZE],
    from: usize,
    to: usize,
    bytes_per_second: u32,
    initial_timeout: Duration,
    continuation_timeout: Duration,
}

impl Endpoint {
    /// Open the transport named by `identifier`, if `resource` allows it.
    pub fn connect(
        driver: &str,
        identifier: &DeviceIdentifier,
        resource: &ResourceDescriptor,
        timing: &Timing,
    ) -> Result<Self> {
        let no_transport = || BrailleError::NoTransport {
            driver: driver.to_string(),
            kind: identifier.kind().to_string(),
        };

        let (transport, bytes_per_second): (Box<dyn Transport>, u32) = match identifier {
            DeviceIdentifier::Serial(path) => {
                let parameters = resource.serial.ok_or_else(no_transport)?;
                let port = serial::SerialTransport::open(path, &parameters)?;
                (Box::new(port), parameters.bytes_per_second())
            }
            DeviceIdentifier::Usb { serial_number } => {
                if resource.usb.is_empty() {
                    return Err(no_transport());
                }
                let (device, channel) =
                    usb::HidTransport::open(resource.usb, serial_number.as_deref())?;
                let bps = channel.serial.map_or(0, |p| p.bytes_per_second());
                (Box::new(device), bps)
            }
            DeviceIdentifier::Bluetooth { address } => {
                let channel = resource.bluetooth_channel.ok_or_else(no_transport)?;
                let socket = bluetooth::RfcommTransport::open(address, channel)?;
                (Box::new(socket), 0)
            }
            DeviceIdentifier::Network { host, port } => {
                let default_port = resource.network_port.ok_or_else(no_transport)?;
                let stream = network::NetworkTransport::open(host, port.unwrap_or(default_port))?;
                (Box::new(stream), 0)
            }
        };

        debug!(
            "connected {} transport for {} ({} bytes/s)",
            identifier.kind(),
            driver,
            bytes_per_second
        );

        let mut endpoint = Self::from_transport(transport, bytes_per_second, timing);
        if resource.ready_delay_ms > 0 {
            thread::sleep(Duration::from_millis(resource.ready_delay_ms));
        }
        endpoint.discard_input()?;
        Ok(endpoint)
    }

    /// Wrap an already-open transport.
    pub fn from_transport(
        transport: Box<dyn Transport>,
        bytes_per_second: u32,
        timing: &Timing,
    ) -> Self {
        Self {
            transport,
            input: [0; INPUT_BUFFER_SIZE],
            from: 0,
            to: 0,
            bytes_per_second,
            initial_timeout: timing.initial_timeout(),
            continuation_timeout: timing.continuation_timeout(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.bytes_per_second
    }

    /// Next input byte. The first byte of a frame is read with the initial
    /// timeout (`wait == false`), later ones with the continuation timeout.
    pub fn read_byte(&mut self, wait: bool) -> io::Result<Option<u8>> {
        if self.from == self.to {
            let timeout = if wait {
                self.continuation_timeout
            } else {
                self.initial_timeout
            };
            let count = self.transport.read(&mut self.input, timeout)?;
            if count == 0 {
                return Ok(None);
            }
            self.from = 0;
            self.to = count;
        }

        let byte = self.input[self.from];
        self.from += 1;
        Ok(Some(byte))
    }

    pub fn await_input(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.from < self.to {
            return Ok(true);
        }
        self.transport.await_input(timeout)
    }

    /// Write all of `data`, logging a failure before returning it.
    pub fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            match self.transport.write(&data[offset..]) {
                Ok(0) => {
                    let error = io::Error::new(io::ErrorKind::WriteZero, "transport refused data");
                    warn!("{} write failed: {}", self.kind(), error);
                    return Err(error);
                }
                Ok(count) => offset += count,
                Err(error) => {
                    warn!("{} write failed: {}", self.kind(), error);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Milliseconds the link needs to carry `count` bytes, 0 if unknown.
    pub fn millis_to_transfer(&self, count: usize) -> u64 {
        if self.bytes_per_second == 0 {
            return 0;
        }
        (count as u64 * 1000) / u64::from(self.bytes_per_second) + 1
    }

    pub fn reconfigure(&mut self, parameters: &SerialParameters) -> io::Result<()> {
        self.transport.reconfigure(parameters)?;
        self.bytes_per_second = parameters.bytes_per_second();
        debug!("link reconfigured to {} baud", parameters.baud);
        Ok(())
    }

    pub fn discard_input(&mut self) -> io::Result<()> {
        self.from = 0;
        self.to = 0;
        self.transport.discard_input()
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.from = 0;
        self.to = 0;
        self.transport.close()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind())
            .field("buffered", &(self.to - self.from))
            .field("bytes_per_second", &self.bytes_per_second)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial_forms() {
        assert_eq!(
            DeviceIdentifier::parse("serial:/dev/ttyUSB0").unwrap(),
            DeviceIdentifier::Serial(PathBuf::from("/dev/ttyUSB0"))
        );
        assert_eq!(
            DeviceIdentifier::parse("/dev/ttyS1").unwrap(),
            DeviceIdentifier::Serial(PathBuf::from("/dev/ttyS1"))
        );
        assert_eq!(
            DeviceIdentifier::parse("ttyS0").unwrap(),
            DeviceIdentifier::Serial(PathBuf::from("/dev/ttyS0")),
            "bare names resolve under /dev"
        );
    }

    #[test]
    fn test_parse_usb_and_bluetooth() {
        assert_eq!(
            DeviceIdentifier::parse("usb:").unwrap(),
            DeviceIdentifier::Usb {
                serial_number: None
            }
        );
        assert_eq!(
            DeviceIdentifier::parse("usb:A1234").unwrap(),
            DeviceIdentifier::Usb {
                serial_number: Some("A1234".into())
            }
        );
        assert_eq!(
            DeviceIdentifier::parse("bt:00:11:22:33:44:55").unwrap(),
            DeviceIdentifier::Bluetooth {
                address: "00:11:22:33:44:55".into()
            }
        );
    }

    #[test]
    fn test_parse_network() {
        assert_eq!(
            DeviceIdentifier::parse("localhost:5000").unwrap(),
            DeviceIdentifier::Network {
                host: "localhost".into(),
                port: Some(5000)
            }
        );
        assert_eq!(
            DeviceIdentifier::parse("net:braille.local").unwrap(),
            DeviceIdentifier::Network {
                host: "braille.local".into(),
                port: None
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in ["", "   ", "floppy", "serial:", "bluetooth:", "host:notaport"] {
            let result = DeviceIdentifier::parse(text);
            assert!(
                matches!(result, Err(BrailleError::UnsupportedIdentifier(_))),
                "'{}' should be rejected, got {:?}",
                text,
                result
            );
        }
    }

    #[test]
    fn test_character_size_and_rate() {
        let plain = SerialParameters::new(9600);
        assert_eq!(plain.character_size(), 10);
        assert_eq!(plain.bytes_per_second(), 960);

        let even = SerialParameters::new(9600).with_parity(Parity::Even);
        assert_eq!(even.character_size(), 11);
        assert_eq!(even.bytes_per_second(), 872);
    }

    #[test]
    fn test_millis_to_transfer() {
        let (transport, _handle) = MockTransport::new();
        let endpoint = Endpoint::from_transport(Box::new(transport), 960, &Timing::immediate());
        assert_eq!(endpoint.millis_to_transfer(96), 101);

        let (transport, _handle) = MockTransport::new();
        let unknown = Endpoint::from_transport(Box::new(transport), 0, &Timing::immediate());
        assert_eq!(unknown.millis_to_transfer(96), 0, "unknown rate adds no delay");
    }

    #[test]
    fn test_read_byte_buffers_transport_reads() {
        let (transport, handle) = MockTransport::new();
        handle.push_input(&[1, 2, 3]);
        let mut endpoint = Endpoint::from_transport(Box::new(transport), 0, &Timing::immediate());

        assert_eq!(endpoint.read_byte(false).unwrap(), Some(1));
        assert_eq!(endpoint.read_byte(true).unwrap(), Some(2));
        assert_eq!(endpoint.read_byte(true).unwrap(), Some(3));
        assert_eq!(endpoint.read_byte(true).unwrap(), None);
    }

    #[test]
    fn test_reconfigure_updates_rate() {
        let (transport, handle) = MockTransport::new();
        let mut endpoint =
            Endpoint::from_transport(Box::new(transport), 960, &Timing::immediate());
        endpoint
            .reconfigure(&SerialParameters::new(19200))
            .expect("mock accepts reconfiguration");
        assert_eq!(endpoint.bytes_per_second(), 1920);
        assert_eq!(handle.bauds(), vec![19200]);
    }

    #[test]
    fn test_descriptor_kinds() {
        static CHANNELS: [UsbChannelDefinition; 1] = [UsbChannelDefinition {
            vendor: 0xC251,
            product: 0x1122,
            serial: None,
            report_size: 64,
            report_filler: 0x55,
        }];
        let resource = ResourceDescriptor::serial(SerialParameters::new(9600))
            .with_usb(&CHANNELS)
            .with_bluetooth(1);
        assert_eq!(
            resource.kinds(),
            vec![
                TransportKind::Serial,
                TransportKind::Usb,
                TransportKind::Bluetooth
            ]
        );
    }

    #[test]
    fn test_connect_rejects_undeclared_kind() {
        let resource = ResourceDescriptor::serial(SerialParameters::new(9600));
        let identifier = DeviceIdentifier::parse("localhost:7000").unwrap();
        let result = Endpoint::connect("np", &identifier, &resource, &Timing::immediate());
        assert!(matches!(result, Err(BrailleError::NoTransport { .. })));
    }
}
