//! Serial ports through the `serialport` crate.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

use super::{FlowControl, Parity, SerialParameters, Transport, TransportKind};

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    /// Byte consumed by `await_input`, returned by the next read.
    peeked: Option<u8>,
}

fn data_bits(bits: u8) -> io::Result<serialport::DataBits> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported data bits: {}", other),
        )),
    }
}

fn stop_bits(bits: u8) -> io::Result<serialport::StopBits> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported stop bits: {}", other),
        )),
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    }
}

fn check_baud(baud: u32) -> io::Result<()> {
    if (1200..=115_200).contains(&baud) {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported baud rate: {}", baud),
        ))
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

impl SerialTransport {
    pub fn open(path: &Path, parameters: &SerialParameters) -> io::Result<Self> {
        check_baud(parameters.baud)?;
        let port = serialport::new(path.to_string_lossy(), parameters.baud)
            .data_bits(data_bits(parameters.data_bits)?)
            .stop_bits(stop_bits(parameters.stop_bits)?)
            .parity(parity(parameters.parity))
            .flow_control(flow_control(parameters.flow_control))
            .timeout(Duration::ZERO)
            .open()?;
        Ok(Self {
            port: Some(port),
            peeked: None,
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.peeked.take() {
            buf[0] = byte;
            return Ok(1);
        }

        let port = self.port()?;
        port.set_timeout(timeout)?;
        match port.read(buf) {
            Ok(count) => Ok(count),
            Err(error) if is_timeout(&error) => Ok(0),
            Err(error) => Err(error),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let port = self.port()?;
        let count = port.write(data)?;
        port.flush()?;
        Ok(count)
    }

    fn await_input(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        let mut byte = [0u8; 1];
        if self.read(&mut byte, timeout)? == 0 {
            return Ok(false);
        }
        self.peeked = Some(byte[0]);
        Ok(true)
    }

    fn reconfigure(&mut self, parameters: &SerialParameters) -> io::Result<()> {
        check_baud(parameters.baud)?;
        let port = self.port()?;
        port.set_baud_rate(parameters.baud)?;
        port.set_data_bits(data_bits(parameters.data_bits)?)?;
        port.set_stop_bits(stop_bits(parameters.stop_bits)?)?;
        port.set_parity(parity(parameters.parity))?;
        port.set_flow_control(flow_control(parameters.flow_control))?;
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.peeked = None;
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.peeked = None;
        self.port = None;
        Ok(())
    }
}
