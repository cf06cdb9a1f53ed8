//! Bluetooth RFCOMM sockets (Linux BlueZ).

use std::fs::File;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::{poll_readable, Transport, TransportKind};

/// Parse `AA:BB:CC:DD:EE:FF` into the little-endian byte order BlueZ uses.
fn parse_address(text: &str) -> Option<[u8; 6]> {
    let mut address = [0u8; 6];
    let mut parts = text.split(':');
    for slot in address.iter_mut().rev() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(address)
}

#[cfg(target_os = "linux")]
fn connect(address: [u8; 6], channel: u8) -> io::Result<File> {
    use std::os::unix::io::FromRawFd;

    const BTPROTO_RFCOMM: libc::c_int = 3;

    #[repr(C)]
    struct SockaddrRc {
        rc_family: libc::sa_family_t,
        rc_bdaddr: [u8; 6],
        rc_channel: u8,
    }

    // SAFETY: socket() takes no pointers; the result is checked below.
    let fd = unsafe { libc::socket(libc::AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created socket that nothing else owns.
    let file = unsafe { File::from_raw_fd(fd) };

    let socket_address = SockaddrRc {
        rc_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address,
        rc_channel: channel,
    };
    // SAFETY: socket_address outlives the call and the length passed is its
    // exact size.
    let result = unsafe {
        libc::connect(
            fd,
            &socket_address as *const SockaddrRc as *const libc::sockaddr,
            std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

#[cfg(not(target_os = "linux"))]
fn connect(_address: [u8; 6], _channel: u8) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "bluetooth connections need Linux",
    ))
}

pub struct RfcommTransport {
    socket: Option<File>,
}

impl RfcommTransport {
    pub fn open(address: &str, channel: u8) -> io::Result<Self> {
        let parsed = parse_address(address).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid bluetooth address: {}", address),
            )
        })?;
        let socket = connect(parsed, channel)?;
        Ok(Self {
            socket: Some(socket),
        })
    }

    fn socket(&mut self) -> io::Result<&mut File> {
        self.socket
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "bluetooth closed"))
    }
}

impl Transport for RfcommTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use std::os::unix::io::AsRawFd;

        let socket = self.socket()?;
        if !poll_readable(socket.as_raw_fd(), timeout)? {
            return Ok(0);
        }
        match socket.read(buf)? {
            0 if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bluetooth peer disconnected",
            )),
            count => Ok(count),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let socket = self.socket()?;
        socket.write_all(data)?;
        Ok(data.len())
    }

    fn await_input(&mut self, timeout: Duration) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let fd = self.socket()?.as_raw_fd();
        poll_readable(fd, timeout)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 256];
        while self.read(&mut scratch, Duration::ZERO)? > 0 {}
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.socket = None;
        Ok(())
    }
}
