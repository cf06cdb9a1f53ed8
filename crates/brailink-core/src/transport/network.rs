//! TCP connections to network-attached displays and simulators.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{Transport, TransportKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NetworkTransport {
    stream: Option<TcpStream>,
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

impl NetworkTransport {
    pub fn open(host: &str, port: u16) -> io::Result<Self> {
        let mut last_error = None;
        for address in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&address, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Self {
                        stream: Some(stream),
                    });
                }
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}:{}", host, port),
            )
        }))
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }

    /// Apply `timeout` to the next read. A zero timeout polls.
    fn prepare_read(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
        if timeout.is_zero() {
            stream.set_nonblocking(true)
        } else {
            stream.set_nonblocking(false)?;
            stream.set_read_timeout(Some(timeout))
        }
    }
}

impl Transport for NetworkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let stream = self.stream()?;
        Self::prepare_read(stream, timeout)?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(count) => Ok(count),
            Err(error) if is_timeout(&error) => Ok(0),
            Err(error) => Err(error),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        stream.set_nonblocking(false)?;
        stream.write_all(data)?;
        Ok(data.len())
    }

    fn await_input(&mut self, timeout: Duration) -> io::Result<bool> {
        let stream = self.stream()?;
        Self::prepare_read(stream, timeout)?;
        let mut peeked = [0u8; 1];
        match stream.peek(&mut peeked) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(_) => Ok(true),
            Err(error) if is_timeout(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 256];
        while self.read(&mut scratch, Duration::ZERO)? > 0 {}
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let port = listener.local_addr().unwrap().port();

        let mut transport = NetworkTransport::open("127.0.0.1", port).expect("connect");
        let (mut peer, _) = listener.accept().expect("accept");

        assert!(
            !transport.await_input(Duration::from_millis(10)).unwrap(),
            "nothing sent yet"
        );

        peer.write_all(&[0x02, 0x53]).unwrap();
        assert!(transport.await_input(Duration::from_millis(500)).unwrap());

        let mut buf = [0u8; 8];
        let count = transport.read(&mut buf, Duration::from_millis(500)).unwrap();
        assert_eq!(&buf[..count], &[0x02, 0x53]);

        transport.write(&[0x41]).unwrap();
        let mut reply = [0u8; 1];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [0x41]);
    }

    #[test]
    fn test_closed_transport_reports_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let port = listener.local_addr().unwrap().port();
        let mut transport = NetworkTransport::open("127.0.0.1", port).expect("connect");

        transport.close().unwrap();
        let error = transport.write(&[1]).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
    }
}
