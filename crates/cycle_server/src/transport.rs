//! Byte-stream transport abstraction.
//!
//! The core only needs a reliable, ordered, connection-oriented stream with
//! send/recv/close. [`TcpTransport`] is the production implementation; tests
//! plug in scripted in-memory transports.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

/// Backoff used when a non-blocking socket cannot take more bytes yet.
const WRITE_RETRY_BACKOFF: Duration = Duration::from_micros(200);

/// A reliable byte stream shared between the threads that use it.
///
/// All methods take `&self`: the registry hands out access to one thread at
/// a time per operation, and the relay reads and writes the same stream from
/// two threads.
pub trait Transport: Send + Sync + 'static {
    /// Writes all of `data`.
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Reads available bytes into `buf`.
    ///
    /// `Ok(0)` means the peer closed the stream. A non-blocking transport
    /// reports "nothing pending" as `ErrorKind::WouldBlock`.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Shuts the stream down in both directions, unblocking pending reads.
    fn close(&self) -> io::Result<()>;

    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// TCP stream transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wraps an accepted or connected stream.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self { stream, peer }
    }

    /// Opens a blocking connection to `addr`.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Prepares a server-side stream for cycle polling: non-blocking reads
    /// and no Nagle delay on sense payloads.
    pub fn accepted(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl Transport for TcpTransport {
    fn send(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match (&self.stream).write(data) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ))
                }
                Ok(written) => data = &data[written..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(WRITE_RETRY_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.stream).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpTransport::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let server = TcpTransport::new(stream);

        client.send(b"(init)").unwrap();
        let mut buf = [0u8; 16];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"(init)");
        assert_eq!(server.peer_addr(), client.stream.local_addr().ok());
    }

    #[test]
    fn test_accepted_stream_reports_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpTransport::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let server = TcpTransport::accepted(stream).unwrap();

        let mut buf = [0u8; 8];
        let err = server.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_close_is_observed_as_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpTransport::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let server = TcpTransport::new(stream);

        client.close().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(server.recv(&mut buf).unwrap(), 0);
    }
}
