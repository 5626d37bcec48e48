//! Raw byte transport to the rack.
//!
//! The protocol is strictly half duplex: one request frame is sent, then one
//! response is received with a single read. [`execute`] performs exactly that
//! exchange on any [`Transport`].

use crate::protocol::MAX_RESPONSE_LEN;
use crate::{Error, Result};
use log::*;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default bound for establishing the TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// A bidirectional byte link to the rack.
pub trait Transport: Send {
    /// Sends `frame` with a single write, returning the number of bytes written.
    fn send(&mut self, frame: &[u8]) -> io::Result<usize>;

    /// Receives at most `buf.len()` bytes with a single read.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Closes the link. Further sends and receives fail.
    fn shutdown(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        (**self).send(frame)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// TCP connection to the rack.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connects to `host:port`, trying every resolved address in turn.
    ///
    /// Each attempt is bounded by `connect_timeout`. An `io_timeout` bounds
    /// every later send and receive; `None` blocks indefinitely.
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        io_timeout: Option<Duration>,
    ) -> Result<Self> {
        let target = format!("{host}:{port}");
        let connection_error = |source| Error::Connection {
            target: target.clone(),
            source,
        };

        let mut last_error = None;
        for addr in (host, port).to_socket_addrs().map_err(connection_error)? {
            trace!("Trying {addr} with a timeout of {connect_timeout:?}");
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    let io_timeout = io_timeout.filter(|timeout| !timeout.is_zero());
                    stream
                        .set_read_timeout(io_timeout)
                        .and_then(|()| stream.set_write_timeout(io_timeout))
                        .and_then(|()| stream.set_nodelay(true))
                        .map_err(connection_error)?;
                    return Ok(Self { stream, peer: addr });
                }
                Err(err) => {
                    debug!("Connection attempt to {addr} failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(connection_error(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host did not resolve to any address")
        })))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.stream.write(frame)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!("Shutdown of connection to {} failed: {err}", self.peer);
        }
    }
}

/// Sends one request frame and returns the raw response bytes.
///
/// The whole frame has to be accepted by a single send; a short write is a
/// transport failure. A receive of zero bytes means the rack closed the
/// connection.
pub fn execute<T: Transport + ?Sized>(transport: &mut T, frame: &[u8]) -> Result<Vec<u8>> {
    trace!("Sending {frame:02X?}");
    let sent = transport.send(frame)?;
    if sent != frame.len() {
        return Err(Error::ShortWrite {
            sent,
            expected: frame.len(),
        });
    }

    let mut buf = [0u8; MAX_RESPONSE_LEN];
    let received = transport.recv(&mut buf)?;
    if received == 0 {
        return Err(Error::ConnectionClosed);
    }
    trace!("Received {:02X?}", &buf[..received]);
    Ok(buf[..received].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Scripted {
        sent: Vec<Vec<u8>>,
        accept: Option<usize>,
        responses: VecDeque<Vec<u8>>,
    }

    impl Transport for Scripted {
        fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
            self.sent.push(frame.to_vec());
            Ok(self.accept.unwrap_or(frame.len()))
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let response = self.responses.pop_front().unwrap_or_default();
            let len = response.len().min(buf.len());
            buf[..len].copy_from_slice(&response[..len]);
            Ok(len)
        }
    }

    #[test]
    fn exchange_returns_response() {
        let mut transport = Scripted {
            responses: VecDeque::from([vec![0, 0, 0, 0, 0, 5, 1, 4, 2, 0x0F, 0xFF]]),
            ..Default::default()
        };
        let response = execute(&mut transport, &[1, 2, 3]).unwrap();
        assert_eq!(response.len(), 11);
        assert_eq!(transport.sent, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn short_write_is_an_error() {
        let mut transport = Scripted {
            accept: Some(2),
            ..Default::default()
        };
        assert_matches!(
            execute(&mut transport, &[1, 2, 3]),
            Err(Error::ShortWrite { sent: 2, expected: 3 })
        );
    }

    #[test]
    fn response_is_limited_to_one_read() {
        let mut transport = Scripted {
            responses: VecDeque::from([vec![0xAA; 300]]),
            ..Default::default()
        };
        let response = execute(&mut transport, &[0]).unwrap();
        assert_eq!(response.len(), MAX_RESPONSE_LEN);
    }

    #[test]
    fn empty_read_means_closed() {
        let mut transport = Scripted::default();
        assert_matches!(execute(&mut transport, &[0]), Err(Error::ConnectionClosed));
    }

    #[test]
    fn refused_connection_is_reported() {
        // Bind and drop a listener to get a local port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        assert_matches!(
            TcpTransport::connect("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT, None),
            Err(Error::Connection { .. })
        );
    }
}
