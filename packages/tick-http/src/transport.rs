use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::Duration,
};

use tracing::{debug, trace};

/// A byte-oriented duplex stream, the only transport primitive the engine
/// consumes. Implementations wrap a TCP socket, but nothing in the engine
/// assumes more than the capabilities below.
pub trait ByteStream {
    /// Reads into `buf`, waiting up to the configured read timeout for data
    /// to arrive. `Ok(0)` means the peer has closed its side.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer, honoring the configured write timeout.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Number of bytes readable right now without waiting. `Ok(0)` means no
    /// data is pending; a closed peer reports `ErrorKind::UnexpectedEof`.
    fn available(&mut self) -> io::Result<usize>;

    fn is_connected(&self) -> bool;

    fn close(&mut self);

    fn set_read_timeout(&mut self, timeout: Duration);

    fn set_write_timeout(&mut self, timeout: Duration);

    fn set_nodelay(&mut self, nodelay: bool);

    /// Fills `buf` completely or fails with `UnexpectedEof`.
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }
        Ok(())
    }
}

/// Opens outbound streams. The client is generic over this so tests can
/// substitute scripted in-memory connections.
pub trait Connect {
    type Stream: ByteStream;

    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> io::Result<Self::Stream>;
}

/// Produces inbound sessions for the server. `accept` must never block.
pub trait Listen {
    type Stream: ByteStream;

    fn accept(&mut self) -> io::Result<Option<Self::Stream>>;

    /// The port peers should use to reach this listener.
    fn local_port(&self) -> u16;

    fn close(&mut self);
}

/// [`ByteStream`] over a `std::net::TcpStream`.
///
/// The socket stays in blocking mode with OS-level read/write timeouts;
/// `available` flips to non-blocking for a single `peek` so a tick can poll
/// without stalling.
pub struct TcpByteStream {
    stream: TcpStream,
    connected: bool,
}

impl TcpByteStream {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            connected: true,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }
}

impl ByteStream for TcpByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.connected {
            return Ok(0);
        }
        match self.stream.read(buf) {
            Ok(0) => {
                self.connected = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(io::ErrorKind::TimedOut.into())
            }
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match Write::write_all(&mut self.stream, buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    fn available(&mut self) -> io::Result<usize> {
        if !self.connected {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.stream.set_nonblocking(true)?;
        let mut probe = [0u8; 512];
        let result = self.stream.peek(&mut probe);
        self.stream.set_nonblocking(false)?;

        match result {
            Ok(0) => {
                self.connected = false;
                Err(io::ErrorKind::UnexpectedEof.into())
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        if self.connected {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.connected = false;
        }
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        let _ = self.stream.set_read_timeout(Some(timeout));
    }

    fn set_write_timeout(&mut self, timeout: Duration) {
        let _ = self.stream.set_write_timeout(Some(timeout));
    }

    fn set_nodelay(&mut self, nodelay: bool) {
        let _ = self.stream.set_nodelay(nodelay);
    }
}

/// [`Connect`] over plain TCP. Name resolution picks the first address.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

impl Connect for TcpConnector {
    type Stream = TcpByteStream;

    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> io::Result<Self::Stream> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::other(format!("no address for {host}:{port}")))?;

        trace!(%addr, "connecting");
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        TcpByteStream::new(stream)
    }
}

/// [`Listen`] over a non-blocking `std::net::TcpListener`.
pub struct TcpListenerSource {
    listener: TcpListener,
    port: u16,
}

impl TcpListenerSource {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        debug!(port, "listener bound");
        Ok(Self { listener, port })
    }
}

impl Listen for TcpListenerSource {
    type Stream = TcpByteStream;

    fn accept(&mut self) -> io::Result<Option<Self::Stream>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                trace!(%addr, "accepted session");
                stream.set_nonblocking(false)?;
                Ok(Some(TcpByteStream::new(stream)?))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn close(&mut self) {
        // Dropping the listener closes the socket; switching to a fresh bind
        // requires constructing a new source.
    }
}
