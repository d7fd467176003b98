//! In-memory transports for exercising the engine without sockets.
//!
//! A [`MockStream`] is one end of a scripted connection: tests push the bytes
//! the engine should read through the shared [`MockWire`] handle and inspect
//! everything the engine wrote. Delivery can be throttled to one byte per
//! read to simulate slow peers.

use std::{cell::RefCell, collections::VecDeque, io, rc::Rc, time::Duration};

use crate::transport::{ByteStream, Connect, Listen};

#[derive(Default)]
struct WireState {
    to_read: VecDeque<u8>,
    written: Vec<u8>,
    remote_closed: bool,
    local_closed: bool,
    read_limit: Option<usize>,
}

/// Shared handle to a [`MockStream`]'s buffers.
#[derive(Clone, Default)]
pub struct MockWire(Rc<RefCell<WireState>>);

impl MockWire {
    /// Queues bytes for the engine to read.
    pub fn push(&self, bytes: &[u8]) {
        self.0.borrow_mut().to_read.extend(bytes);
    }

    /// Takes everything the engine has written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().written)
    }

    /// Simulates the remote end closing: queued bytes still drain, then
    /// reads report end-of-stream.
    pub fn close_peer(&self) {
        self.0.borrow_mut().remote_closed = true;
    }

    /// True once the engine closed its side of the connection.
    pub fn peer_closed(&self) -> bool {
        self.0.borrow().local_closed
    }

    /// Caps how many bytes each read may return, simulating trickling
    /// delivery.
    pub fn set_read_limit(&self, limit: usize) {
        self.0.borrow_mut().read_limit = Some(limit);
    }

    pub fn pending(&self) -> usize {
        self.0.borrow().to_read.len()
    }
}

/// A scripted [`ByteStream`].
pub struct MockStream {
    wire: MockWire,
}

impl Default for MockStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStream {
    pub fn new() -> Self {
        Self {
            wire: MockWire::default(),
        }
    }

    pub fn wire(&self) -> MockWire {
        self.wire.clone()
    }
}

impl ByteStream for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.wire.0.borrow_mut();
        if state.local_closed {
            return Ok(0);
        }
        if state.to_read.is_empty() {
            return if state.remote_closed {
                Ok(0)
            } else {
                // A real socket would wait out its read timeout here; a
                // scripted one can only have forgotten data.
                Err(io::ErrorKind::TimedOut.into())
            };
        }

        let mut want = buf.len().min(state.to_read.len());
        if let Some(limit) = state.read_limit {
            want = want.min(limit);
        }
        for slot in buf.iter_mut().take(want) {
            *slot = state.to_read.pop_front().unwrap();
        }
        Ok(want)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.wire.0.borrow_mut();
        if state.local_closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        // A peer that sent FIN can still receive; only our own close stops
        // writes.
        state.written.extend_from_slice(buf);
        Ok(())
    }

    fn available(&mut self) -> io::Result<usize> {
        let state = self.wire.0.borrow();
        if state.local_closed {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if state.to_read.is_empty() && state.remote_closed {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(state.to_read.len())
    }

    fn is_connected(&self) -> bool {
        let state = self.wire.0.borrow();
        !state.local_closed && !(state.remote_closed && state.to_read.is_empty())
    }

    fn close(&mut self) {
        self.wire.0.borrow_mut().local_closed = true;
    }

    fn set_read_timeout(&mut self, _timeout: Duration) {}

    fn set_write_timeout(&mut self, _timeout: Duration) {}

    fn set_nodelay(&mut self, _nodelay: bool) {}
}

#[derive(Default)]
struct ConnectorState {
    queued: VecDeque<MockStream>,
    connects: Vec<(String, u16)>,
}

/// A [`Connect`] implementation handing out pre-scripted streams.
#[derive(Clone, Default)]
pub struct MockConnector(Rc<RefCell<ConnectorState>>);

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the stream the next `connect` call will return.
    pub fn expect(&self, stream: MockStream) {
        self.0.borrow_mut().queued.push_back(stream);
    }

    /// Every `(host, port)` pair that was connected to, in order.
    pub fn connects(&self) -> Vec<(String, u16)> {
        self.0.borrow().connects.clone()
    }
}

impl Connect for MockConnector {
    type Stream = MockStream;

    fn connect(&mut self, host: &str, port: u16, _timeout: Duration) -> io::Result<Self::Stream> {
        let mut state = self.0.borrow_mut();
        state.connects.push((host.to_owned(), port));
        state
            .queued
            .pop_front()
            .ok_or_else(|| io::Error::other(format!("unexpected connect to {host}:{port}")))
    }
}

#[derive(Default)]
struct ListenerState {
    pending: VecDeque<MockStream>,
    closed: bool,
}

/// A [`Listen`] implementation fed by the test.
#[derive(Clone)]
pub struct MockListener {
    state: Rc<RefCell<ListenerState>>,
    port: u16,
}

impl MockListener {
    pub fn new(port: u16) -> Self {
        Self {
            state: Rc::new(RefCell::new(ListenerState::default())),
            port,
        }
    }

    /// Queues an inbound session for the next `accept`.
    pub fn enqueue(&self, stream: MockStream) {
        self.state.borrow_mut().pending.push_back(stream);
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

impl Listen for MockListener {
    type Stream = MockStream;

    fn accept(&mut self) -> io::Result<Option<Self::Stream>> {
        Ok(self.state.borrow_mut().pending.pop_front())
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn close(&mut self) {
        self.state.borrow_mut().closed = true;
    }
}
