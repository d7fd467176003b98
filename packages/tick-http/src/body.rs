use std::io;

use crate::{
    chunked::ChunkedState,
    error::{HttpError, HttpResult},
    headers::Headers,
    transport::ByteStream,
};

/// How the remaining bytes of a message body are framed.
#[derive(Debug)]
pub(crate) enum BodyKind {
    /// Exactly this many bytes left on the wire.
    Length(u64),
    Chunked(ChunkedState),
    /// No framing; the body runs until the peer closes.
    UntilClose,
    Done,
}

impl BodyKind {
    /// Framing for a request body: chunked wins over `Content-Length`; a
    /// request without either has no body.
    pub(crate) fn for_request(headers: &Headers) -> Self {
        if headers.contains_token("Transfer-Encoding", "chunked") {
            BodyKind::Chunked(ChunkedState::new())
        } else {
            match headers
                .get("Content-Length")
                .and_then(|v| v.trim().parse::<u64>().ok())
            {
                Some(0) | None => BodyKind::Done,
                Some(n) => BodyKind::Length(n),
            }
        }
    }

    /// Framing for a reply body: chunked, then `Content-Length`, then
    /// read-until-close.
    pub(crate) fn for_reply(headers: &Headers) -> Self {
        if headers.contains_token("Transfer-Encoding", "chunked") {
            BodyKind::Chunked(ChunkedState::new())
        } else if let Some(n) = headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            if n == 0 {
                BodyKind::Done
            } else {
                BodyKind::Length(n)
            }
        } else {
            BodyKind::UntilClose
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self, BodyKind::Done)
    }

    pub(crate) fn read<S: ByteStream>(
        &mut self,
        stream: &mut S,
        buf: &mut [u8],
    ) -> HttpResult<usize> {
        match self {
            BodyKind::Done => Ok(0),
            BodyKind::Length(remaining) => {
                let want = (*remaining).min(buf.len() as u64) as usize;
                let got = stream.read(&mut buf[..want])?;
                if got == 0 {
                    return Err(HttpError::ConnectionClosed);
                }
                *remaining -= got as u64;
                if *remaining == 0 {
                    *self = BodyKind::Done;
                }
                Ok(got)
            }
            BodyKind::Chunked(state) => {
                let got = state.read(stream, buf)?;
                if got == 0 {
                    *self = BodyKind::Done;
                }
                Ok(got)
            }
            BodyKind::UntilClose => {
                let got = stream.read(buf)?;
                if got == 0 {
                    *self = BodyKind::Done;
                }
                Ok(got)
            }
        }
    }

    /// Consumes and discards whatever is left so the connection can carry
    /// the next message.
    pub(crate) fn drain<S: ByteStream>(&mut self, stream: &mut S) -> HttpResult<()> {
        let mut sink = [0u8; 512];
        while self.read(stream, &mut sink)? > 0 {}
        Ok(())
    }
}

/// Streaming access to one message body.
///
/// Yields the decoded payload bytes regardless of how the body is framed on
/// the wire. `Ok(0)` marks the end of the body, never a mid-body stall.
pub struct BodyReader<'a, S: ByteStream> {
    stream: &'a mut S,
    kind: &'a mut BodyKind,
}

impl<'a, S: ByteStream> BodyReader<'a, S> {
    pub(crate) fn new(stream: &'a mut S, kind: &'a mut BodyKind) -> Self {
        Self { stream, kind }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        self.kind.read(self.stream, buf)
    }

    pub fn is_done(&self) -> bool {
        self.kind.is_done()
    }
}

impl<S: ByteStream> io::Read for BodyReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BodyReader::read(self, buf).map_err(io::Error::other)
    }
}

/// Where a streaming body producer writes its bytes. The same producer runs
/// once against a counting sink to learn the total length and once against
/// the real connection, so it must emit identical bytes both times.
pub trait BodySink {
    fn write(&mut self, data: &[u8]) -> HttpResult<()>;
}

#[derive(Default)]
pub(crate) struct CountingSink {
    pub(crate) total: u64,
}

impl BodySink for CountingSink {
    fn write(&mut self, data: &[u8]) -> HttpResult<()> {
        self.total += data.len() as u64;
        Ok(())
    }
}

pub(crate) struct StreamSink<'a, S: ByteStream> {
    pub(crate) stream: &'a mut S,
}

impl<S: ByteStream> BodySink for StreamSink<'_, S> {
    fn write(&mut self, data: &[u8]) -> HttpResult<()> {
        self.stream.write_all(data)?;
        Ok(())
    }
}
