use crate::{
    error::{HttpError, HttpResult},
    transport::ByteStream,
};

// A chunk size line is hex digits plus optional extensions; anything longer
// than this is garbage.
const MAX_SIZE_LINE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading the hex size line of the next chunk.
    Size,
    /// Mid-chunk with this many data bytes left.
    Data(usize),
    /// Consuming the CRLF that follows a chunk's data.
    DataEnd,
    /// Consuming trailer lines after the zero chunk.
    Trailer,
    /// The terminating chunk and trailers have been consumed.
    Done,
}

/// Decoder state for a chunked-transfer body.
///
/// Holds no stream reference itself so it can live inside a body reader;
/// every call is handed the stream to pull from. Once the zero-length chunk
/// and its trailers have been consumed, `read` returns `Ok(0)` forever.
#[derive(Debug)]
pub struct ChunkedState {
    state: State,
}

impl Default for ChunkedState {
    fn default() -> Self {
        Self { state: State::Size }
    }
}

impl ChunkedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Yields up to `buf.len()` decoded body bytes. `Ok(0)` signals the end
    /// of the body; chunk boundaries are never visible to the caller.
    pub fn read<S: ByteStream>(&mut self, stream: &mut S, buf: &mut [u8]) -> HttpResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.state {
                State::Size => {
                    let size = read_size_line(stream)?;
                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::Data(size)
                    };
                }
                State::Data(remaining) => {
                    let want = remaining.min(buf.len());
                    let got = stream.read(&mut buf[..want])?;
                    if got == 0 {
                        return Err(HttpError::ConnectionClosed);
                    }
                    self.state = if got == remaining {
                        State::DataEnd
                    } else {
                        State::Data(remaining - got)
                    };
                    return Ok(got);
                }
                State::DataEnd => {
                    let mut crlf = [0u8; 2];
                    match stream.read_exact(&mut crlf) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            return Err(HttpError::ConnectionClosed);
                        }
                        Err(e) => return Err(e.into()),
                    }
                    if &crlf != b"\r\n" {
                        return Err(HttpError::BadChunkSize(
                            String::from_utf8_lossy(&crlf).into_owned(),
                        ));
                    }
                    self.state = State::Size;
                }
                State::Trailer => {
                    // Trailer lines are read and discarded up to the blank
                    // line that ends the body.
                    loop {
                        let line = read_crlf_line(stream, MAX_SIZE_LINE)?;
                        if line.is_empty() {
                            break;
                        }
                    }
                    self.state = State::Done;
                }
                State::Done => return Ok(0),
            }
        }
    }
}

fn read_crlf_line<S: ByteStream>(stream: &mut S, max: usize) -> HttpResult<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte)? == 0 {
            return Err(HttpError::ConnectionClosed);
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        if line.len() >= max {
            return Err(HttpError::BadChunkSize(
                String::from_utf8_lossy(&line).into_owned(),
            ));
        }
        line.push(byte[0]);
    }
}

/// Parses the leading hex digits of a size line; chunk extensions after the
/// digits are ignored.
fn read_size_line<S: ByteStream>(stream: &mut S) -> HttpResult<usize> {
    let line = read_crlf_line(stream, MAX_SIZE_LINE)?;
    let text = String::from_utf8_lossy(&line);

    let digits: &str = {
        let end = text
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(text.len());
        &text[..end]
    };
    if digits.is_empty() {
        return Err(HttpError::BadChunkSize(text.into_owned()));
    }

    usize::from_str_radix(digits, 16).map_err(|_| HttpError::BadChunkSize(text.into_owned()))
}

/// Encoder for a chunked-transfer body.
///
/// Each `write_chunk` emits one frame; `finish` emits the zero-length
/// terminator. Empty payloads are rejected since a zero-length frame is the
/// terminator on the wire.
pub struct ChunkedWriter<'a, S: ByteStream> {
    stream: &'a mut S,
    finished: bool,
}

impl<'a, S: ByteStream> ChunkedWriter<'a, S> {
    pub fn new(stream: &'a mut S) -> Self {
        Self {
            stream,
            finished: false,
        }
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> HttpResult<()> {
        if data.is_empty() {
            return Err(HttpError::EmptyChunk);
        }
        if self.finished {
            return Err(HttpError::BodyConsumed);
        }

        let mut frame = format!("{:x}\r\n", data.len()).into_bytes();
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");
        self.stream.write_all(&frame)?;
        Ok(())
    }

    pub fn finish(mut self) -> HttpResult<()> {
        self.finished = true;
        self.stream.write_all(b"0\r\n\r\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::MockStream;

    fn decode_all(stream: &mut MockStream) -> HttpResult<Vec<u8>> {
        let mut state = ChunkedState::new();
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            match state.read(stream, &mut buf)? {
                0 => return Ok(out),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[test]
    fn decodes_multiple_chunks() {
        let mut stream = MockStream::new();
        stream
            .wire()
            .push(b"7\r\nMozilla\r\n9\r\nDeveloper\r\n7\r\nNetwork\r\n0\r\n\r\n");

        assert_eq!(decode_all(&mut stream).unwrap(), b"MozillaDeveloperNetwork");
    }

    #[test]
    fn ignores_chunk_extensions_and_trailers() {
        let mut stream = MockStream::new();
        stream
            .wire()
            .push(b"2;ext=1\r\nab\r\n4\r\ncdef\r\n0\r\nX-Trailer: 1\r\n\r\n");

        assert_eq!(decode_all(&mut stream).unwrap(), b"abcdef");
    }

    #[test]
    fn read_after_done_keeps_returning_zero() {
        let mut stream = MockStream::new();
        stream.wire().push(b"2\r\nhi\r\n0\r\n\r\n");

        let mut state = ChunkedState::new();
        let mut buf = [0u8; 16];
        assert_eq!(state.read(&mut stream, &mut buf).unwrap(), 2);
        assert_eq!(state.read(&mut stream, &mut buf).unwrap(), 0);
        assert!(state.is_done());

        // Bytes after the terminator belong to the next message, not to us.
        stream.wire().push(b"GET / HTTP/1.1\r\n");
        assert_eq!(state.read(&mut stream, &mut buf).unwrap(), 0);
    }

    #[test]
    fn rejects_bad_size_line() {
        let mut stream = MockStream::new();
        stream.wire().push(b"zz\r\ndata\r\n0\r\n\r\n");

        let mut state = ChunkedState::new();
        let mut buf = [0u8; 4];
        assert!(matches!(
            state.read(&mut stream, &mut buf),
            Err(HttpError::BadChunkSize(_))
        ));
    }

    #[test]
    fn premature_close_is_fatal() {
        let mut stream = MockStream::new();
        stream.wire().push(b"a\r\nhal");
        stream.wire().close_peer();

        let mut state = ChunkedState::new();
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        let err = loop {
            match state.read(&mut stream, &mut buf) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, HttpError::ConnectionClosed));
    }

    #[test]
    fn encoder_round_trip_with_tricky_bytes() {
        // Data containing CR, LF and the literal terminator sequence must
        // survive an encode/decode round trip.
        let payload = b"line1\r\nline2\n0\r\n\r\ntail".to_vec();

        let mut stream = MockStream::new();
        let mut writer = ChunkedWriter::new(&mut stream);
        writer.write_chunk(&payload[..5]).unwrap();
        writer.write_chunk(&payload[5..]).unwrap();
        writer.finish().unwrap();

        let encoded = stream.wire().take_written();
        stream.wire().push(&encoded);
        assert_eq!(decode_all(&mut stream).unwrap(), payload);
    }

    #[test]
    fn encoder_rejects_empty_chunk() {
        let mut stream = MockStream::new();
        let mut writer = ChunkedWriter::new(&mut stream);
        assert!(matches!(
            writer.write_chunk(b""),
            Err(HttpError::EmptyChunk)
        ));
    }
}
