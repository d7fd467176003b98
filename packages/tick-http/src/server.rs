use std::{
    io,
    time::{Duration, Instant},
};

use mime::Mime;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    body::{BodyKind, BodyReader, BodySink, CountingSink, StreamSink},
    chunked::ChunkedWriter,
    error::{HttpError, HttpResult},
    headers::{Method, ReplyHead, RequestHead, reason_phrase},
    routes::{RouteTarget, Router},
    transport::{ByteStream, Listen},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Header and body-copy buffer size in bytes.
    pub buffer_size: usize,
    /// Suggested sleep when a tick found no sessions and no work.
    pub no_connect_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            no_connect_delay_ms: 5,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn no_connect_delay(&self) -> Duration {
        Duration::from_millis(self.no_connect_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    ReadingHeader,
    Routing,
    WritingReply,
    Closing,
}

struct Session<S> {
    stream: S,
    state: SessionState,
    last_activity: Instant,
}

impl<S: ByteStream> Session<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            state: SessionState::Idle,
            last_activity: Instant::now(),
        }
    }
}

/// One request being answered. Handlers read the request (and optionally its
/// body) and write exactly one reply through the helpers below.
pub struct Exchange<'a, S: ByteStream> {
    request: RequestHead,
    stream: &'a mut S,
    body: BodyKind,
    buffer_size: usize,
    replied: bool,
    close: bool,
}

impl<'a, S: ByteStream> Exchange<'a, S> {
    fn new(request: RequestHead, stream: &'a mut S, buffer_size: usize) -> Self {
        let body = BodyKind::for_request(&request.headers);
        let close = request.headers.contains_token("Connection", "close");
        Self {
            request,
            stream,
            body,
            buffer_size,
            replied: false,
            close,
        }
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Streaming access to the request body.
    pub fn body(&mut self) -> BodyReader<'_, S> {
        BodyReader::new(self.stream, &mut self.body)
    }

    /// Ends the session after the reply regardless of keep-alive.
    pub fn close_after_reply(&mut self) {
        self.close = true;
    }

    fn head(&self, status: u16, reason: &str) -> HttpResult<ReplyHead> {
        let mut head = ReplyHead::new(status, reason);
        head.headers
            .set("Connection", if self.close { "close" } else { "keep-alive" })?;
        Ok(head)
    }

    fn send_head(&mut self, mut head: ReplyHead, content_type: Option<&Mime>) -> HttpResult<()> {
        if let Some(ct) = content_type {
            head.headers.set("Content-Type", ct.as_ref())?;
        }
        head.write_to(self.stream)?;
        self.replied = true;
        Ok(())
    }

    fn body_suppressed(&self) -> bool {
        self.request.method == Method::Head
    }

    /// Length-delimited `200 OK` with a string body.
    pub fn reply_text(&mut self, content_type: &Mime, body: &str) -> HttpResult<()> {
        self.reply_bytes(content_type, body.as_bytes())
    }

    /// Length-delimited `200 OK` with a byte body.
    pub fn reply_bytes(&mut self, content_type: &Mime, body: &[u8]) -> HttpResult<()> {
        let mut head = self.head(200, reason_phrase(200))?;
        head.headers
            .set("Content-Length", &body.len().to_string())?;
        self.send_head(head, Some(content_type))?;
        if !self.body_suppressed() {
            self.stream.write_all(body)?;
        }
        Ok(())
    }

    /// Copies exactly `size` bytes from `source` using a bounded buffer.
    pub fn reply_stream(
        &mut self,
        content_type: &Mime,
        source: &mut dyn io::Read,
        size: u64,
    ) -> HttpResult<()> {
        let mut head = self.head(200, reason_phrase(200))?;
        head.headers.set("Content-Length", &size.to_string())?;
        self.send_head(head, Some(content_type))?;
        if self.body_suppressed() {
            return Ok(());
        }

        let mut buf = vec![0u8; self.buffer_size.max(64)];
        let mut left = size;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            let got = source.read(&mut buf[..want])?;
            if got == 0 {
                return Err(HttpError::ConnectionClosed);
            }
            self.stream.write_all(&buf[..got])?;
            left -= got as u64;
        }
        Ok(())
    }

    /// Runs the producer against a counting sink to learn the length, then
    /// against the connection. The producer must be deterministic.
    pub fn reply_producer<F>(&mut self, content_type: &Mime, mut producer: F) -> HttpResult<()>
    where
        F: FnMut(&mut dyn BodySink) -> HttpResult<()>,
    {
        let mut counter = CountingSink::default();
        producer(&mut counter)?;

        let mut head = self.head(200, reason_phrase(200))?;
        head.headers
            .set("Content-Length", &counter.total.to_string())?;
        self.send_head(head, Some(content_type))?;
        if !self.body_suppressed() {
            let mut sink = StreamSink {
                stream: &mut *self.stream,
            };
            producer(&mut sink)?;
        }
        Ok(())
    }

    /// Writes a chunked reply head and hands back the encoder. The caller
    /// emits chunks and must call `finish`.
    pub fn reply_chunked(&mut self, content_type: &Mime) -> HttpResult<ChunkedWriter<'_, S>> {
        let mut head = self.head(200, reason_phrase(200))?;
        head.headers.set("Transfer-Encoding", "chunked")?;
        self.send_head(head, Some(content_type))?;
        Ok(ChunkedWriter::new(self.stream))
    }

    /// Streams `source` to the peer in chunked frames until it is exhausted.
    /// Zero-length reads are skipped, never emitted as frames.
    pub fn reply_chunked_stream(
        &mut self,
        content_type: &Mime,
        source: &mut dyn io::Read,
    ) -> HttpResult<()> {
        let buffer_size = self.buffer_size.max(64);
        let suppressed = self.body_suppressed();
        let mut writer = self.reply_chunked(content_type)?;
        if !suppressed {
            let mut buf = vec![0u8; buffer_size];
            loop {
                let got = source.read(&mut buf)?;
                if got == 0 {
                    break;
                }
                writer.write_chunk(&buf[..got])?;
            }
        }
        writer.finish()
    }

    /// Headers-only reply with an arbitrary status.
    pub fn reply_status(&mut self, status: u16, reason: &str) -> HttpResult<()> {
        let mut head = self.head(status, reason)?;
        head.headers.set("Content-Length", "0")?;
        self.send_head(head, None)
    }

    pub fn reply_ok(&mut self) -> HttpResult<()> {
        self.reply_status(200, reason_phrase(200))
    }

    pub fn reply_not_found(&mut self) -> HttpResult<()> {
        self.reply_status(404, reason_phrase(404))
    }

    pub fn reply_error(&mut self, status: u16, reason: &str) -> HttpResult<()> {
        self.reply_status(status, reason)
    }

    /// `301 Moved` with a `Location` header; ends the session.
    pub fn redirect(&mut self, location: &str) -> HttpResult<()> {
        self.close = true;
        let mut head = self.head(301, reason_phrase(301))?;
        head.headers.set("Location", location)?;
        head.headers.set("Content-Length", "0")?;
        self.send_head(head, None)
    }
}

/// Cooperative multi-client HTTP server.
///
/// `tick` performs one unit of work: accept at most one new session, then
/// serve at most one request from the round-robin cursor's next ready
/// session. All sessions are owned by the server and swept when closed.
pub struct HttpServer<L: Listen> {
    listener: Option<L>,
    router: Router<L::Stream>,
    sessions: Vec<Session<L::Stream>>,
    cursor: usize,
    config: ServerConfig,
}

impl<L: Listen> HttpServer<L> {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            listener: None,
            router: Router::new(),
            sessions: Vec::new(),
            cursor: 0,
            config,
        }
    }

    pub fn router_mut(&mut self) -> &mut Router<L::Stream> {
        &mut self.router
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts accepting sessions from `listener`.
    pub fn begin(&mut self, listener: L) {
        debug!(port = listener.local_port(), "http server started");
        self.listener = Some(listener);
    }

    /// Stops the listener and closes every open session.
    pub fn end(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }
        for session in &mut self.sessions {
            session.stream.close();
        }
        self.sessions.clear();
        self.cursor = 0;
        debug!("http server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    /// The port peers should send callbacks to, while running.
    pub fn local_port(&self) -> Option<u16> {
        self.listener.as_ref().map(|l| l.local_port())
    }

    /// One cooperative step. Returns true when any work happened.
    pub fn tick(&mut self) -> bool {
        let Some(listener) = self.listener.as_mut() else {
            return false;
        };

        let mut progressed = false;
        match listener.accept() {
            Ok(Some(mut stream)) => {
                stream.set_nodelay(true);
                stream.set_read_timeout(Duration::from_millis(self.config.read_timeout_ms));
                stream.set_write_timeout(Duration::from_millis(self.config.write_timeout_ms));
                self.sessions.push(Session::new(stream));
                progressed = true;
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "accept failed"),
        }

        if self.sessions.is_empty() {
            return progressed;
        }

        // Visit at most one full cycle of sessions looking for one with data.
        // Erasing re-checks the same index since the vector shifts left.
        let mut visits = self.sessions.len();
        while visits > 0 && !self.sessions.is_empty() {
            visits -= 1;
            if self.cursor >= self.sessions.len() {
                self.cursor = 0;
            }
            let idx = self.cursor;

            match self.sessions[idx].stream.available() {
                Err(_) => {
                    trace!(
                        idle_for = ?self.sessions[idx].last_activity.elapsed(),
                        "removing closed session"
                    );
                    self.sessions[idx].stream.close();
                    self.sessions.remove(idx);
                    progressed = true;
                }
                Ok(0) => {
                    self.cursor += 1;
                }
                Ok(_) => {
                    self.serve_session(idx);
                    self.cursor = idx + 1;
                    progressed = true;
                    break;
                }
            }
        }

        self.sweep();
        progressed
    }

    /// Reads one request from the session and answers it.
    fn serve_session(&mut self, idx: usize) {
        let config_buffer = self.config.buffer_size;
        let session = &mut self.sessions[idx];
        session.state = SessionState::ReadingHeader;

        let head = match RequestHead::read_from(&mut session.stream, config_buffer) {
            Ok(head) => head,
            Err(error) => {
                warn!(%error, "failed to read request header");
                session.state = SessionState::Closing;
                return;
            }
        };
        session.last_activity = Instant::now();
        session.state = SessionState::Routing;

        let path = self.router.routing_path(&head.path);
        let accept = head.headers.get("Accept").map(str::to_owned);
        let method = head.method.clone();
        trace!(%method, path, "dispatching request");

        session.state = SessionState::WritingReply;
        let mut exchange = Exchange::new(head, &mut session.stream, config_buffer);

        let served = match self.router.resolve(&path, &method, accept.as_deref()) {
            None => exchange.reply_not_found(),
            Some(entry) => match &mut entry.target {
                RouteTarget::Text { content_type, body } => {
                    let (content_type, body) = (content_type.clone(), body.clone());
                    exchange.reply_text(&content_type, &body)
                }
                RouteTarget::Bytes { content_type, body } => {
                    let (content_type, body) = (content_type.clone(), body.clone());
                    exchange.reply_bytes(&content_type, &body)
                }
                RouteTarget::Redirect { location } => {
                    let location = location.clone();
                    exchange.redirect(&location)
                }
                RouteTarget::Handler(handler) => handler(&mut exchange).and_then(|()| {
                    if exchange.replied {
                        Ok(())
                    } else {
                        // A handler that never answered still owes the peer
                        // a reply.
                        exchange.reply_not_found()
                    }
                }),
            },
        };

        let close = exchange.close;
        let mut leftover = std::mem::replace(&mut exchange.body, BodyKind::Done);
        drop(exchange);

        match served {
            Ok(()) => {
                if close {
                    session.state = SessionState::Closing;
                } else if let Err(error) = leftover.drain(&mut session.stream) {
                    warn!(%error, "failed to drain request body");
                    session.state = SessionState::Closing;
                } else {
                    session.state = SessionState::Idle;
                }
            }
            Err(error) => {
                warn!(%error, %method, path, "request failed");
                session.state = SessionState::Closing;
            }
        }
    }

    fn sweep(&mut self) {
        self.sessions.retain_mut(|session| {
            if session.state == SessionState::Closing {
                session.stream.close();
                false
            } else {
                true
            }
        });
        if self.cursor >= self.sessions.len() {
            self.cursor = 0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{MockListener, MockStream, MockWire};

    fn server_with(listener: MockListener) -> HttpServer<MockListener> {
        let mut server = HttpServer::new(ServerConfig::default());
        server.begin(listener);
        server
    }

    fn run_until_idle(server: &mut HttpServer<MockListener>) {
        while server.tick() {}
    }

    fn connect(listener: &MockListener, request: &[u8]) -> MockWire {
        let stream = MockStream::new();
        let wire = stream.wire();
        wire.push(request);
        listener.enqueue(stream);
        wire
    }

    #[test]
    fn static_text_route() {
        let listener = MockListener::new(1980);
        let wire = connect(&listener, b"GET /hello HTTP/1.1\r\nAccept: */*\r\n\r\n");

        let mut server = server_with(listener.clone());
        server.router_mut().add_with_mime(
            "/hello",
            Method::Get,
            mime::TEXT_PLAIN,
            RouteTarget::Text {
                content_type: mime::TEXT_PLAIN,
                body: "hi".to_owned(),
            },
        );
        run_until_idle(&mut server);

        let reply = String::from_utf8(wire.take_written()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.contains("Content-Length: 2\r\n"));
        assert!(reply.contains("Content-Type: text/plain\r\n"));
        assert!(reply.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn miss_answers_not_found() {
        let listener = MockListener::new(1980);
        let wire = connect(&listener, b"GET /missing HTTP/1.1\r\n\r\n");

        let mut server = server_with(listener.clone());
        run_until_idle(&mut server);

        let reply = String::from_utf8(wire.take_written()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 404 Page Not Found\r\n"));
    }

    #[test]
    fn handler_that_stays_silent_still_produces_404() {
        let listener = MockListener::new(1980);
        let wire = connect(&listener, b"GET /quiet HTTP/1.1\r\n\r\n");

        let mut server = server_with(listener.clone());
        server
            .router_mut()
            .add("/quiet", Method::Get, RouteTarget::handler(|_ex| Ok(())));
        run_until_idle(&mut server);

        let reply = String::from_utf8(wire.take_written()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 404 Page Not Found\r\n"));
    }

    #[test]
    fn chunked_reply_round_trip() {
        let listener = MockListener::new(1980);
        let wire = connect(&listener, b"GET /stream HTTP/1.1\r\n\r\n");

        let mut server = server_with(listener.clone());
        server.router_mut().add(
            "/stream",
            Method::Get,
            RouteTarget::handler(|ex| {
                let mut writer = ex.reply_chunked(&mime::TEXT_PLAIN)?;
                writer.write_chunk(b"ab")?;
                writer.write_chunk(b"cdef")?;
                writer.finish()
            }),
        );
        run_until_idle(&mut server);

        let reply = String::from_utf8(wire.take_written()).unwrap();
        assert!(reply.contains("Transfer-Encoding: chunked\r\n"));
        let body = reply.split_once("\r\n\r\n").unwrap().1;
        assert_eq!(body, "2\r\nab\r\n4\r\ncdef\r\n0\r\n\r\n");
    }

    #[test]
    fn rewrite_then_redirect() {
        let listener = MockListener::new(1980);
        let wire = connect(&listener, b"GET /x HTTP/1.1\r\n\r\n");

        let mut server = server_with(listener.clone());
        server.router_mut().add_rewrite("/x", "/y");
        server.router_mut().add(
            "/y",
            Method::Get,
            RouteTarget::Redirect {
                location: "/z".to_owned(),
            },
        );
        run_until_idle(&mut server);

        let reply = String::from_utf8(wire.take_written()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 301 Moved\r\n"), "{reply}");
        assert!(reply.contains("Location: /z\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
    }

    #[test]
    fn doubled_slashes_match_clean_pattern() {
        let listener = MockListener::new(1980);
        let wire = connect(&listener, b"GET //foo//bar/ HTTP/1.1\r\n\r\n");

        let mut server = server_with(listener.clone());
        server.router_mut().add(
            "/foo/bar/",
            Method::Get,
            RouteTarget::Text {
                content_type: mime::TEXT_PLAIN,
                body: "ok".to_owned(),
            },
        );
        run_until_idle(&mut server);

        let reply = String::from_utf8(wire.take_written()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn empty_body_request_is_served() {
        let listener = MockListener::new(1980);
        let wire = connect(
            &listener,
            b"POST /soap HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
        );

        let mut server = server_with(listener.clone());
        server
            .router_mut()
            .add("/soap", Method::Post, RouteTarget::handler(|ex| ex.reply_ok()));
        run_until_idle(&mut server);

        let reply = String::from_utf8(wire.take_written()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn handler_reads_request_body() {
        let listener = MockListener::new(1980);
        let wire = connect(
            &listener,
            b"NOTIFY /evt HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        );

        let mut server = server_with(listener.clone());
        server.router_mut().add(
            "/evt",
            Method::Notify,
            RouteTarget::handler(|ex| {
                let mut body = Vec::new();
                let mut buf = [0u8; 3];
                let mut reader = ex.body();
                loop {
                    match reader.read(&mut buf)? {
                        0 => break,
                        n => body.extend_from_slice(&buf[..n]),
                    }
                }
                assert_eq!(body, b"hello");
                ex.reply_ok()
            }),
        );
        run_until_idle(&mut server);

        let reply = String::from_utf8(wire.take_written()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn oversize_header_closes_session() {
        let listener = MockListener::new(1980);
        let mut request = b"GET /x HTTP/1.1\r\nX-Pad: ".to_vec();
        request.extend(std::iter::repeat_n(b'a', 4096));
        request.extend_from_slice(b"\r\n\r\n");
        let wire = connect(&listener, &request);

        let mut server = server_with(listener.clone());
        run_until_idle(&mut server);

        assert!(wire.take_written().is_empty());
        assert!(wire.peer_closed());
        assert_eq!(server.sessions.len(), 0);
    }

    #[test]
    fn sessions_are_served_round_robin() {
        let listener = MockListener::new(1980);
        let first = connect(&listener, b"GET /n HTTP/1.1\r\n\r\n");
        let second = connect(&listener, b"GET /n HTTP/1.1\r\n\r\n");

        let mut server = server_with(listener.clone());
        // Each tick accepts at most one session and serves at most one
        // request, so the second session is answered a tick later.
        server.tick();
        let after_first = first.take_written();
        assert!(String::from_utf8(after_first).unwrap().starts_with("HTTP/1.1 404"));
        assert!(second.take_written().is_empty());

        server.tick();
        let after_second = second.take_written();
        assert!(String::from_utf8(after_second).unwrap().starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn keep_alive_session_serves_second_request() {
        let listener = MockListener::new(1980);
        let wire = connect(&listener, b"GET /a HTTP/1.1\r\n\r\n");

        let mut server = server_with(listener.clone());
        server.router_mut().add(
            "/a",
            Method::Get,
            RouteTarget::Text {
                content_type: mime::TEXT_PLAIN,
                body: "first".to_owned(),
            },
        );
        run_until_idle(&mut server);
        assert!(String::from_utf8(wire.take_written()).unwrap().contains("first"));

        wire.push(b"GET /a HTTP/1.1\r\n\r\n");
        run_until_idle(&mut server);
        assert!(String::from_utf8(wire.take_written()).unwrap().contains("first"));
        assert_eq!(server.sessions.len(), 1);
    }

    #[test]
    fn connection_close_ends_session() {
        let listener = MockListener::new(1980);
        let wire = connect(&listener, b"GET /a HTTP/1.1\r\nConnection: close\r\n\r\n");

        let mut server = server_with(listener.clone());
        run_until_idle(&mut server);

        assert!(wire.peer_closed());
        assert_eq!(server.sessions.len(), 0);
    }
}
