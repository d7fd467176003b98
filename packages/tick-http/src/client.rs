use std::{thread, time::Duration};

use mime::Mime;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    HTTP_PORT,
    body::{BodyKind, BodySink, CountingSink, StreamSink},
    error::{HttpError, HttpResult},
    headers::{Method, ReplyHead, RequestHead},
    transport::{ByteStream, Connect},
};

// Reply headers from devices are small; this bounds a misbehaving peer.
const REPLY_HEADER_LIMIT: usize = 4096;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub user_agent: String,
    /// When false every request carries `Connection: close` and the
    /// connection is reopened each time.
    pub keep_alive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            user_agent: "tick-http/0.1".to_owned(),
            keep_alive: true,
        }
    }
}

/// A request body, if any.
pub enum RequestBody<'a> {
    None,
    Bytes(&'a [u8]),
    /// A streaming producer with deterministic output: it runs once against
    /// a counting sink to learn the total length, then against the wire.
    Producer(&'a mut dyn FnMut(&mut dyn BodySink) -> HttpResult<()>),
}

/// One outbound request.
pub struct Request<'a> {
    pub method: Method,
    pub url: &'a Url,
    pub content_type: Option<Mime>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody<'a>,
}

impl<'a> Request<'a> {
    pub fn new(method: Method, url: &'a Url) -> Self {
        Self {
            method,
            url,
            content_type: None,
            headers: Vec::new(),
            body: RequestBody::None,
        }
    }

    pub fn content_type(mut self, content_type: Mime) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, bytes: &'a [u8]) -> Self {
        self.body = RequestBody::Bytes(bytes);
        self
    }

    pub fn streamed_body(
        mut self,
        producer: &'a mut dyn FnMut(&mut dyn BodySink) -> HttpResult<()>,
    ) -> Self {
        self.body = RequestBody::Producer(producer);
        self
    }
}

struct Connection<S> {
    stream: S,
    host: String,
    port: u16,
    reusable: bool,
}

/// Single-connection HTTP client.
///
/// One request is in flight at a time; the reply body must be read (or is
/// drained automatically) before the next request goes out. The connection
/// is reused while both sides keep it alive.
pub struct HttpClient<C: Connect> {
    connector: C,
    config: ClientConfig,
    conn: Option<Connection<C::Stream>>,
    reply: Option<ReplyHead>,
    body: BodyKind,
}

impl<C: Connect> HttpClient<C> {
    pub fn new(connector: C, config: ClientConfig) -> Self {
        Self {
            connector,
            config,
            conn: None,
            reply: None,
            body: BodyKind::Done,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn get(&mut self, url: &Url) -> HttpResult<u16> {
        self.send(Request::new(Method::Get, url))
    }

    pub fn head(&mut self, url: &Url) -> HttpResult<u16> {
        self.send(Request::new(Method::Head, url))
    }

    pub fn delete(&mut self, url: &Url) -> HttpResult<u16> {
        self.send(Request::new(Method::Delete, url))
    }

    pub fn post(&mut self, url: &Url, content_type: Mime, body: &[u8]) -> HttpResult<u16> {
        self.send(Request::new(Method::Post, url).content_type(content_type).body(body))
    }

    pub fn put(&mut self, url: &Url, content_type: Mime, body: &[u8]) -> HttpResult<u16> {
        self.send(Request::new(Method::Put, url).content_type(content_type).body(body))
    }

    /// Issues a request and reads the reply headers. Returns the status
    /// code; the body stays on the connection for `read`/`read_line`.
    pub fn send(&mut self, request: Request<'_>) -> HttpResult<u16> {
        self.finish_reply()?;

        let host = request
            .url
            .host_str()
            .ok_or_else(|| HttpError::BadUrl(request.url.to_string()))?
            .to_owned();
        let port = request.url.port_or_known_default().unwrap_or(HTTP_PORT);
        self.ensure_connection(&host, port)?;

        let mut path = request.url.path().to_owned();
        if let Some(query) = request.url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut head = RequestHead::new(request.method.clone(), &path);
        head.headers.set("Host", &format!("{host}:{port}"))?;
        head.headers.set("Accept", "*/*")?;
        head.headers.set("Accept-Encoding", "identity")?;
        head.headers.set("User-Agent", &self.config.user_agent)?;
        head.headers.set(
            "Connection",
            if self.config.keep_alive {
                "keep-alive"
            } else {
                "close"
            },
        )?;
        if let Some(content_type) = &request.content_type {
            head.headers.set("Content-Type", content_type.as_ref())?;
        }
        for (name, value) in &request.headers {
            head.headers.set(name, value)?;
        }

        let mut body = request.body;
        match &mut body {
            RequestBody::None => {}
            RequestBody::Bytes(bytes) => {
                head.headers.set("Content-Length", &bytes.len().to_string())?;
            }
            RequestBody::Producer(producer) => {
                let mut counter = CountingSink::default();
                producer(&mut counter)?;
                head.headers.set("Content-Length", &counter.total.to_string())?;
            }
        }

        let conn = self.conn.as_mut().ok_or(HttpError::ConnectionClosed)?;
        trace!(method = %head.method, path, "sending request");
        head.write_to(&mut conn.stream)?;
        match body {
            RequestBody::None => {}
            RequestBody::Bytes(bytes) => conn.stream.write_all(bytes)?,
            RequestBody::Producer(producer) => {
                let mut sink = StreamSink {
                    stream: &mut conn.stream,
                };
                producer(&mut sink)?;
            }
        }

        let reply = ReplyHead::read_from(&mut conn.stream, REPLY_HEADER_LIMIT)?;
        trace!(status = reply.status, "reply received");

        self.body = if request.method == Method::Head {
            BodyKind::Done
        } else {
            BodyKind::for_reply(&reply.headers)
        };
        if !reply.keep_alive() || !self.config.keep_alive {
            conn.reusable = false;
        }
        if matches!(self.body, BodyKind::UntilClose) {
            // Nothing delimits this body except the close itself.
            conn.reusable = false;
        }

        let status = reply.status;
        self.reply = Some(reply);
        Ok(status)
    }

    /// The headers and status of the most recent reply.
    pub fn reply(&self) -> Option<&ReplyHead> {
        self.reply.as_ref()
    }

    /// Reads decoded reply body bytes; `Ok(0)` is the end of the body.
    pub fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };
        self.body.read(&mut conn.stream, buf)
    }

    /// Reads one LF-terminated line of the body (CR stripped). `None` once
    /// the body is exhausted.
    pub fn read_line(&mut self) -> HttpResult<Option<String>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte)? {
                0 => {
                    if line.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
                _ => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Body bytes that can be read without waiting. An approximation when
    /// the body is chunked, since framing overhead is counted too.
    pub fn available(&mut self) -> HttpResult<usize> {
        if self.body.is_done() {
            return Ok(0);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };
        match conn.stream.available() {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Drains whatever is left of the current reply so the connection can be
    /// reused, dropping it when either side asked for close.
    pub fn finish_reply(&mut self) -> HttpResult<()> {
        self.reply = None;
        let Some(conn) = self.conn.as_mut() else {
            self.body = BodyKind::Done;
            return Ok(());
        };

        let reusable = conn.reusable;
        let drained = self.body.drain(&mut conn.stream);
        self.body = BodyKind::Done;
        match drained {
            Ok(()) => {
                if !reusable {
                    self.close();
                }
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Drops the current connection, if any.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.stream.close();
        }
    }

    fn ensure_connection(&mut self, host: &str, port: u16) -> HttpResult<()> {
        if let Some(conn) = self.conn.as_mut() {
            let same_peer = conn.host == host && conn.port == port;
            if same_peer && conn.reusable && conn.stream.is_connected() {
                return Ok(());
            }
            debug!(host, port, "dropping stale connection");
            conn.stream.close();
            self.conn = None;
        }

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.connector.connect(host, port, timeout) {
                Ok(mut stream) => {
                    stream.set_nodelay(true);
                    stream.set_read_timeout(Duration::from_millis(self.config.read_timeout_ms));
                    stream.set_write_timeout(Duration::from_millis(self.config.write_timeout_ms));
                    self.conn = Some(Connection {
                        stream,
                        host: host.to_owned(),
                        port,
                        reusable: self.config.keep_alive,
                    });
                    return Ok(());
                }
                Err(error) => {
                    warn!(host, port, attempt, %error, "connect failed");
                    last_error = error.to_string();
                    if attempt < CONNECT_ATTEMPTS {
                        thread::sleep(CONNECT_BACKOFF);
                    }
                }
            }
        }

        Err(HttpError::ConnectFailed {
            host: host.to_owned(),
            port,
            reason: last_error,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{MockConnector, MockStream, MockWire};

    fn client_with_stream() -> (HttpClient<MockConnector>, MockConnector, MockWire) {
        let connector = MockConnector::new();
        let stream = MockStream::new();
        let wire = stream.wire();
        connector.expect(stream);
        let client = HttpClient::new(connector.clone(), ClientConfig::default());
        (client, connector, wire)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn read_all(client: &mut HttpClient<MockConnector>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            match client.read(&mut buf).unwrap() {
                0 => return out,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[test]
    fn get_with_content_length() {
        let (mut client, connector, wire) = client_with_stream();
        wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");

        let status = client.get(&url("http://10.0.0.9:1980/desc.xml")).unwrap();
        assert_eq!(status, 200);
        assert_eq!(read_all(&mut client), b"hello");

        let sent = String::from_utf8(wire.take_written()).unwrap();
        assert!(sent.starts_with("GET /desc.xml HTTP/1.1\r\n"), "{sent}");
        assert!(sent.contains("Host: 10.0.0.9:1980\r\n"));
        assert!(sent.contains("Connection: keep-alive\r\n"));
        assert_eq!(connector.connects(), vec![("10.0.0.9".to_owned(), 1980)]);
    }

    #[test]
    fn default_port_is_80() {
        let (mut client, connector, wire) = client_with_stream();
        wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        client.get(&url("http://device.local/root.xml")).unwrap();
        assert_eq!(connector.connects(), vec![("device.local".to_owned(), 80)]);
        let sent = String::from_utf8(wire.take_written()).unwrap();
        assert!(sent.contains("Host: device.local:80\r\n"));
    }

    #[test]
    fn keep_alive_reuses_the_connection() {
        let (mut client, connector, wire) = client_with_stream();
        wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        client.get(&url("http://10.0.0.9:1980/a")).unwrap();
        assert_eq!(read_all(&mut client), b"ok");

        wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
        client.get(&url("http://10.0.0.9:1980/b")).unwrap();
        assert_eq!(read_all(&mut client), b"hi");

        assert_eq!(connector.connects().len(), 1);
    }

    #[test]
    fn server_close_forces_reconnect() {
        let (mut client, connector, wire) = client_with_stream();
        wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
        client.get(&url("http://10.0.0.9:1980/a")).unwrap();
        assert_eq!(read_all(&mut client), b"ok");

        let second = MockStream::new();
        let second_wire = second.wire();
        second_wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        connector.expect(second);

        client.get(&url("http://10.0.0.9:1980/b")).unwrap();
        assert_eq!(connector.connects().len(), 2);
        assert!(wire.peer_closed());
    }

    #[test]
    fn chunked_reply_is_decoded() {
        let (mut client, _connector, wire) = client_with_stream();
        wire.push(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nab\r\n4\r\ncdef\r\n0\r\n\r\n",
        );

        client.get(&url("http://10.0.0.9:1980/s")).unwrap();
        assert!(client.reply().unwrap().is_chunked());
        assert_eq!(read_all(&mut client), b"abcdef");
    }

    #[test]
    fn body_without_length_reads_until_close() {
        let (mut client, _connector, wire) = client_with_stream();
        wire.push(b"HTTP/1.1 200 OK\r\n\r\nuntil the end");
        wire.close_peer();

        client.get(&url("http://10.0.0.9:1980/old")).unwrap();
        assert_eq!(read_all(&mut client), b"until the end");
    }

    #[test]
    fn producer_body_is_measured_then_sent() {
        let (mut client, _connector, wire) = client_with_stream();
        wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        let mut produce = |sink: &mut dyn BodySink| {
            sink.write(b"<Envelope>")?;
            sink.write(b"</Envelope>")
        };
        let target = url("http://10.0.0.9:1980/control");
        let request = Request::new(Method::Post, &target)
            .content_type("text/xml".parse().unwrap())
            .streamed_body(&mut produce);
        client.send(request).unwrap();

        let sent = String::from_utf8(wire.take_written()).unwrap();
        assert!(sent.contains("Content-Length: 21\r\n"));
        assert!(sent.ends_with("\r\n\r\n<Envelope></Envelope>"));
        // The measuring pass must not have leaked onto the wire.
        assert_eq!(sent.matches("<Envelope>").count(), 1);
    }

    #[test]
    fn unsubscribe_carries_sid_header() {
        let (mut client, _connector, wire) = client_with_stream();
        wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        let target = url("http://10.0.0.9:1980/evt/sub");
        let request = Request::new(Method::Unsubscribe, &target).header("SID", "uuid:1");
        client.send(request).unwrap();

        let sent = String::from_utf8(wire.take_written()).unwrap();
        assert!(sent.starts_with("UNSUBSCRIBE /evt/sub HTTP/1.1\r\n"));
        assert!(sent.contains("SID: uuid:1\r\n"));
    }

    #[test]
    fn read_line_splits_the_body() {
        let (mut client, _connector, wire) = client_with_stream();
        wire.push(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\none\r\ntwo\nend");

        client.get(&url("http://10.0.0.9:1980/lines")).unwrap();
        assert_eq!(client.read_line().unwrap().as_deref(), Some("one"));
        assert_eq!(client.read_line().unwrap().as_deref(), Some("two"));
        assert_eq!(client.read_line().unwrap().as_deref(), Some("end"));
        assert_eq!(client.read_line().unwrap(), None);
    }

    #[test]
    fn connect_retries_then_fails() {
        let connector = MockConnector::new();
        let mut client = HttpClient::new(connector.clone(), ClientConfig::default());

        let err = client.get(&url("http://10.0.0.9:1980/x")).unwrap_err();
        assert!(matches!(err, HttpError::ConnectFailed { .. }));
        assert_eq!(connector.connects().len(), 3);
    }
}
