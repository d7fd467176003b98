use std::fmt;

use crate::{
    error::{HttpError, HttpResult},
    transport::ByteStream,
};

const HTTP_VERSION: &str = "HTTP/1.1";

/// HTTP request methods, including the three UPnP eventing methods.
///
/// Unknown-but-valid tokens parse into `Extension` so a malformed peer does
/// not kill the session; routing only ever matches the named variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Subscribe,
    Unsubscribe,
    Notify,
    Extension(String),
}

impl Method {
    pub fn parse(token: &str) -> HttpResult<Self> {
        if token.is_empty() || !token.bytes().all(is_token_byte) {
            return Err(HttpError::BadStartLine(token.to_owned()));
        }

        Ok(match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "SUBSCRIBE" => Method::Subscribe,
            "UNSUBSCRIBE" => Method::Unsubscribe,
            "NOTIFY" => Method::Notify,
            other => Method::Extension(other.to_owned()),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Subscribe => "SUBSCRIBE",
            Method::Unsubscribe => "UNSUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Extension(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// An ordered collection of header fields.
///
/// Lookup is case-insensitive; setting a name that already exists replaces
/// the value in place, keeping the original position.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) -> HttpResult<()> {
        if name.is_empty()
            || name.bytes().any(|b| matches!(b, b'\r' | b'\n' | b':'))
            || value.bytes().any(|b| matches!(b, b'\r' | b'\n'))
        {
            return Err(HttpError::ForbiddenHeaderChar);
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value.to_owned();
        } else {
            self.entries.push((name.to_owned(), value.to_owned()));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the (comma-separated) header value contains `token`,
    /// compared case-insensitively. Used for `Transfer-Encoding: chunked`
    /// and `Connection: close`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses a bare CRLF-delimited header block, stopping at the first empty
    /// line. SSDP datagrams reuse this since they are HTTP-formatted.
    pub fn parse(block: &str) -> HttpResult<Headers> {
        let mut headers = Headers::new();
        for line in block.split("\r\n") {
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::BadHeader(line.to_owned()))?;
            headers.set(name.trim(), value.trim())?;
        }
        Ok(headers)
    }

    fn write_into(&self, out: &mut String) {
        for (name, value) in self.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
    }
}

/// Reads one CRLF-terminated line, byte by byte, deducting from `budget`.
/// Returns the line without its terminator.
fn read_line<S: ByteStream>(stream: &mut S, budget: &mut usize) -> HttpResult<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if *budget == 0 {
            return Err(HttpError::HeaderOverflow);
        }
        match stream.read(&mut byte)? {
            0 => return Err(HttpError::ConnectionClosed),
            _ => {}
        }
        *budget -= 1;

        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line).map_err(|_| HttpError::ForbiddenHeaderChar);
        }
        line.push(byte[0]);
    }
}

fn read_header_block<S: ByteStream>(
    stream: &mut S,
    budget: &mut usize,
) -> HttpResult<Headers> {
    let mut headers = Headers::new();
    loop {
        let line = read_line(stream, budget)?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::BadHeader(line.clone()))?;
        headers.set(name.trim(), value.trim())?;
    }
}

/// The start line and headers of a request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_owned(),
            headers: Headers::new(),
        }
    }

    /// Reads and parses `METHOD SP path SP HTTP/1.1` plus the header block,
    /// consuming at most `limit` bytes from the stream.
    pub fn read_from<S: ByteStream>(stream: &mut S, limit: usize) -> HttpResult<Self> {
        let mut budget = limit;
        let line = read_line(stream, &mut budget)?;

        let mut parts = line.split(' ');
        let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(p), Some(v), None) => (m, p, v),
            _ => return Err(HttpError::BadStartLine(line.clone())),
        };
        if !version.starts_with("HTTP/") || path.is_empty() {
            return Err(HttpError::BadStartLine(line.clone()));
        }

        Ok(Self {
            method: Method::parse(method)?,
            path: path.to_owned(),
            headers: read_header_block(stream, &mut budget)?,
        })
    }

    pub fn write_to<S: ByteStream>(&self, stream: &mut S) -> HttpResult<()> {
        let mut out = String::new();
        out.push_str(self.method.as_str());
        out.push(' ');
        out.push_str(&self.path);
        out.push(' ');
        out.push_str(HTTP_VERSION);
        out.push_str("\r\n");
        self.headers.write_into(&mut out);
        stream.write_all(out.as_bytes())?;
        Ok(())
    }
}

/// The status line and headers of a reply.
#[derive(Debug, Clone)]
pub struct ReplyHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ReplyHead {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_owned(),
            headers: Headers::new(),
        }
    }

    pub fn read_from<S: ByteStream>(stream: &mut S, limit: usize) -> HttpResult<Self> {
        let mut budget = limit;
        let line = read_line(stream, &mut budget)?;

        let mut parts = line.splitn(3, ' ');
        let (version, status) = match (parts.next(), parts.next()) {
            (Some(v), Some(s)) => (v, s),
            _ => return Err(HttpError::BadStartLine(line.clone())),
        };
        if !version.starts_with("HTTP/") {
            return Err(HttpError::BadStartLine(line.clone()));
        }
        let status: u16 = status
            .parse()
            .map_err(|_| HttpError::BadStartLine(line.clone()))?;
        let reason = parts.next().unwrap_or("").to_owned();

        Ok(Self {
            status,
            reason,
            headers: read_header_block(stream, &mut budget)?,
        })
    }

    pub fn write_to<S: ByteStream>(&self, stream: &mut S) -> HttpResult<()> {
        let mut out = String::new();
        out.push_str(HTTP_VERSION);
        out.push(' ');
        out.push_str(&self.status.to_string());
        out.push(' ');
        out.push_str(&self.reason);
        out.push_str("\r\n");
        self.headers.write_into(&mut out);
        stream.write_all(out.as_bytes())?;
        Ok(())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.contains_token("Transfer-Encoding", "chunked")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length")?.trim().parse().ok()
    }

    /// HTTP/1.1 connections persist unless the peer said otherwise.
    pub fn keep_alive(&self) -> bool {
        !self.headers.contains_token("Connection", "close")
    }
}

/// Canonical reason phrases for the statuses the engine emits itself.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved",
        400 => "Bad Request",
        404 => "Page Not Found",
        412 => "Precondition Failed",
        500 => "Internal Error",
        501 => "Not Implemented",
        _ => "",
    }
}
