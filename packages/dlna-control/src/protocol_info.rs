use std::io::Read;

use tracing::warn;

use crate::error::Result;

// Sliding window for spotting an opening tag, and the cap on one CSV entry.
const WINDOW_LIMIT: usize = 64;
const ENTRY_LIMIT: usize = 128;
// Read granularity when scanning a reply stream.
const SCAN_BUFFER: usize = 200;

const SOURCE_OPEN: &str = "<Source";
const SINK_OPEN: &str = "<Sink";
const SOURCE_CLOSE: &str = "</Source>";
const SINK_CLOSE: &str = "</Sink>";

/// Whether an entry came from `<Source>` or `<Sink>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Sink,
}

impl Role {
    fn close_tag(self) -> &'static str {
        match self {
            Role::Source => SOURCE_CLOSE,
            Role::Sink => SINK_CLOSE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scanning for an opening tag.
    Looking,
    /// Inside the opening tag, discarding up to its `>`.
    OpenTag(Role),
    /// Accumulating entry characters.
    Collecting(Role),
    /// Partially matched into the closing tag, this many characters deep.
    CloseTag(Role, usize),
}

/// Streaming extractor for the comma-separated protocol entries inside a
/// `GetProtocolInfo` reply.
///
/// The reply is scanned byte by byte with a small sliding window, so
/// arbitrarily large documents pass through in constant memory. Each
/// complete entry is handed to the callback together with its role.
pub struct ProtocolInfoScanner {
    state: State,
    window: String,
    entry: String,
    truncated: bool,
}

impl Default for ProtocolInfoScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolInfoScanner {
    pub fn new() -> Self {
        Self {
            state: State::Looking,
            window: String::with_capacity(WINDOW_LIMIT),
            entry: String::with_capacity(ENTRY_LIMIT),
            truncated: false,
        }
    }

    /// Reads `source` to the end, emitting every entry found.
    pub fn scan<R: Read>(source: R, mut emit: impl FnMut(&str, Role)) -> Result<()> {
        let mut scanner = Self::new();
        let mut source = source;
        let mut buf = [0u8; SCAN_BUFFER];
        loop {
            let got = source.read(&mut buf)?;
            if got == 0 {
                break;
            }
            scanner.feed(&buf[..got], &mut emit);
        }
        scanner.finish(&mut emit);
        Ok(())
    }

    pub fn feed(&mut self, bytes: &[u8], emit: &mut impl FnMut(&str, Role)) {
        for &byte in bytes {
            self.push(byte as char, emit);
        }
    }

    /// Flushes a trailing entry of a document that ended mid-element.
    pub fn finish(&mut self, emit: &mut impl FnMut(&str, Role)) {
        match self.state {
            State::Collecting(role) | State::CloseTag(role, _) => self.flush(role, emit),
            State::Looking | State::OpenTag(_) => {}
        }
        self.state = State::Looking;
        self.window.clear();
    }

    fn push(&mut self, ch: char, emit: &mut impl FnMut(&str, Role)) {
        match self.state {
            State::Looking => {
                if self.window.len() >= WINDOW_LIMIT {
                    self.window.remove(0);
                }
                self.window.push(ch);
                if self.window.ends_with(SOURCE_OPEN) {
                    self.enter(Role::Source);
                } else if self.window.ends_with(SINK_OPEN) {
                    self.enter(Role::Sink);
                }
            }
            State::OpenTag(role) => {
                if ch == '>' {
                    self.state = State::Collecting(role);
                }
            }
            State::Collecting(role) => self.collect(role, ch, emit),
            State::CloseTag(role, matched) => {
                let close = role.close_tag();
                if close.as_bytes().get(matched) == Some(&(ch as u8)) {
                    if matched + 1 == close.len() {
                        self.flush(role, emit);
                        self.state = State::Looking;
                        self.window.clear();
                    } else {
                        self.state = State::CloseTag(role, matched + 1);
                    }
                } else {
                    // A false start on the closing tag: whatever prefix was
                    // consumed belongs to the entry after all.
                    self.entry.push_str(&close[..matched]);
                    self.state = State::Collecting(role);
                    self.collect(role, ch, emit);
                }
            }
        }
    }

    fn collect(&mut self, role: Role, ch: char, emit: &mut impl FnMut(&str, Role)) {
        match ch {
            ',' => self.flush(role, emit),
            '<' => self.state = State::CloseTag(role, 1),
            _ => {
                if self.entry.len() < ENTRY_LIMIT {
                    self.entry.push(ch);
                } else if !self.truncated {
                    warn!("protocol info entry exceeds {ENTRY_LIMIT} bytes, truncating");
                    self.truncated = true;
                }
            }
        }
    }

    fn enter(&mut self, role: Role) {
        self.state = State::OpenTag(role);
        self.window.clear();
        self.entry.clear();
        self.truncated = false;
    }

    fn flush(&mut self, role: Role, emit: &mut impl FnMut(&str, Role)) {
        let entry = self.entry.trim();
        if !entry.is_empty() {
            emit(entry, role);
        }
        self.entry.clear();
        self.truncated = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scan_str(input: &str) -> Vec<(String, Role)> {
        let mut out = Vec::new();
        ProtocolInfoScanner::scan(input.as_bytes(), |entry, role| {
            out.push((entry.to_owned(), role));
        })
        .unwrap();
        out
    }

    #[test]
    fn source_and_sink_entries_in_order() {
        let result = scan_str("<Source>a,b,c</Source><Sink>x,y</Sink>");
        assert_eq!(
            result,
            vec![
                ("a".to_owned(), Role::Source),
                ("b".to_owned(), Role::Source),
                ("c".to_owned(), Role::Source),
                ("x".to_owned(), Role::Sink),
                ("y".to_owned(), Role::Sink),
            ]
        );
    }

    #[test]
    fn byte_at_a_time_matches_bulk() {
        let input = "<Source>http-get:*:video/mp4:*,http-get:*:audio/mpeg:*</Source>";
        let bulk = scan_str(input);

        let mut trickled = Vec::new();
        let mut scanner = ProtocolInfoScanner::new();
        let mut emit = |entry: &str, role: Role| trickled.push((entry.to_owned(), role));
        for byte in input.bytes() {
            scanner.feed(&[byte], &mut emit);
        }
        scanner.finish(&mut emit);

        assert_eq!(bulk, trickled);
        assert_eq!(bulk.len(), 2);
    }

    #[test]
    fn entries_inside_full_soap_reply() {
        let reply = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetProtocolInfoResponse xmlns:u="urn:schemas-upnp-org:service:ConnectionManager:1">
      <Source>http-get:*:video/mp4:*, http-get:*:video/x-matroska:*</Source>
      <Sink></Sink>
    </u:GetProtocolInfoResponse>
  </s:Body>
</s:Envelope>"#;

        let result = scan_str(reply);
        assert_eq!(
            result,
            vec![
                ("http-get:*:video/mp4:*".to_owned(), Role::Source),
                ("http-get:*:video/x-matroska:*".to_owned(), Role::Source),
            ]
        );
    }

    #[test]
    fn whitespace_is_trimmed_and_empty_entries_skipped() {
        let result = scan_str("<Source> a , ,b, </Source>");
        assert_eq!(
            result,
            vec![
                ("a".to_owned(), Role::Source),
                ("b".to_owned(), Role::Source),
            ]
        );
    }

    #[test]
    fn false_close_tag_prefix_rolls_back_into_entry() {
        // "</Sou" looks like the closing tag for a while, then is not.
        let result = scan_str("<Source>a</Soup,b</Source>");
        assert_eq!(
            result,
            vec![
                ("a</Soup".to_owned(), Role::Source),
                ("b".to_owned(), Role::Source),
            ]
        );
    }

    #[test]
    fn truncated_document_still_flushes_the_tail() {
        let result = scan_str("<Sink>x,y");
        assert_eq!(
            result,
            vec![("x".to_owned(), Role::Sink), ("y".to_owned(), Role::Sink)]
        );
    }

    #[test]
    fn oversize_entry_is_truncated_not_fatal() {
        let long = "a".repeat(ENTRY_LIMIT * 2);
        let result = scan_str(&format!("<Source>{long},ok</Source>"));
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0.len(), ENTRY_LIMIT);
        assert_eq!(result[1].0, "ok");
    }
}
