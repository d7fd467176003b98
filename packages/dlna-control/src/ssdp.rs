use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};
use url::Url;

use tick_http::Headers;

/// The SSDP multicast group.
pub const SSDP_IPV4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// The default port for SSDP communication.
pub const SSDP_PORT: u16 = 1900;

/// Search target matching every UPnP device and service.
pub const TARGET_ALL: &str = "ssdp:all";
/// Search target for MediaRenderer devices.
pub const TARGET_MEDIA_RENDERER: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";
/// Search target for MediaServer devices.
pub const TARGET_MEDIA_SERVER: &str = "urn:schemas-upnp-org:device:MediaServer:1";

/// Datagram interface the control point drives discovery through. Sending
/// goes to the multicast group; receiving must never block.
pub trait SsdpChannel {
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;

    /// The next pending datagram, or `None` when nothing is waiting.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

/// [`SsdpChannel`] over a real multicast UDP socket.
pub struct UdpSsdpChannel {
    socket: UdpSocket,
    group: SocketAddr,
}

impl UdpSsdpChannel {
    /// Binds the SSDP port with address reuse and joins the multicast group
    /// on `interface`, so both search responses and unsolicited
    /// announcements arrive here.
    pub fn open(interface: Ipv4Addr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, SSDP_PORT)).into())?;
        socket.join_multicast_v4(&SSDP_IPV4, &interface)?;
        socket.set_nonblocking(true)?;

        debug!(%interface, "ssdp channel open");
        Ok(Self {
            socket: socket.into(),
            group: SocketAddr::from((SSDP_IPV4, SSDP_PORT)),
        })
    }
}

impl SsdpChannel for UdpSsdpChannel {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.group)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => {
                trace!(%addr, bytes = n, "ssdp datagram");
                Ok(Some(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Picks the local address the OS would use to reach `peer`, for building
/// eventing callback URLs. No traffic is sent.
pub fn local_ip_for(peer: IpAddr) -> io::Result<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect((peer, 9))?;
    Ok(probe.local_addr()?.ip())
}

/// An `M-SEARCH` multicast request.
pub struct MSearch<'a> {
    pub target: &'a str,
    /// Maximum response delay devices may pick, in seconds.
    pub mx: u32,
}

impl MSearch<'_> {
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {SSDP_IPV4}:{SSDP_PORT}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: {}\r\n\
             ST: {}\r\n\
             \r\n",
            self.mx, self.target
        )
        .into_bytes()
    }
}

/// A parsed SSDP datagram the control point cares about.
#[derive(Debug)]
pub enum SsdpMessage {
    /// A unicast reply to our `M-SEARCH`.
    SearchResponse { location: Url, st: String },
    /// An unsolicited `ssdp:alive` announcement.
    Alive { location: Url, nt: String },
    /// A device leaving the network.
    ByeBye { usn: String },
}

impl SsdpMessage {
    /// The announced location and type, for messages that carry one.
    pub fn location(&self) -> Option<(&Url, &str)> {
        match self {
            SsdpMessage::SearchResponse { location, st } => Some((location, st)),
            SsdpMessage::Alive { location, nt } => Some((location, nt)),
            SsdpMessage::ByeBye { .. } => None,
        }
    }
}

/// Parses one datagram. Returns `None` for packets that are not ours to act
/// on: searches from other control points, malformed noise, alive messages
/// without a location.
pub fn parse_ssdp(packet: &[u8]) -> Option<SsdpMessage> {
    let text = std::str::from_utf8(packet).ok()?;
    let (start_line, rest) = text.split_once("\r\n")?;
    let headers = Headers::parse(rest).ok()?;

    if start_line.starts_with("HTTP/1.1 200") {
        let location = headers.get("LOCATION")?.parse().ok()?;
        return Some(SsdpMessage::SearchResponse {
            location,
            st: headers.get("ST").unwrap_or("").to_owned(),
        });
    }

    if start_line.starts_with("M-SEARCH") {
        return None;
    }

    if start_line.starts_with("NOTIFY") {
        let nts = headers.get("NTS").unwrap_or("");
        if nts.eq_ignore_ascii_case("ssdp:byebye") {
            return Some(SsdpMessage::ByeBye {
                usn: headers.get("USN").unwrap_or("").to_owned(),
            });
        }
        if nts.eq_ignore_ascii_case("ssdp:alive") {
            let location = headers.get("LOCATION")?.parse().ok()?;
            return Some(SsdpMessage::Alive {
                location,
                nt: headers.get("NT").unwrap_or("").to_owned(),
            });
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn msearch_wire_format() {
        let msearch = MSearch {
            target: TARGET_MEDIA_RENDERER,
            mx: 3,
        };
        let text = String::from_utf8(msearch.to_bytes()).unwrap();
        assert!(text.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(text.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(text.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(text.contains("MX: 3\r\n"));
        assert!(text.contains("ST: urn:schemas-upnp-org:device:MediaRenderer:1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parse_search_response() {
        let packet = b"HTTP/1.1 200 OK\r\n\
            CACHE-CONTROL: max-age=1800\r\n\
            LOCATION: http://10.0.0.9:1980/desc.xml\r\n\
            ST: upnp:rootdevice\r\n\
            USN: uuid:abc::upnp:rootdevice\r\n\r\n";

        match parse_ssdp(packet) {
            Some(SsdpMessage::SearchResponse { location, st }) => {
                assert_eq!(location.as_str(), "http://10.0.0.9:1980/desc.xml");
                assert_eq!(st, "upnp:rootdevice");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_alive_and_byebye() {
        let alive = b"NOTIFY * HTTP/1.1\r\n\
            HOST: 239.255.255.250:1900\r\n\
            NT: urn:schemas-upnp-org:device:MediaRenderer:1\r\n\
            NTS: ssdp:alive\r\n\
            LOCATION: http://10.0.0.9:1980/desc.xml\r\n\
            USN: uuid:abc\r\n\r\n";
        assert!(matches!(
            parse_ssdp(alive),
            Some(SsdpMessage::Alive { .. })
        ));

        let byebye = b"NOTIFY * HTTP/1.1\r\n\
            HOST: 239.255.255.250:1900\r\n\
            NT: upnp:rootdevice\r\n\
            NTS: ssdp:byebye\r\n\
            USN: uuid:abc::upnp:rootdevice\r\n\r\n";
        match parse_ssdp(byebye) {
            Some(SsdpMessage::ByeBye { usn }) => {
                assert_eq!(usn, "uuid:abc::upnp:rootdevice");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn foreign_searches_and_noise_are_ignored() {
        assert!(parse_ssdp(b"M-SEARCH * HTTP/1.1\r\nST: ssdp:all\r\n\r\n").is_none());
        assert!(parse_ssdp(b"\xff\xfe not text").is_none());
        assert!(parse_ssdp(b"HTTP/1.1 200 OK\r\nST: no-location\r\n\r\n").is_none());
    }
}
