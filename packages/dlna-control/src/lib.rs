#![deny(unreachable_pub)]
//! A DLNA/UPnP control point for cooperative, single-threaded runtimes.
//!
//! The control point discovers devices over SSDP, fetches and indexes their
//! service descriptions, executes SOAP actions against them, and subscribes
//! to GENA eventing with notifications delivered through an embedded HTTP
//! server. All progress happens inside [`ControlPoint::tick`]; there are no
//! background threads or timers.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    net::IpAddr,
    net::ToSocketAddrs,
    rc::Rc,
    time::{Duration, Instant},
};

use mime::Mime;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use tick_http::{
    Connect, HttpClient, HttpServer, Listen, Method, ReplyHead, Request, RouteTarget,
    TcpConnector, TcpListenerSource,
};

mod config;
mod device;
mod error;
mod protocol_info;
mod soap;
mod ssdp;
mod subscription;
mod xml;

pub use config::ControlPointConfig;
pub use device::{DeviceInfo, ServiceInfo};
pub use error::{Error, Result};
pub use protocol_info::{ProtocolInfoScanner, Role};
pub use soap::{Action, ActionReply, SoapFault};
pub use ssdp::{
    MSearch, SSDP_IPV4, SSDP_PORT, SsdpChannel, SsdpMessage, TARGET_ALL, TARGET_MEDIA_RENDERER,
    TARGET_MEDIA_SERVER, UdpSsdpChannel, local_ip_for, parse_ssdp,
};
pub use subscription::SubscriptionRecord;

use crate::{
    device::parse_description,
    soap::parse_action_reply,
    subscription::{SubscriptionRegistry, parse_property_set, parse_timeout},
};

/// The control point over real TCP sockets.
pub type TcpControlPoint = ControlPoint<TcpConnector, TcpListenerSource>;

type EventCallback = Box<dyn FnMut(&str, &str, &str)>;
type EventSink = Rc<RefCell<Option<EventCallback>>>;

struct Discovery {
    target: String,
    started: Instant,
    last_search: Instant,
    min_wait: Duration,
    max_wait: Duration,
}

/// Adapts the client's current reply body to `std::io::Read` for the
/// streaming XML parsers.
struct ClientBody<'a, C: Connect>(&'a mut HttpClient<C>);

impl<C: Connect> io::Read for ClientBody<'_, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(io::Error::other)
    }
}

/// The UPnP control point.
///
/// Generic over the outbound connector and the inbound listener so the whole
/// stack runs against in-memory transports in tests; use
/// [`TcpControlPoint`] for real networking.
pub struct ControlPoint<C: Connect, L: Listen> {
    config: ControlPointConfig,
    client: HttpClient<C>,
    server: HttpServer<L>,
    listener: Option<L>,
    ssdp: Box<dyn SsdpChannel>,
    devices: Vec<DeviceInfo>,
    pending: VecDeque<Action>,
    registry: Rc<RefCell<SubscriptionRegistry>>,
    events: EventSink,
    discovery: Option<Discovery>,
    last_reply: Option<ActionReply>,
}

impl<C: Connect, L: Listen> ControlPoint<C, L> {
    pub fn new(
        config: ControlPointConfig,
        connector: C,
        listener: L,
        ssdp: Box<dyn SsdpChannel>,
    ) -> Self {
        let client = HttpClient::new(connector, config.client_config());
        let server = HttpServer::new(config.server_config());
        Self {
            config,
            client,
            server,
            listener: Some(listener),
            ssdp,
            devices: Vec::new(),
            pending: VecDeque::new(),
            registry: Rc::new(RefCell::new(SubscriptionRegistry::default())),
            events: Rc::new(RefCell::new(None)),
            discovery: None,
            last_reply: None,
        }
    }

    pub fn config(&self) -> &ControlPointConfig {
        &self.config
    }

    /// Suggested sleep between ticks that made no progress.
    pub fn idle_delay(&self) -> Duration {
        self.config.no_connect_delay()
    }

    /// Starts the local HTTP server (first call only) and kicks off an
    /// SSDP search for `target`. Responses are drained by subsequent
    /// [`tick`](Self::tick) calls for at least `min_wait` and at most
    /// `max_wait`; searches are repeated every `min_wait` inside the window.
    pub fn begin(&mut self, target: &str, min_wait: Duration, max_wait: Duration) -> Result<()> {
        if !self.server.is_running() {
            let listener = self.listener.take().ok_or(Error::NotRunning)?;
            self.install_notify_route();
            self.server.begin(listener);
        }

        let now = Instant::now();
        self.send_search(target, max_wait)?;
        self.discovery = Some(Discovery {
            target: target.to_owned(),
            started: now,
            last_search: now,
            min_wait,
            max_wait,
        });
        Ok(())
    }

    /// Unsubscribes everything, forgets devices, and stops the server.
    pub fn end(&mut self) {
        let records = self.registry.borrow_mut().drain();
        for record in records {
            if let Err(error) = self.unsubscribe(&record) {
                warn!(sid = record.sid, %error, "unsubscribe failed");
            }
        }

        self.devices.clear();
        self.pending.clear();
        self.discovery = None;
        self.last_reply = None;
        self.server.end();
        self.client.close();
        info!("control point stopped");
    }

    /// One cooperative step: drain SSDP, run at most one queued action, fire
    /// due subscription renewals, give the HTTP server a tick. Returns true
    /// when anything progressed.
    pub fn tick(&mut self) -> bool {
        self.tick_at(Instant::now())
    }

    /// [`tick`](Self::tick) against an explicit clock, for embedding in
    /// simulations and tests.
    pub fn tick_at(&mut self, now: Instant) -> bool {
        let mut progressed = self.drain_ssdp(now);

        if let Some(action) = self.pending.pop_front() {
            let reply = self.run_action(action);
            self.last_reply = Some(reply);
            progressed = true;
        }

        progressed |= self.renew_due(now);
        progressed |= self.server.tick();
        progressed
    }

    /// True while a discovery window is still draining responses.
    pub fn discovery_active(&self) -> bool {
        self.discovery.is_some()
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Registers the callback invoked with `(sid, variable, value)` for
    /// every change carried by an inbound notification.
    pub fn on_event(&mut self, callback: impl FnMut(&str, &str, &str) + 'static) {
        *self.events.borrow_mut() = Some(Box::new(callback));
    }

    /// Queues an action for execution.
    pub fn enqueue(&mut self, action: Action) {
        self.pending.push_back(action);
    }

    pub fn pending_actions(&self) -> usize {
        self.pending.len()
    }

    /// Drains the action queue in order, one SOAP exchange each. The reply
    /// of the last executed action is retained and returned.
    pub fn execute_actions(&mut self) -> Option<&ActionReply> {
        while let Some(action) = self.pending.pop_front() {
            let reply = self.run_action(action);
            self.last_reply = Some(reply);
        }
        self.last_reply.as_ref()
    }

    /// Like [`execute_actions`](Self::execute_actions), but hands each reply
    /// to `processor` instead of parsing it into reply arguments. The
    /// processor reads the body straight off the client.
    pub fn execute_actions_with<F>(&mut self, mut processor: F) -> Option<&ActionReply>
    where
        F: FnMut(&mut HttpClient<C>, &ReplyHead) -> Result<()>,
    {
        while let Some(action) = self.pending.pop_front() {
            let reply = match self.post_action_raw(&action, &mut processor) {
                Ok(reply) => reply,
                Err(error) => {
                    warn!(action = action.name(), %error, "action failed");
                    self.client.close();
                    ActionReply::with_status(action.name(), 0)
                }
            };
            self.last_reply = Some(reply);
        }
        self.last_reply.as_ref()
    }

    /// The reply of the most recently executed action.
    pub fn last_reply(&self) -> Option<&ActionReply> {
        self.last_reply.as_ref()
    }

    /// Runs `GetProtocolInfo` against `service`, streaming the reply through
    /// the low-memory scanner. `emit` receives each protocol entry with its
    /// role.
    pub fn get_protocol_info(
        &mut self,
        service: &ServiceInfo,
        emit: impl FnMut(&str, Role),
    ) -> Result<()> {
        let action = Action::new(service, "GetProtocolInfo");
        let status = self.send_soap(&action)?;
        if !(200..300).contains(&status) {
            self.client.finish_reply()?;
            return Err(Error::Remote(status));
        }

        let scanned = ProtocolInfoScanner::scan(ClientBody(&mut self.client), emit);
        self.client.finish_reply()?;
        scanned
    }

    /// Issues a `SUBSCRIBE` for every service admitted by `filter` that
    /// supports eventing. Returns how many subscriptions were established;
    /// individual failures are logged and skipped.
    pub fn subscribe_notifications<F>(&mut self, filter: F) -> Result<usize>
    where
        F: Fn(&DeviceInfo, &ServiceInfo) -> bool,
    {
        if !self.server.is_running() {
            return Err(Error::NotRunning);
        }

        let targets: Vec<(String, Url)> = self
            .devices
            .iter()
            .flat_map(|device| {
                device
                    .services
                    .iter()
                    .filter(|service| filter(device, service))
                    .filter_map(|service| {
                        service
                            .event_sub_url
                            .clone()
                            .map(|url| (service.service_type.clone(), url))
                    })
            })
            .collect();

        let mut count = 0;
        for (service_type, event_url) in targets {
            match self.subscribe_service(&service_type, &event_url) {
                Ok(()) => count += 1,
                Err(error) => warn!(service = service_type, %error, "subscribe failed"),
            }
        }
        Ok(count)
    }

    /// A snapshot of the active subscriptions.
    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.registry.borrow().records().to_vec()
    }

    fn send_search(&mut self, target: &str, max_wait: Duration) -> Result<()> {
        let msearch = MSearch {
            target,
            // Devices delay up to MX seconds; cap per the UPnP guidance.
            mx: max_wait.as_secs().clamp(1, 5) as u32,
        };
        self.ssdp.send(&msearch.to_bytes())?;
        debug!(search_target = target, "search sent");
        Ok(())
    }

    fn install_notify_route(&mut self) {
        let registry = Rc::clone(&self.registry);
        let events = Rc::clone(&self.events);

        self.server.router_mut().add(
            "/evt/*",
            Method::Notify,
            RouteTarget::handler(move |exchange| {
                let sid = exchange
                    .request()
                    .headers
                    .get("SID")
                    .unwrap_or_default()
                    .to_owned();
                if !registry.borrow().contains(&sid) {
                    warn!(sid, "notification for unknown subscription");
                    return exchange.reply_error(412, "Precondition Failed");
                }

                let properties = match parse_property_set(exchange.body()) {
                    Ok(properties) => properties,
                    Err(error) => {
                        warn!(sid, %error, "unparseable notification body");
                        return exchange.reply_error(400, "Bad Request");
                    }
                };

                if let Some(callback) = events.borrow_mut().as_mut() {
                    for (variable, value) in &properties {
                        callback(&sid, variable, value);
                    }
                }
                exchange.reply_ok()
            }),
        );
    }

    fn drain_ssdp(&mut self, now: Instant) -> bool {
        let mut progressed = false;
        let mut buf = [0u8; 2048];
        loop {
            match self.ssdp.recv(&mut buf) {
                Ok(Some(n)) => {
                    progressed = true;
                    if let Some(message) = parse_ssdp(&buf[..n]) {
                        self.handle_ssdp(message);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "ssdp receive failed");
                    break;
                }
            }
        }

        let mut window_closed = false;
        let mut resend: Option<(String, Duration)> = None;
        if let Some(discovery) = &self.discovery {
            if now.duration_since(discovery.started) >= discovery.max_wait {
                window_closed = true;
            } else if now.duration_since(discovery.last_search)
                >= discovery.min_wait.max(Duration::from_secs(1))
            {
                resend = Some((discovery.target.clone(), discovery.max_wait));
            }
        }

        if window_closed {
            debug!(devices = self.devices.len(), "discovery window closed");
            self.discovery = None;
        } else if let Some((target, max_wait)) = resend {
            if self.send_search(&target, max_wait).is_ok() {
                if let Some(discovery) = &mut self.discovery {
                    discovery.last_search = now;
                }
                progressed = true;
            }
        }

        progressed
    }

    fn handle_ssdp(&mut self, message: SsdpMessage) {
        match &message {
            SsdpMessage::ByeBye { usn } => {
                let mut removed = Vec::new();
                self.devices.retain(|device| {
                    let gone = !device.udn.is_empty() && usn.starts_with(&device.udn);
                    if gone {
                        removed.push(device.location.clone());
                    }
                    !gone
                });

                if !removed.is_empty() {
                    // Subscriptions on a vanished device cannot be renewed
                    // or unsubscribed; drop their records outright.
                    let mut registry = self.registry.borrow_mut();
                    let stale: Vec<String> = registry
                        .records()
                        .iter()
                        .filter(|record| {
                            removed
                                .iter()
                                .any(|location| location.host_str() == record.event_url.host_str())
                        })
                        .map(|record| record.sid.clone())
                        .collect();
                    for sid in stale {
                        registry.remove(&sid);
                    }
                    info!(usn, "device left the network");
                }
            }
            _ => {
                let Some((location, announced)) = message.location() else {
                    return;
                };
                let location = location.clone();
                let announced = announced.to_owned();
                if let Err(error) = self.consider_device(location.clone(), &announced) {
                    warn!(%location, %error, "device ignored");
                }
            }
        }
    }

    /// Fetches and indexes the description behind a newly announced
    /// location. Locations already in the collection are skipped.
    fn consider_device(&mut self, location: Url, announced: &str) -> Result<()> {
        if self.devices.iter().any(|d| d.location == location) {
            return Ok(());
        }

        if !self.config.allow_localhost {
            let host = location.host_str().unwrap_or("");
            if host == "127.0.0.1"
                || host == "::1"
                || host == "[::1]"
                || host.eq_ignore_ascii_case("localhost")
            {
                return Err(Error::Location(format!("{location} is loopback")));
            }
        }

        let status = self.client.get(&location)?;
        if !(200..300).contains(&status) {
            self.client.finish_reply()?;
            return Err(Error::Remote(status));
        }

        let parsed = parse_description(&location, ClientBody(&mut self.client));
        self.client.finish_reply()?;
        let device = parsed?;

        if let Some(filter) = &self.config.device_type_filter {
            if !device.device_type.contains(filter.as_str()) && !announced.contains(filter.as_str())
            {
                debug!(%location, device_type = device.device_type, "filtered out");
                return Ok(());
            }
        }

        info!(
            %location,
            name = device.friendly_name,
            services = device.services.len(),
            "device discovered"
        );
        self.devices.push(device);
        Ok(())
    }

    fn soap_content_type(&self) -> Result<Mime> {
        "text/xml; charset=\"utf-8\""
            .parse()
            .map_err(|_| Error::Parse("invalid SOAP content type".into()))
    }

    fn send_soap(&mut self, action: &Action) -> Result<u16> {
        let envelope = action.envelope()?;
        let status = self.client.send(
            Request::new(Method::Post, action.control_url())
                .content_type(self.soap_content_type()?)
                .header("SOAPACTION", &action.soap_action())
                .body(&envelope),
        )?;
        Ok(status)
    }

    fn run_action(&mut self, action: Action) -> ActionReply {
        match self.post_action(&action) {
            Ok(reply) => reply,
            Err(error) => {
                warn!(action = action.name(), %error, "action failed");
                self.client.close();
                ActionReply::with_status(action.name(), 0)
            }
        }
    }

    fn post_action(&mut self, action: &Action) -> Result<ActionReply> {
        let status = self.send_soap(action)?;

        let reply = match parse_action_reply(status, action.name(), ClientBody(&mut self.client)) {
            Ok(reply) => reply,
            Err(error) => {
                warn!(action = action.name(), status, %error, "unparseable SOAP reply");
                // A 2xx with garbage in it is still a failed action.
                let status = if (200..300).contains(&status) { 0 } else { status };
                ActionReply::with_status(action.name(), status)
            }
        };
        self.client.finish_reply()?;
        Ok(reply)
    }

    fn post_action_raw<F>(&mut self, action: &Action, processor: &mut F) -> Result<ActionReply>
    where
        F: FnMut(&mut HttpClient<C>, &ReplyHead) -> Result<()>,
    {
        let status = self.send_soap(action)?;
        let head = self
            .client
            .reply()
            .cloned()
            .ok_or(Error::Remote(status))?;
        let processed = processor(&mut self.client, &head);
        self.client.finish_reply()?;
        processed?;
        Ok(ActionReply::with_status(action.name(), status))
    }

    fn subscribe_service(&mut self, service_type: &str, event_url: &Url) -> Result<()> {
        let callback_path = format!("/evt/{}", Uuid::new_v4().simple());
        let callback = self.callback_url(event_url, &callback_path)?;

        let status = self.client.send(
            Request::new(Method::Subscribe, event_url)
                .header("CALLBACK", &format!("<{callback}>"))
                .header("NT", "upnp:event")
                .header(
                    "TIMEOUT",
                    &format!("Second-{}", self.config.subscribe_interval_secs),
                ),
        )?;
        let reply = self.client.reply().cloned();
        self.client.finish_reply()?;

        if !(200..300).contains(&status) {
            return Err(Error::Subscription(format!("device answered {status}")));
        }
        let reply = reply.ok_or_else(|| Error::Subscription("no reply".into()))?;
        let sid = reply
            .headers
            .get("SID")
            .map(str::to_owned)
            .filter(|sid| !sid.is_empty())
            .ok_or_else(|| Error::Subscription("reply carried no SID".into()))?;
        let timeout = reply
            .headers
            .get("TIMEOUT")
            .and_then(parse_timeout)
            .unwrap_or_else(|| self.config.subscribe_interval());

        self.registry.borrow_mut().insert(SubscriptionRecord::new(
            sid,
            service_type.to_owned(),
            event_url.clone(),
            callback_path,
            timeout,
            Instant::now(),
        ));
        Ok(())
    }

    fn renew_due(&mut self, now: Instant) -> bool {
        let due = self.registry.borrow().due_renewals(now);
        if due.is_empty() {
            return false;
        }

        for sid in due {
            let event_url = match self.registry.borrow().find(&sid) {
                Some(record) => record.event_url.clone(),
                None => continue,
            };

            match self.renew_one(&sid, &event_url) {
                Ok(timeout) => {
                    debug!(sid, ?timeout, "subscription renewed");
                    self.registry.borrow_mut().mark_renewed(&sid, timeout, now);
                }
                Err(error) => {
                    warn!(sid, %error, "renewal failed");
                    self.registry.borrow_mut().mark_failed(&sid, now);
                }
            }
        }
        true
    }

    /// Renews one subscription; the `SID` header replaces the `CALLBACK`/
    /// `NT` pair and the SID itself never changes.
    fn renew_one(&mut self, sid: &str, event_url: &Url) -> Result<Duration> {
        let status = self.client.send(
            Request::new(Method::Subscribe, event_url)
                .header("SID", sid)
                .header(
                    "TIMEOUT",
                    &format!("Second-{}", self.config.subscribe_interval_secs),
                ),
        )?;
        let reply = self.client.reply().cloned();
        self.client.finish_reply()?;

        if !(200..300).contains(&status) {
            return Err(Error::Subscription(format!("device answered {status}")));
        }
        Ok(reply
            .and_then(|r| r.headers.get("TIMEOUT").and_then(parse_timeout))
            .unwrap_or_else(|| self.config.subscribe_interval()))
    }

    fn unsubscribe(&mut self, record: &SubscriptionRecord) -> Result<()> {
        let status = self.client.send(
            Request::new(Method::Unsubscribe, &record.event_url).header("SID", &record.sid),
        )?;
        self.client.finish_reply()?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(Error::Remote(status))
        }
    }

    fn callback_url(&mut self, event_url: &Url, path: &str) -> Result<Url> {
        let port = self.server.local_port().ok_or(Error::NotRunning)?;
        let host = match &self.config.callback_host {
            Some(host) => host.clone(),
            None => {
                let peer = event_url
                    .host_str()
                    .ok_or_else(|| Error::Location(event_url.to_string()))?;
                let peer_ip: IpAddr = match peer.parse() {
                    Ok(ip) => ip,
                    Err(_) => (peer, 0)
                        .to_socket_addrs()?
                        .next()
                        .ok_or_else(|| Error::Location(event_url.to_string()))?
                        .ip(),
                };
                match local_ip_for(peer_ip)? {
                    IpAddr::V4(v4) => v4.to_string(),
                    IpAddr::V6(v6) => format!("[{v6}]"),
                }
            }
        };
        Url::parse(&format!("http://{host}:{port}{path}")).map_err(Into::into)
    }
}
