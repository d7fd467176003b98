use std::{
    io::Read,
    time::{Duration, Instant},
};

use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    xml::XmlReader,
};

const NS_UPNP_EVENT: &str = "urn:schemas-upnp-org:event-1-0";

// A renewal that keeps failing is dropped after this many attempts.
const MAX_RENEWAL_FAILURES: u32 = 3;

/// One live GENA subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub sid: String,
    pub service_type: String,
    pub event_url: Url,
    /// Local route path the device was told to NOTIFY.
    pub callback_path: String,
    pub timeout: Duration,
    pub expires_at: Instant,
    pub renew_at: Instant,
    failures: u32,
}

impl SubscriptionRecord {
    pub(crate) fn new(
        sid: String,
        service_type: String,
        event_url: Url,
        callback_path: String,
        timeout: Duration,
        now: Instant,
    ) -> Self {
        let (expires_at, renew_at) = schedule(timeout, now);
        Self {
            sid,
            service_type,
            event_url,
            callback_path,
            timeout,
            expires_at,
            renew_at,
            failures: 0,
        }
    }
}

/// Renew at half the granted lifetime, so a lost renewal still has the
/// second half of the window to be retried in.
fn schedule(timeout: Duration, now: Instant) -> (Instant, Instant) {
    (now + timeout, now + timeout / 2)
}

/// All active subscriptions, keyed by SID.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    records: Vec<SubscriptionRecord>,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(&mut self, record: SubscriptionRecord) {
        debug!(sid = record.sid, service = record.service_type, "subscribed");
        self.records.retain(|r| r.sid != record.sid);
        self.records.push(record);
    }

    pub(crate) fn contains(&self, sid: &str) -> bool {
        self.records.iter().any(|r| r.sid == sid)
    }

    pub(crate) fn records(&self) -> &[SubscriptionRecord] {
        &self.records
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// SIDs whose renewal deadline has passed.
    pub(crate) fn due_renewals(&self, now: Instant) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| now >= r.renew_at)
            .map(|r| r.sid.clone())
            .collect()
    }

    pub(crate) fn find(&self, sid: &str) -> Option<&SubscriptionRecord> {
        self.records.iter().find(|r| r.sid == sid)
    }

    /// Re-arms the record after a successful renewal; the SID never changes.
    pub(crate) fn mark_renewed(&mut self, sid: &str, timeout: Duration, now: Instant) {
        if let Some(record) = self.records.iter_mut().find(|r| r.sid == sid) {
            let (expires_at, renew_at) = schedule(timeout, now);
            record.timeout = timeout;
            record.expires_at = expires_at;
            record.renew_at = renew_at;
            record.failures = 0;
        }
    }

    /// Records a failed renewal. The retry is scheduled inside what is left
    /// of the lifetime; after too many failures the record is dropped and
    /// `false` is returned.
    pub(crate) fn mark_failed(&mut self, sid: &str, now: Instant) -> bool {
        let Some(record) = self.records.iter_mut().find(|r| r.sid == sid) else {
            return false;
        };

        record.failures += 1;
        if record.failures >= MAX_RENEWAL_FAILURES {
            warn!(sid, "subscription dropped after repeated renewal failures");
            self.records.retain(|r| r.sid != sid);
            return false;
        }
        record.renew_at = now + record.timeout / 8;
        true
    }

    pub(crate) fn remove(&mut self, sid: &str) -> Option<SubscriptionRecord> {
        let index = self.records.iter().position(|r| r.sid == sid)?;
        Some(self.records.remove(index))
    }

    pub(crate) fn drain(&mut self) -> Vec<SubscriptionRecord> {
        std::mem::take(&mut self.records)
    }
}

/// Parses a `TIMEOUT: Second-N` header value. `Second-infinite` maps to a
/// year; `Second-0` means the subscription is already expired.
pub(crate) fn parse_timeout(value: &str) -> Option<Duration> {
    let rest = value.trim().strip_prefix("Second-")?;
    if rest.eq_ignore_ascii_case("infinite") {
        return Some(Duration::from_secs(365 * 24 * 3600));
    }
    rest.parse().ok().map(Duration::from_secs)
}

/// Parses a GENA `propertyset` body into `(variable, value)` pairs.
pub(crate) fn parse_property_set<R: Read>(source: R) -> Result<Vec<(String, String)>> {
    let mut reader = XmlReader::new(source);
    let mut properties = Vec::new();

    let root = reader
        .next_element()?
        .ok_or_else(|| Error::Parse("empty propertyset".into()))?;
    if root.name.as_ref() != (Some(NS_UPNP_EVENT), "propertyset") {
        return Err(Error::Parse(format!(
            "unexpected propertyset element {}",
            root.name.local_name
        )));
    }

    while let Some(property) = reader.next_element()? {
        if property.name.as_ref() != (Some(NS_UPNP_EVENT), "property") {
            reader.skip()?;
            continue;
        }
        while let Some(variable) = reader.next_element()? {
            let name = variable.name.local_name;
            let value = reader.text()?.unwrap_or_default();
            properties.push((name, value));
        }
    }

    Ok(properties)
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(sid: &str, timeout_secs: u64, now: Instant) -> SubscriptionRecord {
        SubscriptionRecord::new(
            sid.to_owned(),
            "urn:schemas-upnp-org:service:AVTransport:1".to_owned(),
            Url::parse("http://10.0.0.9:1980/evt").unwrap(),
            format!("/evt/{sid}"),
            Duration::from_secs(timeout_secs),
            now,
        )
    }

    #[test]
    fn timeout_header_parsing() {
        assert_eq!(parse_timeout("Second-60"), Some(Duration::from_secs(60)));
        assert_eq!(parse_timeout(" Second-1800 "), Some(Duration::from_secs(1800)));
        assert_eq!(parse_timeout("Second-0"), Some(Duration::ZERO));
        assert!(parse_timeout("Second-infinite").unwrap() > Duration::from_secs(86400));
        assert_eq!(parse_timeout("minutes-5"), None);
    }

    #[test]
    fn renewal_is_due_at_half_time() {
        let now = Instant::now();
        let mut registry = SubscriptionRegistry::default();
        registry.insert(record("uuid:1", 60, now));

        assert!(registry.due_renewals(now + Duration::from_secs(29)).is_empty());
        assert_eq!(
            registry.due_renewals(now + Duration::from_secs(30)),
            vec!["uuid:1".to_owned()]
        );
    }

    #[test]
    fn zero_timeout_is_immediately_due() {
        let now = Instant::now();
        let mut registry = SubscriptionRegistry::default();
        registry.insert(record("uuid:0", 0, now));

        assert_eq!(registry.due_renewals(now).len(), 1);
    }

    #[test]
    fn renewal_preserves_sid_and_resets_clock() {
        let now = Instant::now();
        let mut registry = SubscriptionRegistry::default();
        registry.insert(record("uuid:1", 60, now));

        let later = now + Duration::from_secs(30);
        registry.mark_renewed("uuid:1", Duration::from_secs(120), later);

        let record = registry.find("uuid:1").unwrap();
        assert_eq!(record.sid, "uuid:1");
        assert_eq!(record.renew_at, later + Duration::from_secs(60));
        assert!(registry.due_renewals(later).is_empty());
    }

    #[test]
    fn repeated_failures_drop_the_record() {
        let now = Instant::now();
        let mut registry = SubscriptionRegistry::default();
        registry.insert(record("uuid:1", 80, now));

        assert!(registry.mark_failed("uuid:1", now));
        assert!(registry.mark_failed("uuid:1", now));
        assert!(!registry.mark_failed("uuid:1", now));
        assert!(!registry.contains("uuid:1"));
    }

    #[test]
    fn duplicate_sid_replaces_the_old_record() {
        let now = Instant::now();
        let mut registry = SubscriptionRegistry::default();
        registry.insert(record("uuid:1", 60, now));
        registry.insert(record("uuid:1", 120, now));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.find("uuid:1").unwrap().timeout,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn property_set_round_trip() {
        let body = r#"<?xml version="1.0"?>
<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
  <e:property><TransportState>PLAYING</TransportState></e:property>
  <e:property><Volume>42</Volume></e:property>
</e:propertyset>"#;

        let properties = parse_property_set(body.as_bytes()).unwrap();
        assert_eq!(
            properties,
            vec![
                ("TransportState".to_owned(), "PLAYING".to_owned()),
                ("Volume".to_owned(), "42".to_owned()),
            ]
        );
    }

    #[test]
    fn empty_property_value_is_empty_string() {
        let body = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
  <e:property><LastChange></LastChange></e:property>
</e:propertyset>"#;

        let properties = parse_property_set(body.as_bytes()).unwrap();
        assert_eq!(properties, vec![("LastChange".to_owned(), String::new())]);
    }
}
