use std::time::Duration;

use serde::{Deserialize, Serialize};
use tick_http::{ClientConfig, ServerConfig};

/// Tunables for the control point and the HTTP plumbing underneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPointConfig {
    /// Header and copy buffer size for the embedded HTTP server, in bytes.
    pub buffer_size: usize,
    /// Suggested sleep when a tick made no progress, in milliseconds.
    pub no_connect_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Requested subscription lifetime, in seconds.
    pub subscribe_interval_secs: u32,
    /// Permit devices announcing themselves on 127.0.0.1.
    pub allow_localhost: bool,
    /// Only keep devices whose device type contains this fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type_filter: Option<String>,
    /// Host to advertise in eventing `CALLBACK` URLs. When unset it is
    /// derived from the route towards the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_host: Option<String>,
    pub user_agent: String,
}

impl Default for ControlPointConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            no_connect_delay_ms: 5,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            subscribe_interval_secs: 1800,
            allow_localhost: false,
            device_type_filter: None,
            callback_host: None,
            user_agent: "dlna-control/0.1 UPnP/1.0".to_owned(),
        }
    }
}

impl ControlPointConfig {
    pub fn no_connect_delay(&self) -> Duration {
        Duration::from_millis(self.no_connect_delay_ms)
    }

    pub fn subscribe_interval(&self) -> Duration {
        Duration::from_secs(self.subscribe_interval_secs.into())
    }

    pub(crate) fn server_config(&self) -> ServerConfig {
        ServerConfig {
            buffer_size: self.buffer_size,
            no_connect_delay_ms: self.no_connect_delay_ms,
            read_timeout_ms: self.read_timeout_ms,
            write_timeout_ms: self.write_timeout_ms,
        }
    }

    pub(crate) fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            read_timeout_ms: self.read_timeout_ms,
            write_timeout_ms: self.write_timeout_ms,
            user_agent: self.user_agent.clone(),
            keep_alive: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ControlPointConfig::default();
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.no_connect_delay(), Duration::from_millis(5));
        assert_eq!(config.subscribe_interval(), Duration::from_secs(1800));
        assert!(!config.allow_localhost);
    }
}
