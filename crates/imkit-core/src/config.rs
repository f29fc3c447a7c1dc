use std::fmt;
use std::time::Duration;

use crate::error::{ImError, ImResult};

/// Service region used to derive a default endpoint when no server is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    CnNorth,
    CnEast,
    UsWest,
}

impl Region {
    fn host_suffix(self) -> &'static str {
        match self {
            Self::CnNorth => "rtm.cn-n1.imkit.dev",
            Self::CnEast => "rtm.cn-e1.imkit.dev",
            Self::UsWest => "rtm.us-w1.imkit.dev",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CnNorth => write!(f, "cn-n1"),
            Self::CnEast => write!(f, "cn-e1"),
            Self::UsWest => write!(f, "us-w1"),
        }
    }
}

/// Configuration for a `Realtime` instance.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Application identifier, sent with every session open.
    pub app_id: String,
    /// Region used when `server` is not set.
    pub region: Region,
    /// Explicit server URL (http/https/ws/wss).
    pub server: Option<String>,
    /// Use TLS for the derived endpoint (default: true).
    pub ssl: bool,
    /// Ask the server not to send binary payloads.
    pub no_binary: bool,
    /// Ask the server to push offline messages on session open.
    pub push_offline_messages: bool,
    /// Heartbeat interval (default: 180s).
    pub heartbeat_interval: Duration,
    /// Timeout for request/response calls (default: 10s).
    pub request_timeout: Duration,
    /// How long `send` waits for the server acknowledgement (default: 10s).
    pub send_timeout: Duration,
    /// How long `close` waits for in-flight sends to be acknowledged (default: 2s).
    pub close_drain_timeout: Duration,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
}

impl RealtimeConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            region: Region::default(),
            server: None,
            ssl: true,
            no_binary: false,
            push_offline_messages: false,
            heartbeat_interval: Duration::from_secs(180),
            request_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            close_drain_timeout: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn no_binary(mut self, no_binary: bool) -> Self {
        self.no_binary = no_binary;
        self
    }

    pub fn push_offline_messages(mut self, enabled: bool) -> Self {
        self.push_offline_messages = enabled;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn close_drain_timeout(mut self, timeout: Duration) -> Self {
        self.close_drain_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Check the configuration without touching the network.
    pub fn validate(&self) -> ImResult<()> {
        if self.app_id.trim().is_empty() {
            return Err(ImError::config("app_id must not be empty"));
        }
        if self.request_timeout.is_zero() || self.send_timeout.is_zero() {
            return Err(ImError::config("timeouts must be non-zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ImError::config("heartbeat interval must be non-zero"));
        }
        self.endpoint().map(|_| ())
    }

    /// The WebSocket URL to connect to.
    pub fn endpoint(&self) -> ImResult<String> {
        let base = match &self.server {
            Some(server) => server.clone(),
            None => {
                let scheme = if self.ssl { "wss" } else { "ws" };
                let prefix: String = self.app_id.chars().take(8).collect();
                format!(
                    "{}://{}.{}",
                    scheme,
                    prefix.to_lowercase(),
                    self.region.host_suffix()
                )
            }
        };
        build_ws_url(&base, &self.app_id)
    }
}

/// Reconnection backoff configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff intervals to try in order.
    pub intervals: Vec<Duration>,
    /// Fallback interval once all intervals are exhausted.
    pub fallback: Duration,
    /// Attempts before pending calls are failed (0 disables reconnection).
    pub max_attempts: u32,
}

impl ReconnectConfig {
    /// Delay before the given 0-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.intervals
            .get(attempt as usize)
            .copied()
            .unwrap_or(self.fallback)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            fallback: Duration::from_secs(10),
            max_attempts: 10,
        }
    }
}

/// Convert a server URL into the WebSocket endpoint for an application.
pub fn build_ws_url(base_url: &str, app_id: &str) -> ImResult<String> {
    let mut parsed = url::Url::parse(base_url)?;

    let ws_scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ImError::config(format!("Unsupported URL scheme: {}", other)));
        }
    };
    parsed
        .set_scheme(ws_scheme)
        .map_err(|_| ImError::config("Failed to set WS scheme"))?;

    parsed
        .query_pairs_mut()
        .append_pair("appId", app_id)
        .append_pair("vsn", "1");

    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ws_url_http() {
        let url = build_ws_url("http://localhost:8080", "app").unwrap();
        assert_eq!(url, "ws://localhost:8080/?appId=app&vsn=1");
    }

    #[test]
    fn test_build_ws_url_https() {
        let url = build_ws_url("https://im.example.com/ws", "app").unwrap();
        assert_eq!(url, "wss://im.example.com/ws?appId=app&vsn=1");
    }

    #[test]
    fn test_build_ws_url_invalid_scheme() {
        assert!(build_ws_url("ftp://localhost", "app").is_err());
    }

    #[test]
    fn test_derived_endpoint_uses_region() {
        let config = RealtimeConfig::new("AbCdEfGhIjK").region(Region::UsWest);
        let url = config.endpoint().unwrap();
        assert!(url.starts_with("wss://abcdefgh.rtm.us-w1.imkit.dev"));
        assert!(url.contains("appId=AbCdEfGhIjK"));
    }

    #[test]
    fn test_validate_rejects_empty_app_id() {
        assert!(RealtimeConfig::new("  ").validate().is_err());
        assert!(RealtimeConfig::new("app").validate().is_ok());
    }

    #[test]
    fn test_reconnect_delays() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.delay_for(0), Duration::from_secs(1));
        assert_eq!(reconnect.delay_for(3), Duration::from_secs(10));
        assert_eq!(reconnect.delay_for(42), reconnect.fallback);
    }
}
