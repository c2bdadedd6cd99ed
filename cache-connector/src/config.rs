use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default STOMP-over-websocket port of a NIS node.
pub const DEFAULT_WS_PORT: u16 = 7778;
/// Path of the node's raw websocket endpoint.
pub const WS_PATH: &str = "/w/messages/websocket";

/// The top-level configuration for the `cache-connector` library.
///
/// Aggregates the node endpoints, reconnection policy, correlation windows
/// and channel capacities. It is typically deserialized from a configuration
/// file and passed to the `ListenerManager` upon initialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectorConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
}

/// Candidate nodes, tried in order until one accepts the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NodeConfig {
    pub endpoints: Vec<Endpoint>,
}

/// Websocket scheme of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ws,
    Wss,
}

/// Network location of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Endpoint {
    pub domain: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
}

impl Endpoint {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            port: None,
            protocol: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Parses `host` or `host:port`.
    pub fn parse(raw: &str) -> Self {
        match raw.rsplit_once(':') {
            Some((domain, port)) => match port.parse() {
                Ok(port) => Self::new(domain).with_port(port),
                Err(_) => Self::new(raw),
            },
            None => Self::new(raw),
        }
    }

    /// The full websocket URL of the node's message endpoint.
    pub fn url(&self) -> String {
        let scheme = match self.protocol.unwrap_or_default() {
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        };
        format!(
            "{}://{}:{}{}",
            scheme,
            self.domain,
            self.port.unwrap_or(DEFAULT_WS_PORT),
            WS_PATH
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.domain,
            self.port.unwrap_or(DEFAULT_WS_PORT)
        )
    }
}

/// Exponential backoff applied after an unexpected disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
    /// Attempts (each one a full pass over the endpoints) before the session is declared lost.
    pub max_retries: u32,
    /// Random spread applied to each delay, as a fraction (0.2 means ±20%).
    pub jitter: f64,
}

/// Lifetimes of the correlator's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CorrelationConfig {
    /// How long an unconfirmed transaction waits for its confirmation.
    pub pending_ttl_secs: u64,
    /// How long an emitted identity suppresses duplicate confirmations.
    pub emitted_ttl_secs: u64,
    /// Interval of the eviction sweep.
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SubscriptionConfig {
    /// How long `subscribe` waits for the node's acknowledgement.
    pub ack_timeout_ms: u64,
}

/// Defines capacities for the MPSC channels within the connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChannelConfig {
    /// Buffer between a session and the correlation pipeline.
    pub session_event_buffer: usize,
    /// Buffer for commands sent to a session.
    pub session_command_buffer: usize,
    /// Capacity of the side error broadcast channel.
    pub error_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![Endpoint::new("127.0.0.1")],
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_retries: 8,
            jitter: 0.2,
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 2 * 60 * 60,
            emitted_ttl_secs: 10 * 60,
            sweep_interval_ms: 5_000,
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 30_000,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            session_event_buffer: 256,
            session_command_buffer: 128,
            error_buffer: 64,
        }
    }
}

impl CorrelationConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn emitted_ttl(&self) -> Duration {
        Duration::from_secs(self.emitted_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl SubscriptionConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_uses_defaults() {
        let endpoint = Endpoint::new("50.3.87.123");
        assert_eq!(endpoint.url(), "ws://50.3.87.123:7778/w/messages/websocket");

        let secure = Endpoint {
            protocol: Some(Protocol::Wss),
            ..Endpoint::new("node.example").with_port(443)
        };
        assert_eq!(secure.url(), "wss://node.example:443/w/messages/websocket");
    }

    #[test]
    fn endpoint_parse_accepts_optional_port() {
        assert_eq!(Endpoint::parse("10.0.0.1:7779"), Endpoint::new("10.0.0.1").with_port(7779));
        assert_eq!(Endpoint::parse("node.example"), Endpoint::new("node.example"));
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: ConnectorConfig = serde_json::from_str(
            r#"{ "node": { "endpoints": [ { "domain": "50.3.87.123" } ] },
                 "reconnect": { "base-delay-ms": 10, "max-delay-ms": 100, "max-retries": 2, "jitter": 0.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.node.endpoints[0].domain, "50.3.87.123");
        assert_eq!(config.reconnect.max_retries, 2);
        assert_eq!(config.correlation.pending_ttl_secs, 7200);
        assert_eq!(config.channels.session_event_buffer, 256);
    }
}
