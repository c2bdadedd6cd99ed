//! Minimal STOMP 1.1 framing as spoken by the NIS websocket endpoint.
//!
//! Only the commands the listener needs are produced (`CONNECT`, `SUBSCRIBE`,
//! `UNSUBSCRIBE`, `DISCONNECT`); inbound `CONNECTED`, `MESSAGE`, `RECEIPT`
//! and `ERROR` frames are understood. The numeric `receipt` header doubles as
//! the request identifier of a subscription request.

use crate::error::ConnectionError;
use crate::events::{ChannelKind, EventFrame, SubscriptionKey};
use crate::model::Address;
use crate::transport::{InboundFrame, OutboundFrame};

const NULL: char = '\0';
const UNCONFIRMED_PREFIX: &str = "/unconfirmed/";
const CONFIRMED_PREFIX: &str = "/transactions/";

/// A raw STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`; repeated headers keep the first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = escapes_headers(&self.command);
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NULL);
        out
    }

    /// Decodes one frame. Returns `Ok(None)` for a heart-beat (bare end-of-line).
    pub fn decode(raw: &str) -> Result<Option<Self>, ConnectionError> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        if raw.is_empty() {
            return Ok(None);
        }

        let (head, body) = match raw.find("\n\n") {
            Some(split) => (&raw[..split], &raw[split + 2..]),
            None => match raw.find("\r\n\r\n") {
                Some(split) => (&raw[..split], &raw[split + 4..]),
                None => (raw.trim_end_matches(NULL), ""),
            },
        };

        let mut lines = head.lines().map(|line| line.trim_end_matches('\r'));
        let command = lines
            .next()
            .filter(|command| !command.is_empty())
            .ok_or_else(|| ConnectionError::Protocol("frame without a command".to_string()))?;
        let escape = escapes_headers(command);

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ConnectionError::Protocol(format!("malformed header line '{}'", line))
            })?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let body = match body.find(NULL) {
            Some(end) => &body[..end],
            None => body,
        };

        Ok(Some(Self {
            command: command.to_string(),
            headers,
            body: body.to_string(),
        }))
    }
}

/// CONNECT and CONNECTED frames never escape their headers.
fn escapes_headers(command: &str) -> bool {
    command != "CONNECT" && command != "CONNECTED"
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, ConnectionError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('r') => out.push('\r'),
            other => {
                return Err(ConnectionError::Protocol(format!(
                    "invalid header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// The node-side destination of a subscription.
pub fn destination(key: &SubscriptionKey) -> String {
    let prefix = match key.channel {
        ChannelKind::Unconfirmed => UNCONFIRMED_PREFIX,
        ChannelKind::Confirmed => CONFIRMED_PREFIX,
    };
    format!("{}{}", prefix, key.address)
}

/// Maps a destination back to its subscription key.
pub fn parse_destination(destination: &str) -> Option<SubscriptionKey> {
    let (channel, address) = if let Some(rest) = destination.strip_prefix(UNCONFIRMED_PREFIX) {
        (ChannelKind::Unconfirmed, rest)
    } else if let Some(rest) = destination.strip_prefix(CONFIRMED_PREFIX) {
        (ChannelKind::Confirmed, rest)
    } else {
        return None;
    };
    Address::new(address)
        .ok()
        .map(|address| SubscriptionKey::new(address, channel))
}

/// Stable STOMP subscription id, so an UNSUBSCRIBE can name what it cancels.
pub fn subscription_id(key: &SubscriptionKey) -> String {
    format!("sub-{}-{}", key.channel, key.address)
}

pub fn connect_frame(host: &str) -> StompFrame {
    StompFrame::new("CONNECT")
        .with_header("accept-version", "1.1,1.0")
        .with_header("host", host)
        .with_header("heart-beat", "0,0")
}

pub fn disconnect_frame() -> StompFrame {
    StompFrame::new("DISCONNECT")
}

pub fn encode_outbound(frame: &OutboundFrame) -> StompFrame {
    match frame {
        OutboundFrame::Subscribe { request_id, key } => StompFrame::new("SUBSCRIBE")
            .with_header("id", subscription_id(key))
            .with_header("destination", destination(key))
            .with_header("receipt", request_id.to_string()),
        OutboundFrame::Unsubscribe { request_id, key } => StompFrame::new("UNSUBSCRIBE")
            .with_header("id", subscription_id(key))
            .with_header("receipt", request_id.to_string()),
    }
}

/// Translates a decoded STOMP frame into an [`InboundFrame`].
///
/// `CONNECTED` and unknown commands yield `Ok(None)`. A `MESSAGE` whose body
/// cannot be decoded is skipped with a warning rather than failing the
/// connection.
pub fn decode_inbound(frame: StompFrame) -> Result<Option<InboundFrame>, ConnectionError> {
    match frame.command.as_str() {
        "RECEIPT" => {
            let request_id = frame
                .header("receipt-id")
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| {
                    ConnectionError::Protocol("RECEIPT without a numeric receipt-id".to_string())
                })?;
            Ok(Some(InboundFrame::Ack { request_id }))
        }
        "ERROR" => {
            let request_id = frame.header("receipt-id").and_then(|id| id.parse().ok());
            let reason = frame
                .header("message")
                .map(str::to_string)
                .unwrap_or_else(|| frame.body.clone());
            Ok(Some(InboundFrame::Rejected { request_id, reason }))
        }
        "MESSAGE" => {
            let Some(key) = frame.header("destination").and_then(parse_destination) else {
                tracing::warn!("MESSAGE frame with an unknown destination: {:?}", frame.header("destination"));
                return Ok(None);
            };
            match EventFrame::parse(key, &frame.body) {
                Ok(event) => Ok(Some(InboundFrame::Event(event))),
                Err(e) => {
                    tracing::warn!("Skipping undecodable transaction frame: {}", e);
                    Ok(None)
                }
            }
        }
        "CONNECTED" => Ok(None),
        other => {
            tracing::debug!("Ignoring STOMP command {}", other);
            Ok(None)
        }
    }
}
