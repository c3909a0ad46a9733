//! Wire Protocol
//!
//! Every datagram is a UTF-8 string of the form `TYPE` or `TYPE:ARG`, split
//! on the first colon. Anything that does not decode is dropped by the
//! receiver without an error.

use std::fmt;

use chrono::{DateTime, Local, TimeZone};

use crate::state::PeerAddress;

/// `DDMMYYYY:HH:MM:SS`
pub const TIMESTAMP_FORMAT: &str = "%d%m%Y:%H:%M:%S";

/// Largest datagram we expect to receive
pub const MAX_DATAGRAM: usize = 1024;

/// Protocol messages exchanged between clients, proxy and peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // ========== Time service ==========
    /// Ask for the current time
    TimeRequest,

    /// Current time of the answering node
    Time { timestamp: String },

    // ========== Health ==========
    /// Liveness probe sent to the believed coordinator
    HealthCheck,

    /// Reply to a liveness probe
    HealthResponse,

    // ========== Election ==========
    /// Sent by a candidate to every higher-ranked peer
    Election { candidate: PeerAddress },

    /// A higher-ranked peer is alive and takes over the election
    Ok,

    /// Sent by a new coordinator to every other peer
    Coordinator { address: PeerAddress },

    /// Sent by a new coordinator to the proxy
    CoordinatorAnnounce { address: PeerAddress },
}

impl Message {
    /// Decode a raw datagram. Returns `None` for anything unrecognized.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok().and_then(Self::parse)
    }

    /// Parse a message from its text form
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let (kind, arg) = match raw.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (raw, None),
        };

        match kind {
            "TIME_REQUEST" => Some(Message::TimeRequest),
            "TIME" => arg
                .filter(|a| !a.is_empty())
                .map(|a| Message::Time { timestamp: a.to_string() }),
            "HEALTH_CHECK" => Some(Message::HealthCheck),
            "HEALTH_RESPONSE" => Some(Message::HealthResponse),
            "ELECTION" => arg?
                .parse()
                .ok()
                .map(|candidate| Message::Election { candidate }),
            "OK" => Some(Message::Ok),
            "COORDINATOR" => arg?
                .parse()
                .ok()
                .map(|address| Message::Coordinator { address }),
            "COORDINATOR_ANNOUNCE" => arg?
                .parse()
                .ok()
                .map(|address| Message::CoordinatorAnnounce { address }),
            _ => None,
        }
    }

    /// Encode to the text form sent on the wire
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// A `TIME` reply carrying the local clock
    pub fn time_now() -> Self {
        Message::Time {
            timestamp: format_timestamp(&Local::now()),
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::TimeRequest => "TIME_REQUEST",
            Message::Time { .. } => "TIME",
            Message::HealthCheck => "HEALTH_CHECK",
            Message::HealthResponse => "HEALTH_RESPONSE",
            Message::Election { .. } => "ELECTION",
            Message::Ok => "OK",
            Message::Coordinator { .. } => "COORDINATOR",
            Message::CoordinatorAnnounce { .. } => "COORDINATOR_ANNOUNCE",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Time { timestamp } => write!(f, "TIME:{}", timestamp),
            Message::Election { candidate } => write!(f, "ELECTION:{}", candidate),
            Message::Coordinator { address } => write!(f, "COORDINATOR:{}", address),
            Message::CoordinatorAnnounce { address } => {
                write!(f, "COORDINATOR_ANNOUNCE:{}", address)
            }
            other => f.write_str(other.type_name()),
        }
    }
}

/// Format a timestamp as `DDMMYYYY:HH:MM:SS`
pub fn format_timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    time.format(TIMESTAMP_FORMAT).to_string()
}
