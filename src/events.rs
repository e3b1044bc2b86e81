//! Asynchronous events from Tor.
//!
//! Tor reports events with `6xy` replies once they have been requested with
//! `SETEVENTS`. A single-line event carries its name and an initial line; a
//! multi-line event adds one `KEY=VALUE` field per continuation line. Both
//! shapes are delivered to observers as a [`TorEvent`].

use crate::error::TorControlError;
use crate::protocol::parse_kv_pairs;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str::FromStr;

macro_rules! event_types {
    ($( $(#[$doc:meta])* $variant:ident => $name:literal, )*) => {
        /// Event types that can be subscribed to with SETEVENTS.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EventType {
            $( $(#[$doc])* $variant, )*
        }

        impl EventType {
            /// Every known event type, in declaration order.
            pub const ALL: &'static [EventType] = &[ $( EventType::$variant, )* ];

            /// Get the event name as it appears on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( EventType::$variant => $name, )*
                }
            }

            /// Look up an event by its exact wire name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( $name => Some(EventType::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

event_types! {
    /// Circuit status changed.
    Circ => "CIRC",
    /// Stream status changed.
    Stream => "STREAM",
    /// OR connection status changed.
    OrConn => "ORCONN",
    /// Bandwidth used in the last second.
    Bw => "BW",
    /// Debug log message.
    Debug => "DEBUG",
    /// Info log message.
    Info => "INFO",
    /// Notice log message.
    Notice => "NOTICE",
    /// Warning log message.
    Warn => "WARN",
    /// Error log message.
    Error => "ERR",
    /// New descriptors available.
    NewDesc => "NEWDESC",
    /// New address mapping.
    AddrMap => "ADDRMAP",
    /// Descriptors uploaded to us (directory authority).
    AuthDirNewDescs => "AUTHDIR_NEWDESCS",
    /// Our descriptor changed.
    DescChanged => "DESCCHANGED",
    /// General status event.
    StatusGeneral => "STATUS_GENERAL",
    /// Client status event.
    StatusClient => "STATUS_CLIENT",
    /// Server status event.
    StatusServer => "STATUS_SERVER",
    /// Guard node set changed.
    Guard => "GUARD",
    /// Network status changed.
    Ns => "NS",
    /// Stream bandwidth.
    StreamBw => "STREAM_BW",
    /// Clients seen (bridge only).
    ClientsSeen => "CLIENTS_SEEN",
    /// New consensus arrived.
    NewConsensus => "NEWCONSENSUS",
    /// Build timeout set.
    BuildTimeoutSet => "BUILDTIMEOUT_SET",
    /// Signal received.
    Signal => "SIGNAL",
    /// Configuration changed.
    ConfChanged => "CONF_CHANGED",
    /// Minor circuit status change.
    CircMinor => "CIRC_MINOR",
    /// Pluggable transport launched.
    TransportLaunched => "TRANSPORT_LAUNCHED",
    /// Connection bandwidth.
    ConnBw => "CONN_BW",
    /// Circuit bandwidth.
    CircBw => "CIRC_BW",
    /// Cell stats.
    CellStats => "CELL_STATS",
    /// Token bucket empty.
    TbEmpty => "TB_EMPTY",
    /// Hidden service descriptor event.
    HsDesc => "HS_DESC",
    /// Hidden service descriptor content.
    HsDescContent => "HS_DESC_CONTENT",
    /// Network liveness changed.
    NetworkLiveness => "NETWORK_LIVENESS",
    /// Pluggable transport log.
    PtLog => "PT_LOG",
    /// Pluggable transport status.
    PtStatus => "PT_STATUS",
}

impl FromStr for EventType {
    type Err = TorControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::from_name(&s.to_ascii_uppercase())
            .ok_or_else(|| TorControlError::ParseError(format!("Unknown event type: {}", s)))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event delivered by Tor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorEvent {
    /// Which event this is.
    pub event: EventType,
    /// Text after the event name on the first line.
    pub initial: String,
    /// Fields from continuation lines, with quoting removed.
    pub extra: BTreeMap<String, Vec<u8>>,
}

impl TorEvent {
    /// Create an event without continuation fields.
    pub fn new(event: EventType, initial: impl Into<String>) -> Self {
        Self {
            event,
            initial: initial.into(),
            extra: BTreeMap::new(),
        }
    }

    /// A continuation field as text, replacing invalid UTF-8.
    pub fn field(&self, key: &str) -> Option<Cow<'_, str>> {
        self.extra.get(key).map(|v| String::from_utf8_lossy(v))
    }

    /// View a `STATUS_GENERAL`, `STATUS_CLIENT` or `STATUS_SERVER` event.
    pub fn status(&self) -> Option<StatusEvent> {
        let status_type = match self.event {
            EventType::StatusGeneral => StatusType::General,
            EventType::StatusClient => StatusType::Client,
            EventType::StatusServer => StatusType::Server,
            _ => return None,
        };

        let mut parts = self.initial.splitn(3, ' ');
        let severity = parts.next()?.parse().ok()?;
        let action = parts.next().filter(|a| !a.is_empty())?.to_string();
        let arguments = parse_kv_pairs(parts.next().unwrap_or("").as_bytes())
            .ok()?
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
            .collect();

        Some(StatusEvent {
            status_type,
            severity,
            action,
            arguments,
        })
    }

    /// Bootstrap percentage from a `STATUS_CLIENT BOOTSTRAP` event.
    pub fn bootstrap_progress(&self) -> Option<u8> {
        let status = self.status()?;
        if status.status_type != StatusType::Client || status.action != "BOOTSTRAP" {
            return None;
        }
        status.arguments.get("PROGRESS")?.parse().ok()
    }

    /// View a single-line log event.
    pub fn log(&self) -> Option<LogEvent> {
        let severity = match self.event {
            EventType::Debug => LogSeverity::Debug,
            EventType::Info => LogSeverity::Info,
            EventType::Notice => LogSeverity::Notice,
            EventType::Warn => LogSeverity::Warn,
            EventType::Error => LogSeverity::Error,
            _ => return None,
        };
        Some(LogEvent {
            severity,
            message: self.initial.clone(),
        })
    }

    /// `Some(true)` for `NETWORK_LIVENESS UP`, `Some(false)` for `DOWN`.
    pub fn network_liveness(&self) -> Option<bool> {
        if self.event != EventType::NetworkLiveness {
            return None;
        }
        match self.initial.trim() {
            s if s.eq_ignore_ascii_case("UP") => Some(true),
            s if s.eq_ignore_ascii_case("DOWN") => Some(false),
            _ => None,
        }
    }

    /// View a `BW` event.
    pub fn bandwidth(&self) -> Option<BandwidthEvent> {
        if self.event != EventType::Bw {
            return None;
        }
        let mut parts = self.initial.split_whitespace();
        Some(BandwidthEvent {
            bytes_read: parts.next()?.parse().ok()?,
            bytes_written: parts.next()?.parse().ok()?,
        })
    }
}

/// Bandwidth event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthEvent {
    /// Bytes read in the last second.
    pub bytes_read: u64,
    /// Bytes written in the last second.
    pub bytes_written: u64,
}

/// Log message event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Log severity.
    pub severity: LogSeverity,
    /// Log message.
    pub message: String,
}

/// Log severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    /// Debug level.
    Debug,
    /// Info level.
    Info,
    /// Notice level.
    Notice,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogSeverity {
    /// Get the severity level as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Debug => "DEBUG",
            LogSeverity::Info => "INFO",
            LogSeverity::Notice => "NOTICE",
            LogSeverity::Warn => "WARN",
            LogSeverity::Error => "ERR",
        }
    }
}

/// Status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Status type.
    pub status_type: StatusType,
    /// Severity.
    pub severity: StatusSeverity,
    /// Action, e.g. `BOOTSTRAP` or `CIRCUIT_ESTABLISHED`.
    pub action: String,
    /// Additional arguments.
    pub arguments: BTreeMap<String, String>,
}

/// Status event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    /// General status.
    General,
    /// Client status.
    Client,
    /// Server status.
    Server,
}

/// Status event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSeverity {
    /// Notice level.
    Notice,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl FromStr for StatusSeverity {
    type Err = TorControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOTICE" => Ok(StatusSeverity::Notice),
            "WARN" => Ok(StatusSeverity::Warn),
            "ERR" => Ok(StatusSeverity::Error),
            other => Err(TorControlError::ParseError(format!(
                "Unknown status severity: {}",
                other
            ))),
        }
    }
}
