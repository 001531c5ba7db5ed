use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone)]
pub struct Config {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub bucket_size: u64,
    pub bucket_refill: Duration,
    pub max_in_flight: usize,
    pub quic_version: Option<u32>,
    pub http3: bool,
    pub keylog: bool,
    pub events: bool,
    pub handshake_timeout: Duration,
    pub http_timeout: Duration,
    pub progress_interval: Duration,
    pub verify_at: VerifyAt,
}

/// Instant used when checking a peer chain against the trust store.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyAt {
    Start,
    #[default]
    Handshake,
}

/// One row of the input table. Identity is assigned in input order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub id: u64,
    pub address: String,
    pub port: u16,
    pub hostname: String,
    pub scid: Option<Vec<u8>>,
    pub dcid: Option<Vec<u8>>,
}

impl TargetDescriptor {
    /// Name used for SNI and the request authority.
    pub fn server_name(&self) -> &str {
        if self.hostname.is_empty() {
            self.address
                .trim_start_matches('[')
                .trim_end_matches(']')
        } else {
            &self.hostname
        }
    }

    pub fn authority(&self) -> &str {
        if self.hostname.is_empty() {
            &self.address
        } else {
            &self.hostname
        }
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.address, self.port, self.hostname)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Dialing,
    Established,
    Failed,
    Probing,
    Closed,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Dialing)
                | (Dialing, Established)
                | (Dialing, Failed)
                | (Established, Probing)
                | (Established, Closed)
                | (Probing, Closed)
                | (Failed, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Created => "created",
            SessionState::Dialing => "dialing",
            SessionState::Established => "established",
            SessionState::Failed => "failed",
            SessionState::Probing => "probing",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub state: SessionState,
    pub elapsed_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-target probe record. Owned by one probe task until handed to the
/// result pipeline.
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub target: TargetDescriptor,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub handshake_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub error: Option<String>,
    pub negotiated: Option<Negotiated>,
    pub http: Option<HttpResponse>,
    pub rtt: Option<Duration>,
    pub events: Vec<SessionEvent>,
}

impl ScanSession {
    pub fn new(target: TargetDescriptor) -> Self {
        let now = Utc::now();
        Self {
            target,
            state: SessionState::Created,
            started_at: now,
            handshake_at: now,
            closed_at: now,
            error: None,
            negotiated: None,
            http: None,
            rtt: None,
            events: vec![SessionEvent {
                state: SessionState::Created,
                elapsed_ms: 0,
                detail: None,
            }],
        }
    }

    pub fn is_established(&self) -> bool {
        self.error.is_none() && self.negotiated.is_some()
    }

    /// Moves the lifecycle forward and records the transition. Returns false
    /// and leaves the state untouched when the transition is not allowed.
    pub fn advance(&mut self, next: SessionState, detail: Option<String>) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                target_id = self.target.id,
                from = %self.state,
                to = %next,
                "ignoring invalid session transition"
            );
            return false;
        }
        self.state = next;
        self.events.push(SessionEvent {
            state: next,
            elapsed_ms: (Utc::now() - self.started_at).num_milliseconds(),
            detail,
        });
        true
    }

    pub fn handshake_duration_ms(&self) -> i64 {
        (self.handshake_at - self.started_at).num_milliseconds()
    }

    pub fn connection_duration_ms(&self) -> i64 {
        (self.closed_at - self.started_at).num_milliseconds()
    }

    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        self.negotiated
            .as_ref()
            .map(|n| n.tls.peer_certificates.as_slice())
            .unwrap_or_default()
    }
}

/// Parameters learned during a successful handshake. Fields the transport
/// stack could not observe stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Negotiated {
    pub version: Option<u32>,
    pub retry: Option<bool>,
    pub transport: TransportParameters,
    pub tls: TlsState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportParameters {
    pub original_dst_conn_id: Option<Vec<u8>>,
    pub max_idle_timeout_ms: Option<u64>,
    pub stateless_reset_token: Option<Vec<u8>>,
    pub max_udp_payload_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub ack_delay_exponent: Option<u64>,
    pub max_ack_delay_ms: Option<u64>,
    pub disable_active_migration: Option<bool>,
    pub preferred_address: Option<String>,
    pub active_conn_id_limit: Option<u64>,
    pub initial_src_conn_id: Option<Vec<u8>>,
    pub retry_src_conn_id: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsState {
    pub protocol_version: Option<u16>,
    pub cipher_suite: Option<u16>,
    pub key_share_group: Option<u16>,
    pub alpn: Option<String>,
    pub server_hello_extensions: Option<Vec<TlsExtension>>,
    pub encrypted_extensions: Option<Vec<TlsExtension>>,
    pub cert_request_extensions: Option<Vec<TlsExtension>>,
    pub hello_retry_extensions: Option<Vec<TlsExtension>>,
    pub certificate_extensions: Option<Vec<TlsExtension>>,
    /// DER certificates in the order the peer sent them.
    pub peer_certificates: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsExtension {
    pub ty: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u32,
    /// Header fields in received order, duplicates kept.
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Values grouped per header name, names in first-seen order.
    pub fn grouped(&self) -> Vec<(&str, Vec<&str>)> {
        let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();
        for (name, value) in &self.headers {
            match groups.iter_mut().find(|(n, _)| *n == name.as_str()) {
                Some((_, values)) => values.push(value.as_str()),
                None => groups.push((name.as_str(), vec![value.as_str()])),
            }
        }
        groups
    }
}
