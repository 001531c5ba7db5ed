use super::common::{hex_opt, opt};
use crate::model::ScanSession;

pub const FILE_NAME: &str = "quic_connection_info.csv";

pub const HEADER: [&str; 15] = [
    "targetid",
    "address",
    "port",
    "hostname",
    "scid",
    "dcid",
    "hasRetry",
    "startTime",
    "handshakeTime",
    "closeTime",
    "handshakeDuration",
    "connectionDuration",
    "quicVersion",
    "established",
    "errorMessage",
];

pub type Row = [String; 15];

pub(super) fn row(session: &ScanSession) -> Row {
    let target = &session.target;
    let negotiated = session.negotiated.as_ref();
    [
        target.id.to_string(),
        target.address.clone(),
        target.port.to_string(),
        target.hostname.clone(),
        hex_opt(target.scid.as_deref()),
        hex_opt(target.dcid.as_deref()),
        opt(negotiated.and_then(|n| n.retry)),
        session.started_at.timestamp().to_string(),
        session.handshake_at.timestamp().to_string(),
        session.closed_at.timestamp().to_string(),
        session.handshake_duration_ms().to_string(),
        session.connection_duration_ms().to_string(),
        negotiated
            .and_then(|n| n.version)
            .map(|v| format!("{v:x}"))
            .unwrap_or_default(),
        session.is_established().to_string(),
        session.error.clone().unwrap_or_default(),
    ]
}
