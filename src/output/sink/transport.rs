use super::common::{hex_opt, opt};
use crate::model::ScanSession;

pub const FILE_NAME: &str = "quic_shared_config.csv";

pub const HEADER: [&str; 21] = [
    "targetid",
    "address",
    "port",
    "hostname",
    "original_dst_conn_id",
    "max_idle_timeout",
    "stateless_reset_token",
    "max_udp_payload_size",
    "initial_max_data",
    "initial_max_stream_data_bidi_local",
    "initial_max_stream_data_bidi_remote",
    "initial_max_stream_data_uni",
    "initial_max_streams_bidi",
    "initial_max_streams_uni",
    "ack_delay_exponent",
    "max_ack_delay",
    "disable_active_migration",
    "preferred_address",
    "active_conn_id_limit",
    "initial_src_conn_id",
    "retry_src_conn_id",
];

pub type Row = [String; 21];

pub(super) fn row(session: &ScanSession) -> Row {
    let target = &session.target;
    let params = session
        .negotiated
        .as_ref()
        .map(|n| n.transport.clone())
        .unwrap_or_default();
    [
        target.id.to_string(),
        target.address.clone(),
        target.port.to_string(),
        target.hostname.clone(),
        hex_opt(params.original_dst_conn_id.as_deref()),
        opt(params.max_idle_timeout_ms),
        hex_opt(params.stateless_reset_token.as_deref()),
        opt(params.max_udp_payload_size),
        opt(params.initial_max_data),
        opt(params.initial_max_stream_data_bidi_local),
        opt(params.initial_max_stream_data_bidi_remote),
        opt(params.initial_max_stream_data_uni),
        opt(params.initial_max_streams_bidi),
        opt(params.initial_max_streams_uni),
        opt(params.ack_delay_exponent),
        opt(params.max_ack_delay_ms),
        opt(params.disable_active_migration),
        params.preferred_address.unwrap_or_default(),
        opt(params.active_conn_id_limit),
        hex_opt(params.initial_src_conn_id.as_deref()),
        hex_opt(params.retry_src_conn_id.as_deref()),
    ]
}
