use super::common::array_literal;
use crate::model::ScanSession;

pub const FILE_NAME: &str = "http_header.csv";

pub const HEADER: [&str; 6] = ["targetid", "address", "port", "hostname", "header", "value"];

pub type Row = [String; 6];

/// One row per header name; repeated headers share a row.
pub(super) fn rows(session: &ScanSession) -> Vec<Row> {
    let Some(response) = session.http.as_ref() else {
        return Vec::new();
    };
    let target = &session.target;
    response
        .grouped()
        .into_iter()
        .map(|(name, values)| {
            [
                target.id.to_string(),
                target.address.clone(),
                target.port.to_string(),
                target.hostname.clone(),
                name.to_string(),
                array_literal(values),
            ]
        })
        .collect()
}
