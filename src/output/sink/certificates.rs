use super::common::pem;
use crate::output::CertificateEntry;

pub const FILE_NAME: &str = "tls_certificates.csv";

pub const HEADER: [&str; 3] = ["id", "hash", "cert"];

pub type Row = [String; 3];

pub(super) fn row(entry: &CertificateEntry, der: &[u8]) -> Row {
    [entry.id.to_string(), hex::encode(entry.digest), pem(der)]
}
