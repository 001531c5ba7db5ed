mod certs;
mod channel;
mod secrets;
pub mod sink;

pub use certs::{CertDigest, CertificateCache, CertificateEntry, StagedCertificates};
pub use channel::OutputChannel;
pub use secrets::SecretLog;
pub use sink::{build_rows, ChainVerifier, ResultRow, ResultSet, SessionRows, SinkOptions, Table};
