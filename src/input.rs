use crate::model::{TargetDescriptor, DEFAULT_PORT};
use anyhow::Context;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const MIN_CID_LEN: usize = 8;
const MAX_CID_LEN: usize = 20;

// Fixed column order; the header row's names are not consulted.
const ADDRESS: usize = 0;
const HOSTNAME: usize = 1;
const PORT: usize = 2;
const SCID: usize = 3;
const DCID: usize = 4;

/// Targets from a CSV file whose first row is a header. Columns are read by
/// position: address, hostname, port, scid, dcid; trailing ones may be
/// missing. The file is opened and its header read eagerly so setup errors
/// surface before scanning.
pub struct InputSource<R = File> {
    reader: csv::Reader<R>,
}

impl InputSource<File> {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("cannot open input {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("invalid input {}", path.display()))
    }
}

impl<R: Read + Send + 'static> InputSource<R> {
    pub fn from_reader(inner: R) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(inner);
        reader.headers().context("cannot read header row")?;
        Ok(Self { reader })
    }

    /// Streams descriptors with identities 0, 1, 2, ... in file order.
    pub fn into_stream(self) -> ReceiverStream<TargetDescriptor> {
        let (tx, rx) = mpsc::channel(256);
        tokio::task::spawn_blocking(move || self.pump(tx));
        ReceiverStream::new(rx)
    }

    fn pump(mut self, tx: mpsc::Sender<TargetDescriptor>) {
        let mut next_id = 0u64;
        let mut record = csv::StringRecord::new();
        loop {
            match self.reader.read_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    tracing::error!(error = %err, "failed to read input, stopping");
                    break;
                }
            }
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let Some(target) = parse_record(&record, next_id, line) else {
                continue;
            };
            next_id += 1;
            if tx.blocking_send(target).is_err() {
                // receiver gone: scanning stopped
                break;
            }
        }
        tracing::debug!(targets = next_id, "input exhausted");
    }
}

fn field(record: &csv::StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or_default()
}

fn parse_record(record: &csv::StringRecord, id: u64, line: u64) -> Option<TargetDescriptor> {
    let address = field(record, ADDRESS);
    if address.is_empty() {
        if record.iter().any(|f| !f.is_empty()) {
            tracing::warn!(line, "skipping row without address");
        }
        return None;
    }

    let port_text = field(record, PORT);
    let port = if port_text.is_empty() {
        DEFAULT_PORT
    } else {
        match port_text.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                tracing::warn!(line, port = %port_text, "skipping row with invalid port");
                return None;
            }
        }
    };

    Some(TargetDescriptor {
        id,
        address: bracket_ipv6(address),
        port,
        hostname: field(record, HOSTNAME).to_string(),
        scid: parse_cid(field(record, SCID), "scid", line),
        dcid: parse_cid(field(record, DCID), "dcid", line),
    })
}

fn bracket_ipv6(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]")
    } else {
        address.to_string()
    }
}

/// Connection ids that are not 8 to 20 bytes of valid hex fall back to the
/// stack's defaults.
fn parse_cid(text: &str, column: &'static str, line: u64) -> Option<Vec<u8>> {
    if text.is_empty() {
        return None;
    }
    match hex::decode(text) {
        Ok(bytes) if (MIN_CID_LEN..=MAX_CID_LEN).contains(&bytes.len()) => Some(bytes),
        Ok(bytes) => {
            tracing::warn!(line, column, len = bytes.len(), "connection id length out of range, using default");
            None
        }
        Err(err) => {
            tracing::warn!(line, column, error = %err, "malformed connection id, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(text: &'static str) -> Vec<TargetDescriptor> {
        InputSource::from_reader(text.as_bytes())
            .unwrap()
            .into_stream()
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_rows_in_order_with_defaults() {
        let targets = collect(
            "address,hostname,port,scid,dcid\n\
             93.184.216.34,example.com,443,,\n\
             2001:db8::1,,8443,0102030405060708,\n\
             10.0.0.1\n",
        )
        .await;
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].id, 0);
        assert_eq!(targets[0].hostname, "example.com");
        assert_eq!(targets[1].address, "[2001:db8::1]");
        assert_eq!(targets[1].port, 8443);
        assert_eq!(targets[1].scid, Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(targets[2].port, DEFAULT_PORT);
        assert_eq!(targets[2].hostname, "");
        assert_eq!(targets[2].id, 2);
    }

    #[tokio::test]
    async fn malformed_connection_ids_become_absent() {
        let targets = collect(
            "address,hostname,port,scid,dcid\n\
             10.0.0.1,,443,abc,zz\n\
             10.0.0.2,,443,01020304,\n\
             10.0.0.3,,443,,000102030405060708090a0b0c0d0e0f1011121314\n",
        )
        .await;
        assert_eq!(targets.len(), 3);
        for target in &targets {
            assert_eq!(target.scid, None);
            assert_eq!(target.dcid, None);
        }
    }

    #[tokio::test]
    async fn bad_port_rows_are_skipped_without_consuming_ids() {
        let targets = collect(
            "address,hostname,port\n\
             10.0.0.1,,443\n\
             10.0.0.2,,https\n\
             ,,\n\
             10.0.0.3,,70000\n\
             10.0.0.4,,\n",
        )
        .await;
        let ids: Vec<_> = targets.iter().map(|t| (t.id, t.address.as_str())).collect();
        assert_eq!(ids, vec![(0, "10.0.0.1"), (1, "10.0.0.4")]);
    }

    #[tokio::test]
    async fn columns_are_positional_whatever_the_header_says() {
        let targets = collect(
            "saddr,name,dport,source_cid,dest_cid\n\
             192.0.2.9,example.org,8443,,0102030405060708\n",
        )
        .await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address, "192.0.2.9");
        assert_eq!(targets[0].hostname, "example.org");
        assert_eq!(targets[0].port, 8443);
        assert_eq!(targets[0].dcid, Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[tokio::test]
    async fn empty_input_yields_no_targets() {
        assert!(collect("").await.is_empty());
        assert!(collect("address\n").await.is_empty());
    }

    #[test]
    fn bracketed_addresses_are_left_alone() {
        assert_eq!(bracket_ipv6("[::1]"), "[::1]");
        assert_eq!(bracket_ipv6("::1"), "[::1]");
        assert_eq!(bracket_ipv6("192.0.2.1"), "192.0.2.1");
    }
}
