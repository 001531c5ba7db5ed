mod certificates;
mod common;
mod connection;
mod http;
mod tls;
mod transport;

pub use tls::ChainVerifier;

use super::{CertDigest, CertificateCache, SecretLog};
use crate::model::{Config, ScanSession, SessionEvent, VerifyAt};
use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const KEY_LOG_FILE: &str = "key.log";
pub const EVENTS_FILE: &str = "session_events.jsonl";

#[derive(Debug, Clone, Copy, Default)]
pub struct SinkOptions {
    pub keylog: bool,
    pub events: bool,
    pub verify_at: VerifyAt,
}

impl From<&Config> for SinkOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            keylog: cfg.keylog,
            events: cfg.events,
            verify_at: cfg.verify_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Connection,
    TransportParameters,
    TlsParameters,
    Certificates,
    HttpHeaders,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Connection,
        Table::TransportParameters,
        Table::TlsParameters,
        Table::Certificates,
        Table::HttpHeaders,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Table::Connection => connection::FILE_NAME,
            Table::TransportParameters => transport::FILE_NAME,
            Table::TlsParameters => tls::FILE_NAME,
            Table::Certificates => certificates::FILE_NAME,
            Table::HttpHeaders => http::FILE_NAME,
        }
    }

    pub fn header(self) -> &'static [&'static str] {
        match self {
            Table::Connection => &connection::HEADER,
            Table::TransportParameters => &transport::HEADER,
            Table::TlsParameters => &tls::HEADER,
            Table::Certificates => &certificates::HEADER,
            Table::HttpHeaders => &http::HEADER,
        }
    }
}

/// A row for one of the five output tables. Row widths are fixed by type so
/// a row can never disagree with its table header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultRow {
    Connection(connection::Row),
    TransportParameters(transport::Row),
    TlsParameters(tls::Row),
    Certificate(certificates::Row),
    HttpHeader(http::Row),
}

impl ResultRow {
    pub fn table(&self) -> Table {
        match self {
            ResultRow::Connection(_) => Table::Connection,
            ResultRow::TransportParameters(_) => Table::TransportParameters,
            ResultRow::TlsParameters(_) => Table::TlsParameters,
            ResultRow::Certificate(_) => Table::Certificates,
            ResultRow::HttpHeader(_) => Table::HttpHeaders,
        }
    }

    pub fn fields(&self) -> &[String] {
        match self {
            ResultRow::Connection(row) => row,
            ResultRow::TransportParameters(row) => row,
            ResultRow::TlsParameters(row) => row,
            ResultRow::Certificate(row) => row,
            ResultRow::HttpHeader(row) => row,
        }
    }
}

/// Rows of one session plus the certificate digests they introduce.
#[derive(Debug, Clone, Default)]
pub struct SessionRows {
    pub rows: Vec<ResultRow>,
    /// Commit to the cache once the rows are written.
    pub new_certificates: Vec<CertDigest>,
}

/// Builds every row one session contributes. Certificates unknown to
/// `certs` are emitted and listed in `new_certificates`; known ones are only
/// referenced. The cache itself is not modified.
pub fn build_rows(
    session: &ScanSession,
    certs: &CertificateCache,
    verifier: &ChainVerifier,
    verify_at: VerifyAt,
) -> SessionRows {
    let mut rows = vec![ResultRow::Connection(connection::row(session))];
    if !session.is_established() {
        return SessionRows {
            rows,
            new_certificates: Vec::new(),
        };
    }

    rows.push(ResultRow::TransportParameters(transport::row(session)));

    let chain = session.peer_certificates();
    let mut digests = Vec::with_capacity(chain.len());
    let mut fresh = Vec::new();
    let mut staged = certs.stage();
    for der in chain {
        let entry = staged.observe(der);
        digests.push(hex::encode(entry.digest));
        if entry.fresh {
            fresh.push(ResultRow::Certificate(certificates::row(&entry, der)));
        }
    }

    rows.push(ResultRow::TlsParameters(tls::row(
        session, &digests, verifier, verify_at,
    )));
    rows.extend(fresh);
    rows.extend(http::rows(session).into_iter().map(ResultRow::HttpHeader));
    SessionRows {
        rows,
        new_certificates: staged.into_added(),
    }
}

#[derive(Serialize)]
struct SessionDocument<'a> {
    target_id: u64,
    address: &'a str,
    port: u16,
    hostname: &'a str,
    started_at: String,
    established: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rtt_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_status: Option<u32>,
    events: &'a [SessionEvent],
}

struct Tables {
    connection: csv::Writer<File>,
    transport: csv::Writer<File>,
    tls: csv::Writer<File>,
    certificates: csv::Writer<File>,
    http: csv::Writer<File>,
}

impl Tables {
    fn create(dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            connection: open_table(dir, Table::Connection)?,
            transport: open_table(dir, Table::TransportParameters)?,
            tls: open_table(dir, Table::TlsParameters)?,
            certificates: open_table(dir, Table::Certificates)?,
            http: open_table(dir, Table::HttpHeaders)?,
        })
    }

    fn get_mut(&mut self, table: Table) -> &mut csv::Writer<File> {
        match table {
            Table::Connection => &mut self.connection,
            Table::TransportParameters => &mut self.transport,
            Table::TlsParameters => &mut self.tls,
            Table::Certificates => &mut self.certificates,
            Table::HttpHeaders => &mut self.http,
        }
    }
}

fn open_table(dir: &Path, table: Table) -> anyhow::Result<csv::Writer<File>> {
    let path = dir.join(table.file_name());
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    writer
        .write_record(table.header())
        .with_context(|| format!("cannot write header of {}", path.display()))?;
    Ok(writer)
}

/// All result tables plus the auxiliary streams of one output directory.
/// Not shared: callers serialize access, normally through
/// [`super::OutputChannel`].
pub struct ResultSet {
    dir: PathBuf,
    tables: Tables,
    certs: CertificateCache,
    verifier: ChainVerifier,
    verify_at: VerifyAt,
    events: Option<BufWriter<File>>,
    secrets: Option<SecretLog>,
    written: u64,
}

impl ResultSet {
    pub fn create(dir: &Path, options: SinkOptions) -> anyhow::Result<Self> {
        tracing::debug!(dir = %dir.display(), "initializing result files");
        let tables = Tables::create(dir)?;
        let secrets = if options.keylog {
            Some(SecretLog::create(&dir.join(KEY_LOG_FILE))?)
        } else {
            None
        };
        let events = if options.events {
            let path = dir.join(EVENTS_FILE);
            let file = File::create(&path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            Some(BufWriter::new(file))
        } else {
            None
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            tables,
            certs: CertificateCache::new(),
            verifier: ChainVerifier::new()?,
            verify_at: options.verify_at,
            events,
            secrets,
            written: 0,
        })
    }

    pub fn secret_log(&self) -> Option<SecretLog> {
        self.secrets.clone()
    }

    pub fn sessions_written(&self) -> u64 {
        self.written
    }

    /// Emits every row of one session. Rows of different sessions never
    /// interleave because this takes `&mut self`. Certificates count as seen
    /// only after all rows were handed to the writers.
    pub fn write(&mut self, session: &ScanSession) -> anyhow::Result<()> {
        let built = build_rows(session, &self.certs, &self.verifier, self.verify_at);
        self.write_rows(&built.rows)?;
        self.certs.commit(&built.new_certificates);

        if let Some(events) = self.events.as_mut() {
            let target = &session.target;
            let doc = SessionDocument {
                target_id: target.id,
                address: &target.address,
                port: target.port,
                hostname: &target.hostname,
                started_at: session.started_at.to_rfc3339(),
                established: session.is_established(),
                error: session.error.as_deref(),
                rtt_ms: session.rtt.map(|rtt| rtt.as_millis()),
                http_status: session.http.as_ref().map(|r| r.status),
                events: &session.events,
            };
            serde_json::to_writer(&mut *events, &doc)?;
            events.write_all(b"\n")?;
        }

        self.written += 1;
        Ok(())
    }

    fn write_rows(&mut self, rows: &[ResultRow]) -> anyhow::Result<()> {
        for row in rows {
            self.tables
                .get_mut(row.table())
                .write_record(row.fields())
                .with_context(|| format!("cannot write to {}", row.table().file_name()))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        for table in Table::ALL {
            self.tables
                .get_mut(table)
                .flush()
                .with_context(|| format!("cannot flush {}", table.file_name()))?;
        }
        if let Some(events) = self.events.as_mut() {
            events.flush().context("cannot flush session events")?;
        }
        if let Some(secrets) = self.secrets.as_ref() {
            secrets.flush().context("cannot flush key log")?;
        }
        Ok(())
    }

    /// Flushes and closes every stream.
    pub fn close(mut self) -> anyhow::Result<()> {
        self.flush()?;
        tracing::debug!(
            dir = %self.dir.display(),
            sessions = self.written,
            certificates = self.certs.len(),
            "closed result files"
        );
        Ok(())
    }
}
