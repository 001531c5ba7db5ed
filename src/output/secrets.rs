use anyhow::Context;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Handshake secrets in NSS key log format, shared between the handshake
/// stack (writer) and the result set (flush/close).
#[derive(Debug, Clone)]
pub struct SecretLog {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl SecretLog {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("cannot create key log {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    pub fn record(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut writer = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = writeln!(
            writer,
            "{label} {} {}",
            hex::encode(client_random),
            hex::encode(secret)
        ) {
            tracing::warn!(error = %err, "failed to write key log line");
        }
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}
