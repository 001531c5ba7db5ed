use crate::output::SecretLog;

/// Feeds handshake secrets from rustls into the key log artifact.
#[derive(Debug)]
pub struct KeyLogWriter {
    log: SecretLog,
}

impl KeyLogWriter {
    pub fn new(log: SecretLog) -> Self {
        Self { log }
    }
}

impl rustls::KeyLog for KeyLogWriter {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        self.log.record(label, client_random, secret);
    }
}
