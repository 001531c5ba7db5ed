use super::common::opt;
use crate::model::{ScanSession, TlsExtension, VerifyAt};
use base64::Engine;
use chrono::{DateTime, Utc};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;
use std::sync::Arc;
use std::time::Duration;

pub const FILE_NAME: &str = "tls_shared_config.csv";

pub const HEADER: [&str; 15] = [
    "targetid",
    "address",
    "port",
    "hostname",
    "protocol",
    "ciphersuite",
    "keyShareGroup",
    "alpn",
    "serverExtensions",
    "serverEncryptedExtensions",
    "serverCertRequestExtensions",
    "helloRetryRequestExtensions",
    "certificateExtensions",
    "certificateHashes",
    "validCert",
];

pub type Row = [String; 15];

/// Checks peer chains against the Mozilla root set at a chosen instant.
pub struct ChainVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ChainVerifier {
    pub fn new() -> anyhow::Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|err| anyhow::anyhow!("cannot build certificate verifier: {err}"))?;
        Ok(Self { inner })
    }

    /// `chain` is leaf first, as sent by the peer.
    pub fn verify(&self, chain: &[Vec<u8>], name: &str, at: DateTime<Utc>) -> bool {
        let Some((leaf, intermediates)) = chain.split_first() else {
            return false;
        };
        let Ok(server_name) = ServerName::try_from(name) else {
            return false;
        };
        let intermediates: Vec<CertificateDer<'_>> = intermediates
            .iter()
            .map(|der| CertificateDer::from(der.as_slice()))
            .collect();
        let now = UnixTime::since_unix_epoch(Duration::from_secs(at.timestamp().max(0) as u64));
        self.inner
            .verify_server_cert(
                &CertificateDer::from(leaf.as_slice()),
                &intermediates,
                &server_name,
                &[],
                now,
            )
            .is_ok()
    }
}

pub(super) fn row(
    session: &ScanSession,
    digests: &[String],
    verifier: &ChainVerifier,
    verify_at: VerifyAt,
) -> Row {
    let target = &session.target;
    let tls = session
        .negotiated
        .as_ref()
        .map(|n| n.tls.clone())
        .unwrap_or_default();
    let instant = match verify_at {
        VerifyAt::Start => session.started_at,
        VerifyAt::Handshake => session.handshake_at,
    };
    let valid = verifier.verify(&tls.peer_certificates, target.server_name(), instant);
    [
        target.id.to_string(),
        target.address.clone(),
        target.port.to_string(),
        target.hostname.clone(),
        tls.protocol_version
            .map(|v| format!("{v:x}"))
            .unwrap_or_default(),
        tls.cipher_suite.map(|v| format!("{v:x}")).unwrap_or_default(),
        opt(tls.key_share_group),
        tls.alpn.clone().unwrap_or_default(),
        extensions_json(tls.server_hello_extensions.as_deref()),
        extensions_json(tls.encrypted_extensions.as_deref()),
        extensions_json(tls.cert_request_extensions.as_deref()),
        extensions_json(tls.hello_retry_extensions.as_deref()),
        extensions_json(tls.certificate_extensions.as_deref()),
        digests.join(" "),
        valid.to_string(),
    ]
}

/// `[[type, "base64"], ...]`, or empty when the category was not observed.
fn extensions_json(extensions: Option<&[TlsExtension]>) -> String {
    let Some(extensions) = extensions else {
        return String::new();
    };
    let pairs: Vec<serde_json::Value> = extensions
        .iter()
        .map(|ext| {
            serde_json::json!([
                ext.ty,
                base64::engine::general_purpose::STANDARD_NO_PAD.encode(&ext.data)
            ])
        })
        .collect();
    serde_json::Value::Array(pairs).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_serialize_as_type_payload_pairs() {
        let exts = vec![
            TlsExtension {
                ty: 43,
                data: vec![0x03, 0x04],
            },
            TlsExtension {
                ty: 51,
                data: vec![],
            },
        ];
        assert_eq!(extensions_json(Some(exts.as_slice())), r#"[[43,"AwQ"],[51,""]]"#);
        assert_eq!(extensions_json(Some(&[][..])), "[]");
        assert_eq!(extensions_json(None), "");
    }

    #[test]
    fn garbage_chain_is_invalid_not_fatal() {
        let verifier = ChainVerifier::new().unwrap();
        let now = Utc::now();
        assert!(!verifier.verify(&[], "example.com", now));
        assert!(!verifier.verify(&[vec![0x30, 0x03, 0x01, 0x02, 0x03]], "example.com", now));
        assert!(!verifier.verify(&[vec![1, 2, 3]], "not a hostname!", now));
    }
}
