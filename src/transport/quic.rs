use super::capture::{self, CapturingConfig, HandshakeCapture};
use super::keylog::KeyLogWriter;
use super::{BiStream, DialRequest, Dialer, Session};
use crate::model::{Negotiated, TlsState};
use crate::output::SecretLog;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use quinn::crypto::rustls::{HandshakeData, QuicClientConfig};
use quinn::{ClientConfig, Endpoint, EndpointConfig, TokioRuntime, TransportConfig, VarInt};
use quinn_proto::{ConnectionId, ConnectionIdGenerator, IdleTimeout};
use rand::RngCore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::debug;

pub const ALPN: [&[u8]; 2] = [b"h3", b"h3-29"];
const DEFAULT_VERSION: u32 = 0x0000_0001;
const TLS13: u16 = 0x0304;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Dials QUIC over a fresh UDP endpoint per attempt, so per-target
/// connection ids never leak into other sessions.
pub struct QuicDialer {
    crypto: Arc<QuicClientConfig>,
    version: Option<u32>,
}

impl QuicDialer {
    pub fn new(version: Option<u32>, key_log: Option<SecretLog>) -> anyhow::Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("crypto provider lacks TLS 1.3")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth();
        tls.alpn_protocols = ALPN.iter().map(|p| p.to_vec()).collect();
        if let Some(log) = key_log {
            tls.key_log = Arc::new(KeyLogWriter::new(log));
        }

        let crypto = QuicClientConfig::try_from(tls)
            .map_err(|err| anyhow!("cannot build QUIC crypto config: {err}"))?;
        Ok(Self {
            crypto: Arc::new(crypto),
            version,
        })
    }

    fn client_config(
        &self,
        request: &DialRequest,
        capture: Arc<Mutex<HandshakeCapture>>,
    ) -> anyhow::Result<ClientConfig> {
        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(IdleTimeout::try_from(request.handshake_timeout)?));

        let crypto = CapturingConfig::new(self.crypto.clone(), capture);
        let mut config = ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::new(transport));
        if let Some(version) = self.version {
            config.version(version);
        }
        if let Some(dcid) = request.dcid.clone() {
            config.initial_dst_cid_provider(Arc::new(move || ConnectionId::new(&dcid)));
        }
        Ok(config)
    }

    fn endpoint(&self, local: SocketAddr, scid: Option<&[u8]>) -> anyhow::Result<Endpoint> {
        let mut config = EndpointConfig::default();
        if let Some(version) = self.version {
            config.supported_versions(vec![version]);
        }
        if let Some(scid) = scid {
            let scid = scid.to_vec();
            config.cid_generator(move || {
                Box::new(FixedFirstCid::new(scid.clone())) as Box<dyn ConnectionIdGenerator>
            });
        }
        let socket = UdpSocket::bind(local).context("cannot bind UDP socket")?;
        Endpoint::new(config, None, socket, Arc::new(TokioRuntime))
            .context("cannot create QUIC endpoint")
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    async fn dial(&self, request: &DialRequest) -> anyhow::Result<Box<dyn Session>> {
        let remote = lookup_host(format!("{}:{}", request.address, request.port))
            .await
            .with_context(|| format!("cannot resolve {}", request.address))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}", request.address))?;
        let local: SocketAddr = if remote.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };

        let observed = Arc::new(Mutex::new(HandshakeCapture::default()));
        let endpoint = self.endpoint(local, request.scid.as_deref())?;
        let config = self.client_config(request, observed.clone())?;
        let connecting = endpoint.connect_with(config, remote, &request.server_name)?;
        let connection = match timeout(request.handshake_timeout, connecting).await {
            Ok(result) => result?,
            Err(_) => {
                endpoint.close(VarInt::from_u32(0), b"");
                anyhow::bail!("handshake timeout");
            }
        };

        let alpn = connection
            .handshake_data()
            .and_then(|data| data.downcast::<HandshakeData>().ok())
            .and_then(|data| data.protocol)
            .map(|proto| String::from_utf8_lossy(&proto).into_owned());
        let peer_certificates = connection
            .peer_identity()
            .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
            .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
            .unwrap_or_default();
        debug!(target_id = request.target_id, %remote, ?alpn, "handshake complete");

        let seen = capture::lock(&observed).clone();
        let negotiated = Negotiated {
            version: seen.version.or(self.version).or(Some(DEFAULT_VERSION)),
            retry: Some(seen.retry),
            transport: seen.transport.unwrap_or_default(),
            tls: TlsState {
                protocol_version: seen.protocol_version.or(Some(TLS13)),
                cipher_suite: seen.cipher_suite,
                key_share_group: seen.key_share_group,
                alpn,
                server_hello_extensions: seen.server_hello_extensions,
                encrypted_extensions: seen.encrypted_extensions,
                cert_request_extensions: seen.cert_request_extensions,
                hello_retry_extensions: seen.hello_retry_extensions,
                certificate_extensions: seen.certificate_extensions,
                peer_certificates,
            },
        };

        Ok(Box::new(QuicSession {
            endpoint,
            connection,
            negotiated,
        }))
    }
}

struct QuicSession {
    endpoint: Endpoint,
    connection: quinn::Connection,
    negotiated: Negotiated,
}

#[async_trait]
impl Session for QuicSession {
    fn negotiated(&self) -> Negotiated {
        self.negotiated.clone()
    }

    fn rtt(&self) -> Option<Duration> {
        Some(self.connection.rtt())
    }

    async fn open_bi(&self) -> anyhow::Result<BiStream> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .context("cannot open bidirectional stream")?;
        Ok(BiStream {
            send: Box::new(send),
            recv: Box::new(recv),
        })
    }

    async fn close(&self, code: u32, reason: &str) {
        self.connection
            .close(VarInt::from_u32(code), reason.as_bytes());
        // let the CONNECTION_CLOSE leave before the socket goes away
        let _ = timeout(CLOSE_GRACE, self.endpoint.wait_idle()).await;
    }
}

/// Hands out the configured source connection id first, random ids of the
/// same length afterwards.
struct FixedFirstCid {
    first: Option<Vec<u8>>,
    len: usize,
}

impl FixedFirstCid {
    fn new(scid: Vec<u8>) -> Self {
        Self {
            len: scid.len(),
            first: Some(scid),
        }
    }
}

impl ConnectionIdGenerator for FixedFirstCid {
    fn generate_cid(&mut self) -> ConnectionId {
        match self.first.take() {
            Some(bytes) => ConnectionId::new(&bytes),
            None => {
                let mut bytes = vec![0u8; self.len];
                rand::thread_rng().fill_bytes(&mut bytes);
                ConnectionId::new(&bytes)
            }
        }
    }

    fn cid_len(&self) -> usize {
        self.len
    }

    fn cid_lifetime(&self) -> Option<Duration> {
        None
    }
}

/// Certificates are recorded, not judged, during the handshake. Chain
/// validity is computed later by the result pipeline.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cid_is_the_configured_one() {
        let scid = vec![1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut generator = FixedFirstCid::new(scid.clone());
        assert_eq!(generator.cid_len(), 9);
        assert_eq!(&generator.generate_cid()[..], &scid[..]);
        let next = generator.generate_cid();
        assert_eq!(next.len(), 9);
    }

    #[test]
    fn dialer_builds_with_and_without_version_pin() {
        assert!(QuicDialer::new(None, None).is_ok());
        assert!(QuicDialer::new(Some(0xff00_001d), None).is_ok());
    }
}
