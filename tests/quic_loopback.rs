use quic_scanner::client::frame;
use quic_scanner::client::qpack::{self, HeaderField};
use quic_scanner::engine::pipeline::{ProbeTemplate, SessionProbe, TargetProcessor};
use quic_scanner::model::{SessionState, TargetDescriptor};
use quic_scanner::transport::{DialRequest, Dialer, QuicDialer, Session};
use quinn::crypto::rustls::QuicServerConfig;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Local HTTP/3-ish server: completes the handshake with a fresh
/// self-signed certificate and answers every bidirectional stream with a
/// single HEADERS frame.
fn spawn_server() -> (SocketAddr, CertificateDer<'static>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key.into())
        .unwrap();
    tls.alpn_protocols = vec![b"h3".to_vec()];
    let crypto = QuicServerConfig::try_from(tls).unwrap();
    let config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();

    tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            tokio::spawn(async move {
                let Ok(conn) = incoming.await else { return };
                while let Ok((mut send, mut recv)) = conn.accept_bi().await {
                    let _ = recv.read_to_end(64 * 1024).await;
                    let block = qpack::encode_field_section(&[
                        HeaderField::new(":status", "204"),
                        HeaderField::new("server", "loopback"),
                    ]);
                    let mut bytes = Vec::new();
                    frame::encode(frame::HEADERS, &block, &mut bytes);
                    let _ = send.write_all(&bytes).await;
                    let _ = send.finish();
                }
            });
        }
    });
    (addr, cert)
}

fn request(addr: SocketAddr, dcid: Option<Vec<u8>>, timeout: Duration) -> DialRequest {
    DialRequest {
        target_id: 0,
        address: addr.ip().to_string(),
        port: addr.port(),
        server_name: "localhost".into(),
        scid: None,
        dcid,
        handshake_timeout: timeout,
    }
}

#[tokio::test]
async fn dial_records_chain_and_handshake_parameters() {
    let (addr, cert) = spawn_server();
    let dcid = vec![0xab; 8];
    let dialer = QuicDialer::new(None, None).unwrap();
    let session = dialer
        .dial(&request(addr, Some(dcid.clone()), Duration::from_secs(5)))
        .await
        .unwrap();

    let negotiated = session.negotiated();
    assert_eq!(negotiated.version, Some(1));
    assert_eq!(negotiated.retry, Some(false));
    assert_eq!(negotiated.tls.alpn.as_deref(), Some("h3"));
    assert_eq!(negotiated.tls.peer_certificates, vec![cert.as_ref().to_vec()]);
    assert_eq!(negotiated.tls.protocol_version, Some(0x0304));
    assert!(matches!(
        negotiated.tls.cipher_suite,
        Some(0x1301..=0x1303)
    ));
    assert!(negotiated.tls.key_share_group.is_some());
    assert!(negotiated
        .tls
        .encrypted_extensions
        .as_ref()
        .unwrap()
        .iter()
        .any(|ext| ext.ty == 0x39));

    let params = &negotiated.transport;
    assert_eq!(params.original_dst_conn_id, Some(dcid));
    assert!(params.initial_src_conn_id.is_some());
    assert!(params.initial_max_streams_bidi.unwrap() > 0);
    assert!(params.max_idle_timeout_ms.is_some());
    assert!(session.rtt().is_some());

    session.close(0, "No error").await;
}

#[tokio::test]
async fn silent_peer_fails_within_handshake_timeout() {
    // bound but never answers
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = silent.local_addr().unwrap();
    let dialer = QuicDialer::new(None, None).unwrap();

    let started = Instant::now();
    let result = dialer
        .dial(&request(addr, None, Duration::from_millis(300)))
        .await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    drop(silent);
}

#[tokio::test]
async fn head_request_reads_status_over_a_real_stream() {
    let (addr, _) = spawn_server();
    let processor = SessionProbe::new(
        Arc::new(QuicDialer::new(None, None).unwrap()),
        ProbeTemplate {
            handshake_timeout: Duration::from_secs(5),
            http3: true,
            http_timeout: Duration::from_secs(5),
        },
    );
    let session = processor
        .process_target(TargetDescriptor {
            id: 7,
            address: addr.ip().to_string(),
            port: addr.port(),
            hostname: "localhost".into(),
            scid: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            dcid: None,
        })
        .await;

    assert!(session.is_established(), "{:?}", session.error);
    assert_eq!(session.state, SessionState::Closed);
    let http = session.http.unwrap();
    assert_eq!(http.status, 204);
    assert_eq!(http.headers, vec![("server".to_string(), "loopback".to_string())]);
}
