//! Records what the server sends during the handshake. The crypto session
//! quinn drives is wrapped so every CRYPTO byte from the peer is also parsed
//! here: TLS handshake messages give the cipher suite, key share, extension
//! lists and the QUIC transport parameters.

use crate::client::varint;
use crate::model::{TlsExtension, TransportParameters};
use quinn::crypto::{
    self, rustls::QuicClientConfig, ClientConfig as _, ExportKeyingMaterialError, KeyPair, Keys,
    Session as _,
};
use quinn::{ConnectError, ConnectionId, Side};
use quinn_proto::transport_parameters::TransportParameters as LocalParameters;
use quinn_proto::TransportError;
use std::any::Any;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

const SERVER_HELLO: u8 = 2;
const ENCRYPTED_EXTENSIONS: u8 = 8;
const CERTIFICATE: u8 = 11;
const CERTIFICATE_REQUEST: u8 = 13;

const EXT_SUPPORTED_VERSIONS: u16 = 43;
const EXT_KEY_SHARE: u16 = 51;
const EXT_QUIC_PARAMS: u16 = 0x39;
const EXT_QUIC_PARAMS_DRAFT: u16 = 0xffa5;

/// ServerHello.random of a HelloRetryRequest (RFC 8446 4.1.3).
const HELLO_RETRY_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8, 0x91,
    0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8, 0x33, 0x9c,
];

const MAX_MESSAGE: usize = 1 << 20;

#[derive(Debug, Clone, Default)]
pub struct HandshakeCapture {
    pub version: Option<u32>,
    pub retry: bool,
    pub protocol_version: Option<u16>,
    pub cipher_suite: Option<u16>,
    pub key_share_group: Option<u16>,
    pub server_hello_extensions: Option<Vec<TlsExtension>>,
    pub hello_retry_extensions: Option<Vec<TlsExtension>>,
    pub encrypted_extensions: Option<Vec<TlsExtension>>,
    pub cert_request_extensions: Option<Vec<TlsExtension>>,
    pub certificate_extensions: Option<Vec<TlsExtension>>,
    pub transport: Option<TransportParameters>,
    pending: Vec<u8>,
    broken: bool,
}

impl HandshakeCapture {
    /// Feeds handshake bytes in stream order; whole messages are parsed as
    /// soon as they are complete.
    pub fn observe(&mut self, data: &[u8]) {
        if self.broken {
            return;
        }
        self.pending.extend_from_slice(data);
        loop {
            if self.pending.len() < 4 {
                return;
            }
            let len = u24(&self.pending[1..4]);
            if len > MAX_MESSAGE {
                tracing::debug!(len, "oversized handshake message, capture stopped");
                self.broken = true;
                self.pending.clear();
                return;
            }
            if self.pending.len() < 4 + len {
                return;
            }
            let message: Vec<u8> = self.pending.drain(..4 + len).collect();
            if self.handle(message[0], &message[4..]).is_none() {
                tracing::debug!(ty = message[0], "malformed handshake message ignored");
            }
        }
    }

    fn handle(&mut self, ty: u8, body: &[u8]) -> Option<()> {
        let mut r = Reader::new(body);
        match ty {
            SERVER_HELLO => {
                r.take(2)?;
                let random = r.take(32)?;
                r.vec8()?;
                let suite = r.u16()?;
                r.u8()?;
                let extensions = parse_extensions(r.vec16()?)?;
                if random == HELLO_RETRY_RANDOM {
                    self.hello_retry_extensions = Some(extensions);
                    return Some(());
                }
                self.cipher_suite = Some(suite);
                for ext in &extensions {
                    let mut data = Reader::new(&ext.data);
                    match ext.ty {
                        EXT_SUPPORTED_VERSIONS => self.protocol_version = data.u16(),
                        EXT_KEY_SHARE => self.key_share_group = data.u16(),
                        _ => {}
                    }
                }
                self.server_hello_extensions = Some(extensions);
            }
            ENCRYPTED_EXTENSIONS => {
                let extensions = parse_extensions(r.vec16()?)?;
                if let Some(ext) = extensions
                    .iter()
                    .find(|e| e.ty == EXT_QUIC_PARAMS || e.ty == EXT_QUIC_PARAMS_DRAFT)
                {
                    self.transport = parse_transport_parameters(&ext.data);
                }
                self.encrypted_extensions = Some(extensions);
            }
            CERTIFICATE_REQUEST => {
                r.vec8()?;
                self.cert_request_extensions = Some(parse_extensions(r.vec16()?)?);
            }
            CERTIFICATE => {
                r.vec8()?;
                let mut entries = Reader::new(r.vec24()?);
                let mut extensions = Vec::new();
                while !entries.is_empty() {
                    entries.vec24()?;
                    extensions.extend(parse_extensions(entries.vec16()?)?);
                }
                self.certificate_extensions = Some(extensions);
            }
            _ => {}
        }
        Some(())
    }
}

fn u24(b: &[u8]) -> usize {
    (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2])
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()?;
        self.take(usize::from(len))
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }

    fn vec24(&mut self) -> Option<&'a [u8]> {
        let len = u24(self.take(3)?);
        self.take(len)
    }

    fn varint(&mut self) -> Option<u64> {
        let (value, used) = varint::decode(self.buf)?;
        self.buf = &self.buf[used..];
        Some(value)
    }
}

fn parse_extensions(block: &[u8]) -> Option<Vec<TlsExtension>> {
    let mut r = Reader::new(block);
    let mut out = Vec::new();
    while !r.is_empty() {
        let ty = r.u16()?;
        let data = r.vec16()?.to_vec();
        out.push(TlsExtension { ty, data });
    }
    Some(out)
}

/// Decodes the peer's `quic_transport_parameters` extension. Parameters the
/// peer omits take their RFC 9000 defaults; unknown ids are skipped.
pub fn parse_transport_parameters(buf: &[u8]) -> Option<TransportParameters> {
    let mut params = TransportParameters {
        max_idle_timeout_ms: Some(0),
        max_udp_payload_size: Some(65_527),
        initial_max_data: Some(0),
        initial_max_stream_data_bidi_local: Some(0),
        initial_max_stream_data_bidi_remote: Some(0),
        initial_max_stream_data_uni: Some(0),
        initial_max_streams_bidi: Some(0),
        initial_max_streams_uni: Some(0),
        ack_delay_exponent: Some(3),
        max_ack_delay_ms: Some(25),
        disable_active_migration: Some(false),
        active_conn_id_limit: Some(2),
        ..Default::default()
    };
    let mut r = Reader::new(buf);
    while !r.is_empty() {
        let id = r.varint()?;
        let len = usize::try_from(r.varint()?).ok()?;
        let value = r.take(len)?;
        let int = || Reader::new(value).varint();
        match id {
            0x00 => params.original_dst_conn_id = Some(value.to_vec()),
            0x01 => params.max_idle_timeout_ms = int(),
            0x02 => params.stateless_reset_token = Some(value.to_vec()),
            0x03 => params.max_udp_payload_size = int(),
            0x04 => params.initial_max_data = int(),
            0x05 => params.initial_max_stream_data_bidi_local = int(),
            0x06 => params.initial_max_stream_data_bidi_remote = int(),
            0x07 => params.initial_max_stream_data_uni = int(),
            0x08 => params.initial_max_streams_bidi = int(),
            0x09 => params.initial_max_streams_uni = int(),
            0x0a => params.ack_delay_exponent = int(),
            0x0b => params.max_ack_delay_ms = int(),
            0x0c => params.disable_active_migration = Some(true),
            0x0d => params.preferred_address = preferred_address(value),
            0x0e => params.active_conn_id_limit = int(),
            0x0f => params.initial_src_conn_id = Some(value.to_vec()),
            0x10 => params.retry_src_conn_id = Some(value.to_vec()),
            _ => {}
        }
    }
    Some(params)
}

/// `ip:port` of the preferred address, IPv4 when the server offers one.
fn preferred_address(value: &[u8]) -> Option<String> {
    let mut r = Reader::new(value);
    let v4: [u8; 4] = r.take(4)?.try_into().ok()?;
    let v4_port = r.u16()?;
    let v6: [u8; 16] = r.take(16)?.try_into().ok()?;
    let v6_port = r.u16()?;
    let v4 = Ipv4Addr::from(v4);
    if !v4.is_unspecified() || v4_port != 0 {
        return Some(format!("{v4}:{v4_port}"));
    }
    Some(format!("[{}]:{v6_port}", Ipv6Addr::from(v6)))
}

/// Crypto config handed to quinn for one dial; every session it starts
/// reports into `capture`.
pub struct CapturingConfig {
    inner: Arc<QuicClientConfig>,
    capture: Arc<Mutex<HandshakeCapture>>,
}

impl CapturingConfig {
    pub fn new(inner: Arc<QuicClientConfig>, capture: Arc<Mutex<HandshakeCapture>>) -> Self {
        Self { inner, capture }
    }
}

impl crypto::ClientConfig for CapturingConfig {
    fn start_session(
        self: Arc<Self>,
        version: u32,
        server_name: &str,
        params: &LocalParameters,
    ) -> Result<Box<dyn crypto::Session>, ConnectError> {
        let inner = self.inner.clone().start_session(version, server_name, params)?;
        lock(&self.capture).version = Some(version);
        Ok(Box::new(CapturingSession {
            inner,
            capture: self.capture.clone(),
        }))
    }
}

pub(crate) fn lock(capture: &Mutex<HandshakeCapture>) -> std::sync::MutexGuard<'_, HandshakeCapture> {
    capture.lock().unwrap_or_else(|e| e.into_inner())
}

struct CapturingSession {
    inner: Box<dyn crypto::Session>,
    capture: Arc<Mutex<HandshakeCapture>>,
}

impl crypto::Session for CapturingSession {
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys {
        self.inner.initial_keys(dst_cid, side)
    }

    fn handshake_data(&self) -> Option<Box<dyn Any>> {
        self.inner.handshake_data()
    }

    fn peer_identity(&self) -> Option<Box<dyn Any>> {
        self.inner.peer_identity()
    }

    fn early_crypto(&self) -> Option<(Box<dyn crypto::HeaderKey>, Box<dyn crypto::PacketKey>)> {
        self.inner.early_crypto()
    }

    fn early_data_accepted(&self) -> Option<bool> {
        self.inner.early_data_accepted()
    }

    fn is_handshaking(&self) -> bool {
        self.inner.is_handshaking()
    }

    fn read_handshake(&mut self, buf: &[u8]) -> Result<bool, TransportError> {
        lock(&self.capture).observe(buf);
        self.inner.read_handshake(buf)
    }

    fn transport_parameters(&self) -> Result<Option<LocalParameters>, TransportError> {
        self.inner.transport_parameters()
    }

    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys> {
        self.inner.write_handshake(buf)
    }

    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn crypto::PacketKey>>> {
        self.inner.next_1rtt_keys()
    }

    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool {
        let valid = self.inner.is_valid_retry(orig_dst_cid, header, payload);
        if valid {
            lock(&self.capture).retry = true;
        }
        valid
    }

    fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: &[u8],
    ) -> Result<(), ExportKeyingMaterialError> {
        self.inner.export_keying_material(output, label, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(ty: u8, body: &[u8]) -> Vec<u8> {
        let len = body.len();
        let mut out = vec![ty, (len >> 16) as u8, (len >> 8) as u8, len as u8];
        out.extend_from_slice(body);
        out
    }

    fn extensions(list: &[(u16, &[u8])]) -> Vec<u8> {
        let mut block = Vec::new();
        for (ty, data) in list {
            block.extend_from_slice(&ty.to_be_bytes());
            block.extend_from_slice(&(data.len() as u16).to_be_bytes());
            block.extend_from_slice(data);
        }
        let mut out = (block.len() as u16).to_be_bytes().to_vec();
        out.extend(block);
        out
    }

    fn server_hello(random: [u8; 32], exts: &[(u16, &[u8])]) -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&random);
        body.push(0);
        body.extend_from_slice(&0x1301u16.to_be_bytes());
        body.push(0);
        body.extend(extensions(exts));
        message(SERVER_HELLO, &body)
    }

    fn param(id: u64, value: &[u8], out: &mut Vec<u8>) {
        varint::encode(id, out);
        varint::encode(value.len() as u64, out);
        out.extend_from_slice(value);
    }

    #[test]
    fn server_hello_yields_suite_group_and_version() {
        let mut capture = HandshakeCapture::default();
        let key_share: [u8; 6] = [0x00, 0x1d, 0x00, 0x02, 0xaa, 0xbb];
        let bytes = server_hello([7; 32], &[(43, &[0x03, 0x04]), (51, &key_share)]);
        // split mid-message to exercise reassembly
        capture.observe(&bytes[..10]);
        assert!(capture.cipher_suite.is_none());
        capture.observe(&bytes[10..]);

        assert_eq!(capture.cipher_suite, Some(0x1301));
        assert_eq!(capture.protocol_version, Some(0x0304));
        assert_eq!(capture.key_share_group, Some(0x001d));
        let exts = capture.server_hello_extensions.unwrap();
        assert_eq!(exts.iter().map(|e| e.ty).collect::<Vec<_>>(), vec![43, 51]);
        assert!(capture.hello_retry_extensions.is_none());
    }

    #[test]
    fn hello_retry_request_is_kept_apart() {
        let mut capture = HandshakeCapture::default();
        capture.observe(&server_hello(HELLO_RETRY_RANDOM, &[(51, &[0x00, 0x17])]));
        assert_eq!(capture.hello_retry_extensions.unwrap()[0].data, vec![0x00, 0x17]);
        assert!(capture.cipher_suite.is_none());
        assert!(capture.server_hello_extensions.is_none());
    }

    #[test]
    fn encrypted_extensions_carry_transport_parameters() {
        let mut params = Vec::new();
        param(0x00, &[1, 2, 3, 4, 5, 6, 7, 8], &mut params);
        param(0x01, &[0x80, 0x00, 0x75, 0x30], &mut params);
        param(0x04, &[0x80, 0x10, 0x00, 0x00], &mut params);
        param(0x08, &[0x40, 0x64], &mut params);
        param(0x0c, &[], &mut params);
        param(0x0f, &[9; 8], &mut params);
        param(0x2a2a, &[0xff; 3], &mut params);

        let mut capture = HandshakeCapture::default();
        let body = extensions(&[(16, b"\x00\x03\x02h3"), (EXT_QUIC_PARAMS, &params)]);
        capture.observe(&message(ENCRYPTED_EXTENSIONS, &body));

        let tp = capture.transport.unwrap();
        assert_eq!(tp.original_dst_conn_id, Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(tp.max_idle_timeout_ms, Some(30_000));
        assert_eq!(tp.initial_max_data, Some(1 << 20));
        assert_eq!(tp.initial_max_streams_bidi, Some(100));
        assert_eq!(tp.disable_active_migration, Some(true));
        assert_eq!(tp.initial_src_conn_id, Some(vec![9; 8]));
        assert_eq!(tp.max_udp_payload_size, Some(65_527));
        assert_eq!(tp.ack_delay_exponent, Some(3));
        assert_eq!(tp.retry_src_conn_id, None);
        assert_eq!(capture.encrypted_extensions.unwrap().len(), 2);
    }

    #[test]
    fn preferred_address_prefers_ipv4() {
        let mut value = vec![192, 0, 2, 1, 0x01, 0xbb];
        value.extend_from_slice(&[0; 16]);
        value.extend_from_slice(&[0, 0, 0]);
        value.extend_from_slice(&[0; 16]);
        assert_eq!(preferred_address(&value).as_deref(), Some("192.0.2.1:443"));

        let mut value = vec![0; 6];
        value.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        value.extend_from_slice(&[0x11, 0x5c, 0]);
        value.extend_from_slice(&[0; 16]);
        assert_eq!(preferred_address(&value).as_deref(), Some("[::1]:4444"));
    }

    #[test]
    fn certificate_and_request_extensions() {
        let mut capture = HandshakeCapture::default();

        let mut request = vec![0];
        request.extend(extensions(&[(13, &[0x00, 0x02, 0x04, 0x03])]));
        capture.observe(&message(CERTIFICATE_REQUEST, &request));

        let mut entry = vec![0, 0, 3, 0xde, 0xad, 0x01];
        entry.extend(extensions(&[(5, &[1, 2])]));
        let mut body = vec![0];
        body.extend_from_slice(&[0, 0, entry.len() as u8]);
        body.extend(entry);
        capture.observe(&message(CERTIFICATE, &body));

        assert_eq!(capture.cert_request_extensions.unwrap()[0].ty, 13);
        assert_eq!(
            capture.certificate_extensions.unwrap(),
            vec![TlsExtension { ty: 5, data: vec![1, 2] }]
        );
    }

    #[test]
    fn malformed_message_does_not_poison_later_ones() {
        let mut capture = HandshakeCapture::default();
        capture.observe(&message(ENCRYPTED_EXTENSIONS, &[0x00, 0x09, 0x00]));
        assert!(capture.encrypted_extensions.is_none());
        capture.observe(&server_hello([1; 32], &[]));
        assert_eq!(capture.cipher_suite, Some(0x1301));
    }
}
