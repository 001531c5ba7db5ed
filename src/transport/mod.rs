pub mod capture;
pub mod keylog;
pub mod quic;

use crate::model::{Negotiated, TargetDescriptor};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub use quic::QuicDialer;

/// Everything one handshake attempt needs. Built per target from a shared
/// template and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub target_id: u64,
    pub address: String,
    pub port: u16,
    pub server_name: String,
    pub scid: Option<Vec<u8>>,
    pub dcid: Option<Vec<u8>>,
    pub handshake_timeout: Duration,
}

impl DialRequest {
    pub fn for_target(target: &TargetDescriptor, handshake_timeout: Duration) -> Self {
        Self {
            target_id: target.id,
            address: target.address.clone(),
            port: target.port,
            server_name: target.server_name().to_string(),
            scid: target.scid.clone(),
            dcid: target.dcid.clone(),
            handshake_timeout,
        }
    }
}

pub struct BiStream {
    pub send: Box<dyn AsyncWrite + Send + Unpin>,
    pub recv: Box<dyn AsyncRead + Send + Unpin>,
}

/// Performs the secure handshake for one target.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, request: &DialRequest) -> anyhow::Result<Box<dyn Session>>;
}

/// An established session.
#[async_trait]
pub trait Session: Send + Sync {
    fn negotiated(&self) -> Negotiated;

    fn rtt(&self) -> Option<Duration> {
        None
    }

    async fn open_bi(&self) -> anyhow::Result<BiStream>;

    async fn close(&self, code: u32, reason: &str);
}
