use crate::client;
use crate::model::{ScanSession, SessionState, TargetDescriptor};
use crate::transport::{DialRequest, Dialer, Session};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

pub const CLOSE_CODE: u32 = 0;
pub const CLOSE_REASON: &str = "No error";

/// Runs one target to completion. Failures are recorded on the returned
/// session, never raised.
#[async_trait]
pub trait TargetProcessor: Send + Sync {
    async fn process_target(&self, target: TargetDescriptor) -> ScanSession;
}

/// Shared, immutable settings every probe derives its per-target dial
/// request from.
#[derive(Debug, Clone)]
pub struct ProbeTemplate {
    pub handshake_timeout: Duration,
    pub http3: bool,
    pub http_timeout: Duration,
}

impl ProbeTemplate {
    pub fn dial_request(&self, target: &TargetDescriptor) -> DialRequest {
        DialRequest::for_target(target, self.handshake_timeout)
    }
}

#[derive(Clone)]
pub struct SessionProbe {
    dialer: Arc<dyn Dialer>,
    template: ProbeTemplate,
}

impl SessionProbe {
    pub fn new(dialer: Arc<dyn Dialer>, template: ProbeTemplate) -> Self {
        Self { dialer, template }
    }

    async fn probe_http(&self, conn: &dyn Session, session: &mut ScanSession) {
        let authority = session.target.authority().to_string();
        let exchange = async {
            let stream = conn.open_bi().await?;
            let response = client::exchange(stream.send, stream.recv, &authority).await?;
            anyhow::Ok(response)
        };
        match timeout(self.template.http_timeout, exchange).await {
            Ok(Ok(response)) => {
                debug!(
                    target_id = session.target.id,
                    status = response.status,
                    headers = response.headers.len(),
                    "http3 response"
                );
                session.http = Some(response);
            }
            Ok(Err(err)) => {
                debug!(target_id = session.target.id, error = %err, "http3 probe failed");
            }
            Err(_) => {
                debug!(target_id = session.target.id, "http3 probe timed out");
            }
        }
    }
}

#[async_trait]
impl TargetProcessor for SessionProbe {
    async fn process_target(&self, target: TargetDescriptor) -> ScanSession {
        let request = self.template.dial_request(&target);
        let mut session = ScanSession::new(target);

        session.started_at = Utc::now();
        session.advance(SessionState::Dialing, None);
        debug!(target_id = request.target_id, server_name = %request.server_name, "dialing");

        let conn = match self.dialer.dial(&request).await {
            Ok(conn) => conn,
            Err(err) => {
                let now = Utc::now();
                let message = format!("{err:#}");
                debug!(target_id = request.target_id, error = %message, "handshake failed");
                session.handshake_at = now;
                session.closed_at = now;
                session.advance(SessionState::Failed, Some(message.clone()));
                session.error = Some(message);
                session.advance(SessionState::Closed, None);
                return session;
            }
        };

        session.handshake_at = Utc::now();
        session.negotiated = Some(conn.negotiated());
        session.rtt = conn.rtt();
        session.advance(SessionState::Established, None);

        if self.template.http3 {
            session.advance(SessionState::Probing, None);
            self.probe_http(conn.as_ref(), &mut session).await;
        }

        conn.close(CLOSE_CODE, CLOSE_REASON).await;
        session.closed_at = Utc::now();
        session.advance(SessionState::Closed, None);
        debug!(
            target_id = request.target_id,
            handshake_ms = session.handshake_duration_ms(),
            "session closed"
        );
        session
    }
}
