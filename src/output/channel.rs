use crate::model::ScanSession;
use tokio::sync::{mpsc, oneshot};

use super::sink::ResultSet;

/// Single writer for every result table. Completed sessions are queued and
/// written one at a time on a blocking worker, so rows of concurrent probes
/// never interleave.
#[derive(Clone)]
pub struct OutputChannel {
    inner: std::sync::Arc<OutputInner>,
}

struct OutputInner {
    tx: tokio::sync::Mutex<Option<mpsc::Sender<OutputCommand>>>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<anyhow::Result<()>>>>,
}

enum OutputCommand {
    Emit(Box<ScanSession>),
    Flush(oneshot::Sender<anyhow::Result<()>>),
}

impl OutputChannel {
    pub fn new(results: ResultSet) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let handle = tokio::task::spawn_blocking(move || run_writer(results, rx));

        Self {
            inner: std::sync::Arc::new(OutputInner {
                tx: tokio::sync::Mutex::new(Some(tx)),
                handle: tokio::sync::Mutex::new(Some(handle)),
            }),
        }
    }

    pub async fn emit(&self, session: ScanSession) -> anyhow::Result<()> {
        let tx = self.sender().await?;
        tx.send(OutputCommand::Emit(Box::new(session)))
            .await
            .map_err(|err| anyhow::anyhow!("output worker not available: {err}"))
    }

    /// Resolves once everything queued before this call is on disk.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let tx = self.sender().await?;
        let (ack, done) = oneshot::channel();
        tx.send(OutputCommand::Flush(ack))
            .await
            .map_err(|err| anyhow::anyhow!("output worker not available: {err}"))?;
        done.await
            .map_err(|_| anyhow::anyhow!("output worker stopped before flushing"))?
    }

    /// Drains the queue, closes every stream and joins the worker.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.inner.tx.lock().await.take();

        if let Some(handle) = self.inner.handle.lock().await.take() {
            handle
                .await
                .map_err(|err| anyhow::anyhow!("failed to join output worker: {err}"))??;
        }

        Ok(())
    }

    async fn sender(&self) -> anyhow::Result<mpsc::Sender<OutputCommand>> {
        match self.inner.tx.lock().await.as_ref() {
            Some(tx) => Ok(tx.clone()),
            None => anyhow::bail!("output worker not available; dropping scan result"),
        }
    }
}

fn run_writer(
    mut results: ResultSet,
    mut rx: mpsc::Receiver<OutputCommand>,
) -> anyhow::Result<()> {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            OutputCommand::Emit(session) => {
                if let Err(err) = results.write(&session) {
                    tracing::error!(
                        target_id = session.target.id,
                        error = %err,
                        "failed to write scan result"
                    );
                }
            }
            OutputCommand::Flush(ack) => {
                let _ = ack.send(results.flush());
            }
        }
    }
    results.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionState, TargetDescriptor};
    use crate::output::SinkOptions;

    fn session(id: u64) -> ScanSession {
        let mut session = ScanSession::new(TargetDescriptor {
            id,
            address: "192.0.2.1".into(),
            port: 443,
            hostname: String::new(),
            scid: None,
            dcid: None,
        });
        session.advance(SessionState::Dialing, None);
        session.advance(SessionState::Failed, None);
        session.error = Some("unreachable".into());
        session.advance(SessionState::Closed, None);
        session
    }

    #[tokio::test]
    async fn concurrent_emitters_produce_whole_rows() {
        let dir = tempfile::tempdir().unwrap();
        let results = ResultSet::create(dir.path(), SinkOptions::default()).unwrap();
        let channel = OutputChannel::new(results);

        let mut tasks = Vec::new();
        for id in 0..32 {
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move { channel.emit(session(id)).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        channel.flush().await.unwrap();
        channel.shutdown().await.unwrap();
        assert!(channel.emit(session(99)).await.is_err());

        let mut reader =
            csv::Reader::from_path(dir.path().join("quic_connection_info.csv")).unwrap();
        let mut ids: Vec<u64> = reader
            .records()
            .map(|r| r.unwrap()[0].parse().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..32).collect::<Vec<_>>());
    }
}
