use clap::Parser;
use quic_scanner::cli::Cli;
use quic_scanner::engine::pipeline::{ProbeTemplate, SessionProbe};
use quic_scanner::engine::Engine;
use quic_scanner::input::InputSource;
use quic_scanner::output::{OutputChannel, ResultSet, SinkOptions};
use quic_scanner::transport::QuicDialer;
use quic_scanner::util::prepare_output_dir;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = cli.into_config()?;

    let input = InputSource::open(&cfg.input)?;
    prepare_output_dir(&cfg.output_dir)?;
    let results = ResultSet::create(&cfg.output_dir, SinkOptions::from(&cfg))?;
    let dialer = QuicDialer::new(cfg.quic_version, results.secret_log())?;
    let sink = OutputChannel::new(results);

    let probe = SessionProbe::new(
        Arc::new(dialer),
        ProbeTemplate {
            handshake_timeout: cfg.handshake_timeout,
            http3: cfg.http3,
            http_timeout: cfg.http_timeout,
        },
    );
    let engine = Engine::new(&cfg, Arc::new(probe), sink.clone());

    let cancel = CancellationToken::new();
    tokio::spawn(listen_for_shutdown(cancel.clone()));

    tracing::info!(
        input = %cfg.input.display(),
        output = %cfg.output_dir.display(),
        http3 = cfg.http3,
        "starting scan"
    );
    let summary = engine.run(input.into_stream(), cancel).await;
    sink.shutdown().await?;
    let summary = summary?;
    tracing::info!(
        dispatched = summary.dispatched,
        completed = summary.completed,
        "scan finished"
    );

    Ok(())
}

async fn listen_for_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("interrupt received, finishing in-flight probes");
    cancel.cancel();
}
