use crate::model::{Config, VerifyAt};
use clap::{ArgAction, Parser, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(author, version, about = "Concurrent QUIC / HTTP3 scanner", long_about = None)]
pub struct Cli {
    /// CSV file with columns address,hostname,port,scid,dcid
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    pub input: PathBuf,

    /// Directory receiving the result tables (created if missing, must be empty)
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    pub output: PathBuf,

    /// Token bucket capacity
    #[arg(long = "bucket-size", default_value_t = 100)]
    pub bucket_size: u64,

    /// Milliseconds between two token refills
    #[arg(long = "bucket-refill-ms", default_value_t = 100)]
    pub bucket_refill_ms: u64,

    /// Upper bound on concurrently running probes
    #[arg(long = "max-in-flight", default_value_t = 10_000)]
    pub max_in_flight: usize,

    /// Pin the QUIC version, as hex (e.g. ff00001d)
    #[arg(long = "quic-version", value_name = "HEX")]
    pub quic_version: Option<String>,

    /// Send an HTTP/3 HEAD request after the handshake
    #[arg(long = "http3", action = ArgAction::SetTrue)]
    pub http3: bool,

    /// Write TLS secrets to key.log
    #[arg(long = "keylog", action = ArgAction::SetTrue)]
    pub keylog: bool,

    /// Write per-session state history to session_events.jsonl
    #[arg(long = "events", action = ArgAction::SetTrue)]
    pub events: bool,

    /// Handshake (idle) timeout in milliseconds
    #[arg(long = "handshake-timeout-ms", default_value_t = 30_000)]
    pub handshake_timeout_ms: u64,

    /// Timeout for the HTTP/3 exchange in milliseconds
    #[arg(long = "http-timeout-ms", default_value_t = 10_000)]
    pub http_timeout_ms: u64,

    /// Seconds between progress lines
    #[arg(long = "progress-interval-secs", default_value_t = 30)]
    pub progress_interval_secs: u64,

    /// Instant used for certificate chain validation
    #[arg(long = "verify-at", default_value_t = VerifyAtArg::Handshake)]
    pub verify_at: VerifyAtArg,

    /// Debug logging
    #[arg(long = "debug", action = ArgAction::SetTrue)]
    pub debug: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum VerifyAtArg {
    Start,
    Handshake,
}

impl fmt::Display for VerifyAtArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyAtArg::Start => write!(f, "start"),
            VerifyAtArg::Handshake => write!(f, "handshake"),
        }
    }
}

impl Cli {
    pub fn into_config(self) -> anyhow::Result<Config> {
        if self.bucket_size == 0 {
            anyhow::bail!("bucket size must be greater than zero");
        }

        if self.bucket_refill_ms == 0 {
            anyhow::bail!("bucket refill interval must be greater than zero");
        }

        if self.max_in_flight == 0 {
            anyhow::bail!("max in flight must be greater than zero");
        }

        if self.handshake_timeout_ms == 0 || self.http_timeout_ms == 0 {
            anyhow::bail!("timeouts must be greater than zero");
        }

        if self.progress_interval_secs == 0 {
            anyhow::bail!("progress interval must be greater than zero");
        }

        let quic_version = self
            .quic_version
            .as_deref()
            .map(parse_version)
            .transpose()?;

        Ok(Config {
            input: self.input,
            output_dir: self.output,
            bucket_size: self.bucket_size,
            bucket_refill: Duration::from_millis(self.bucket_refill_ms),
            max_in_flight: self.max_in_flight,
            quic_version,
            http3: self.http3,
            keylog: self.keylog,
            events: self.events,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            progress_interval: Duration::from_secs(self.progress_interval_secs),
            verify_at: match self.verify_at {
                VerifyAtArg::Start => VerifyAt::Start,
                VerifyAtArg::Handshake => VerifyAt::Handshake,
            },
        })
    }
}

fn parse_version(text: &str) -> anyhow::Result<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16)
        .map_err(|_| anyhow::anyhow!("invalid QUIC version {text:?}, expected hex such as ff00001d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["quic-scanner", "-i", "targets.csv", "-o", "out"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_follow_documented_values() {
        let cfg = parse(&[]).into_config().unwrap();
        assert_eq!(cfg.bucket_size, 100);
        assert_eq!(cfg.bucket_refill, Duration::from_millis(100));
        assert_eq!(cfg.max_in_flight, 10_000);
        assert_eq!(cfg.quic_version, None);
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(30));
        assert_eq!(cfg.http_timeout, Duration::from_secs(10));
        assert_eq!(cfg.verify_at, VerifyAt::Handshake);
        assert!(!cfg.http3 && !cfg.keylog && !cfg.events);
    }

    #[test]
    fn version_accepts_hex_with_or_without_prefix() {
        let cfg = parse(&["--quic-version", "ff00001d"]).into_config().unwrap();
        assert_eq!(cfg.quic_version, Some(0xff00_001d));
        let cfg = parse(&["--quic-version", "0x1"]).into_config().unwrap();
        assert_eq!(cfg.quic_version, Some(1));
        assert!(parse(&["--quic-version", "draft29"]).into_config().is_err());
    }

    #[test]
    fn zero_rate_parameters_are_rejected() {
        assert!(parse(&["--bucket-size", "0"]).into_config().is_err());
        assert!(parse(&["--bucket-refill-ms", "0"]).into_config().is_err());
        assert!(parse(&["--max-in-flight", "0"]).into_config().is_err());
    }

    #[test]
    fn verify_at_start_is_selectable() {
        let cfg = parse(&["--verify-at", "start", "--http3"]).into_config().unwrap();
        assert_eq!(cfg.verify_at, VerifyAt::Start);
        assert!(cfg.http3);
    }

    #[test]
    fn input_and_output_are_required() {
        assert!(Cli::try_parse_from(["quic-scanner", "-i", "x.csv"]).is_err());
    }
}
