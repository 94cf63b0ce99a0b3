//! Configuration for Postern
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::PipelineConfig;
use crate::session::SessionConfig;

/// Postern - multi-session gateway for an E2E-encrypted chat network
#[derive(Parser, Debug, Clone)]
#[command(name = "postern")]
#[command(about = "Multi-session HTTP gateway for an E2E-encrypted chat network")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Root directory for per-user device stores
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory for rotating log files
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable development mode (loopback upstream transport, auto-linking)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Minimum spacing between consecutive sends per user, in seconds
    #[arg(long, env = "SEND_SPACING_SECS", default_value = "6")]
    pub send_spacing_secs: u64,

    /// Duplicate suppression window in seconds (0 = same as send spacing)
    #[arg(long, env = "DUPLICATE_WINDOW_SECS", default_value = "0")]
    pub duplicate_window_secs: u64,

    /// Maximum identical messages allowed inside one duplicate window
    #[arg(long, env = "DUPLICATE_MAX", default_value = "1")]
    pub duplicate_max: u32,

    /// Maximum reconnect backoff in seconds
    #[arg(long, env = "RECONNECT_MAX_BACKOFF_SECS", default_value = "30")]
    pub reconnect_max_backoff_secs: u64,

    /// Soft ceiling on reconnect attempts (the engine retries indefinitely
    /// but logs attempts past this)
    #[arg(long, env = "RECONNECT_MAX_ATTEMPTS", default_value = "20")]
    pub reconnect_max_attempts: u32,

    /// Attempts per connect-with-retry cycle (startup restore, restart)
    #[arg(long, env = "CONNECT_MAX_RETRIES", default_value = "3")]
    pub connect_max_retries: u32,

    /// Total capacity of the event dispatch queue
    #[arg(long, env = "EVENT_QUEUE_CAPACITY", default_value = "100")]
    pub event_queue_capacity: usize,

    /// Number of event dispatch workers
    #[arg(long, env = "EVENT_WORKERS", default_value = "5")]
    pub event_workers: usize,

    /// Evict sessions disconnected and idle for longer than this, in seconds
    /// (0 disables idle reaping)
    #[arg(long, env = "IDLE_REAP_THRESHOLD_SECS", default_value = "0")]
    pub idle_reap_threshold_secs: u64,

    /// Interval between idle reaper sweeps, in seconds
    #[arg(long, env = "REAP_INTERVAL_SECS", default_value = "300")]
    pub reap_interval_secs: u64,

    /// Per-call deadline for send operations, in seconds
    #[arg(long, env = "SEND_TIMEOUT_SECS", default_value = "60")]
    pub send_timeout_secs: u64,

    /// Per-call deadline for mark-read operations, in seconds
    #[arg(long, env = "MARK_READ_TIMEOUT_SECS", default_value = "30")]
    pub mark_read_timeout_secs: u64,

    /// Deadline for a single QR code to arrive, in seconds
    #[arg(long, env = "QR_CODE_TIMEOUT_SECS", default_value = "30")]
    pub qr_code_timeout_secs: u64,

    /// Overall deadline for the QR linking protocol, in seconds
    #[arg(long, env = "QR_OVERALL_TIMEOUT_SECS", default_value = "60")]
    pub qr_overall_timeout_secs: u64,

    /// Deadline for fetching media from a URL, in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "30")]
    pub fetch_timeout_secs: u64,
}

impl Args {
    /// Per-user send spacing
    pub fn send_spacing(&self) -> Duration {
        Duration::from_secs(self.send_spacing_secs)
    }

    /// Duplicate window; 0 means "follow send spacing"
    pub fn duplicate_window(&self) -> Duration {
        if self.duplicate_window_secs == 0 {
            self.send_spacing()
        } else {
            Duration::from_secs(self.duplicate_window_secs)
        }
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_backoff_secs)
    }

    pub fn idle_reap_threshold(&self) -> Option<Duration> {
        if self.idle_reap_threshold_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_reap_threshold_secs))
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn mark_read_timeout(&self) -> Duration {
        Duration::from_secs(self.mark_read_timeout_secs)
    }

    pub fn qr_code_timeout(&self) -> Duration {
        Duration::from_secs(self.qr_code_timeout_secs)
    }

    pub fn qr_overall_timeout(&self) -> Duration {
        Duration::from_secs(self.qr_overall_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Session timing knobs derived from the CLI configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            qr_code_timeout: self.qr_code_timeout(),
            qr_overall_timeout: self.qr_overall_timeout(),
            reconnect_max_backoff: self.reconnect_max_backoff(),
            reconnect_max_attempts: self.reconnect_max_attempts,
            connect_max_retries: self.connect_max_retries,
            ..SessionConfig::default()
        }
    }

    /// Send pipeline knobs derived from the CLI configuration
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            send_spacing: self.send_spacing(),
            duplicate_window: self.duplicate_window(),
            duplicate_max: self.duplicate_max,
            send_timeout: self.send_timeout(),
            mark_read_timeout: self.mark_read_timeout(),
            fetch_timeout: self.fetch_timeout(),
            ..PipelineConfig::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.event_workers == 0 {
            return Err("EVENT_WORKERS must be at least 1".to_string());
        }
        if self.event_queue_capacity == 0 {
            return Err("EVENT_QUEUE_CAPACITY must be at least 1".to_string());
        }
        if self.connect_max_retries == 0 {
            return Err("CONNECT_MAX_RETRIES must be at least 1".to_string());
        }
        if self.qr_overall_timeout_secs < self.qr_code_timeout_secs {
            return Err(
                "QR_OVERALL_TIMEOUT_SECS must not be shorter than QR_CODE_TIMEOUT_SECS".to_string(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Args {
        Args::parse_from(["postern"])
    }

    #[test]
    fn test_defaults() {
        let args = defaults();
        assert_eq!(args.send_spacing(), Duration::from_secs(6));
        assert_eq!(args.event_queue_capacity, 100);
        assert_eq!(args.event_workers, 5);
        assert_eq!(args.reconnect_max_backoff(), Duration::from_secs(30));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_duplicate_window_follows_spacing() {
        let mut args = defaults();
        assert_eq!(args.duplicate_window(), args.send_spacing());

        args.duplicate_window_secs = 10;
        assert_eq!(args.duplicate_window(), Duration::from_secs(10));
    }

    #[test]
    fn test_idle_reap_disabled_by_default() {
        let args = defaults();
        assert!(args.idle_reap_threshold().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut args = defaults();
        args.event_workers = 0;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_qr_deadlines() {
        let mut args = defaults();
        args.qr_overall_timeout_secs = 10;
        assert!(args.validate().is_err());
    }
}
