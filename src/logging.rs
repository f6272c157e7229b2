//! Tracing setup for the host binary.
//!
//! The TUI owns the terminal, so logs go to a rolling file under the
//! per-user cache directory. Call once at startup and keep the
//! returned guard alive for the lifetime of the process.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

pub fn init() -> Result<WorkerGuard> {
  let log_dir = dirs::cache_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
    .ok_or_else(|| Error::Config("Could not determine cache directory".to_string()))?
    .join("r9s");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| Error::Config(format!("Failed to create log directory: {}", e)))?;

  let appender = tracing_appender::rolling::daily(log_dir, "r9s.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("r9s=info")))
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

  Ok(guard)
}
