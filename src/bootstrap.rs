//! Bootstrap helpers for the hosting envoy.
//!
//! Loads `~/.hosting-envoy/.env` and installs the tracing subscriber before
//! anything else runs.
//!
//! File: `~/.hosting-envoy/.env` (standard dotenvy format)

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "hosting_envoy=info";

/// Path to the envoy-specific `.env` file: `~/.hosting-envoy/.env`.
pub fn envoy_env_path() -> PathBuf {
    Settings::base_dir().join(".env")
}

/// Load env vars from `~/.hosting-envoy/.env` (in addition to the standard
/// `.env`).
///
/// Call this **after** `dotenvy::dotenv()` so that the standard `./.env`
/// takes priority. dotenvy never overwrites existing env vars, so the
/// effective priority is:
///
///   explicit env vars > `./.env` > `~/.hosting-envoy/.env`
pub fn load_envoy_env() {
    let path = envoy_env_path();
    if path.exists()
        && let Err(e) = dotenvy::from_path(&path)
    {
        eprintln!("Warning: failed to load {}: {}", path.display(), e);
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT=json` selects JSON lines; anything else is pretty text.
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Calling this twice is harmless;
/// the second subscriber is ignored.
pub fn init_tracing(format: LogFormat, default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Warning: tracing already initialised: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_path_is_under_base_dir() {
        let path = envoy_env_path();
        assert!(path.ends_with(".hosting-envoy/.env"));
    }

    #[test]
    fn init_tracing_twice_does_not_panic() {
        init_tracing(LogFormat::Pretty, DEFAULT_LOG_FILTER);
        init_tracing(LogFormat::Json, DEFAULT_LOG_FILTER);
    }
}
