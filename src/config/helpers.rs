//! Environment lookup helpers shared by the config resolvers.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read an env var, treating an empty value as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("failed to read {key}: {e}"))),
    }
}

/// Parse an env var into `T`, if it is set.
pub(crate) fn parse_optional_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    optional_env(key)?
        .map(|s| {
            s.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("cannot parse '{s}': {e}"),
            })
        })
        .transpose()
}

/// Env var, then settings value, then default.
pub(crate) fn resolve_or<T>(key: &str, setting: Option<T>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_optional_env(key)?.or(setting).unwrap_or(default))
}

/// Like [`resolve_or`] for millisecond durations. Zero is rejected.
pub(crate) fn resolve_millis(
    key: &str,
    setting: Option<u64>,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    let ms = resolve_or(key, setting, default_ms)?;
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

pub(crate) fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// Serializes tests that mutate the process environment.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    pub(crate) struct EnvGuard {
        keys: Vec<&'static str>,
        _lock: MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        pub(crate) fn new() -> Self {
            Self {
                keys: Vec::new(),
                _lock: ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner),
            }
        }

        pub(crate) fn set(&mut self, key: &'static str, value: &str) {
            // SAFETY: guarded by ENV_MUTEX in tests.
            unsafe { std::env::set_var(key, value) };
            self.keys.push(key);
        }

        pub(crate) fn clear(&mut self, keys: &[&'static str]) {
            for key in keys {
                // SAFETY: guarded by ENV_MUTEX in tests.
                unsafe { std::env::remove_var(key) };
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in &self.keys {
                // SAFETY: guarded by ENV_MUTEX in tests.
                unsafe { std::env::remove_var(key) };
            }
        }
    }
}
