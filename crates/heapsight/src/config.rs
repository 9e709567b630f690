use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const DEFAULT_POLL_MS: u64 = 300;
const DEFAULT_CHUNK_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How often pending calls are checked; a call still pending after a
    /// full interval counts as long running.
    pub long_running_poll: Duration,
    /// Forward worker-side failures to callers instead of only logging them.
    pub reject_remote_errors: bool,
    /// Size of the chunks a snapshot file is streamed to the worker in.
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            long_running_poll: Duration::from_millis(DEFAULT_POLL_MS),
            reject_remote_errors: false,
            chunk_size: DEFAULT_CHUNK_BYTES,
        }
    }
}

impl ClientConfig {
    /// Reads `HEAPSIGHT_POLL_MS`, `HEAPSIGHT_REJECT_REMOTE_ERRORS` and
    /// `HEAPSIGHT_CHUNK_BYTES`. Invalid values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let poll_ms = parse_var(&lookup, "HEAPSIGHT_POLL_MS", DEFAULT_POLL_MS, |v| *v > 0);
        let reject_remote_errors = match lookup("HEAPSIGHT_REJECT_REMOTE_ERRORS").as_deref() {
            None => false,
            Some("1" | "true" | "yes") => true,
            Some("0" | "false" | "no" | "") => false,
            Some(raw) => {
                warn!(raw, "invalid HEAPSIGHT_REJECT_REMOTE_ERRORS, using false");
                false
            }
        };
        let chunk_size = parse_var(&lookup, "HEAPSIGHT_CHUNK_BYTES", DEFAULT_CHUNK_BYTES, |v| *v > 0);
        Self {
            long_running_poll: Duration::from_millis(poll_ms),
            reject_remote_errors,
            chunk_size,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(name, %raw, %default, "invalid value, using default");
            default
        }
    }
}
