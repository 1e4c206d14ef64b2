//! Dispatcher configuration.
//!
//! The request timeout is the only process-wide knob. It lives in a
//! [`TimeoutSetting`] holder that dispatchers read once per request; the
//! process-wide holder is seeded from the environment on first use.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;

/// Environment variable that seeds the process-wide timeout.
pub const TIMEOUT_ENV: &str = "MNET_AJAX_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        let timeout_ms: u64 = std::env::var(TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Self { timeout_ms }
    }
}

/// Shared, settable timeout value. Clones observe the same value.
#[derive(Debug, Clone)]
pub struct TimeoutSetting {
    ms: Arc<AtomicU64>,
}

impl TimeoutSetting {
    pub fn new(ms: u64) -> Self {
        Self {
            ms: Arc::new(AtomicU64::new(ms)),
        }
    }

    /// The process-wide holder used by dispatchers built with
    /// [`Dispatcher::new`](crate::Dispatcher::new).
    pub fn global() -> Self {
        GLOBAL_TIMEOUT.clone()
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.ms.load(Ordering::SeqCst))
    }
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_MS)
    }
}

static GLOBAL_TIMEOUT: Lazy<TimeoutSetting> =
    Lazy::new(|| TimeoutSetting::new(DispatchConfig::from_env().timeout_ms));

/// Set the process-wide request timeout. Applies to requests dispatched
/// afterwards; requests already in flight keep the value they were sent with.
pub fn set_ajax_timeout(ms: u64) {
    GLOBAL_TIMEOUT.set(ms);
}
