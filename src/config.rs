//! Construction-time options for a process group.
//!
//! Defaults match the upstream contract: a 10 second collective timeout
//! and two worker threads. Override via `GroupOptions::from_env` (variables
//! prefixed `COHORT_`) or by filling the fields directly.

use crate::transport::MeshDevice;
use std::sync::Arc;
use std::time::Duration;

/// Options consumed by `ProcessGroup::new`.
#[derive(Clone)]
pub struct GroupOptions {
    /// Transport devices, one context per entry. The same device may be
    /// listed multiple times; each entry still gets its own context and
    /// rendezvous namespace, which parallelizes collective traffic.
    pub devices: Vec<Arc<MeshDevice>>,

    /// Timeout applied to every blocking transport operation.
    pub timeout: Duration,

    /// Number of worker threads draining the work queue.
    pub threads: usize,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            timeout: Duration::from_secs(10),
            threads: 2,
        }
    }
}

impl GroupOptions {
    /// Load options from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `COHORT_TIMEOUT_MS`
    /// - `COHORT_THREADS`
    ///
    /// Devices cannot come from the environment; callers always supply them.
    pub fn from_env() -> Self {
        let mut opts = Self::default();

        if let Ok(v) = std::env::var("COHORT_TIMEOUT_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            opts.timeout = Duration::from_millis(ms);
        }
        if let Ok(v) = std::env::var("COHORT_THREADS")
            && let Ok(n) = v.parse::<usize>()
        {
            opts.threads = n;
        }

        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = GroupOptions::default();
        assert!(opts.devices.is_empty());
        assert_eq!(opts.timeout, Duration::from_secs(10));
        assert_eq!(opts.threads, 2);
    }
}
