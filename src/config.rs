//! Engine configuration
//!
//! Every knob has a default and can be overridden from the environment,
//! which is handy for benchmarks and CI runs:
//!
//! ```bash
//! KILN_THREADS=2 KILN_LEAK_SAMPLE=16 cargo test
//! ```

use std::str::FromStr;

/// Default number of elements below which an elementwise op runs on one worker.
pub const DEFAULT_MIN_CHUNK: usize = 16 * 1024;

/// Default retry budget for transient accelerator allocation failures.
pub const DEFAULT_DEVICE_RETRIES: u32 = 3;

/// Default timeout when waiting on accelerator submissions.
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker threads for the partitioner (0 = one per hardware thread)
    pub threads: usize,
    /// Smallest elementwise chunk handed to a worker
    pub min_chunk: usize,
    /// Seed for the context RNG (None = seeded from the OS)
    pub seed: Option<u64>,
    /// Attempts before a failing device allocation is surfaced
    pub device_retries: u32,
    /// Linear backoff step between device retries
    pub retry_backoff_ms: u64,
    /// Timeout when waiting on a pending accelerator submission
    pub sync_timeout_secs: u64,
    /// Track one in N allocations in the leak detector (0 = disabled)
    pub leak_sample_every: u32,
    /// Report tracked allocations still live after this many epochs
    pub leak_report_epochs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            min_chunk: DEFAULT_MIN_CHUNK,
            seed: None,
            device_retries: DEFAULT_DEVICE_RETRIES,
            retry_backoff_ms: 50,
            sync_timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
            leak_sample_every: 0,
            leak_report_epochs: 4,
        }
    }
}

fn env_or<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(fallback)
}

impl EngineConfig {
    /// Defaults overridden by any `KILN_*` variables that parse
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            threads: env_or("KILN_THREADS", d.threads),
            min_chunk: env_or("KILN_MIN_CHUNK", d.min_chunk).max(1),
            seed: std::env::var("KILN_SEED")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            device_retries: env_or("KILN_DEVICE_RETRIES", d.device_retries).max(1),
            retry_backoff_ms: env_or("KILN_RETRY_BACKOFF_MS", d.retry_backoff_ms),
            sync_timeout_secs: env_or("KILN_SYNC_TIMEOUT", d.sync_timeout_secs),
            leak_sample_every: env_or("KILN_LEAK_SAMPLE", d.leak_sample_every),
            leak_report_epochs: env_or("KILN_LEAK_EPOCHS", d.leak_report_epochs),
        }
    }

    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub const fn with_min_chunk(mut self, min_chunk: usize) -> Self {
        self.min_chunk = if min_chunk == 0 { 1 } else { min_chunk };
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub const fn with_device_retries(mut self, retries: u32) -> Self {
        self.device_retries = if retries == 0 { 1 } else { retries };
        self
    }

    #[must_use]
    pub const fn with_leak_detection(mut self, sample_every: u32, report_epochs: u64) -> Self {
        self.leak_sample_every = sample_every;
        self.leak_report_epochs = report_epochs;
        self
    }

    /// Resolved worker count
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_clamp_degenerate_values() {
        let cfg = EngineConfig::default()
            .with_min_chunk(0)
            .with_device_retries(0)
            .with_threads(3)
            .with_seed(11);
        assert_eq!(cfg.min_chunk, 1);
        assert_eq!(cfg.device_retries, 1);
        assert_eq!(cfg.worker_threads(), 3);
        assert_eq!(cfg.seed, Some(11));
    }

    #[test]
    fn auto_thread_count_is_positive() {
        assert!(EngineConfig::default().worker_threads() >= 1);
    }
}
