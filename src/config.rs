//! Environment-driven configuration for the batch-manager core.

use std::path::PathBuf;

const DEFAULT_MAX_REQUESTS_PER_BATCH: usize = 50_000;
const DEFAULT_MAX_BATCH_SIZE_BYTES: u64 = 200 * 1024 * 1024;
const DEFAULT_SOFT_BATCH_SIZE_WARNING_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_DELIVERY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_QUEUE_FAILURE_TTL_SECS: u64 = 5 * 60;
const DEFAULT_QUEUE_PUBLISHER_POOL_SIZE: usize = 4;
const DEFAULT_BUILDING_BATCH_MAX_AGE_SECS: u64 = 60 * 60;

/// Tunables recognized by the core, per `SPEC_FULL.md` §6.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hard cap on Requests per Batch.
    pub max_requests_per_batch: usize,

    /// Hard cap on the serialized size of a Batch's `.jsonl` file.
    pub max_batch_size_bytes: u64,

    /// Soft warning threshold below the hard cap (Open Question resolution in `DESIGN.md`).
    pub soft_batch_size_warning_bytes: u64,

    /// Directory under which `batch_{id}.jsonl` files are written.
    pub batch_storage_base: PathBuf,

    /// Per-Request delivery attempts before giving up.
    pub delivery_max_attempts: u32,

    /// Forces `delivery_max_attempts` to 1 regardless of the configured value.
    pub disable_delivery_retry: bool,

    /// How long a cached destination failure is treated as still-failing.
    pub queue_failure_ttl: std::time::Duration,

    /// Number of partitions in the queue-sink publisher pool.
    pub queue_publisher_pool_size: usize,

    /// Age at which a `building` Batch is force-closed by the sweeper.
    pub building_batch_max_age: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_requests_per_batch: DEFAULT_MAX_REQUESTS_PER_BATCH,
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
            soft_batch_size_warning_bytes: DEFAULT_SOFT_BATCH_SIZE_WARNING_BYTES,
            batch_storage_base: PathBuf::from("/tmp/batch-manager"),
            delivery_max_attempts: DEFAULT_DELIVERY_MAX_ATTEMPTS,
            disable_delivery_retry: false,
            queue_failure_ttl: std::time::Duration::from_secs(DEFAULT_QUEUE_FAILURE_TTL_SECS),
            queue_publisher_pool_size: DEFAULT_QUEUE_PUBLISHER_POOL_SIZE,
            building_batch_max_age: std::time::Duration::from_secs(
                DEFAULT_BUILDING_BATCH_MAX_AGE_SECS,
            ),
        }
    }
}

impl Config {
    /// Build a `Config` from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_requests_per_batch: env_parsed(
                "MAX_REQUESTS_PER_BATCH",
                defaults.max_requests_per_batch,
            ),
            max_batch_size_bytes: env_parsed(
                "MAX_BATCH_SIZE_BYTES",
                defaults.max_batch_size_bytes,
            ),
            soft_batch_size_warning_bytes: defaults.soft_batch_size_warning_bytes,
            batch_storage_base: std::env::var("BATCH_STORAGE_BASE")
                .map(PathBuf::from)
                .unwrap_or(defaults.batch_storage_base),
            delivery_max_attempts: env_parsed(
                "DELIVERY_MAX_ATTEMPTS",
                defaults.delivery_max_attempts,
            ),
            disable_delivery_retry: env_bool("DISABLE_DELIVERY_RETRY", defaults.disable_delivery_retry),
            queue_failure_ttl: std::time::Duration::from_secs(env_parsed(
                "QUEUE_FAILURE_TTL",
                DEFAULT_QUEUE_FAILURE_TTL_SECS,
            )),
            queue_publisher_pool_size: env_parsed(
                "QUEUE_PUBLISHER_POOL_SIZE",
                defaults.queue_publisher_pool_size,
            ),
            building_batch_max_age: defaults.building_batch_max_age,
        }
    }

    /// The effective cap on delivery attempts, honoring `disable_delivery_retry`.
    pub fn effective_delivery_max_attempts(&self) -> u32 {
        if self.disable_delivery_retry {
            1
        } else {
            self.delivery_max_attempts
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.max_requests_per_batch, 50_000);
        assert_eq!(config.max_batch_size_bytes, 200 * 1024 * 1024);
        assert_eq!(config.delivery_max_attempts, 3);
        assert!(!config.disable_delivery_retry);
    }

    #[test]
    fn disable_delivery_retry_forces_single_attempt() {
        let mut config = Config::default();
        config.disable_delivery_retry = true;
        config.delivery_max_attempts = 5;
        assert_eq!(config.effective_delivery_max_attempts(), 1);
    }
}
