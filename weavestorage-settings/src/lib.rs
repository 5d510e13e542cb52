//! Storage service settings.

use std::cmp::max;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

static KILOBYTE: u32 = 1024;
static MEGABYTE: u32 = KILOBYTE * KILOBYTE;
static GIGABYTE: u32 = MEGABYTE * 1_000;
static DEFAULT_MAX_POST_BYTES: u32 = 2 * MEGABYTE;
static DEFAULT_MAX_POST_RECORDS: u32 = 100;
static DEFAULT_MAX_RECORD_PAYLOAD_BYTES: u32 = 2 * MEGABYTE;
static DEFAULT_MAX_REQUEST_BYTES: u32 = DEFAULT_MAX_POST_BYTES + 4 * KILOBYTE;
static DEFAULT_MAX_TOTAL_BYTES: u32 = 100 * DEFAULT_MAX_POST_BYTES;
// also used as the maximum number of records a single GET may return.
pub static DEFAULT_MAX_TOTAL_RECORDS: u32 = 100 * DEFAULT_MAX_POST_RECORDS;
static DEFAULT_MAX_QUOTA_LIMIT: u32 = 2 * GIGABYTE;

#[derive(Clone, Debug, Default, Copy)]
pub struct Quota {
    pub size: usize,
    pub enabled: bool,
    pub enforced: bool,
}

/// Deadman configures how the `/__lbheartbeat__` health check endpoint fails
/// for special conditions.
///
/// We'll fail the check (usually temporarily) when the db pool maxes out its
/// connections, which notifies the orchestration system that it should back
/// off traffic to this instance until the check succeeds.
///
/// Optionally we can permanently fail the check after a set time period,
/// indicating that this instance should be evicted and replaced.
#[derive(Copy, Clone, Default, Debug)]
pub struct Deadman {
    pub max_size: u32,
    pub previous_count: usize,
    pub clock_start: Option<time::Instant>,
    pub expiry: Option<time::Instant>,
}

impl From<&Settings> for Deadman {
    fn from(settings: &Settings) -> Self {
        let expiry = settings.lbheartbeat_ttl.map(|lbheartbeat_ttl| {
            // jitter is a percentage of the ttl added to it: a 60s ttl w/ a
            // 10% jitter yields a final ttl between 60 and 66s
            let ttl = lbheartbeat_ttl as f32;
            let max_jitter = ttl * (settings.lbheartbeat_ttl_jitter as f32 * 0.01);
            let ttl = thread_rng().gen_range(ttl..ttl + max_jitter);
            time::Instant::now() + time::Duration::seconds(ttl as i64)
        });
        Deadman {
            max_size: settings.database_pool_max_size,
            expiry,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path (or `file:` URI) of the storage SQLite database.
    pub database_url: String,
    pub database_pool_max_size: u32,
    pub database_pool_min_idle: Option<u32>,
    /// Pool timeout when waiting for a slot to become available, in seconds
    pub database_pool_connection_timeout: Option<u32>,
    #[cfg(debug_assertions)]
    pub database_use_test_transactions: bool,

    /// Server-enforced limits for request payloads.
    pub limits: ServerLimits,

    pub statsd_label: String,

    pub enable_quota: bool,
    pub enforce_quota: bool,

    pub enabled: bool,

    /// Fail the `/__lbheartbeat__` healthcheck after running for this
    /// duration of time (in seconds) + jitter
    pub lbheartbeat_ttl: Option<u32>,
    /// Percentage of `lbheartbeat_ttl` time to "jitter" (adds additional,
    /// randomized time)
    pub lbheartbeat_ttl_jitter: u32,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            database_url: "weavestorage.db".to_string(),
            database_pool_max_size: 10,
            database_pool_min_idle: None,
            database_pool_connection_timeout: Some(30),
            #[cfg(debug_assertions)]
            database_use_test_transactions: false,
            limits: ServerLimits::default(),
            statsd_label: "weavestorage".to_string(),
            enable_quota: false,
            enforce_quota: false,
            enabled: true,
            lbheartbeat_ttl: None,
            lbheartbeat_ttl_jitter: 25,
        }
    }
}

impl Settings {
    /// Re-establish the invariants between the limit settings after any of
    /// them were overridden individually:
    /// `max_request_bytes > max_post_bytes >= max_record_payload_bytes`,
    /// `max_total_records >= max_post_records`,
    /// `max_total_bytes >= max_post_bytes`.
    pub fn normalize(&mut self) {
        let limits = &mut self.limits;
        limits.max_record_payload_bytes =
            limits.max_record_payload_bytes.min(limits.max_post_bytes);
        limits.max_request_bytes = max(limits.max_request_bytes, limits.max_post_bytes + 1);
        limits.max_total_records = max(limits.max_total_records, limits.max_post_records);
        limits.max_total_bytes = max(limits.max_total_bytes, limits.max_post_bytes);
    }
}

/// Server-enforced limits for request payloads.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerLimits {
    /// Maximum combined size of BSO payloads for a single request, in bytes.
    pub max_post_bytes: u32,

    /// Maximum BSO count for a single request.
    pub max_post_records: u32,

    /// Maximum size of an individual BSO payload, in bytes.
    pub max_record_payload_bytes: u32,

    /// Maximum `Content-Length` for all incoming requests, in bytes.
    pub max_request_bytes: u32,

    /// Maximum combined size of BSO payloads across a batch upload, in bytes.
    pub max_total_bytes: u32,

    /// Maximum BSO count across a batch upload.
    pub max_total_records: u32,

    /// Maximum per-user storage quota, in bytes.
    pub max_quota_limit: u32,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_post_bytes: DEFAULT_MAX_POST_BYTES,
            max_post_records: DEFAULT_MAX_POST_RECORDS,
            max_record_payload_bytes: DEFAULT_MAX_RECORD_PAYLOAD_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_total_records: DEFAULT_MAX_TOTAL_RECORDS,
            max_quota_limit: DEFAULT_MAX_QUOTA_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn normalize_reorders_limits() {
        let mut settings = Settings::default();
        settings.limits.max_post_bytes = 1024;
        settings.limits.max_record_payload_bytes = 4096;
        settings.limits.max_request_bytes = 512;
        settings.limits.max_total_records = 10;
        settings.limits.max_post_records = 100;
        settings.normalize();

        assert!(settings.limits.max_request_bytes > settings.limits.max_post_bytes);
        assert!(settings.limits.max_post_bytes >= settings.limits.max_record_payload_bytes);
        assert!(settings.limits.max_total_records >= settings.limits.max_post_records);
        assert!(settings.limits.max_total_bytes >= settings.limits.max_post_bytes);
    }
}
