//! Telemetry metric name constants.
//!
//! Consumers install their own `metrics` recorder (e.g. prometheus, statsd);
//! without a recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `orgcheck_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `operation`: gateway operation (e.g. "soql_query", "dependencies_query")
//! - `status`: outcome, "ok" or "error"
//! - `alias`: dataset alias
//! - `reason`: why a cache entry was purged

/// Total remote calls issued through the gateway.
///
/// Labels: `operation`, `status` ("ok" | "error").
pub const API_CALLS_TOTAL: &str = "orgcheck_api_calls_total";

/// Remote call duration in seconds.
///
/// Labels: `operation`.
pub const API_CALL_DURATION_SECONDS: &str = "orgcheck_api_call_duration_seconds";

/// Total rate guard trips.
///
/// Labels: `operation`.
pub const QUOTA_TRIPS_TOTAL: &str = "orgcheck_quota_trips_total";

/// Total persistent cache hits.
pub const CACHE_HITS_TOTAL: &str = "orgcheck_cache_hits_total";

/// Total persistent cache misses (absent, expired or unreadable entries).
pub const CACHE_MISSES_TOTAL: &str = "orgcheck_cache_misses_total";

/// Total cache entries purged by self-healing.
///
/// Labels: `reason` ("missing_metadata" | "missing_data" | "undecodable").
pub const CACHE_PURGES_TOTAL: &str = "orgcheck_cache_purges_total";

/// Total dataset retrievals executed by the orchestrator (cache misses only).
///
/// Labels: `alias`, `status` ("ok" | "error").
pub const DATASET_RETRIEVALS_TOTAL: &str = "orgcheck_dataset_retrievals_total";
