//! Crate-wide constants for the notebook SDK.
//!
//! This module centralizes all magic numbers and protocol constants to
//! improve maintainability and discoverability. Constants are grouped by
//! domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Identity**: SDK version reported to the server
//! - **Timeouts**: connection and handshake deadlines
//! - **Reconnection**: socket backoff parameters
//! - **Requests**: retry, rate-limit, and queue parameters
//! - **Search**: default text-search options

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// SDK version appended to the duplex channel URL as `sdk_version`.
///
/// The server uses it to track which client versions are in the wild and
/// gate compatibility if needed.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent header sent with management API requests.
///
/// Includes the SDK version so the service can track which versions are
/// in the wild. Suppressed when the client opts out of telemetry.
pub fn user_agent() -> String {
    format!("notebook-sdk/{SDK_VERSION}")
}

/// Default base URL for the notebook management HTTP API.
pub const DEFAULT_API_URL: &str = "https://api.notebooks.dev";

// ============================================================================
// Timeouts
// ============================================================================

/// Maximum time a single connection attempt may take before it is
/// abandoned and surfaced as a connection-timeout error.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client request timeout for notebook management API calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum time to wait for the server's `notebook.initialized` event
/// after forcing a connection.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Reconnection (socket layer)
// ============================================================================

/// Initial reconnect backoff after an unexpected close.
pub const SOCKET_BACKOFF_INITIAL: Duration = Duration::from_millis(200);

/// Upper bound for the reconnect backoff.
pub const SOCKET_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Backoff multiplier per failed attempt.
pub const SOCKET_BACKOFF_FACTOR: u32 = 2;

/// Maximum jitter added to each backoff wait, in milliseconds.
pub const SOCKET_BACKOFF_JITTER_MS: u64 = 100;

// ============================================================================
// Requests (transport layer)
// ============================================================================

/// Keepalive ping interval. A `ping` invocation is issued this often while
/// the connection is open.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Lower/upper bounds accepted for a configured ping interval.
pub const PING_INTERVAL_MIN: Duration = Duration::from_secs(1);
/// See [`PING_INTERVAL_MIN`].
pub const PING_INTERVAL_MAX: Duration = Duration::from_secs(300);

/// Missed ping intervals after which the connection is considered
/// unhealthy.
pub const PONG_UNHEALTHY_INTERVALS: u32 = 2;

/// Missed ping intervals after which a reconnect is forced.
pub const PONG_RECONNECT_INTERVALS: u32 = 3;

/// Default number of request retries on transient connection errors.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Upper bound accepted for a configured retry count.
pub const MAX_RETRIES_LIMIT: u32 = 50;

/// Base delay for the request retry backoff.
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap for the request retry backoff.
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Maximum jitter added to each retry wait, in milliseconds.
pub const RETRY_BACKOFF_JITTER_MS: u64 = 250;

/// Sliding-window rate limit: at most this many requests...
pub const RATE_LIMIT_MAX: usize = 50;

/// ...within this window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Maximum number of requests held while the connection is down.
pub const QUEUE_LIMIT: usize = 100;

/// Maximum age of a queued request before it is rejected as expired.
pub const QUEUE_MAX_AGE: Duration = Duration::from_secs(30);

// ============================================================================
// Search defaults
// ============================================================================

/// Default maximum number of text-search results.
pub const SEARCH_MAX_RESULTS: u32 = 5;

/// Default lines of context before and after each match.
pub const SEARCH_CONTEXT_LINES: u32 = 2;

/// Default preview size: lines per match.
pub const SEARCH_PREVIEW_LINES: u32 = 5;

/// Default preview size: characters per line.
pub const SEARCH_PREVIEW_CHARS: u32 = 1000;

/// Directories excluded from `find` and `search` by default.
pub const SEARCH_DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "vendor",
    "storage",
    "dist",
    "build",
];

// ============================================================================
// Beacon defaults
// ============================================================================

/// Number of ready-handshake attempts before giving up.
pub const BEACON_HANDSHAKE_TRIES: u32 = 3;

/// Initial backoff between handshake attempts.
pub const BEACON_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Cap for the handshake backoff.
pub const BEACON_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Maximum jitter added to each handshake wait, in milliseconds.
pub const BEACON_BACKOFF_JITTER_MS: u64 = 250;

/// Default timeout for a beacon request/response pair.
pub const BEACON_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Settle delay after the preview frame reports loaded.
pub const BEACON_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Extra margin added to a debug capture timeout.
pub const BEACON_DEBUG_MARGIN: Duration = Duration::from_secs(5);
