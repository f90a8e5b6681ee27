//! Tracing and logging setup shared by the worker binaries.

/// Initialize process-wide tracing/logging.
///
/// `json` switches the formatter to one JSON object per line. Safe to call
/// multiple times; subsequent calls become no-ops.
pub fn init(json: bool) {
    tracing::init(json);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
