//! The structured-log channel (§10.3): single-line JSON documents
//! (`monitoring_update`, `crawl_halted`) written independently of the
//! ambient `tracing` diagnostic stream. Both the regulator and the logger
//! emit through here so there is exactly one place that formats the wire
//! shape of these documents.

use serde::Serialize;

/// Serializes `event` and writes it as a single tracing record on the
/// `structured` target, at a level distinct from ordinary diagnostics.
/// Consumers that want the crawl's own telemetry product (as opposed to
/// process logs) filter on that target.
pub fn emit<T: Serialize>(event: &T) {
    match serde_json::to_string(event) {
        Ok(line) => tracing::info!(target: "structured", "{}", line),
        Err(e) => tracing::warn!(error = %e, "failed to serialize structured event"),
    }
}
