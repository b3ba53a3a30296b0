//! The logging capability.
//!
//! Notices, parameter-status updates and outbound query text are side
//! channels of the protocol: readers consume them at any point of a
//! response and hand them here without touching the caller's data stream.
//! The logger travels with the connection rather than living in global
//! state, which keeps the engine testable.

use crate::error::ServerError;

/// Receives protocol side-channel payloads.
///
/// All methods default to dropping the payload, so implementations pick the
/// events they care about.
pub trait ProtocolLogger {
    /// A NoticeResponse, parsed into the same shape as a server error.
    fn notice(&self, _notice: &ServerError) {}

    /// A ParameterStatus update (e.g. `client_encoding`, `server_version`).
    fn parameter_status(&self, _name: &str, _value: &str) {}

    /// The SQL text of an outbound simple query, after formatting.
    fn query(&self, _sql: &[u8]) {}
}

/// Routes side-channel payloads to `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl ProtocolLogger for TracingLogger {
    fn notice(&self, notice: &ServerError) {
        tracing::warn!(target: "pg_proto", %notice, "server notice");
    }

    fn parameter_status(&self, name: &str, value: &str) {
        tracing::debug!(target: "pg_proto", name, value, "parameter status");
    }

    fn query(&self, sql: &[u8]) {
        tracing::debug!(target: "pg_proto", sql = %String::from_utf8_lossy(sql), "query");
    }
}

/// Drops every payload. Useful in tests and benchmarks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopLogger;

impl ProtocolLogger for NopLogger {}
