//! Prometheus metrics.
//!
//! The registry renders as text through the server's own HTTP surface at
//! `/_metrics`; there is no separate metrics listener.

use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Metrics registry for the server.
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted, both ports.
    pub connections_total: Counter,
    /// Currently connected HTTP clients.
    pub http_connections: Gauge,
    /// Currently connected binary clients.
    pub binary_connections: Gauge,
    /// HTTP requests by command.
    pub http_requests_total: CounterVec,
    /// Binary messages dispatched by protocol.
    pub binary_messages_total: CounterVec,
    /// Bytes sent by the remote protocol.
    pub remote_sent_bytes: Counter,
    /// Bytes received by the remote protocol.
    pub remote_received_bytes: Counter,
    /// Bytes sent by the replication protocol.
    pub replication_sent_bytes: Counter,
    /// Bytes received by the replication protocol.
    pub replication_received_bytes: Counter,
    /// Errors by kind.
    pub errors_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "seekdb_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let http_connections = Gauge::with_opts(Opts::new(
            "seekdb_http_connections",
            "Currently connected HTTP clients",
        ))?;
        registry.register(Box::new(http_connections.clone()))?;

        let binary_connections = Gauge::with_opts(Opts::new(
            "seekdb_binary_connections",
            "Currently connected binary clients",
        ))?;
        registry.register(Box::new(binary_connections.clone()))?;

        let http_requests_total = CounterVec::new(
            Opts::new("seekdb_http_requests_total", "HTTP requests by command"),
            &["command"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let binary_messages_total = CounterVec::new(
            Opts::new(
                "seekdb_binary_messages_total",
                "Binary messages dispatched by protocol",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(binary_messages_total.clone()))?;

        let remote_sent_bytes = Counter::with_opts(Opts::new(
            "seekdb_remote_protocol_sent_bytes",
            "Bytes sent by the remote protocol",
        ))?;
        registry.register(Box::new(remote_sent_bytes.clone()))?;

        let remote_received_bytes = Counter::with_opts(Opts::new(
            "seekdb_remote_protocol_received_bytes",
            "Bytes received by the remote protocol",
        ))?;
        registry.register(Box::new(remote_received_bytes.clone()))?;

        let replication_sent_bytes = Counter::with_opts(Opts::new(
            "seekdb_replication_sent_bytes",
            "Bytes sent by the replication protocol",
        ))?;
        registry.register(Box::new(replication_sent_bytes.clone()))?;

        let replication_received_bytes = Counter::with_opts(Opts::new(
            "seekdb_replication_received_bytes",
            "Bytes received by the replication protocol",
        ))?;
        registry.register(Box::new(replication_received_bytes.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("seekdb_errors_total", "Errors by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            http_connections,
            binary_connections,
            http_requests_total,
            binary_messages_total,
            remote_sent_bytes,
            remote_received_bytes,
            replication_sent_bytes,
            replication_received_bytes,
            errors_total,
        })
    }

    /// Text exposition of the registry.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut out = Vec::new();
        if encoder.encode(&families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8(out).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_renders() {
        let metrics = Metrics::new().unwrap();
        metrics.connections_total.inc();
        metrics.http_connections.inc();
        metrics
            .http_requests_total
            .with_label_values(&["_search"])
            .inc();

        let text = metrics.render();
        assert!(text.contains("seekdb_connections_total"));
        assert!(text.contains("seekdb_http_requests_total"));
    }
}
