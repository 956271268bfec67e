//! Prometheus metrics: a `Registry` plus a handful of named counters/
//! histograms/gauges registered once at startup.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct RelayMetrics {
    registry: Registry,
    pub connections_current: IntGauge,
    pub connections_total: IntCounter,
    pub events_received: IntCounterVec,
    pub events_accepted: IntCounter,
    pub events_rejected: IntCounterVec,
    pub subscriptions_current: IntGauge,
    pub bans_active: IntGauge,
    pub event_processing_seconds: Histogram,
    pub query_seconds: Histogram,
    pub reconcile_sessions_current: IntGauge,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_current = IntGauge::new("relay_connections_current", "open websocket connections").unwrap();
        let connections_total = IntCounter::new("relay_connections_total", "websocket connections accepted").unwrap();
        let events_received = IntCounterVec::new(
            Opts::new("relay_events_received_total", "EVENT messages received by kind"),
            &["kind"],
        )
        .unwrap();
        let events_accepted = IntCounter::new("relay_events_accepted_total", "events accepted into storage").unwrap();
        let events_rejected = IntCounterVec::new(
            Opts::new("relay_events_rejected_total", "events rejected by reason class"),
            &["reason"],
        )
        .unwrap();
        let subscriptions_current = IntGauge::new("relay_subscriptions_current", "open subscriptions").unwrap();
        let bans_active = IntGauge::new("relay_bans_active", "currently banned client ips").unwrap();
        let event_processing_seconds = Histogram::with_opts(HistogramOpts::new(
            "relay_event_processing_seconds",
            "time to validate and persist one event",
        ))
        .unwrap();
        let query_seconds =
            Histogram::with_opts(HistogramOpts::new("relay_query_seconds", "time to answer one REQ filter set"))
                .unwrap();
        let reconcile_sessions_current =
            IntGauge::new("relay_reconcile_sessions_current", "open negentropy reconciliation sessions").unwrap();

        for c in [&connections_total] {
            registry.register(Box::new(c.clone())).unwrap();
        }
        registry.register(Box::new(connections_current.clone())).unwrap();
        registry.register(Box::new(events_received.clone())).unwrap();
        registry.register(Box::new(events_accepted.clone())).unwrap();
        registry.register(Box::new(events_rejected.clone())).unwrap();
        registry.register(Box::new(subscriptions_current.clone())).unwrap();
        registry.register(Box::new(bans_active.clone())).unwrap();
        registry.register(Box::new(event_processing_seconds.clone())).unwrap();
        registry.register(Box::new(query_seconds.clone())).unwrap();
        registry.register(Box::new(reconcile_sessions_current.clone())).unwrap();

        Self {
            registry,
            connections_current,
            connections_total,
            events_received,
            events_accepted,
            events_rejected,
            subscriptions_current,
            bans_active,
            event_processing_seconds,
            query_seconds,
            reconcile_sessions_current,
        }
    }

    pub fn record_received(&self, kind: u32) {
        self.events_received.with_label_values(&[&kind.to_string()]).inc();
    }

    pub fn record_rejected(&self, reason_class: &str) {
        self.events_rejected.with_label_values(&[reason_class]).inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).unwrap_or_default();
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_names() {
        let metrics = RelayMetrics::new();
        metrics.connections_total.inc();
        metrics.record_received(1);
        let out = metrics.render();
        assert!(out.contains("relay_connections_total"));
        assert!(out.contains("relay_events_received_total"));
    }
}
