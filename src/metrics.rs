#![forbid(unsafe_code)]

// Server metrics - lock-free AtomicU64 counters and Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 10] = [
    50,         // 50µs
    100,        // 100µs
    250,        // 250µs
    500,        // 500µs
    1_000,      // 1ms
    5_000,      // 5ms
    10_000,     // 10ms
    50_000,     // 50ms
    100_000,    // 100ms
    1_000_000,  // 1s
];

const BUCKET_LABELS: [&str; 10] = [
    "0.00005", "0.0001", "0.00025", "0.0005", "0.001",
    "0.005", "0.01", "0.05", "0.1", "1",
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// Cumulative bucket counters: bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    /// +Inf bucket (total count)
    count: AtomicU64,
    /// Sum of all observations in microseconds
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    /// Record a duration observation.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    /// Render in Prometheus text exposition format.
    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        // Convert microseconds to seconds with 6 decimal places
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    connections_total: AtomicU64,
    events_received_total: AtomicU64,
    deliveries_total: AtomicU64,
    rejections_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    rooms_reclaimed_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    host_failovers_total: AtomicU64,
    chat_messages_total: AtomicU64,
    uploads_total: AtomicU64,
    outbound_overflows_total: AtomicU64,

    // Gauge
    connections_active: AtomicU64,

    // Histogram
    event_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                events_received_total: AtomicU64::new(0),
                deliveries_total: AtomicU64::new(0),
                rejections_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                rooms_reclaimed_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                host_failovers_total: AtomicU64::new(0),
                chat_messages_total: AtomicU64::new(0),
                uploads_total: AtomicU64::new(0),
                outbound_overflows_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                event_handling: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_events_received(&self) {
        self.inner.events_received_total.fetch_add(1, Relaxed);
    }

    pub fn add_deliveries(&self, n: u64) {
        self.inner.deliveries_total.fetch_add(n, Relaxed);
    }

    pub fn inc_rejections(&self) {
        self.inner.rejections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn add_rooms_reclaimed(&self, n: u64) {
        self.inner.rooms_reclaimed_total.fetch_add(n, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_host_failovers(&self) {
        self.inner.host_failovers_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chat_messages(&self) {
        self.inner.chat_messages_total.fetch_add(1, Relaxed);
    }

    pub fn inc_uploads(&self) {
        self.inner.uploads_total.fetch_add(1, Relaxed);
    }

    pub fn inc_outbound_overflows(&self) {
        self.inner.outbound_overflows_total.fetch_add(1, Relaxed);
    }

    pub fn host_failovers(&self) -> u64 {
        self.inner.host_failovers_total.load(Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.inner.rejections_total.load(Relaxed)
    }

    // --- Gauge ---

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    /// This guarantees the gauge is decremented even if the caller panics.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    // --- Histogram ---

    pub fn observe_event_handling(&self, duration: Duration) {
        self.inner.event_handling.observe(duration);
    }

    // --- Prometheus rendering ---

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active` and `participants_active` are passed in from RoomManager (on-demand gauges).
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        // Counters
        render_counter(&mut out, "screenrelay_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_events_received_total", "Total events received from clients", i.events_received_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_deliveries_total", "Total events queued to recipients", i.deliveries_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_rejections_total", "Total events rejected back to their sender", i.rejections_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_errors_total", "Total internal errors caught at the event boundary", i.errors_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_rooms_reclaimed_total", "Total rooms removed by the sweeper or grace timer", i.rooms_reclaimed_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_leaves_total", "Total room leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_host_failovers_total", "Total host promotions after a host left", i.host_failovers_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_chat_messages_total", "Total chat messages accepted", i.chat_messages_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_uploads_total", "Total files shared", i.uploads_total.load(Relaxed));
        render_counter(&mut out, "screenrelay_outbound_overflows_total", "Total connections dropped for a full outbound queue", i.outbound_overflows_total.load(Relaxed));

        // Gauges
        render_gauge(&mut out, "screenrelay_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "screenrelay_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "screenrelay_participants_active", "Currently active participants", participants_active as u64);

        // Histogram
        i.event_handling.render(
            "screenrelay_event_handling_seconds",
            "Event handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
/// Prevents gauge underflow/drift if the connection handler panics.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_active_connections() {
        let metrics = ServerMetrics::new();
        let guard = metrics.connection_active_guard();
        assert!(metrics.render_prometheus(0, 0).contains("screenrelay_connections_active 1"));
        drop(guard);
        assert!(metrics.render_prometheus(0, 0).contains("screenrelay_connections_active 0"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_event_handling(Duration::from_micros(80));
        metrics.observe_event_handling(Duration::from_millis(2));
        let out = metrics.render_prometheus(2, 5);
        assert!(out.contains("screenrelay_event_handling_seconds_bucket{le=\"0.00005\"} 0"));
        assert!(out.contains("screenrelay_event_handling_seconds_bucket{le=\"0.0001\"} 1"));
        assert!(out.contains("screenrelay_event_handling_seconds_bucket{le=\"0.005\"} 2"));
        assert!(out.contains("screenrelay_event_handling_seconds_count 2"));
        assert!(out.contains("screenrelay_rooms_active 2"));
        assert!(out.contains("screenrelay_participants_active 5"));
    }
}
