//! Relay metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider. When the host application
//! installs none, every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("hotline-relay"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for frames read from clients.
pub fn frames_received() -> Counter<u64> {
    meter()
        .u64_counter("relay.frames.received")
        .with_description("Total frames received from clients")
        .with_unit("frame")
        .build()
}

/// Counter for frames queued to a recipient.
pub fn frames_forwarded() -> Counter<u64> {
    meter()
        .u64_counter("relay.frames.forwarded")
        .with_description("Total frames forwarded to a recipient")
        .with_unit("frame")
        .build()
}

/// Counter for frames that were not forwarded.
pub fn frames_dropped() -> Counter<u64> {
    meter()
        .u64_counter("relay.frames.dropped")
        .with_description("Total frames dropped (malformed, unknown recipient, delivery failure)")
        .with_unit("frame")
        .build()
}

/// Counter for connections refused at accept time.
pub fn connections_rejected() -> Counter<u64> {
    meter()
        .u64_counter("relay.connections.rejected")
        .with_description("Total connections rejected by admission control")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for registered connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("relay.connections.active")
        .with_description("Current number of registered relay connections")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

pub fn record_frame_received() {
    frames_received().add(1, &[]);
}

pub fn record_frame_forwarded() {
    frames_forwarded().add(1, &[]);
}

/// Record a dropped frame with a short reason label.
pub fn record_frame_dropped(reason: &str) {
    frames_dropped().add(1, &[KeyValue::new("reason", reason.to_string())]);
}

pub fn record_connection_rejected(reason: &str) {
    connections_rejected().add(1, &[KeyValue::new("reason", reason.to_string())]);
}

pub fn record_connection_count(count: i64) {
    connections_active().record(count, &[]);
}
