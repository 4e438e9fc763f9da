//! Networking core metrics.
//!
//! Counters for connection lifecycle, byte throughput, and the write-path
//! state machine. Registered with metriken for exposition by whatever admin
//! surface the embedding server runs.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "lineloop/connections/accepted",
    description = "Total client connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "lineloop/connections/closed",
    description = "Total client connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "lineloop/connections/active",
    description = "Currently active client connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "lineloop/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "lineloop/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Write path ───────────────────────────────────────────────────

#[metric(
    name = "lineloop/responses/direct",
    description = "Responses written directly to the socket"
)]
pub static RESPONSES_DIRECT: Counter = Counter::new();

#[metric(
    name = "lineloop/responses/buffered",
    description = "Responses that hit backpressure and queued in the output ring"
)]
pub static RESPONSES_BUFFERED: Counter = Counter::new();

// ── Event loop ───────────────────────────────────────────────────

#[metric(
    name = "lineloop/commands/processed",
    description = "Async commands drained inside the event loop"
)]
pub static COMMANDS_PROCESSED: Counter = Counter::new();

#[metric(
    name = "lineloop/udp/events_ignored",
    description = "Readiness events on the reserved UDP endpoint"
)]
pub static UDP_EVENTS_IGNORED: Counter = Counter::new();
