//! Metric names and helpers for the sync engine
//!
//! Everything goes through the `metrics` facade; installing an exporter is
//! left to the embedding process.

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use std::time::Instant;

pub const QUEUE_ENQUEUED: &str = "aeon.queue.enqueued";
pub const QUEUE_EVICTED: &str = "aeon.queue.evicted";
pub const QUEUE_REJECTED: &str = "aeon.queue.rejected";
pub const QUEUE_SYNCED: &str = "aeon.queue.synced";
pub const QUEUE_FAILED: &str = "aeon.queue.failed";
pub const QUEUE_PENDING: &str = "aeon.queue.pending";
pub const QUEUE_COMPACTED: &str = "aeon.queue.compacted";
pub const PROTOCOL_SENT: &str = "aeon.protocol.messages.sent";
pub const PROTOCOL_INVALID: &str = "aeon.protocol.messages.invalid";
pub const PROTOCOL_VERIFY_FAILED: &str = "aeon.protocol.verify.failed";
pub const CONFLICTS_DETECTED: &str = "aeon.conflicts.detected";
pub const CONFLICTS_RESOLVED: &str = "aeon.conflicts.resolved";
pub const COMPRESSION_BYTES_IN: &str = "aeon.compression.bytes_in";
pub const COMPRESSION_BYTES_OUT: &str = "aeon.compression.bytes_out";
pub const NODES_ONLINE: &str = "aeon.coordinator.nodes.online";
pub const FLUSH_DURATION: &str = "aeon.sync.flush.duration_ms";

/// Register descriptions for every metric the engine emits
pub fn init_metrics() {
    describe_counter!(QUEUE_ENQUEUED, "Operations accepted by the offline queue");
    describe_counter!(QUEUE_EVICTED, "Low-priority operations evicted to make room");
    describe_counter!(QUEUE_REJECTED, "Operations rejected because the queue was full");
    describe_counter!(QUEUE_SYNCED, "Operations acknowledged by a peer");
    describe_counter!(QUEUE_FAILED, "Operations that exhausted their retry budget");
    describe_gauge!(QUEUE_PENDING, "Operations currently pending");
    describe_counter!(QUEUE_COMPACTED, "Synced operations removed by compaction");
    describe_counter!(PROTOCOL_SENT, "Protocol messages built for sending");
    describe_counter!(PROTOCOL_INVALID, "Incoming messages dropped as malformed");
    describe_counter!(PROTOCOL_VERIFY_FAILED, "Messages that failed signature or decryption checks");
    describe_counter!(CONFLICTS_DETECTED, "Conflicts detected between local and remote writes");
    describe_counter!(CONFLICTS_RESOLVED, "Conflicts resolved, automatically or by strategy");
    describe_counter!(COMPRESSION_BYTES_IN, "Bytes handed to the compression engine");
    describe_counter!(COMPRESSION_BYTES_OUT, "Bytes produced by the compression engine");
    describe_gauge!(NODES_ONLINE, "Registered nodes with a recent heartbeat");
    describe_histogram!(FLUSH_DURATION, "Queue flush round-trip duration in milliseconds");
}

/// Records elapsed milliseconds into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now() }
    }

    pub fn stop(self) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(self.name).record(elapsed_ms);
        elapsed_ms
    }
}
