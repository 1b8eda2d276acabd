//! A single data stream and the counters its worker publishes.
//!
//! Counters are plain atomics rather than a mutex-guarded struct: the owning
//! worker task is the only writer, and the event loop / timers only ever
//! need a stale-but-monotonic snapshot to fold into a periodic report. The
//! one non-integer value a worker needs to publish, jitter (an EWMA in
//! milliseconds), is carried across the same boundary as an `f64`
//! bit-pattern in an `AtomicU64`, since there's no `AtomicF64`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpStream, UdpSocket};

/// Which way bytes flow on this stream, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server reads from the stream.
    Receiving,
    /// Server writes to the stream.
    Sending,
}

/// The transport backing a data stream.
pub enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Atomically-published counters for one data stream. Shared between the
/// worker task that owns the stream and the event loop / stats timer that
/// reads a snapshot of it.
#[derive(Debug, Default)]
pub struct StreamCounters {
    pub bytes_this_interval: AtomicU64,
    pub bytes_total: AtomicU64,
    pub packets_this_interval: AtomicU64,
    pub packets_total: AtomicU64,
    pub lost_this_interval: AtomicU64,
    pub lost_total: AtomicU64,
    pub out_of_order_total: AtomicU64,
    jitter_millis_bits: AtomicU64,
    /// Set by the worker when it hits a hard error or clean EOF.
    pub done: AtomicBool,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_this_interval.fetch_add(n, Ordering::Relaxed);
        self.bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_packet(&self) {
        self.packets_this_interval.fetch_add(1, Ordering::Relaxed);
        self.packets_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` additional lost packets, saturating rather than wrapping.
    pub fn add_lost(&self, n: u64) {
        saturating_add(&self.lost_this_interval, n);
        saturating_add(&self.lost_total, n);
    }

    /// Decrement the lost counters by one, used when a packet the loss
    /// accounting had marked missing turns out to have merely arrived out
    /// of order. Never goes below zero.
    pub fn undo_one_lost(&self) {
        saturating_sub_one(&self.lost_this_interval);
        saturating_sub_one(&self.lost_total);
    }

    pub fn jitter_millis(&self) -> f64 {
        f64::from_bits(self.jitter_millis_bits.load(Ordering::Relaxed))
    }

    pub fn set_jitter_millis(&self, value: f64) {
        self.jitter_millis_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Reset the per-interval counters, leaving the cumulative totals
    /// alone. Called by the stats timer after folding the interval into a
    /// report.
    pub fn reset_interval(&self) {
        self.bytes_this_interval.store(0, Ordering::Relaxed);
        self.packets_this_interval.store(0, Ordering::Relaxed);
        self.lost_this_interval.store(0, Ordering::Relaxed);
    }

    /// Clear the cumulative per-session totals. Called once, when the omit
    /// warm-up window ends, so the final/aggregate results exclude
    /// warm-up traffic — counting runs normally through the omit window
    /// itself (bytes are still flowing, so watchdogs and live reporting see
    /// real progress), and this is what actually discards it.
    pub fn reset_totals(&self) {
        self.bytes_total.store(0, Ordering::Relaxed);
        self.packets_total.store(0, Ordering::Relaxed);
        self.lost_total.store(0, Ordering::Relaxed);
        self.out_of_order_total.store(0, Ordering::Relaxed);
    }
}

fn saturating_add(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_add(n)));
}

fn saturating_sub_one(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        if v > 0 {
            Some(v - 1)
        } else {
            None
        }
    });
}

/// One data stream belonging to a test session. Owned exclusively by the
/// session until its worker task is spawned, at which point the transport
/// moves into the task and only `counters` remains behind for reporting.
pub struct Stream {
    pub id: u32,
    pub direction: Direction,
    pub transport: Transport,
    pub counters: Arc<StreamCounters>,
}

impl Stream {
    pub fn new(id: u32, direction: Direction, transport: Transport) -> Self {
        Self {
            id,
            direction,
            transport,
            counters: Arc::new(StreamCounters::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_counter_never_goes_negative() {
        let counters = StreamCounters::new();
        counters.undo_one_lost();
        assert_eq!(counters.lost_total.load(Ordering::Relaxed), 0);
        counters.add_lost(2);
        counters.undo_one_lost();
        counters.undo_one_lost();
        counters.undo_one_lost();
        assert_eq!(counters.lost_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn jitter_round_trips_through_bit_pattern() {
        let counters = StreamCounters::new();
        counters.set_jitter_millis(1.2345);
        assert!((counters.jitter_millis() - 1.2345).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_interval_leaves_totals_alone() {
        let counters = StreamCounters::new();
        counters.add_bytes(100);
        counters.reset_interval();
        assert_eq!(counters.bytes_this_interval.load(Ordering::Relaxed), 0);
        assert_eq!(counters.bytes_total.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn reset_totals_clears_cumulative_counters() {
        let counters = StreamCounters::new();
        counters.add_bytes(100);
        counters.add_packet();
        counters.reset_totals();
        assert_eq!(counters.bytes_total.load(Ordering::Relaxed), 0);
        assert_eq!(counters.packets_total.load(Ordering::Relaxed), 0);
        assert_eq!(counters.lost_total.load(Ordering::Relaxed), 0);
        assert_eq!(counters.out_of_order_total.load(Ordering::Relaxed), 0);
    }
}
