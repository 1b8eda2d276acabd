//! A small timer queue keyed by absolute deadline.
//!
//! The event loop doesn't block in a blind `sleep` — it computes the
//! earliest pending deadline and caps its readiness wait to that, then
//! calls [`TimerQueue::run`] to fire everything whose deadline has passed.
//! This mirrors the original tool's own `test_timer`/`stats_timer`/
//! `reporter_timer` triad plus the one-shot "omit" timer, generalized into
//! one queue instead of four separate fields.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::time::Duration;

use tokio::time::Instant;

/// Identifies what a fired timer is for, so the caller can dispatch
/// without juggling closures across an `.await` boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Overall test duration, or the post-expiry grace period waiting for
    /// the client to notice and send `TEST_END`.
    Duration,
    /// Periodic per-stream stats accumulation.
    Stats,
    /// Periodic reporter callback invocation.
    Reporter,
    /// One-shot: ends the warm-up/omit window, resets interval counters and
    /// realigns the stats/reporter timers' phase.
    Omit,
    /// Periodic: checks that a receive-capable session is still seeing
    /// bytes arrive, so a dead sender can be detected and reported as
    /// `IENOMSG` instead of hanging until the duration timer's grace period.
    ReceiveWatchdog,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline: Instant,
    kind: TimerKind,
    period: Option<Duration>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

/// A priority queue of timers. Periodic timers re-enqueue themselves when
/// they fire; one-shot timers don't.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BinaryHeap<Entry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            entries: BinaryHeap::new(),
        }
    }

    /// Schedule a one-shot timer `duration` from now.
    pub fn schedule_once(&mut self, now: Instant, kind: TimerKind, duration: Duration) {
        self.entries.push(Entry {
            deadline: now + duration,
            kind,
            period: None,
        });
    }

    /// Schedule a periodic timer firing every `period`, starting one period
    /// from now.
    pub fn schedule_periodic(&mut self, now: Instant, kind: TimerKind, period: Duration) {
        self.entries.push(Entry {
            deadline: now + period,
            kind,
            period: Some(period),
        });
    }

    /// Drop every timer of `kind` from the queue.
    pub fn cancel(&mut self, kind: TimerKind) {
        let remaining: BinaryHeap<Entry> = self.entries.drain().filter(|e| e.kind != kind).collect();
        self.entries = remaining;
    }

    /// The earliest pending deadline, if any — the event loop caps its
    /// readiness wait to this.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.peek().map(|e| e.deadline)
    }

    /// Pop and return every timer kind whose deadline is `<= now`,
    /// re-enqueueing periodic ones for their next period.
    pub fn run(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        while let Some(entry) = self.entries.peek().copied() {
            if entry.deadline > now {
                break;
            }
            self.entries.pop();
            fired.push(entry.kind);
            if let Some(period) = entry.period {
                self.entries.push(Entry {
                    deadline: now + period,
                    kind: entry.kind,
                    period: Some(period),
                });
            }
        }
        fired
    }

    /// Reschedule every pending timer of `kind` to fire `duration` from
    /// `now`, keeping its periodicity. Used by the omit timer to realign the
    /// stats/reporter timers' phase once the warm-up window ends.
    pub fn reset(&mut self, now: Instant, kind: TimerKind, duration: Duration) {
        let period = self.entries.iter().find(|e| e.kind == kind).and_then(|e| e.period);
        self.cancel(kind);
        self.entries.push(Entry {
            deadline: now + duration,
            kind,
            period,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order_regardless_of_schedule_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.schedule_once(now, TimerKind::Reporter, Duration::from_secs(5));
        queue.schedule_once(now, TimerKind::Duration, Duration::from_secs(1));
        queue.schedule_once(now, TimerKind::Stats, Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(2)).await;
        let fired = queue.run(Instant::now());
        assert_eq!(fired, vec![TimerKind::Duration]);

        tokio::time::advance(Duration::from_secs(2)).await;
        let fired = queue.run(Instant::now());
        assert_eq!(fired, vec![TimerKind::Stats]);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_reenqueues_itself() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.schedule_periodic(now, TimerKind::Stats, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(queue.run(Instant::now()), vec![TimerKind::Stats]);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(queue.run(Instant::now()), vec![TimerKind::Stats]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_removes_only_the_named_kind() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.schedule_once(now, TimerKind::Duration, Duration::from_secs(1));
        queue.schedule_once(now, TimerKind::Stats, Duration::from_secs(1));
        queue.cancel(TimerKind::Duration);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(queue.run(Instant::now()), vec![TimerKind::Stats]);
    }

    #[test]
    fn empty_queue_has_no_next_deadline() {
        assert!(TimerQueue::new().next_deadline().is_none());
    }
}
