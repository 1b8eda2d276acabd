//! CPU utilization sampling and the reporter/stats callback surface.
//!
//! CPU sampling is best-effort: it reads `/proc/self/stat` on Linux and
//! returns `None` everywhere else, which is a platform limitation to
//! document, not an error to propagate. The reporter surface is a single
//! trait object an embedding caller implements; [`NoopHooks`] is the
//! default so the core runs (and tests) without any UI attached, per the
//! "capability set" shape the original design favors over a grab-bag of
//! optional function pointers.

use std::sync::Arc;

use crate::protocol::{IntervalResult, ServerResults};

/// A CPU time sample, in seconds, suitable for differencing across an
/// interval and converting to a utilization percentage.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuSample {
    pub user_secs: f64,
    pub system_secs: f64,
}

/// Sample this process's CPU time. Returns `None` on platforms without a
/// `/proc/self/stat`.
#[cfg(target_os = "linux")]
pub fn sample_cpu() -> Option<CpuSample> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Field 14 is utime, field 15 is stime, in clock ticks; fields are
    // space-separated but field 2 (comm) may itself contain spaces wrapped
    // in parens, so split after the closing paren.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // After the comm field, state is field index 0, utime is index 11, stime is index 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = clock_ticks_per_second();
    Some(CpuSample {
        user_secs: utime as f64 / ticks_per_sec,
        system_secs: stime as f64 / ticks_per_sec,
    })
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_second() -> f64 {
    let rate = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if rate > 0 {
        rate as f64
    } else {
        100.0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn sample_cpu() -> Option<CpuSample> {
    None
}

/// Convert two samples taken `wall_secs` apart into a utilization
/// percentage (0-100, can exceed 100 across multiple cores).
pub fn cpu_utilization_percent(start: CpuSample, end: CpuSample, wall_secs: f64) -> f64 {
    if wall_secs <= 0.0 {
        return 0.0;
    }
    let cpu_secs = (end.user_secs - start.user_secs) + (end.system_secs - start.system_secs);
    (cpu_secs / wall_secs) * 100.0
}

/// Capability set an embedding caller can supply to observe a session's
/// lifecycle and periodic results. Every method has a no-op default so a
/// caller only overrides what it cares about.
pub trait ReporterHooks: Send + Sync {
    fn on_connect(&self, _client: std::net::SocketAddr) {}
    fn on_new_stream(&self, _stream_id: u32) {}
    fn on_interval(&self, _result: &IntervalResult) {}
    fn on_test_finish(&self, _results: &ServerResults) {}
}

/// The default [`ReporterHooks`] implementation: observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ReporterHooks for NoopHooks {}

/// A shared, dynamically-dispatched hook set, as sessions hold it.
pub type Hooks = Arc<dyn ReporterHooks>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_wall_time_reports_zero_utilization() {
        let sample = CpuSample::default();
        assert_eq!(cpu_utilization_percent(sample, sample, 0.0), 0.0);
    }

    #[test]
    fn full_core_use_over_one_second_is_100_percent() {
        let start = CpuSample::default();
        let end = CpuSample {
            user_secs: 1.0,
            system_secs: 0.0,
        };
        assert!((cpu_utilization_percent(start, end, 1.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn noop_hooks_accept_every_call_without_panicking() {
        let hooks: Hooks = Arc::new(NoopHooks);
        hooks.on_connect("127.0.0.1:1234".parse().unwrap());
        hooks.on_new_stream(1);
    }
}
