//! Rate-limiting and timer helpers for `Source` functors.
//!
//! None of this is runtime-enforced: a source that ignores [`RatePacer`] or
//! [`Deadline`] simply runs unthrottled or forever. These are conveniences
//! for writing the same duration-bound, tuple-rate-limited sources the
//! benchmark demos use, grounded in the pacing conventions of the original
//! WindFlow-style source functors (see SPEC_FULL.md §10).

use crate::context::RuntimeContext;
use crate::hash::stable_hash;
use crate::kernel::SourceKernel;
use crate::shipper::Shipper;
use std::thread;
use std::time::{Duration, Instant};

/// Busy-waits between successive `push` calls to hold a source to roughly
/// `tuples_per_second`. A source functor owns one of these and calls
/// [`RatePacer::pace`] once per emitted record.
pub struct RatePacer {
    interval: Duration,
    next_at: Instant,
}

impl RatePacer {
    pub fn new(tuples_per_second: f64) -> Self {
        let rate = tuples_per_second.max(f64::MIN_POSITIVE);
        Self {
            interval: Duration::from_secs_f64(1.0 / rate),
            next_at: Instant::now(),
        }
    }

    /// Sleeps until the next scheduled emission time, then schedules the one
    /// after. Call once per record, right before (or after) `shipper.push`.
    pub fn pace(&mut self) {
        let now = Instant::now();
        if now < self.next_at {
            thread::sleep(self.next_at - now);
        }
        self.next_at = (now.max(self.next_at)) + self.interval;
    }
}

/// A wall-clock cutoff a duration-bound source checks between records.
#[derive(Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Finds, for each of `lanes` downstream replicas, a key string whose
/// [`stable_hash`] routes to that exact lane under the same
/// `hash(key) % lanes` rule [`crate::transport::Router`] uses. Lets
/// [`tick_source`] deliver one tick per replica through ordinary keyed
/// routing instead of requiring a dedicated broadcast primitive in the
/// transport layer.
fn lane_probe_keys(lanes: usize) -> Vec<String> {
    (0..lanes)
        .map(|lane| {
            (0u64..)
                .map(|candidate| candidate.to_string())
                .find(|key| (stable_hash(key) as usize) % lanes == lane)
                .expect("hash range exceeds candidate search space")
        })
        .collect()
}

/// Builds a parallelism-1 timer source implementing the tick-tuple pattern
/// (SPEC_FULL.md §10, `trending_topics`): every `period`, emits one tick
/// record per replica of the downstream consumer (so a keyed consumer with
/// `downstream_parallelism` replicas sees a tick on every one of them,
/// rather than on whichever single replica the first tick happens to hash
/// to), until `run_for` elapses (or forever if `None`). Meant to be `merge`d
/// with a data source feeding the same downstream stage so the stage sees
/// interleaved data and timer records.
///
/// `make_tick` receives the routing key this tick must carry so it lands on
/// the intended replica; it is responsible for putting that key into
/// whichever field of `T` the consumer's `key_by` extracts.
pub fn tick_source<T, F>(
    name: impl Into<String>,
    period: Duration,
    run_for: Option<Duration>,
    downstream_parallelism: usize,
    make_tick: F,
) -> SourceKernel<T, impl FnMut(&mut Shipper<'_, T>, &RuntimeContext) -> anyhow::Result<()> + Clone>
where
    T: Send + 'static,
    F: FnMut(&str) -> T + Clone + Send + 'static,
{
    let deadline = run_for.map(Deadline::after);
    let probes = lane_probe_keys(downstream_parallelism.max(1));
    let mut make_tick = make_tick;
    SourceKernel::new(name, move |shipper, _ctx| {
        loop {
            if deadline.is_some_and(|d| d.expired()) {
                break;
            }
            for probe in &probes {
                shipper.push(make_tick(probe))?;
            }
            thread::sleep(period);
        }
        Ok(())
    })
    .parallelism(1)
}
