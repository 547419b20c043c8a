//! Tipping-bucket rain gauge tick counting.
//!
//! The gauge's reed switch closes once per bucket tip and the closure is
//! mechanically noisy: a single tip produces a burst of edges a few hundred
//! microseconds apart. [`RainGauge`] filters that burst down to one accepted
//! tick per tip and accumulates accepted ticks in a counter that the
//! measurement cycle drains once per iteration.
//!
//! ## Metrics
//!
//! `ticks_accepted`: Edges accepted as genuine bucket tips
//! `ticks_bounced`: Edges discarded as contact bounce
//!
//! The edge path performs no I/O; diagnostics are counters only.

use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use metrics::counter;

/// Microseconds elapsed from `earlier` to `later` on the hardware tick
/// clock.
///
/// Hardware ticks are a wrapping 32-bit microsecond counter that rolls over
/// roughly every 71.6 minutes; the wrapping subtraction stays correct across
/// a single rollover.
#[must_use]
pub fn tick_diff(earlier: u32, later: u32) -> u32 {
    later.wrapping_sub(earlier)
}

/// Debounced, drainable tick counter for one rain gauge.
///
/// Shared between two contexts: the GPIO monitor task calls
/// [`RainGauge::on_edge`] for every raw transition while the measurement
/// cycle calls [`RainGauge::drain`] once per iteration. The debounce state is
/// guarded by a mutex whose critical section is a single compare-and-update;
/// the counter is a plain atomic so a drain racing an edge never loses or
/// double-counts a tick.
#[derive(Debug)]
pub struct RainGauge {
    /// Minimum gap between accepted edges, microseconds.
    holdoff_micros: u32,
    /// Hardware tick of the last accepted edge. `None` until the first edge,
    /// which is accepted unconditionally.
    last_accepted: Mutex<Option<u32>>,
    ticks: AtomicU64,
}

impl RainGauge {
    /// Create a new [`RainGauge`] with the given debounce holdoff.
    #[must_use]
    pub fn new(holdoff_micros: u32) -> Self {
        Self {
            holdoff_micros,
            last_accepted: Mutex::new(None),
            ticks: AtomicU64::new(0),
        }
    }

    /// Record one raw edge observed at hardware tick `tick`.
    ///
    /// The first edge is always accepted. A later edge is accepted only when
    /// more than the holdoff has elapsed since the last accepted edge;
    /// anything closer is contact bounce and is dropped without error.
    /// Returns whether the edge was accepted.
    pub fn on_edge(&self, tick: u32) -> bool {
        let accepted = {
            let mut last = self
                .last_accepted
                .lock()
                .expect("gauge debounce lock poisoned");
            let accept = match *last {
                None => true,
                Some(prev) => tick_diff(prev, tick) > self.holdoff_micros,
            };
            if accept {
                *last = Some(tick);
            }
            accept
        };

        if accepted {
            self.ticks.fetch_add(1, Ordering::AcqRel);
            counter!("ticks_accepted").increment(1);
        } else {
            counter!("ticks_bounced").increment(1);
        }
        accepted
    }

    /// Read and reset the accumulated tick count as one atomic step.
    ///
    /// Establishes a happens-before boundary: every increment is observed by
    /// exactly one drain.
    pub fn drain(&self) -> u64 {
        self.ticks.swap(0, Ordering::AcqRel)
    }
}
