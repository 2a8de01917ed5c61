//! Firing-time computation and delivery.
//!
//! The trigger is a local monotonic instant chosen so the first byte of
//! the request reaches the SIS exactly when its own clock reads the target
//! time. Delivery sleeps coarsely while far out, then spins the final
//! stretch on the monotonic clock with no sleeping primitive at all.

use std::time::{Duration, Instant};

use crate::cancel::CancelFlag;

/// Width of the terminal busy-wait window. Wide enough to absorb the
/// coarsest timer granularity any supported host wakes us with.
pub const BUSY_WAIT_WINDOW: Duration = Duration::from_millis(50);

/// Longest coarse sleep slice; bounds cancellation latency and sets the
/// countdown cadence.
pub const COARSE_SLICE: Duration = Duration::from_millis(100);

/// Local trigger epoch for a target moment on the server clock.
///
/// `server_offset` is server minus local; subtracting it converts the
/// target to local wall time, and dispatching one one-way trip early puts
/// the request's arrival on the boundary. The buffer trades a few
/// milliseconds of lateness against early-arrival rejection.
pub fn compute_trigger_epoch(
    target_epoch: f64,
    server_offset: f64,
    rtt_one_way: f64,
    safety_buffer: f64,
) -> f64 {
    target_epoch - server_offset - rtt_one_way + safety_buffer
}

/// Spins until `deadline`. Returns `false` if the cancel flag was raised
/// first. No suspension points: this must only be entered inside the
/// busy-wait window.
pub fn busy_wait_until(deadline: Instant, cancel: &CancelFlag) -> bool {
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return false;
        }
        std::hint::spin_loop();
    }
    true
}

/// Best-effort scheduling priority raise for the firing window. Returns a
/// guard that restores the previous priority on drop. Failure is logged
/// and ignored; correctness never depends on it.
pub fn raise_priority() -> PriorityGuard {
    PriorityGuard::acquire()
}

pub struct PriorityGuard {
    #[cfg(unix)]
    previous: Option<i32>,
}

impl PriorityGuard {
    #[cfg(unix)]
    fn acquire() -> Self {
        // SAFETY: plain libc calls on the current process, no pointers.
        let previous = unsafe {
            let old = libc::getpriority(libc::PRIO_PROCESS, 0);
            if libc::setpriority(libc::PRIO_PROCESS, 0, -10) == 0 {
                log::debug!("scheduling priority raised for the firing window");
                Some(old)
            } else {
                log::warn!("could not raise scheduling priority; continuing at normal priority");
                None
            }
        };
        Self { previous }
    }

    #[cfg(not(unix))]
    fn acquire() -> Self {
        log::debug!("scheduling priority elevation not supported on this platform");
        Self {}
    }
}

#[cfg(unix)]
impl Drop for PriorityGuard {
    fn drop(&mut self) {
        if let Some(old) = self.previous {
            // SAFETY: same as acquire.
            unsafe {
                libc::setpriority(libc::PRIO_PROCESS, 0, old);
            }
        }
    }
}
