//! VBlank prediction and paint wake-ups.
//!
//! A dedicated thread figures out when vblank is and pokes the paint loop a
//! little earlier, leaving just enough time for composition: the draw-time
//! estimate plus a red zone that absorbs jitter.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use calloop::channel::{self, Channel};
use ordered_float::OrderedFloat;

use crate::utils::get_monotonic_time_nanos;

/// A vblank notification delivered to the paint loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankEvent {
    pub timestamp_ns: u64,
}

// =============================================================================
// Pure timing math
// =============================================================================

/// `wake = last_vblank + cycle - (draw_estimate + red_zone)`, advanced past
/// `now` in whole cycles.
pub fn next_wake_point(
    last_vblank_ns: u64,
    cycle_ns: u64,
    draw_estimate_ns: u64,
    redzone_ns: u64,
    now_ns: u64,
) -> u64 {
    let buffer = draw_estimate_ns + redzone_ns;
    let base = last_vblank_ns.saturating_sub(buffer);
    let mut target = base + cycle_ns;
    while target < now_ns {
        target += cycle_ns;
    }
    target
}

/// Rolling draw-time estimate. Rises instantly to a slow frame, decays
/// towards fast ones at `decay_percent` per sample.
pub fn update_draw_estimate(estimate_ns: u64, draw_time_ns: u64, decay_percent: u64) -> u64 {
    let decay = decay_percent.min(100);
    let blended = (estimate_ns * decay + draw_time_ns * (100 - decay)) / 100;
    draw_time_ns.max(blended)
}

// =============================================================================
// Shared state
// =============================================================================

pub struct SchedulerShared {
    last_vblank_ns: AtomicU64,
    draw_estimate_ns: AtomicU64,
    redzone_ns: AtomicU64,
    decay_percent: AtomicU64,
    target_refresh_mhz: AtomicU32,
    /// Nothing to paint; the timer thread parks instead of waking the loop.
    idle: Mutex<bool>,
    idle_changed: Condvar,
    stop: AtomicBool,
}

impl SchedulerShared {
    pub fn new(refresh_mhz: u32, redzone_ns: u64, decay_percent: u64) -> Self {
        Self {
            last_vblank_ns: AtomicU64::new(get_monotonic_time_nanos()),
            draw_estimate_ns: AtomicU64::new(0),
            redzone_ns: AtomicU64::new(redzone_ns),
            decay_percent: AtomicU64::new(decay_percent),
            target_refresh_mhz: AtomicU32::new(refresh_mhz.max(1)),
            idle: Mutex::new(false),
            idle_changed: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    /// Records a hardware-reported (or synthesised) vblank timestamp.
    pub fn mark_vblank(&self, timestamp_ns: u64) {
        self.last_vblank_ns.store(timestamp_ns, Ordering::Release);
    }

    pub fn last_vblank(&self) -> u64 {
        self.last_vblank_ns.load(Ordering::Acquire)
    }

    /// Feeds one paint iteration's draw time into the estimate.
    pub fn observe_draw_time(&self, draw_time_ns: u64) {
        let decay = self.decay_percent.load(Ordering::Relaxed);
        let estimate = self.draw_estimate_ns.load(Ordering::Relaxed);
        self.draw_estimate_ns.store(
            update_draw_estimate(estimate, draw_time_ns, decay),
            Ordering::Relaxed,
        );
    }

    pub fn draw_estimate(&self) -> u64 {
        self.draw_estimate_ns.load(Ordering::Relaxed)
    }

    pub fn set_redzone(&self, redzone_ns: u64) {
        self.redzone_ns.store(redzone_ns, Ordering::Relaxed);
    }

    pub fn set_decay(&self, percent: u64) {
        self.decay_percent.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn set_target_refresh_mhz(&self, mhz: u32) {
        self.target_refresh_mhz.store(mhz.max(1), Ordering::Relaxed);
    }

    pub fn target_refresh_mhz(&self) -> u32 {
        self.target_refresh_mhz.load(Ordering::Relaxed)
    }

    pub fn cycle_ns(&self) -> u64 {
        crate::utils::mhz_to_refresh_cycle(self.target_refresh_mhz())
    }

    /// Parks or unparks the timer thread. Idle means no surface produced a new
    /// ready commit, no overlay is animating, and no fade is running.
    pub fn set_idle(&self, idle: bool) {
        let mut guard = self.idle.lock().unwrap();
        if *guard != idle {
            *guard = idle;
            self.idle_changed.notify_all();
        }
    }

    fn wait_while_idle(&self) {
        let guard = self.idle.lock().unwrap();
        let _unused = self
            .idle_changed
            .wait_while(guard, |idle| *idle && !self.stop.load(Ordering::Relaxed))
            .unwrap();
    }
}

// =============================================================================
// VblankScheduler
// =============================================================================

pub struct VblankScheduler {
    shared: Arc<SchedulerShared>,
    thread: Option<JoinHandle<()>>,
}

impl VblankScheduler {
    /// Spawns the timer thread. `self_clocked` backends have no hardware
    /// vblank source, so the thread advances the vblank clock itself.
    pub fn spawn(
        shared: Arc<SchedulerShared>,
        self_clocked: bool,
    ) -> anyhow::Result<(Self, Channel<VblankEvent>)> {
        let (sender, receiver) = channel::channel();

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("monocle-vblk".to_owned())
            .spawn(move || run_scheduler(thread_shared, sender, self_clocked))
            .map_err(anyhow::Error::from)?;

        Ok((
            Self {
                shared,
                thread: Some(thread),
            },
            receiver,
        ))
    }

    pub fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }
}

impl Drop for VblankScheduler {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.idle_changed.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_scheduler(
    shared: Arc<SchedulerShared>,
    sender: channel::Sender<VblankEvent>,
    self_clocked: bool,
) {
    while !shared.stop.load(Ordering::Relaxed) {
        shared.wait_while_idle();
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        let cycle = shared.cycle_ns();
        let draw_estimate = shared.draw_estimate();
        let redzone = shared.redzone_ns.load(Ordering::Relaxed);
        let now = get_monotonic_time_nanos();
        let target = next_wake_point(shared.last_vblank(), cycle, draw_estimate, redzone, now);

        std::thread::sleep(Duration::from_nanos(target - now));

        let wake_time = get_monotonic_time_nanos();
        if self_clocked {
            // The predicted vblank for this wake-up.
            shared.mark_vblank(wake_time + draw_estimate + redzone);
        }

        if sender
            .send(VblankEvent {
                timestamp_ns: wake_time,
            })
            .is_err()
        {
            break;
        }

        // Get on the other side of the vblank before predicting the next one.
        std::thread::sleep(Duration::from_nanos(draw_estimate + redzone + 1_000_000));
    }
}

// =============================================================================
// Dynamic refresh
// =============================================================================

/// Debounces refresh-rate switches: the target has to disagree with the
/// current mode for the whole settle interval before we touch the display.
#[derive(Debug)]
pub struct RefreshController {
    settle_ns: u64,
    equality_time_ns: u64,
}

impl RefreshController {
    pub fn new(settle: Duration, now_ns: u64) -> Self {
        Self {
            settle_ns: settle.as_nanos() as u64,
            equality_time_ns: now_ns,
        }
    }

    /// Returns the rate to switch to, once the settle time elapsed.
    pub fn update(&mut self, current_mhz: u32, target_mhz: u32, now_ns: u64) -> Option<u32> {
        if current_mhz == target_mhz {
            self.equality_time_ns = now_ns;
            return None;
        }

        if self.equality_time_ns + self.settle_ns < now_ns {
            Some(target_mhz)
        } else {
            None
        }
    }
}

/// Picks the supported rate closest to the requested one.
pub fn pick_refresh_rate(rates_mhz: &[u32], target_hz: u32) -> Option<u32> {
    let target = f64::from(target_hz) * 1000.0;
    rates_mhz
        .iter()
        .copied()
        .min_by_key(|rate| OrderedFloat((f64::from(*rate) - target).abs()))
}
