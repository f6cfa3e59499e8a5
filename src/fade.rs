//! Crossfade between focus windows.
//!
//! The previous focus's displayed commit is captured into a slot that nothing
//! else can evict; while the fade runs, the captured frame draws above the new
//! base at complementary opacity. The capture is an owning commit handle, so
//! it survives even if the previous window is destroyed mid-fade.

use std::sync::Arc;
use std::time::Duration;

use crate::commit::Commit;
use crate::planner::BaseLayerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FadeState {
    #[default]
    Idle,
    /// Focus changed; waiting for the new focus's first ready commit.
    Pending,
    Fading {
        start_ns: u64,
    },
}

pub struct FadeMachine {
    state: FadeState,
    duration: Duration,
    held: Option<(Arc<Commit>, BaseLayerInfo)>,
}

impl FadeMachine {
    pub fn new(duration: Duration) -> Self {
        Self {
            state: FadeState::Idle,
            duration,
            held: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.duration.is_zero()
    }

    /// Fade (or the wait for one) is in progress; the paint loop must keep
    /// pumping frames even if the app stops updating.
    pub fn is_active(&self, now_ns: u64) -> bool {
        if self.held.is_none() {
            return false;
        }
        match self.state {
            FadeState::Idle => false,
            FadeState::Pending => true,
            FadeState::Fading { start_ns } => {
                now_ns.saturating_sub(start_ns) < self.duration.as_nanos() as u64
            }
        }
    }

    /// Focus changed. Captures the outgoing base unless a fade is already
    /// holding one; fading back to the held frame cancels instead.
    pub fn on_focus_change(
        &mut self,
        captured: Option<(Arc<Commit>, BaseLayerInfo)>,
        new_focus_is_fade_target: bool,
    ) {
        if !self.is_enabled() {
            return;
        }

        if self.held.is_none() {
            if let Some(captured) = captured {
                self.held = Some(captured);
                self.state = FadeState::Pending;
            }
        } else if new_focus_is_fade_target {
            self.cancel();
        }
    }

    /// The new focus painted its first real commit; the timer starts here.
    pub fn on_base_painted(&mut self, now_ns: u64) {
        if self.state == FadeState::Pending {
            self.state = FadeState::Fading { start_ns: now_ns };
        }
    }

    /// Opacity of the incoming focus, or `None` when no fade is running.
    /// Expires the fade once the duration elapses.
    pub fn opacity(&mut self, now_ns: u64) -> Option<f32> {
        if self.held.is_none() {
            return None;
        }

        match self.state {
            FadeState::Idle => None,
            FadeState::Pending => Some(0.0),
            FadeState::Fading { start_ns } => {
                let elapsed = now_ns.saturating_sub(start_ns);
                let duration = self.duration.as_nanos() as u64;
                if elapsed >= duration {
                    self.cancel();
                    None
                } else {
                    Some(elapsed as f32 / duration as f32)
                }
            }
        }
    }

    pub fn held(&self) -> Option<&(Arc<Commit>, BaseLayerInfo)> {
        self.held.as_ref()
    }

    /// Drops the capture slot and goes idle. Also the path for "new focus
    /// disappeared mid-fade".
    pub fn cancel(&mut self) {
        self.state = FadeState::Idle;
        self.held = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(ms: u64) -> FadeMachine {
        FadeMachine::new(Duration::from_millis(ms))
    }

    fn fake_capture() -> (Arc<Commit>, BaseLayerInfo) {
        crate::planner::test_support::held_commit_for_tests()
    }

    #[test]
    fn disabled_fade_never_captures() {
        let mut fade = machine(0);
        fade.on_focus_change(Some(fake_capture()), false);
        assert!(fade.held().is_none());
        assert!(!fade.is_active(0));
    }

    #[test]
    fn pending_until_first_paint_then_ramps() {
        let mut fade = machine(200);
        fade.on_focus_change(Some(fake_capture()), false);
        assert_eq!(fade.opacity(0), Some(0.0));
        assert!(fade.is_active(1_000_000_000));

        // First real base paint at t=16ms.
        fade.on_base_painted(16_000_000);

        let opacity = fade.opacity(116_000_000).unwrap();
        assert!((opacity - 0.5).abs() < 0.01, "{opacity}");

        // Past the end: fade expires and the slot drops.
        assert_eq!(fade.opacity(216_000_000), None);
        assert!(fade.held().is_none());
    }

    #[test]
    fn fading_back_to_target_cancels() {
        let mut fade = machine(200);
        fade.on_focus_change(Some(fake_capture()), false);
        assert!(fade.held().is_some());

        fade.on_focus_change(None, true);
        assert!(fade.held().is_none());
        assert!(!fade.is_active(0));
    }
}
