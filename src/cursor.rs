//! Pointer state: position, visibility, confinement.
//!
//! The cursor lives in focus-window coordinates. Hiding is a policy decision
//! (idle timeout), not an image change; windows that refuse hover while the
//! cursor is hidden get the pointer parked in the bottom-right corner instead
//! so no hover events fire.

use std::sync::Arc;
use std::time::Duration;

use crate::render::Texture;
use crate::utils::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintMode {
    /// Pointer is pinned; relative motion is dropped.
    Locked,
    /// Pointer is clipped to the constraint region.
    Confined,
}

#[derive(Debug, Clone)]
pub struct PointerConstraint {
    pub mode: ConstraintMode,
    pub region: Region,
}

pub struct Cursor {
    x: f64,
    y: f64,
    hotspot: (i32, i32),
    texture: Option<Arc<Texture>>,
    /// Fully transparent cursor images count as hidden.
    image_empty: bool,
    last_moved_ns: u64,
    /// Idle-hidden; any real motion clears it.
    hide_for_movement: bool,
    buttons_held: u32,
    /// First few motions after a focus switch are synthetic warps.
    moves_seen: u32,
    sensitivity: f64,
    hide_timeout: Duration,
    constraint: Option<PointerConstraint>,
    /// Position to restore when leaving the parking corner.
    saved_position: Option<(f64, f64)>,
}

const SYNTHETIC_WARP_GRACE: u32 = 5;

impl Cursor {
    pub fn new(config: &monocle_config::Cursor) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            hotspot: (0, 0),
            texture: None,
            image_empty: true,
            last_moved_ns: 0,
            hide_for_movement: false,
            buttons_held: 0,
            moves_seen: 0,
            sensitivity: config.sensitivity,
            hide_timeout: Duration::from_millis(config.hide_timeout_ms),
            constraint: None,
            saved_position: None,
        }
    }

    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    pub fn hotspot(&self) -> (i32, i32) {
        self.hotspot
    }

    pub fn texture(&self) -> Option<&Arc<Texture>> {
        self.texture.as_ref()
    }

    pub fn is_visible(&self) -> bool {
        !self.hide_for_movement && !self.image_empty && self.texture.is_some()
    }

    pub fn is_idle_hidden(&self) -> bool {
        self.hide_for_movement
    }

    pub fn set_image(&mut self, texture: Arc<Texture>, hotspot: (i32, i32), empty: bool) {
        self.texture = Some(texture);
        self.hotspot = hotspot;
        self.image_empty = empty;
    }

    pub fn clear_image(&mut self) {
        self.texture = None;
        self.image_empty = true;
    }

    pub fn set_constraint(&mut self, constraint: Option<PointerConstraint>) {
        self.constraint = constraint;
    }

    pub fn button(&mut self, pressed: bool) {
        if pressed {
            self.buttons_held += 1;
        } else {
            self.buttons_held = self.buttons_held.saturating_sub(1);
        }
    }

    /// Absolute motion or a client warp.
    pub fn motion_absolute(&mut self, x: f64, y: f64, now_ns: u64) {
        if (self.x, self.y) == (x, y) {
            // Some stuff likes to warp in place.
            return;
        }
        self.x = x;
        self.y = y;
        self.note_motion(now_ns);
    }

    /// Relative motion, scaled and confined.
    pub fn motion_relative(&mut self, dx: f64, dy: f64, now_ns: u64) {
        match self.constraint.as_ref().map(|c| c.mode) {
            Some(ConstraintMode::Locked) => return,
            Some(ConstraintMode::Confined) => {
                let target_x = self.x + dx * self.sensitivity;
                let target_y = self.y + dy * self.sensitivity;
                let region = &self.constraint.as_ref().unwrap().region;
                let (x, y) = region.confine(target_x, target_y);
                self.x = x;
                self.y = y;
            }
            None => {
                self.x += dx * self.sensitivity;
                self.y += dy * self.sensitivity;
            }
        }
        self.note_motion(now_ns);
    }

    /// Forced placement that bypasses the synthetic-warp filter.
    pub fn force_position(&mut self, x: f64, y: f64) {
        self.x = x;
        self.y = y;
        self.moves_seen = 0;
    }

    fn note_motion(&mut self, now_ns: u64) {
        // The first events after a focus change tend to be non-user warps;
        // don't let them unhide the cursor.
        self.moves_seen += 1;
        if self.moves_seen < SYNTHETIC_WARP_GRACE {
            return;
        }

        self.last_moved_ns = now_ns;
        if self.hide_for_movement {
            self.hide_for_movement = false;
            // If we were parked in the corner, jump back to where the user
            // left the pointer.
            if let Some((x, y)) = self.saved_position.take() {
                self.x = x;
                self.y = y;
            }
        }
    }

    /// Runs the idle-hide policy. Returns true when visibility changed.
    ///
    /// `park_rect` is the focus window extent for windows that want the
    /// cursor out of the way while hidden.
    pub fn check_idle(&mut self, now_ns: u64, park_rect: Option<(u32, u32)>) -> bool {
        if self.hide_for_movement || self.buttons_held > 0 {
            return false;
        }

        let idle_ns = now_ns.saturating_sub(self.last_moved_ns);
        if idle_ns < self.hide_timeout.as_nanos() as u64 {
            return false;
        }

        self.hide_for_movement = true;
        if let Some((w, h)) = park_rect {
            self.saved_position = Some((self.x, self.y));
            self.x = f64::from(w) - 1.0;
            self.y = f64::from(h) - 1.0;
        }
        true
    }

    /// Focus moved somewhere else; the old position is meaningless there.
    pub fn hide(&mut self) {
        self.hide_for_movement = true;
        self.moves_seen = 0;
    }

    pub fn reset_to_corner(&mut self, w: u32, h: u32) {
        self.force_position(f64::from(w) - 1.0, f64::from(h) - 1.0);
    }

    pub fn reset_to_center(&mut self, w: u32, h: u32) {
        self.force_position(f64::from(w) / 2.0, f64::from(h) / 2.0);
    }
}

// =============================================================================
// Scroll accumulation
// =============================================================================

/// Accumulates discrete wheel deltas (in 1/120 notches) across events and
/// flushes exactly one wheel step per input frame.
#[derive(Debug, Default)]
pub struct ScrollAccumulator {
    dx: f64,
    dy: f64,
}

impl ScrollAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, discrete_dx: i32, discrete_dy: i32) {
        self.dx += f64::from(discrete_dx) / 120.0;
        self.dy += f64::from(discrete_dy) / 120.0;
    }

    /// Called on FRAME: emits the pending wheel motion, if any.
    pub fn flush(&mut self) -> Option<(f64, f64)> {
        if self.dx == 0.0 && self.dy == 0.0 {
            return None;
        }
        let out = (self.dx, self.dy);
        self.dx = 0.0;
        self.dy = 0.0;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Rect;

    fn config() -> monocle_config::Cursor {
        monocle_config::Cursor {
            hide_timeout_ms: 10_000,
            sensitivity: 1.0,
        }
    }

    fn seen_cursor() -> Cursor {
        let mut cursor = Cursor::new(&config());
        // Get past the synthetic-warp grace.
        for i in 0..10 {
            cursor.motion_absolute(f64::from(i), 0.0, 1);
        }
        cursor
    }

    #[test]
    fn locked_constraint_drops_motion() {
        let mut cursor = seen_cursor();
        let (x, y) = cursor.position();
        cursor.set_constraint(Some(PointerConstraint {
            mode: ConstraintMode::Locked,
            region: Region::single(Rect::from_size(100, 100)),
        }));
        cursor.motion_relative(10.0, 10.0, 2);
        assert_eq!(cursor.position(), (x, y));
    }

    #[test]
    fn confined_constraint_clips() {
        let mut cursor = seen_cursor();
        cursor.force_position(50.0, 50.0);
        cursor.set_constraint(Some(PointerConstraint {
            mode: ConstraintMode::Confined,
            region: Region::single(Rect::from_size(100, 100)),
        }));
        cursor.motion_relative(500.0, 0.0, 2);
        let (x, y) = cursor.position();
        assert_eq!((x, y), (99.0, 50.0));
    }

    #[test]
    fn idle_hides_after_timeout_without_buttons() {
        let mut cursor = seen_cursor();
        let t0 = 1_000_000_000;
        cursor.motion_absolute(10.0, 10.0, t0);

        // Not yet.
        assert!(!cursor.check_idle(t0 + 5_000_000_000, None));
        // Button held: never.
        cursor.button(true);
        assert!(!cursor.check_idle(t0 + 20_000_000_000, None));
        cursor.button(false);
        // Past the timeout.
        assert!(cursor.check_idle(t0 + 20_000_000_000, None));
        assert!(cursor.is_idle_hidden());
    }

    #[test]
    fn parked_cursor_restores_on_motion() {
        let mut cursor = seen_cursor();
        let t0 = 1_000_000_000;
        cursor.motion_absolute(123.0, 45.0, t0);

        assert!(cursor.check_idle(t0 + 20_000_000_000, Some((1280, 720))));
        assert_eq!(cursor.position(), (1279.0, 719.0));

        cursor.motion_absolute(200.0, 200.0, t0 + 21_000_000_000);
        // Restored to the pre-park position, not the motion target: the warp
        // happened while parked.
        assert_eq!(cursor.position(), (123.0, 45.0));
        assert!(!cursor.is_idle_hidden());
    }

    #[test]
    fn scroll_flushes_once_per_frame() {
        let mut scroll = ScrollAccumulator::new();
        scroll.accumulate(0, 120);
        scroll.accumulate(0, 60);
        assert_eq!(scroll.flush(), Some((0.0, 1.5)));
        assert_eq!(scroll.flush(), None);
    }
}
