//! Focus election.
//!
//! Selection is a pure function of the candidate windows and the control
//! properties; it runs once per XWayland context and once globally over the
//! union of candidates. The engine wraps the pure part and applies the side
//! effects: X window management, control-property publishing, and repaint
//! hints.

use monocle_config::Focus as FocusTunables;

use crate::protocols::atoms;
use crate::window::{
    ContextId, InputFocusMode, Window, WindowForest, WindowKey, WindowRoles, XWindowId,
    OPACITY_TRANSLUCENT,
};
use crate::xwayland::XContext;

// =============================================================================
// FocusTuple
// =============================================================================

/// The per-frame selection of windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusTuple {
    pub focus: Option<WindowKey>,
    pub override_window: Option<WindowKey>,
    pub overlay: Option<WindowKey>,
    pub external_overlay: Option<WindowKey>,
    pub notification: Option<WindowKey>,
    pub input_focus: Option<WindowKey>,
    pub keyboard_focus: Option<WindowKey>,
    /// Previous focus kept alive for the crossfade.
    pub fade_window: Option<WindowKey>,
    pub input_focus_mode: InputFocusMode,
    /// The elected focus had no ready commit yet; re-elect when one arrives.
    pub outdated_interactive_focus: bool,
}

// =============================================================================
// Predicates
// =============================================================================

/// Windows at or below the threshold in both dimensions are useless for focus
/// purposes. Historically exactly 1x1.
pub fn win_is_useless(w: &Window, tunables: &FocusTunables) -> bool {
    let t = tunables.useless_window_threshold;
    w.geometry.w <= t && w.geometry.h <= t
}

pub fn win_is_override_redirect(w: &Window, tunables: &FocusTunables) -> bool {
    w.override_redirect && !w.ignore_override_redirect && !win_is_useless(w, tunables)
}

fn win_has_app_id(w: &Window) -> bool {
    w.has_app_id()
}

/// A window is probably a pop-up when it sits at a fixed position with static
/// gravity and asks to be skipped by taskbar or pager, unless it is a dialog
/// that points somewhere else via transient-for.
pub fn win_maybe_a_dropdown(w: &Window, tunables: &FocusTunables) -> bool {
    let skip_any = w.roles.contains(WindowRoles::SKIP_TASKBAR)
        || w.roles.contains(WindowRoles::SKIP_PAGER);
    let valid_maybe_a_dropdown = w.maybe_a_dropdown
        && (!w.is_dialog() || (w.transient_for.is_none() && w.skip_taskbar_and_pager()))
        && skip_any;

    (valid_maybe_a_dropdown || win_is_override_redirect(w, tunables)) && !win_is_useless(w, tunables)
}

/// Returns true if a's focus priority is greater than b's.
///
/// Criteria are ordered; a tie on one falls through to the next. Used with a
/// stable sort, so input (map) order breaks the remaining ties.
pub fn is_focus_priority_greater(a: &Window, b: &Window, tunables: &FocusTunables) -> bool {
    if win_has_app_id(a) != win_has_app_id(b) {
        return win_has_app_id(a);
    }

    // Override-redirect windows are usable, but when given a choice, prefer
    // the real one.
    if win_is_override_redirect(a, tunables) != win_is_override_redirect(b, tunables) {
        return !win_is_override_redirect(a, tunables);
    }

    if win_is_useless(a, tunables) != win_is_useless(b, tunables) {
        return !win_is_useless(a, tunables);
    }

    if win_maybe_a_dropdown(a, tunables) != win_maybe_a_dropdown(b, tunables) {
        return !win_maybe_a_dropdown(a, tunables);
    }

    // Wine sets SKIP_TASKBAR and SKIP_PAGER for WS_EX_NOACTIVATE windows.
    if a.skip_taskbar_and_pager() != b.skip_taskbar_and_pager() {
        return !a.skip_taskbar_and_pager();
    }

    // Among dropdowns, prefer normal windows over dialogs.
    if win_maybe_a_dropdown(a, tunables)
        && win_maybe_a_dropdown(b, tunables)
        && a.is_dialog() != b.is_dialog()
    {
        return !a.is_dialog();
    }

    // Among dropdowns, tie-break by transient-for.
    if win_maybe_a_dropdown(a, tunables)
        && win_maybe_a_dropdown(b, tunables)
        && a.transient_for.is_some() != b.transient_for.is_some()
    {
        return a.transient_for.is_none();
    }

    if win_has_app_id(a) && a.map_sequence != b.map_sequence {
        return a.map_sequence > b.map_sequence;
    }

    // Damage sequences only matter for game windows.
    if win_has_app_id(a) && a.damage_sequence != b.damage_sequence {
        return a.damage_sequence > b.damage_sequence;
    }

    false
}

/// Chrome-style dropdowns close themselves when focused off-screen, so an
/// override candidate must sit at non-negative coordinates.
fn is_good_override_candidate(override_w: &Window, override_key: WindowKey, focus: WindowKey) -> bool {
    override_key != focus && override_w.geometry.x >= 0 && override_w.geometry.y >= 0
}

// =============================================================================
// Pure selection
// =============================================================================

/// Control properties restricting the election.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusControl {
    pub control_window: Option<XWindowId>,
    pub app_ids: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimarySelection {
    pub focus: Option<WindowKey>,
    pub override_window: Option<WindowKey>,
    pub game_focused: bool,
    pub outdated_interactive_focus: bool,
}

/// Ports of the primary focus + override election.
///
/// `candidates` must already be sorted by focus priority (stable). The
/// function never mutates anything; identical inputs produce identical
/// outputs.
pub fn select_focus(
    candidates: &[(WindowKey, &Window)],
    control: &FocusControl,
    global: bool,
    tunables: &FocusTunables,
    window_has_commits: &dyn Fn(WindowKey) -> bool,
) -> PrimarySelection {
    let mut out = PrimarySelection::default();

    let mut focus: Option<(WindowKey, &Window)> = None;
    let mut override_focus: Option<(WindowKey, &Window)> = None;

    let controlled = control.control_window.is_some() || !control.app_ids.is_empty();
    if controlled {
        if let Some(control_window) = control.control_window {
            focus = candidates
                .iter()
                .find(|(key, _)| key.1 == control_window)
                .copied();
        }

        if focus.is_none() {
            'outer: for app_id in &control.app_ids {
                for candidate in candidates {
                    if candidate.1.app_id == *app_id {
                        focus = Some(*candidate);
                        break 'outer;
                    }
                }
            }
        }

        out.game_focused = focus.is_some();
    }

    if focus.is_none() && (!global || !controlled) {
        focus = candidates.first().copied();
        out.game_focused = focus.is_some_and(|(_, w)| w.has_app_id());
    }

    // Follow transient links through real (non-dropdown) windows.
    if let Some(mut current) = focus {
        if control.control_window.is_none() {
            loop {
                let next = candidates.iter().find(|(key, w)| {
                    *key != current.0
                        && key.0 == current.0 .0
                        && w.transient_for == Some(current.0 .1)
                        && !win_maybe_a_dropdown(w, tunables)
                });
                match next {
                    Some(next) => current = *next,
                    None => break,
                }
            }
            focus = Some(current);
        }
    }

    fn resolve_transient_overrides<'c>(
        candidates: &[(WindowKey, &'c Window)],
        tunables: &FocusTunables,
        focus: (WindowKey, &'c Window),
        override_focus: &mut Option<(WindowKey, &'c Window)>,
        maybe: bool,
    ) {
        loop {
            let anchor = override_focus.map_or(focus.0, |(key, _)| key);
            let next = candidates.iter().find(|(key, w)| {
                let is_dropdown = if maybe {
                    win_maybe_a_dropdown(w, tunables)
                } else {
                    win_is_override_redirect(w, tunables)
                };
                Some(*key) != override_focus.map(|(k, _)| k)
                    && *key != focus.0
                    && key.0 == anchor.0
                    && w.transient_for == Some(anchor.1)
                    && is_dropdown
            });
            match next {
                Some(next) => *override_focus = Some(*next),
                None => break,
            }
        }
    }

    if let Some(focus) = focus {
        // Prefer a true override-redirect window as the pop-up.
        let same_app_required = !control.app_ids.is_empty();
        override_focus = candidates
            .iter()
            .find(|(key, w)| {
                win_is_override_redirect(w, tunables)
                    && is_good_override_candidate(w, *key, focus.0)
                    && (!same_app_required || w.app_id == focus.1.app_id)
            })
            .copied();

        resolve_transient_overrides(candidates, tunables, focus, &mut override_focus, false);

        if override_focus.is_none() {
            // Fall back to dropdown-looking windows.
            override_focus = candidates
                .iter()
                .find(|(key, w)| {
                    win_maybe_a_dropdown(w, tunables)
                        && is_good_override_candidate(w, *key, focus.0)
                        && (!controlled || w.app_id == focus.1.app_id)
                })
                .copied();
            resolve_transient_overrides(candidates, tunables, focus, &mut override_focus, true);
        }
    }

    if let Some((key, _)) = focus {
        if window_has_commits(key) {
            out.focus = Some(key);
        } else {
            out.outdated_interactive_focus = true;
        }

        // Per-context focus always tracks the X election even without
        // commits; only the presented (global) focus holds back.
        if !global {
            out.focus = Some(key);
        }
    }

    out.override_window = override_focus.map(|(key, _)| key);
    out
}

/// Overlay, notification and external-overlay slots, plus input steal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlaySelection {
    pub overlay: Option<WindowKey>,
    pub notification: Option<WindowKey>,
    pub external_overlay: Option<WindowKey>,
    pub input_steal: Option<(WindowKey, InputFocusMode)>,
}

pub fn select_overlays(
    ctx: ContextId,
    windows: &[&Window],
    tunables: &FocusTunables,
) -> OverlaySelection {
    let mut out = OverlaySelection::default();
    let mut max_opacity = 0u32;
    let mut max_opacity_external = 0u32;

    for w in windows {
        let key = (ctx, w.id);

        if w.is_overlay() {
            if w.geometry.w >= tunables.overlay_min_width && w.opacity >= max_opacity {
                out.overlay = Some(key);
                max_opacity = w.opacity;
            } else {
                out.notification = Some(key);
            }

            if w.input_focus_mode.steals_input() {
                out.input_steal = Some((key, w.input_focus_mode));
            }
        }

        if w.is_external_overlay() && w.opacity > max_opacity_external {
            out.external_overlay = Some(key);
            max_opacity_external = w.opacity;
        }
    }

    out
}

/// Builds the sorted candidate list for one context.
pub fn focus_candidates<'a>(
    ctx: ContextId,
    windows: impl Iterator<Item = &'a Window>,
    tunables: &FocusTunables,
) -> Vec<(WindowKey, &'a Window)> {
    let mut candidates: Vec<(WindowKey, &Window)> = windows
        .filter(|w| {
            !w.roles.contains(WindowRoles::SYS_TRAY)
                && w.mapped
                && w.input_output
                && !w.is_overlay()
                && !w.is_external_overlay()
                && (w.has_app_id()
                    || w.roles.contains(WindowRoles::LAUNCHER)
                    || w.roles.contains(WindowRoles::STREAMING_CLIENT))
                && (w.opacity > OPACITY_TRANSLUCENT
                    || w.roles.contains(WindowRoles::STREAMING_CLIENT))
        })
        .map(|w| ((ctx, w.id), w))
        .collect();

    sort_by_focus_priority(&mut candidates, tunables);
    candidates
}

/// Stable sort by focus priority.
///
/// Criteria 6 and 7 only apply between dropdowns, so the predicate is a
/// partial order; a stable insertion sort keeps the historical
/// `std::stable_sort` behavior without tripping total-order checks.
pub fn sort_by_focus_priority(
    candidates: &mut [(WindowKey, &Window)],
    tunables: &FocusTunables,
) {
    for i in 1..candidates.len() {
        let mut j = i;
        while j > 0 && is_focus_priority_greater(candidates[j].1, candidates[j - 1].1, tunables) {
            candidates.swap(j, j - 1);
            j -= 1;
        }
    }
}

// =============================================================================
// FocusEngine
// =============================================================================

/// What changed in this election, for the paint loop.
#[derive(Debug, Clone, Default)]
pub struct FocusUpdate {
    pub focus_changed: bool,
    pub previous_focus: Option<WindowKey>,
    pub input_focus_changed: bool,
    pub repaint_needed: bool,
    /// Park the cursor in the corner (window refuses hover while hidden).
    pub reset_cursor_to_corner: bool,
    /// Centre the cursor (transition between hover policies).
    pub reset_cursor_to_center: bool,
    /// Hide the cursor after an input-focus move.
    pub hide_cursor: bool,
    /// Windows that got their initial (1,1) shake-out move this pass.
    pub nudged_windows: Vec<WindowKey>,
}

pub struct FocusEngine {
    tunables: FocusTunables,
    per_context: Vec<FocusTuple>,
    pub global: FocusTuple,
}

impl FocusEngine {
    pub fn new(context_count: usize, tunables: FocusTunables) -> Self {
        Self {
            tunables,
            per_context: vec![FocusTuple::default(); context_count],
            global: FocusTuple::default(),
        }
    }

    pub fn tunables(&self) -> &FocusTunables {
        &self.tunables
    }

    pub fn context_focus(&self, ctx: ContextId) -> &FocusTuple {
        &self.per_context[ctx.0]
    }

    /// Runs the election over every context and globally, applying the side
    /// effects through the contexts' X connections.
    pub fn determine_and_apply(
        &mut self,
        forest: &WindowForest,
        contexts: &mut [XContext],
        window_has_commits: &dyn Fn(WindowKey) -> bool,
    ) -> FocusUpdate {
        let _span = tracy_client::span!("FocusEngine::determine_and_apply");

        let previous_global = self.global.clone();
        let mut update = FocusUpdate {
            previous_focus: previous_global.focus,
            ..Default::default()
        };

        let root_control = contexts
            .first()
            .map(|ctx| FocusControl {
                control_window: ctx.focus_control_window,
                app_ids: ctx.focus_control_app_ids.clone(),
            })
            .unwrap_or_default();

        // Per-context elections, collecting the global candidate pool.
        let mut global_candidates: Vec<(WindowKey, &Window)> = Vec::new();
        for (i, ctx) in contexts.iter_mut().enumerate() {
            let ctx_id = ContextId(i);
            let Some(store) = forest.context(ctx_id) else {
                continue;
            };

            let candidates = focus_candidates(ctx_id, store.iter(), &self.tunables);
            let overlays =
                select_overlays(ctx_id, &store.iter().collect::<Vec<_>>(), &self.tunables);

            let control = if i == 0 {
                root_control.clone()
            } else {
                FocusControl::default()
            };
            let selection = select_focus(
                &candidates,
                &control,
                false,
                &self.tunables,
                window_has_commits,
            );

            global_candidates.extend_from_slice(&candidates);

            let tuple = &mut self.per_context[i];
            let prev_focus = tuple.focus;
            tuple.overlay = overlays.overlay;
            tuple.notification = overlays.notification;
            tuple.external_overlay = overlays.external_overlay;
            tuple.override_window = selection.override_window;
            tuple.focus = selection.focus;
            tuple.outdated_interactive_focus = selection.outdated_interactive_focus;

            let input_focus = overlays
                .input_steal
                .map(|(key, _)| key)
                .or(tuple.focus);
            tuple.input_focus = input_focus;

            let Some(focus) = tuple.focus else {
                continue;
            };
            let Some(focus_window) = store.get(focus.1) else {
                continue;
            };

            if prev_focus != Some(focus) {
                // Some games don't react well to being iconified; only ever
                // pull them out of it.
                ctx.conn.set_wm_state_normal(focus.1);
                debug!("context {i} focus {:?}", focus.1);
            }

            apply_context_stacking(
                ctx,
                store,
                tuple,
                focus,
                focus_window,
                &mut update.nudged_windows,
            );
        }

        // Global election over the union.
        sort_by_focus_priority(&mut global_candidates, &self.tunables);

        let selection = select_focus(
            &global_candidates,
            &root_control,
            true,
            &self.tunables,
            window_has_commits,
        );

        // The presented focus holds the previous window until the new focus
        // produces a ready commit, as long as that window still exists.
        let previous_alive = previous_global
            .focus
            .filter(|key| forest.get(*key).is_some());
        self.global = FocusTuple {
            focus: selection.focus.or(previous_alive),
            override_window: selection.override_window,
            outdated_interactive_focus: selection.outdated_interactive_focus,
            ..FocusTuple::default()
        };

        // Overlay slots always come from context 0.
        if let Some(root_tuple) = self.per_context.first() {
            self.global.overlay = root_tuple.overlay;
            self.global.external_overlay = root_tuple.external_overlay;
            self.global.notification = root_tuple.notification;
        }

        // Input and keyboard focus.
        let overlay_steals = self
            .global
            .overlay
            .and_then(|key| forest.get(key))
            .is_some_and(|w| w.input_focus_mode.steals_input());
        if overlay_steals {
            self.global.input_focus = self.global.overlay;
            self.global.keyboard_focus = self.global.overlay;
        } else {
            self.global.input_focus = self.global.focus;
            self.global.keyboard_focus = self.global.override_window.or(self.global.focus);
        }

        self.global.input_focus_mode = self
            .global
            .input_focus
            .and_then(|key| forest.get(key))
            .map(|w| w.input_focus_mode)
            .unwrap_or_default();

        if self.global.input_focus_mode == InputFocusMode::StealMouseOnly {
            self.global.keyboard_focus = self.global.override_window.or(self.global.focus);
        }

        self.global.fade_window = previous_global.fade_window;

        // Cursor policy on input-focus transitions.
        if self.global.input_focus != previous_global.input_focus
            || self.global.input_focus_mode != previous_global.input_focus_mode
        {
            update.input_focus_changed = true;
            update.hide_cursor = true;

            let wants_no_focus_hidden = |key: Option<WindowKey>| {
                key.and_then(|key| forest.get(key))
                    .is_some_and(|w| w.roles.contains(WindowRoles::NO_FOCUS_WHEN_HIDDEN))
            };
            if wants_no_focus_hidden(self.global.input_focus) {
                update.reset_cursor_to_corner = true;
            } else if wants_no_focus_hidden(self.global.input_focus)
                != wants_no_focus_hidden(previous_global.input_focus)
            {
                update.reset_cursor_to_center = true;
            }
        }

        update.focus_changed = self.global.focus != previous_global.focus;
        update.repaint_needed = update.focus_changed
            || self.global.overlay != previous_global.overlay
            || self.global.external_overlay != previous_global.external_overlay
            || self.global.notification != previous_global.notification
            || self.global.override_window != previous_global.override_window;

        self.publish_control_properties(&global_candidates, contexts);

        update
    }

    /// Back-channel to the launcher on the root of context 0.
    fn publish_control_properties(
        &self,
        global_candidates: &[(WindowKey, &Window)],
        contexts: &mut [XContext],
    ) {
        let mut focusable_apps: Vec<u32> = Vec::new();
        let mut focusable_windows: Vec<u32> = Vec::new();

        for (_, w) in global_candidates {
            // 1x1, override-redirect and fully-skipped windows are not
            // something the launcher can usefully focus.
            if win_is_useless(w, &self.tunables)
                || w.skip_taskbar_and_pager()
                || w.override_redirect
            {
                continue;
            }

            if w.has_app_id() && !focusable_apps.contains(&w.app_id) {
                focusable_apps.push(w.app_id);
            }

            focusable_windows.push(w.id.0);
            focusable_windows.push(w.app_id);
            focusable_windows.push(w.pid);
        }

        let focused_window = self.global.focus.map_or(0, |key| key.1 .0);
        let focused_base_app = self
            .global
            .focus
            .and_then(|key| {
                global_candidates
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, w)| w.app_id)
            })
            .unwrap_or(0);
        let focused_app = self
            .global
            .input_focus
            .and_then(|key| {
                global_candidates
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, w)| w.app_id)
            })
            .unwrap_or(focused_base_app);

        let display_for = |key: Option<WindowKey>, contexts: &[XContext]| -> String {
            let idx = key.map_or(0, |key| key.0 .0);
            contexts
                .get(idx)
                .or_else(|| contexts.first())
                .map(|ctx| ctx.conn.display_name().to_owned())
                .unwrap_or_default()
        };

        let focus_display = display_for(self.global.focus, contexts);
        let mouse_display = display_for(self.global.input_focus, contexts);
        let keyboard_display = display_for(self.global.keyboard_focus, contexts);

        let Some(root) = contexts.first_mut() else {
            return;
        };
        let conn = &mut root.conn;

        conn.set_root_cardinal(atoms::GAMESCOPE_FOCUSABLE_APPS, &focusable_apps);
        conn.set_root_cardinal(atoms::GAMESCOPE_FOCUSABLE_WINDOWS, &focusable_windows);
        conn.set_root_cardinal(atoms::GAMESCOPE_FOCUSED_APP, &[focused_app]);
        conn.set_root_cardinal(atoms::GAMESCOPE_FOCUSED_APP_GFX, &[focused_base_app]);
        conn.set_root_cardinal(atoms::GAMESCOPE_FOCUSED_WINDOW, &[focused_window]);
        conn.set_root_string(atoms::GAMESCOPE_FOCUS_DISPLAY, &focus_display);
        conn.set_root_string(atoms::GAMESCOPE_MOUSE_FOCUS_DISPLAY, &mouse_display);
        conn.set_root_string(atoms::GAMESCOPE_KEYBOARD_FOCUS_DISPLAY, &keyboard_display);
    }
}

/// Raising, placement and sizing of the focused window within its context.
fn apply_context_stacking(
    ctx: &mut XContext,
    store: &crate::window::WindowStore,
    tuple: &mut FocusTuple,
    focus: WindowKey,
    focus_window: &Window,
    nudged: &mut Vec<WindowKey>,
) {
    let input_focus = tuple.input_focus.unwrap_or(focus);

    // Keyboard goes to the input focus, except steal-mouse-only overlays.
    let mut keyboard = input_focus;
    if let Some(w) = store.get(input_focus.1) {
        if w.input_focus_mode == InputFocusMode::StealMouseOnly {
            keyboard = focus;
        }
    }

    // If the current keyboard window still resolves to the same toplevel,
    // keep it; yanking focus away kills dropdowns.
    let keyboard_id = match ctx.current_keyboard_focus {
        Some(current) if store.get(current).is_some() && current == keyboard.1 => current,
        _ => keyboard.1,
    };

    if ctx.current_keyboard_focus != Some(keyboard_id) {
        let skip = tuple
            .override_window
            .is_some_and(|override_key| override_key == keyboard);
        if !skip {
            ctx.conn.set_input_focus(keyboard_id);
        }
        ctx.current_keyboard_focus = Some(keyboard_id);
    }
    tuple.keyboard_focus = Some((focus.0, keyboard_id));

    // Stacking: the override pop-up goes above the focus when the focus holds
    // input, otherwise whatever holds input goes on top.
    let raise_target = if input_focus == focus {
        tuple.override_window.unwrap_or(input_focus)
    } else {
        input_focus
    };
    if store.topmost().map(|w| w.id) != Some(raise_target.1) {
        ctx.conn.raise(raise_target.1);
    }

    // Shake out a ConfigureNotify once, then pin at the origin.
    if !focus_window.nudged {
        ctx.conn.move_window(focus.1, 1, 1);
        nudged.push(focus);
    } else if focus_window.geometry.x != 0 || focus_window.geometry.y != 0 {
        ctx.conn.move_window(focus.1, 0, 0);
    }

    let (root_w, root_h) = ctx.root_size;
    if focus_window.is_fullscreen()
        && (focus_window.geometry.w != root_w || focus_window.geometry.h != root_h)
    {
        ctx.conn.resize_window(focus.1, root_w, root_h);
    } else if !focus_window.is_fullscreen() {
        if let Some((want_w, want_h)) = focus_window.requested_size {
            if focus_window.geometry.w != want_w || focus_window.geometry.h != want_h {
                ctx.conn.resize_window(focus.1, want_w, want_h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::utils::Rect;

    fn tunables() -> FocusTunables {
        FocusTunables::default()
    }

    fn game(id: u32, app_id: u32) -> Window {
        let mut w = Window::new(XWindowId(id), Rect::from_size(1280, 720), false, true);
        w.mapped = true;
        w.app_id = app_id;
        w.map_sequence = u64::from(id);
        w
    }

    fn candidates<'a>(windows: &'a [Window]) -> Vec<(WindowKey, &'a Window)> {
        focus_candidates(ContextId(0), windows.iter(), &tunables())
    }

    fn always_has_commits(_: WindowKey) -> bool {
        true
    }

    #[test]
    fn prefers_app_id_over_none() {
        let mut no_app = game(1, 0);
        no_app.roles |= WindowRoles::LAUNCHER;
        let with_app = game(2, 4242);
        let windows = vec![no_app, with_app];

        let sorted = candidates(&windows);
        let selection = select_focus(
            &sorted,
            &FocusControl::default(),
            false,
            &tunables(),
            &always_has_commits,
        );
        assert_eq!(selection.focus, Some((ContextId(0), XWindowId(2))));
        assert!(selection.game_focused);
    }

    #[test]
    fn newer_map_sequence_wins_between_games() {
        let a = game(1, 100);
        let b = game(2, 200);
        let windows = vec![a, b];

        let sorted = candidates(&windows);
        let selection = select_focus(
            &sorted,
            &FocusControl::default(),
            false,
            &tunables(),
            &always_has_commits,
        );
        assert_eq!(selection.focus, Some((ContextId(0), XWindowId(2))));
    }

    #[test]
    fn useless_1x1_window_loses() {
        let mut tiny = game(5, 300);
        tiny.geometry = Rect::from_size(1, 1);
        tiny.map_sequence = 100;
        let normal = game(2, 300);
        let windows = vec![tiny, normal];

        let sorted = candidates(&windows);
        assert_eq!(sorted[0].0 .1, XWindowId(2));
    }

    #[test]
    fn control_app_id_restricts_selection() {
        let a = game(1, 100);
        let b = game(2, 200);
        let windows = vec![a, b];

        let control = FocusControl {
            control_window: None,
            app_ids: vec![100],
        };
        let sorted = candidates(&windows);
        let selection = select_focus(&sorted, &control, true, &tunables(), &always_has_commits);
        assert_eq!(selection.focus, Some((ContextId(0), XWindowId(1))));
        assert!(selection.game_focused);
    }

    #[test]
    fn control_window_pins_focus() {
        let a = game(1, 100);
        let b = game(2, 200);
        let windows = vec![a, b];

        let control = FocusControl {
            control_window: Some(XWindowId(1)),
            app_ids: Vec::new(),
        };
        let sorted = candidates(&windows);
        let selection = select_focus(&sorted, &control, true, &tunables(), &always_has_commits);
        assert_eq!(selection.focus, Some((ContextId(0), XWindowId(1))));
    }

    #[test]
    fn dropdown_becomes_override_not_focus() {
        let main = game(1, 100);
        let mut dropdown = game(2, 100);
        dropdown.override_redirect = true;
        dropdown.geometry = Rect::new(40, 20, 300, 200);
        dropdown.transient_for = Some(XWindowId(1));
        let windows = vec![main, dropdown];

        let sorted = candidates(&windows);
        let selection = select_focus(
            &sorted,
            &FocusControl::default(),
            false,
            &tunables(),
            &always_has_commits,
        );
        assert_eq!(selection.focus, Some((ContextId(0), XWindowId(1))));
        assert_eq!(
            selection.override_window,
            Some((ContextId(0), XWindowId(2)))
        );
    }

    #[test]
    fn offscreen_override_is_rejected() {
        let main = game(1, 100);
        let mut dropdown = game(2, 100);
        dropdown.override_redirect = true;
        dropdown.geometry = Rect::new(-1, -1, 300, 200);
        let windows = vec![main, dropdown];

        let sorted = candidates(&windows);
        let selection = select_focus(
            &sorted,
            &FocusControl::default(),
            false,
            &tunables(),
            &always_has_commits,
        );
        assert_eq!(selection.override_window, None);
    }

    #[test]
    fn transient_chain_is_followed() {
        let parent = game(1, 100);
        let mut child = game(2, 100);
        child.transient_for = Some(XWindowId(1));
        child.map_sequence = 0; // Older by sequence, still wins via chain.
        let windows = vec![child, parent];

        let sorted = candidates(&windows);
        let selection = select_focus(
            &sorted,
            &FocusControl::default(),
            false,
            &tunables(),
            &always_has_commits,
        );
        assert_eq!(selection.focus, Some((ContextId(0), XWindowId(2))));
    }

    #[test]
    fn overlay_slots() {
        let mut overlay = Window::new(XWindowId(1), Rect::from_size(1280, 720), false, true);
        overlay.roles |= WindowRoles::OVERLAY;
        overlay.opacity = 0xffff_ffff;
        let mut note = Window::new(XWindowId(2), Rect::from_size(400, 100), false, true);
        note.roles |= WindowRoles::OVERLAY;
        let mut external = Window::new(XWindowId(3), Rect::from_size(800, 600), false, true);
        external.roles |= WindowRoles::EXTERNAL_OVERLAY;
        external.opacity = 0x8000_0000;

        let windows = vec![overlay, note, external];
        let refs: Vec<&Window> = windows.iter().collect();
        let slots = select_overlays(ContextId(0), &refs, &tunables());

        assert_eq!(slots.overlay, Some((ContextId(0), XWindowId(1))));
        assert_eq!(slots.notification, Some((ContextId(0), XWindowId(2))));
        assert_eq!(slots.external_overlay, Some((ContextId(0), XWindowId(3))));
    }

    #[test]
    fn focus_without_commits_is_held_back_globally() {
        let windows = vec![game(1, 100)];
        let sorted = candidates(&windows);

        let selection = select_focus(
            &sorted,
            &FocusControl::default(),
            true,
            &tunables(),
            &|_| false,
        );
        assert_eq!(selection.focus, None);
        assert!(selection.outdated_interactive_focus);

        // Per-context still tracks the election.
        let selection = select_focus(
            &sorted,
            &FocusControl::default(),
            false,
            &tunables(),
            &|_| false,
        );
        assert_eq!(selection.focus, Some((ContextId(0), XWindowId(1))));
    }

    // Selection must be a pure function of its inputs.
    proptest! {
        #[test]
        fn selection_is_deterministic(
            app_ids in proptest::collection::vec(0u32..4, 1..6),
            seqs in proptest::collection::vec(0u64..6, 1..6),
            control_app in 0u32..4,
        ) {
            let n = app_ids.len().min(seqs.len());
            let windows: Vec<Window> = (0..n)
                .map(|i| {
                    let mut w = game(i as u32 + 1, app_ids[i]);
                    w.map_sequence = seqs[i];
                    if app_ids[i] == 0 {
                        w.roles |= WindowRoles::LAUNCHER;
                    }
                    w
                })
                .collect();

            let control = FocusControl {
                control_window: None,
                app_ids: vec![control_app],
            };

            let sorted = candidates(&windows);
            let first = select_focus(&sorted, &control, true, &tunables(), &always_has_commits);
            let second = select_focus(&sorted, &control, true, &tunables(), &always_has_commits);
            prop_assert_eq!(first, second);
        }

        // The priority predicate must never report both a > b and b > a.
        #[test]
        fn priority_is_antisymmetric_on_games(
            seq_a in 0u64..10, seq_b in 0u64..10,
            dmg_a in 0u64..10, dmg_b in 0u64..10,
        ) {
            let mut a = game(1, 7);
            a.map_sequence = seq_a;
            a.damage_sequence = dmg_a;
            let mut b = game(2, 7);
            b.map_sequence = seq_b;
            b.damage_sequence = dmg_b;

            let t = tunables();
            prop_assert!(
                !(is_focus_priority_greater(&a, &b, &t)
                    && is_focus_priority_greater(&b, &a, &t))
            );
        }
    }
}
