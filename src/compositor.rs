//! The paint loop.
//!
//! One iteration per wake-up: drain X events, re-run focus if anything
//! changed, pump fence-signalled commits, and - when a vblank arrived and
//! there is something new to show - latch, plan, composite or scan out,
//! present, and hand out frame callbacks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context as _};
use calloop::channel::{self, Channel};
use calloop::ping::PingSource;
use calloop::{EventLoop, LoopSignal};
use monocle_config::Config;

use crate::backend::{Backend, PresentError, ScreenType};
use crate::commit::{Commit, DoneCommits};
use crate::cursor::Cursor;
use crate::focus::{FocusEngine, FocusUpdate};
use crate::planner::{
    needs_composite, CompositePolicy, CursorPlan, FramePlan, Layer, PlanInputs, PlanWindow,
    Planner, Z_BASE,
};
use crate::protocols::{atoms, ClientEvent, EventSender, RefreshCycleFlags};
use crate::render::Renderer;
use crate::scheduler::{pick_refresh_rate, RefreshController, SchedulerShared, VblankEvent};
use crate::server::{ServerState, Shared};
use crate::surface::SurfaceId;
use crate::utils::{get_monotonic_time_nanos, mhz_to_refresh_cycle};
use crate::window::{ContextId, Window, WindowKey, WindowRoles, XWindowId};
use crate::xwayland::{PropertyChange, RootPropertyChange, XContext, XEvent};

/// Vblank events older than this are leftovers from a stall; painting against
/// them would miss the deadline anyway.
const STALE_VBLANK_SLACK: Duration = Duration::from_millis(1);

pub struct Compositor {
    config: Config,
    shared: Arc<Shared>,
    contexts: Vec<XContext>,
    backend: Box<dyn Backend>,
    renderer: Arc<Mutex<dyn Renderer>>,
    planner: Planner,
    pub cursor: Cursor,
    focus: FocusEngine,
    scheduler: Arc<SchedulerShared>,
    refresh_ctrl: RefreshController,
    done: Arc<DoneCommits>,
    cache: Arc<crate::buffer::BufferCache>,
    events: EventSender,

    output_size: (u32, u32),
    has_repaint: bool,
    focus_dirty: bool,
    running: bool,
    vblank_idx: u64,
    fps_limit: u32,
    /// Per screen type (internal, external), in Hz; 0 disables.
    dynamic_refresh_hz: [u32; 2],
    present_failures: u32,
    input_counter: u64,
    published_input_counter: u64,
    fsr_was_active: bool,
}

struct LoopState {
    compositor: Compositor,
    vblank: Option<u64>,
    x_events: Vec<(ContextId, XEvent)>,
    signal: LoopSignal,
}

impl Compositor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        shared: Arc<Shared>,
        contexts: Vec<XContext>,
        backend: Box<dyn Backend>,
        renderer: Arc<Mutex<dyn Renderer>>,
        scheduler: Arc<SchedulerShared>,
        done: Arc<DoneCommits>,
        cache: Arc<crate::buffer::BufferCache>,
        events: EventSender,
    ) -> Self {
        let output_size = backend.output_size();
        let planner = Planner::new(&config, shared.touch_scaling.clone());
        let cursor = Cursor::new(&config.cursor);
        let focus = FocusEngine::new(contexts.len(), config.focus.clone());
        let refresh_ctrl = RefreshController::new(
            Duration::from_millis(config.frame_timing.dynamic_refresh_settle_ms),
            get_monotonic_time_nanos(),
        );
        let fps_limit = config.frame_timing.fps_limit;

        Self {
            config,
            shared,
            contexts,
            backend,
            renderer,
            planner,
            cursor,
            focus,
            scheduler,
            refresh_ctrl,
            done,
            cache,
            events,
            output_size,
            has_repaint: false,
            focus_dirty: true,
            running: true,
            vblank_idx: 0,
            fps_limit,
            dynamic_refresh_hz: [0, 0],
            present_failures: 0,
            input_counter: 0,
            published_input_counter: 0,
            fsr_was_active: false,
        }
    }

    pub fn global_focus(&self) -> &crate::focus::FocusTuple {
        &self.focus.global
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// The embedded input path counts injected events here; the new value is
    /// published to the launcher each iteration.
    pub fn note_input_event(&mut self) {
        self.input_counter += 1;
    }

    /// Runs the loop until an X I/O error or shutdown.
    pub fn run(
        mut self,
        vblank_rx: Channel<VblankEvent>,
        nudge_source: PingSource,
        x_channels: Vec<Channel<XEvent>>,
    ) -> anyhow::Result<()> {
        self.backend.init().context("error initializing backend")?;
        self.backend.post_init()?;

        let mut event_loop: EventLoop<LoopState> =
            EventLoop::try_new().context("error creating the compositor event loop")?;
        let handle = event_loop.handle();

        handle
            .insert_source(vblank_rx, |event, _, state: &mut LoopState| {
                if let channel::Event::Msg(vblank) = event {
                    let now = get_monotonic_time_nanos();
                    if now.saturating_sub(vblank.timestamp_ns)
                        > STALE_VBLANK_SLACK.as_nanos() as u64
                    {
                        trace!("ignored stale vblank");
                    } else {
                        state.vblank = Some(vblank.timestamp_ns);
                    }
                }
            })
            .map_err(|err| anyhow::anyhow!("error inserting the vblank source: {err}"))?;

        handle
            .insert_source(nudge_source, |_, _, _| {
                // Just a wake-up; the iteration drains the queues.
            })
            .map_err(|err| anyhow::anyhow!("error inserting the nudge source: {err}"))?;

        for (i, x_channel) in x_channels.into_iter().enumerate() {
            let ctx = ContextId(i);
            handle
                .insert_source(x_channel, move |event, _, state: &mut LoopState| {
                    if let channel::Event::Msg(event) = event {
                        state.x_events.push((ctx, event));
                    }
                })
                .map_err(|err| anyhow::anyhow!("error inserting an X event source: {err}"))?;
        }

        let mut state = LoopState {
            compositor: self,
            vblank: None,
            x_events: Vec::new(),
            signal: event_loop.get_signal(),
        };

        while state.compositor.running {
            event_loop
                .dispatch(None, &mut state)
                .context("error dispatching the compositor loop")?;

            let vblank = state.vblank.take();
            let x_events = std::mem::take(&mut state.x_events);
            state.compositor.iteration(vblank, x_events)?;

            if !state.compositor.running {
                state.signal.stop();
            }
        }

        Ok(())
    }

    /// One pass of the main loop. Public for the integration tests, which
    /// drive it without a live event loop.
    pub fn iteration(
        &mut self,
        vblank: Option<u64>,
        x_events: Vec<(ContextId, XEvent)>,
    ) -> anyhow::Result<()> {
        let _span = tracy_client::span!("Compositor::iteration");

        for (ctx, event) in x_events {
            self.handle_x_event(ctx, event)?;
        }

        if self.input_counter != self.published_input_counter {
            let value = self.input_counter as u32;
            if let Some(root) = self.contexts.first_mut() {
                root.conn
                    .set_root_cardinal(atoms::GAMESCOPE_INPUT_COUNTER, &[value]);
            }
            self.published_input_counter = self.input_counter;
        }

        if self.focus_dirty {
            self.run_focus();
        }

        if self.backend.poll_state()? {
            self.has_repaint = true;
            self.output_size = self.backend.output_size();
        }
        for fb in self.backend.take_destroyed_framebuffers() {
            self.cache.handle_destroyed_framebuffer(fb);
        }

        self.handle_done_commits();

        // A commit for the window we want may have just arrived; switch to it
        // before painting rather than a frame late.
        if self.focus_dirty {
            self.run_focus();
        }

        let screenshot_pending = self.shared.screenshot.lock().unwrap().is_some();
        let now_ns = get_monotonic_time_nanos();
        let fade_active = self.planner.fade.is_active(now_ns);

        if let Some(vblank_ns) = vblank {
            if self.has_repaint || screenshot_pending || fade_active {
                self.paint_all(vblank_ns)?;
                self.has_repaint = false;

                // Keep frames coming while a fade runs even if the app idles.
                if self.planner.fade.is_active(get_monotonic_time_nanos()) {
                    self.shared.nudge.nudge();
                }
            }

            self.send_frame_callbacks();
            self.vblank_idx += 1;
        }

        // Cursor idle policy.
        let park_rect = self.input_focus_window(|w| {
            w.roles
                .contains(WindowRoles::NO_FOCUS_WHEN_HIDDEN)
                .then_some((w.geometry.w, w.geometry.h))
        });
        if self
            .cursor
            .check_idle(get_monotonic_time_nanos(), park_rect.flatten())
        {
            self.has_repaint = true;
        }

        self.update_dynamic_refresh();

        let idle = !self.has_repaint
            && !self.planner.fade.is_active(get_monotonic_time_nanos())
            && self.shared.screenshot.lock().unwrap().is_none();
        self.scheduler.set_idle(idle);

        Ok(())
    }

    // =========================================================================
    // X events
    // =========================================================================

    fn handle_x_event(&mut self, ctx: ContextId, event: XEvent) -> anyhow::Result<()> {
        let mut windows = self.shared.windows.lock().unwrap();
        let Some(store) = windows.context_mut(ctx) else {
            return Ok(());
        };

        match event {
            XEvent::Created {
                window,
                geometry,
                override_redirect,
                input_output,
            } => {
                store.insert(Window::new(window, geometry, override_redirect, input_output));
            }
            XEvent::Mapped { window } => {
                store.map(window);
                self.focus_dirty = true;
            }
            XEvent::Unmapped { window } => {
                store.unmap(window);
                self.focus_dirty = true;
            }
            XEvent::Destroyed { window } => {
                store.remove(window);
                self.focus_dirty = true;
            }
            XEvent::Configured { window, geometry } => {
                if let Some(w) = store.get_mut(window) {
                    w.geometry = geometry;
                    self.focus_dirty = true;
                }
            }
            XEvent::SurfaceAssociated { window, surface } => {
                if let Some(w) = store.get_mut(window) {
                    w.surface = Some(surface);
                }
                drop(windows);
                let mut state = self.shared.server.lock().unwrap();
                state.registry.create(surface).x11 = Some((ctx, window));
                self.focus_dirty = true;
                return Ok(());
            }
            XEvent::Damaged { window } => {
                // Only a hint; the content arrives through the commit queue.
                let _ = window;
            }
            XEvent::Property { window, change } => {
                if let Some(w) = store.get_mut(window) {
                    apply_property(w, change);
                    self.focus_dirty = true;
                }
            }
            XEvent::RootProperty(change) => {
                drop(windows);
                self.handle_root_property(ctx, change);
                return Ok(());
            }
            XEvent::IoError => {
                drop(windows);
                return self.fatal_x_error();
            }
        }

        Ok(())
    }

    fn handle_root_property(&mut self, ctx: ContextId, change: RootPropertyChange) {
        // Control properties only count on the root of context 0.
        if ctx != ContextId(0) {
            return;
        }

        match change {
            RootPropertyChange::FocusControlAppIds(app_ids) => {
                if let Some(root) = self.contexts.first_mut() {
                    root.focus_control_app_ids = app_ids;
                }
                self.focus_dirty = true;
            }
            RootPropertyChange::FocusControlWindow(window) => {
                if let Some(root) = self.contexts.first_mut() {
                    root.focus_control_window = window;
                }
                self.focus_dirty = true;
            }
            RootPropertyChange::FpsLimit(fps) => {
                self.fps_limit = fps;
            }
            RootPropertyChange::DynamicRefresh { external, hz } => {
                self.dynamic_refresh_hz[usize::from(external)] = hz;
            }
            RootPropertyChange::VblankRedzone(ns) => {
                self.scheduler.set_redzone(ns);
            }
            RootPropertyChange::VblankDecay(percent) => {
                self.scheduler.set_decay(percent);
            }
            RootPropertyChange::ModeControl {
                server,
                width,
                height,
                allow_super_resolution,
            } => {
                let _ = allow_super_resolution;
                if let Some(ctx) = self.contexts.get_mut(server) {
                    ctx.root_size = (width, height);
                    self.focus_dirty = true;
                }
            }
            RootPropertyChange::ScreenshotRequested => {
                *self.shared.screenshot.lock().unwrap() = Some(crate::server::ScreenshotRequest {
                    path: None,
                    kind: crate::protocols::ScreenshotType::AllRealLayers,
                    property_requested: true,
                });
            }
        }
    }

    /// X server connection died. Drain in-flight commits (dropping them
    /// signals every release point) and shut down.
    fn fatal_x_error(&mut self) -> anyhow::Result<()> {
        error!("lost connection to the X server");

        {
            let mut state = self.shared.server.lock().unwrap();
            let ids: Vec<SurfaceId> =
                state.registry.surfaces().map(|(id, _)| *id).collect();
            for id in ids {
                state.registry.destroy(&self.events, id);
            }
        }
        self.planner.fade.cancel();
        self.running = false;

        bail!("X11 I/O error");
    }

    // =========================================================================
    // Focus
    // =========================================================================

    fn run_focus(&mut self) {
        let update = {
            let windows = self.shared.windows.lock().unwrap();
            let server = self.shared.server.lock().unwrap();

            let has_commits = |key: WindowKey| -> bool {
                let Some(w) = windows.get(key) else {
                    return false;
                };
                let Some(surface) = server
                    .overrides
                    .resolve(key.0, key.1)
                    .or(w.surface)
                else {
                    return false;
                };
                server
                    .registry
                    .get(surface)
                    .is_some_and(|s| s.last_ready().is_some() || s.current().is_some())
            };

            self.focus
                .determine_and_apply(&windows, &mut self.contexts, &has_commits)
        };
        self.focus_dirty = false;

        self.apply_focus_update(update);
    }

    fn apply_focus_update(&mut self, update: FocusUpdate) {
        {
            let mut windows = self.shared.windows.lock().unwrap();
            for key in &update.nudged_windows {
                if let Some(w) = windows.get_mut(*key) {
                    w.nudged = true;
                }
            }
        }

        if update.focus_changed {
            let fade_back = self.focus.global.fade_window.is_some()
                && self.focus.global.fade_window == self.focus.global.focus;
            if !self.planner.is_first_frame() {
                self.planner.on_focus_change(fade_back);
                self.focus.global.fade_window = if fade_back {
                    None
                } else {
                    update.previous_focus
                };
            }

            // Window title and icon for the nested host window.
            let title_icon = self.focus.global.focus.and_then(|key| {
                let windows = self.shared.windows.lock().unwrap();
                windows
                    .get(key)
                    .map(|w| (w.title.clone(), w.icon.clone()))
            });
            if let Some((title, icon)) = title_icon {
                if let Some(hints) = self.backend.hints() {
                    hints.set_title(title.as_deref());
                    hints.set_icon(icon.as_deref());
                }
            }
        }

        if update.hide_cursor {
            self.cursor.hide();
        }
        if update.reset_cursor_to_corner || update.reset_cursor_to_center {
            let size = self
                .input_focus_window(|w| (w.geometry.w, w.geometry.h))
                .unwrap_or(self.output_size);
            if update.reset_cursor_to_corner {
                self.cursor.reset_to_corner(size.0, size.1);
            } else {
                self.cursor.reset_to_center(size.0, size.1);
            }
        }

        if update.repaint_needed {
            self.has_repaint = true;
        }
    }

    fn input_focus_window<T>(&self, f: impl FnOnce(&Window) -> T) -> Option<T> {
        let key = self.focus.global.input_focus?;
        let windows = self.shared.windows.lock().unwrap();
        windows.get(key).map(f)
    }

    // =========================================================================
    // Commits
    // =========================================================================

    fn handle_done_commits(&mut self) {
        let _span = tracy_client::span!("Compositor::handle_done_commits");

        let entries = self.done.take();
        if entries.is_empty() {
            return;
        }

        let newly_ready = {
            let mut state = self.shared.server.lock().unwrap();
            state
                .registry
                .pump_done(entries, self.config.frame_timing.max_commit_queue)
        };

        if newly_ready.is_empty() {
            return;
        }

        let mut windows = self.shared.windows.lock().unwrap();
        let server = self.shared.server.lock().unwrap();

        for (surface, _commit) in &newly_ready {
            // The override table decides which window this content shows on.
            let key = server
                .registry
                .get(*surface)
                .and_then(|s| s.x11)
                .or_else(|| server.overrides.window_for_surface(*surface))
                .or_else(|| {
                    windows
                        .window_for_surface(*surface)
                        .map(|(ctx, w)| (ctx, w.id))
                });

            let Some((ctx, window_id)) = key else {
                continue;
            };

            if let Some(w) = windows
                .context_mut(ctx)
                .and_then(|store| store.get_mut(window_id))
            {
                w.damage_sequence += 1;
            }

            let key = (ctx, window_id);
            let global = &self.focus.global;
            let slot_repaints = [
                global.focus,
                global.override_window,
                global.overlay,
                global.external_overlay,
                global.notification,
            ];
            if slot_repaints.iter().any(|slot| *slot == Some(key)) {
                self.has_repaint = true;
            }

            if self.focus.global.outdated_interactive_focus
                || self.focus.context_focus(ctx).outdated_interactive_focus
            {
                self.focus_dirty = true;
            }
        }
    }

    // =========================================================================
    // Painting
    // =========================================================================

    fn paint_all(&mut self, vblank_ns: u64) -> anyhow::Result<()> {
        let _span = tracy_client::span!("Compositor::paint_all");

        let t_wakeup = get_monotonic_time_nanos();
        let refresh_cycle = mhz_to_refresh_cycle(self.backend.current_refresh_mhz());
        let first_frame = self.planner.is_first_frame();

        // Latch under the server lock, emitting presentation feedback and
        // timing events at latch time.
        let (plan, latched) = {
            let windows = self.shared.windows.lock().unwrap();
            let mut server = self.shared.server.lock().unwrap();

            let latched =
                self.latch_focus_surfaces(&mut server, &windows, vblank_ns, refresh_cycle);

            let now_ns = get_monotonic_time_nanos();
            let global = self.focus.global.clone();

            let slot = |key: Option<WindowKey>| -> Option<PlanWindow<'_>> {
                let key = key?;
                let w = windows.get(key)?;
                let surface = server.overrides.resolve(key.0, key.1).or(w.surface)?;
                let commit = server
                    .registry
                    .get(surface)
                    .and_then(|s| s.current())
                    .cloned();
                Some(PlanWindow { window: w, commit })
            };

            // The streaming video underlay, if the focus is a streaming client.
            let streaming_video = global.focus.and_then(|focus_key| {
                let focus_w = windows.get(focus_key)?;
                if !focus_w.roles.contains(WindowRoles::STREAMING_CLIENT) {
                    return None;
                }
                let video = windows
                    .context(focus_key.0)?
                    .iter()
                    .find(|w| w.roles.contains(WindowRoles::STREAMING_VIDEO))?;
                slot(Some((focus_key.0, video.id)))
            });

            let cursor_plan = self.cursor.is_visible().then(|| {
                self.cursor.texture().map(|texture| CursorPlan {
                    texture: texture.clone(),
                    position: self.cursor.position(),
                    hotspot: self.cursor.hotspot(),
                })
            });

            let overlay_holds_input =
                global.input_focus.is_some() && global.input_focus == global.overlay
                    || global.input_focus == global.external_overlay
                        && global.external_overlay.is_some();

            let inputs = PlanInputs {
                focus: slot(global.focus),
                override_window: slot(global.override_window),
                overlay: slot(global.overlay),
                external_overlay: slot(global.external_overlay),
                notification: slot(global.notification),
                streaming_video,
                cursor: cursor_plan.flatten(),
                overlay_holds_input,
                output_size: self.output_size,
                now_ns,
            };

            (self.planner.plan(&inputs), latched)
        };

        let Some(plan) = plan else {
            // Nothing valid to show; keep the scheduler honest and move on.
            return Ok(());
        };

        let screenshot = self.shared.screenshot.lock().unwrap().take();

        let policy = CompositePolicy {
            always_composite: self.config.debug.always_composite
                || self.backend.caps().uses_vulkan_swapchain,
            capture_requested: screenshot.is_some(),
            first_frame,
            nearest_requested: !self.config.output.linear_filter,
            hdr_itm_active: false,
        };

        // Tearing only passes through when the backend can actually tear.
        let async_flip = plan
            .layers
            .first()
            .filter(|l| l.zpos == Z_BASE)
            .is_some()
            && latched.iter().any(|c| c.async_flip)
            && self.backend.caps().supports_tearing;

        let mut composite = needs_composite(&plan, self.backend.caps(), &policy);
        let mut presented = false;

        if !composite {
            match self.backend.present(&plan, async_flip) {
                Ok(()) => presented = true,
                Err(PresentError::SessionInactive) => return Ok(()),
                Err(err) if err.wants_composite_fallback() => {
                    debug!("scan-out rejected, compositing instead");
                    composite = true;
                }
                Err(PresentError::Other(err)) => {
                    warn!("present failed: {err:?}");
                    composite = true;
                }
                Err(_) => composite = true,
            }
        }

        if composite {
            let result = {
                let mut renderer = self.renderer.lock().unwrap();
                renderer.composite(&plan, self.output_size, screenshot.is_some())
            };
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    // The previous latch stays on screen; try again next frame.
                    error!("composite failed: {err:?}");
                    return Ok(());
                }
            };

            let mut flat = FramePlan::default();
            flat.layers.push(Layer {
                texture: result.output.clone(),
                framebuffer: None,
                source_size: self.output_size,
                scale: glam::Vec2::ONE,
                offset: glam::Vec2::ZERO,
                opacity: 1.0,
                zpos: Z_BASE,
                colorspace: Default::default(),
                linear_filter: false,
                black_border: false,
            });

            match self.backend.present(&flat, async_flip) {
                Ok(()) => presented = true,
                Err(PresentError::SessionInactive) => return Ok(()),
                Err(err) => {
                    self.present_failures += 1;
                    warn!("composited present failed: {err:?}");
                    if self.present_failures >= 2 {
                        self.backend.dirty_state(true, true);
                        self.present_failures = 0;
                    }
                    return Ok(());
                }
            }

            if let (Some(request), Some(frame)) = (&screenshot, result.captured) {
                crate::screenshot::spawn_screenshot_thread(request.path.clone(), frame);
                if request.property_requested {
                    if let Some(root) = self.contexts.first_mut() {
                        root.conn.delete_root_property(atoms::GAMESCOPE_SCREENSHOT);
                    }
                }
            }
        }

        if presented {
            self.present_failures = 0;
            self.scheduler.mark_vblank(vblank_ns);

            // Timing feedback for commits that asked for it.
            for commit in &latched {
                if let Some(present_id) = commit.present_id {
                    let _ = self.events.send(ClientEvent::PastPresentTiming {
                        surface: commit.surface(),
                        present_id,
                        desired_present_time: commit.desired_present_time,
                        actual_present_time: vblank_ns,
                        earliest_present_time: commit.ready_time().max(
                            commit.desired_present_time,
                        ),
                        present_margin: vblank_ns.saturating_sub(commit.ready_time()),
                    });
                    let _ = self.events.send(ClientEvent::RefreshCycle {
                        surface: commit.surface(),
                        refresh_cycle,
                    });
                }
            }
        }

        // FSR feedback edge back to the launcher.
        let fsr_active = plan.use_fsr_layer0;
        if fsr_active != self.fsr_was_active {
            if let Some(root) = self.contexts.first_mut() {
                root.conn
                    .set_root_cardinal(atoms::GAMESCOPE_FSR_FEEDBACK, &[u32::from(fsr_active)]);
            }
            self.fsr_was_active = fsr_active;
        }

        let draw_time = get_monotonic_time_nanos().saturating_sub(t_wakeup);
        self.scheduler.observe_draw_time(draw_time);

        Ok(())
    }

    /// Latches the newest ready commit of every surface in the focus tuple and
    /// resolves its presentation feedback.
    fn latch_focus_surfaces(
        &self,
        server: &mut ServerState,
        windows: &crate::window::WindowForest,
        vblank_ns: u64,
        refresh_cycle: u64,
    ) -> Vec<Arc<Commit>> {
        let global = &self.focus.global;
        let slots = [
            global.focus,
            global.override_window,
            global.overlay,
            global.external_overlay,
            global.notification,
        ];

        let mut latched = Vec::new();
        let mut seen = Vec::new();
        for key in slots.into_iter().flatten() {
            let Some(w) = windows.get(key) else {
                continue;
            };
            let Some(surface) = server.overrides.resolve(key.0, key.1).or(w.surface) else {
                continue;
            };
            if seen.contains(&surface) {
                continue;
            }
            seen.push(surface);

            if let Some(commit) = server.registry.latch(surface) {
                server
                    .registry
                    .presented(&self.events, &commit, vblank_ns, refresh_cycle);
                latched.push(commit);
            }
        }

        latched
    }

    // =========================================================================
    // Frame callbacks and refresh control
    // =========================================================================

    /// Asks every client surface for a new frame, once per vblank, except
    /// rate-limited windows which get every Nth.
    fn send_frame_callbacks(&mut self) {
        let _span = tracy_client::span!("Compositor::send_frame_callbacks");

        let refresh_hz = crate::utils::mhz_to_hz(self.backend.current_refresh_mhz());
        let windows = self.shared.windows.lock().unwrap();
        let server = self.shared.server.lock().unwrap();

        for i in 0..windows.context_count() {
            let ctx = ContextId(i);
            let Some(store) = windows.context(ctx) else {
                continue;
            };
            for w in store.iter() {
                let Some(surface) = w.surface else {
                    continue;
                };
                if server.registry.get(surface).is_none() {
                    continue;
                }

                let mut send = true;
                if self.fps_limit != 0
                    && self.window_should_limit_fps(w)
                    && refresh_hz > self.fps_limit
                {
                    let divisor = u64::from(refresh_hz / self.fps_limit);
                    if self.vblank_idx % divisor.max(1) != 0 {
                        send = false;
                    }
                }

                if send {
                    let _ = self.events.send(ClientEvent::FrameDone { surface });
                }
            }
        }
    }

    /// Overlays and the launcher render on their own cadence; only game
    /// windows are throttled.
    fn window_should_limit_fps(&self, w: &Window) -> bool {
        w.has_app_id()
            && !w.roles.contains(WindowRoles::LAUNCHER)
            && !w.is_overlay()
            && !w.is_external_overlay()
    }

    fn update_dynamic_refresh(&mut self) {
        let screen = self
            .backend
            .connector(ScreenType::Internal)
            .map(|_| ScreenType::Internal)
            .unwrap_or(ScreenType::External);
        let dynamic_hz = self.dynamic_refresh_hz[usize::from(screen == ScreenType::External)];

        // An explicit app request narrows it further.
        let app_request = *self.shared.app_refresh.lock().unwrap();
        let app_hz = app_request
            .filter(|request| {
                request
                    .flags
                    .contains(RefreshCycleFlags::ALLOW_REFRESH_SWITCHING)
            })
            .map(|request| request.fps)
            .unwrap_or(0);

        let wants_limit = self
            .focus
            .global
            .focus
            .and_then(|key| {
                let windows = self.shared.windows.lock().unwrap();
                windows.get(key).map(|w| self.window_should_limit_fps(w))
            })
            .unwrap_or(false);

        let target_hz = if wants_limit && dynamic_hz != 0 {
            dynamic_hz
        } else if app_hz != 0 {
            app_hz
        } else {
            0
        };

        let current_mhz = self.backend.current_refresh_mhz();
        let target_mhz = if target_hz == 0 {
            // Fall back to the connector's preferred (first) mode.
            self.backend
                .connector(screen)
                .and_then(|info| info.modes.first())
                .map(|mode| mode.refresh_mhz)
                .unwrap_or(current_mhz)
        } else {
            let rates = self
                .backend
                .connector(screen)
                .map(|info| info.dynamic_refresh_rates_mhz.clone())
                .unwrap_or_default();
            pick_refresh_rate(&rates, target_hz).unwrap_or(crate::utils::hz_to_mhz(target_hz))
        };

        let now_ns = get_monotonic_time_nanos();
        if let Some(new_mhz) = self.refresh_ctrl.update(current_mhz, target_mhz, now_ns) {
            debug!("switching refresh: {current_mhz} -> {new_mhz} mHz");
            if let Err(err) = self.backend.set_refresh_mhz(new_mhz) {
                warn!("error switching refresh rate: {err:?}");
            } else {
                self.scheduler.set_target_refresh_mhz(new_mhz);
            }
        }
    }
}

fn apply_property(w: &mut Window, change: PropertyChange) {
    match change {
        PropertyChange::AppId(app_id) => w.app_id = app_id,
        PropertyChange::Pid(pid) => w.pid = pid,
        PropertyChange::Opacity(opacity) => w.opacity = opacity,
        PropertyChange::NetWmState {
            fullscreen,
            skip_taskbar,
            skip_pager,
        } => {
            w.roles.set(WindowRoles::FULLSCREEN, fullscreen);
            w.roles.set(WindowRoles::SKIP_TASKBAR, skip_taskbar);
            w.roles.set(WindowRoles::SKIP_PAGER, skip_pager);
        }
        PropertyChange::WindowType { dialog } => {
            w.roles.set(WindowRoles::DIALOG, dialog);
        }
        PropertyChange::SizeHints {
            maybe_a_dropdown,
            requested,
        } => {
            w.maybe_a_dropdown = maybe_a_dropdown;
            w.requested_size = requested;
        }
        PropertyChange::TransientFor(parent) => {
            w.transient_for = parent;
            // A transient window is a dialog unless the type hint says
            // otherwise.
            if parent.is_some() && !w.roles.contains(WindowRoles::DIALOG) {
                w.roles |= WindowRoles::DIALOG;
            }
        }
        PropertyChange::Title(title) => w.title = title,
        PropertyChange::Icon(icon) => w.icon = Some(icon),
        PropertyChange::InputFocusMode(mode) => {
            w.input_focus_mode = crate::window::InputFocusMode::from_raw(mode);
        }
        PropertyChange::Role { role, set } => {
            w.roles.set(role, set);
        }
    }
}
