//! Composition planning: focus state in, layer list out.
//!
//! The planner turns the global focus tuple, the cursor, and the held/fade
//! commits into at most eight layers in a fixed z-order, then decides whether
//! the frame can go straight to scan-out or has to pass through the Vulkan
//! compositor first.

use std::sync::Arc;

use arrayvec::ArrayVec;
use glam::Vec2;
use portable_atomic::AtomicF64;
use portable_atomic::Ordering::Relaxed;

use crate::backend::{BackendCaps, FramebufferHandle};
use crate::commit::Commit;
use crate::fade::FadeMachine;
use crate::protocols::Colorspace;
use crate::render::Texture;
use crate::window::{Window, OPACITY_OPAQUE};

pub const MAX_LAYERS: usize = 8;

pub const Z_BASE: i32 = 0;
pub const Z_OVERRIDE: i32 = 1;
pub const Z_EXTERNAL_OVERLAY: i32 = 2;
pub const Z_OVERLAY: i32 = 3;
pub const Z_NOTIFICATION: i32 = 4;
pub const Z_CURSOR: i32 = 5;

// =============================================================================
// Layers
// =============================================================================

#[derive(Debug, Clone)]
pub struct Layer {
    pub texture: Arc<Texture>,
    pub framebuffer: Option<FramebufferHandle>,
    pub source_size: (u32, u32),
    /// Output pixels per source pixel.
    pub scale: Vec2,
    /// Top-left placement on the output.
    pub offset: Vec2,
    pub opacity: f32,
    pub zpos: i32,
    pub colorspace: Colorspace,
    pub linear_filter: bool,
    pub black_border: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BlurMode {
    #[default]
    Off,
    /// Blur only when something composites above the base layer.
    Cond,
    Always,
}

#[derive(Debug, Default, Clone)]
pub struct FramePlan {
    pub layers: ArrayVec<Layer, MAX_LAYERS>,
    pub use_fsr_layer0: bool,
    pub use_nis_layer0: bool,
    pub blur_layer0: bool,
    pub blur_radius: u32,
}

impl FramePlan {
    pub fn non_cursor_layers(&self) -> usize {
        self.layers.iter().filter(|l| l.zpos != Z_CURSOR).count()
    }

    pub fn has_cursor_layer(&self) -> bool {
        self.layers.iter().any(|l| l.zpos == Z_CURSOR)
    }

    fn push(&mut self, layer: Layer) {
        if self.layers.try_push(layer).is_err() {
            warn!("frame plan overflow, dropping layer");
        }
    }
}

/// Base-plane placement cached for frames where the focus has no content yet
/// and for the fade slot.
#[derive(Debug, Clone, Copy)]
pub struct BaseLayerInfo {
    pub scale: Vec2,
    pub offset: Vec2,
    pub opacity: f32,
}

impl Default for BaseLayerInfo {
    fn default() -> Self {
        Self {
            scale: Vec2::ONE,
            offset: Vec2::ZERO,
            opacity: 1.0,
        }
    }
}

// =============================================================================
// Touch scaling
// =============================================================================

/// Base-layer transform shared with the input path, so touches on the output
/// can be mapped back into surface-local coordinates.
#[derive(Debug, Default)]
pub struct TouchScaling {
    scale_x: AtomicF64,
    scale_y: AtomicF64,
    offset_x: AtomicF64,
    offset_y: AtomicF64,
}

impl TouchScaling {
    pub fn publish(&self, scale: Vec2, offset: Vec2) {
        self.scale_x.store(f64::from(scale.x), Relaxed);
        self.scale_y.store(f64::from(scale.y), Relaxed);
        self.offset_x.store(f64::from(offset.x), Relaxed);
        self.offset_y.store(f64::from(offset.y), Relaxed);
    }

    /// Output-space point -> surface-local point.
    pub fn to_surface(&self, x: f64, y: f64) -> (f64, f64) {
        let sx = self.scale_x.load(Relaxed).max(f64::MIN_POSITIVE);
        let sy = self.scale_y.load(Relaxed).max(f64::MIN_POSITIVE);
        (
            (x - self.offset_x.load(Relaxed)) / sx,
            (y - self.offset_y.load(Relaxed)) / sy,
        )
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// One slot of the focus tuple, resolved to its window and content.
pub struct PlanWindow<'a> {
    pub window: &'a Window,
    pub commit: Option<Arc<Commit>>,
}

pub struct CursorPlan {
    pub texture: Arc<Texture>,
    /// Focus-window-local position.
    pub position: (f64, f64),
    pub hotspot: (i32, i32),
}

pub struct PlanInputs<'a> {
    pub focus: Option<PlanWindow<'a>>,
    pub override_window: Option<PlanWindow<'a>>,
    pub overlay: Option<PlanWindow<'a>>,
    pub external_overlay: Option<PlanWindow<'a>>,
    pub notification: Option<PlanWindow<'a>>,
    /// Video underlay when the focus is a streaming client.
    pub streaming_video: Option<PlanWindow<'a>>,
    pub cursor: Option<CursorPlan>,
    /// The overlay (not the focus) holds input, e.g. the launcher overlay.
    pub overlay_holds_input: bool,
    pub output_size: (u32, u32),
    pub now_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upscaler {
    None,
    Fsr,
    Nis,
}

// =============================================================================
// Planner
// =============================================================================

pub struct Planner {
    max_window_scale: f32,
    integer_scale: bool,
    linear_filter: bool,
    upscaler: Upscaler,
    blur_mode: BlurMode,
    blur_mode_old: BlurMode,
    blur_radius: u32,
    blur_fade_start_ns: u64,
    blur_fade_duration: std::time::Duration,
    /// Centre-on-cursor magnification; 1.0 means off.
    zoom_scale: f32,
    pub fade: FadeMachine,
    /// The last displayed base commit, kept so an empty frame still shows
    /// something.
    held_base: Option<Arc<Commit>>,
    cached_base: BaseLayerInfo,
    touch_scaling: Arc<TouchScaling>,
    first_frame: bool,
}

impl Planner {
    pub fn new(config: &monocle_config::Config, touch_scaling: Arc<TouchScaling>) -> Self {
        let max = config.output.max_window_scale;
        Self {
            max_window_scale: if max > 0.0 { max as f32 } else { f32::INFINITY },
            integer_scale: config.output.integer_scale,
            linear_filter: config.output.linear_filter,
            upscaler: Upscaler::None,
            blur_mode: BlurMode::Off,
            blur_mode_old: BlurMode::Off,
            blur_radius: 0,
            blur_fade_start_ns: 0,
            blur_fade_duration: std::time::Duration::ZERO,
            zoom_scale: 1.0,
            fade: FadeMachine::new(std::time::Duration::from_millis(config.fade.duration_ms)),
            held_base: None,
            cached_base: BaseLayerInfo::default(),
            touch_scaling,
            first_frame: true,
        }
    }

    pub fn set_upscaler(&mut self, upscaler: Upscaler) {
        self.upscaler = upscaler;
    }

    pub fn set_blur(&mut self, mode: BlurMode, radius: u32, now_ns: u64) {
        if mode != self.blur_mode {
            self.blur_mode_old = self.blur_mode;
            self.blur_fade_start_ns = now_ns;
        }
        self.blur_mode = mode;
        self.blur_radius = radius;
    }

    pub fn set_blur_fade_duration(&mut self, duration: std::time::Duration) {
        self.blur_fade_duration = duration;
    }

    pub fn set_zoom_scale(&mut self, zoom: f32) {
        self.zoom_scale = zoom;
    }

    pub fn is_first_frame(&self) -> bool {
        self.first_frame
    }

    pub fn held_base(&self) -> Option<&Arc<Commit>> {
        self.held_base.as_ref()
    }

    pub fn cached_base(&self) -> BaseLayerInfo {
        self.cached_base
    }

    /// Focus changed: hand the outgoing base to the fade slot.
    pub fn on_focus_change(&mut self, new_focus_is_fade_target: bool) {
        let captured = self
            .held_base
            .clone()
            .map(|commit| (commit, self.cached_base));
        self.fade
            .on_focus_change(captured, new_focus_is_fade_target);
    }

    /// Scale for fitting `source` into `output`, honoring the configured cap
    /// and integer snapping.
    fn fit_scale(&self, source: (u32, u32), output: (u32, u32)) -> f32 {
        let sx = output.0 as f32 / source.0.max(1) as f32;
        let sy = output.1 as f32 / source.1.max(1) as f32;
        let mut scale = sx.min(sy).min(self.max_window_scale);
        if self.integer_scale && scale > 1.0 {
            scale = scale.floor();
        }
        scale
    }

    /// Builds the frame. Returns `None` when there is nothing valid to show
    /// (no base content at all).
    pub fn plan(&mut self, inputs: &PlanInputs<'_>) -> Option<FramePlan> {
        let _span = tracy_client::span!("Planner::plan");

        let mut plan = FramePlan::default();
        let output = inputs.output_size;
        let fade_opacity = self.fade.opacity(inputs.now_ns);

        // ---------------------------------------------------------------
        // Base plane
        // ---------------------------------------------------------------
        if let Some(focus) = &inputs.focus {
            let is_streaming = focus
                .window
                .roles
                .contains(crate::window::WindowRoles::STREAMING_CLIENT);

            if is_streaming {
                self.plan_streaming_base(&mut plan, inputs, focus);
            } else {
                match &focus.commit {
                    None => {
                        // No valid contents yet; keep showing what we held.
                        if let Some(held) = self.held_base.clone() {
                            self.push_cached_base(&mut plan, &held, self.cached_base, 1.0);
                        }
                    }
                    Some(commit) => {
                        if let Some(opacity) = fade_opacity {
                            self.fade.on_base_painted(inputs.now_ns);
                            if let Some((held, info)) = self.fade.held().cloned() {
                                self.push_cached_base(&mut plan, &held, info, 1.0 - opacity);
                            }
                            self.push_base_window(
                                &mut plan,
                                inputs,
                                focus,
                                commit.clone(),
                                opacity,
                            );
                        } else {
                            self.fade.cancel();
                            self.push_base_window(
                                &mut plan,
                                inputs,
                                focus,
                                commit.clone(),
                                1.0,
                            );

                            let needs_scaling = plan
                                .layers
                                .first()
                                .is_some_and(|l| l.scale.x > 1.0 && l.scale.y > 1.0);
                            plan.use_fsr_layer0 =
                                self.upscaler == Upscaler::Fsr && needs_scaling;
                            plan.use_nis_layer0 =
                                self.upscaler == Upscaler::Nis && needs_scaling;
                        }
                        self.held_base = Some(commit.clone());
                    }
                }
            }
        } else if let Some(held) = self.held_base.clone() {
            self.push_cached_base(&mut plan, &held, self.cached_base, 1.0);
        }

        // Layers past this point are decorations; a frame with no base is not
        // valid content for presentation.
        let valid_contents = !plan.layers.is_empty();

        // ---------------------------------------------------------------
        // Override pop-up
        // ---------------------------------------------------------------
        if let (Some(override_w), Some(focus)) = (&inputs.override_window, &inputs.focus) {
            let is_streaming = focus
                .window
                .roles
                .contains(crate::window::WindowRoles::STREAMING_CLIENT);
            if !is_streaming {
                if let Some(commit) = &override_w.commit {
                    self.push_override(&mut plan, inputs, focus, override_w, commit.clone());
                }
            }
        }

        // ---------------------------------------------------------------
        // External overlay, overlay, notification
        // ---------------------------------------------------------------
        if let Some(external) = &inputs.external_overlay {
            if external.window.opacity > 0 {
                if let Some(commit) = &external.commit {
                    // External overlays come pre-rendered at output size.
                    let layer = Layer {
                        texture: commit.texture.clone(),
                        framebuffer: commit.framebuffer,
                        source_size: (output.0, output.1),
                        scale: Vec2::ONE,
                        offset: Vec2::ZERO,
                        opacity: external.window.opacity as f32 / OPACITY_OPAQUE as f32,
                        zpos: Z_EXTERNAL_OVERLAY,
                        colorspace: commit_colorspace(commit),
                        linear_filter: true,
                        black_border: false,
                    };
                    if inputs.overlay_holds_input {
                        self.touch_scaling.publish(layer.scale, layer.offset);
                    }
                    plan.push(layer);
                }
            }
        }

        if let Some(overlay) = &inputs.overlay {
            if overlay.window.opacity > 0 {
                if let Some(commit) = &overlay.commit {
                    let src = (overlay.window.geometry.w, overlay.window.geometry.h);
                    let scale = self.fit_scale(src, output);
                    let offset = centered_offset(src, output, scale);
                    let layer = Layer {
                        texture: commit.texture.clone(),
                        framebuffer: commit.framebuffer,
                        source_size: src,
                        scale: Vec2::splat(scale),
                        offset,
                        opacity: overlay.window.opacity as f32 / OPACITY_OPAQUE as f32,
                        zpos: Z_OVERLAY,
                        colorspace: commit_colorspace(commit),
                        linear_filter: true,
                        black_border: !fills_output(src, output, scale),
                    };
                    if inputs.overlay_holds_input {
                        self.touch_scaling.publish(layer.scale, layer.offset);
                    }
                    plan.push(layer);
                }
            }
        }

        if let Some(notification) = &inputs.notification {
            if notification.window.opacity > 0 {
                if let Some(commit) = &notification.commit {
                    // Notifications scale like the main overlay and sit in the
                    // bottom-right corner.
                    let overlay_src = inputs
                        .overlay
                        .as_ref()
                        .map(|o| (o.window.geometry.w, o.window.geometry.h));
                    let src = (
                        notification.window.geometry.w,
                        notification.window.geometry.h,
                    );
                    let scale = self.fit_scale(overlay_src.unwrap_or(src), output);
                    let offset = Vec2::new(
                        output.0 as f32 - src.0 as f32 * scale,
                        output.1 as f32 - src.1 as f32 * scale,
                    );
                    plan.push(Layer {
                        texture: commit.texture.clone(),
                        framebuffer: commit.framebuffer,
                        source_size: src,
                        scale: Vec2::splat(scale),
                        offset,
                        opacity: notification.window.opacity as f32 / OPACITY_OPAQUE as f32,
                        zpos: Z_NOTIFICATION,
                        colorspace: commit_colorspace(commit),
                        linear_filter: true,
                        black_border: false,
                    });
                }
            }
        }

        // ---------------------------------------------------------------
        // Cursor
        // ---------------------------------------------------------------
        if let Some(cursor) = &inputs.cursor {
            let base = self.cached_base;
            let x = base.offset.x + cursor.position.0 as f32 * base.scale.x
                - cursor.hotspot.0 as f32;
            let y = base.offset.y + cursor.position.1 as f32 * base.scale.y
                - cursor.hotspot.1 as f32;
            plan.push(Layer {
                texture: cursor.texture.clone(),
                framebuffer: None,
                source_size: (cursor.texture.width(), cursor.texture.height()),
                scale: Vec2::ONE,
                offset: Vec2::new(x, y),
                opacity: 1.0,
                zpos: Z_CURSOR,
                colorspace: Colorspace::Srgb,
                linear_filter: false,
                black_border: false,
            });
        }

        if !valid_contents {
            return None;
        }

        // ---------------------------------------------------------------
        // Blur
        // ---------------------------------------------------------------
        let fade_elapsed = inputs.now_ns.saturating_sub(self.blur_fade_start_ns);
        let fade_total = self.blur_fade_duration.as_nanos() as u64;
        let blur_fading = fade_elapsed < fade_total;

        // While a mode switch fades, the stronger of the two modes applies.
        let current_mode = if blur_fading {
            self.blur_mode.max(self.blur_mode_old)
        } else {
            self.blur_mode
        };

        let blur_active = match current_mode {
            BlurMode::Off => false,
            BlurMode::Cond => plan.layers.len() > 1,
            BlurMode::Always => true,
        };
        if blur_active {
            plan.blur_layer0 = true;
            plan.blur_radius = self.blur_radius;
            if blur_fading {
                let mut ratio = fade_elapsed as f32 / fade_total as f32;
                if self.blur_mode <= self.blur_mode_old {
                    // Fading out.
                    ratio = 1.0 - ratio;
                }
                plan.blur_radius = (ratio * self.blur_radius as f32) as u32;
            }
            plan.use_fsr_layer0 = false;
            plan.use_nis_layer0 = false;
        }

        Some(plan)
    }

    /// Streaming clients show the video underlay as the base plane with the
    /// client UI above it; a fully-translucent UI contributes no layer but
    /// still owns the touch transform.
    fn plan_streaming_base(
        &mut self,
        plan: &mut FramePlan,
        inputs: &PlanInputs<'_>,
        focus: &PlanWindow<'_>,
    ) {
        let mut has_video = false;
        if let Some(video) = &inputs.streaming_video {
            if let Some(commit) = &video.commit {
                self.push_base_window(plan, inputs, video, commit.clone(), 1.0);
                has_video = true;
            }
        }

        if let Some(commit) = &focus.commit {
            let src = (focus.window.geometry.w, focus.window.geometry.h);
            let scale = self.fit_scale(src, inputs.output_size);
            let offset = centered_offset(src, inputs.output_size, scale);
            self.touch_scaling
                .publish(Vec2::splat(scale), offset);

            if focus.window.opacity > 0 {
                let zpos = if has_video { Z_OVERLAY } else { Z_BASE };
                plan.push(Layer {
                    texture: commit.texture.clone(),
                    framebuffer: commit.framebuffer,
                    source_size: src,
                    scale: Vec2::splat(scale),
                    offset,
                    opacity: 1.0,
                    zpos,
                    colorspace: commit_colorspace(commit),
                    linear_filter: self.linear_filter,
                    black_border: !has_video && !fills_output(src, inputs.output_size, scale),
                });
                if !has_video {
                    self.held_base = Some(commit.clone());
                }
            }
        }
    }

    fn push_base_window(
        &mut self,
        plan: &mut FramePlan,
        inputs: &PlanInputs<'_>,
        focus: &PlanWindow<'_>,
        commit: Arc<Commit>,
        opacity: f32,
    ) {
        let output = inputs.output_size;
        let mut src = (focus.window.geometry.w, focus.window.geometry.h);

        // Grow the source box to fit the override pop-up, as long as that
        // doesn't push the scale below 1.0.
        if let Some(override_w) = &inputs.override_window {
            let geo = override_w.window.geometry;
            let right = (geo.x + geo.w as i32).clamp(0, output.0 as i32) as u32;
            let bottom = (geo.y + geo.h as i32).clamp(0, output.1 as i32) as u32;
            src.0 = src.0.max(right);
            src.1 = src.1.max(bottom);
        }

        let scale = self.fit_scale(src, output);
        let mut offset = centered_offset(src, output, scale);

        if self.zoom_scale != 1.0 {
            if let Some(cursor) = &inputs.cursor {
                offset.x += (src.0 as f32 / 2.0 - cursor.position.0 as f32) * scale;
                offset.y += (src.1 as f32 / 2.0 - cursor.position.1 as f32) * scale;
            }
        }

        let info = BaseLayerInfo {
            scale: Vec2::splat(scale),
            offset,
            opacity,
        };

        let layer = Layer {
            texture: commit.texture.clone(),
            framebuffer: commit.framebuffer,
            source_size: src,
            scale: info.scale,
            offset: info.offset,
            opacity,
            zpos: Z_BASE,
            colorspace: commit_colorspace(&commit),
            linear_filter: self.linear_filter,
            black_border: !fills_output(src, output, scale),
        };

        self.touch_scaling.publish(layer.scale, layer.offset);
        self.cached_base = info;
        self.first_frame = false;
        plan.push(layer);
    }

    fn push_cached_base(
        &mut self,
        plan: &mut FramePlan,
        commit: &Arc<Commit>,
        info: BaseLayerInfo,
        opacity_scale: f32,
    ) {
        plan.push(Layer {
            texture: commit.texture.clone(),
            framebuffer: commit.framebuffer,
            source_size: (commit.texture.width(), commit.texture.height()),
            scale: info.scale,
            offset: info.offset,
            opacity: info.opacity * opacity_scale,
            zpos: Z_BASE,
            colorspace: commit_colorspace(commit),
            linear_filter: true,
            black_border: true,
        });
    }

    fn push_override(
        &mut self,
        plan: &mut FramePlan,
        inputs: &PlanInputs<'_>,
        focus: &PlanWindow<'_>,
        override_w: &PlanWindow<'_>,
        commit: Arc<Commit>,
    ) {
        let base = self.cached_base;
        let rel_x = override_w.window.geometry.x - focus.window.geometry.x;
        let rel_y = override_w.window.geometry.y - focus.window.geometry.y;

        plan.push(Layer {
            texture: commit.texture.clone(),
            framebuffer: commit.framebuffer,
            source_size: (override_w.window.geometry.w, override_w.window.geometry.h),
            scale: base.scale,
            offset: Vec2::new(
                base.offset.x + rel_x as f32 * base.scale.x,
                base.offset.y + rel_y as f32 * base.scale.y,
            ),
            opacity: 1.0,
            zpos: Z_OVERRIDE,
            colorspace: commit_colorspace(&commit),
            linear_filter: self.linear_filter,
            black_border: false,
        });
    }
}

fn centered_offset(source: (u32, u32), output: (u32, u32), scale: f32) -> Vec2 {
    Vec2::new(
        (output.0 as f32 - source.0 as f32 * scale) / 2.0,
        (output.1 as f32 - source.1 as f32 * scale) / 2.0,
    )
}

fn fills_output(source: (u32, u32), output: (u32, u32), scale: f32) -> bool {
    scale == 1.0 && source == output
}

fn commit_colorspace(commit: &Commit) -> Colorspace {
    commit
        .feedback
        .as_ref()
        .map(|feedback| Colorspace::from_vk(feedback.vk_colorspace))
        .unwrap_or_default()
}

// =============================================================================
// Composite policy
// =============================================================================

/// Per-frame inputs to the scan-out vs composite decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositePolicy {
    pub always_composite: bool,
    pub capture_requested: bool,
    pub first_frame: bool,
    /// Nearest-neighbour sampling requested for the game window.
    pub nearest_requested: bool,
    /// HDR inverse tone mapping active.
    pub hdr_itm_active: bool,
}

/// Scan-out is only allowed when the backend can express the whole plan with
/// planes; anything fancier routes through the Vulkan compositor.
pub fn needs_composite(plan: &FramePlan, caps: &BackendCaps, policy: &CompositePolicy) -> bool {
    if policy.always_composite
        || policy.capture_requested
        || policy.first_frame
        || policy.hdr_itm_active
    {
        return true;
    }

    if plan.use_fsr_layer0 || plan.use_nis_layer0 || plan.blur_layer0 {
        return true;
    }

    let base_scaled = plan
        .layers
        .first()
        .is_some_and(|l| l.scale != Vec2::ONE);
    if policy.nearest_requested && base_scaled {
        return true;
    }

    if !caps.supports_modifiers {
        return true;
    }

    let base_is_hdr = plan
        .layers
        .first()
        .is_some_and(|l| l.colorspace.is_hdr());
    if base_is_hdr && !caps.supports_color_management {
        return true;
    }

    if plan.has_cursor_layer() && !caps.supports_plane_cursor {
        return true;
    }

    plan.non_cursor_layers() >= 2 && plan.layers.len() > caps.max_planes
}

// =============================================================================
// Test support
// =============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::mpsc;
    use std::sync::Arc;

    use super::*;
    use crate::buffer::{MemoryBuffer, DRM_FORMAT_ARGB8888};
    use crate::commit::Commit;
    use crate::reactor::FenceWaiter;
    use crate::surface::SurfaceId;

    pub fn commit_for_tests(width: u32, height: u32) -> Arc<Commit> {
        let (events, _rx) = mpsc::channel();
        let buffer = Arc::new(MemoryBuffer::new(width, height, DRM_FORMAT_ARGB8888));
        let commit = Commit::new(
            SurfaceId(999),
            buffer,
            Arc::new(Texture::for_tests(width, height)),
            None,
            None,
            Vec::new(),
            None,
            None,
            0,
            false,
            false,
            Arc::new(FenceWaiter::spawn().unwrap()),
            events,
        );
        commit.mark_ready();
        commit
    }

    pub fn held_commit_for_tests() -> (Arc<Commit>, BaseLayerInfo) {
        (commit_for_tests(64, 64), BaseLayerInfo::default())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::test_support::commit_for_tests;
    use super::*;
    use crate::utils::Rect;
    use crate::window::XWindowId;

    fn planner() -> Planner {
        let config = monocle_config::Config::default();
        Planner::new(&config, Arc::new(TouchScaling::default()))
    }

    fn planner_with_fade(ms: u64) -> Planner {
        let mut config = monocle_config::Config::default();
        config.fade.duration_ms = ms;
        Planner::new(&config, Arc::new(TouchScaling::default()))
    }

    fn window(id: u32, rect: Rect) -> Window {
        let mut w = Window::new(XWindowId(id), rect, false, true);
        w.mapped = true;
        w.app_id = 1;
        w
    }

    fn inputs<'a>(
        focus: Option<PlanWindow<'a>>,
        output: (u32, u32),
        now_ns: u64,
    ) -> PlanInputs<'a> {
        PlanInputs {
            focus,
            override_window: None,
            overlay: None,
            external_overlay: None,
            notification: None,
            streaming_video: None,
            cursor: None,
            overlay_holds_input: false,
            output_size: output,
            now_ns,
        }
    }

    #[test]
    fn single_client_identity_scale() {
        let mut planner = planner();
        let w = window(1, Rect::from_size(1920, 1080));
        let commit = commit_for_tests(1920, 1080);

        let plan = planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w,
                    commit: Some(commit),
                }),
                (1920, 1080),
                0,
            ))
            .unwrap();

        assert_eq!(plan.layers.len(), 1);
        let layer = &plan.layers[0];
        assert_eq!(layer.scale, Vec2::ONE);
        assert_eq!(layer.offset, Vec2::ZERO);
        assert_eq!(layer.opacity, 1.0);
        assert!(!layer.black_border);
        assert_eq!(layer.zpos, Z_BASE);
    }

    #[test]
    fn letterbox_720p_to_1080p() {
        let mut planner = planner();
        let w = window(1, Rect::from_size(1280, 720));
        let commit = commit_for_tests(1280, 720);

        let plan = planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w,
                    commit: Some(commit),
                }),
                (1920, 1080),
                0,
            ))
            .unwrap();

        let layer = &plan.layers[0];
        assert_relative_eq!(layer.scale.x, 1.5);
        assert_relative_eq!(layer.scale.y, 1.5);
        assert_relative_eq!(layer.offset.x, 0.0);
        assert_relative_eq!(layer.offset.y, 0.0);
        assert!(layer.black_border);
    }

    #[test]
    fn dropdown_override_positioning() {
        let mut planner = planner();
        let focus_w = window(1, Rect::from_size(1920, 1080));
        let override_w = window(2, Rect::new(40, 20, 300, 200));
        let focus_commit = commit_for_tests(1920, 1080);
        let override_commit = commit_for_tests(300, 200);

        let mut inputs = inputs(
            Some(PlanWindow {
                window: &focus_w,
                commit: Some(focus_commit),
            }),
            (1920, 1080),
            0,
        );
        inputs.override_window = Some(PlanWindow {
            window: &override_w,
            commit: Some(override_commit),
        });

        let plan = planner.plan(&inputs).unwrap();
        assert_eq!(plan.layers.len(), 2);

        let base = &plan.layers[0];
        assert_eq!(base.zpos, Z_BASE);
        assert_eq!(base.scale, Vec2::ONE);

        let over = &plan.layers[1];
        assert_eq!(over.zpos, Z_OVERRIDE);
        assert_eq!(over.scale, base.scale);
        assert_relative_eq!(over.offset.x, 40.0);
        assert_relative_eq!(over.offset.y, 20.0);
    }

    #[test]
    fn fade_emits_two_base_layers_at_complementary_opacity() {
        let ms = 1_000_000u64; // ns per ms
        let mut planner = planner_with_fade(200);
        let w = window(1, Rect::from_size(1920, 1080));

        // Establish focus A's base.
        let commit_a = commit_for_tests(1920, 1080);
        planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w,
                    commit: Some(commit_a),
                }),
                (1920, 1080),
                0,
            ))
            .unwrap();

        // Focus switches to B at t=0.
        planner.on_focus_change(false);

        // B's first commit becomes ready at t=16ms.
        let w_b = window(2, Rect::from_size(1920, 1080));
        let commit_b = commit_for_tests(1920, 1080);
        let plan = planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w_b,
                    commit: Some(commit_b.clone()),
                }),
                (1920, 1080),
                16 * ms,
            ))
            .unwrap();
        // Fade just started: old frame fully opaque, new fully transparent.
        assert_eq!(plan.layers.len(), 2);
        assert_relative_eq!(plan.layers[0].opacity, 1.0);
        assert_relative_eq!(plan.layers[1].opacity, 0.0);

        // Mid-fade at t=116ms (100ms into the 200ms fade).
        let plan = planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w_b,
                    commit: Some(commit_b.clone()),
                }),
                (1920, 1080),
                116 * ms,
            ))
            .unwrap();
        assert_eq!(plan.layers.len(), 2);
        assert_relative_eq!(plan.layers[0].opacity, 0.5, epsilon = 0.01);
        assert_relative_eq!(plan.layers[1].opacity, 0.5, epsilon = 0.01);

        // Past the end only B remains.
        let plan = planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w_b,
                    commit: Some(commit_b),
                }),
                (1920, 1080),
                300 * ms,
            ))
            .unwrap();
        assert_eq!(plan.layers.len(), 1);
        assert_relative_eq!(plan.layers[0].opacity, 1.0);
    }

    #[test]
    fn focus_without_commit_keeps_previous_base() {
        let mut planner = planner();
        let w = window(1, Rect::from_size(1920, 1080));
        let commit = commit_for_tests(1920, 1080);
        let commit_id = commit.id();

        planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w,
                    commit: Some(commit),
                }),
                (1920, 1080),
                0,
            ))
            .unwrap();

        // Next frame the (new) focus has no ready commit.
        let w2 = window(2, Rect::from_size(1280, 720));
        let plan = planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w2,
                    commit: None,
                }),
                (1920, 1080),
                16_000_000,
            ))
            .unwrap();
        assert_eq!(plan.layers.len(), 1);
        assert_eq!(planner.held_base().unwrap().id(), commit_id);
    }

    #[test]
    fn zoom_shifts_towards_cursor() {
        let mut planner = planner();
        planner.set_zoom_scale(2.0);
        let w = window(1, Rect::from_size(1920, 1080));
        let commit = commit_for_tests(1920, 1080);

        let mut input = inputs(
            Some(PlanWindow {
                window: &w,
                commit: Some(commit),
            }),
            (1920, 1080),
            0,
        );
        input.cursor = Some(CursorPlan {
            texture: Arc::new(Texture::for_tests(24, 24)),
            position: (100.0, 100.0),
            hotspot: (0, 0),
        });

        let plan = planner.plan(&input).unwrap();
        let base = &plan.layers[0];
        // Shift = (src/2 - cursor) * scale.
        assert_relative_eq!(base.offset.x, (1920.0 / 2.0 - 100.0) * 1.0);
        assert_relative_eq!(base.offset.y, (1080.0 / 2.0 - 100.0) * 1.0);
    }

    #[test]
    fn notification_sits_bottom_right() {
        let mut planner = planner();
        let focus_w = window(1, Rect::from_size(1920, 1080));
        let note_w = {
            let mut w = window(3, Rect::from_size(300, 100));
            w.roles |= crate::window::WindowRoles::OVERLAY;
            w
        };

        let mut input = inputs(
            Some(PlanWindow {
                window: &focus_w,
                commit: Some(commit_for_tests(1920, 1080)),
            }),
            (1920, 1080),
            0,
        );
        input.notification = Some(PlanWindow {
            window: &note_w,
            commit: Some(commit_for_tests(300, 100)),
        });

        let plan = planner.plan(&input).unwrap();
        let note = plan
            .layers
            .iter()
            .find(|l| l.zpos == Z_NOTIFICATION)
            .unwrap();
        assert_relative_eq!(note.offset.x, 1920.0 - 300.0);
        assert_relative_eq!(note.offset.y, 1080.0 - 100.0);
    }

    #[test]
    fn composite_policy() {
        let caps = BackendCaps {
            supports_modifiers: true,
            supports_tearing: true,
            supports_plane_cursor: true,
            uses_vulkan_swapchain: false,
            is_session_based: true,
            supports_explicit_sync: true,
            supports_color_management: false,
            max_planes: 2,
        };

        let mut planner = planner();
        let w = window(1, Rect::from_size(1920, 1080));
        let plan = planner
            .plan(&inputs(
                Some(PlanWindow {
                    window: &w,
                    commit: Some(commit_for_tests(1920, 1080)),
                }),
                (1920, 1080),
                0,
            ))
            .unwrap();

        // Single SDR plane on a capable backend scans out directly.
        assert!(!needs_composite(&plan, &caps, &CompositePolicy::default()));

        // First frame always composites.
        assert!(needs_composite(
            &plan,
            &caps,
            &CompositePolicy {
                first_frame: true,
                ..Default::default()
            }
        ));

        // A capture forces composition.
        assert!(needs_composite(
            &plan,
            &caps,
            &CompositePolicy {
                capture_requested: true,
                ..Default::default()
            }
        ));

        // No modifier support forces composition.
        let mut no_mods = caps;
        no_mods.supports_modifiers = false;
        assert!(needs_composite(&plan, &no_mods, &CompositePolicy::default()));
    }

    #[test]
    fn touch_scaling_round_trip() {
        let scaling = TouchScaling::default();
        scaling.publish(Vec2::splat(1.5), Vec2::new(0.0, 60.0));

        let (x, y) = scaling.to_surface(960.0, 600.0);
        assert_relative_eq!(x, 640.0, epsilon = 1e-6);
        assert_relative_eq!(y, 360.0, epsilon = 1e-6);
    }
}
