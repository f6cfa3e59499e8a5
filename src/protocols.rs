//! Wire-level types for the compositor's custom Wayland protocols.
//!
//! The protocol machinery itself (socket handling, resource lifetimes) lives
//! in the embedded Wayland server and is out of scope here; this module keeps
//! the typed requests flowing in and events flowing out, with names, argument
//! lists and flag values matching the published XML.

use std::path::PathBuf;
use std::sync::Arc;

use crate::buffer::ClientBuffer;
use crate::surface::SurfaceId;
use crate::window::{ContextId, XWindowId};

// =============================================================================
// Identifiers
// =============================================================================

/// A bound `gamescope_swapchain` resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapchainId(pub u64);

// =============================================================================
// Requests
// =============================================================================

/// Requests accepted by the server thread.
///
/// Each variant corresponds to a request on one of the published globals:
/// `gamescope_xwayland`, `gamescope_swapchain_factory_v2`,
/// `gamescope_swapchain`, `gamescope_control`, `wp_presentation` and the
/// core surface interface.
#[derive(Debug)]
pub enum ClientRequest {
    /// `wl_surface.commit` with an attached buffer.
    Commit {
        surface: SurfaceId,
        buffer: Option<Arc<dyn ClientBuffer>>,
    },
    /// `wp_presentation.feedback`.
    Feedback { surface: SurfaceId },
    /// `gamescope_swapchain_factory_v2.create_swapchain`.
    CreateSwapchain {
        surface: SurfaceId,
        swapchain: SwapchainId,
    },
    /// `gamescope_xwayland.override_window_content` (legacy, no swapchain) or
    /// `gamescope_swapchain.override_window_content`.
    OverrideWindowContent {
        swapchain: Option<SwapchainId>,
        surface: SurfaceId,
        server: ContextId,
        x11_window: XWindowId,
    },
    /// `gamescope_swapchain.swapchain_feedback`.
    SwapchainFeedback {
        surface: SurfaceId,
        feedback: SwapchainFeedback,
    },
    /// `gamescope_swapchain.set_hdr_metadata`.
    SetHdrMetadata {
        surface: SurfaceId,
        metadata: HdrMetadataInfoframe,
    },
    /// `gamescope_swapchain.set_present_mode`.
    SetPresentMode {
        surface: SurfaceId,
        present_mode: PresentMode,
    },
    /// `gamescope_swapchain.set_present_time`.
    SetPresentTime {
        surface: SurfaceId,
        present_id: u32,
        desired_present_time: u64,
    },
    /// `wp_linux_drm_syncobj_surface_v1.set_acquire_point` and
    /// `set_release_point`, delivered together before the commit they apply
    /// to. `None` detaches explicit sync from the surface.
    SetSyncobjState {
        surface: SurfaceId,
        state: Option<crate::surface::SyncobjState>,
    },
    /// `gamescope_control.set_app_target_refresh_cycle`.
    SetAppTargetRefreshCycle { fps: u32, flags: RefreshCycleFlags },
    /// `gamescope_control.take_screenshot`.
    TakeScreenshot {
        path: Option<PathBuf>,
        kind: ScreenshotType,
        flags: u32,
    },
    /// Surface went away on the client side.
    DestroySurface { surface: SurfaceId },
}

// =============================================================================
// Events
// =============================================================================

/// Events sent back to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// `wp_presentation_feedback.presented`.
    Presented {
        surface: SurfaceId,
        tv_sec_hi: u32,
        tv_sec_lo: u32,
        tv_nsec: u32,
        refresh: u32,
        seq_hi: u32,
        seq_lo: u32,
        flags: PresentationFlags,
    },
    /// `wp_presentation_feedback.discarded`.
    Discarded { surface: SurfaceId },
    /// `wl_surface.frame` callback completion.
    FrameDone { surface: SurfaceId },
    /// `gamescope_swapchain.retired`.
    Retired { swapchain: SwapchainId },
    /// `gamescope_swapchain.past_present_timing`.
    PastPresentTiming {
        surface: SurfaceId,
        present_id: u32,
        desired_present_time: u64,
        actual_present_time: u64,
        earliest_present_time: u64,
        present_margin: u64,
    },
    /// `gamescope_swapchain.refresh_cycle`.
    RefreshCycle { surface: SurfaceId, refresh_cycle: u64 },
    /// `gamescope_control.feature_support`, enumerated at bind.
    FeatureSupport {
        feature: ControlFeature,
        version: u32,
        flags: u32,
    },
    /// `gamescope_control.active_display_info`.
    ActiveDisplayInfo {
        name: String,
        make: String,
        model: String,
        flags: DisplayFlags,
        rates: Vec<u32>,
    },
    /// Protocol error raised on the offending object.
    ProtocolError { surface: SurfaceId, message: String },
}

pub type EventSender = std::sync::mpsc::Sender<ClientEvent>;

bitflags::bitflags! {
    /// `wp_presentation_feedback.kind`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PresentationFlags: u32 {
        const VSYNC = 1;
        const HW_CLOCK = 2;
        const HW_COMPLETION = 4;
        const ZERO_COPY = 8;
    }
}

impl PresentationFlags {
    /// Flags attached to every `presented` event. HW_COMPLETION is never set:
    /// feedback fires at latch time, not at true scan-out completion.
    pub fn latch_time() -> Self {
        Self::VSYNC | Self::HW_CLOCK | Self::ZERO_COPY
    }
}

bitflags::bitflags! {
    /// Flags of `gamescope_control.set_app_target_refresh_cycle`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RefreshCycleFlags: u32 {
        const INTERNAL_DISPLAY = 1;
        const ALLOW_REFRESH_SWITCHING = 2;
        const ONLY_CHANGE_REFRESH_RATE = 4;
    }
}

bitflags::bitflags! {
    /// Flags of `gamescope_control.active_display_info`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DisplayFlags: u32 {
        const INTERNAL = 1;
        const VRR = 2;
        const HDR = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlFeature {
    Reshade = 1,
    DisplayInfo = 2,
    PixelFilter = 3,
    RefreshCycle = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ScreenshotType {
    #[default]
    AllRealLayers = 0,
    BasePlaneOnly = 1,
    FullComposition = 2,
    ScreenBuffer = 3,
}

impl ScreenshotType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::BasePlaneOnly,
            2 => Self::FullComposition,
            3 => Self::ScreenBuffer,
            _ => Self::AllRealLayers,
        }
    }
}

// =============================================================================
// Swapchain feedback
// =============================================================================

/// Vulkan present mode, as carried by `set_present_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum PresentMode {
    Immediate = 0,
    Mailbox = 1,
    #[default]
    Fifo = 2,
    FifoRelaxed = 3,
}

impl PresentMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Immediate,
            1 => Self::Mailbox,
            3 => Self::FifoRelaxed,
            _ => Self::Fifo,
        }
    }

    pub fn is_tearing(self) -> bool {
        matches!(self, Self::Immediate | Self::FifoRelaxed)
    }

    pub fn is_fifo(self) -> bool {
        matches!(self, Self::Fifo)
    }
}

/// Snapshot of `gamescope_swapchain.swapchain_feedback`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainFeedback {
    pub image_count: u32,
    pub vk_format: u32,
    pub vk_colorspace: u32,
    pub vk_composite_alpha: u32,
    pub vk_pre_transform: u32,
    pub vk_clipped: bool,
    pub hdr_metadata_blob: Option<crate::backend::BlobHandle>,
}

// VK_COLOR_SPACE values we care about for composition decisions.
pub const VK_COLOR_SPACE_SRGB_NONLINEAR: u32 = 0;
pub const VK_COLOR_SPACE_HDR10_ST2084: u32 = 1_000_104_008;
pub const VK_COLOR_SPACE_BT709_LINEAR: u32 = 1_000_104_009;

/// Colour space attached to a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colorspace {
    #[default]
    Srgb,
    Linear,
    Hdr10Pq,
    Passthru,
}

impl Colorspace {
    pub fn from_vk(colorspace: u32) -> Self {
        match colorspace {
            VK_COLOR_SPACE_HDR10_ST2084 => Self::Hdr10Pq,
            VK_COLOR_SPACE_BT709_LINEAR => Self::Linear,
            _ => Self::Srgb,
        }
    }

    pub fn is_hdr(self) -> bool {
        matches!(self, Self::Hdr10Pq)
    }
}

// =============================================================================
// HDR metadata
// =============================================================================

/// CTA-861-G Type 1 static metadata, in protocol units.
///
/// Chromaticity coordinates are `round(v * 50000)`; max mastering luminance is
/// in nits; min mastering luminance is `round(nits * 10000)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HdrMetadataInfoframe {
    pub display_primary_red: (u16, u16),
    pub display_primary_green: (u16, u16),
    pub display_primary_blue: (u16, u16),
    pub white_point: (u16, u16),
    pub max_display_mastering_luminance: u16,
    pub min_display_mastering_luminance: u16,
    pub max_cll: u16,
    pub max_fall: u16,
}

impl HdrMetadataInfoframe {
    pub fn encode_chromaticity(value: f64) -> u16 {
        (value * 50_000.0).round() as u16
    }

    pub fn encode_max_luminance(nits: f64) -> u16 {
        nits.round() as u16
    }

    pub fn encode_min_luminance(nits: f64) -> u16 {
        (nits * 10_000.0).round() as u16
    }

    /// Garbage metadata is tossed rather than forwarded to the display.
    pub fn is_valid(&self) -> bool {
        self.max_cll != 0
            && self.max_fall != 0
            && (self.white_point.0 != 0 || self.white_point.1 != 0)
    }

    /// Serializes in the field order of `hdr_metadata_infoframe`, suitable for
    /// a backend blob.
    pub fn to_blob_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(26);
        let coords = [
            self.display_primary_red,
            self.display_primary_green,
            self.display_primary_blue,
            self.white_point,
        ];
        for (x, y) in coords {
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        out.extend_from_slice(&self.max_display_mastering_luminance.to_le_bytes());
        out.extend_from_slice(&self.min_display_mastering_luminance.to_le_bytes());
        out.extend_from_slice(&self.max_cll.to_le_bytes());
        out.extend_from_slice(&self.max_fall.to_le_bytes());
        out
    }
}

// =============================================================================
// Control properties on the root of XWayland #0
// =============================================================================

pub mod atoms {
    pub const GAMESCOPE_FOCUSED_APP: &str = "GAMESCOPE_FOCUSED_APP";
    pub const GAMESCOPE_FOCUSED_APP_GFX: &str = "GAMESCOPE_FOCUSED_APP_GFX";
    pub const GAMESCOPE_FOCUSED_WINDOW: &str = "GAMESCOPE_FOCUSED_WINDOW";
    pub const GAMESCOPE_FOCUSABLE_APPS: &str = "GAMESCOPE_FOCUSABLE_APPS";
    pub const GAMESCOPE_FOCUSABLE_WINDOWS: &str = "GAMESCOPE_FOCUSABLE_WINDOWS";
    pub const GAMESCOPE_FOCUS_DISPLAY: &str = "GAMESCOPE_FOCUS_DISPLAY";
    pub const GAMESCOPE_MOUSE_FOCUS_DISPLAY: &str = "GAMESCOPE_MOUSE_FOCUS_DISPLAY";
    pub const GAMESCOPE_KEYBOARD_FOCUS_DISPLAY: &str = "GAMESCOPE_KEYBOARD_FOCUS_DISPLAY";
    pub const GAMESCOPE_INPUT_COUNTER: &str = "GAMESCOPE_INPUT_COUNTER";
    pub const GAMESCOPE_FSR_FEEDBACK: &str = "GAMESCOPE_FSR_FEEDBACK";
    pub const GAMESCOPECTRL_BASELAYER_APPID: &str = "GAMESCOPECTRL_BASELAYER_APPID";
    pub const GAMESCOPECTRL_BASELAYER_WINDOW: &str = "GAMESCOPECTRL_BASELAYER_WINDOW";
    pub const GAMESCOPE_XWAYLAND_MODE_CONTROL: &str = "GAMESCOPE_XWAYLAND_MODE_CONTROL";
    pub const GAMESCOPE_FPS_LIMIT: &str = "GAMESCOPE_FPS_LIMIT";
    pub const GAMESCOPE_DYNAMIC_REFRESH: &str = "GAMESCOPE_DYNAMIC_REFRESH";
    pub const GAMESCOPE_DYNAMIC_REFRESH_EXTERNAL: &str = "GAMESCOPE_DYNAMIC_REFRESH_EXTERNAL";
    pub const GAMESCOPE_SCREENSHOT: &str = "GAMESCOPE_SCREENSHOT";
    pub const GAMESCOPE_TUNEABLE_VBLANK_REDZONE: &str = "GAMESCOPE_TUNEABLE_VBLANK_REDZONE";
    pub const GAMESCOPE_TUNEABLE_VBLANK_RATE_OF_DECAY_PERCENTAGE: &str =
        "GAMESCOPE_TUNEABLE_VBLANK_RATE_OF_DECAY_PERCENTAGE";
    pub const NET_WM_STATE: &str = "_NET_WM_STATE";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presentation_flags_never_hw_completion() {
        let flags = PresentationFlags::latch_time();
        assert!(flags.contains(PresentationFlags::VSYNC));
        assert!(flags.contains(PresentationFlags::HW_CLOCK));
        assert!(flags.contains(PresentationFlags::ZERO_COPY));
        assert!(!flags.contains(PresentationFlags::HW_COMPLETION));
    }

    #[test]
    fn hdr_encoding_units() {
        // Rec. 709 red x = 0.640 -> 32000 in protocol units.
        assert_eq!(HdrMetadataInfoframe::encode_chromaticity(0.640), 32000);
        assert_eq!(HdrMetadataInfoframe::encode_max_luminance(1000.0), 1000);
        // 0.05 nits minimum -> 500.
        assert_eq!(HdrMetadataInfoframe::encode_min_luminance(0.05), 500);
    }

    #[test]
    fn hdr_validity() {
        let mut metadata = HdrMetadataInfoframe {
            white_point: (15635, 16450),
            max_cll: 1000,
            max_fall: 400,
            ..Default::default()
        };
        assert!(metadata.is_valid());
        metadata.max_cll = 0;
        assert!(!metadata.is_valid());
    }

    #[test]
    fn present_mode_tearing() {
        assert!(PresentMode::Immediate.is_tearing());
        assert!(!PresentMode::Fifo.is_tearing());
        assert!(PresentMode::from_raw(2).is_fifo());
    }
}
