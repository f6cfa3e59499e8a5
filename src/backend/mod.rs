//! Abstract presentation targets.
//!
//! A backend is whatever ends up showing the frame: direct KMS scan-out, a
//! Vulkan swapchain in a host window, a nested Wayland surface, or nothing at
//! all. The paint loop only ever talks to this trait; plane programming and
//! windowing-system details stay behind it.

mod headless;
mod nested;

use std::os::fd::OwnedFd;
use std::sync::Arc;

pub use headless::HeadlessBackend;
pub use nested::{HostWindow, NestedBackend};

use crate::buffer::{BufferId, DmabufAttributes};
use crate::planner::FramePlan;

/// A backend-side framebuffer usable for direct scan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub u32);

/// An opaque property blob (HDR metadata and the like).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCaps {
    pub supports_modifiers: bool,
    pub supports_tearing: bool,
    pub supports_plane_cursor: bool,
    pub uses_vulkan_swapchain: bool,
    pub is_session_based: bool,
    pub supports_explicit_sync: bool,
    pub supports_color_management: bool,
    /// Hardware planes available for direct scan-out.
    pub max_planes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScreenType {
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_mhz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HdrCaps {
    pub supported: bool,
    pub active: bool,
}

/// What a connector tells us about the attached display.
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub name: String,
    pub make: String,
    pub model: String,
    pub screen_type: ScreenType,
    pub orientation: Orientation,
    pub hdr: HdrCaps,
    pub edid: Vec<u8>,
    pub modes: Vec<DisplayMode>,
    pub vrr_capable: bool,
    /// Rates valid for dynamic refresh switching, in mHz.
    pub dynamic_refresh_rates_mhz: Vec<u32>,
}

/// Timing hints for the frame scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    pub target_vblank_ns: u64,
    pub wakeup_point_ns: u64,
}

#[derive(Debug)]
pub enum PresentError {
    /// The display pipe rejected the configuration for now (EBUSY).
    Busy,
    /// Not enough bandwidth/planes (ENOSPC).
    NoSpace,
    /// VT-switched away (EACCES); skip painting silently.
    SessionInactive,
    Other(anyhow::Error),
}

impl PresentError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBUSY => Self::Busy,
            libc::ENOSPC => Self::NoSpace,
            libc::EACCES => Self::SessionInactive,
            other => Self::Other(anyhow::anyhow!(
                "present failed: {}",
                std::io::Error::from_raw_os_error(other)
            )),
        }
    }

    /// Errors worth retrying as a full composite.
    pub fn wants_composite_fallback(&self) -> bool {
        matches!(self, Self::Busy | Self::NoSpace)
    }
}

/// Server-thread-safe dma-buf import for scan-out caching.
pub trait ScanoutImporter: Send + Sync {
    fn import_dmabuf(&self, buffer: BufferId, attrs: &DmabufAttributes)
        -> Option<FramebufferHandle>;
}

/// Server-thread-safe blob creation (HDR metadata infoframes).
pub trait BlobFactory: Send + Sync {
    fn create_blob(&self, data: &[u8]) -> anyhow::Result<BlobHandle>;
}

/// Blob "creation" for backends with no display hardware to hand blobs to.
#[derive(Default)]
pub struct SimpleBlobFactory {
    next: std::sync::atomic::AtomicU64,
}

impl BlobFactory for SimpleBlobFactory {
    fn create_blob(&self, _data: &[u8]) -> anyhow::Result<BlobHandle> {
        Ok(BlobHandle(
            self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1,
        ))
    }
}

/// Window hints for nested backends.
pub trait NestedHints {
    fn set_title(&mut self, title: Option<&str>);
    fn set_icon(&mut self, rgba: Option<&[u32]>);
    fn set_cursor_image(&mut self, rgba: Option<(Vec<u32>, u32, u32)>);
    fn set_relative_mouse(&mut self, relative: bool);
    fn set_visible(&mut self, visible: bool);
}

pub trait Backend: Send {
    fn name(&self) -> &str;
    fn caps(&self) -> &BackendCaps;

    fn init(&mut self) -> anyhow::Result<()>;
    fn post_init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Marks the output state stale; the next `poll_state` refreshes it and
    /// `force_modeset` additionally requests a full modeset.
    fn dirty_state(&mut self, force: bool, force_modeset: bool);

    /// Refreshes connector/mode state. Returns true when anything changed
    /// (and a repaint is warranted).
    fn poll_state(&mut self) -> anyhow::Result<bool>;

    fn scanout_importer(&self) -> Option<Arc<dyn ScanoutImporter>> {
        None
    }

    fn blob_factory(&self) -> Arc<dyn BlobFactory>;

    fn create_blob(&mut self, data: &[u8]) -> anyhow::Result<BlobHandle> {
        self.blob_factory().create_blob(data)
    }

    /// Presents the plan. Multi-plane plans require scan-out support; nested
    /// and Vulkan backends only accept single-layer, pre-composited plans.
    fn present(&mut self, plan: &FramePlan, async_flip: bool) -> Result<(), PresentError>;

    fn connector(&self, screen: ScreenType) -> Option<&ConnectorInfo>;

    fn frame_sync(&self) -> FrameSync;

    /// Framebuffers invalidated since the last call (device unplug, etc.).
    fn take_destroyed_framebuffers(&mut self) -> Vec<FramebufferHandle> {
        Vec::new()
    }

    fn hints(&mut self) -> Option<&mut dyn NestedHints> {
        None
    }

    fn output_size(&self) -> (u32, u32);
    fn current_refresh_mhz(&self) -> u32;

    fn set_refresh_mhz(&mut self, _mhz: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// DRM fd used for explicit-sync timelines, when the backend has one.
    fn sync_device(&self) -> Option<Arc<OwnedFd>> {
        None
    }
}
