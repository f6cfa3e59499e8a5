//! Nested backend: present into a host window.
//!
//! The host window (an SDL window, a Wayland toplevel, anything that can blit
//! a texture) sits behind the `HostWindow` trait. Everything composites before
//! it gets here; the nested backend only accepts single-layer plans.

use crate::planner::FramePlan;
use crate::render::Texture;
use crate::utils::{get_monotonic_time_nanos, mhz_to_refresh_cycle};

use std::sync::Arc;

use super::{
    Backend, BackendCaps, BlobFactory, ConnectorInfo, DisplayMode, FrameSync, HdrCaps,
    NestedHints, Orientation, PresentError, ScreenType, SimpleBlobFactory,
};

/// The window the nested session lives in.
pub trait HostWindow: Send {
    fn size(&self) -> (u32, u32);
    fn refresh_mhz(&self) -> u32;
    fn present(&mut self, texture: &Texture, async_flip: bool) -> Result<(), PresentError>;
    fn set_title(&mut self, title: Option<&str>);
    fn set_icon(&mut self, rgba: Option<&[u32]>);
    fn set_cursor_image(&mut self, rgba: Option<(Vec<u32>, u32, u32)>);
    fn set_relative_mouse(&mut self, relative: bool);
    fn set_visible(&mut self, visible: bool);
}

pub struct NestedBackend {
    caps: BackendCaps,
    connector: ConnectorInfo,
    host: Box<dyn HostWindow>,
    blobs: Arc<SimpleBlobFactory>,
    state_dirty: bool,
}

impl NestedBackend {
    pub fn new(host: Box<dyn HostWindow>) -> Self {
        let (width, height) = host.size();
        let refresh_mhz = host.refresh_mhz().max(1);
        let connector = ConnectorInfo {
            name: "Nested-1".to_owned(),
            make: "Monocle".to_owned(),
            model: "Nested".to_owned(),
            screen_type: ScreenType::External,
            orientation: Orientation::Normal,
            hdr: HdrCaps::default(),
            edid: Vec::new(),
            modes: vec![DisplayMode {
                width,
                height,
                refresh_mhz,
            }],
            vrr_capable: false,
            dynamic_refresh_rates_mhz: Vec::new(),
        };

        Self {
            caps: BackendCaps {
                supports_modifiers: false,
                supports_tearing: false,
                supports_plane_cursor: false,
                uses_vulkan_swapchain: true,
                is_session_based: false,
                supports_explicit_sync: false,
                supports_color_management: false,
                // Everything must composite down to one image.
                max_planes: 1,
            },
            connector,
            host,
            blobs: Arc::new(SimpleBlobFactory::default()),
            state_dirty: false,
        }
    }
}

impl Backend for NestedBackend {
    fn name(&self) -> &str {
        "nested"
    }

    fn caps(&self) -> &BackendCaps {
        &self.caps
    }

    fn init(&mut self) -> anyhow::Result<()> {
        let (w, h) = self.host.size();
        info!("nested backend in a {w}x{h} host window");
        Ok(())
    }

    fn dirty_state(&mut self, _force: bool, _force_modeset: bool) {
        self.state_dirty = true;
    }

    fn poll_state(&mut self) -> anyhow::Result<bool> {
        if !self.state_dirty {
            return Ok(false);
        }
        self.state_dirty = false;

        let (width, height) = self.host.size();
        let refresh_mhz = self.host.refresh_mhz().max(1);
        let mode = DisplayMode {
            width,
            height,
            refresh_mhz,
        };
        let changed = self.connector.modes.first() != Some(&mode);
        self.connector.modes = vec![mode];
        Ok(changed)
    }

    fn blob_factory(&self) -> Arc<dyn BlobFactory> {
        self.blobs.clone()
    }

    fn present(&mut self, plan: &FramePlan, async_flip: bool) -> Result<(), PresentError> {
        let Some(layer) = plan.layers.first() else {
            return Ok(());
        };
        if plan.layers.len() != 1 {
            return Err(PresentError::Other(anyhow::anyhow!(
                "nested backend needs a composited single-layer plan, got {}",
                plan.layers.len()
            )));
        }

        self.host.present(&layer.texture, async_flip)
    }

    fn connector(&self, screen: ScreenType) -> Option<&ConnectorInfo> {
        (screen == ScreenType::External).then_some(&self.connector)
    }

    fn frame_sync(&self) -> FrameSync {
        let cycle = mhz_to_refresh_cycle(self.current_refresh_mhz());
        let now = get_monotonic_time_nanos();
        FrameSync {
            target_vblank_ns: now + cycle,
            wakeup_point_ns: now + cycle.saturating_sub(2_000_000),
        }
    }

    fn hints(&mut self) -> Option<&mut dyn NestedHints> {
        Some(self)
    }

    fn output_size(&self) -> (u32, u32) {
        self.host.size()
    }

    fn current_refresh_mhz(&self) -> u32 {
        self.host.refresh_mhz().max(1)
    }
}

impl NestedHints for NestedBackend {
    fn set_title(&mut self, title: Option<&str>) {
        self.host.set_title(title);
    }

    fn set_icon(&mut self, rgba: Option<&[u32]>) {
        self.host.set_icon(rgba);
    }

    fn set_cursor_image(&mut self, rgba: Option<(Vec<u32>, u32, u32)>) {
        self.host.set_cursor_image(rgba);
    }

    fn set_relative_mouse(&mut self, relative: bool) {
        self.host.set_relative_mouse(relative);
    }

    fn set_visible(&mut self, visible: bool) {
        self.host.set_visible(visible);
    }
}
