//! A backend that throws frames away.
//!
//! Used for running the compositor with no display at all, and as the backend
//! in tests. Presentation always succeeds, timing is synthesised from the
//! nominal refresh rate.

use crate::planner::FramePlan;
use crate::utils::{get_monotonic_time_nanos, mhz_to_refresh_cycle};

use std::sync::Arc;

use super::{
    Backend, BackendCaps, BlobFactory, ConnectorInfo, DisplayMode, FrameSync, HdrCaps,
    Orientation, PresentError, ScreenType, SimpleBlobFactory,
};

pub struct HeadlessBackend {
    caps: BackendCaps,
    connector: ConnectorInfo,
    width: u32,
    height: u32,
    refresh_mhz: u32,
    blobs: Arc<SimpleBlobFactory>,
    presents: u64,
    last_plan_layers: usize,
    last_async: bool,
}

impl HeadlessBackend {
    pub fn new(width: u32, height: u32, refresh_hz: u32) -> Self {
        let refresh_mhz = refresh_hz.max(1) * 1000;
        let connector = ConnectorInfo {
            name: "Headless-1".to_owned(),
            make: "Monocle".to_owned(),
            model: "Virtual".to_owned(),
            screen_type: ScreenType::Internal,
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
                supports_modifiers: true,
                supports_tearing: true,
                supports_plane_cursor: true,
                uses_vulkan_swapchain: false,
                is_session_based: false,
                supports_explicit_sync: false,
                supports_color_management: true,
                max_planes: crate::planner::MAX_LAYERS,
            },
            connector,
            width,
            height,
            refresh_mhz,
            blobs: Arc::new(SimpleBlobFactory::default()),
            presents: 0,
            last_plan_layers: 0,
            last_async: false,
        }
    }

    pub fn present_count(&self) -> u64 {
        self.presents
    }

    pub fn last_present(&self) -> (usize, bool) {
        (self.last_plan_layers, self.last_async)
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn caps(&self) -> &BackendCaps {
        &self.caps
    }

    fn init(&mut self) -> anyhow::Result<()> {
        info!("headless backend: {}x{}", self.width, self.height);
        Ok(())
    }

    fn dirty_state(&mut self, _force: bool, _force_modeset: bool) {}

    fn poll_state(&mut self) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn blob_factory(&self) -> Arc<dyn BlobFactory> {
        self.blobs.clone()
    }

    fn present(&mut self, plan: &FramePlan, async_flip: bool) -> Result<(), PresentError> {
        self.presents += 1;
        self.last_plan_layers = plan.layers.len();
        self.last_async = async_flip;
        Ok(())
    }

    fn connector(&self, screen: ScreenType) -> Option<&ConnectorInfo> {
        (screen == ScreenType::Internal).then_some(&self.connector)
    }

    fn frame_sync(&self) -> FrameSync {
        let cycle = mhz_to_refresh_cycle(self.refresh_mhz);
        let now = get_monotonic_time_nanos();
        FrameSync {
            target_vblank_ns: now + cycle,
            wakeup_point_ns: now + cycle.saturating_sub(2_000_000),
        }
    }

    fn output_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn current_refresh_mhz(&self) -> u32 {
        self.refresh_mhz
    }

    fn set_refresh_mhz(&mut self, mhz: u32) -> anyhow::Result<()> {
        self.refresh_mhz = mhz.max(1);
        Ok(())
    }
}
