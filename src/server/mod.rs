//! The server thread.
//!
//! One cooperative loop owns the surface registry and the content-override
//! table; every client request runs under the server lock. The compositor
//! thread takes the same lock briefly to pump ready commits, latch, and send
//! client events.

mod content_override;

pub use content_override::{ContentOverrideTable, OverrideEntry};

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use crate::planner::TouchScaling;
use crate::protocols::{
    ClientEvent, ClientRequest, ControlFeature, DisplayFlags, EventSender, HdrMetadataInfoframe,
    RefreshCycleFlags, ScreenshotType,
};
use crate::reactor::Nudge;
use crate::surface::{CommitPipeline, SurfaceRegistry};
use crate::window::WindowForest;
use crate::backend::{BlobFactory, ConnectorInfo};

/// State behind the server lock.
pub struct ServerState {
    pub registry: SurfaceRegistry,
    pub overrides: ContentOverrideTable,
}

/// A pending screenshot, whatever thread asked for it.
#[derive(Debug, Clone)]
pub struct ScreenshotRequest {
    pub path: Option<PathBuf>,
    pub kind: ScreenshotType,
    /// Requested through the X property rather than the control protocol;
    /// uses the fixed path and clears the property afterwards.
    pub property_requested: bool,
}

/// Refresh-rate wish from `set_app_target_refresh_cycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppRefreshRequest {
    pub fps: u32,
    pub flags: RefreshCycleFlags,
}

/// Everything both threads touch.
pub struct Shared {
    /// The server lock.
    pub server: Mutex<ServerState>,
    /// Per-context window lists.
    pub windows: Mutex<WindowForest>,
    pub nudge: Nudge,
    pub touch_scaling: Arc<TouchScaling>,
    pub screenshot: Mutex<Option<ScreenshotRequest>>,
    pub app_refresh: Mutex<Option<AppRefreshRequest>>,
}

impl Shared {
    pub fn new(context_count: usize, nudge: Nudge) -> Self {
        Self {
            server: Mutex::new(ServerState {
                registry: SurfaceRegistry::new(),
                overrides: ContentOverrideTable::new(),
            }),
            windows: Mutex::new(WindowForest::new(context_count)),
            nudge,
            touch_scaling: Arc::new(TouchScaling::default()),
            screenshot: Mutex::new(None),
            app_refresh: Mutex::new(None),
        }
    }
}

pub struct Server {
    shared: Arc<Shared>,
    pipeline: CommitPipeline,
    blobs: Arc<dyn BlobFactory>,
    events: EventSender,
}

impl Server {
    pub fn new(
        shared: Arc<Shared>,
        pipeline: CommitPipeline,
        blobs: Arc<dyn BlobFactory>,
        events: EventSender,
    ) -> Self {
        Self {
            shared,
            pipeline,
            blobs,
            events,
        }
    }

    /// Runs the request loop until every client handle is gone.
    pub fn run(self, requests: Receiver<ClientRequest>) {
        while let Ok(request) = requests.recv() {
            self.handle(request);
        }
        debug!("server thread exiting");
    }

    /// Dispatches one client request under the server lock.
    pub fn handle(&self, request: ClientRequest) {
        let _span = tracy_client::span!("Server::handle");

        let mut state = self.shared.server.lock().unwrap();
        let state = &mut *state;

        match request {
            ClientRequest::Commit { surface, buffer } => {
                state.registry.commit(&self.pipeline, surface, buffer);
            }
            ClientRequest::Feedback { surface } => {
                state.registry.new_feedback(surface);
            }
            ClientRequest::CreateSwapchain { surface, swapchain } => {
                state.registry.create(surface).swapchains.push(swapchain);
            }
            ClientRequest::OverrideWindowContent {
                swapchain,
                surface,
                server,
                x11_window,
            } => {
                state.overrides.register(
                    &self.events,
                    server,
                    x11_window,
                    surface,
                    swapchain,
                );
                // Commits queued before registration replay on the next wake.
                self.shared.nudge.nudge();
            }
            ClientRequest::SwapchainFeedback { surface, feedback } => {
                state.registry.set_swapchain_feedback(surface, feedback);
            }
            ClientRequest::SetHdrMetadata { surface, metadata } => {
                self.set_hdr_metadata(state, surface, metadata);
            }
            ClientRequest::SetPresentMode {
                surface,
                present_mode,
            } => {
                state.registry.set_present_mode(surface, present_mode);
            }
            ClientRequest::SetPresentTime {
                surface,
                present_id,
                desired_present_time,
            } => {
                state
                    .registry
                    .set_present_time(surface, present_id, desired_present_time);
            }
            ClientRequest::SetSyncobjState {
                surface,
                state: sync_state,
            } => {
                state.registry.set_syncobj_state(surface, sync_state);
            }
            ClientRequest::SetAppTargetRefreshCycle { fps, flags } => {
                *self.shared.app_refresh.lock().unwrap() =
                    Some(AppRefreshRequest { fps, flags });
                self.shared.nudge.nudge();
            }
            ClientRequest::TakeScreenshot { path, kind, flags } => {
                let _ = flags;
                *self.shared.screenshot.lock().unwrap() = Some(ScreenshotRequest {
                    path,
                    kind,
                    property_requested: false,
                });
                self.shared.nudge.nudge();
            }
            ClientRequest::DestroySurface { surface } => {
                state
                    .overrides
                    .handle_surface_destroyed(&self.events, surface);
                state.registry.destroy(&self.events, surface);
                self.shared.nudge.nudge();
            }
        }
    }

    fn set_hdr_metadata(
        &self,
        state: &mut ServerState,
        surface: crate::surface::SurfaceId,
        metadata: HdrMetadataInfoframe,
    ) {
        // Garbage metadata is tossed rather than forwarded.
        if !metadata.is_valid() {
            return;
        }

        match self.blobs.create_blob(&metadata.to_blob_bytes()) {
            Ok(blob) => state.registry.set_hdr_metadata_blob(surface, blob),
            Err(err) => warn!("error creating HDR metadata blob: {err:?}"),
        }
    }

    /// Feature and display announcements sent to a freshly bound
    /// `gamescope_control`.
    pub fn announce(&self, connector: Option<&ConnectorInfo>) {
        for (feature, version) in [
            (ControlFeature::DisplayInfo, 1),
            (ControlFeature::PixelFilter, 1),
            (ControlFeature::RefreshCycle, 1),
        ] {
            let _ = self.events.send(ClientEvent::FeatureSupport {
                feature,
                version,
                flags: 0,
            });
        }

        if let Some(info) = connector {
            let mut flags = DisplayFlags::empty();
            if info.screen_type == crate::backend::ScreenType::Internal {
                flags |= DisplayFlags::INTERNAL;
            }
            if info.vrr_capable {
                flags |= DisplayFlags::VRR;
            }
            if info.hdr.supported {
                flags |= DisplayFlags::HDR;
            }

            let _ = self.events.send(ClientEvent::ActiveDisplayInfo {
                name: info.name.clone(),
                make: info.make.clone(),
                model: info.model.clone(),
                flags,
                rates: info
                    .dynamic_refresh_rates_mhz
                    .iter()
                    .map(|mhz| crate::utils::mhz_to_hz(*mhz))
                    .collect(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::backend::SimpleBlobFactory;
    use crate::buffer::{BufferCache, MemoryBuffer, DRM_FORMAT_ARGB8888};
    use crate::commit::DoneCommits;
    use crate::protocols::PresentMode;
    use crate::reactor::FenceWaiter;
    use crate::render::NullRenderer;
    use crate::surface::SurfaceId;

    fn make_server() -> (Server, mpsc::Receiver<ClientEvent>, Arc<Shared>) {
        let (events_tx, events_rx) = mpsc::channel();
        let (nudge, _source) = Nudge::new().unwrap();
        let shared = Arc::new(Shared::new(1, nudge.clone()));
        let pipeline = CommitPipeline {
            cache: Arc::new(BufferCache::new()),
            renderer: Arc::new(Mutex::new(NullRenderer::new())),
            scanout: None,
            waiter: Arc::new(FenceWaiter::spawn().unwrap()),
            done: Arc::new(DoneCommits::new()),
            nudge,
            events: events_tx.clone(),
            max_queue: 3,
        };
        let server = Server::new(
            shared.clone(),
            pipeline,
            Arc::new(SimpleBlobFactory::default()),
            events_tx,
        );
        (server, events_rx, shared)
    }

    #[test]
    fn tearing_present_mode_yields_async_commit() {
        let (server, _events, shared) = make_server();
        let surface = SurfaceId(1);

        server.handle(ClientRequest::SetPresentMode {
            surface,
            present_mode: PresentMode::Immediate,
        });
        server.handle(ClientRequest::Commit {
            surface,
            buffer: Some(Arc::new(MemoryBuffer::new(8, 8, DRM_FORMAT_ARGB8888))),
        });

        let entries = server.pipeline.done.take();
        assert_eq!(entries.len(), 1);

        // The commit carries the async flag; fifo only for FIFO mode.
        let mut state = shared.server.lock().unwrap();
        let ready = state.registry.pump_done(entries, 3);
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.async_flip);
        assert!(!ready[0].1.fifo);
    }

    #[test]
    fn hdr_metadata_needs_swapchain_feedback_and_validity() {
        let (server, _events, shared) = make_server();
        let surface = SurfaceId(1);

        server.handle(ClientRequest::SwapchainFeedback {
            surface,
            feedback: crate::protocols::SwapchainFeedback {
                image_count: 3,
                vk_format: 44,
                vk_colorspace: 0,
                vk_composite_alpha: 1,
                vk_pre_transform: 1,
                vk_clipped: false,
                hdr_metadata_blob: None,
            },
        });

        // Invalid metadata (no max_cll) is dropped.
        server.handle(ClientRequest::SetHdrMetadata {
            surface,
            metadata: HdrMetadataInfoframe::default(),
        });
        {
            let state = shared.server.lock().unwrap();
            let feedback = state.registry.last_swapchain_feedback(surface).unwrap();
            assert_eq!(feedback.hdr_metadata_blob, None);
        }

        server.handle(ClientRequest::SetHdrMetadata {
            surface,
            metadata: HdrMetadataInfoframe {
                white_point: (15635, 16450),
                max_cll: 1000,
                max_fall: 400,
                max_display_mastering_luminance: 1000,
                min_display_mastering_luminance: 500,
                ..Default::default()
            },
        });
        let state = shared.server.lock().unwrap();
        let feedback = state.registry.last_swapchain_feedback(surface).unwrap();
        assert!(feedback.hdr_metadata_blob.is_some());
    }

    #[test]
    fn screenshot_request_lands_in_shared_state() {
        let (server, _events, shared) = make_server();
        server.handle(ClientRequest::TakeScreenshot {
            path: Some(PathBuf::from("/tmp/shot.png")),
            kind: ScreenshotType::AllRealLayers,
            flags: 0,
        });

        let request = shared.screenshot.lock().unwrap().take().unwrap();
        assert_eq!(request.path.as_deref(), Some(std::path::Path::new("/tmp/shot.png")));
        assert!(!request.property_requested);
    }
}
