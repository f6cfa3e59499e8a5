//! End-to-end pipeline tests: client requests and X events in, layer plans
//! and client events out, through a backend that records what it presents.

use std::sync::{Arc, Mutex};

use monocle::backend::{
    Backend, BackendCaps, BlobFactory, ConnectorInfo, DisplayMode, FrameSync, HdrCaps,
    Orientation, PresentError, ScreenType, SimpleBlobFactory,
};
use monocle::buffer::{BufferCache, MemoryBuffer, DRM_FORMAT_ARGB8888};
use monocle::commit::DoneCommits;
use monocle::compositor::Compositor;
use monocle::planner::{FramePlan, Z_BASE, Z_OVERRIDE};
use monocle::protocols::{ClientEvent, ClientRequest, PresentMode, SwapchainId};
use monocle::reactor::{FenceWaiter, Nudge};
use monocle::render::NullRenderer;
use monocle::scheduler::SchedulerShared;
use monocle::server::{Server, Shared};
use monocle::surface::{CommitPipeline, SurfaceId};
use monocle::utils::{get_monotonic_time_nanos, Rect};
use monocle::window::{ContextId, XWindowId};
use monocle::xwayland::{NullConn, PropertyChange, RecordedCommand, XContext, XEvent};
use monocle_config::Config;

// =============================================================================
// Recording backend
// =============================================================================

#[derive(Default)]
struct PresentLog {
    frames: Vec<(FramePlan, bool)>,
}

struct RecordingBackend {
    caps: BackendCaps,
    connector: ConnectorInfo,
    log: Arc<Mutex<PresentLog>>,
    blobs: Arc<SimpleBlobFactory>,
}

impl RecordingBackend {
    fn new(supports_tearing: bool) -> (Self, Arc<Mutex<PresentLog>>) {
        let log = Arc::new(Mutex::new(PresentLog::default()));
        let backend = Self {
            caps: BackendCaps {
                supports_modifiers: true,
                supports_tearing,
                supports_plane_cursor: true,
                uses_vulkan_swapchain: false,
                is_session_based: false,
                supports_explicit_sync: false,
                supports_color_management: true,
                max_planes: 8,
            },
            connector: ConnectorInfo {
                name: "Test-1".to_owned(),
                make: "Monocle".to_owned(),
                model: "Recorder".to_owned(),
                screen_type: ScreenType::Internal,
                orientation: Orientation::Normal,
                hdr: HdrCaps::default(),
                edid: Vec::new(),
                modes: vec![DisplayMode {
                    width: 1920,
                    height: 1080,
                    refresh_mhz: 60_000,
                }],
                vrr_capable: false,
                dynamic_refresh_rates_mhz: Vec::new(),
            },
            log: log.clone(),
            blobs: Arc::new(SimpleBlobFactory::default()),
        };
        (backend, log)
    }
}

impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn caps(&self) -> &BackendCaps {
        &self.caps
    }

    fn init(&mut self) -> anyhow::Result<()> {
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
        self.log
            .lock()
            .unwrap()
            .frames
            .push((plan.clone(), async_flip));
        Ok(())
    }

    fn connector(&self, screen: ScreenType) -> Option<&ConnectorInfo> {
        (screen == ScreenType::Internal).then_some(&self.connector)
    }

    fn frame_sync(&self) -> FrameSync {
        let now = get_monotonic_time_nanos();
        FrameSync {
            target_vblank_ns: now + 16_666_666,
            wakeup_point_ns: now + 14_666_666,
        }
    }

    fn output_size(&self) -> (u32, u32) {
        (1920, 1080)
    }

    fn current_refresh_mhz(&self) -> u32 {
        60_000
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Pipeline {
    compositor: Compositor,
    server: Server,
    events: std::sync::mpsc::Receiver<ClientEvent>,
    conn: Arc<NullConn>,
    log: Arc<Mutex<PresentLog>>,
    _nudge_source: calloop::ping::PingSource,
}

impl Pipeline {
    fn new(supports_tearing: bool) -> Self {
        let (events_tx, events_rx) = std::sync::mpsc::channel();
        let (nudge, nudge_source) = Nudge::new().unwrap();
        let shared = Arc::new(Shared::new(1, nudge.clone()));
        let done = Arc::new(DoneCommits::new());
        let cache = Arc::new(BufferCache::new());
        let renderer: Arc<Mutex<dyn monocle::render::Renderer>> =
            Arc::new(Mutex::new(NullRenderer::new()));

        let (backend, log) = RecordingBackend::new(supports_tearing);

        let pipeline = CommitPipeline {
            cache: cache.clone(),
            renderer: renderer.clone(),
            scanout: None,
            waiter: Arc::new(FenceWaiter::spawn().unwrap()),
            done: done.clone(),
            nudge,
            events: events_tx.clone(),
            max_queue: 3,
        };
        let server = Server::new(
            shared.clone(),
            pipeline,
            backend.blob_factory(),
            events_tx.clone(),
        );

        let conn = Arc::new(NullConn::new(":0"));
        let contexts = vec![XContext::new(
            ContextId(0),
            Box::new(conn.clone()),
            (1920, 1080),
        )];

        let scheduler = Arc::new(SchedulerShared::new(60_000, 1_000_000, 90));
        let compositor = Compositor::new(
            Config::default(),
            shared,
            contexts,
            Box::new(backend),
            renderer,
            scheduler,
            done,
            cache,
            events_tx,
        );

        Self {
            compositor,
            server,
            events: events_rx,
            conn,
            log,
            _nudge_source: nudge_source,
        }
    }

    fn x_events(&mut self, events: Vec<XEvent>) {
        self.compositor
            .iteration(
                None,
                events.into_iter().map(|e| (ContextId(0), e)).collect(),
            )
            .unwrap();
    }

    fn create_game_window(&mut self, window: u32, surface: u64, rect: Rect) {
        self.x_events(vec![
            XEvent::Created {
                window: XWindowId(window),
                geometry: rect,
                override_redirect: false,
                input_output: true,
            },
            XEvent::Mapped {
                window: XWindowId(window),
            },
            XEvent::Property {
                window: XWindowId(window),
                change: PropertyChange::AppId(4242),
            },
            XEvent::SurfaceAssociated {
                window: XWindowId(window),
                surface: SurfaceId(surface),
            },
        ]);
    }

    fn commit(&mut self, surface: u64, width: u32, height: u32) {
        self.server.handle(ClientRequest::Commit {
            surface: SurfaceId(surface),
            buffer: Some(Arc::new(MemoryBuffer::new(
                width,
                height,
                DRM_FORMAT_ARGB8888,
            ))),
        });
    }

    fn vblank(&mut self) {
        self.compositor
            .iteration(Some(get_monotonic_time_nanos()), Vec::new())
            .unwrap();
    }

    fn last_frame(&self) -> Option<(FramePlan, bool)> {
        self.log.lock().unwrap().frames.last().cloned()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn dropdown_override_makes_two_layers() {
    let mut p = Pipeline::new(false);

    p.create_game_window(1, 1, Rect::from_size(1920, 1080));
    p.commit(1, 1920, 1080);
    // Warm-up: the very first frame goes through the compositor.
    p.vblank();

    // The override-redirect child at (40, 20).
    p.x_events(vec![
        XEvent::Created {
            window: XWindowId(2),
            geometry: Rect::new(40, 20, 300, 200),
            override_redirect: true,
            input_output: true,
        },
        XEvent::Mapped {
            window: XWindowId(2),
        },
        XEvent::Property {
            window: XWindowId(2),
            change: PropertyChange::AppId(4242),
        },
        XEvent::Property {
            window: XWindowId(2),
            change: PropertyChange::TransientFor(Some(XWindowId(1))),
        },
        XEvent::SurfaceAssociated {
            window: XWindowId(2),
            surface: SurfaceId(2),
        },
    ]);
    p.commit(2, 300, 200);
    p.commit(1, 1920, 1080);
    p.vblank();

    let focus = p.compositor.global_focus();
    assert_eq!(focus.focus, Some((ContextId(0), XWindowId(1))));
    assert_eq!(focus.override_window, Some((ContextId(0), XWindowId(2))));

    let (plan, _) = p.last_frame().unwrap();
    assert_eq!(plan.layers.len(), 2);

    let base = plan.layers.iter().find(|l| l.zpos == Z_BASE).unwrap();
    assert_eq!(base.scale.x, 1.0);

    let over = plan.layers.iter().find(|l| l.zpos == Z_OVERRIDE).unwrap();
    assert_eq!(over.scale, base.scale);
    assert_eq!(over.offset.x, 40.0);
    assert_eq!(over.offset.y, 20.0);
}

#[test]
fn tearing_passthrough_depends_on_backend_caps() {
    for (supports_tearing, want_async) in [(true, true), (false, false)] {
        let mut p = Pipeline::new(supports_tearing);
        p.create_game_window(1, 1, Rect::from_size(1920, 1080));

        p.commit(1, 1920, 1080);
        p.vblank();

        p.server.handle(ClientRequest::SetPresentMode {
            surface: SurfaceId(1),
            present_mode: PresentMode::Immediate,
        });
        p.commit(1, 1920, 1080);
        p.vblank();

        let (_, async_flip) = p.last_frame().unwrap();
        assert_eq!(
            async_flip, want_async,
            "tearing caps {supports_tearing} should give async {want_async}"
        );
    }
}

#[test]
fn content_override_replaces_presented_surface() {
    let mut p = Pipeline::new(false);
    p.create_game_window(1, 1, Rect::from_size(1920, 1080));
    p.commit(1, 1920, 1080);
    p.vblank();
    p.commit(1, 1920, 1080);
    p.vblank();

    let (plan_before, _) = p.last_frame().unwrap();
    let texture_before = plan_before.layers[0].texture.id();

    // Commits queued against the override surface before registration replay
    // once it takes effect.
    p.server.handle(ClientRequest::CreateSwapchain {
        surface: SurfaceId(9),
        swapchain: SwapchainId(1),
    });
    p.commit(9, 1920, 1080);
    p.server.handle(ClientRequest::OverrideWindowContent {
        swapchain: Some(SwapchainId(1)),
        surface: SurfaceId(9),
        server: ContextId(0),
        x11_window: XWindowId(1),
    });
    p.vblank();

    let (plan_after, _) = p.last_frame().unwrap();
    let texture_after = plan_after.layers[0].texture.id();
    assert_ne!(texture_before, texture_after);

    // Replacing the override retires the old swapchain.
    p.server.handle(ClientRequest::OverrideWindowContent {
        swapchain: Some(SwapchainId(2)),
        surface: SurfaceId(10),
        server: ContextId(0),
        x11_window: XWindowId(1),
    });
    let retired: Vec<_> = p
        .events
        .try_iter()
        .filter(|e| matches!(e, ClientEvent::Retired { .. }))
        .collect();
    assert_eq!(retired.len(), 1);
}

#[test]
fn control_properties_are_published() {
    let mut p = Pipeline::new(false);
    p.create_game_window(1, 1, Rect::from_size(1920, 1080));
    p.commit(1, 1920, 1080);
    p.vblank();

    let commands = p.conn.take_commands();
    // The last publish wins; earlier passes ran before the first commit.
    let cardinal = |name: &str| {
        commands.iter().rev().find_map(|c| match c {
            RecordedCommand::RootCardinal(n, values) if n == name => Some(values.clone()),
            _ => None,
        })
    };

    assert_eq!(cardinal("GAMESCOPE_FOCUSED_WINDOW"), Some(vec![1]));
    assert_eq!(cardinal("GAMESCOPE_FOCUSED_APP"), Some(vec![4242]));
    assert_eq!(
        cardinal("GAMESCOPE_FOCUSABLE_WINDOWS"),
        Some(vec![1, 4242, 0])
    );
    assert!(commands.iter().any(|c| matches!(
        c,
        RecordedCommand::RootString(name, _) if name == "GAMESCOPE_FOCUS_DISPLAY"
    )));
    assert!(commands
        .iter()
        .any(|c| matches!(c, RecordedCommand::WmStateNormal(w) if *w == XWindowId(1))));
}

#[test]
fn present_timing_feedback_flows_back() {
    let mut p = Pipeline::new(false);
    p.create_game_window(1, 1, Rect::from_size(1920, 1080));
    p.commit(1, 1920, 1080);
    p.vblank();

    p.server.handle(ClientRequest::SetPresentTime {
        surface: SurfaceId(1),
        present_id: 7,
        desired_present_time: 123,
    });
    p.commit(1, 1920, 1080);
    p.vblank();

    let events: Vec<_> = p.events.try_iter().collect();
    let timing = events.iter().find_map(|e| match e {
        ClientEvent::PastPresentTiming {
            present_id,
            desired_present_time,
            actual_present_time,
            ..
        } => Some((*present_id, *desired_present_time, *actual_present_time)),
        _ => None,
    });
    let (present_id, desired, actual) = timing.expect("past_present_timing was sent");
    assert_eq!(present_id, 7);
    assert_eq!(desired, 123);
    assert!(actual > 0);

    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::RefreshCycle { refresh_cycle, .. }
            if *refresh_cycle > 16_000_000 && *refresh_cycle < 17_000_000)));
}
