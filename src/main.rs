use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use monocle::backend::{Backend, HeadlessBackend, ScreenType};
use monocle::buffer::BufferCache;
use monocle::commit::DoneCommits;
use monocle::compositor::Compositor;
use monocle::reactor::{FenceWaiter, Nudge};
use monocle::render::NullRenderer;
use monocle::scheduler::{SchedulerShared, VblankScheduler};
use monocle::server::{Server, Shared};
use monocle::surface::CommitPipeline;
use monocle::window::ContextId;
use monocle::xwayland::{self, NullConn, XContext};
use monocle_config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// No display; frames are planned and dropped.
    Headless,
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Presentation backend.
    #[arg(long, value_enum, default_value_t = BackendKind::Headless)]
    backend: BackendKind,

    /// Output width.
    #[arg(short = 'W', long, default_value_t = 1280)]
    output_width: u32,

    /// Output height.
    #[arg(short = 'H', long, default_value_t = 720)]
    output_height: u32,

    /// Output refresh rate in Hz.
    #[arg(short = 'r', long, default_value_t = 60)]
    refresh: u32,

    /// Path to the config file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "monocle=debug".to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .init();

    tracy_client::Client::start();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path).map_err(|err| anyhow!("{err:?}"))?,
        None => Config::default(),
    };

    let backend: Box<dyn Backend> = match cli.backend {
        BackendKind::Headless => Box::new(HeadlessBackend::new(
            cli.output_width,
            cli.output_height,
            cli.refresh,
        )),
    };
    info!("starting with the {} backend", backend.name());

    let (nudge, nudge_source) = Nudge::new()?;
    let shared = Arc::new(Shared::new(1, nudge.clone()));

    // The real Vulkan renderer is loaded by the render stack; headless runs
    // plan frames against the null renderer.
    let renderer: Arc<Mutex<dyn monocle::render::Renderer>> =
        Arc::new(Mutex::new(NullRenderer::new()));

    let cache = Arc::new(BufferCache::new());
    let done = Arc::new(DoneCommits::new());
    let waiter = Arc::new(FenceWaiter::spawn()?);

    // Client events flow back into the embedded Wayland machinery; nothing
    // consumes them in a bare headless run.
    let (events_tx, events_rx) = std::sync::mpsc::channel();
    std::thread::Builder::new()
        .name("monocle-events".to_owned())
        .spawn(move || {
            while let Ok(event) = events_rx.recv() {
                tracing::trace!("client event: {event:?}");
            }
        })
        .context("error spawning the event drain")?;

    let pipeline = CommitPipeline {
        cache: cache.clone(),
        renderer: renderer.clone(),
        scanout: backend.scanout_importer(),
        waiter,
        done: done.clone(),
        nudge,
        events: events_tx.clone(),
        max_queue: config.frame_timing.max_commit_queue,
    };

    let server = Server::new(
        shared.clone(),
        pipeline,
        backend.blob_factory(),
        events_tx.clone(),
    );
    server.announce(
        backend
            .connector(ScreenType::Internal)
            .or_else(|| backend.connector(ScreenType::External)),
    );

    // The embedded Wayland server drives this channel with client requests.
    let (requests_tx, requests_rx) = std::sync::mpsc::channel();
    std::thread::Builder::new()
        .name("monocle-server".to_owned())
        .spawn(move || server.run(requests_rx))
        .context("error spawning the server thread")?;

    // One XWayland context; the embedded X server feeds its event channel.
    let (x_events_tx, x_events_rx) = xwayland::event_channel();
    let contexts = vec![XContext::new(
        ContextId(0),
        Box::new(NullConn::new(":0")),
        (cli.output_width, cli.output_height),
    )];

    let scheduler_shared = Arc::new(SchedulerShared::new(
        backend.current_refresh_mhz(),
        config.frame_timing.vblank_redzone_ns,
        config.frame_timing.vblank_decay_percent,
    ));
    let (scheduler, vblank_rx) = VblankScheduler::spawn(scheduler_shared.clone(), true)?;

    let compositor = Compositor::new(
        config,
        shared,
        contexts,
        backend,
        renderer,
        scheduler_shared,
        done,
        cache,
        events_tx,
    );

    // Handles the wire layer would own in a full session.
    let _wire = (requests_tx, x_events_tx);

    let result = compositor.run(vblank_rx, nudge_source, vec![x_events_rx]);
    drop(scheduler);
    result
}
