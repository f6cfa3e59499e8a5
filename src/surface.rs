//! Per-surface state and the commit pipeline.
//!
//! The registry lives on the server thread, under the server lock. The
//! compositor reaches in (still under the lock) to pump fence-signalled
//! commits into the ready queues and to latch them during paint.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::backend::ScanoutImporter;
use crate::buffer::{BufferCache, ClientBuffer};
use crate::commit::{Commit, DoneCommits, DoneEntry, FeedbackToken};
use crate::protocols::{
    ClientEvent, EventSender, PresentMode, SwapchainFeedback, SwapchainId,
};
use crate::reactor::{FenceWaiter, Nudge};
use crate::render::Renderer;
use crate::sync::TimelinePoint;
use crate::utils::{nanos_to_wp_timespec, split_u64};
use crate::window::{ContextId, XWindowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Everything commit construction needs, bundled so the registry can be built
/// piecewise in tests.
pub struct CommitPipeline {
    pub cache: Arc<BufferCache>,
    pub renderer: Arc<Mutex<dyn Renderer>>,
    pub scanout: Option<Arc<dyn ScanoutImporter>>,
    pub waiter: Arc<FenceWaiter>,
    pub done: Arc<DoneCommits>,
    pub nudge: Nudge,
    pub events: EventSender,
    /// Ready-but-unpresented commits kept per surface.
    pub max_queue: usize,
}

/// Explicit-sync state for the next commit.
#[derive(Debug, Clone)]
pub struct SyncobjState {
    pub acquire: TimelinePoint,
    pub release: TimelinePoint,
}

#[derive(Default)]
pub struct SurfaceState {
    /// Commit built but not yet picked up by the compositor. At most one;
    /// committing replaces it.
    pending: Option<Arc<Commit>>,
    /// Fence-signalled commits, oldest first.
    ready: VecDeque<Arc<Commit>>,
    /// The latched (displayed) commit.
    current: Option<Arc<Commit>>,
    /// Feedback resources created since the last commit.
    pending_feedbacks: Vec<FeedbackToken>,
    swapchain_feedback: Option<SwapchainFeedback>,
    /// Present mode for the next commit; consumed at commit time.
    present_mode: Option<PresentMode>,
    present_id: Option<u32>,
    desired_present_time: u64,
    syncobj: Option<SyncobjState>,
    /// Presentation-feedback sequence, strictly monotonic per surface.
    sequence: u64,
    /// X window this surface backs, if any.
    pub x11: Option<(ContextId, XWindowId)>,
    /// Swapchain resources bound to this surface.
    pub swapchains: Vec<SwapchainId>,
}

impl SurfaceState {
    /// Latest ready commit, used as the window content.
    pub fn last_ready(&self) -> Option<&Arc<Commit>> {
        self.ready.back()
    }

    pub fn current(&self) -> Option<&Arc<Commit>> {
        self.current.as_ref()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<SurfaceId, SurfaceState>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, id: SurfaceId) -> &mut SurfaceState {
        self.surfaces.entry(id).or_default()
    }

    pub fn get(&self, id: SurfaceId) -> Option<&SurfaceState> {
        self.surfaces.get(&id)
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut SurfaceState> {
        self.surfaces.get_mut(&id)
    }

    /// `wp_presentation.feedback`: queue a token for the next commit.
    pub fn new_feedback(&mut self, id: SurfaceId) {
        let state = self.create(id);
        state.pending_feedbacks.push(FeedbackToken { surface: id });
    }

    pub fn set_swapchain_feedback(&mut self, id: SurfaceId, feedback: SwapchainFeedback) {
        self.create(id).swapchain_feedback = Some(feedback);
    }

    pub fn last_swapchain_feedback(&self, id: SurfaceId) -> Option<&SwapchainFeedback> {
        self.get(id)?.swapchain_feedback.as_ref()
    }

    pub fn set_hdr_metadata_blob(&mut self, id: SurfaceId, blob: crate::backend::BlobHandle) {
        let state = self.create(id);
        match &mut state.swapchain_feedback {
            Some(feedback) => feedback.hdr_metadata_blob = Some(blob),
            None => error!("set_hdr_metadata with no swapchain_feedback"),
        }
    }

    pub fn set_present_mode(&mut self, id: SurfaceId, mode: PresentMode) {
        self.create(id).present_mode = Some(mode);
    }

    pub fn set_present_time(&mut self, id: SurfaceId, present_id: u32, time_ns: u64) {
        let state = self.create(id);
        state.present_id = Some(present_id);
        state.desired_present_time = time_ns;
    }

    pub fn set_syncobj_state(&mut self, id: SurfaceId, state: Option<SyncobjState>) {
        self.create(id).syncobj = state;
    }

    /// The §4.1 commit pipeline. Returns the new commit, or `None` when the
    /// commit was rejected (the error already went to the client).
    pub fn commit(
        &mut self,
        pipeline: &CommitPipeline,
        id: SurfaceId,
        buffer: Option<Arc<dyn ClientBuffer>>,
    ) -> Option<Arc<Commit>> {
        let _span = tracy_client::span!("SurfaceRegistry::commit");

        let state = self.create(id);

        let Some(buffer) = buffer else {
            // Committing without a buffer is a protocol violation for the
            // surfaces we host.
            Self::discard_feedbacks(&pipeline.events, state);
            let _ = pipeline.events.send(ClientEvent::ProtocolError {
                surface: id,
                message: "commit without a buffer".to_owned(),
            });
            return None;
        };

        let imported = pipeline.cache.import(
            buffer.as_ref(),
            || pipeline.renderer.lock().unwrap().import_texture(buffer.as_ref()),
            |dmabuf| {
                let scanout = pipeline.scanout.as_ref()?;
                scanout.import_dmabuf(buffer.id(), dmabuf)
            },
        );
        let imported = match imported {
            Ok(imported) => imported,
            Err(err) => {
                warn!("error importing buffer for surface {id:?}: {err:?}");
                Self::discard_feedbacks(&pipeline.events, state);
                return None;
            }
        };

        // Duplicate elimination: a re-commit of the same buffer that never
        // latched supersedes the old commit wholesale.
        if let Some(prev) = &state.pending {
            if prev.buffer_id() == buffer.id() {
                prev.discard_feedbacks();
            }
        }

        let syncobj = state.syncobj.clone();
        let (acquire_fd, release) = match &syncobj {
            Some(sync) => match sync.acquire.to_acquire_eventfd() {
                Ok(fd) => (Some(fd), Some(sync.release.clone())),
                Err(err) => {
                    warn!("error deriving acquire fence: {err:?}");
                    Self::discard_feedbacks(&pipeline.events, state);
                    let _ = pipeline.events.send(ClientEvent::ProtocolError {
                        surface: id,
                        message: "invalid acquire timeline point".to_owned(),
                    });
                    return None;
                }
            },
            None => (buffer.implicit_fence(), None),
        };

        let present_mode = state.present_mode.take();
        let commit = Commit::new(
            id,
            buffer,
            imported.texture,
            imported.framebuffer,
            release,
            std::mem::take(&mut state.pending_feedbacks),
            state.swapchain_feedback.clone(),
            state.present_id.take(),
            std::mem::take(&mut state.desired_present_time),
            present_mode.is_some_and(PresentMode::is_fifo),
            present_mode.is_some_and(PresentMode::is_tearing),
            pipeline.waiter.clone(),
            pipeline.events.clone(),
        );

        commit.register(acquire_fd, &pipeline.done, &pipeline.nudge);

        // Replacing the pending slot drops the superseded commit, which
        // handles its own release point and feedbacks.
        state.pending = Some(commit.clone());

        Some(commit)
    }

    /// Moves fence-signalled commits from the pending slot to their surface's
    /// ready queue. Returns the surfaces that gained a ready commit.
    pub fn pump_done(
        &mut self,
        entries: Vec<DoneEntry>,
        max_queue: usize,
    ) -> Vec<(SurfaceId, Arc<Commit>)> {
        let mut newly_ready = Vec::new();

        for entry in entries {
            let Some(state) = self.surfaces.get_mut(&entry.surface) else {
                continue;
            };

            let matches = state
                .pending
                .as_ref()
                .is_some_and(|commit| commit.id() == entry.commit_id);
            if !matches {
                // Superseded before we woke up; the commit already resolved
                // its feedbacks on drop.
                continue;
            }

            let commit = state.pending.take().unwrap();
            state.ready.push_back(commit.clone());
            while state.ready.len() > max_queue {
                // Oldest unpresented commit gives way; dropping it sends
                // discarded feedback and signals its release point.
                state.ready.pop_front();
            }

            newly_ready.push((entry.surface, commit));
        }

        newly_ready
    }

    /// Latches the newest ready commit as the displayed content.
    ///
    /// Earlier ready commits are superseded and released; the previously
    /// displayed commit is released once the new one takes over.
    pub fn latch(&mut self, id: SurfaceId) -> Option<Arc<Commit>> {
        let state = self.surfaces.get_mut(&id)?;
        let commit = state.ready.pop_back()?;
        state.ready.clear();
        state.current = Some(commit.clone());
        Some(commit)
    }

    /// Sends `presented` for every feedback of the latched commit.
    pub fn presented(
        &mut self,
        events: &EventSender,
        commit: &Commit,
        last_vblank_ns: u64,
        refresh_cycle_ns: u64,
    ) {
        let Some(state) = self.surfaces.get_mut(&commit.surface()) else {
            return;
        };

        let feedbacks = commit.take_feedbacks();
        if feedbacks.is_empty() {
            return;
        }

        state.sequence += 1;
        let (seq_hi, seq_lo) = split_u64(state.sequence);
        let (tv_sec_hi, tv_sec_lo, tv_nsec) = nanos_to_wp_timespec(last_vblank_ns);

        for token in feedbacks {
            let _ = events.send(ClientEvent::Presented {
                surface: token.surface,
                tv_sec_hi,
                tv_sec_lo,
                tv_nsec,
                refresh: refresh_cycle_ns as u32,
                seq_hi,
                seq_lo,
                flags: crate::protocols::PresentationFlags::latch_time(),
            });
        }
    }

    /// Destroys a surface: cancels pending and ready commits, discards
    /// outstanding feedbacks, unlocks buffers, removes the entry.
    pub fn destroy(&mut self, events: &EventSender, id: SurfaceId) {
        let Some(mut state) = self.surfaces.remove(&id) else {
            return;
        };

        Self::discard_feedbacks(events, &mut state);
        // Dropping the state drops every commit, which unlocks buffers,
        // cancels fence waits, and resolves remaining feedbacks.
    }

    fn discard_feedbacks(events: &EventSender, state: &mut SurfaceState) {
        for token in state.pending_feedbacks.drain(..) {
            let _ = events.send(ClientEvent::Discarded {
                surface: token.surface,
            });
        }
    }

    pub fn surfaces(&self) -> impl Iterator<Item = (&SurfaceId, &SurfaceState)> {
        self.surfaces.iter()
    }
}
