//! An atomic buffer submission from a client surface.
//!
//! A Commit owns a locked client buffer, its imported texture (and scan-out
//! framebuffer, when one exists), the acquire fence it waits on, the release
//! point it signals on retirement, and the presentation feedback tokens taken
//! at commit time.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::FramebufferHandle;
use crate::buffer::ClientBuffer;
use crate::protocols::{ClientEvent, EventSender, SwapchainFeedback};
use crate::reactor::{FenceWaiter, Nudge};
use crate::render::Texture;
use crate::surface::SurfaceId;
use crate::sync::TimelinePoint;
use crate::utils::get_monotonic_time_nanos;

static NEXT_COMMIT_ID: AtomicU64 = AtomicU64::new(1);

/// A pending `wp_presentation` feedback resource attached to a Commit.
///
/// Exactly one of `presented` or `discarded` is emitted per token.
#[derive(Debug)]
pub struct FeedbackToken {
    pub surface: SurfaceId,
}

/// Entry appended to the done list when an acquire fence signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneEntry {
    pub surface: SurfaceId,
    pub commit_id: u64,
    pub desired_present_time: u64,
    pub fifo: bool,
}

/// Commits whose fences signalled, waiting for the compositor to pick up.
#[derive(Default)]
pub struct DoneCommits {
    list: Mutex<Vec<DoneEntry>>,
}

impl DoneCommits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: DoneEntry) {
        self.list.lock().unwrap().push(entry);
    }

    pub fn take(&self) -> Vec<DoneEntry> {
        std::mem::take(&mut self.list.lock().unwrap())
    }
}

struct CommitSync {
    /// Release point signalled when the buffer is freed.
    release: Option<TimelinePoint>,
    /// Feedback tokens not yet resolved.
    feedbacks: Vec<FeedbackToken>,
}

pub struct Commit {
    id: u64,
    surface: SurfaceId,
    buffer: Arc<dyn ClientBuffer>,
    pub texture: Arc<Texture>,
    pub framebuffer: Option<FramebufferHandle>,
    pub fifo: bool,
    pub async_flip: bool,
    pub feedback: Option<SwapchainFeedback>,
    pub present_id: Option<u32>,
    pub desired_present_time: u64,
    done: AtomicBool,
    ready_time: AtomicU64,
    sync: Mutex<CommitSync>,
    waiter: Arc<FenceWaiter>,
    events: EventSender,
}

impl Commit {
    /// Builds a commit around an already-imported buffer and locks the buffer.
    ///
    /// The caller is expected to immediately `register` the commit with its
    /// acquire fd, or mark it ready when there is no fence to wait on.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        surface: SurfaceId,
        buffer: Arc<dyn ClientBuffer>,
        texture: Arc<Texture>,
        framebuffer: Option<FramebufferHandle>,
        release: Option<TimelinePoint>,
        feedbacks: Vec<FeedbackToken>,
        feedback: Option<SwapchainFeedback>,
        present_id: Option<u32>,
        desired_present_time: u64,
        fifo: bool,
        async_flip: bool,
        waiter: Arc<FenceWaiter>,
        events: EventSender,
    ) -> Arc<Self> {
        buffer.lock();

        Arc::new(Self {
            id: NEXT_COMMIT_ID.fetch_add(1, Ordering::Relaxed),
            surface,
            buffer,
            texture,
            framebuffer,
            fifo,
            async_flip,
            feedback,
            present_id,
            desired_present_time,
            done: AtomicBool::new(false),
            ready_time: AtomicU64::new(0),
            sync: Mutex::new(CommitSync {
                release,
                feedbacks,
            }),
            waiter,
            events,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn buffer_id(&self) -> crate::buffer::BufferId {
        self.buffer.id()
    }

    pub fn is_ready(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Monotonic nanoseconds at which the acquire fence was observed, or 0.
    pub fn ready_time(&self) -> u64 {
        self.ready_time.load(Ordering::SeqCst)
    }

    /// Registers the acquire fd with the fence waiter.
    ///
    /// `None` means there is nothing to wait on and the commit becomes ready
    /// on the spot.
    pub fn register(
        self: &Arc<Self>,
        acquire_fd: Option<OwnedFd>,
        done: &Arc<DoneCommits>,
        nudge: &Nudge,
    ) {
        let Some(fd) = acquire_fd else {
            self.mark_ready();
            done.push(self.done_entry());
            nudge.nudge();
            return;
        };

        let commit = Arc::downgrade(self);
        let done = done.clone();
        let nudge = nudge.clone();
        self.waiter.watch(
            self.id,
            fd,
            Box::new(move || {
                let Some(commit) = commit.upgrade() else {
                    return;
                };
                commit.mark_ready();
                done.push(commit.done_entry());
                nudge.nudge();
            }),
        );
    }

    pub fn mark_ready(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.ready_time
                .store(get_monotonic_time_nanos(), Ordering::SeqCst);
        }
    }

    fn done_entry(&self) -> DoneEntry {
        DoneEntry {
            surface: self.surface,
            commit_id: self.id,
            desired_present_time: self.desired_present_time,
            fifo: self.fifo,
        }
    }

    /// Takes the feedback tokens for a `presented` resolution.
    pub fn take_feedbacks(&self) -> Vec<FeedbackToken> {
        std::mem::take(&mut self.sync.lock().unwrap().feedbacks)
    }

    /// Marks feedbacks discarded without waiting for destruction. Used on
    /// duplicate-elimination, where the superseded commit may still be
    /// referenced briefly.
    pub fn discard_feedbacks(&self) {
        let feedbacks = self.take_feedbacks();
        for token in feedbacks {
            let _ = self.events.send(ClientEvent::Discarded {
                surface: token.surface,
            });
        }
    }
}

impl Drop for Commit {
    fn drop(&mut self) {
        if !self.is_ready() {
            self.waiter.cancel(self.id);
        }

        let mut sync = self.sync.lock().unwrap();

        if let Some(release) = sync.release.take() {
            if let Err(err) = release.signal() {
                warn!("error signalling release point: {err:?}");
            }
        }

        for token in sync.feedbacks.drain(..) {
            let _ = self.events.send(ClientEvent::Discarded {
                surface: token.surface,
            });
        }
        drop(sync);

        self.buffer.unlock();
    }
}

impl std::fmt::Debug for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commit")
            .field("id", &self.id)
            .field("surface", &self.surface)
            .field("buffer", &self.buffer.id())
            .field("done", &self.is_ready())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::buffer::{MemoryBuffer, DRM_FORMAT_ARGB8888};

    fn make_commit(
        buffer: Arc<MemoryBuffer>,
        feedbacks: Vec<FeedbackToken>,
        events: EventSender,
    ) -> Arc<Commit> {
        let waiter = Arc::new(FenceWaiter::spawn().unwrap());
        Commit::new(
            SurfaceId(1),
            buffer.clone(),
            Arc::new(Texture::for_tests(buffer.width(), buffer.height())),
            None,
            None,
            feedbacks,
            None,
            None,
            0,
            false,
            false,
            waiter,
            events,
        )
    }

    #[test]
    fn commit_ids_are_strictly_monotonic() {
        let (events, _rx) = mpsc::channel();
        let buffer = Arc::new(MemoryBuffer::new(64, 64, DRM_FORMAT_ARGB8888));
        let a = make_commit(buffer.clone(), Vec::new(), events.clone());
        let b = make_commit(buffer.clone(), Vec::new(), events.clone());
        let c = make_commit(buffer, Vec::new(), events);
        assert!(a.id() < b.id());
        assert!(b.id() < c.id());
    }

    #[test]
    fn drop_unlocks_buffer_once_and_discards_feedbacks() {
        let (events, rx) = mpsc::channel();
        let buffer = Arc::new(MemoryBuffer::new(64, 64, DRM_FORMAT_ARGB8888));
        let commit = make_commit(
            buffer.clone(),
            vec![
                FeedbackToken { surface: SurfaceId(1) },
                FeedbackToken { surface: SurfaceId(1) },
            ],
            events,
        );

        assert_eq!(buffer.lock_count(), 1);
        assert_eq!(buffer.unlock_count(), 0);

        drop(commit);
        assert_eq!(buffer.unlock_count(), 1);

        let discarded: Vec<_> = rx.try_iter().collect();
        assert_eq!(discarded.len(), 2);
        assert!(discarded
            .iter()
            .all(|event| matches!(event, ClientEvent::Discarded { .. })));
    }

    #[test]
    fn registering_without_fence_is_immediately_ready() {
        let (events, _rx) = mpsc::channel();
        let (nudge, _source) = Nudge::new().unwrap();
        let done = Arc::new(DoneCommits::new());
        let buffer = Arc::new(MemoryBuffer::new(64, 64, DRM_FORMAT_ARGB8888));

        let commit = make_commit(buffer, Vec::new(), events);
        commit.register(None, &done, &nudge);

        assert!(commit.is_ready());
        assert!(commit.ready_time() > 0);
        let entries = done.take();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].commit_id, commit.id());
    }

    #[test]
    fn fence_gates_readiness() {
        let (events, _rx) = mpsc::channel();
        let (nudge, _source) = Nudge::new().unwrap();
        let done = Arc::new(DoneCommits::new());
        let buffer = Arc::new(MemoryBuffer::new(64, 64, DRM_FORMAT_ARGB8888));

        let fd = crate::sync::signalled_eventfd().unwrap();
        // Drain it back to unsignalled.
        let unsignalled = {
            let fd = crate::sync::signalled_eventfd().unwrap();
            let mut buf = [0u8; 8];
            let n = unsafe {
                libc::read(
                    std::os::fd::AsRawFd::as_raw_fd(&fd),
                    buf.as_mut_ptr().cast(),
                    8,
                )
            };
            assert_eq!(n, 8);
            fd
        };

        let commit = make_commit(buffer, Vec::new(), events);
        commit.register(Some(unsignalled), &done, &nudge);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!commit.is_ready());

        // A signalled fd flips it.
        let commit2 = {
            let (events, _rx) = mpsc::channel();
            let buffer = Arc::new(MemoryBuffer::new(64, 64, DRM_FORMAT_ARGB8888));
            make_commit(buffer, Vec::new(), events)
        };
        commit2.register(Some(fd), &done, &nudge);
        let start = std::time::Instant::now();
        while !commit2.is_ready() && start.elapsed() < std::time::Duration::from_secs(2) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(commit2.is_ready());
    }
}
