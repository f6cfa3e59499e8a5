//! Explicit-sync timeline points.
//!
//! Clients using linux-drm-syncobj hand us a timeline plus an acquire and a
//! release sequence per commit. The acquire point turns into an eventfd the
//! fence-wait thread can poll; the release point is signalled when the commit
//! is superseded.

use std::fmt;
use std::io::Write;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::{anyhow, Context};

/// Creates a non-blocking eventfd with counter `value`.
fn eventfd(value: u32) -> anyhow::Result<OwnedFd> {
    // SAFETY: eventfd returns a fresh fd that we immediately own.
    let fd = unsafe { libc::eventfd(value, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("error creating an eventfd");
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// An eventfd that is already readable.
pub fn signalled_eventfd() -> anyhow::Result<OwnedFd> {
    eventfd(1)
}

/// Signals an eventfd by hand. Test helper and fallback path.
pub fn signal_eventfd(fd: &OwnedFd) -> anyhow::Result<()> {
    let mut file = std::fs::File::from(fd.try_clone().context("error duplicating eventfd")?);
    file.write_all(&1u64.to_ne_bytes())
        .context("error signalling eventfd")?;
    Ok(())
}

// =============================================================================
// SyncTimeline
// =============================================================================

/// A syncobj timeline shared with a client.
pub trait SyncTimeline: Send + Sync + fmt::Debug {
    /// Highest point observed signalled on the timeline.
    fn query(&self) -> anyhow::Result<u64>;
    /// Arms `fd` to become readable once `point` materializes and signals.
    fn arm_eventfd(&self, point: u64, fd: &OwnedFd) -> anyhow::Result<()>;
    /// Signals `point` on the timeline.
    fn signal(&self, point: u64) -> anyhow::Result<()>;
}

/// Timeline backed by a DRM syncobj handle.
pub struct DrmSyncTimeline {
    device: Arc<OwnedFd>,
    handle: u32,
}

impl fmt::Debug for DrmSyncTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmSyncTimeline")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DrmSyncTimeline {
    pub fn new(device: Arc<OwnedFd>, handle: u32) -> Self {
        Self { device, handle }
    }
}

impl SyncTimeline for DrmSyncTimeline {
    fn query(&self) -> anyhow::Result<u64> {
        let mut points = [0u64];
        drm_ffi::syncobj::query(self.device.as_fd(), &[self.handle], &mut points, false)
            .map_err(|err| anyhow!("error querying syncobj: {err:?}"))?;
        Ok(points[0])
    }

    fn arm_eventfd(&self, point: u64, fd: &OwnedFd) -> anyhow::Result<()> {
        // Wait for materialization + signal, not just materialization.
        drm_ffi::syncobj::eventfd(self.device.as_fd(), self.handle, point, fd.as_fd(), false)
            .map(|_| ())
            .map_err(|err| anyhow!("error arming syncobj eventfd: {err:?}"))
    }

    fn signal(&self, point: u64) -> anyhow::Result<()> {
        drm_ffi::syncobj::timeline_signal(self.device.as_fd(), &[self.handle], &[point])
            .map(|_| ())
            .map_err(|err| anyhow!("error signalling syncobj point: {err:?}"))
    }
}

// =============================================================================
// TimelinePoint
// =============================================================================

/// A (timeline, sequence) pair.
#[derive(Debug, Clone)]
pub struct TimelinePoint {
    pub timeline: Arc<dyn SyncTimeline>,
    pub point: u64,
}

impl TimelinePoint {
    pub fn new(timeline: Arc<dyn SyncTimeline>, point: u64) -> Self {
        Self { timeline, point }
    }

    /// Derives the acquire eventfd: pre-signalled when the point already
    /// passed, armed on the timeline otherwise.
    pub fn to_acquire_eventfd(&self) -> anyhow::Result<OwnedFd> {
        let signalled = self.timeline.query()?;
        if signalled >= self.point {
            return signalled_eventfd();
        }

        let fd = eventfd(0)?;
        self.timeline.arm_eventfd(self.point, &fd)?;
        Ok(fd)
    }

    pub fn signal(&self) -> anyhow::Result<()> {
        self.timeline.signal(self.point)
    }
}

/// A timeline driven by hand, for tests.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct ManualTimeline {
        signalled: Mutex<u64>,
        armed: Mutex<Vec<(u64, OwnedFd)>>,
    }

    impl ManualTimeline {
        pub fn advance(&self, point: u64) {
            let mut signalled = self.signalled.lock().unwrap();
            *signalled = (*signalled).max(point);
            let mut armed = self.armed.lock().unwrap();
            armed.retain(|(p, fd)| {
                if *p <= *signalled {
                    signal_eventfd(fd).unwrap();
                    false
                } else {
                    true
                }
            });
        }
    }

    impl SyncTimeline for ManualTimeline {
        fn query(&self) -> anyhow::Result<u64> {
            Ok(*self.signalled.lock().unwrap())
        }

        fn arm_eventfd(&self, point: u64, fd: &OwnedFd) -> anyhow::Result<()> {
            self.armed
                .lock()
                .unwrap()
                .push((point, fd.try_clone()?));
            Ok(())
        }

        fn signal(&self, point: u64) -> anyhow::Result<()> {
            self.advance(point);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ManualTimeline;
    use super::*;

    fn is_readable(fd: &OwnedFd) -> bool {
        let mut pfd = libc::pollfd {
            fd: std::os::fd::AsRawFd::as_raw_fd(fd),
            events: libc::POLLIN,
            revents: 0,
        };
        let rv = unsafe { libc::poll(&mut pfd, 1, 0) };
        rv > 0 && (pfd.revents & libc::POLLIN) != 0
    }

    #[test]
    fn already_signalled_point_yields_readable_fd() {
        let timeline = Arc::new(ManualTimeline::default());
        timeline.advance(5);

        let point = TimelinePoint::new(timeline, 3);
        let fd = point.to_acquire_eventfd().unwrap();
        assert!(is_readable(&fd));
    }

    #[test]
    fn future_point_arms_and_fires_on_signal() {
        let timeline = Arc::new(ManualTimeline::default());
        let point = TimelinePoint::new(timeline.clone(), 10);

        let fd = point.to_acquire_eventfd().unwrap();
        assert!(!is_readable(&fd));

        timeline.advance(10);
        assert!(is_readable(&fd));
    }

    #[test]
    fn release_signal_advances_timeline() {
        let timeline = Arc::new(ManualTimeline::default());
        let release = TimelinePoint::new(timeline.clone(), 2);
        release.signal().unwrap();
        assert_eq!(timeline.query().unwrap(), 2);
    }
}
