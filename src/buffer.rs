//! Client buffers and the buffer -> texture cache.
//!
//! A client buffer is whatever the embedded Wayland machinery imported on our
//! behalf: a dma-buf, an shm pool slice, or a test buffer. The cache maps
//! buffer identity to the GPU texture (and, for dma-bufs on a scan-out capable
//! backend, the backend framebuffer) so that re-commits of the same buffer do
//! not re-import anything.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::FramebufferHandle;
use crate::render::Texture;

// =============================================================================
// ClientBuffer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Attributes of a dma-buf backed buffer, as needed for scan-out import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmabufAttributes {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub modifier: u64,
    pub plane_count: u32,
}

/// An imported client buffer.
///
/// The buffer stays locked (unreleasable to the client) from commit until the
/// owning Commit drops. `unlock` must be called exactly once per lock.
pub trait ClientBuffer: Send + Sync + fmt::Debug {
    fn id(&self) -> BufferId;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// DRM fourcc of the pixel data.
    fn format(&self) -> u32;
    fn dmabuf(&self) -> Option<DmabufAttributes>;
    /// Duplicates the implicit-sync fence fd, if the buffer carries one.
    fn implicit_fence(&self) -> Option<OwnedFd>;
    fn lock(&self);
    fn unlock(&self);
}

// =============================================================================
// BufferCache
// =============================================================================

struct CacheEntry {
    texture: Weak<Texture>,
    framebuffer: Option<FramebufferHandle>,
}

/// Imported texture/framebuffer state for a buffer.
#[derive(Debug, Clone)]
pub struct ImportedBuffer {
    pub texture: Arc<Texture>,
    pub framebuffer: Option<FramebufferHandle>,
}

/// Buffer identity -> texture arena.
///
/// Entries hold weak texture references; the strong references live in
/// Commits. An entry disappears when the last texture reference dies or the
/// backend reports the framebuffer gone. Iteration stability: entries are
/// only ever removed explicitly, never invalidated by inserts.
#[derive(Default)]
pub struct BufferCache {
    inner: Mutex<HashMap<BufferId, CacheEntry>>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached import for `id` if the texture is still alive.
    pub fn get(&self, id: BufferId) -> Option<ImportedBuffer> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.get(&id)?;
        let texture = entry.texture.upgrade()?;
        Some(ImportedBuffer {
            texture,
            framebuffer: entry.framebuffer,
        })
    }

    /// Looks up or creates the texture mapping for `buffer`.
    ///
    /// `import_texture` runs only on a cache miss; `import_framebuffer` runs
    /// after it, for dma-buf buffers, when the backend can scan out directly.
    pub fn import(
        &self,
        buffer: &dyn ClientBuffer,
        import_texture: impl FnOnce() -> anyhow::Result<Arc<Texture>>,
        import_framebuffer: impl FnOnce(&DmabufAttributes) -> Option<FramebufferHandle>,
    ) -> anyhow::Result<ImportedBuffer> {
        let id = buffer.id();
        if let Some(imported) = self.get(id) {
            return Ok(imported);
        }

        let texture = import_texture()?;
        let framebuffer = buffer.dmabuf().as_ref().and_then(import_framebuffer);

        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            id,
            CacheEntry {
                texture: Arc::downgrade(&texture),
                framebuffer,
            },
        );

        Ok(ImportedBuffer {
            texture,
            framebuffer,
        })
    }

    /// The backend dropped this framebuffer; forget the mapping.
    pub fn handle_destroyed_framebuffer(&self, fb: FramebufferHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, entry| entry.framebuffer != Some(fb));
    }

    /// Drops entries whose textures have died.
    pub fn prune(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, entry| entry.texture.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.inner.lock().unwrap().contains_key(&id)
    }
}

// =============================================================================
// MemoryBuffer
// =============================================================================

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// An shm-style buffer with client-visible lock tracking.
///
/// The nested backend uses these for cursor images; tests use them as stand-in
/// client buffers.
#[derive(Debug)]
pub struct MemoryBuffer {
    id: BufferId,
    width: u32,
    height: u32,
    format: u32,
    locks: AtomicU64,
    unlocks: AtomicU64,
    fence: Mutex<Option<OwnedFd>>,
    dmabuf: Option<DmabufAttributes>,
}

impl MemoryBuffer {
    pub fn new(width: u32, height: u32, format: u32) -> Self {
        Self {
            id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            width,
            height,
            format,
            locks: AtomicU64::new(0),
            unlocks: AtomicU64::new(0),
            fence: Mutex::new(None),
            dmabuf: None,
        }
    }

    /// Pretends the buffer is dma-buf backed, for scan-out paths.
    pub fn with_dmabuf(mut self, modifier: u64) -> Self {
        self.dmabuf = Some(DmabufAttributes {
            width: self.width,
            height: self.height,
            format: self.format,
            modifier,
            plane_count: 1,
        });
        self
    }

    /// Attaches an implicit fence fd handed out on the next commit.
    pub fn with_implicit_fence(self, fd: OwnedFd) -> Self {
        *self.fence.lock().unwrap() = Some(fd);
        self
    }

    pub fn lock_count(&self) -> u64 {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn unlock_count(&self) -> u64 {
        self.unlocks.load(Ordering::SeqCst)
    }
}

impl ClientBuffer for MemoryBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> u32 {
        self.format
    }

    fn dmabuf(&self) -> Option<DmabufAttributes> {
        self.dmabuf.clone()
    }

    fn implicit_fence(&self) -> Option<OwnedFd> {
        self.fence.lock().unwrap().take()
    }

    fn lock(&self) {
        self.locks.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
    }
}

// DRM_FORMAT_ARGB8888 / XRGB8888, the two formats everything understands.
pub const DRM_FORMAT_ARGB8888: u32 = u32::from_le_bytes(*b"AR24");
pub const DRM_FORMAT_XRGB8888: u32 = u32::from_le_bytes(*b"XR24");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::Texture;

    fn import(cache: &BufferCache, buffer: &MemoryBuffer) -> ImportedBuffer {
        cache
            .import(
                buffer,
                || Ok(Arc::new(Texture::for_tests(buffer.width(), buffer.height()))),
                |_| Some(FramebufferHandle(77)),
            )
            .unwrap()
    }

    #[test]
    fn import_is_cached_by_identity() {
        let cache = BufferCache::new();
        let buffer = MemoryBuffer::new(64, 64, DRM_FORMAT_ARGB8888).with_dmabuf(0);

        let first = import(&cache, &buffer);
        let second = import(&cache, &buffer);
        assert!(Arc::ptr_eq(&first.texture, &second.texture));
        assert_eq!(second.framebuffer, Some(FramebufferHandle(77)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entry_survives_while_texture_alive() {
        let cache = BufferCache::new();
        let buffer = MemoryBuffer::new(64, 64, DRM_FORMAT_ARGB8888);

        let imported = import(&cache, &buffer);
        cache.prune();
        assert!(cache.contains(buffer.id()));

        drop(imported);
        cache.prune();
        assert!(!cache.contains(buffer.id()));
    }

    #[test]
    fn framebuffer_destruction_drops_entry() {
        let cache = BufferCache::new();
        let buffer = MemoryBuffer::new(64, 64, DRM_FORMAT_ARGB8888).with_dmabuf(0);

        let _imported = import(&cache, &buffer);
        cache.handle_destroyed_framebuffer(FramebufferHandle(77));
        assert!(!cache.contains(buffer.id()));
    }
}
