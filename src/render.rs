//! Interface to the off-screen Vulkan compositor.
//!
//! The renderer is a black box: it imports client buffers as textures and
//! turns a frame plan into a single output texture. The real implementation
//! lives behind this trait; the null renderer backs headless runs and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::ClientBuffer;
use crate::planner::FramePlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// An opaque GPU image.
#[derive(Debug)]
pub struct Texture {
    id: TextureId,
    width: u32,
    height: u32,
}

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

impl Texture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            id: TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed)),
            width,
            height,
        }
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[cfg(test)]
    pub fn for_tests(width: u32, height: u32) -> Self {
        Self::new(width, height)
    }
}

/// Output of a composite pass that was asked to capture.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed BGRA8.
    pub pixels: Vec<u8>,
}

pub trait Renderer: Send {
    fn import_texture(&mut self, buffer: &dyn ClientBuffer) -> anyhow::Result<Arc<Texture>>;

    /// Composites the frame off-screen and returns the output image.
    ///
    /// When `capture` is requested the output is also read back into CPU
    /// memory.
    fn composite(
        &mut self,
        frame: &FramePlan,
        output_size: (u32, u32),
        capture: bool,
    ) -> anyhow::Result<CompositeResult>;
}

#[derive(Debug)]
pub struct CompositeResult {
    pub output: Arc<Texture>,
    pub captured: Option<CapturedFrame>,
}

/// A renderer that allocates handles but touches no GPU.
#[derive(Default)]
pub struct NullRenderer {
    composites: u64,
}

impl NullRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn composite_count(&self) -> u64 {
        self.composites
    }
}

impl Renderer for NullRenderer {
    fn import_texture(&mut self, buffer: &dyn ClientBuffer) -> anyhow::Result<Arc<Texture>> {
        Ok(Arc::new(Texture::new(buffer.width(), buffer.height())))
    }

    fn composite(
        &mut self,
        _frame: &FramePlan,
        output_size: (u32, u32),
        capture: bool,
    ) -> anyhow::Result<CompositeResult> {
        self.composites += 1;
        let (width, height) = output_size;
        let captured = capture.then(|| CapturedFrame {
            width,
            height,
            pixels: vec![0; (width * height * 4) as usize],
        });
        Ok(CompositeResult {
            output: Arc::new(Texture::new(width, height)),
            captured,
        })
    }
}
