//! Screenshot encoding.
//!
//! The capture itself comes out of the compositor as tightly packed BGRA; a
//! detached thread swizzles it to RGBA, drops the alpha, and writes a PNG so
//! the paint loop never blocks on disk.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Context;
use bytemuck::cast_slice;

use crate::render::CapturedFrame;
use crate::utils::{make_screenshot_path, write_png_rgba8};

/// Converts a BGRA capture to opaque RGBA.
pub fn bgra_to_rgba(frame: &CapturedFrame) -> Vec<u8> {
    let pixels: &[u32] = cast_slice(&frame.pixels);
    let mut out = Vec::with_capacity(pixels.len() * 4);
    for px in pixels {
        let [b, g, r, _a] = px.to_le_bytes();
        out.extend_from_slice(&[r, g, b, 0xff]);
    }
    out
}

pub fn write_screenshot(path: &PathBuf, frame: &CapturedFrame) -> anyhow::Result<()> {
    let rgba = bgra_to_rgba(frame);
    let file = File::create(path).with_context(|| format!("error creating {path:?}"))?;
    write_png_rgba8(BufWriter::new(file), frame.width, frame.height, &rgba)
}

/// Encodes on a detached thread, like the rest of the paint loop never
/// happened.
pub fn spawn_screenshot_thread(path: Option<PathBuf>, frame: CapturedFrame) {
    let path = path.unwrap_or_else(make_screenshot_path);

    let builder = std::thread::Builder::new().name("monocle-scrsh".to_owned());
    let result = builder.spawn(move || match write_screenshot(&path, &frame) {
        Ok(()) => info!("screenshot saved to {path:?}"),
        Err(err) => error!("error saving screenshot to {path:?}: {err:?}"),
    });
    if let Err(err) = result {
        error!("error spawning the screenshot thread: {err}");
    }
}
