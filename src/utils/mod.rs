//! Small helpers shared across the compositor.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

pub mod region;

pub use region::{Rect, Region};

/// Returns time from an unspecified monotonic epoch.
pub fn get_monotonic_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for the duration of the call.
    let rv = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(rv, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

pub fn get_monotonic_time_nanos() -> u64 {
    let time = get_monotonic_time();
    time.as_secs() * 1_000_000_000 + u64::from(time.subsec_nanos())
}

/// Splits nanoseconds into the (tv_sec_hi, tv_sec_lo, tv_nsec) triple used by
/// presentation-time events.
pub fn nanos_to_wp_timespec(nanos: u64) -> (u32, u32, u32) {
    let tv_sec = nanos / 1_000_000_000;
    let tv_nsec = (nanos % 1_000_000_000) as u32;
    ((tv_sec >> 32) as u32, (tv_sec & 0xffff_ffff) as u32, tv_nsec)
}

pub fn split_u64(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, (value & 0xffff_ffff) as u32)
}

// Refresh rates travel as millihertz so that fractional modes survive the
// round trip through cycle durations.

pub fn hz_to_mhz(hz: u32) -> u32 {
    hz * 1_000
}

pub fn mhz_to_hz(mhz: u32) -> u32 {
    (mhz + 999) / 1_000
}

pub fn refresh_cycle_to_mhz(cycle_ns: u64) -> u32 {
    ((1_000_000_000_000u64 + cycle_ns - 1) / cycle_ns) as u32
}

pub fn mhz_to_refresh_cycle(mhz: u32) -> u64 {
    (1_000_000_000_000u64 + u64::from(mhz) - 1) / u64::from(mhz)
}

/// Default path for a screenshot taken "now" in local time.
pub fn make_screenshot_path() -> PathBuf {
    let mut tm = libc::tm {
        tm_sec: 0,
        tm_min: 0,
        tm_hour: 0,
        tm_mday: 0,
        tm_mon: 0,
        tm_year: 0,
        tm_wday: 0,
        tm_yday: 0,
        tm_isdst: 0,
        tm_gmtoff: 0,
        tm_zone: std::ptr::null(),
    };
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    // SAFETY: localtime_r fills `tm` without retaining the pointer.
    unsafe { libc::localtime_r(&now, &mut tm) };

    PathBuf::from(format!(
        "/tmp/gamescope_{:04}-{:02}-{:02}_{:02}-{:02}-{:02}.png",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
    ))
}

pub fn write_png_rgba8(
    w: impl Write,
    width: u32,
    height: u32,
    pixels: &[u8],
) -> anyhow::Result<()> {
    let mut encoder = png::Encoder::new(w, width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);

    let mut writer = encoder
        .write_header()
        .context("error writing PNG header")?;
    writer
        .write_image_data(pixels)
        .context("error writing PNG image data")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wp_timespec_split() {
        let nanos = 5_000_000_123u64;
        let (hi, lo, nsec) = nanos_to_wp_timespec(nanos);
        assert_eq!(hi, 0);
        assert_eq!(lo, 5);
        assert_eq!(nsec, 123);
    }

    #[test]
    fn refresh_conversions_round_up() {
        assert_eq!(mhz_to_hz(59_999), 60);
        assert_eq!(hz_to_mhz(60), 60_000);
        // 60 Hz cycle is 16.6ms; converting back must not lose the rate.
        let cycle = mhz_to_refresh_cycle(60_000);
        assert_eq!(refresh_cycle_to_mhz(cycle), 60_000);
    }

    #[test]
    fn screenshot_path_shape() {
        let path = make_screenshot_path();
        let s = path.to_str().unwrap();
        assert!(s.starts_with("/tmp/gamescope_"), "{s}");
        assert!(s.ends_with(".png"), "{s}");
    }
}
