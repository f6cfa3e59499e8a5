//! Configuration for the monocle compositor.
//!
//! The config file is KDL. Every section is optional; the defaults match the
//! behavior of an unconfigured compositor session.

use std::path::Path;

use miette::{miette, Context, IntoDiagnostic};

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, default)]
    pub output: Output,
    #[knuffel(child, default)]
    pub frame_timing: FrameTiming,
    #[knuffel(child, default)]
    pub fade: Fade,
    #[knuffel(child, default)]
    pub cursor: Cursor,
    #[knuffel(child, default)]
    pub focus: Focus,
    #[knuffel(child, default)]
    pub debug: Debug,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Output {
    /// Logical size the nested X servers believe the screen has.
    #[knuffel(child, unwrap(argument), default = 1280)]
    pub nested_width: u32,
    #[knuffel(child, unwrap(argument), default = 720)]
    pub nested_height: u32,
    /// Refresh override for nested sessions, in Hz. 0 uses the backend mode.
    #[knuffel(child, unwrap(argument), default = 0)]
    pub nested_refresh: u32,
    /// Upper bound on the focus-window upscale factor. 0 means unlimited.
    #[knuffel(child, unwrap(argument), default = 0.0)]
    pub max_window_scale: f64,
    /// Floor the upscale factor to an integer multiple.
    #[knuffel(child)]
    pub integer_scale: bool,
    /// Sample the game window with a linear filter.
    #[knuffel(child, unwrap(argument), default = true)]
    pub linear_filter: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            nested_width: 1280,
            nested_height: 720,
            nested_refresh: 0,
            max_window_scale: 0.0,
            integer_scale: false,
            linear_filter: true,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct FrameTiming {
    /// Margin subtracted from the predicted vblank, in nanoseconds.
    #[knuffel(child, unwrap(argument), default = 1_000_000)]
    pub vblank_redzone_ns: u64,
    /// Weight of the previous draw-time estimate, in percent.
    #[knuffel(child, unwrap(argument), default = 90)]
    pub vblank_decay_percent: u64,
    /// How long the refresh rate must stay equal before a dynamic switch, ms.
    #[knuffel(child, unwrap(argument), default = 600)]
    pub dynamic_refresh_settle_ms: u64,
    /// Frame-callback limit for rate-limited windows, in Hz. 0 disables.
    #[knuffel(child, unwrap(argument), default = 0)]
    pub fps_limit: u32,
    /// Ready-but-unpresented commits kept per surface.
    #[knuffel(child, unwrap(argument), default = 3)]
    pub max_commit_queue: usize,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self {
            vblank_redzone_ns: 1_000_000,
            vblank_decay_percent: 90,
            dynamic_refresh_settle_ms: 600,
            fps_limit: 0,
            max_commit_queue: 3,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq, Default)]
pub struct Fade {
    /// Crossfade length on focus change, in milliseconds. 0 disables fading.
    #[knuffel(child, unwrap(argument), default = 0)]
    pub duration_ms: u64,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Cursor {
    /// Hide the cursor after this much time without motion, in milliseconds.
    #[knuffel(child, unwrap(argument), default = 10_000)]
    pub hide_timeout_ms: u64,
    /// Scale applied to relative pointer motion.
    #[knuffel(child, unwrap(argument), default = 1.0)]
    pub sensitivity: f64,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            hide_timeout_ms: 10_000,
            sensitivity: 1.0,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Focus {
    /// Windows at or below this size in both dimensions are considered
    /// useless for focus purposes. The historical value is 1 (1x1 windows).
    #[knuffel(child, unwrap(argument), default = 1)]
    pub useless_window_threshold: u32,
    /// Minimum width for a window to qualify as the main overlay.
    #[knuffel(child, unwrap(argument), default = 1200)]
    pub overlay_min_width: u32,
}

impl Default for Focus {
    fn default() -> Self {
        Self {
            useless_window_threshold: 1,
            overlay_min_width: 1200,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq, Default)]
pub struct Debug {
    /// Route every frame through the off-screen compositor.
    #[knuffel(child)]
    pub always_composite: bool,
    /// Log focus elections in detail.
    #[knuffel(child)]
    pub focus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::parse("default.kdl", "").unwrap()
    }
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let config = Self::parse(
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("config.kdl"),
            &contents,
        )
        .map_err(|err| miette!("error parsing: {err}"))?;

        tracing::debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let config = knuffel::parse::<Config>(filename, text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn do_parse(text: &str) -> Config {
        Config::parse("test.kdl", text)
            .map_err(miette::Report::new)
            .unwrap()
    }

    #[test]
    fn parse_empty() {
        let config = do_parse("");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parse_full() {
        let config = do_parse(
            r#"
            output {
                nested-width 1920
                nested-height 1080
                nested-refresh 60
                max-window-scale 2.0
                integer-scale
                linear-filter false
            }

            frame-timing {
                vblank-redzone-ns 1650000
                vblank-decay-percent 80
                dynamic-refresh-settle-ms 300
                fps-limit 30
                max-commit-queue 2
            }

            fade {
                duration-ms 200
            }

            cursor {
                hide-timeout-ms 3000
                sensitivity 0.5
            }

            focus {
                useless-window-threshold 2
                overlay-min-width 800
            }

            debug {
                always-composite
                focus
            }
            "#,
        );

        assert_eq!(
            config,
            Config {
                output: Output {
                    nested_width: 1920,
                    nested_height: 1080,
                    nested_refresh: 60,
                    max_window_scale: 2.0,
                    integer_scale: true,
                    linear_filter: false,
                },
                frame_timing: FrameTiming {
                    vblank_redzone_ns: 1_650_000,
                    vblank_decay_percent: 80,
                    dynamic_refresh_settle_ms: 300,
                    fps_limit: 30,
                    max_commit_queue: 2,
                },
                fade: Fade { duration_ms: 200 },
                cursor: Cursor {
                    hide_timeout_ms: 3000,
                    sensitivity: 0.5,
                },
                focus: Focus {
                    useless_window_threshold: 2,
                    overlay_min_width: 800,
                },
                debug: Debug {
                    always_composite: true,
                    focus: true,
                },
            }
        );
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.frame_timing.max_commit_queue, 3);
        assert_eq!(config.frame_timing.vblank_redzone_ns, 1_000_000);
        assert_eq!(config.cursor.hide_timeout_ms, 10_000);
        assert_eq!(config.fade.duration_ms, 0);
    }
}
