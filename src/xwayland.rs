//! Interface to the embedded X servers.
//!
//! Protocol translation lives outside the core: each XWayland context hands us
//! a stream of typed events and accepts a small command vocabulary back. The
//! launcher's control properties all live on the root of context 0.

use std::sync::Mutex;

use calloop::channel::{Channel, Sender};

use crate::surface::SurfaceId;
use crate::utils::Rect;
use crate::window::{ContextId, WindowRoles, XWindowId};

// =============================================================================
// Events from the X server
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum XEvent {
    Created {
        window: XWindowId,
        geometry: Rect,
        override_redirect: bool,
        input_output: bool,
    },
    Mapped {
        window: XWindowId,
    },
    Unmapped {
        window: XWindowId,
    },
    Destroyed {
        window: XWindowId,
    },
    Configured {
        window: XWindowId,
        geometry: Rect,
    },
    /// The Wayland surface backing this X window became known.
    SurfaceAssociated {
        window: XWindowId,
        surface: SurfaceId,
    },
    /// New-frame hint; actual content arrives through the commit pipeline.
    Damaged {
        window: XWindowId,
    },
    Property {
        window: XWindowId,
        change: PropertyChange,
    },
    /// A property on the root window changed.
    RootProperty(RootPropertyChange),
    /// Connection to the X server died. Fatal.
    IoError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyChange {
    AppId(u32),
    Pid(u32),
    Opacity(u32),
    NetWmState {
        fullscreen: bool,
        skip_taskbar: bool,
        skip_pager: bool,
    },
    WindowType {
        dialog: bool,
    },
    SizeHints {
        maybe_a_dropdown: bool,
        requested: Option<(u32, u32)>,
    },
    TransientFor(Option<XWindowId>),
    Title(Option<String>),
    Icon(Vec<u32>),
    InputFocusMode(u32),
    Role {
        role: WindowRoles,
        set: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RootPropertyChange {
    /// `GAMESCOPECTRL_BASELAYER_APPID`: ordered list of focusable app ids.
    FocusControlAppIds(Vec<u32>),
    /// `GAMESCOPECTRL_BASELAYER_WINDOW`: a single pinned window.
    FocusControlWindow(Option<XWindowId>),
    /// `GAMESCOPE_FPS_LIMIT`.
    FpsLimit(u32),
    /// `GAMESCOPE_DYNAMIC_REFRESH{,_EXTERNAL}`.
    DynamicRefresh { external: bool, hz: u32 },
    /// `GAMESCOPE_TUNEABLE_VBLANK_REDZONE`.
    VblankRedzone(u64),
    /// `GAMESCOPE_TUNEABLE_VBLANK_RATE_OF_DECAY_PERCENTAGE`.
    VblankDecay(u64),
    /// `GAMESCOPE_XWAYLAND_MODE_CONTROL`.
    ModeControl {
        server: usize,
        width: u32,
        height: u32,
        allow_super_resolution: bool,
    },
    /// `GAMESCOPE_SCREENSHOT` analog: screenshot requested via property.
    ScreenshotRequested,
}

// =============================================================================
// Commands to the X server
// =============================================================================

/// Commands the focus engine and paint loop issue back to a context.
pub trait XConn: Send {
    /// Writes `_NET_WM_STATE = [NORMAL]`. Never ICONIC.
    fn set_wm_state_normal(&mut self, window: XWindowId);
    fn raise(&mut self, window: XWindowId);
    fn move_window(&mut self, window: XWindowId, x: i32, y: i32);
    fn resize_window(&mut self, window: XWindowId, w: u32, h: u32);
    fn set_input_focus(&mut self, window: XWindowId);
    fn set_root_cardinal(&mut self, name: &str, values: &[u32]);
    fn set_root_string(&mut self, name: &str, value: &str);
    fn delete_root_property(&mut self, name: &str);
    /// Display name of the nested X server (":1" and friends).
    fn display_name(&self) -> &str;
}

/// One XWayland context: command connection plus control state mirrored from
/// its root window.
pub struct XContext {
    pub id: ContextId,
    pub conn: Box<dyn XConn>,
    /// Root (output) extent of this context.
    pub root_size: (u32, u32),
    /// `GAMESCOPECTRL_BASELAYER_WINDOW`, only meaningful on context 0.
    pub focus_control_window: Option<XWindowId>,
    /// `GAMESCOPECTRL_BASELAYER_APPID`, only meaningful on context 0.
    pub focus_control_app_ids: Vec<u32>,
    /// Keyboard focus as last applied, for stickiness.
    pub current_keyboard_focus: Option<XWindowId>,
}

impl XContext {
    pub fn new(id: ContextId, conn: Box<dyn XConn>, root_size: (u32, u32)) -> Self {
        Self {
            id,
            conn,
            root_size,
            focus_control_window: None,
            focus_control_app_ids: Vec::new(),
            current_keyboard_focus: None,
        }
    }
}

// =============================================================================
// NullConn
// =============================================================================

/// Commands recorded by the null connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    WmStateNormal(XWindowId),
    Raise(XWindowId),
    Move(XWindowId, i32, i32),
    Resize(XWindowId, u32, u32),
    InputFocus(XWindowId),
    RootCardinal(String, Vec<u32>),
    RootString(String, String),
    DeleteRootProperty(String),
}

/// An X connection that records commands instead of sending them. Used for
/// headless operation and in tests.
pub struct NullConn {
    display_name: String,
    commands: Mutex<Vec<RecordedCommand>>,
}

impl NullConn {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn take_commands(&self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands.lock().unwrap())
    }

    fn push(&self, command: RecordedCommand) {
        self.commands.lock().unwrap().push(command);
    }
}

impl XConn for NullConn {
    fn set_wm_state_normal(&mut self, window: XWindowId) {
        self.push(RecordedCommand::WmStateNormal(window));
    }

    fn raise(&mut self, window: XWindowId) {
        self.push(RecordedCommand::Raise(window));
    }

    fn move_window(&mut self, window: XWindowId, x: i32, y: i32) {
        self.push(RecordedCommand::Move(window, x, y));
    }

    fn resize_window(&mut self, window: XWindowId, w: u32, h: u32) {
        self.push(RecordedCommand::Resize(window, w, h));
    }

    fn set_input_focus(&mut self, window: XWindowId) {
        self.push(RecordedCommand::InputFocus(window));
    }

    fn set_root_cardinal(&mut self, name: &str, values: &[u32]) {
        self.push(RecordedCommand::RootCardinal(name.to_owned(), values.to_vec()));
    }

    fn set_root_string(&mut self, name: &str, value: &str) {
        self.push(RecordedCommand::RootString(name.to_owned(), value.to_owned()));
    }

    fn delete_root_property(&mut self, name: &str) {
        self.push(RecordedCommand::DeleteRootProperty(name.to_owned()));
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }
}

// Tests and the headless front-end keep an `Arc<NullConn>` around to inspect
// the recorded commands after handing the connection to a context.
impl XConn for std::sync::Arc<NullConn> {
    fn set_wm_state_normal(&mut self, window: XWindowId) {
        self.push(RecordedCommand::WmStateNormal(window));
    }

    fn raise(&mut self, window: XWindowId) {
        self.push(RecordedCommand::Raise(window));
    }

    fn move_window(&mut self, window: XWindowId, x: i32, y: i32) {
        self.push(RecordedCommand::Move(window, x, y));
    }

    fn resize_window(&mut self, window: XWindowId, w: u32, h: u32) {
        self.push(RecordedCommand::Resize(window, w, h));
    }

    fn set_input_focus(&mut self, window: XWindowId) {
        self.push(RecordedCommand::InputFocus(window));
    }

    fn set_root_cardinal(&mut self, name: &str, values: &[u32]) {
        self.push(RecordedCommand::RootCardinal(name.to_owned(), values.to_vec()));
    }

    fn set_root_string(&mut self, name: &str, value: &str) {
        self.push(RecordedCommand::RootString(name.to_owned(), value.to_owned()));
    }

    fn delete_root_property(&mut self, name: &str) {
        self.push(RecordedCommand::DeleteRootProperty(name.to_owned()));
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Creates the event channel a context feeds the compositor through.
pub fn event_channel() -> (Sender<XEvent>, Channel<XEvent>) {
    calloop::channel::channel()
}
