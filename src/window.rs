//! X windows as the compositor sees them.
//!
//! The embedded X server delivers Create/Map/Configure/Property events; this
//! module keeps the resulting per-context window lists. The lists are shared
//! between the compositor thread (which mutates them from X events and runs
//! focus over them) and the server thread (which resolves surfaces to
//! windows), so the whole forest sits behind one mutex.

use crate::surface::SurfaceId;
use crate::utils::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XWindowId(pub u32);

/// Index of an XWayland context. Context 0 hosts the launcher and owns the
/// control properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub usize);

/// A window key unique across contexts.
pub type WindowKey = (ContextId, XWindowId);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WindowRoles: u32 {
        const OVERLAY = 1 << 0;
        const EXTERNAL_OVERLAY = 1 << 1;
        const FULLSCREEN = 1 << 2;
        const DIALOG = 1 << 3;
        const SKIP_TASKBAR = 1 << 4;
        const SKIP_PAGER = 1 << 5;
        const SYS_TRAY = 1 << 6;
        /// The launcher shell itself; focusable without an app id.
        const LAUNCHER = 1 << 7;
        /// Remote-play client UI; focusable even at opacity 0.
        const STREAMING_CLIENT = 1 << 8;
        /// Video underlay paired with a streaming client.
        const STREAMING_VIDEO = 1 << 9;
        /// Cursor parks in the corner while hidden so hover never fires.
        const NO_FOCUS_WHEN_HIDDEN = 1 << 10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum InputFocusMode {
    #[default]
    None = 0,
    StealAll = 1,
    StealMouseOnly = 2,
}

impl InputFocusMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::StealAll,
            2 => Self::StealMouseOnly,
            _ => Self::None,
        }
    }

    pub fn steals_input(self) -> bool {
        self != Self::None
    }
}

pub const OPACITY_OPAQUE: u32 = 0xffff_ffff;
pub const OPACITY_TRANSLUCENT: u32 = 0;

#[derive(Debug, Clone)]
pub struct Window {
    pub id: XWindowId,
    pub surface: Option<SurfaceId>,
    pub geometry: Rect,
    pub mapped: bool,
    /// InputOutput as opposed to InputOnly.
    pub input_output: bool,
    pub override_redirect: bool,
    /// Set for the old-SDL-fullscreen pattern where the override-redirect
    /// parent is really the game window.
    pub ignore_override_redirect: bool,
    pub opacity: u32,
    pub app_id: u32,
    pub pid: u32,
    pub roles: WindowRoles,
    /// Position/gravity hints put this window at a fixed spot.
    pub maybe_a_dropdown: bool,
    pub transient_for: Option<XWindowId>,
    /// Bumped whenever a new ready commit arrives for the window's surface.
    pub damage_sequence: u64,
    pub map_sequence: u64,
    pub input_focus_mode: InputFocusMode,
    /// Fixed size requested through WM_NORMAL_HINTS, if any.
    pub requested_size: Option<(u32, u32)>,
    /// The window got its initial (1,1) shake-out move.
    pub nudged: bool,
    pub title: Option<String>,
    pub icon: Option<Vec<u32>>,
    /// Unmap/destroy seen; may still be referenced by the fade slot.
    pub destroying: bool,
}

impl Window {
    pub fn new(id: XWindowId, geometry: Rect, override_redirect: bool, input_output: bool) -> Self {
        Self {
            id,
            surface: None,
            geometry,
            mapped: false,
            input_output,
            override_redirect,
            ignore_override_redirect: false,
            opacity: OPACITY_OPAQUE,
            app_id: 0,
            pid: 0,
            roles: WindowRoles::empty(),
            maybe_a_dropdown: false,
            transient_for: None,
            damage_sequence: 0,
            map_sequence: 0,
            input_focus_mode: InputFocusMode::None,
            requested_size: None,
            nudged: false,
            title: None,
            icon: None,
            destroying: false,
        }
    }

    pub fn has_app_id(&self) -> bool {
        self.app_id != 0
    }

    pub fn is_overlay(&self) -> bool {
        self.roles.contains(WindowRoles::OVERLAY)
    }

    pub fn is_external_overlay(&self) -> bool {
        self.roles.contains(WindowRoles::EXTERNAL_OVERLAY)
    }

    pub fn is_fullscreen(&self) -> bool {
        self.roles.contains(WindowRoles::FULLSCREEN)
    }

    pub fn is_dialog(&self) -> bool {
        self.roles.contains(WindowRoles::DIALOG)
    }

    pub fn skip_taskbar_and_pager(&self) -> bool {
        self.roles
            .contains(WindowRoles::SKIP_TASKBAR | WindowRoles::SKIP_PAGER)
    }
}

/// Per-context window list, in stacking order (topmost first).
#[derive(Debug, Default)]
pub struct WindowStore {
    windows: Vec<Window>,
    next_map_sequence: u64,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, window: Window) {
        self.windows.insert(0, window);
    }

    pub fn get(&self, id: XWindowId) -> Option<&Window> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn get_mut(&mut self, id: XWindowId) -> Option<&mut Window> {
        self.windows.iter_mut().find(|w| w.id == id)
    }

    pub fn remove(&mut self, id: XWindowId) -> Option<Window> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn map(&mut self, id: XWindowId) {
        self.next_map_sequence += 1;
        let seq = self.next_map_sequence;
        if let Some(window) = self.get_mut(id) {
            window.mapped = true;
            window.map_sequence = seq;
        }
    }

    pub fn unmap(&mut self, id: XWindowId) {
        if let Some(window) = self.get_mut(id) {
            window.mapped = false;
            window.destroying = true;
        }
    }

    /// Moves the window to the top of the stack.
    pub fn raise(&mut self, id: XWindowId) {
        if let Some(pos) = self.windows.iter().position(|w| w.id == id) {
            let window = self.windows.remove(pos);
            self.windows.insert(0, window);
        }
    }

    pub fn topmost(&self) -> Option<&Window> {
        self.windows.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Window> {
        self.windows.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Window> {
        self.windows.iter_mut()
    }

    pub fn window_for_surface(&self, surface: SurfaceId) -> Option<&Window> {
        self.windows.iter().find(|w| w.surface == Some(surface))
    }
}

/// All contexts' window lists, behind the shared lock.
#[derive(Debug, Default)]
pub struct WindowForest {
    contexts: Vec<WindowStore>,
}

impl WindowForest {
    pub fn new(context_count: usize) -> Self {
        Self {
            contexts: (0..context_count).map(|_| WindowStore::new()).collect(),
        }
    }

    pub fn context(&self, ctx: ContextId) -> Option<&WindowStore> {
        self.contexts.get(ctx.0)
    }

    pub fn context_mut(&mut self, ctx: ContextId) -> Option<&mut WindowStore> {
        self.contexts.get_mut(ctx.0)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn get(&self, key: WindowKey) -> Option<&Window> {
        self.context(key.0)?.get(key.1)
    }

    pub fn get_mut(&mut self, key: WindowKey) -> Option<&mut Window> {
        self.context_mut(key.0)?.get_mut(key.1)
    }

    pub fn window_for_surface(&self, surface: SurfaceId) -> Option<(ContextId, &Window)> {
        self.contexts.iter().enumerate().find_map(|(i, store)| {
            store
                .window_for_surface(surface)
                .map(|w| (ContextId(i), w))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_assigns_increasing_sequences() {
        let mut store = WindowStore::new();
        store.insert(Window::new(XWindowId(1), Rect::from_size(10, 10), false, true));
        store.insert(Window::new(XWindowId(2), Rect::from_size(10, 10), false, true));

        store.map(XWindowId(1));
        store.map(XWindowId(2));

        let a = store.get(XWindowId(1)).unwrap().map_sequence;
        let b = store.get(XWindowId(2)).unwrap().map_sequence;
        assert!(b > a);
    }

    #[test]
    fn raise_restacks() {
        let mut store = WindowStore::new();
        store.insert(Window::new(XWindowId(1), Rect::from_size(10, 10), false, true));
        store.insert(Window::new(XWindowId(2), Rect::from_size(10, 10), false, true));
        assert_eq!(store.topmost().unwrap().id, XWindowId(2));

        store.raise(XWindowId(1));
        assert_eq!(store.topmost().unwrap().id, XWindowId(1));
    }
}
