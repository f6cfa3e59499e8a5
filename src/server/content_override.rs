//! Content overrides: "present this surface instead of window W's own".
//!
//! Three lifetimes meet here and each gets its own explicit transition rather
//! than a tangle of destructors: the X window binding (replaced on
//! re-registration), the override surface (teardown when it dies), and the
//! swapchain resource (teardown without a retired event when it dies first).

use std::collections::HashMap;

use crate::protocols::{ClientEvent, EventSender, SwapchainId};
use crate::surface::SurfaceId;
use crate::window::{ContextId, XWindowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverrideEntry {
    pub surface: SurfaceId,
    pub swapchain: Option<SwapchainId>,
}

#[derive(Debug, Default)]
pub struct ContentOverrideTable {
    map: HashMap<(ContextId, XWindowId), OverrideEntry>,
}

impl ContentOverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `surface` as the presented content for `window`.
    ///
    /// A previous registration for the same window is retired first. Commits
    /// already queued against the surface stay queued; they replay in order
    /// once the compositor looks the override up.
    pub fn register(
        &mut self,
        events: &EventSender,
        ctx: ContextId,
        window: XWindowId,
        surface: SurfaceId,
        swapchain: Option<SwapchainId>,
    ) {
        let key = (ctx, window);

        if let Some(existing) = self.map.get(&key) {
            if existing.swapchain == swapchain && swapchain.is_some() {
                return;
            }
            self.retire(events, key);
        }

        debug!("content override: window {window:?} -> surface {surface:?}");
        self.map.insert(key, OverrideEntry { surface, swapchain });
    }

    /// The surface presented for `window`, when overridden.
    pub fn resolve(&self, ctx: ContextId, window: XWindowId) -> Option<SurfaceId> {
        self.map.get(&(ctx, window)).map(|entry| entry.surface)
    }

    /// Reverse lookup: the window whose content this surface overrides.
    pub fn window_for_surface(&self, surface: SurfaceId) -> Option<(ContextId, XWindowId)> {
        self.map
            .iter()
            .find(|(_, entry)| entry.surface == surface)
            .map(|(key, _)| *key)
    }

    /// Override surface died; its windows fall back to their own surfaces.
    pub fn handle_surface_destroyed(&mut self, events: &EventSender, surface: SurfaceId) {
        let keys: Vec<_> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.surface == surface)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            self.retire(events, key);
        }
    }

    /// Swapchain resource died first: drop the override but don't send events
    /// to a dead resource.
    pub fn handle_swapchain_destroyed(&mut self, swapchain: SwapchainId) {
        self.map
            .retain(|_, entry| entry.swapchain != Some(swapchain));
    }

    fn retire(&mut self, events: &EventSender, key: (ContextId, XWindowId)) {
        if let Some(entry) = self.map.remove(&key) {
            if let Some(swapchain) = entry.swapchain {
                let _ = events.send(ClientEvent::Retired { swapchain });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
