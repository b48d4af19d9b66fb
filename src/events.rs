// Surface events
//
// The window layer pushes what happened to the surface; the frame loop drains
// the queue once per frame and gets one coalesced set of changes to apply.

use ash::vk;
use crossbeam_channel::{Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    Resized(vk::Extent2D),
    Minimized,
    SetVsync(bool),
    ToggleVsync,
    CloseRequested,
}

/// Net effect of every event since the last drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingChanges {
    /// Latest drawable size, if it changed.
    pub resize: Option<vk::Extent2D>,
    /// Requested v-sync state, if it changed.
    pub vsync: Option<bool>,
    pub minimized: bool,
    pub close: bool,
}

impl PendingChanges {
    /// The swapchain has to be rebuilt before the next frame.
    pub fn needs_recreate(&self) -> bool {
        self.resize.is_some() || self.vsync.is_some()
    }
}

pub struct EventQueue {
    sender: Sender<SurfaceEvent>,
    receiver: Receiver<SurfaceEvent>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// Cloneable handle for whoever produces events.
    pub fn sender(&self) -> Sender<SurfaceEvent> {
        self.sender.clone()
    }

    pub fn push(&self, event: SurfaceEvent) {
        // Cannot fail, we hold the receiver
        let _ = self.sender.send(event);
    }

    /// Coalesce everything queued so far. `vsync` is the current setting,
    /// used to resolve toggles.
    pub fn drain(&self, vsync: bool) -> PendingChanges {
        let mut changes = PendingChanges::default();
        let mut wanted_vsync = vsync;

        for event in self.receiver.try_iter() {
            match event {
                SurfaceEvent::Resized(extent) if extent.width == 0 || extent.height == 0 => {
                    changes.minimized = true;
                }
                SurfaceEvent::Resized(extent) => {
                    changes.resize = Some(extent);
                    changes.minimized = false;
                }
                SurfaceEvent::Minimized => changes.minimized = true,
                SurfaceEvent::SetVsync(on) => wanted_vsync = on,
                SurfaceEvent::ToggleVsync => wanted_vsync = !wanted_vsync,
                SurfaceEvent::CloseRequested => changes.close = true,
            }
        }

        if wanted_vsync != vsync {
            changes.vsync = Some(wanted_vsync);
        }
        if changes.minimized || changes.resize.is_some() || changes.vsync.is_some() || changes.close {
            log::debug!("Surface changes: {:?}", changes);
        }
        changes
    }
}
