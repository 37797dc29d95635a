//! Replay mode guard
//!
//! Update replay runs with the container write-enabled and free-space
//! recycling off, so that replayed edits lay out exactly as recorded. The
//! guard switches both flags on creation and restores the previous values
//! when dropped, whichever way replay exits.

use crate::container::Container;
use std::ops::{Deref, DerefMut};

/// Holds a container in replay mode for its lifetime
pub(crate) struct ModeGuard<'a> {
    container: &'a mut Container,
    writable: bool,
    tracking: bool,
}

impl<'a> ModeGuard<'a> {
    /// Put `container` into replay mode
    pub(crate) fn enter(container: &'a mut Container) -> Self {
        let writable = container.writable;
        let tracking = container.free_space.is_tracking();
        container.writable = true;
        container.free_space.set_tracking(false);
        tracing::trace!(target: "bento::update", writable, tracking, "Entered replay mode");
        ModeGuard {
            container,
            writable,
            tracking,
        }
    }
}

impl Deref for ModeGuard<'_> {
    type Target = Container;

    fn deref(&self) -> &Container {
        self.container
    }
}

impl DerefMut for ModeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Container {
        self.container
    }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.container.writable = self.writable;
        self.container.free_space.set_tracking(self.tracking);
        tracing::trace!(target: "bento::update", "Left replay mode");
    }
}
