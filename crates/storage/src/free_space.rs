//! Free-space allocator for the updating container
//!
//! Byte ranges released by deletions are kept as coalesced holes and
//! handed out again first-fit. When no hole is large enough the layer is
//! extended at its end of file.
//!
//! Only ranges of the updating layer are tracked: bytes of lower layers
//! are immutable and their release is ignored. Tracking can be switched
//! off, which is how update replay keeps already-laid-out data intact.

use crate::layers::{ByteStore, LayerError};
use bento_core::ContainerId;
use std::collections::BTreeMap;

/// Free-space allocator of one updating layer
#[derive(Debug, Clone)]
pub struct FreeSpace {
    container: ContainerId,
    holes: BTreeMap<u32, u32>,
    tracking: bool,
}

impl FreeSpace {
    /// Create an allocator for the given updating layer
    pub fn new(container: ContainerId) -> Self {
        FreeSpace {
            container,
            holes: BTreeMap::new(),
            tracking: true,
        }
    }

    /// Layer this allocator manages
    pub fn container(&self) -> ContainerId {
        self.container
    }

    /// Whether released ranges are being recorded
    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Enable or disable recording of released ranges
    pub fn set_tracking(&mut self, tracking: bool) {
        self.tracking = tracking;
    }

    /// Total bytes currently free
    pub fn free_bytes(&self) -> u64 {
        self.holes.values().map(|len| *len as u64).sum()
    }

    /// Number of holes
    pub fn hole_count(&self) -> usize {
        self.holes.len()
    }

    /// Reserve `size` bytes, reusing a hole if one fits
    pub fn reserve(&mut self, store: &mut ByteStore, size: u32) -> Result<u32, LayerError> {
        if size == 0 {
            return Ok(store.eof());
        }
        let fit = self
            .holes
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(offset, len)| (*offset, *len));
        if let Some((offset, len)) = fit {
            self.holes.remove(&offset);
            if len > size {
                self.holes.insert(offset + size, len - size);
            }
            tracing::trace!(target: "bento::free_space", offset, size, "Reused hole");
            return Ok(offset);
        }
        store.extend(size).ok_or(LayerError::Full(self.container))
    }

    /// Return a byte range to the pool
    ///
    /// Ranges of other layers, empty ranges, and any range while tracking
    /// is off are ignored.
    pub fn release(&mut self, container: ContainerId, offset: u32, len: u32) {
        if !self.tracking || container != self.container || len == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + len;

        if let Some((&prev, &prev_len)) = self.holes.range(..start).next_back() {
            if prev + prev_len >= start {
                start = prev;
                end = end.max(prev + prev_len);
                self.holes.remove(&prev);
            }
        }
        let following: Vec<(u32, u32)> = self
            .holes
            .range(start..=end)
            .map(|(o, l)| (*o, *l))
            .collect();
        for (next, next_len) in following {
            end = end.max(next + next_len);
            self.holes.remove(&next);
        }
        self.holes.insert(start, end - start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> (FreeSpace, ByteStore) {
        (FreeSpace::new(ContainerId(1)), ByteStore::new())
    }

    #[test]
    fn test_reserve_extends_eof() {
        let (mut free, mut store) = layer();
        assert_eq!(free.reserve(&mut store, 10).unwrap(), 0);
        assert_eq!(free.reserve(&mut store, 5).unwrap(), 10);
        assert_eq!(store.eof(), 15);
    }

    #[test]
    fn test_reserve_reuses_hole_first_fit() {
        let (mut free, mut store) = layer();
        free.reserve(&mut store, 100).unwrap();
        free.release(ContainerId(1), 20, 30);

        assert_eq!(free.reserve(&mut store, 10).unwrap(), 20);
        assert_eq!(free.free_bytes(), 20);
        assert_eq!(free.reserve(&mut store, 20).unwrap(), 30);
        assert_eq!(free.hole_count(), 0);
        assert_eq!(store.eof(), 100);
    }

    #[test]
    fn test_release_coalesces_neighbours() {
        let (mut free, mut store) = layer();
        free.reserve(&mut store, 100).unwrap();
        free.release(ContainerId(1), 0, 10);
        free.release(ContainerId(1), 20, 10);
        assert_eq!(free.hole_count(), 2);
        free.release(ContainerId(1), 10, 10);
        assert_eq!(free.hole_count(), 1);
        assert_eq!(free.free_bytes(), 30);
    }

    #[test]
    fn test_release_ignores_other_layers() {
        let (mut free, _) = layer();
        free.release(ContainerId::TARGET, 0, 10);
        assert_eq!(free.free_bytes(), 0);
    }

    #[test]
    fn test_release_ignored_while_not_tracking() {
        let (mut free, mut store) = layer();
        free.reserve(&mut store, 10).unwrap();
        free.set_tracking(false);
        free.release(ContainerId(1), 0, 10);
        assert_eq!(free.free_bytes(), 0);
        free.set_tracking(true);
        free.release(ContainerId(1), 0, 10);
        assert_eq!(free.free_bytes(), 10);
    }
}
