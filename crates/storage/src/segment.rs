//! Value segments
//!
//! A value's data is an ordered chain of segments. Each segment is either a
//! small inline ("immediate") value, a reference to an interned global name,
//! or a byte range stored in one of the container's layers.
//!
//! Segments that existed when the container was opened carry a logical
//! offset: the position of their first byte in the value's original layout.
//! Segments created during a session carry none. The update encoder diffs
//! old against new layout using exactly this distinction.

use bento_core::{ContainerId, IMMEDIATE_CAPACITY};
use serde::{Deserialize, Serialize};

/// Handle of an interned global name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameId(pub u32);

/// Where a segment's bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentData {
    /// Up to four bytes stored in the descriptor itself
    Immediate {
        /// Inline bytes, only the first `len` are meaningful
        bytes: [u8; IMMEDIATE_CAPACITY],
        /// Number of meaningful bytes
        len: u8,
    },

    /// Byte range of an interned global name
    GlobalName {
        /// Interned name
        name: NameId,
        /// First byte of the name covered by this segment
        start: u32,
        /// Number of bytes
        len: u32,
    },

    /// Byte range in a container layer
    Stored {
        /// Layer holding the bytes
        container: ContainerId,
        /// Offset of the first byte
        offset: u32,
        /// Number of bytes
        len: u32,
    },
}

/// One piece of a value's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Data location
    pub data: SegmentData,
    /// Original position of this segment's first byte, `None` for new data
    pub logical_offset: Option<u32>,
}

impl Segment {
    /// Create a new (session) immediate segment
    ///
    /// Returns `None` if `data` does not fit inline.
    pub fn immediate(data: &[u8]) -> Option<Self> {
        if data.len() > IMMEDIATE_CAPACITY {
            return None;
        }
        let mut bytes = [0u8; IMMEDIATE_CAPACITY];
        bytes[..data.len()].copy_from_slice(data);
        Some(Segment {
            data: SegmentData::Immediate {
                bytes,
                len: data.len() as u8,
            },
            logical_offset: None,
        })
    }

    /// The empty immediate a value degrades to when all its data is deleted
    pub fn null_immediate() -> Self {
        Segment {
            data: SegmentData::Immediate {
                bytes: [0u8; IMMEDIATE_CAPACITY],
                len: 0,
            },
            logical_offset: None,
        }
    }

    /// Create a new (session) stored segment
    pub fn stored(container: ContainerId, offset: u32, len: u32) -> Self {
        Segment {
            data: SegmentData::Stored {
                container,
                offset,
                len,
            },
            logical_offset: None,
        }
    }

    /// Create a new (session) segment covering a whole global name
    pub fn global_name(name: NameId, len: u32) -> Self {
        Segment {
            data: SegmentData::GlobalName {
                name,
                start: 0,
                len,
            },
            logical_offset: None,
        }
    }

    /// Attach a logical offset
    pub fn with_logical_offset(mut self, logical_offset: u32) -> Self {
        self.logical_offset = Some(logical_offset);
        self
    }

    /// Length of the segment in bytes
    pub fn len(&self) -> u32 {
        match &self.data {
            SegmentData::Immediate { len, .. } => *len as u32,
            SegmentData::GlobalName { len, .. } => *len,
            SegmentData::Stored { len, .. } => *len,
        }
    }

    /// Whether the segment holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the segment existed when the container was opened
    pub fn is_old(&self) -> bool {
        self.logical_offset.is_some()
    }

    /// Whether the segment is an inline immediate
    pub fn is_immediate(&self) -> bool {
        matches!(self.data, SegmentData::Immediate { .. })
    }

    /// Inline bytes of an immediate segment
    pub fn immediate_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            SegmentData::Immediate { bytes, len } => Some(&bytes[..*len as usize]),
            _ => None,
        }
    }

    /// Layer holding a stored segment's bytes
    pub fn container(&self) -> Option<ContainerId> {
        match self.data {
            SegmentData::Stored { container, .. } => Some(container),
            _ => None,
        }
    }

    /// Shorten the segment to `new_len` bytes, keeping its start
    pub fn truncate(&mut self, new_len: u32) {
        match &mut self.data {
            SegmentData::Immediate { bytes, len } => {
                let keep = (new_len as usize).min(*len as usize);
                for b in bytes.iter_mut().skip(keep) {
                    *b = 0;
                }
                *len = keep as u8;
            }
            SegmentData::GlobalName { len, .. } => *len = new_len.min(*len),
            SegmentData::Stored { len, .. } => *len = new_len.min(*len),
        }
    }

    /// Drop the first `amount` bytes of the segment
    ///
    /// Old segments advance their logical offset by the same amount, since
    /// the bytes that remain keep their original positions.
    pub fn advance(&mut self, amount: u32) {
        let amount = amount.min(self.len());
        match &mut self.data {
            SegmentData::Immediate { bytes, len } => {
                let n = amount as usize;
                bytes.copy_within(n..*len as usize, 0);
                *len -= n as u8;
                for b in bytes.iter_mut().skip(*len as usize) {
                    *b = 0;
                }
            }
            SegmentData::GlobalName { start, len, .. } => {
                *start += amount;
                *len -= amount;
            }
            SegmentData::Stored { offset, len, .. } => {
                *offset += amount;
                *len -= amount;
            }
        }
        if let Some(logical) = self.logical_offset.as_mut() {
            *logical += amount;
        }
    }

    /// Split at `at`, leaving `[0, at)` here and returning `[at, len)`
    ///
    /// The right piece keeps the container tag (or name) and, for old
    /// segments, the logical offset of its first byte. Splitting at either
    /// edge returns `None` and leaves the segment unchanged.
    pub fn split_off(&mut self, at: u32) -> Option<Segment> {
        match self.data {
            SegmentData::Stored {
                container,
                offset,
                len,
            } if at > 0 && at < len => {
                let right = Segment {
                    data: SegmentData::Stored {
                        container,
                        offset: offset + at,
                        len: len - at,
                    },
                    logical_offset: self.logical_offset.map(|l| l + at),
                };
                self.truncate(at);
                Some(right)
            }
            SegmentData::GlobalName { name, start, len } if at > 0 && at < len => {
                let right = Segment {
                    data: SegmentData::GlobalName {
                        name,
                        start: start + at,
                        len: len - at,
                    },
                    logical_offset: self.logical_offset.map(|l| l + at),
                };
                self.truncate(at);
                Some(right)
            }
            SegmentData::Immediate { bytes, len } if at > 0 && (at as usize) < len as usize => {
                let mut right = Segment::immediate(&bytes[at as usize..len as usize])?;
                right.logical_offset = self.logical_offset.map(|l| l + at);
                self.truncate(at);
                Some(right)
            }
            _ => None,
        }
    }
}
