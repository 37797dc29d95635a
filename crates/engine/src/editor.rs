//! Value segment editor
//!
//! Byte-level operations on a value's segment chain. The editor borrows the
//! parts of a container it needs for one operation: the object graph, the
//! byte layers and the free-space allocator of the updating layer.
//!
//! Old segments keep their logical offset through every edit: splitting an
//! old segment gives the right piece the logical offset of its first byte,
//! and trimming the front of one advances it. Data written by the editor
//! always lands in new segments. The update encoder relies on both.
//!
//! Every operation validates its arguments before it changes the chain, so
//! a failed call leaves the value as it was.

use bento_core::{ContainerId, ErrorCode, ObjectId, PropertyId};
use bento_storage::{
    FreeSpace, GraphError, LayerError, Layers, NameId, ObjectGraph, Segment, SegmentData, ValueId,
};
use thiserror::Error;

/// Position of a byte inside a segment chain
///
/// `index == segments.len()` denotes the end of the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPos {
    /// Segment index
    pub index: usize,
    /// Offset inside that segment
    pub within: u32,
}

/// Segment editing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    /// Graph lookup failed
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Byte layer access failed
    #[error(transparent)]
    Layer(#[from] LayerError),

    /// Byte range outside the value
    #[error("range {start}..{end} outside value {value:?} of size {size}")]
    OutOfRange {
        /// Value
        value: ValueId,
        /// First byte
        start: u32,
        /// One past the last byte
        end: u32,
        /// Value size
        size: u32,
    },

    /// Insert offset past the end of the value
    #[error("insert offset {offset} beyond end {size} of value {value:?}")]
    InsertOffset {
        /// Value
        value: ValueId,
        /// Requested offset
        offset: u32,
        /// Value size
        size: u32,
    },

    /// Operation needs an inline immediate
    #[error("value {0:?} is not an immediate")]
    NotImmediate(ValueId),

    /// Data too large for an inline immediate
    #[error("{0} bytes do not fit an immediate")]
    ImmediateOverflow(usize),

    /// Segment bytes cannot be changed in place
    #[error("segment {index} of value {value:?} is read-only")]
    ReadOnlySegment {
        /// Value
        value: ValueId,
        /// Segment index
        index: usize,
    },

    /// Global name segment refers to an unknown name
    #[error("global name {0:?} not found")]
    MissingName(NameId),
}

impl EditError {
    /// Reportable code of this error, `None` for internal inconsistencies
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            EditError::Graph(e) => graph_error_code(e),
            EditError::Layer(LayerError::MissingLayer(_)) => None,
            EditError::Layer(_) => Some(ErrorCode::UpdateWriteFailed),
            EditError::OutOfRange { .. } => Some(ErrorCode::BadOffset),
            EditError::InsertOffset { .. } => Some(ErrorCode::BadInsertOffset),
            EditError::NotImmediate(_) => Some(ErrorCode::NotImmediate),
            EditError::ImmediateOverflow(_) => None,
            EditError::ReadOnlySegment { .. } => Some(ErrorCode::NotWritable),
            EditError::MissingName(_) => None,
        }
    }

    /// String inserts matching the code's message template
    ///
    /// `context` names the operation or stream the error occurred in.
    pub fn inserts(&self, context: &str) -> Vec<String> {
        match self {
            EditError::Graph(e) => graph_error_inserts(e, context),
            EditError::Layer(e) => vec![context.to_string(), e.to_string()],
            EditError::OutOfRange {
                value,
                start,
                end,
                size,
            } => vec![
                start.to_string(),
                end.to_string(),
                format!("{:?}", value),
                size.to_string(),
            ],
            EditError::InsertOffset {
                value,
                offset,
                size,
            } => vec![offset.to_string(), size.to_string(), format!("{:?}", value)],
            EditError::NotImmediate(value) => vec![format!("{:?}", value), context.to_string()],
            EditError::ReadOnlySegment { value, index } => vec![
                format!("segment {} of {:?}", index, value),
                context.to_string(),
            ],
            EditError::ImmediateOverflow(_) | EditError::MissingName(_) => {
                vec![context.to_string()]
            }
        }
    }
}

/// Reportable code of a graph error, `None` for a stale handle or a
/// duplicate object id
pub fn graph_error_code(err: &GraphError) -> Option<ErrorCode> {
    match err {
        GraphError::MissingObject(_) => Some(ErrorCode::MissingObject),
        GraphError::MissingProperty { .. } => Some(ErrorCode::MissingProperty),
        GraphError::DuplicateType { .. } => Some(ErrorCode::DuplicateType),
        GraphError::MissingValue(_) | GraphError::DuplicateObject(_) => None,
    }
}

/// String inserts for a graph error's message template
pub fn graph_error_inserts(err: &GraphError, context: &str) -> Vec<String> {
    match err {
        GraphError::MissingObject(object) => {
            vec![object.to_string(), context.to_string(), "container".to_string()]
        }
        GraphError::MissingProperty { object, property } => {
            vec![property.to_string(), object.to_string(), context.to_string()]
        }
        GraphError::DuplicateType {
            property, type_id, ..
        } => vec![property.to_string(), type_id.to_string()],
        GraphError::MissingValue(value) => vec![format!("{:?}", value), context.to_string()],
        GraphError::DuplicateObject(object) => vec![object.to_string(), context.to_string()],
    }
}

/// Map a byte offset to a segment position
///
/// A single segment and the end of the value are answered directly.
/// Otherwise the chain is scanned from whichever end is nearer, adding
/// actual segment lengths; empty segments occupy no position. Returns
/// `None` if `offset > size`.
pub fn locate(segments: &[Segment], size: u32, offset: u32) -> Option<SegmentPos> {
    if offset > size {
        return None;
    }
    if offset == size {
        return Some(SegmentPos {
            index: segments.len(),
            within: 0,
        });
    }
    if segments.len() == 1 {
        return Some(SegmentPos {
            index: 0,
            within: offset,
        });
    }
    if offset <= size / 2 {
        let mut start = 0u32;
        for (index, segment) in segments.iter().enumerate() {
            let len = segment.len();
            if offset < start + len {
                return Some(SegmentPos {
                    index,
                    within: offset - start,
                });
            }
            start += len;
        }
    } else {
        let mut end = size;
        for (index, segment) in segments.iter().enumerate().rev() {
            let len = segment.len();
            let start = end.checked_sub(len)?;
            if len > 0 && offset >= start {
                return Some(SegmentPos {
                    index,
                    within: offset - start,
                });
            }
            end = start;
        }
    }
    None
}

/// Read-only view of a container's value data
#[derive(Clone, Copy)]
pub struct SegmentReader<'a> {
    graph: &'a ObjectGraph,
    layers: &'a Layers,
}

impl<'a> SegmentReader<'a> {
    /// Create a reader
    pub fn new(graph: &'a ObjectGraph, layers: &'a Layers) -> Self {
        SegmentReader { graph, layers }
    }

    /// Locate a byte offset of a value
    pub fn locate_segment(&self, value: ValueId, offset: u32) -> Result<SegmentPos, EditError> {
        let header = self.graph.require_value(value)?;
        locate(&header.segments, header.size, offset).ok_or(EditError::OutOfRange {
            value,
            start: offset,
            end: offset,
            size: header.size,
        })
    }

    /// Copy bytes of one segment starting at `within` into `out`
    ///
    /// Returns the number of bytes copied, limited by the room left in the
    /// segment.
    pub fn read_segment_data(
        &self,
        segment: &Segment,
        within: u32,
        out: &mut [u8],
    ) -> Result<usize, EditError> {
        let room = segment.len().saturating_sub(within) as usize;
        let count = room.min(out.len());
        if count == 0 {
            return Ok(0);
        }
        let start = within as usize;
        match &segment.data {
            SegmentData::Immediate { bytes, .. } => {
                out[..count].copy_from_slice(&bytes[start..start + count]);
            }
            SegmentData::GlobalName { name, start: first, .. } => {
                let text = self.graph.name(*name).ok_or(EditError::MissingName(*name))?;
                let from = *first as usize + start;
                let src = text
                    .as_bytes()
                    .get(from..from + count)
                    .ok_or(EditError::MissingName(*name))?;
                out[..count].copy_from_slice(src);
            }
            SegmentData::Stored {
                container, offset, ..
            } => {
                let src = self
                    .layers
                    .read(*container, offset + within, count as u32)?;
                out[..count].copy_from_slice(src);
            }
        }
        Ok(count)
    }

    /// Read `len` bytes of a value starting at `offset`
    pub fn read(&self, value: ValueId, offset: u32, len: u32) -> Result<Vec<u8>, EditError> {
        let header = self.graph.require_value(value)?;
        let end = offset.checked_add(len).filter(|end| *end <= header.size).ok_or(
            EditError::OutOfRange {
                value,
                start: offset,
                end: offset.saturating_add(len),
                size: header.size,
            },
        )?;
        let mut out = vec![0u8; len as usize];
        if len == 0 {
            return Ok(out);
        }
        let pos = self.locate_segment(value, offset)?;
        let mut filled = 0usize;
        let mut within = pos.within;
        for segment in &header.segments[pos.index..] {
            if filled as u32 >= end - offset {
                break;
            }
            filled += self.read_segment_data(segment, within, &mut out[filled..])?;
            within = 0;
        }
        Ok(out)
    }

    /// Read a whole value
    pub fn read_value(&self, value: ValueId) -> Result<Vec<u8>, EditError> {
        let size = self.graph.require_value(value)?.size;
        self.read(value, 0, size)
    }
}

/// Borrowed view of a container for segment edits
pub struct SegmentEditor<'a> {
    graph: &'a mut ObjectGraph,
    layers: &'a mut Layers,
    free_space: &'a mut FreeSpace,
    updating: ContainerId,
}

impl<'a> SegmentEditor<'a> {
    /// Create an editor writing new data to the `updating` layer
    pub fn new(
        graph: &'a mut ObjectGraph,
        layers: &'a mut Layers,
        free_space: &'a mut FreeSpace,
        updating: ContainerId,
    ) -> Self {
        SegmentEditor {
            graph,
            layers,
            free_space,
            updating,
        }
    }

    /// Read-only view over the same data
    pub fn reader(&self) -> SegmentReader<'_> {
        SegmentReader::new(&*self.graph, &*self.layers)
    }

    /// Locate a byte offset of a value
    pub fn locate_segment(&self, value: ValueId, offset: u32) -> Result<SegmentPos, EditError> {
        self.reader().locate_segment(value, offset)
    }

    /// Read `len` bytes of a value starting at `offset`
    pub fn read(&self, value: ValueId, offset: u32, len: u32) -> Result<Vec<u8>, EditError> {
        self.reader().read(value, offset, len)
    }

    /// Read a whole value
    pub fn read_value(&self, value: ValueId) -> Result<Vec<u8>, EditError> {
        self.reader().read_value(value)
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Overwrite bytes of one segment in place
    ///
    /// Never changes the segment's length or position; `data` is cut to the
    /// room left after `within`. Only immediates and stored data of the
    /// updating layer can be overwritten. Returns the bytes written.
    pub fn overwrite_segment_data(
        &mut self,
        value: ValueId,
        index: usize,
        within: u32,
        data: &[u8],
    ) -> Result<u32, EditError> {
        let updating = self.updating;
        let header = self.graph.require_value_mut(value)?;
        let segment = header
            .segments
            .get_mut(index)
            .ok_or(EditError::OutOfRange {
                value,
                start: within,
                end: within,
                size: header.size,
            })?;
        let room = segment.len().saturating_sub(within) as usize;
        let count = room.min(data.len());
        if count == 0 {
            return Ok(0);
        }
        let start = within as usize;
        match &mut segment.data {
            SegmentData::Immediate { bytes, .. } => {
                bytes[start..start + count].copy_from_slice(&data[..count]);
                segment.logical_offset = None;
            }
            SegmentData::Stored {
                container, offset, ..
            } if *container == updating => {
                let at = *offset + within;
                self.layers.write(updating, at, &data[..count])?;
            }
            _ => return Err(EditError::ReadOnlySegment { value, index }),
        }
        Ok(count as u32)
    }

    /// Whether every byte of `[start, end)` lives in new data of the
    /// updating layer or in a sole immediate
    pub fn is_overwritable(&self, value: ValueId, start: u32, end: u32) -> Result<bool, EditError> {
        let header = self.graph.require_value(value)?;
        let mut seg_start = 0u32;
        for segment in &header.segments {
            let seg_end = seg_start + segment.len();
            if seg_end > start && seg_start < end {
                let ok = match segment.data {
                    SegmentData::Immediate { .. } => !header.is_continued(),
                    SegmentData::Stored { container, .. } => {
                        container == self.updating && !segment.is_old()
                    }
                    SegmentData::GlobalName { .. } => false,
                };
                if !ok {
                    return Ok(false);
                }
            }
            seg_start = seg_end;
        }
        Ok(true)
    }

    /// Overwrite `data` at `offset`, entirely inside the value
    ///
    /// The range must be overwritable; see [`Self::is_overwritable`].
    pub fn overwrite(&mut self, value: ValueId, offset: u32, data: &[u8]) -> Result<(), EditError> {
        let size = self.graph.require_value(value)?.size;
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        match offset.checked_add(len) {
            Some(end) if end <= size => {}
            _ => {
                return Err(EditError::OutOfRange {
                    value,
                    start: offset,
                    end: offset.saturating_add(len),
                    size,
                })
            }
        }
        if data.is_empty() {
            return Ok(());
        }
        let pos = self.locate_segment(value, offset)?;
        let mut index = pos.index;
        let mut within = pos.within;
        let mut done = 0usize;
        while done < data.len() {
            done += self.overwrite_segment_data(value, index, within, &data[done..])? as usize;
            index += 1;
            within = 0;
        }
        tracing::trace!(target: "bento::editor", ?value, offset, len = data.len(), "Overwrote in place");
        Ok(())
    }

    /// Write bytes to free space of the updating layer as a new segment
    pub fn write_data(&mut self, data: &[u8]) -> Result<Segment, EditError> {
        let len = u32::try_from(data.len())
            .map_err(|_| EditError::Layer(LayerError::Full(self.updating)))?;
        let store = self.layers.get_mut(self.updating)?;
        let offset = self.free_space.reserve(store, len)?;
        if !store.write_at(offset, data) {
            return Err(EditError::Layer(LayerError::OutOfRange {
                container: self.updating,
                offset,
                len,
                size: store.eof(),
            }));
        }
        Ok(Segment::stored(self.updating, offset, len))
    }

    /// Replace an inline immediate with `data`, which must fit inline
    pub fn rewrite_immediate(&mut self, value: ValueId, data: &[u8]) -> Result<(), EditError> {
        let segment = Segment::immediate(data).ok_or(EditError::ImmediateOverflow(data.len()))?;
        let header = self.graph.require_value_mut(value)?;
        if !header.is_immediate() {
            return Err(EditError::NotImmediate(value));
        }
        header.segments = vec![segment];
        header.size = data.len() as u32;
        Ok(())
    }

    /// Move an inline immediate's bytes out to the updating layer
    ///
    /// The value becomes one new stored segment owned by the updating
    /// layer. An empty immediate leaves the value with no segments.
    pub fn convert_immediate_to_stored(&mut self, value: ValueId) -> Result<(), EditError> {
        let bytes = {
            let header = self.graph.require_value(value)?;
            if !header.is_immediate() {
                return Err(EditError::NotImmediate(value));
            }
            header.segments[0]
                .immediate_bytes()
                .map(<[u8]>::to_vec)
                .unwrap_or_default()
        };
        let segments = if bytes.is_empty() {
            Vec::new()
        } else {
            vec![self.write_data(&bytes)?]
        };
        let updating = self.updating;
        let header = self.graph.require_value_mut(value)?;
        header.segments = segments;
        header.owner = updating;
        tracing::debug!(target: "bento::editor", ?value, len = bytes.len(), "Converted immediate to stored");
        Ok(())
    }

    /// Link an already written segment into a value at `pos`
    ///
    /// Inside a segment the segment is split first: the left piece keeps
    /// its start, the right piece is linked after the new segment with the
    /// same container and an advanced logical offset.
    pub fn insert_segment(
        &mut self,
        value: ValueId,
        pos: SegmentPos,
        segment: Segment,
    ) -> Result<(), EditError> {
        let header = self.graph.require_value_mut(value)?;
        let len = segment.len();
        let out_of_range = EditError::InsertOffset {
            value,
            offset: pos.within,
            size: header.size,
        };
        if pos.index > header.segments.len() {
            return Err(out_of_range);
        }
        if pos.within == 0 {
            header.segments.insert(pos.index, segment);
        } else {
            let target = header.segments.get_mut(pos.index).ok_or(out_of_range.clone())?;
            let right = target.split_off(pos.within).ok_or(out_of_range)?;
            header.segments.insert(pos.index + 1, right);
            header.segments.insert(pos.index + 1, segment);
            tracing::trace!(target: "bento::editor", ?value, index = pos.index, at = pos.within, "Split segment");
        }
        header.size += len;
        Ok(())
    }

    /// Insert a written segment at byte `offset` of a value
    ///
    /// An empty immediate is replaced by the segment instead of keeping a
    /// zero-length piece in front of it.
    pub fn insert_at(
        &mut self,
        value: ValueId,
        offset: u32,
        segment: Segment,
    ) -> Result<(), EditError> {
        let header = self.graph.require_value_mut(value)?;
        let size = header.size;
        if offset > size {
            return Err(EditError::InsertOffset {
                value,
                offset,
                size,
            });
        }
        if segment.is_empty() {
            return Ok(());
        }
        if size == 0 && header.is_immediate() {
            header.size = segment.len();
            header.segments = vec![segment];
            return Ok(());
        }
        let pos = self.locate_segment(value, offset)?;
        self.insert_segment(value, pos, segment)
    }

    /// Append a written segment to the end of a value
    ///
    /// A new stored segment that continues the value's last new segment in
    /// the same layer is merged into it.
    pub fn append_segment(&mut self, value: ValueId, segment: Segment) -> Result<(), EditError> {
        let header = self.graph.require_value_mut(value)?;
        let len = segment.len();
        let merged = match (header.segments.last_mut(), &segment.data) {
            (
                Some(Segment {
                    data:
                        SegmentData::Stored {
                            container,
                            offset,
                            len: last_len,
                        },
                    logical_offset: None,
                }),
                SegmentData::Stored {
                    container: next_container,
                    offset: next_offset,
                    ..
                },
            ) if segment.logical_offset.is_none()
                && *container == *next_container
                && *offset + *last_len == *next_offset =>
            {
                *last_len += len;
                true
            }
            _ => false,
        };
        if !merged {
            header.segments.push(segment);
        }
        header.size += len;
        Ok(())
    }

    /// Delete bytes `start..=end_inclusive` of a value
    ///
    /// Each segment in the range is removed whole, trimmed at its front,
    /// trimmed at its back, or split around an interior hole. Stored bytes
    /// that leave the value are returned to the free-space allocator. A
    /// value left without segments becomes an empty immediate.
    pub fn delete_segment_range(
        &mut self,
        value: ValueId,
        start: u32,
        end_inclusive: u32,
    ) -> Result<(), EditError> {
        let (first, last) = {
            let header = self.graph.require_value(value)?;
            if end_inclusive < start || end_inclusive >= header.size {
                return Err(EditError::OutOfRange {
                    value,
                    start,
                    end: end_inclusive.saturating_add(1),
                    size: header.size,
                });
            }
            let first = self.locate_segment(value, start)?;
            let last = self.locate_segment(value, end_inclusive)?;
            (first, last)
        };

        let header = self.graph.require_value_mut(value)?;
        let end = end_inclusive + 1;
        let mut released: Vec<(ContainerId, u32, u32)> = Vec::new();
        let mut kept: Vec<Segment> = Vec::with_capacity(header.segments.len() + 1);
        let mut seg_start = start - first.within;

        for (index, mut segment) in std::mem::take(&mut header.segments).into_iter().enumerate() {
            if index < first.index || index > last.index {
                kept.push(segment);
                continue;
            }
            let len = segment.len();
            let seg_end = seg_start + len;
            let a = start.max(seg_start) - seg_start;
            let b = end.min(seg_end) - seg_start;
            seg_start = seg_end;
            if a >= b {
                kept.push(segment);
                continue;
            }
            if let SegmentData::Stored {
                container, offset, ..
            } = segment.data
            {
                released.push((container, offset + a, b - a));
            }
            match (a == 0, b == len) {
                (true, true) => {}
                (true, false) => {
                    segment.advance(b);
                    kept.push(segment);
                }
                (false, true) => {
                    segment.truncate(a);
                    kept.push(segment);
                }
                (false, false) => {
                    let mut right = segment.split_off(a);
                    if let Some(right) = right.as_mut() {
                        right.advance(b - a);
                    }
                    kept.push(segment);
                    kept.extend(right);
                }
            }
        }

        if kept.is_empty() {
            kept.push(Segment::null_immediate());
        }
        header.segments = kept;
        header.size -= end - start;

        for (container, offset, len) in &released {
            self.free_space.release(*container, *offset, *len);
        }
        tracing::debug!(
            target: "bento::editor",
            ?value,
            start,
            end,
            released = released.len(),
            "Deleted segment range"
        );
        Ok(())
    }

    /// Replace a value's whole segment chain, releasing the old storage
    pub fn replace_segments(
        &mut self,
        value: ValueId,
        segments: Vec<Segment>,
    ) -> Result<(), EditError> {
        self.release_value_storage(value)?;
        let header = self.graph.require_value_mut(value)?;
        header.size = segments.iter().map(Segment::len).sum();
        header.segments = segments;
        Ok(())
    }

    /// Return every stored byte range of a value to the allocator
    pub fn release_value_storage(&mut self, value: ValueId) -> Result<(), EditError> {
        let header = self.graph.require_value(value)?;
        for segment in &header.segments {
            if let SegmentData::Stored {
                container,
                offset,
                len,
            } = segment.data
            {
                self.free_space.release(container, offset, len);
            }
        }
        Ok(())
    }

    /// Relink a value header under another property, keeping its handle
    ///
    /// A duplicate type at the destination is rejected before anything is
    /// unlinked. Moving onto the value's own property is a no-op.
    pub fn move_value_header(
        &mut self,
        value: ValueId,
        to_object: ObjectId,
        to_property: PropertyId,
    ) -> Result<ValueId, EditError> {
        self.graph.transplant_value(value, to_object, to_property)?;
        tracing::debug!(target: "bento::editor", ?value, to = %to_object, property = %to_property, "Moved value header");
        Ok(value)
    }
}
