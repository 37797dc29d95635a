//! Update instruction generation
//!
//! Runs in two passes over the touched chain:
//!
//! 1. Every live object with value entries gets an instruction stream in its
//!    updates property: one `NewProperty`/`NewType` header per entry
//!    followed by that value's operations.
//! 2. Deleted objects and deleted properties go to the single delete-list
//!    stream on the control object.
//!
//! Deletions are kept apart so that replay can resolve every move out of
//! an object before the object disappears.

use crate::container::Container;
use crate::image::base_type_ids;
use crate::touch::{TouchEntry, TouchFlags, TouchId};
use bento_core::{
    ContainerId, Error, ErrorCode, ObjectId, PropertyId, Result, CONTROL_OBJECT_ID,
    DELETE_LIST_PROPERTY, IMMEDIATE_CAPACITY, UPDATES_PROPERTY, UPDATES_TYPE,
};
use bento_durability::{DataRef, FormatVersion, Instruction};
use bento_storage::{IoBuffer, Segment, SegmentData, ValueId};

const OP: &str = "generate_updates";

/// Write the touch records of the open session as instruction streams
///
/// Drains the touched chain. Any failure leaves the chain partially
/// consumed, so the session cannot be closed again.
pub(crate) fn generate_updates(container: &mut Container) -> Result<()> {
    container.require_session(OP)?;
    let mut buffer = match container.buffers.acquire() {
        Some(buffer) => buffer,
        None => return Err(container.raise(ErrorCode::NoBuffer, &["container"])),
    };
    let format = container.config.format;

    let mut streams = 0usize;
    let mut instructions = 0usize;
    for object in container.touches.touched_objects() {
        if let Some(written) = encode_object(container, object, &mut buffer, format)? {
            streams += 1;
            instructions += written;
        }
    }
    let deletions = encode_deletions(container, &mut buffer, format)?;

    tracing::info!(
        target: "bento::update",
        streams,
        instructions,
        deletions,
        "Generated updates"
    );
    Ok(())
}

/// Order within one object's stream
///
/// Values leaving an address go first so that values arriving there never
/// collide with them on replay.
fn rank(flags: TouchFlags) -> u8 {
    if flags.intersects(TouchFlags::REMOVED | TouchFlags::DELETED_VALUE) {
        0
    } else if flags.contains(TouchFlags::NEW_VALUE) {
        3
    } else if flags.contains(TouchFlags::INSERTED) {
        2
    } else {
        1
    }
}

fn encode_object(
    container: &mut Container,
    object: ObjectId,
    buffer: &mut IoBuffer,
    format: FormatVersion,
) -> Result<Option<usize>> {
    let deleted = match container.graph.object(object) {
        Some(o) => o.deleted,
        None => {
            return Err(Error::Corruption(format!(
                "touched object {} is not in the graph",
                object
            )))
        }
    };
    if deleted {
        return Ok(None);
    }

    let mut entries: Vec<(TouchId, TouchEntry)> = Vec::new();
    for id in container.touches.entries_of(object) {
        let entry = entry_of(container, id)?;
        if entry.is_value_entry() {
            entries.push((id, entry));
        }
    }
    if entries.is_empty() {
        return Ok(None);
    }
    entries.sort_by_key(|(_, entry)| rank(entry.flags));

    let updating = container.require_session(OP)?;
    let mut stream = StreamWriter::open(container, object, UPDATES_PROPERTY, format, buffer)?;
    let mut current: Option<PropertyId> = None;
    for (id, entry) in &entries {
        for instruction in entry_instructions(container, entry, &mut current, updating)? {
            stream.emit(container, buffer, &instruction)?;
        }
        container.touches.free_entry(*id);
    }
    let written = stream.finish(container, buffer)?;
    container.touches.release_if_empty(object);

    tracing::debug!(
        target: "bento::update",
        %object,
        entries = entries.len(),
        instructions = written,
        "Wrote value stream"
    );
    Ok(Some(written))
}

fn encode_deletions(
    container: &mut Container,
    buffer: &mut IoBuffer,
    format: FormatVersion,
) -> Result<usize> {
    let mut stream: Option<StreamWriter> = None;
    for object in container.touches.touched_objects() {
        let deleted = container
            .graph
            .object(object)
            .map(|o| o.deleted)
            .unwrap_or(false);

        let mut instructions = Vec::new();
        if deleted {
            instructions.push(Instruction::DeleteObject { object });
        } else {
            for id in container.touches.entries_of(object) {
                let entry = entry_of(container, id)?;
                if !entry.flags.contains(TouchFlags::DELETED_PROPERTY) {
                    continue;
                }
                let property = entry.opt.property;
                instructions.push(if instructions.is_empty() {
                    Instruction::DeleteProperty1 { object, property }
                } else {
                    Instruction::DeleteProperty2 { property }
                });
            }
        }
        container.touches.delete_touched_list(object);

        if !instructions.is_empty() && stream.is_none() {
            stream = Some(StreamWriter::open(
                container,
                CONTROL_OBJECT_ID,
                DELETE_LIST_PROPERTY,
                format,
                buffer,
            )?);
        }
        if let Some(writer) = stream.as_mut() {
            for instruction in &instructions {
                writer.emit(container, buffer, instruction)?;
            }
        }
    }

    match stream {
        Some(writer) => {
            let written = writer.finish(container, buffer)?;
            tracing::debug!(target: "bento::update", instructions = written, "Wrote delete list");
            Ok(written)
        }
        None => Ok(0),
    }
}

fn entry_of(container: &Container, id: TouchId) -> Result<TouchEntry> {
    container
        .touches
        .entry(id)
        .cloned()
        .ok_or_else(|| Error::Corruption(format!("touch entry {:?} is not live", id)))
}

/// Header and operations for one touch entry
///
/// Entries still at their original address are headed by that address;
/// inserted and new values by where they are now.
fn entry_instructions(
    container: &Container,
    entry: &TouchEntry,
    current: &mut Option<PropertyId>,
    updating: ContainerId,
) -> Result<Vec<Instruction>> {
    let flags = entry.flags;
    let header = entry.value.and_then(|v| container.graph.value(v));
    let (property, type_id) = if flags.intersects(TouchFlags::INSERTED | TouchFlags::NEW_VALUE) {
        let header = header.ok_or_else(|| missing_value(entry))?;
        (header.property, header.type_id)
    } else {
        (entry.opt.property, entry.opt.type_id)
    };

    let mut out = Vec::new();
    out.push(if *current == Some(property) {
        Instruction::NewType { type_id }
    } else {
        Instruction::NewProperty { property, type_id }
    });
    *current = Some(property);

    if flags.contains(TouchFlags::REMOVED) {
        out.push(Instruction::RemovedValue);
        return Ok(out);
    }
    if flags.contains(TouchFlags::DELETED_VALUE) {
        out.push(Instruction::DeleteValue);
        return Ok(out);
    }

    let header = header.ok_or_else(|| missing_value(entry))?;
    if flags.contains(TouchFlags::INSERTED) && !flags.contains(TouchFlags::NEW_VALUE) {
        out.push(Instruction::InsertedValue { from: entry.opt });
    }
    if flags.contains(TouchFlags::BASE_TYPE) {
        out.push(Instruction::ReplaceBaseType {
            types: base_type_ids(&header.segments).into_iter().collect(),
        });
    }
    if flags.contains(TouchFlags::SET_INFOED) {
        out.push(Instruction::SetInfoedValue {
            type_id: header.type_id,
            generation: header.generation,
        });
    }
    if flags.intersects(TouchFlags::IMMEDIATE | TouchFlags::EDITED) {
        if header.is_immediate() {
            if !entry.inline_origin && header.logical_size > 0 {
                out.push(Instruction::DeleteData {
                    offset: 0,
                    amount: header.logical_size,
                });
            }
            let bytes = header.segments[0].immediate_bytes().unwrap_or_default();
            let mut value = [0u8; IMMEDIATE_CAPACITY];
            value[..bytes.len()].copy_from_slice(bytes);
            out.push(Instruction::ReplaceImmediate {
                len: bytes.len() as u8,
                value,
            });
        } else {
            out.extend(diff_segments(
                &header.segments,
                header.logical_size,
                updating,
            )?);
        }
    }
    Ok(out)
}

fn missing_value(entry: &TouchEntry) -> Error {
    Error::Corruption(format!("touch entry for {} has no live value", entry.opt))
}

/// Diff a segment chain against its original layout
///
/// Walks the chain keeping `expected`, the logical offset the next old
/// byte should have, and `position`, the offset in the value as edited so
/// far; their difference is the net of inserted and deleted bytes. A run
/// of new segments becomes one insert, and a jump in logical offsets
/// becomes a delete emitted ahead of it. All new segments must live in the
/// `updating` layer.
pub fn diff_segments(
    segments: &[Segment],
    logical_size: u32,
    updating: ContainerId,
) -> Result<Vec<Instruction>> {
    let mut out = Vec::new();
    let mut expected = 0u32;
    let mut position = 0u32;
    let mut i = 0;

    while i < segments.len() {
        let segment = &segments[i];
        if segment.logical_offset == Some(expected) {
            expected += segment.len();
            position += segment.len();
            i += 1;
            continue;
        }

        let mut run: Vec<DataRef> = Vec::new();
        let mut run_len = 0u32;
        while let Some(segment) = segments.get(i).filter(|s| !s.is_old()) {
            match segment.data {
                _ if segment.is_empty() => {}
                SegmentData::Stored {
                    container,
                    offset,
                    len,
                } if container == updating => {
                    run.push(DataRef { offset, len });
                    run_len += len;
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "new segment {} of an edited value is not stored in {}",
                        i, updating
                    )))
                }
            }
            i += 1;
        }

        let next_old = segments
            .get(i)
            .and_then(|s| s.logical_offset)
            .unwrap_or(logical_size);
        if next_old < expected {
            return Err(Error::Corruption(format!(
                "old segment at logical offset {} displaced before {}",
                next_old, expected
            )));
        }
        if next_old > expected {
            out.push(Instruction::DeleteData {
                offset: position,
                amount: next_old - expected,
            });
            expected = next_old;
        }
        if let Some(insert) = Instruction::insert_data(position, &run) {
            out.push(insert);
            position += run_len;
        }
    }

    match expected.cmp(&logical_size) {
        std::cmp::Ordering::Less => out.push(Instruction::DeleteData {
            offset: position,
            amount: logical_size - expected,
        }),
        std::cmp::Ordering::Greater => {
            return Err(Error::Corruption(format!(
                "old segments run to {} past logical size {}",
                expected, logical_size
            )))
        }
        std::cmp::Ordering::Equal => {}
    }
    Ok(out)
}

/// An instruction stream being written into a value of the updating layer
///
/// Instructions collect in the session buffer, which is flushed into a new
/// segment whenever it fills.
struct StreamWriter {
    object: ObjectId,
    value: ValueId,
    format: FormatVersion,
    written: usize,
}

impl StreamWriter {
    fn open(
        container: &mut Container,
        object: ObjectId,
        property: PropertyId,
        format: FormatVersion,
        buffer: &mut IoBuffer,
    ) -> Result<Self> {
        let updating = container.require_session(OP)?;
        let value = container
            .graph
            .add_value(object, property, UPDATES_TYPE, 1, Vec::new(), updating)
            .map_err(|e| container.graph_error(e, OP))?;
        buffer.clear();
        Ok(StreamWriter {
            object,
            value,
            format,
            written: 0,
        })
    }

    fn emit(
        &mut self,
        container: &mut Container,
        buffer: &mut IoBuffer,
        instruction: &Instruction,
    ) -> Result<()> {
        if let Err(e) = instruction.encode(&mut **buffer, self.format) {
            return Err(container.raise(
                ErrorCode::UpdateWriteFailed,
                &[&self.object.to_string(), &e.to_string()],
            ));
        }
        self.written += 1;
        if buffer.is_full() {
            self.flush(container, buffer)?;
        }
        Ok(())
    }

    fn flush(&mut self, container: &mut Container, buffer: &mut IoBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let value = self.value;
        let bytes: &[u8] = buffer;
        container.edit(OP, |editor| {
            let segment = editor.write_data(bytes)?;
            editor.append_segment(value, segment)
        })?;
        tracing::trace!(target: "bento::update", object = %self.object, len = buffer.len(), "Flushed update buffer");
        buffer.clear();
        Ok(())
    }

    /// Terminate the stream and flush it
    ///
    /// Returns the number of instructions before the terminator.
    fn finish(mut self, container: &mut Container, buffer: &mut IoBuffer) -> Result<usize> {
        let written = self.written;
        self.emit(container, buffer, &Instruction::EndUpdates)?;
        self.flush(container, buffer)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::image::TargetBuilder;
    use bento_core::{Opt, TypeId};
    use bento_durability::decode_stream;

    const UPD: ContainerId = ContainerId(1);
    const P: PropertyId = PropertyId(0x50);
    const Q: PropertyId = PropertyId(0x51);
    const T: TypeId = TypeId(0x60);

    fn old(container: u16, offset: u32, len: u32, logical: u32) -> Segment {
        Segment::stored(ContainerId(container), offset, len).with_logical_offset(logical)
    }

    fn new(offset: u32, len: u32) -> Segment {
        Segment::stored(UPD, offset, len)
    }

    // ========================================================================
    // Segment diff
    // ========================================================================

    #[test]
    fn test_diff_untouched_chain_is_empty() {
        let segments = vec![old(0, 0, 40, 0), old(0, 40, 60, 40)];
        assert!(diff_segments(&segments, 100, UPD).unwrap().is_empty());
    }

    #[test]
    fn test_diff_delete_then_insert() {
        let segments = vec![old(0, 0, 30, 0), new(0, 10), old(0, 50, 50, 50)];
        let ops = diff_segments(&segments, 100, UPD).unwrap();
        assert_eq!(
            ops,
            vec![
                Instruction::DeleteData {
                    offset: 30,
                    amount: 20
                },
                Instruction::InsertData1 {
                    insert_point: 30,
                    data: DataRef { offset: 0, len: 10 }
                },
            ]
        );
    }

    #[test]
    fn test_diff_run_of_new_segments() {
        let segments = vec![old(0, 0, 10, 0), new(0, 5), new(100, 7), old(0, 10, 10, 10)];
        let ops = diff_segments(&segments, 20, UPD).unwrap();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            Instruction::InsertDataN { insert_point, data } => {
                assert_eq!(*insert_point, 10);
                assert_eq!(data.len(), 2);
                assert_eq!(data[1], DataRef { offset: 100, len: 7 });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_diff_positions_drift_after_insert() {
        let segments = vec![new(0, 5), old(0, 0, 10, 0), old(0, 15, 5, 15)];
        let ops = diff_segments(&segments, 20, UPD).unwrap();
        assert_eq!(
            ops,
            vec![
                Instruction::InsertData1 {
                    insert_point: 0,
                    data: DataRef { offset: 0, len: 5 }
                },
                Instruction::DeleteData {
                    offset: 15,
                    amount: 5
                },
            ]
        );
    }

    #[test]
    fn test_diff_tail_delete() {
        let segments = vec![old(0, 0, 40, 0)];
        let ops = diff_segments(&segments, 100, UPD).unwrap();
        assert_eq!(
            ops,
            vec![Instruction::DeleteData {
                offset: 40,
                amount: 60
            }]
        );
    }

    #[test]
    fn test_diff_all_new_replaces_everything() {
        let segments = vec![new(8, 6)];
        let ops = diff_segments(&segments, 3, UPD).unwrap();
        assert_eq!(
            ops,
            vec![
                Instruction::DeleteData {
                    offset: 0,
                    amount: 3
                },
                Instruction::InsertData1 {
                    insert_point: 0,
                    data: DataRef { offset: 8, len: 6 }
                },
            ]
        );
    }

    #[test]
    fn test_diff_skips_empty_new_segments() {
        let segments = vec![old(0, 0, 10, 0), Segment::null_immediate()];
        assert!(diff_segments(&segments, 10, UPD).unwrap().is_empty());
    }

    #[test]
    fn test_diff_rejects_foreign_new_segment() {
        let segments = vec![Segment::stored(ContainerId(0), 0, 4)];
        assert!(matches!(
            diff_segments(&segments, 0, UPD),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_diff_rejects_displaced_segment() {
        let segments = vec![old(0, 20, 10, 20), new(0, 3), old(0, 0, 10, 0)];
        assert!(matches!(
            diff_segments(&segments, 30, UPD),
            Err(Error::Corruption(_))
        ));
    }

    // ========================================================================
    // Stream generation
    // ========================================================================

    struct Session {
        container: Container,
        x: ObjectId,
        y: ObjectId,
    }

    fn session() -> Session {
        let mut builder = TargetBuilder::new();
        let x = builder.object();
        let y = builder.object();
        builder.value(x, P, T, b"abc").unwrap();
        builder
            .segmented_value(x, Q, T, &[&[1u8; 40], &[2u8; 60]])
            .unwrap();
        builder.value(y, P, T, b"yy").unwrap();
        let container =
            Container::open_for_update(builder.build(), ContainerConfig::for_testing()).unwrap();
        Session { container, x, y }
    }

    fn stream_of(container: &Container, object: ObjectId, property: PropertyId) -> Vec<Instruction> {
        let value = container.value(object, property, UPDATES_TYPE).unwrap();
        let bytes = container.read_value(value).unwrap();
        decode_stream(&bytes, container.config().format).unwrap()
    }

    #[test]
    fn test_immediate_edit_stream() {
        let mut s = session();
        let v = s.container.value(s.x, P, T).unwrap();
        s.container.write_value_data(v, 0, b"z").unwrap();
        generate_updates(&mut s.container).unwrap();

        let ops = stream_of(&s.container, s.x, UPDATES_PROPERTY);
        assert_eq!(
            ops,
            vec![
                Instruction::NewProperty {
                    property: P,
                    type_id: T
                },
                Instruction::ReplaceImmediate {
                    len: 3,
                    value: *b"zbc\0"
                },
            ]
        );
        assert!(s.container.touches().is_drained());
        assert_eq!(s.container.buffer_pool().outstanding(), 0);
    }

    #[test]
    fn test_concrete_edit_stream() {
        let mut s = session();
        let v = s.container.value(s.x, Q, T).unwrap();
        s.container.delete_value_data(v, 30, 20).unwrap();
        s.container.insert_value_data(v, 30, &[9u8; 10]).unwrap();
        generate_updates(&mut s.container).unwrap();

        let ops = stream_of(&s.container, s.x, UPDATES_PROPERTY);
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[1],
            Instruction::DeleteData {
                offset: 30,
                amount: 20
            }
        );
        assert!(matches!(
            ops[2],
            Instruction::InsertData1 {
                insert_point: 30,
                data: DataRef { len: 10, .. }
            }
        ));
    }

    #[test]
    fn test_move_stream_orders_removal_first() {
        let mut s = session();
        let v = s.container.value(s.x, P, T).unwrap();
        s.container.move_value(v, s.y, Q).unwrap();
        let w = s.container.value(s.y, P, T).unwrap();
        s.container.move_value(w, s.x, P).unwrap();
        generate_updates(&mut s.container).unwrap();

        let x_ops = stream_of(&s.container, s.x, UPDATES_PROPERTY);
        assert_eq!(x_ops[1], Instruction::RemovedValue);
        assert_eq!(
            x_ops[3],
            Instruction::InsertedValue {
                from: Opt::new(s.y, P, T)
            }
        );
        let y_ops = stream_of(&s.container, s.y, UPDATES_PROPERTY);
        assert!(y_ops.contains(&Instruction::InsertedValue {
            from: Opt::new(s.x, P, T)
        }));
    }

    #[test]
    fn test_deletions_go_to_delete_list() {
        let mut s = session();
        s.container.delete_property(s.x, P).unwrap();
        s.container.delete_property(s.x, Q).unwrap();
        s.container.delete_object(s.y).unwrap();
        generate_updates(&mut s.container).unwrap();

        assert!(s.container.value(s.x, UPDATES_PROPERTY, UPDATES_TYPE).is_none());
        let ops = stream_of(&s.container, CONTROL_OBJECT_ID, DELETE_LIST_PROPERTY);
        assert_eq!(
            ops,
            vec![
                Instruction::DeleteProperty1 {
                    object: s.x,
                    property: P
                },
                Instruction::DeleteProperty2 { property: Q },
                Instruction::DeleteObject { object: s.y },
            ]
        );
        assert!(s.container.touches().is_drained());
    }

    #[test]
    fn test_long_stream_spans_flushes() {
        let mut s = session();
        for i in 0..40u32 {
            let o = s.x;
            s.container
                .add_value(o, PropertyId(0x100 + i), T, &[i as u8; 8])
                .unwrap();
        }
        generate_updates(&mut s.container).unwrap();
        let stream = s.container.value(s.x, UPDATES_PROPERTY, UPDATES_TYPE).unwrap();
        let header = s.container.value_header(stream).unwrap();
        assert!(header.size as usize > s.container.config().io_buffer_size);
        let ops = stream_of(&s.container, s.x, UPDATES_PROPERTY);
        assert_eq!(ops.len(), 40 * 3);
    }

    #[test]
    fn test_no_buffer_reported() {
        let mut s = session();
        let v = s.container.value(s.x, P, T).unwrap();
        s.container.write_value_data(v, 0, b"z").unwrap();
        let pool = s.container.buffer_pool().clone();
        let held: Vec<_> = std::iter::from_fn(|| pool.acquire()).collect();
        let err = generate_updates(&mut s.container).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NoBuffer));
        drop(held);
        assert_eq!(pool.outstanding(), 0);
    }
}
