//! Update instruction replay
//!
//! Streams are decoded up front into groups, one per value header, and
//! then applied in phases:
//!
//! 1. Groups consisting of `DeleteValue` free their values.
//! 2. Values that will land elsewhere are detached: sources of
//!    `InsertedValue` and values whose type changes.
//! 3. Every other group runs in stream order; detached values are attached
//!    at the group's address first, and missing values are created.
//! 4. The delete list runs last, after the streams are dropped.
//!
//! Replay holds the container write-enabled with free-space recycling off
//! for its whole duration.

use crate::container::Container;
use crate::editor::SegmentReader;
use crate::guard::ModeGuard;
use crate::image::base_type_segments;
use bento_core::{
    Error, ErrorCode, ObjectId, Opt, PropertyId, Result, TypeId, BASE_TYPES_PROPERTY,
    CONTROL_OBJECT_ID, DELETE_LIST_PROPERTY, UPDATES_PROPERTY, UPDATES_TYPE,
};
use bento_durability::{DataRef, FormatVersion, Instruction, InstructionReader, LogError, Opcode};
use bento_storage::{IoBuffer, Segment, ValueId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::io::{self, Read};

const OP: &str = "apply_updates";

/// Operations on one value, under one header
#[derive(Debug)]
struct Group {
    object: ObjectId,
    property: PropertyId,
    type_id: TypeId,
    ops: Vec<Instruction>,
}

impl Group {
    fn opt(&self) -> Opt {
        Opt::new(self.object, self.property, self.type_id)
    }

    fn is_delete(&self) -> bool {
        matches!(self.ops.first(), Some(Instruction::DeleteValue))
    }

    fn is_removal(&self) -> bool {
        matches!(self.ops.first(), Some(Instruction::RemovedValue))
    }

    fn inserted_from(&self) -> Option<Opt> {
        match self.ops.first() {
            Some(Instruction::InsertedValue { from }) => Some(*from),
            _ => None,
        }
    }

    /// Type the value carries once the group has run
    fn landing_type(&self) -> TypeId {
        self.ops
            .iter()
            .rev()
            .find_map(|op| match op {
                Instruction::SetInfoedValue { type_id, .. } => Some(*type_id),
                _ => None,
            })
            .unwrap_or(self.type_id)
    }
}

/// Replay every update stream found in the container
pub(crate) fn apply_updates(container: &mut Container, format: FormatVersion) -> Result<()> {
    let mut guard = ModeGuard::enter(container);
    let container = &mut *guard;
    let mut buffer = match container.buffers.acquire() {
        Some(buffer) => buffer,
        None => return Err(container.raise(ErrorCode::NoBuffer, &["container"])),
    };

    let mut streams: Vec<(ObjectId, ValueId)> = Vec::new();
    for object in container.graph.objects().filter(|o| !o.deleted) {
        if let Some(value) = container
            .graph
            .value_by_type(object.id, UPDATES_PROPERTY, UPDATES_TYPE)
        {
            streams.push((object.id, value));
        }
    }
    let delete_list =
        container
            .graph
            .value_by_type(CONTROL_OBJECT_ID, DELETE_LIST_PROPERTY, UPDATES_TYPE);

    let mut groups = Vec::new();
    for (object, value) in &streams {
        let instructions = read_stream(container, *object, *value, &mut buffer, format)?;
        groups.extend(group_instructions(container, *object, instructions)?);
    }
    let deletions = match delete_list {
        Some(value) => {
            let instructions =
                read_stream(container, CONTROL_OBJECT_ID, value, &mut buffer, format)?;
            for instruction in &instructions {
                if !instruction.opcode().is_structural() {
                    return Err(bad_control(container, instruction.opcode(), CONTROL_OBJECT_ID));
                }
            }
            instructions
        }
        None => Vec::new(),
    };
    drop(buffer);

    let replayed = replay_groups(container, &groups)?;

    for value in streams.iter().map(|(_, v)| *v).chain(delete_list) {
        container
            .graph
            .remove_value(value)
            .map_err(|e| container.graph_error(e, OP))?;
    }
    replay_deletions(container, &deletions)?;

    for value in &replayed {
        if let Some(header) = container.graph.value_mut(*value) {
            header.relogicalize();
        }
    }
    tracing::info!(
        target: "bento::update",
        streams = streams.len(),
        groups = groups.len(),
        deletions = deletions.len(),
        values = replayed.len(),
        "Applied updates"
    );
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Byte source over a stream value, refilled through the session buffer
struct StreamSource<'a> {
    reader: SegmentReader<'a>,
    value: ValueId,
    size: u32,
    pos: u32,
    buffer: &'a mut IoBuffer,
    cursor: usize,
}

impl Read for StreamSource<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.cursor == self.buffer.len() {
            let len = (self.size - self.pos).min(self.buffer.limit() as u32);
            if len == 0 {
                return Ok(0);
            }
            let bytes = self
                .reader
                .read(self.value, self.pos, len)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.buffer.clear();
            self.buffer.extend_from_slice(&bytes);
            self.pos += len;
            self.cursor = 0;
        }
        let n = out.len().min(self.buffer.len() - self.cursor);
        out[..n].copy_from_slice(&self.buffer[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}

fn read_stream(
    container: &Container,
    object: ObjectId,
    value: ValueId,
    buffer: &mut IoBuffer,
    format: FormatVersion,
) -> Result<Vec<Instruction>> {
    let size = container
        .graph
        .require_value(value)
        .map_err(|e| container.graph_error(e, OP))?
        .size;
    buffer.clear();
    let source = StreamSource {
        reader: container.reader(),
        value,
        size,
        pos: 0,
        buffer,
        cursor: 0,
    };
    let mut reader = InstructionReader::new(source, format);
    let mut out = Vec::new();
    loop {
        match reader.next_instruction() {
            Ok(Some(instruction)) => out.push(instruction),
            Ok(None) => break,
            Err(LogError::UnknownOpcode(byte)) => {
                return Err(container.raise(
                    ErrorCode::BadUpdateControl,
                    &[&format!("0x{:02x}", byte), &object.to_string(), "container"],
                ))
            }
            Err(e) => {
                return Err(container.raise(
                    ErrorCode::UpdateReadFailed,
                    &[&object.to_string(), &e.to_string()],
                ))
            }
        }
    }
    tracing::debug!(target: "bento::update", %object, instructions = out.len(), "Read update stream");
    Ok(out)
}

fn bad_control(container: &Container, opcode: Opcode, object: ObjectId) -> Error {
    container.raise(
        ErrorCode::BadUpdateControl,
        &[
            &format!("0x{:02x}", opcode.to_byte()),
            &object.to_string(),
            "container",
        ],
    )
}

/// Split a value stream at its headers
fn group_instructions(
    container: &Container,
    object: ObjectId,
    instructions: Vec<Instruction>,
) -> Result<Vec<Group>> {
    let mut groups: Vec<Group> = Vec::new();
    for instruction in instructions {
        match instruction {
            Instruction::NewProperty { property, type_id } => groups.push(Group {
                object,
                property,
                type_id,
                ops: Vec::new(),
            }),
            Instruction::NewType { type_id } => {
                let property = match groups.last() {
                    Some(group) => group.property,
                    None => return Err(bad_control(container, Opcode::NewType, object)),
                };
                groups.push(Group {
                    object,
                    property,
                    type_id,
                    ops: Vec::new(),
                });
            }
            op if op.opcode().is_structural() => {
                return Err(bad_control(container, op.opcode(), object))
            }
            op => match groups.last_mut() {
                Some(group) => group.ops.push(op),
                None => return Err(bad_control(container, op.opcode(), object)),
            },
        }
    }

    for group in &groups {
        for (index, op) in group.ops.iter().enumerate() {
            let misplaced = match op {
                Instruction::DeleteValue | Instruction::RemovedValue => group.ops.len() != 1,
                Instruction::InsertedValue { .. } => index != 0,
                _ => false,
            };
            if misplaced {
                return Err(bad_control(container, op.opcode(), object));
            }
        }
    }
    Ok(groups)
}

// ============================================================================
// Replay
// ============================================================================

/// Find the value at an address, reporting the first missing link
fn resolve(container: &Container, opt: Opt, op: &str) -> Result<ValueId> {
    let object = match container.graph.object(opt.object) {
        Some(object) if !object.deleted => object,
        _ => {
            return Err(container.raise(
                ErrorCode::MissingObject,
                &[&opt.object.to_string(), op, "container"],
            ))
        }
    };
    if object.property(opt.property).is_none() {
        return Err(container.raise(
            ErrorCode::MissingProperty,
            &[&opt.property.to_string(), &opt.object.to_string(), "container"],
        ));
    }
    container
        .graph
        .value_by_type(opt.object, opt.property, opt.type_id)
        .ok_or_else(|| {
            container.raise(
                ErrorCode::MissingType,
                &[
                    &opt.type_id.to_string(),
                    &opt.property.to_string(),
                    &opt.object.to_string(),
                ],
            )
        })
}

fn replay_groups(container: &mut Container, groups: &[Group]) -> Result<FxHashSet<ValueId>> {
    let mut replayed = FxHashSet::default();

    for group in groups.iter().filter(|g| g.is_delete()) {
        let value = resolve(container, group.opt(), "DeleteValue")?;
        container
            .graph
            .remove_value(value)
            .map_err(|e| container.graph_error(e, OP))?;
    }

    let mut limbo: FxHashMap<usize, ValueId> = FxHashMap::default();
    for (index, group) in groups.iter().enumerate() {
        if group.is_delete() || group.is_removal() {
            continue;
        }
        let source = match group.inserted_from() {
            Some(from) => Some(resolve(container, from, "InsertedValue")?),
            None if group.landing_type() != group.type_id => {
                Some(resolve(container, group.opt(), "SetInfoedValue")?)
            }
            None => None,
        };
        if let Some(value) = source {
            container
                .graph
                .detach_value(value)
                .map_err(|e| container.graph_error(e, OP))?;
            limbo.insert(index, value);
        }
    }

    for (index, group) in groups.iter().enumerate() {
        if group.is_delete() {
            continue;
        }
        if group.is_removal() {
            if container.graph.object(group.object).is_none() {
                return Err(container.raise(
                    ErrorCode::MissingObject,
                    &[&group.object.to_string(), "RemovedValue", "container"],
                ));
            }
            continue;
        }
        let value = match limbo.remove(&index) {
            Some(value) => land(container, group, value)?,
            None => match container
                .graph
                .value_by_type(group.object, group.property, group.type_id)
            {
                Some(value) => value,
                None => create(container, group)?,
            },
        };
        for op in &group.ops {
            replay_op(container, group, value, op)?;
        }
        replayed.insert(value);
    }
    Ok(replayed)
}

/// Attach a detached value at the group's address under its final type
fn land(container: &mut Container, group: &Group, value: ValueId) -> Result<ValueId> {
    if container.graph.object(group.object).map_or(true, |o| o.deleted) {
        return Err(container.raise(
            ErrorCode::MissingObject,
            &[&group.object.to_string(), "InsertedValue", "container"],
        ));
    }
    let header = container
        .graph
        .require_value_mut(value)
        .map_err(|e| Error::Corruption(e.to_string()))?;
    header.type_id = group.landing_type();
    container
        .graph
        .attach_value(value, group.object, group.property)
        .map_err(|e| container.graph_error(e, OP))?;
    tracing::trace!(target: "bento::update", ?value, to = %group.opt(), "Landed value");
    Ok(value)
}

/// Create the value a group describes but the target lacks
///
/// A group that starts by deleting data needs an existing value.
fn create(container: &mut Container, group: &Group) -> Result<ValueId> {
    if matches!(group.ops.first(), None | Some(Instruction::DeleteData { .. })) {
        return resolve(container, group.opt(), "DeleteData");
    }
    if container.graph.object(group.object).map_or(true, |o| o.deleted) {
        return Err(container.raise(
            ErrorCode::MissingObject,
            &[&group.object.to_string(), "update", "container"],
        ));
    }
    let owner = container.layers.top();
    container
        .graph
        .add_value(
            group.object,
            group.property,
            group.type_id,
            1,
            vec![Segment::null_immediate()],
            owner,
        )
        .map_err(|e| container.graph_error(e, OP))
}

fn replay_op(
    container: &mut Container,
    group: &Group,
    value: ValueId,
    op: &Instruction,
) -> Result<()> {
    let subject = format!("{:?}", value);
    match op {
        Instruction::InsertedValue { .. } => {}
        Instruction::SetInfoedValue {
            type_id,
            generation,
        } => {
            if *generation == 0 {
                return Err(container.raise(
                    ErrorCode::BadGeneration,
                    &["0", &subject, "container"],
                ));
            }
            container
                .graph
                .set_value_type(value, *type_id)
                .map_err(|e| container.graph_error(e, "SetInfoedValue"))?;
            if let Some(header) = container.graph.value_mut(value) {
                header.generation = *generation;
            }
        }
        Instruction::DeleteData { offset, amount } => {
            if *amount > 0 {
                let end = offset.saturating_add(*amount) - 1;
                container.edit("DeleteData", |editor| {
                    editor.delete_segment_range(value, *offset, end)
                })?;
            }
        }
        Instruction::InsertData1 { insert_point, data } => {
            insert_data(container, value, *insert_point, std::slice::from_ref(data))?;
        }
        Instruction::InsertDataN { insert_point, data } => {
            insert_data(container, value, *insert_point, data)?;
        }
        Instruction::ReplaceImmediate { len, value: bytes } => {
            let immediate = container
                .graph
                .value(value)
                .map(|h| h.is_immediate())
                .unwrap_or(false);
            if !immediate {
                return Err(container.raise(ErrorCode::NotImmediate, &[&subject, "container"]));
            }
            let len = (*len as usize).min(bytes.len());
            container.edit("ReplaceImmediate", |editor| {
                editor.rewrite_immediate(value, &bytes[..len])
            })?;
        }
        Instruction::ReplaceBaseType { types } => {
            if group.property != BASE_TYPES_PROPERTY {
                return Err(container.raise(ErrorCode::NotBaseType, &[&subject, "container"]));
            }
            let segments = base_type_segments(types);
            container.edit("ReplaceBaseType", |editor| {
                editor.replace_segments(value, segments)
            })?;
        }
        other => return Err(bad_control(container, other.opcode(), group.object)),
    }
    Ok(())
}

fn insert_data(
    container: &mut Container,
    value: ValueId,
    insert_point: u32,
    data: &[DataRef],
) -> Result<()> {
    let layer = container.layers.top();
    let size = container
        .graph
        .require_value(value)
        .map_err(|e| container.graph_error(e, OP))?
        .size;
    if insert_point > size {
        return Err(container.raise(
            ErrorCode::BadInsertOffset,
            &[
                &insert_point.to_string(),
                &size.to_string(),
                &format!("{:?}", value),
            ],
        ));
    }
    let mut at = insert_point;
    for range in data {
        if container.layers.read(layer, range.offset, range.len).is_err() {
            return Err(container.raise(
                ErrorCode::UpdateReadFailed,
                &[
                    &format!("{:?}", value),
                    &format!("data {}+{} outside {}", range.offset, range.len, layer),
                ],
            ));
        }
        let segment = Segment::stored(layer, range.offset, range.len);
        container.edit("InsertData", |editor| editor.insert_at(value, at, segment))?;
        at += range.len;
    }
    Ok(())
}

fn replay_deletions(container: &mut Container, deletions: &[Instruction]) -> Result<()> {
    let mut current: Option<ObjectId> = None;
    for instruction in deletions {
        let (object, property) = match instruction {
            Instruction::DeleteObject { object } => {
                container.graph.remove_object(*object).map_err(|_| {
                    container.raise(
                        ErrorCode::MissingObject,
                        &[&object.to_string(), "DeleteObject", "container"],
                    )
                })?;
                current = None;
                continue;
            }
            Instruction::DeleteProperty1 { object, property } => {
                current = Some(*object);
                (*object, *property)
            }
            Instruction::DeleteProperty2 { property } => match current {
                Some(object) => (object, *property),
                None => {
                    return Err(bad_control(
                        container,
                        Opcode::DeleteProperty2,
                        CONTROL_OBJECT_ID,
                    ))
                }
            },
            other => return Err(bad_control(container, other.opcode(), CONTROL_OBJECT_ID)),
        };
        if container.graph.object(object).is_none() {
            return Err(container.raise(
                ErrorCode::MissingObject,
                &[&object.to_string(), "DeleteProperty", "container"],
            ));
        }
        if container.graph.property(object, property).is_some() {
            container
                .graph
                .delete_property(object, property)
                .map_err(|e| container.graph_error(e, "DeleteProperty"))?;
        } else {
            tracing::trace!(target: "bento::update", %object, %property, "Deleted property already gone");
        }
    }
    Ok(())
}
