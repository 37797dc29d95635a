//! Persisted container images
//!
//! - [`Target`]: an immutable container state (object graph plus byte
//!   layers) that updating sessions open on top of
//! - [`TargetBuilder`]: builds a base target from scratch
//! - [`UpdateImage`]: what closing an updating session produces: the new
//!   layer's bytes, where its instruction streams live, and the objects the
//!   session created
//!
//! # Binary Format
//!
//! ```text
//! magic(4) + version(4, LE) + bincode payload + crc32(4, LE)
//! ```
//!
//! The CRC covers everything before it.

use bento_core::{
    ContainerId, Error, ObjectId, PropertyId, Result, TypeId, BASE_TYPES_PROPERTY,
};
use bento_durability::FormatVersion;
use bento_storage::{ByteStore, Layers, ObjectGraph, Segment, ValueId};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Magic bytes of a serialized target.
pub const TARGET_MAGIC: &[u8; 4] = b"BNTT";

/// Magic bytes of a serialized update image.
pub const UPDATE_IMAGE_MAGIC: &[u8; 4] = b"BNTU";

/// Current envelope version.
pub const IMAGE_VERSION: u32 = 1;

const ENVELOPE_OVERHEAD: usize = 12;

/// An immutable container state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub(crate) graph: ObjectGraph,
    pub(crate) layers: Layers,
}

impl Target {
    /// The object graph
    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    /// Number of byte layers, target included
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Serialize with magic, version and CRC
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        seal(TARGET_MAGIC, &bincode::serialize(self)?)
    }

    /// Deserialize, validating magic, version and CRC
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(unseal(TARGET_MAGIC, data)?)?)
    }

    /// Write to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)
    }

    /// Read from a file
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// Builds a single-layer target
///
/// Values of more than four bytes are appended to the target layer; smaller
/// ones are stored inline. Every value is logicalized when the target is
/// built.
#[derive(Debug, Default)]
pub struct TargetBuilder {
    graph: ObjectGraph,
    data: ByteStore,
}

impl TargetBuilder {
    /// Start an empty target holding only the control object
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object with the next free id
    pub fn object(&mut self) -> ObjectId {
        self.graph.create_object(false)
    }

    /// Add a value, stored inline when it fits
    pub fn value(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
        data: &[u8],
    ) -> Result<ValueId> {
        let segment = match Segment::immediate(data) {
            Some(segment) => segment,
            None => self.store(data)?,
        };
        self.add(object, property, type_id, vec![segment])
    }

    /// Add a value stored as one segment per chunk
    pub fn segmented_value(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
        chunks: &[&[u8]],
    ) -> Result<ValueId> {
        let segments = chunks
            .iter()
            .map(|chunk| self.store(chunk))
            .collect::<Result<Vec<_>>>()?;
        self.add(object, property, type_id, segments)
    }

    /// Add a value whose data is an interned global name
    pub fn global_name_value(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
        name: &str,
    ) -> Result<ValueId> {
        let id = self.graph.intern_name(name);
        let segment = Segment::global_name(id, name.len() as u32);
        self.add(object, property, type_id, vec![segment])
    }

    /// Add a base type array value
    pub fn base_types(
        &mut self,
        object: ObjectId,
        type_id: TypeId,
        types: &[TypeId],
    ) -> Result<ValueId> {
        self.add(object, BASE_TYPES_PROPERTY, type_id, base_type_segments(types))
    }

    /// Set the generation of a value
    pub fn generation(&mut self, value: ValueId, generation: u32) -> Result<()> {
        let header = self
            .graph
            .require_value_mut(value)
            .map_err(|e| Error::InvalidOperation(e.to_string()))?;
        header.generation = generation;
        Ok(())
    }

    /// Freeze into a target
    pub fn build(self) -> Target {
        let mut graph = self.graph;
        for id in graph.value_ids() {
            if let Some(header) = graph.value_mut(id) {
                header.relogicalize();
            }
        }
        let mut layers = Layers::new();
        if let Ok(base) = layers.get_mut(ContainerId::TARGET) {
            *base = self.data;
        }
        Target { graph, layers }
    }

    fn store(&mut self, data: &[u8]) -> Result<Segment> {
        let len = data.len() as u32;
        let offset = self
            .data
            .extend(len)
            .ok_or_else(|| Error::InvalidOperation("target layer is full".to_string()))?;
        self.data.write_at(offset, data);
        Ok(Segment::stored(ContainerId::TARGET, offset, len))
    }

    fn add(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
        segments: Vec<Segment>,
    ) -> Result<ValueId> {
        self.graph
            .add_value(object, property, type_id, 1, segments, ContainerId::TARGET)
            .map_err(|e| Error::InvalidOperation(e.to_string()))
    }
}

/// Segments of a base type array: one 4-byte big-endian immediate per type
pub(crate) fn base_type_segments(types: &[TypeId]) -> Vec<Segment> {
    let segments: Vec<Segment> = types
        .iter()
        .filter_map(|t| Segment::immediate(&t.get().to_be_bytes()))
        .collect();
    if segments.is_empty() {
        vec![Segment::null_immediate()]
    } else {
        segments
    }
}

/// Types held by the segments of a base type array
pub(crate) fn base_type_ids(segments: &[Segment]) -> Vec<TypeId> {
    segments
        .iter()
        .filter_map(Segment::immediate_bytes)
        .filter_map(|bytes| <[u8; 4]>::try_from(bytes).ok())
        .map(|bytes| TypeId(u32::from_be_bytes(bytes)))
        .collect()
}

/// A byte range in an update image's layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// Offset in the layer
    pub offset: u32,
    /// Length in bytes
    pub len: u32,
}

/// Location of one object's value-update stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStream {
    /// Object the stream belongs to
    pub object: ObjectId,
    /// Stream bytes, in order
    pub ranges: Vec<ByteRange>,
}

/// Snapshot of one value of a session-created object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSnapshot {
    /// Owning property
    pub property: PropertyId,
    /// Value type
    pub type_id: TypeId,
    /// Generation
    pub generation: u32,
    /// Segment chain
    pub segments: Vec<Segment>,
}

/// Snapshot of an object created during a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    /// Object id
    pub id: ObjectId,
    /// Values in property order
    pub values: Vec<ValueSnapshot>,
}

/// The result of closing an updating session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateImage {
    /// Layer id the image occupies when applied
    pub layer: ContainerId,
    /// Format the instruction streams were written in
    pub format: FormatVersion,
    /// The layer's bytes
    pub bytes: Vec<u8>,
    /// Value-update streams, one per touched object
    pub streams: Vec<UpdateStream>,
    /// Delete-list stream, empty if nothing was deleted
    pub delete_list: Vec<ByteRange>,
    /// Objects created during the session
    pub new_objects: Vec<ObjectSnapshot>,
}

impl UpdateImage {
    /// Serialize with magic, version and CRC
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        seal(UPDATE_IMAGE_MAGIC, &bincode::serialize(self)?)
    }

    /// Deserialize, validating magic, version and CRC
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(unseal(UPDATE_IMAGE_MAGIC, data)?)?)
    }

    /// Write to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)
    }

    /// Read from a file
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Total bytes of all instruction streams
    pub fn stream_bytes(&self) -> u64 {
        self.streams
            .iter()
            .flat_map(|s| s.ranges.iter())
            .chain(self.delete_list.iter())
            .map(|r| r.len as u64)
            .sum()
    }
}

fn seal(magic: &[u8; 4], payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(payload.len() + ENVELOPE_OVERHEAD);
    buf.extend_from_slice(magic);
    buf.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn unseal<'a>(magic: &[u8; 4], data: &'a [u8]) -> Result<&'a [u8]> {
    if data.len() < ENVELOPE_OVERHEAD {
        return Err(Error::Corruption(format!(
            "image too short: {} bytes",
            data.len()
        )));
    }
    if &data[0..4] != magic {
        return Err(Error::Corruption("invalid image magic".to_string()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&data[4..8]);
    let version = u32::from_le_bytes(version);
    if version != IMAGE_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported image version {}",
            version
        )));
    }
    let crc_offset = data.len() - 4;
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&data[crc_offset..]);
    let stored = u32::from_le_bytes(stored);
    let computed = crc32fast::hash(&data[..crc_offset]);
    if stored != computed {
        return Err(Error::Corruption(format!(
            "image checksum mismatch: stored {:08x}, computed {:08x}",
            stored, computed
        )));
    }
    Ok(&data[8..crc_offset])
}

/// Write-fsync-rename so a crash never leaves a torn file behind
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&temp_path, path)?;
    if let Some(parent) = path.parent() {
        if parent.exists() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}
