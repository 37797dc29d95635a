//! Containers and updating sessions
//!
//! A [`Container`] is an in-memory working copy of a [`Target`]. Opened
//! with [`Container::open_for_update`], it pushes a fresh updating layer
//! and records every edit made through its API with the touch tracker.
//! [`Container::close`] turns those records into instruction streams and
//! returns them as an [`UpdateImage`]. Applying that image to the same
//! target reproduces the edited state.
//!
//! Every edit records its touch before it mutates anything, since the
//! tracker reads a value's original address and layout from its header.
//! Conditions with an [`ErrorCode`] are raised through the installed
//! [`ErrorReporter`] before they are returned.

use crate::config::ContainerConfig;
use crate::editor::{EditError, SegmentEditor, SegmentReader};
use crate::image::{
    base_type_ids, base_type_segments, ByteRange, ObjectSnapshot, Target, UpdateImage, UpdateStream,
    ValueSnapshot,
};
use crate::touch::{TouchError, TouchTracker};
use crate::updates::{apply_updates, generate_updates};
use bento_core::{
    is_update_log_property, raise, ContainerId, Error, ErrorCode, ErrorReporter, ObjectId, Opt,
    PropertyId, Result, TracingReporter, TypeId, BASE_TYPES_PROPERTY, CONTROL_OBJECT_ID,
    DELETE_LIST_PROPERTY, IMMEDIATE_CAPACITY, UPDATES_PROPERTY, UPDATES_TYPE,
};
use bento_durability::FormatVersion;
use bento_storage::{
    BufferPool, ByteStore, FreeSpace, GraphError, Layers, ObjectGraph, Segment, SegmentData,
    ValueHeader, ValueId,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Generation and bytes of one value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueContents {
    /// Generation number
    pub generation: u32,
    /// Value data
    pub data: Vec<u8>,
}

/// An open container
pub struct Container {
    pub(crate) graph: ObjectGraph,
    pub(crate) layers: Layers,
    pub(crate) free_space: FreeSpace,
    pub(crate) buffers: BufferPool,
    pub(crate) touches: TouchTracker,
    pub(crate) config: ContainerConfig,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
    pub(crate) updating: Option<ContainerId>,
    pub(crate) writable: bool,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("layers", &self.layers.len())
            .field("updating", &self.updating)
            .field("writable", &self.writable)
            .field("touch_entries", &self.touches.live_entries())
            .finish()
    }
}

impl Container {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open a target read-only
    pub fn open(target: Target, config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        let Target { graph, layers } = target;
        let mut free_space = FreeSpace::new(layers.top());
        free_space.set_tracking(false);
        Ok(Container {
            graph,
            layers,
            free_space,
            buffers: BufferPool::new(config.io_buffer_size, config.max_io_buffers),
            touches: TouchTracker::new(config.max_touch_entries),
            reporter: Arc::new(TracingReporter),
            updating: None,
            writable: false,
            config,
        })
    }

    /// Open a target and start an updating session on a new layer
    pub fn open_for_update(target: Target, config: ContainerConfig) -> Result<Self> {
        let mut container = Self::open(target, config)?;
        let updating = container.layers.push(ByteStore::new());
        container.free_space = FreeSpace::new(updating);
        container
            .free_space
            .set_tracking(container.config.track_free_space);
        container.touches.set_recording(true);
        container.graph.set_track_created(true);
        container.updating = Some(updating);
        container.writable = true;
        tracing::info!(target: "bento::session", layer = %updating, "Opened updating session");
        Ok(container)
    }

    /// Open a target and replay an update image on top of it
    pub fn open_with_updates(
        target: Target,
        image: &UpdateImage,
        config: ContainerConfig,
    ) -> Result<Self> {
        let mut container = Self::open(target, config)?;
        container.apply_image(image)?;
        Ok(container)
    }

    /// Install an error reporter
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Stack an update image on this container and replay its streams
    ///
    /// The image must have been produced by a session opened on a target
    /// with exactly this container's layers.
    pub fn apply_image(&mut self, image: &UpdateImage) -> Result<()> {
        if self.updating.is_some() {
            return Err(Error::InvalidOperation(
                "cannot apply an update image during an updating session".to_string(),
            ));
        }
        if image.layer.index() != self.layers.len() {
            return Err(Error::Corruption(format!(
                "update image for {} cannot stack on {} layers",
                image.layer,
                self.layers.len()
            )));
        }
        let layer = self.layers.push(ByteStore::from_bytes(image.bytes.clone()));
        self.free_space = FreeSpace::new(layer);
        self.free_space.set_tracking(false);

        for snapshot in &image.new_objects {
            self.restore_object(snapshot, layer)?;
        }
        for stream in &image.streams {
            self.attach_stream(stream.object, UPDATES_PROPERTY, &stream.ranges, layer)?;
        }
        if !image.delete_list.is_empty() {
            self.attach_stream(
                CONTROL_OBJECT_ID,
                DELETE_LIST_PROPERTY,
                &image.delete_list,
                layer,
            )?;
        }

        apply_updates(self, image.format)?;
        tracing::info!(
            target: "bento::session",
            layer = %layer,
            streams = image.streams.len(),
            new_objects = image.new_objects.len(),
            "Applied update image"
        );
        Ok(())
    }

    fn restore_object(&mut self, snapshot: &ObjectSnapshot, layer: ContainerId) -> Result<()> {
        self.graph
            .insert_object(snapshot.id, false)
            .map_err(|e| Error::Corruption(e.to_string()))?;
        for value in &snapshot.values {
            let id = self
                .graph
                .add_value(
                    snapshot.id,
                    value.property,
                    value.type_id,
                    value.generation,
                    value.segments.clone(),
                    layer,
                )
                .map_err(|e| Error::Corruption(e.to_string()))?;
            if let Some(header) = self.graph.value_mut(id) {
                header.relogicalize();
            }
        }
        Ok(())
    }

    fn attach_stream(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        ranges: &[ByteRange],
        layer: ContainerId,
    ) -> Result<()> {
        let store = self
            .layers
            .get(layer)
            .map_err(|e| Error::Corruption(e.to_string()))?;
        for range in ranges {
            if store.slice(range.offset, range.len).is_none() {
                let range = format!("{}+{}", range.offset, range.len);
                return Err(self.raise(
                    ErrorCode::UpdateReadFailed,
                    &[&object.to_string(), &format!("stream range {} outside {}", range, layer)],
                ));
            }
        }
        let segments = ranges
            .iter()
            .map(|r| Segment::stored(layer, r.offset, r.len))
            .collect();
        self.graph
            .add_value(object, property, UPDATES_TYPE, 1, segments, layer)
            .map_err(|e| self.graph_error(e, "update stream"))?;
        Ok(())
    }

    /// End the updating session and produce its update image
    ///
    /// Fails fatally if update generation fails; the container is consumed
    /// either way.
    pub fn close(mut self) -> Result<UpdateImage> {
        let updating = self.require_session("close")?;
        generate_updates(&mut self)?;
        if !self.touches.is_drained() {
            return Err(Error::Corruption(format!(
                "{} touch entries left after update generation",
                self.touches.live_entries()
            )));
        }
        self.touches.set_recording(false);

        let mut streams = Vec::new();
        let mut new_objects = Vec::new();
        for object in self.graph.objects() {
            if object.new {
                new_objects.push(self.snapshot(object.id)?);
                continue;
            }
            if let Some(stream) = self
                .graph
                .value_by_type(object.id, UPDATES_PROPERTY, UPDATES_TYPE)
            {
                streams.push(UpdateStream {
                    object: object.id,
                    ranges: self.stream_ranges(stream, updating)?,
                });
            }
        }
        let delete_list = match self.graph.value_by_type(
            CONTROL_OBJECT_ID,
            DELETE_LIST_PROPERTY,
            UPDATES_TYPE,
        ) {
            Some(stream) => self.stream_ranges(stream, updating)?,
            None => Vec::new(),
        };
        let bytes = self
            .layers
            .get(updating)
            .map_err(|e| Error::Corruption(e.to_string()))?
            .as_bytes()
            .to_vec();

        let image = UpdateImage {
            layer: updating,
            format: self.config.format,
            bytes,
            streams,
            delete_list,
            new_objects,
        };
        tracing::info!(
            target: "bento::session",
            layer = %updating,
            bytes = image.bytes.len(),
            stream_bytes = image.stream_bytes(),
            streams = image.streams.len(),
            new_objects = image.new_objects.len(),
            "Closed updating session"
        );
        Ok(image)
    }

    /// Drop the updating session without generating updates
    pub fn abandon(mut self) {
        let entries = self.touches.live_entries();
        self.touches.teardown();
        tracing::info!(target: "bento::session", entries, "Abandoned updating session");
    }

    /// Freeze the current state into a target
    ///
    /// Only allowed outside an updating session. Every value is
    /// logicalized, so the result can be opened for another session.
    pub fn into_target(self) -> Result<Target> {
        if self.updating.is_some() {
            return Err(Error::InvalidOperation(
                "close the updating session before freezing".to_string(),
            ));
        }
        let mut graph = self.graph;
        graph.clear_session_flags();
        graph.set_track_created(false);
        for id in graph.value_ids() {
            if let Some(header) = graph.value_mut(id) {
                header.relogicalize();
            }
        }
        Ok(Target {
            graph,
            layers: self.layers,
        })
    }

    fn snapshot(&self, object: ObjectId) -> Result<ObjectSnapshot> {
        let obj = self
            .graph
            .require_object(object)
            .map_err(|e| Error::Corruption(e.to_string()))?;
        let mut values = Vec::new();
        for property in &obj.properties {
            for id in &property.values {
                let header = self
                    .graph
                    .require_value(*id)
                    .map_err(|e| Error::Corruption(e.to_string()))?;
                values.push(ValueSnapshot {
                    property: property.id,
                    type_id: header.type_id,
                    generation: header.generation,
                    segments: header.segments.clone(),
                });
            }
        }
        Ok(ObjectSnapshot { id: object, values })
    }

    fn stream_ranges(&self, stream: ValueId, updating: ContainerId) -> Result<Vec<ByteRange>> {
        let header = self
            .graph
            .require_value(stream)
            .map_err(|e| Error::Corruption(e.to_string()))?;
        header
            .segments
            .iter()
            .map(|segment| match segment.data {
                SegmentData::Stored {
                    container,
                    offset,
                    len,
                } if container == updating => Ok(ByteRange { offset, len }),
                _ => Err(Error::Corruption(format!(
                    "update stream of {} has data outside {}",
                    header.object, updating
                ))),
            })
            .collect()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The object graph
    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    /// The touch tracker
    pub fn touches(&self) -> &TouchTracker {
        &self.touches
    }

    /// Active configuration
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Handle to the update-stream buffer pool
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffers
    }

    /// Whether edits may write to the top layer
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Layer of the active updating session
    pub fn updating_layer(&self) -> Option<ContainerId> {
        self.updating
    }

    /// Number of byte layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Bytes of one layer
    pub fn layer_bytes(&self, layer: ContainerId) -> Result<&[u8]> {
        self.layers
            .get(layer)
            .map(ByteStore::as_bytes)
            .map_err(|e| Error::InvalidOperation(e.to_string()))
    }

    /// Find the value of a type on a property
    pub fn value(&self, object: ObjectId, property: PropertyId, type_id: TypeId) -> Option<ValueId> {
        self.graph.value_by_type(object, property, type_id)
    }

    /// Header of a value
    pub fn value_header(&self, value: ValueId) -> Option<&ValueHeader> {
        self.graph.value(value)
    }

    /// Read a whole value
    pub fn read_value(&self, value: ValueId) -> Result<Vec<u8>> {
        SegmentReader::new(&self.graph, &self.layers)
            .read_value(value)
            .map_err(|e| self.edit_error(e, "read_value"))
    }

    /// Read the types of a base type array value
    pub fn base_types(&self, value: ValueId) -> Result<Vec<TypeId>> {
        let header = self.live_header(value, "base_types")?;
        if header.property != BASE_TYPES_PROPERTY {
            return Err(self.raise(
                ErrorCode::NotBaseType,
                &[&format!("{:?}", value), "base_types"],
            ));
        }
        Ok(base_type_ids(&header.segments))
    }

    /// Every live value keyed by address, excluding update-log streams
    pub fn contents(&self) -> Result<BTreeMap<Opt, ValueContents>> {
        let mut out = BTreeMap::new();
        for object in self.graph.objects().filter(|o| !o.deleted) {
            for property in &object.properties {
                if is_update_log_property(property.id) {
                    continue;
                }
                for id in &property.values {
                    let header = self.live_header(*id, "contents")?;
                    out.insert(
                        Opt::new(object.id, property.id, header.type_id),
                        ValueContents {
                            generation: header.generation,
                            data: self.read_value(*id)?,
                        },
                    );
                }
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Create an object; it is part of the next image, not of the target
    pub fn create_object(&mut self) -> Result<ObjectId> {
        self.require_session("create_object")?;
        let id = self.graph.create_object(true);
        tracing::debug!(target: "bento::session", object = %id, "Created object");
        Ok(id)
    }

    /// Delete an object with all its properties and values
    pub fn delete_object(&mut self, object: ObjectId) -> Result<()> {
        const OP: &str = "delete_object";
        self.require_session(OP)?;
        if object == CONTROL_OBJECT_ID {
            return Err(Error::InvalidOperation(
                "the control object cannot be deleted".to_string(),
            ));
        }
        self.check_live_object(object, OP)?;
        let (properties, segments) = self.object_contents(object)?;

        if self.graph.is_new_object(object) {
            self.graph
                .remove_object(object)
                .map_err(|e| self.graph_error(e, OP))?;
            self.release_segments(&segments);
            return Ok(());
        }

        for (property, values) in &properties {
            for value in values {
                self.touches
                    .touch_implicit_deleted_value(&self.graph, *value)
                    .map_err(|e| self.touch_error(e, OP))?;
            }
            self.touches
                .touch_deleted_property(&self.graph, object, *property)
                .map_err(|e| self.touch_error(e, OP))?;
        }
        self.touches
            .touch_deleted_object(&self.graph, object)
            .map_err(|e| self.touch_error(e, OP))?;
        self.graph
            .mark_object_deleted(object)
            .map_err(|e| self.graph_error(e, OP))?;
        self.release_segments(&segments);
        tracing::debug!(target: "bento::session", %object, "Deleted object");
        Ok(())
    }

    /// Delete a property with all its values
    pub fn delete_property(&mut self, object: ObjectId, property: PropertyId) -> Result<()> {
        const OP: &str = "delete_property";
        self.require_session(OP)?;
        self.check_stream_property(property, OP)?;
        self.check_live_object(object, OP)?;
        let (values, created) = match self.graph.property(object, property) {
            Some(p) => (p.values.clone(), p.created),
            None => {
                return Err(self.raise(
                    ErrorCode::MissingProperty,
                    &[&property.to_string(), &object.to_string(), OP],
                ))
            }
        };
        let segments = self.segments_of(&values);

        // A re-created property records no deletion of its own, so its
        // values are deleted one by one.
        for value in &values {
            let touched = if created {
                self.touches.touch_deleted_value(&self.graph, *value)
            } else {
                self.touches.touch_implicit_deleted_value(&self.graph, *value)
            };
            touched.map_err(|e| self.touch_error(e, OP))?;
        }
        self.touches
            .touch_deleted_property(&self.graph, object, property)
            .map_err(|e| self.touch_error(e, OP))?;
        self.graph
            .delete_property(object, property)
            .map_err(|e| self.graph_error(e, OP))?;
        self.release_segments(&segments);
        tracing::debug!(target: "bento::session", %object, %property, "Deleted property");
        Ok(())
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Add a value; up to four bytes are stored inline
    pub fn add_value(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
        data: &[u8],
    ) -> Result<ValueId> {
        const OP: &str = "add_value";
        let updating = self.require_session(OP)?;
        self.check_stream_property(property, OP)?;
        if property == BASE_TYPES_PROPERTY {
            return Err(Error::InvalidOperation(
                "base type arrays are written with set_base_types".to_string(),
            ));
        }
        self.check_live_object(object, OP)?;
        self.check_destination(object, property, type_id, None, OP)?;

        let segments = match Segment::immediate(data) {
            Some(segment) => vec![segment],
            None => vec![self.edit(OP, |editor| editor.write_data(data))?],
        };
        self.insert_new_value(object, property, type_id, segments, updating, OP)
    }

    /// Write `data` at `offset`, overwriting and extending the value
    ///
    /// An immediate that still fits is rewritten inline. Bytes written in
    /// this session are overwritten in place; a range touching older bytes
    /// is deleted and the data inserted as a new segment.
    pub fn write_value_data(&mut self, value: ValueId, offset: u32, data: &[u8]) -> Result<()> {
        const OP: &str = "write_value_data";
        self.require_session(OP)?;
        let (size, immediate) = self.data_value(value, OP)?;
        let end = offset.checked_add(data.len() as u32);
        let end = match end {
            Some(end) if offset <= size => end,
            _ => return Err(self.bad_offset(value, offset, data.len() as u32, size)),
        };
        if data.is_empty() {
            return Ok(());
        }
        let new_size = size.max(end);

        if immediate && new_size as usize <= IMMEDIATE_CAPACITY {
            let mut bytes = self.read_value(value)?;
            bytes.resize(new_size as usize, 0);
            bytes[offset as usize..end as usize].copy_from_slice(data);
            self.touches
                .touch_immediate(&self.graph, value)
                .map_err(|e| self.touch_error(e, OP))?;
            return self.edit(OP, |editor| editor.rewrite_immediate(value, &bytes));
        }

        self.touches
            .touch_edited(&self.graph, value)
            .map_err(|e| self.touch_error(e, OP))?;
        let overlap_end = end.min(size);
        self.edit(OP, |editor| {
            if immediate {
                editor.convert_immediate_to_stored(value)?;
            }
            if overlap_end > offset && editor.is_overwritable(value, offset, overlap_end)? {
                let split = (overlap_end - offset) as usize;
                editor.overwrite(value, offset, &data[..split])?;
                if split < data.len() {
                    let tail = editor.write_data(&data[split..])?;
                    editor.insert_at(value, overlap_end, tail)?;
                }
            } else {
                if overlap_end > offset {
                    editor.delete_segment_range(value, offset, overlap_end - 1)?;
                }
                let segment = editor.write_data(data)?;
                editor.insert_at(value, offset, segment)?;
            }
            Ok(())
        })
    }

    /// Insert `data` at `offset`, shifting later bytes
    pub fn insert_value_data(&mut self, value: ValueId, offset: u32, data: &[u8]) -> Result<()> {
        const OP: &str = "insert_value_data";
        self.require_session(OP)?;
        let (size, immediate) = self.data_value(value, OP)?;
        if offset > size {
            return Err(self.raise(
                ErrorCode::BadInsertOffset,
                &[&offset.to_string(), &size.to_string(), &format!("{:?}", value)],
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        let new_size = size as usize + data.len();

        if immediate && new_size <= IMMEDIATE_CAPACITY {
            let mut bytes = self.read_value(value)?;
            let at = offset as usize;
            bytes.splice(at..at, data.iter().copied());
            self.touches
                .touch_immediate(&self.graph, value)
                .map_err(|e| self.touch_error(e, OP))?;
            return self.edit(OP, |editor| editor.rewrite_immediate(value, &bytes));
        }

        self.touches
            .touch_edited(&self.graph, value)
            .map_err(|e| self.touch_error(e, OP))?;
        self.edit(OP, |editor| {
            if immediate {
                editor.convert_immediate_to_stored(value)?;
            }
            let segment = editor.write_data(data)?;
            editor.insert_at(value, offset, segment)
        })
    }

    /// Delete `len` bytes at `offset`
    pub fn delete_value_data(&mut self, value: ValueId, offset: u32, len: u32) -> Result<()> {
        const OP: &str = "delete_value_data";
        self.require_session(OP)?;
        let (size, immediate) = self.data_value(value, OP)?;
        let end = match offset.checked_add(len) {
            Some(end) if end <= size => end,
            _ => return Err(self.bad_offset(value, offset, len, size)),
        };
        if len == 0 {
            return Ok(());
        }

        if immediate {
            let mut bytes = self.read_value(value)?;
            bytes.drain(offset as usize..end as usize);
            self.touches
                .touch_immediate(&self.graph, value)
                .map_err(|e| self.touch_error(e, OP))?;
            return self.edit(OP, |editor| editor.rewrite_immediate(value, &bytes));
        }

        self.touches
            .touch_edited(&self.graph, value)
            .map_err(|e| self.touch_error(e, OP))?;
        self.edit(OP, |editor| {
            editor.delete_segment_range(value, offset, end - 1)
        })
    }

    /// Move a value to another property, keeping its handle
    ///
    /// A target value moved into an object created in this session leaves
    /// the target: its original address is recorded as deleted and the new
    /// object's snapshot carries it from then on. Values of created objects
    /// cannot move into target objects, and no value can move onto a
    /// property deleted in this session.
    pub fn move_value(
        &mut self,
        value: ValueId,
        to_object: ObjectId,
        to_property: PropertyId,
    ) -> Result<()> {
        const OP: &str = "move_value";
        self.require_session(OP)?;
        let (from_object, from_property, type_id) = {
            let header = self.live_header(value, OP)?;
            (header.object, header.property, header.type_id)
        };
        self.check_stream_property(from_property, OP)?;
        self.check_stream_property(to_property, OP)?;
        if (from_property == BASE_TYPES_PROPERTY) != (to_property == BASE_TYPES_PROPERTY) {
            return Err(Error::InvalidOperation(
                "base type arrays only move between base type properties".to_string(),
            ));
        }
        self.check_live_object(to_object, OP)?;
        let from_new = self.graph.is_new_object(from_object);
        let leaves_target = !from_new && self.graph.is_new_object(to_object);
        if from_new && !self.graph.is_new_object(to_object) {
            return Err(Error::InvalidOperation(format!(
                "cannot move a value of {}, created in this session, into target object {}",
                from_object, to_object
            )));
        }
        if from_object == to_object && from_property == to_property {
            return Ok(());
        }
        self.check_destination(to_object, to_property, type_id, Some(value), OP)?;

        let touched = if leaves_target {
            self.touches.touch_deleted_value(&self.graph, value)
        } else {
            self.touches
                .touch_moved(&self.graph, value, to_object, to_property)
        };
        touched.map_err(|e| self.touch_error(e, OP))?;
        self.edit(OP, |editor| {
            editor.move_value_header(value, to_object, to_property)
        })?;
        Ok(())
    }

    /// Delete a value
    pub fn delete_value(&mut self, value: ValueId) -> Result<()> {
        const OP: &str = "delete_value";
        self.require_session(OP)?;
        let property = self.live_header(value, OP)?.property;
        self.check_stream_property(property, OP)?;
        self.touches
            .touch_deleted_value(&self.graph, value)
            .map_err(|e| self.touch_error(e, OP))?;
        let header = self
            .graph
            .remove_value(value)
            .map_err(|e| self.graph_error(e, OP))?;
        self.release_segments(&header.segments);
        tracing::debug!(target: "bento::session", ?value, "Deleted value");
        Ok(())
    }

    /// Change a value's type and generation
    pub fn set_value_info(
        &mut self,
        value: ValueId,
        type_id: TypeId,
        generation: u32,
    ) -> Result<()> {
        const OP: &str = "set_value_info";
        self.require_session(OP)?;
        let (object, property, current) = {
            let header = self.live_header(value, OP)?;
            (header.object, header.property, header.type_id)
        };
        self.check_stream_property(property, OP)?;
        let legacy_overflow =
            self.config.format == FormatVersion::Legacy && generation > u16::MAX as u32;
        if generation == 0 || legacy_overflow {
            return Err(self.raise(
                ErrorCode::BadGeneration,
                &[&generation.to_string(), &format!("{:?}", value), OP],
            ));
        }
        if type_id != current {
            self.check_destination(object, property, type_id, Some(value), OP)?;
        }

        self.touches
            .touch_set_infoed(&self.graph, value)
            .map_err(|e| self.touch_error(e, OP))?;
        self.graph
            .set_value_type(value, type_id)
            .map_err(|e| self.graph_error(e, OP))?;
        if let Some(header) = self.graph.value_mut(value) {
            header.generation = generation;
        }
        Ok(())
    }

    /// Replace (or create) the base type array of a type on an object
    pub fn set_base_types(
        &mut self,
        object: ObjectId,
        type_id: TypeId,
        types: &[TypeId],
    ) -> Result<ValueId> {
        const OP: &str = "set_base_types";
        let updating = self.require_session(OP)?;
        self.check_live_object(object, OP)?;
        let segments = base_type_segments(types);
        match self.graph.value_by_type(object, BASE_TYPES_PROPERTY, type_id) {
            Some(value) => {
                self.touches
                    .touch_base_type(&self.graph, value)
                    .map_err(|e| self.touch_error(e, OP))?;
                self.edit(OP, |editor| editor.replace_segments(value, segments))?;
                Ok(value)
            }
            None => {
                self.check_destination(object, BASE_TYPES_PROPERTY, type_id, None, OP)?;
                self.insert_new_value(object, BASE_TYPES_PROPERTY, type_id, segments, updating, OP)
            }
        }
    }

    fn insert_new_value(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
        segments: Vec<Segment>,
        updating: ContainerId,
        op: &str,
    ) -> Result<ValueId> {
        let value = match self
            .graph
            .add_value(object, property, type_id, 1, segments.clone(), updating)
        {
            Ok(value) => value,
            Err(e) => {
                self.release_segments(&segments);
                return Err(self.graph_error(e, op));
            }
        };
        if let Err(e) = self.touches.touch_new_value(&self.graph, value) {
            if let Ok(header) = self.graph.remove_value(value) {
                self.release_segments(&header.segments);
            }
            return Err(self.touch_error(e, op));
        }
        tracing::debug!(target: "bento::session", %object, %property, %type_id, "Added value");
        Ok(value)
    }

    // ========================================================================
    // Checks
    // ========================================================================

    pub(crate) fn require_session(&self, op: &str) -> Result<ContainerId> {
        match self.updating {
            Some(layer) if self.writable => Ok(layer),
            Some(layer) => Err(self.raise(ErrorCode::NotWritable, &[&layer.to_string(), op])),
            None => Err(self.raise(ErrorCode::NoSession, &[op, "container"])),
        }
    }

    fn check_live_object(&self, object: ObjectId, op: &str) -> Result<()> {
        match self.graph.object(object) {
            Some(o) if !o.deleted => Ok(()),
            _ => Err(self.raise(
                ErrorCode::MissingObject,
                &[&object.to_string(), op, "container"],
            )),
        }
    }

    fn check_stream_property(&self, property: PropertyId, op: &str) -> Result<()> {
        if is_update_log_property(property) {
            return Err(Error::InvalidOperation(format!(
                "{} cannot touch update-log property {}",
                op, property
            )));
        }
        Ok(())
    }

    /// A value of `type_id` may land on `property` of `object`
    fn check_destination(
        &self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
        moving: Option<ValueId>,
        op: &str,
    ) -> Result<()> {
        if self.touches.is_property_deleted(object, property) {
            return Err(Error::InvalidOperation(format!(
                "{} cannot re-create property {} of {} deleted in this session",
                op, property, object
            )));
        }
        match self.graph.value_by_type(object, property, type_id) {
            Some(existing) if Some(existing) != moving => Err(self.raise(
                ErrorCode::DuplicateType,
                &[&property.to_string(), &type_id.to_string()],
            )),
            _ => Ok(()),
        }
    }

    fn live_header(&self, value: ValueId, op: &str) -> Result<&ValueHeader> {
        self.graph
            .value(value)
            .ok_or_else(|| Error::InvalidOperation(format!("{}: stale value handle {:?}", op, value)))
    }

    /// Size and inline-ness of a value whose bytes may be edited
    fn data_value(&self, value: ValueId, op: &str) -> Result<(u32, bool)> {
        let header = self.live_header(value, op)?;
        self.check_stream_property(header.property, op)?;
        if header.property == BASE_TYPES_PROPERTY {
            return Err(Error::InvalidOperation(format!(
                "{}: base type arrays are replaced with set_base_types",
                op
            )));
        }
        Ok((header.size, header.is_immediate()))
    }

    fn bad_offset(&self, value: ValueId, offset: u32, len: u32, size: u32) -> Error {
        self.raise(
            ErrorCode::BadOffset,
            &[
                &offset.to_string(),
                &offset.saturating_add(len).to_string(),
                &format!("{:?}", value),
                &size.to_string(),
            ],
        )
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    /// Run an edit against the top layer
    pub(crate) fn edit<T>(
        &mut self,
        context: &str,
        f: impl FnOnce(&mut SegmentEditor<'_>) -> std::result::Result<T, EditError>,
    ) -> Result<T> {
        if !self.writable {
            let layer = self.layers.top().to_string();
            return Err(self.raise(ErrorCode::NotWritable, &[&layer, context]));
        }
        let updating = self.updating.unwrap_or_else(|| self.layers.top());
        let result = {
            let mut editor = SegmentEditor::new(
                &mut self.graph,
                &mut self.layers,
                &mut self.free_space,
                updating,
            );
            f(&mut editor)
        };
        result.map_err(|e| self.edit_error(e, context))
    }

    /// Read-only view of the value data
    pub(crate) fn reader(&self) -> SegmentReader<'_> {
        SegmentReader::new(&self.graph, &self.layers)
    }

    fn object_contents(
        &self,
        object: ObjectId,
    ) -> Result<(Vec<(PropertyId, Vec<ValueId>)>, Vec<Segment>)> {
        let obj = self
            .graph
            .require_object(object)
            .map_err(|e| self.graph_error(e, "delete_object"))?;
        let properties: Vec<(PropertyId, Vec<ValueId>)> = obj
            .properties
            .iter()
            .map(|p| (p.id, p.values.clone()))
            .collect();
        let values: Vec<ValueId> = properties.iter().flat_map(|(_, v)| v.iter().copied()).collect();
        Ok((properties, self.segments_of(&values)))
    }

    fn segments_of(&self, values: &[ValueId]) -> Vec<Segment> {
        values
            .iter()
            .filter_map(|v| self.graph.value(*v))
            .flat_map(|h| h.segments.iter().cloned())
            .collect()
    }

    fn release_segments(&mut self, segments: &[Segment]) {
        for segment in segments {
            if let SegmentData::Stored {
                container,
                offset,
                len,
            } = segment.data
            {
                self.free_space.release(container, offset, len);
            }
        }
    }

    // ========================================================================
    // Error funnel
    // ========================================================================

    /// Report a condition and build the error for the caller
    pub(crate) fn raise(&self, code: ErrorCode, inserts: &[&str]) -> Error {
        raise(self.reporter.as_ref(), code, inserts)
    }

    pub(crate) fn raise_owned(&self, code: ErrorCode, inserts: &[String]) -> Error {
        let inserts: Vec<&str> = inserts.iter().map(String::as_str).collect();
        self.raise(code, &inserts)
    }

    pub(crate) fn edit_error(&self, err: EditError, context: &str) -> Error {
        match err.code() {
            Some(code) => self.raise_owned(code, &err.inserts(context)),
            None => match err {
                EditError::Graph(GraphError::MissingValue(value)) => Error::InvalidOperation(
                    format!("{}: stale value handle {:?}", context, value),
                ),
                EditError::ImmediateOverflow(len) => Error::InvalidOperation(format!(
                    "{}: {} bytes do not fit an immediate",
                    context, len
                )),
                other => Error::Corruption(format!("{}: {}", context, other)),
            },
        }
    }

    pub(crate) fn graph_error(&self, err: GraphError, context: &str) -> Error {
        self.edit_error(EditError::Graph(err), context)
    }

    pub(crate) fn touch_error(&self, err: TouchError, context: &str) -> Error {
        match err {
            TouchError::Exhausted { limit } => self.raise(
                ErrorCode::NoTouchedEntry,
                &[context, &format!("container (limit {})", limit)],
            ),
            TouchError::Graph(e) => self.graph_error(e, context),
            TouchError::Dangling(id) => {
                Error::Corruption(format!("{}: touch entry {:?} is not live", context, id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::TargetBuilder;
    use crate::touch::TouchFlags;
    use bento_core::CollectingReporter;

    const P: PropertyId = PropertyId(0x50);
    const Q: PropertyId = PropertyId(0x51);
    const R: PropertyId = PropertyId(0x52);
    const T: TypeId = TypeId(0x60);
    const U: TypeId = TypeId(0x61);

    struct Fixture {
        container: Container,
        reporter: CollectingReporter,
        x: ObjectId,
        y: ObjectId,
    }

    fn fixture() -> Fixture {
        fixture_with(ContainerConfig::for_testing())
    }

    fn fixture_with(config: ContainerConfig) -> Fixture {
        let mut builder = TargetBuilder::new();
        let x = builder.object();
        let y = builder.object();
        builder.value(x, P, T, b"abc").unwrap();
        builder
            .segmented_value(x, Q, T, &[&[b'a'; 40], &[b'b'; 60]])
            .unwrap();
        builder.value(y, P, T, b"yy").unwrap();
        let reporter = CollectingReporter::new();
        let container = Container::open_for_update(builder.build(), config)
            .unwrap()
            .with_reporter(Arc::new(reporter.clone()));
        Fixture {
            container,
            reporter,
            x,
            y,
        }
    }

    impl Fixture {
        fn value(&self, object: ObjectId, property: PropertyId, type_id: TypeId) -> ValueId {
            self.container.value(object, property, type_id).unwrap()
        }

        fn flags(&self, value: ValueId) -> TouchFlags {
            let touches = self.container.touches();
            let id = touches.entry_for_value(value).unwrap();
            touches.entry(id).unwrap().flags
        }
    }

    #[test]
    fn test_open_for_update_pushes_layer() {
        let f = fixture();
        assert_eq!(f.container.layer_count(), 2);
        assert_eq!(f.container.updating_layer(), Some(ContainerId(1)));
        assert!(f.container.is_writable());
        assert!(f.container.touches().is_recording());
    }

    #[test]
    fn test_read_only_container_rejects_edits() {
        let target = TargetBuilder::new().build();
        let reporter = CollectingReporter::new();
        let mut container = Container::open(target, ContainerConfig::for_testing())
            .unwrap()
            .with_reporter(Arc::new(reporter.clone()));
        let err = container.create_object().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NoSession));
        assert_eq!(reporter.codes(), vec![ErrorCode::NoSession]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let target = TargetBuilder::new().build();
        let config = ContainerConfig::default().with_io_buffer_size(1);
        assert!(matches!(
            Container::open_for_update(target, config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_immediate_write_stays_inline() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        f.container.write_value_data(v, 1, b"XYZ").unwrap();
        assert_eq!(f.container.read_value(v).unwrap(), b"aXYZ".to_vec());
        assert!(f.container.value_header(v).unwrap().is_immediate());
        assert_eq!(f.flags(v), TouchFlags::IMMEDIATE);
    }

    #[test]
    fn test_immediate_growth_converts_to_stored() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        f.container.write_value_data(v, 3, b"defgh").unwrap();
        assert_eq!(f.container.read_value(v).unwrap(), b"abcdefgh".to_vec());
        let header = f.container.value_header(v).unwrap();
        assert!(!header.is_immediate());
        assert_eq!(header.owner, ContainerId(1));
        assert!(f.flags(v).contains(TouchFlags::EDITED));
    }

    #[test]
    fn test_overwrite_of_target_bytes_splits() {
        let mut f = fixture();
        let v = f.value(f.x, Q, T);
        f.container.write_value_data(v, 38, b"----").unwrap();
        let data = f.container.read_value(v).unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(&data[36..44], b"aa----bb");
        let header = f.container.value_header(v).unwrap();
        assert_eq!(header.logical_size, 100);
        assert_eq!(header.segments.len(), 3);
    }

    #[test]
    fn test_overwrite_of_new_bytes_in_place() {
        let mut f = fixture();
        let v = f.value(f.x, Q, T);
        f.container.insert_value_data(v, 10, b"12345678").unwrap();
        let eof = f.container.layer_bytes(ContainerId(1)).unwrap().len();
        f.container.write_value_data(v, 12, b"xx").unwrap();
        assert_eq!(f.container.layer_bytes(ContainerId(1)).unwrap().len(), eof);
        let data = f.container.read_value(v).unwrap();
        assert_eq!(&data[10..18], b"12xx5678");
    }

    #[test]
    fn test_write_extends_value() {
        let mut f = fixture();
        let v = f.value(f.x, Q, T);
        f.container.write_value_data(v, 98, b"ZZZZ").unwrap();
        let data = f.container.read_value(v).unwrap();
        assert_eq!(data.len(), 102);
        assert_eq!(&data[96..], b"bbZZZZ");
    }

    #[test]
    fn test_write_past_end_rejected() {
        let mut f = fixture();
        let v = f.value(f.x, Q, T);
        let err = f.container.write_value_data(v, 101, b"z").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BadOffset));
        assert!(f.container.touches().entry_for_value(v).is_none());
    }

    #[test]
    fn test_insert_offset_checked() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        let err = f.container.insert_value_data(v, 4, b"z").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BadInsertOffset));
        assert_eq!(f.reporter.codes(), vec![ErrorCode::BadInsertOffset]);
    }

    #[test]
    fn test_delete_data_of_immediate() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        f.container.delete_value_data(v, 0, 2).unwrap();
        assert_eq!(f.container.read_value(v).unwrap(), b"c".to_vec());
        let err = f.container.delete_value_data(v, 0, 2).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BadOffset));
    }

    #[test]
    fn test_delete_all_stored_data_leaves_empty_immediate() {
        let mut f = fixture();
        let v = f.value(f.x, Q, T);
        f.container.delete_value_data(v, 0, 100).unwrap();
        let header = f.container.value_header(v).unwrap();
        assert!(header.is_immediate());
        assert_eq!(header.size, 0);
        f.container.write_value_data(v, 0, b"hi").unwrap();
        assert_eq!(f.container.read_value(v).unwrap(), b"hi".to_vec());
    }

    #[test]
    fn test_add_value_records_new_value() {
        let mut f = fixture();
        let v = f.container.add_value(f.x, P, U, b"a longer value").unwrap();
        assert_eq!(f.container.read_value(v).unwrap(), b"a longer value".to_vec());
        let flags = f.flags(v);
        assert!(flags.contains(TouchFlags::NEW_VALUE | TouchFlags::EDITED));
    }

    #[test]
    fn test_add_duplicate_type_rejected() {
        let mut f = fixture();
        let err = f.container.add_value(f.x, P, T, b"z").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DuplicateType));
    }

    #[test]
    fn test_touch_limit_rolls_back_new_value() {
        let mut f = fixture_with(ContainerConfig::for_testing().with_max_touch_entries(1));
        let v = f.value(f.x, P, T);
        f.container.write_value_data(v, 0, b"z").unwrap();
        let err = f.container.add_value(f.x, P, U, b"0123456789").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NoTouchedEntry));
        assert!(f.container.value(f.x, P, U).is_none());
    }

    #[test]
    fn test_new_object_values_not_touched() {
        let mut f = fixture();
        let o = f.container.create_object().unwrap();
        let v = f.container.add_value(o, P, T, b"fresh data").unwrap();
        f.container.write_value_data(v, 0, b"F").unwrap();
        assert!(f.container.touches().entry_for_value(v).is_none());
        assert!(!f.container.touches().is_touched(o));
    }

    #[test]
    fn test_move_into_new_object_deletes_original() {
        let mut f = fixture();
        let o = f.container.create_object().unwrap();
        let v = f.value(f.x, Q, T);
        f.container.insert_value_data(v, 0, b"moved ").unwrap();
        f.container.move_value(v, o, R).unwrap();

        assert_eq!(f.container.value(o, R, T), Some(v));
        assert!(f.container.touches().entry_for_value(v).is_none());
        let entries = f.container.touches().entries_of(f.x);
        assert_eq!(entries.len(), 1);
        let entry = f.container.touches().entry(entries[0]).unwrap();
        assert_eq!(entry.flags, TouchFlags::DELETED_VALUE);
        assert_eq!(entry.opt, Opt::new(f.x, Q, T));
        assert!(!f.container.touches().is_touched(o));

        f.container.write_value_data(v, 0, b"M").unwrap();
        assert!(f.container.touches().entry_for_value(v).is_none());
    }

    #[test]
    fn test_move_out_of_new_object_rejected() {
        let mut f = fixture();
        let o = f.container.create_object().unwrap();
        let v = f.container.add_value(o, P, U, b"fresh").unwrap();
        let err = f.container.move_value(v, f.x, P).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(f.container.touches().live_entries(), 0);
    }

    #[test]
    fn test_move_duplicate_checked_before_touch() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        let err = f.container.move_value(v, f.y, P).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DuplicateType));
        assert_eq!(f.container.touches().live_entries(), 0);
    }

    #[test]
    fn test_move_and_back_leaves_nothing() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        f.container.move_value(v, f.y, Q).unwrap();
        assert_eq!(f.container.touches().live_entries(), 2);
        f.container.move_value(v, f.x, P).unwrap();
        assert_eq!(f.container.touches().live_entries(), 0);
        assert_eq!(f.container.value(f.x, P, T), Some(v));
    }

    #[test]
    fn test_delete_property_rejects_recreation() {
        let mut f = fixture();
        f.container.delete_property(f.x, P).unwrap();
        assert!(f.container.touches().is_property_deleted(f.x, P));
        let err = f.container.add_value(f.x, P, T, b"z").unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_delete_recreated_property_keeps_value_deletion() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        f.container.move_value(v, f.y, Q).unwrap();
        f.container.move_value(v, f.x, P).unwrap();
        assert!(f.container.graph().property(f.x, P).unwrap().created);

        f.container.delete_property(f.x, P).unwrap();
        let entries = f.container.touches().entries_of(f.x);
        assert_eq!(entries.len(), 1);
        let entry = f.container.touches().entry(entries[0]).unwrap();
        assert_eq!(entry.flags, TouchFlags::DELETED_VALUE);
        assert_eq!(entry.opt, Opt::new(f.x, P, T));
    }

    #[test]
    fn test_delete_missing_property_reported() {
        let mut f = fixture();
        let err = f.container.delete_property(f.y, Q).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MissingProperty));
    }

    #[test]
    fn test_delete_object_marks_deleted() {
        let mut f = fixture();
        f.container.delete_object(f.x).unwrap();
        assert!(f.container.graph().object(f.x).unwrap().deleted);
        assert!(f.container.touches().is_touched(f.x));
        let err = f.container.add_value(f.x, P, U, b"z").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MissingObject));
    }

    #[test]
    fn test_delete_new_object_removes_it() {
        let mut f = fixture();
        let o = f.container.create_object().unwrap();
        f.container.add_value(o, P, T, b"0123456789").unwrap();
        f.container.delete_object(o).unwrap();
        assert!(f.container.graph().object(o).is_none());
        assert!(f.container.free_space.free_bytes() >= 10);
    }

    #[test]
    fn test_set_value_info_checks_generation() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        let err = f.container.set_value_info(v, T, 0).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BadGeneration));
        f.container.set_value_info(v, U, 7).unwrap();
        let header = f.container.value_header(v).unwrap();
        assert_eq!((header.type_id, header.generation), (U, 7));
    }

    #[test]
    fn test_legacy_generation_range() {
        let mut f = fixture_with(
            ContainerConfig::for_testing().with_format(FormatVersion::Legacy),
        );
        let v = f.value(f.x, P, T);
        let err = f.container.set_value_info(v, T, 70_000).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BadGeneration));
        f.container.set_value_info(v, T, 65_535).unwrap();
    }

    #[test]
    fn test_base_types_round_trip() {
        let mut f = fixture();
        let v = f
            .container
            .set_base_types(f.x, T, &[TypeId(0x70), TypeId(0x71)])
            .unwrap();
        assert_eq!(
            f.container.base_types(v).unwrap(),
            vec![TypeId(0x70), TypeId(0x71)]
        );
        f.container.set_base_types(f.x, T, &[TypeId(0x72)]).unwrap();
        assert_eq!(f.container.base_types(v).unwrap(), vec![TypeId(0x72)]);
        let err = f.container.write_value_data(v, 0, b"x").unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_base_types_of_plain_value_reported() {
        let f = fixture();
        let v = f.value(f.x, P, T);
        let err = f.container.base_types(v).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotBaseType));
    }

    #[test]
    fn test_contents_lists_live_values() {
        let mut f = fixture();
        let v = f.value(f.y, P, T);
        f.container.delete_value(v).unwrap();
        let contents = f.container.contents().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[&Opt::new(f.x, P, T)].data, b"abc".to_vec());
    }

    #[test]
    fn test_into_target_requires_closed_session() {
        let f = fixture();
        assert!(matches!(
            f.container.into_target(),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_abandon_tears_down_touches() {
        let mut f = fixture();
        let v = f.value(f.x, P, T);
        f.container.write_value_data(v, 0, b"z").unwrap();
        f.container.abandon();
    }
}
