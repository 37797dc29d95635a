//! Object / property / value graph
//!
//! The graph is the container's in-memory table of contents:
//! - Objects are keyed by their stable id in a `BTreeMap`
//! - Each object owns an ordered list of properties
//! - Each property owns an ordered list of value handles, one per type
//! - Value headers live in a slab and are addressed by [`ValueId`]
//!
//! Value headers are addressed by handle rather than owned by their
//! property, so that moving a value between properties is a transplant of
//! one handle and callers keep a valid handle across the move.

use crate::segment::{NameId, Segment};
use bento_core::{ContainerId, ObjectId, PropertyId, TypeId, CONTROL_OBJECT_ID, FIRST_USER_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Handle of a value header in the graph's slab
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Graph lookup and linkage errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// No object with this id
    #[error("object {0} not found")]
    MissingObject(ObjectId),

    /// Object has no such property
    #[error("property {property} not found on object {object}")]
    MissingProperty {
        /// Owning object
        object: ObjectId,
        /// Requested property
        property: PropertyId,
    },

    /// Stale or unknown value handle
    #[error("value handle {0:?} is not live")]
    MissingValue(ValueId),

    /// Property already holds a value of this type
    #[error("property {property} of object {object} already has a value of type {type_id}")]
    DuplicateType {
        /// Owning object
        object: ObjectId,
        /// Destination property
        property: PropertyId,
        /// Conflicting type
        type_id: TypeId,
    },

    /// Object id already in use
    #[error("object {0} already exists")]
    DuplicateObject(ObjectId),
}

/// A value header: type, generation and segment chain of one value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueHeader {
    /// Owning object
    pub object: ObjectId,
    /// Owning property
    pub property: PropertyId,
    /// Value type
    pub type_id: TypeId,
    /// Generation number
    pub generation: u32,
    /// Segment chain, in data order
    pub segments: Vec<Segment>,
    /// Total data length in bytes
    pub size: u32,
    /// Data length when the container was opened
    pub logical_size: u32,
    /// Layer that last rewrote this header
    pub owner: ContainerId,
}

impl ValueHeader {
    /// Whether more than one segment makes up the value
    pub fn is_continued(&self) -> bool {
        self.segments.len() > 1
    }

    /// Whether the value is a single inline immediate
    pub fn is_immediate(&self) -> bool {
        self.segments.len() == 1 && self.segments[0].is_immediate()
    }

    /// Recompute `size` from the segment chain
    pub fn computed_size(&self) -> u32 {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Reset logical offsets so the current layout becomes the original one
    ///
    /// Afterwards every segment is old, offsets run contiguously from zero
    /// and `logical_size` equals `size`.
    pub fn relogicalize(&mut self) {
        let mut offset = 0u32;
        for segment in &mut self.segments {
            segment.logical_offset = Some(offset);
            offset += segment.len();
        }
        self.size = offset;
        self.logical_size = offset;
    }

    /// Check the contiguity invariant of old segments
    ///
    /// Every segment must be old. Reading left to right, each must start
    /// where the previous one ended, and the last must end at
    /// `logical_size`.
    pub fn old_segments_contiguous(&self) -> bool {
        let mut expected = 0u32;
        for segment in &self.segments {
            match segment.logical_offset {
                Some(logical) if logical == expected => expected += segment.len(),
                Some(_) => return false,
                None => return false,
            }
        }
        expected == self.logical_size
    }
}

/// A property and its values, one per type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Property id
    pub id: PropertyId,
    /// Value handles in insertion order
    pub values: Vec<ValueId>,
    /// Created during the current session
    pub created: bool,
}

/// An object and its properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    /// Object id
    pub id: ObjectId,
    /// Properties in insertion order
    pub properties: Vec<Property>,
    /// Deleted during the current session
    pub deleted: bool,
    /// Created during the current session, not part of the target
    pub new: bool,
}

impl Object {
    fn new(id: ObjectId, new: bool) -> Self {
        Object {
            id,
            properties: Vec::new(),
            deleted: false,
            new,
        }
    }

    /// Look up a property
    pub fn property(&self, id: PropertyId) -> Option<&Property> {
        self.properties.iter().find(|p| p.id == id)
    }

    fn property_mut(&mut self, id: PropertyId) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.id == id)
    }

    /// All value handles of the object, in property order
    pub fn value_ids(&self) -> Vec<ValueId> {
        self.properties
            .iter()
            .flat_map(|p| p.values.iter().copied())
            .collect()
    }
}

/// The object graph of one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGraph {
    objects: BTreeMap<ObjectId, Object>,
    values: Vec<Option<ValueHeader>>,
    free_slots: Vec<u32>,
    names: Vec<String>,
    next_object_id: u32,
    #[serde(skip)]
    track_created: bool,
}

impl Default for ObjectGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectGraph {
    /// Create a graph holding only the control object
    pub fn new() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(CONTROL_OBJECT_ID, Object::new(CONTROL_OBJECT_ID, false));
        ObjectGraph {
            objects,
            values: Vec::new(),
            free_slots: Vec::new(),
            names: Vec::new(),
            next_object_id: FIRST_USER_ID,
            track_created: false,
        }
    }

    /// Flag properties created from now on as session-created
    pub fn set_track_created(&mut self, track: bool) {
        self.track_created = track;
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Create an object with the next free id
    pub fn create_object(&mut self, new: bool) -> ObjectId {
        let id = ObjectId(self.next_object_id);
        self.next_object_id += 1;
        self.objects.insert(id, Object::new(id, new));
        id
    }

    /// Insert an object with a caller-chosen id
    pub fn insert_object(&mut self, id: ObjectId, new: bool) -> Result<(), GraphError> {
        if self.objects.contains_key(&id) {
            return Err(GraphError::DuplicateObject(id));
        }
        self.objects.insert(id, Object::new(id, new));
        self.next_object_id = self.next_object_id.max(id.0 + 1);
        Ok(())
    }

    /// Find an object by id
    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    /// Find an object by id, failing if absent
    pub fn require_object(&self, id: ObjectId) -> Result<&Object, GraphError> {
        self.objects.get(&id).ok_or(GraphError::MissingObject(id))
    }

    /// Whether an object was created in the current session
    pub fn is_new_object(&self, id: ObjectId) -> bool {
        self.objects.get(&id).map(|o| o.new).unwrap_or(false)
    }

    /// Iterate objects in id order
    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Ids of all objects, in id order
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    /// Mark an object deleted, dropping its properties and values
    pub fn mark_object_deleted(&mut self, id: ObjectId) -> Result<(), GraphError> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(GraphError::MissingObject(id))?;
        let properties = std::mem::take(&mut object.properties);
        object.deleted = true;
        for property in properties {
            for value in property.values {
                self.free_value(value);
            }
        }
        Ok(())
    }

    /// Remove an object entirely, dropping its properties and values
    pub fn remove_object(&mut self, id: ObjectId) -> Result<Object, GraphError> {
        let object = self
            .objects
            .remove(&id)
            .ok_or(GraphError::MissingObject(id))?;
        for value in object.value_ids() {
            self.free_value(value);
        }
        Ok(object)
    }

    /// Clear every session flag, making the current state the baseline
    pub fn clear_session_flags(&mut self) {
        self.objects.retain(|_, o| !o.deleted);
        for object in self.objects.values_mut() {
            object.new = false;
            for property in &mut object.properties {
                property.created = false;
            }
        }
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Look up a property of an object
    pub fn property(&self, object: ObjectId, property: PropertyId) -> Option<&Property> {
        self.objects.get(&object)?.property(property)
    }

    /// Find or create a property, returning whether it was created
    pub fn ensure_property(
        &mut self,
        object: ObjectId,
        property: PropertyId,
    ) -> Result<bool, GraphError> {
        let created = self.track_created;
        let obj = self
            .objects
            .get_mut(&object)
            .ok_or(GraphError::MissingObject(object))?;
        if obj.property(property).is_some() {
            return Ok(false);
        }
        obj.properties.push(Property {
            id: property,
            values: Vec::new(),
            created,
        });
        Ok(true)
    }

    /// Remove a property and all its values
    pub fn delete_property(
        &mut self,
        object: ObjectId,
        property: PropertyId,
    ) -> Result<Property, GraphError> {
        let obj = self
            .objects
            .get_mut(&object)
            .ok_or(GraphError::MissingObject(object))?;
        let index = obj
            .properties
            .iter()
            .position(|p| p.id == property)
            .ok_or(GraphError::MissingProperty { object, property })?;
        let removed = obj.properties.remove(index);
        for value in &removed.values {
            self.free_value(*value);
        }
        Ok(removed)
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Find the value of a given type on a property
    pub fn value_by_type(
        &self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
    ) -> Option<ValueId> {
        self.property(object, property)?
            .values
            .iter()
            .copied()
            .find(|v| self.value(*v).map(|h| h.type_id == type_id).unwrap_or(false))
    }

    /// Get a value header
    pub fn value(&self, id: ValueId) -> Option<&ValueHeader> {
        self.values.get(id.0 as usize)?.as_ref()
    }

    /// Get a mutable value header
    pub fn value_mut(&mut self, id: ValueId) -> Option<&mut ValueHeader> {
        self.values.get_mut(id.0 as usize)?.as_mut()
    }

    /// Get a value header, failing on a stale handle
    pub fn require_value(&self, id: ValueId) -> Result<&ValueHeader, GraphError> {
        self.value(id).ok_or(GraphError::MissingValue(id))
    }

    /// Get a mutable value header, failing on a stale handle
    pub fn require_value_mut(&mut self, id: ValueId) -> Result<&mut ValueHeader, GraphError> {
        self.value_mut(id).ok_or(GraphError::MissingValue(id))
    }

    /// Handles of every live value
    pub fn value_ids(&self) -> Vec<ValueId> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .map(|(i, _)| ValueId(i as u32))
            .collect()
    }

    /// Create a value under a property, creating the property if needed
    ///
    /// Fails before linking anything if the property already has a value of
    /// the same type.
    pub fn add_value(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
        generation: u32,
        segments: Vec<Segment>,
        owner: ContainerId,
    ) -> Result<ValueId, GraphError> {
        self.check_type_free(object, property, type_id)?;
        self.ensure_property(object, property)?;

        let size = segments.iter().map(Segment::len).sum();
        let header = ValueHeader {
            object,
            property,
            type_id,
            generation,
            segments,
            size,
            logical_size: 0,
            owner,
        };
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.values[slot as usize] = Some(header);
                ValueId(slot)
            }
            None => {
                self.values.push(Some(header));
                ValueId((self.values.len() - 1) as u32)
            }
        };
        self.link(object, property, id)?;
        Ok(id)
    }

    /// Unlink and free a value, deleting its property if it becomes empty
    pub fn remove_value(&mut self, id: ValueId) -> Result<ValueHeader, GraphError> {
        if self.is_linked(id) {
            self.detach(id)?;
        }
        let header = self
            .values
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(GraphError::MissingValue(id))?;
        self.free_slots.push(id.0);
        Ok(header)
    }

    /// Move a value header to another property, keeping its handle
    ///
    /// The destination property is created if needed; the source property
    /// is deleted if it becomes empty. A duplicate type in the destination
    /// is detected before anything is unlinked. Moving a value onto its own
    /// property is a no-op.
    pub fn transplant_value(
        &mut self,
        id: ValueId,
        to_object: ObjectId,
        to_property: PropertyId,
    ) -> Result<(), GraphError> {
        let (from_object, from_property, type_id) = {
            let header = self.require_value(id)?;
            (header.object, header.property, header.type_id)
        };
        if from_object == to_object && from_property == to_property {
            return Ok(());
        }
        self.require_object(to_object)?;
        self.check_type_free(to_object, to_property, type_id)?;

        self.detach(id)?;
        self.attach_value(id, to_object, to_property)
    }

    /// Unlink a value from its property without freeing it
    ///
    /// The header stays addressable by its handle until it is attached
    /// again or removed. The property is deleted if it becomes empty.
    pub fn detach_value(&mut self, id: ValueId) -> Result<(), GraphError> {
        self.detach(id)
    }

    /// Link a detached value under a property, creating the property if
    /// needed
    ///
    /// Fails before linking if the destination already has a value of the
    /// header's type.
    pub fn attach_value(
        &mut self,
        id: ValueId,
        to_object: ObjectId,
        to_property: PropertyId,
    ) -> Result<(), GraphError> {
        let type_id = self.require_value(id)?.type_id;
        self.check_type_free(to_object, to_property, type_id)?;
        let created = self.ensure_property(to_object, to_property)?;
        if created {
            tracing::trace!(
                target: "bento::graph",
                object = %to_object,
                property = %to_property,
                "Created destination property for value"
            );
        }
        self.link(to_object, to_property, id)?;
        let header = self.require_value_mut(id)?;
        header.object = to_object;
        header.property = to_property;
        Ok(())
    }

    /// Change a value's type, rejecting a duplicate on the same property
    pub fn set_value_type(&mut self, id: ValueId, type_id: TypeId) -> Result<(), GraphError> {
        let (object, property, current) = {
            let header = self.require_value(id)?;
            (header.object, header.property, header.type_id)
        };
        if current != type_id {
            self.check_type_free(object, property, type_id)?;
        }
        self.require_value_mut(id)?.type_id = type_id;
        Ok(())
    }

    fn check_type_free(
        &self,
        object: ObjectId,
        property: PropertyId,
        type_id: TypeId,
    ) -> Result<(), GraphError> {
        self.require_object(object)?;
        if self.value_by_type(object, property, type_id).is_some() {
            return Err(GraphError::DuplicateType {
                object,
                property,
                type_id,
            });
        }
        Ok(())
    }

    fn link(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        id: ValueId,
    ) -> Result<(), GraphError> {
        let obj = self
            .objects
            .get_mut(&object)
            .ok_or(GraphError::MissingObject(object))?;
        let prop = obj
            .property_mut(property)
            .ok_or(GraphError::MissingProperty { object, property })?;
        prop.values.push(id);
        Ok(())
    }

    /// Whether a value is linked under its recorded property
    pub fn is_linked(&self, id: ValueId) -> bool {
        match self.value(id) {
            Some(header) => self
                .property(header.object, header.property)
                .map(|p| p.values.contains(&id))
                .unwrap_or(false),
            None => false,
        }
    }

    fn detach(&mut self, id: ValueId) -> Result<(), GraphError> {
        let (object, property) = {
            let header = self.require_value(id)?;
            (header.object, header.property)
        };
        let obj = self
            .objects
            .get_mut(&object)
            .ok_or(GraphError::MissingObject(object))?;
        let prop = obj
            .property_mut(property)
            .ok_or(GraphError::MissingProperty { object, property })?;
        prop.values.retain(|v| *v != id);
        if prop.values.is_empty() {
            obj.properties.retain(|p| p.id != property);
        }
        Ok(())
    }

    fn free_value(&mut self, id: ValueId) {
        if let Some(slot) = self.values.get_mut(id.0 as usize) {
            if slot.take().is_some() {
                self.free_slots.push(id.0);
            }
        }
    }

    // ========================================================================
    // Global names
    // ========================================================================

    /// Intern a global name
    pub fn intern_name(&mut self, name: &str) -> NameId {
        if let Some(index) = self.names.iter().position(|n| n == name) {
            return NameId(index as u32);
        }
        self.names.push(name.to_string());
        NameId((self.names.len() - 1) as u32)
    }

    /// Look up an interned name
    pub fn name(&self, id: NameId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }
}
