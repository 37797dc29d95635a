//! Touch tracking
//!
//! While an updating session is active, every edit records what it changed
//! in a [`TouchEntry`]. Entries live in an arena and are addressed by
//! [`TouchId`]. Each touched object owns a doubly linked list of its
//! entries (the touched list); the set of objects with a list is the
//! touched chain. At close the update encoder drains both.
//!
//! A value owns at most one entry at a time, found through the tracker's
//! value index. Moving a value between objects leaves a `REMOVED` entry at
//! the value's original location and keeps the value's own entry, flagged
//! `INSERTED`, on the list of the object it now lives in. Whether a value
//! has moved is never stored separately; it is read from those flags:
//!
//! | state | value's entry                         | value lives in          |
//! |-------|---------------------------------------|-------------------------|
//! | 0     | none, or not `INSERTED`               | original object+property|
//! | 1     | `INSERTED`, no paired removed entry   | original object, other property |
//! | 2     | `INSERTED`, paired with a removed one | another object          |

use bento_core::{ObjectId, Opt, PropertyId, BASE_TYPES_PROPERTY};
use bento_storage::{GraphError, ObjectGraph, ValueId};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Handle of a touch entry in the tracker's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TouchId(u32);

bitflags::bitflags! {
    /// What happened to a touched value, property or object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TouchFlags: u16 {
        /// Value data was edited
        const EDITED = 1 << 0;
        /// Inline immediate data was replaced
        const IMMEDIATE = 1 << 1;
        /// Base type array was replaced
        const BASE_TYPE = 1 << 2;
        /// Type or generation changed
        const SET_INFOED = 1 << 3;
        /// Value now lives away from its original location
        const INSERTED = 1 << 4;
        /// Original location of a value that moved to another object
        const REMOVED = 1 << 5;
        /// Value at the original location was deleted
        const DELETED_VALUE = 1 << 6;
        /// Property was deleted
        const DELETED_PROPERTY = 1 << 7;
        /// Value was created in this session on a target object
        const NEW_VALUE = 1 << 8;

        /// Flags that carry information beyond the value's location
        const DATA = Self::EDITED.bits()
            | Self::IMMEDIATE.bits()
            | Self::BASE_TYPE.bits()
            | Self::SET_INFOED.bits();
    }
}

/// One change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchEntry {
    /// Address of the value when first touched; for a deleted property
    /// the type is `TypeId::NONE`
    pub opt: Opt,
    /// What happened
    pub flags: TouchFlags,
    /// The value this entry follows, if it is still live
    pub value: Option<ValueId>,
    /// The removed entry paired with an inserted one
    pub removed: Option<TouchId>,
    /// Whether the value was a single inline immediate when first touched
    pub inline_origin: bool,
    object: ObjectId,
    prev: Option<TouchId>,
    next: Option<TouchId>,
}

impl TouchEntry {
    /// Object whose touched list holds this entry
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Whether this entry records anything about a value
    pub fn is_value_entry(&self) -> bool {
        !self.flags.contains(TouchFlags::DELETED_PROPERTY)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TouchList {
    head: Option<TouchId>,
    tail: Option<TouchId>,
    len: usize,
}

/// Touch tracking errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TouchError {
    /// Live entry limit reached
    #[error("touch entry limit of {limit} reached")]
    Exhausted {
        /// Configured limit
        limit: usize,
    },

    /// Graph lookup failed
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Entry links are inconsistent
    #[error("touch entry {0:?} is not live")]
    Dangling(TouchId),
}

/// Per-session record of touched objects, values and properties
#[derive(Debug, Default)]
pub struct TouchTracker {
    entries: Vec<Option<TouchEntry>>,
    free: Vec<u32>,
    live: usize,
    limit: Option<usize>,
    by_value: FxHashMap<ValueId, TouchId>,
    lists: FxHashMap<ObjectId, TouchList>,
    chain: Vec<ObjectId>,
    recording: bool,
}

impl TouchTracker {
    /// Create a tracker, optionally capping the number of live entries
    pub fn new(limit: Option<usize>) -> Self {
        TouchTracker {
            limit,
            ..Default::default()
        }
    }

    /// Start or stop recording touches
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    /// Whether touches are being recorded
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Number of live entries
    pub fn live_entries(&self) -> usize {
        self.live
    }

    /// Whether no entry and no touched object remain
    pub fn is_drained(&self) -> bool {
        self.live == 0 && self.chain.is_empty() && self.lists.is_empty()
    }

    /// Objects on the touched chain, most recently touched first
    pub fn touched_objects(&self) -> Vec<ObjectId> {
        self.chain.iter().rev().copied().collect()
    }

    /// Whether an object is on the touched chain
    pub fn is_touched(&self, object: ObjectId) -> bool {
        self.lists.contains_key(&object)
    }

    /// Look up an entry
    pub fn entry(&self, id: TouchId) -> Option<&TouchEntry> {
        self.entries.get(id.0 as usize)?.as_ref()
    }

    /// Entry currently following a value
    pub fn entry_for_value(&self, value: ValueId) -> Option<TouchId> {
        self.by_value.get(&value).copied()
    }

    /// Entries on an object's touched list, in list order
    pub fn entries_of(&self, object: ObjectId) -> Vec<TouchId> {
        let mut out = Vec::new();
        let mut cursor = self.lists.get(&object).and_then(|l| l.head);
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.entry(id).and_then(|e| e.next);
        }
        out
    }

    /// Whether a property deletion is recorded for an object
    pub fn is_property_deleted(&self, object: ObjectId, property: PropertyId) -> bool {
        self.entries_of(object).into_iter().any(|id| {
            self.entry(id)
                .map(|e| {
                    e.flags.contains(TouchFlags::DELETED_PROPERTY) && e.opt.property == property
                })
                .unwrap_or(false)
        })
    }

    fn applies(&self, graph: &ObjectGraph, object: ObjectId) -> bool {
        self.recording && !graph.is_new_object(object)
    }

    // ========================================================================
    // Data touches
    // ========================================================================

    /// Record that a value's data was edited
    pub fn touch_edited(&mut self, graph: &ObjectGraph, value: ValueId) -> Result<(), TouchError> {
        self.touch_flag(graph, value, TouchFlags::EDITED)
    }

    /// Record that a value's inline immediate was replaced
    pub fn touch_immediate(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
    ) -> Result<(), TouchError> {
        self.touch_flag(graph, value, TouchFlags::IMMEDIATE)
    }

    /// Record that a value's base type array was replaced
    pub fn touch_base_type(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
    ) -> Result<(), TouchError> {
        self.touch_flag(graph, value, TouchFlags::BASE_TYPE)
    }

    /// Record that a value's type or generation changed
    pub fn touch_set_infoed(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
    ) -> Result<(), TouchError> {
        self.touch_flag(graph, value, TouchFlags::SET_INFOED)
    }

    fn touch_flag(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
        flag: TouchFlags,
    ) -> Result<(), TouchError> {
        let object = graph.require_value(value)?.object;
        if !self.applies(graph, object) {
            return Ok(());
        }
        let id = self.ensure_entry(graph, value)?;
        let entry = self.entry_mut(id)?;
        if !entry.flags.contains(flag) {
            tracing::trace!(target: "bento::touch", ?value, ?flag, "Touched value");
        }
        entry.flags.insert(flag);
        Ok(())
    }

    /// Record a value created in this session on a target object
    ///
    /// The entry's address follows the value on later moves, and deleting
    /// the value drops the entry.
    pub fn touch_new_value(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
    ) -> Result<(), TouchError> {
        let header = graph.require_value(value)?;
        if !self.applies(graph, header.object) {
            return Ok(());
        }
        let mut flags = TouchFlags::NEW_VALUE | TouchFlags::SET_INFOED;
        if header.property == BASE_TYPES_PROPERTY {
            flags |= TouchFlags::BASE_TYPE;
        } else if header.is_immediate() {
            flags |= TouchFlags::IMMEDIATE;
        } else {
            flags |= TouchFlags::EDITED;
        }
        let opt = Opt::new(header.object, header.property, header.type_id);
        self.reserve(1)?;
        let id = self.alloc(TouchEntry {
            opt,
            flags,
            value: Some(value),
            removed: None,
            inline_origin: true,
            object: opt.object,
            prev: None,
            next: None,
        });
        self.by_value.insert(value, id);
        self.link(opt.object, id);
        tracing::debug!(target: "bento::touch", opt = %opt, "Recorded new value");
        Ok(())
    }

    // ========================================================================
    // Moves
    // ========================================================================

    /// Record a move of `value` to `to_property` of `to_object`
    ///
    /// Must be called before the value is relocated, while its current
    /// location is still readable from its header.
    pub fn touch_moved(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
        to_object: ObjectId,
        to_property: PropertyId,
    ) -> Result<(), TouchError> {
        let header = graph.require_value(value)?;
        let from_object = header.object;
        if !self.applies(graph, from_object) {
            return Ok(());
        }

        let existing = self.entry_for_value(value);
        if let Some(id) = existing {
            if self.entry_ref(id)?.flags.contains(TouchFlags::NEW_VALUE) {
                return self.follow_new_value(id, to_object, to_property);
            }
        }

        let (state, original) = match existing {
            Some(id) => {
                let entry = self.entry_ref(id)?;
                if entry.flags.contains(TouchFlags::INSERTED) {
                    let state = if entry.removed.is_some() { 2 } else { 1 };
                    (state, (entry.opt.object, entry.opt.property))
                } else {
                    (0, (from_object, header.property))
                }
            }
            None => (0, (from_object, header.property)),
        };

        let to_original_object = to_object == original.0;
        let to_original = to_original_object && to_property == original.1;

        match state {
            0 => {
                if to_original {
                    return Ok(());
                }
                if to_original_object {
                    let id = self.ensure_entry(graph, value)?;
                    self.entry_mut(id)?.flags.insert(TouchFlags::INSERTED);
                    tracing::debug!(target: "bento::touch", ?value, "Move 0 -> 1");
                } else {
                    let needed = if existing.is_some() { 1 } else { 2 };
                    self.reserve(needed)?;
                    let id = self.ensure_entry(graph, value)?;
                    let removed = self.create_removed(id)?;
                    let entry = self.entry_mut(id)?;
                    entry.flags.insert(TouchFlags::INSERTED);
                    entry.removed = Some(removed);
                    self.relocate(id, to_object)?;
                    tracing::debug!(target: "bento::touch", ?value, to = %to_object, "Move 0 -> 2");
                }
            }
            1 => {
                let id = existing.ok_or(TouchError::Graph(GraphError::MissingValue(value)))?;
                if to_original {
                    self.drop_inserted(id)?;
                    tracing::debug!(target: "bento::touch", ?value, "Move 1 -> 0");
                } else if !to_original_object {
                    self.reserve(1)?;
                    let removed = self.create_removed(id)?;
                    self.entry_mut(id)?.removed = Some(removed);
                    self.relocate(id, to_object)?;
                    tracing::debug!(target: "bento::touch", ?value, to = %to_object, "Move 1 -> 2");
                }
            }
            _ => {
                let id = existing.ok_or(TouchError::Graph(GraphError::MissingValue(value)))?;
                if to_original_object {
                    self.relocate(id, original.0)?;
                    let removed = self.entry_mut(id)?.removed.take();
                    if let Some(removed) = removed {
                        self.free_entry(removed);
                    }
                    if to_original {
                        self.drop_inserted(id)?;
                        tracing::debug!(target: "bento::touch", ?value, "Move 2 -> 0");
                    } else {
                        tracing::debug!(target: "bento::touch", ?value, "Move 2 -> 1");
                    }
                } else if to_object != from_object {
                    self.relocate(id, to_object)?;
                    tracing::debug!(target: "bento::touch", ?value, to = %to_object, "Move 2 -> 2");
                }
            }
        }
        Ok(())
    }

    fn follow_new_value(
        &mut self,
        id: TouchId,
        to_object: ObjectId,
        to_property: PropertyId,
    ) -> Result<(), TouchError> {
        let entry = self.entry_mut(id)?;
        entry.opt.object = to_object;
        entry.opt.property = to_property;
        if entry.object != to_object {
            self.relocate(id, to_object)?;
        }
        Ok(())
    }

    fn create_removed(&mut self, inserted: TouchId) -> Result<TouchId, TouchError> {
        let (opt, inline_origin) = {
            let entry = self.entry_ref(inserted)?;
            (entry.opt, entry.inline_origin)
        };
        self.reserve(1)?;
        let id = self.alloc(TouchEntry {
            opt,
            flags: TouchFlags::REMOVED,
            value: None,
            removed: None,
            inline_origin,
            object: opt.object,
            prev: None,
            next: None,
        });
        self.link(opt.object, id);
        Ok(id)
    }

    fn drop_inserted(&mut self, id: TouchId) -> Result<(), TouchError> {
        let entry = self.entry_mut(id)?;
        entry.flags.remove(TouchFlags::INSERTED);
        if !entry.flags.intersects(TouchFlags::DATA) {
            self.free_entry(id);
        }
        Ok(())
    }

    // ========================================================================
    // Deletions
    // ========================================================================

    /// Record an explicit deletion of a value
    pub fn touch_deleted_value(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
    ) -> Result<(), TouchError> {
        self.delete_value(graph, value, false)
    }

    /// Record a deletion of a value caused by deleting its property or
    /// object
    ///
    /// Unlike an explicit deletion, a value still at its original location
    /// leaves nothing behind, since the enclosing deletion covers it.
    pub fn touch_implicit_deleted_value(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
    ) -> Result<(), TouchError> {
        self.delete_value(graph, value, true)
    }

    fn delete_value(
        &mut self,
        graph: &ObjectGraph,
        value: ValueId,
        implicit: bool,
    ) -> Result<(), TouchError> {
        let object = graph.require_value(value)?.object;
        if !self.applies(graph, object) {
            return Ok(());
        }
        match self.entry_for_value(value) {
            Some(id) => {
                let entry = self.entry_ref(id)?;
                let flags = entry.flags;
                let removed = entry.removed;
                if flags.contains(TouchFlags::NEW_VALUE) {
                    self.free_entry(id);
                } else if let Some(removed) = removed {
                    self.entry_mut(removed)?.flags = TouchFlags::DELETED_VALUE;
                    self.free_entry(id);
                } else if flags.contains(TouchFlags::INSERTED) || !implicit {
                    self.mark_deleted_value(id, value)?;
                } else {
                    self.free_entry(id);
                }
            }
            None if !implicit => {
                let id = self.ensure_entry(graph, value)?;
                self.mark_deleted_value(id, value)?;
            }
            None => {}
        }
        tracing::debug!(target: "bento::touch", ?value, implicit, "Recorded value deletion");
        Ok(())
    }

    fn mark_deleted_value(&mut self, id: TouchId, value: ValueId) -> Result<(), TouchError> {
        let entry = self.entry_mut(id)?;
        entry.flags = TouchFlags::DELETED_VALUE;
        entry.value = None;
        self.by_value.remove(&value);
        Ok(())
    }

    /// Record deletion of a property
    ///
    /// Properties created in this session leave nothing to record. A
    /// second deletion of the same property is a no-op.
    pub fn touch_deleted_property(
        &mut self,
        graph: &ObjectGraph,
        object: ObjectId,
        property: PropertyId,
    ) -> Result<(), TouchError> {
        if !self.applies(graph, object) {
            return Ok(());
        }
        let created = graph
            .property(object, property)
            .map(|p| p.created)
            .unwrap_or(false);
        if created || self.is_property_deleted(object, property) {
            return Ok(());
        }
        self.reserve(1)?;
        let id = self.alloc(TouchEntry {
            opt: Opt::property(object, property),
            flags: TouchFlags::DELETED_PROPERTY,
            value: None,
            removed: None,
            inline_origin: false,
            object,
            prev: None,
            next: None,
        });
        self.link(object, id);
        tracing::debug!(target: "bento::touch", %object, %property, "Recorded property deletion");
        Ok(())
    }

    /// Record deletion of an object
    ///
    /// Called after every value and property of the object went through
    /// the deletion touches. Frees the object's entries except removed
    /// ones, which inserted entries elsewhere still pair with, and keeps
    /// the object on the touched chain.
    pub fn touch_deleted_object(
        &mut self,
        graph: &ObjectGraph,
        object: ObjectId,
    ) -> Result<(), TouchError> {
        if !self.applies(graph, object) {
            return Ok(());
        }
        for id in self.entries_of(object) {
            let (flags, removed) = {
                let entry = self.entry_ref(id)?;
                (entry.flags, entry.removed)
            };
            if flags.contains(TouchFlags::REMOVED) {
                continue;
            }
            if let Some(removed) = removed {
                self.entry_mut(removed)?.flags = TouchFlags::DELETED_VALUE;
            }
            self.free_entry(id);
        }
        self.ensure_on_chain(object);
        tracing::debug!(target: "bento::touch", %object, "Recorded object deletion");
        Ok(())
    }

    /// Free an object's whole touched list and drop it from the chain
    pub fn delete_touched_list(&mut self, object: ObjectId) {
        for id in self.entries_of(object) {
            self.free_entry(id);
        }
        self.lists.remove(&object);
        self.chain.retain(|o| *o != object);
    }

    /// Free every entry of every object
    pub fn teardown(&mut self) {
        for object in self.touched_objects() {
            self.delete_touched_list(object);
        }
    }

    /// Drop an object from the chain if its list is empty
    ///
    /// Returns whether the object left the chain.
    pub fn release_if_empty(&mut self, object: ObjectId) -> bool {
        let empty = self.lists.get(&object).map(|l| l.len == 0).unwrap_or(true);
        if empty {
            self.lists.remove(&object);
            self.chain.retain(|o| *o != object);
        }
        empty
    }

    // ========================================================================
    // Arena and list plumbing
    // ========================================================================

    fn ensure_entry(&mut self, graph: &ObjectGraph, value: ValueId) -> Result<TouchId, TouchError> {
        if let Some(id) = self.entry_for_value(value) {
            return Ok(id);
        }
        let header = graph.require_value(value)?;
        let opt = Opt::new(header.object, header.property, header.type_id);
        let inline_origin = header.is_immediate();
        self.reserve(1)?;
        let id = self.alloc(TouchEntry {
            opt,
            flags: TouchFlags::empty(),
            value: Some(value),
            removed: None,
            inline_origin,
            object: opt.object,
            prev: None,
            next: None,
        });
        self.by_value.insert(value, id);
        self.link(opt.object, id);
        tracing::debug!(target: "bento::touch", opt = %opt, "Created touch entry");
        Ok(id)
    }

    fn reserve(&self, count: usize) -> Result<(), TouchError> {
        match self.limit {
            Some(limit) if self.live + count > limit => Err(TouchError::Exhausted { limit }),
            _ => Ok(()),
        }
    }

    fn alloc(&mut self, entry: TouchEntry) -> TouchId {
        self.live += 1;
        match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                TouchId(slot)
            }
            None => {
                self.entries.push(Some(entry));
                TouchId((self.entries.len() - 1) as u32)
            }
        }
    }

    /// Unlink and free an entry
    ///
    /// Freeing an inserted entry does not touch its paired removed entry.
    pub fn free_entry(&mut self, id: TouchId) {
        if self.entry(id).is_none() {
            return;
        }
        self.unlink(id);
        if let Some(entry) = self.entries[id.0 as usize].take() {
            if let Some(value) = entry.value {
                if self.by_value.get(&value) == Some(&id) {
                    self.by_value.remove(&value);
                }
            }
            self.free.push(id.0);
            self.live -= 1;
        }
    }

    fn entry_ref(&self, id: TouchId) -> Result<&TouchEntry, TouchError> {
        self.entry(id).ok_or(TouchError::Dangling(id))
    }

    fn entry_mut(&mut self, id: TouchId) -> Result<&mut TouchEntry, TouchError> {
        self.entries
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(TouchError::Dangling(id))
    }

    fn ensure_on_chain(&mut self, object: ObjectId) {
        if !self.lists.contains_key(&object) {
            self.lists.insert(object, TouchList::default());
            self.chain.push(object);
        }
    }

    fn link(&mut self, object: ObjectId, id: TouchId) {
        self.ensure_on_chain(object);
        let tail = self.lists.get(&object).and_then(|l| l.tail);
        if let Some(Some(entry)) = self.entries.get_mut(id.0 as usize) {
            entry.object = object;
            entry.prev = tail;
            entry.next = None;
        }
        if let Some(tail) = tail {
            if let Some(Some(prev)) = self.entries.get_mut(tail.0 as usize) {
                prev.next = Some(id);
            }
        }
        if let Some(list) = self.lists.get_mut(&object) {
            if list.head.is_none() {
                list.head = Some(id);
            }
            list.tail = Some(id);
            list.len += 1;
        }
    }

    fn unlink(&mut self, id: TouchId) {
        let (object, prev, next) = match self.entry(id) {
            Some(entry) => (entry.object, entry.prev, entry.next),
            None => return,
        };
        if let Some(prev) = prev {
            if let Some(Some(entry)) = self.entries.get_mut(prev.0 as usize) {
                entry.next = next;
            }
        }
        if let Some(next) = next {
            if let Some(Some(entry)) = self.entries.get_mut(next.0 as usize) {
                entry.prev = prev;
            }
        }
        if let Some(list) = self.lists.get_mut(&object) {
            if list.head == Some(id) {
                list.head = next;
            }
            if list.tail == Some(id) {
                list.tail = prev;
            }
            list.len = list.len.saturating_sub(1);
        }
        if let Some(Some(entry)) = self.entries.get_mut(id.0 as usize) {
            entry.prev = None;
            entry.next = None;
        }
    }

    fn relocate(&mut self, id: TouchId, to_object: ObjectId) -> Result<(), TouchError> {
        if self.entry_ref(id)?.object == to_object {
            return Ok(());
        }
        self.unlink(id);
        self.link(to_object, id);
        Ok(())
    }
}
