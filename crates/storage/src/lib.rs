//! Segment store for Bento containers
//!
//! This crate implements the storage collaborators the update machinery
//! works against:
//! - ObjectGraph: objects, properties and value headers with segment chains
//! - Segment: immediate, global name and stored data descriptors
//! - Layers: the target and update byte layers of a container
//! - FreeSpace: hole-reusing allocator for the updating layer
//! - BufferPool: RAII update-stream buffers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod free_space;
pub mod graph;
pub mod layers;
pub mod segment;

pub use buffer::{BufferPool, IoBuffer};
pub use free_space::FreeSpace;
pub use graph::{GraphError, Object, ObjectGraph, Property, ValueHeader, ValueId};
pub use layers::{ByteStore, LayerError, Layers};
pub use segment::{NameId, Segment, SegmentData};
