//! Update sessions for Bento containers
//!
//! This crate ties the lower layers together:
//! - Containers: open a target, edit it in an updating session, close the
//!   session into an update image, replay images on later opens
//! - Touch tracking: per-session change records, including the move FSM
//! - Segment editing: byte-range edits on value segment chains that keep
//!   logical offsets consistent
//! - Update generation and replay over the binary instruction format
//!
//! The engine is the only component that knows about:
//! - Session lifecycle and write modes
//! - How touch records become instruction streams and back
//! - Persisted target and update images

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod container;
pub mod editor;
mod guard;
pub mod image;
pub mod touch;
pub mod updates;

pub use config::{ConfigError, ContainerConfig};
pub use container::{Container, ValueContents};
pub use editor::{EditError, SegmentEditor, SegmentPos, SegmentReader};
pub use image::{
    ByteRange, ObjectSnapshot, Target, TargetBuilder, UpdateImage, UpdateStream, ValueSnapshot,
};
pub use touch::{TouchEntry, TouchError, TouchFlags, TouchId, TouchTracker};
pub use updates::diff_segments;
