//! Bento - incremental update layers for object/property/value containers
//!
//! A Bento container stores objects, each with properties, each with values
//! of distinct types. Instead of rewriting a container to change it, an
//! updating session records its edits and writes them out as an update
//! image: a byte layer plus instruction streams that replay the edits on
//! top of the unchanged target.
//!
//! # Quick Start
//!
//! ```ignore
//! use bento::{Container, ContainerConfig, TargetBuilder, PropertyId, TypeId};
//!
//! let mut builder = TargetBuilder::new();
//! let doc = builder.object();
//! builder.value(doc, PropertyId(0x50), TypeId(0x60), b"hello")?;
//! let target = builder.build();
//!
//! // Edit in an updating session
//! let mut session = Container::open_for_update(target.clone(), ContainerConfig::default())?;
//! let value = session.value(doc, PropertyId(0x50), TypeId(0x60)).unwrap();
//! session.insert_value_data(value, 5, b", world")?;
//! let image = session.close()?;
//!
//! // Replay the edits on the unchanged target
//! let container = Container::open_with_updates(target, &image, ContainerConfig::default())?;
//! ```
//!
//! # Architecture
//!
//! - `bento-core`: ids, error codes and the error reporter
//! - `bento-storage`: object graph, segment chains, byte layers
//! - `bento-durability`: the binary update instruction format
//! - `bento-engine`: sessions, touch tracking, update generation and replay

pub use bento_core::{
    CollectingReporter, ContainerId, Error, ErrorCode, ErrorReporter, ObjectId, Opt, PropertyId,
    Result, TracingReporter, TypeId, BASE_TYPES_PROPERTY, CONTROL_OBJECT_ID,
};
pub use bento_durability::FormatVersion;
pub use bento_engine::{
    ConfigError, Container, ContainerConfig, Target, TargetBuilder, UpdateImage, ValueContents,
};
pub use bento_storage::{ValueHeader, ValueId};
