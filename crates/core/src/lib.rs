//! Core types for Bento containers
//!
//! This crate defines the foundational types used throughout the system:
//! - ObjectId, PropertyId, TypeId: Stable ids of the object graph
//! - ContainerId: Byte layer index (target and update layers)
//! - Opt: (object, property, type) address of a value
//! - Error: Error type hierarchy and reportable error codes
//! - ErrorReporter: The single channel every reported condition goes through
//! - Limits: Reserved ids and fixed format constants

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod reporter;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use limits::{
    is_update_log_property, BASE_TYPES_PROPERTY, CONTROL_OBJECT_ID, DELETE_LIST_PROPERTY,
    FIRST_USER_ID, IMMEDIATE_CAPACITY, MAX_ERROR_INSERTS, UPDATES_PROPERTY, UPDATES_TYPE,
};
pub use reporter::{raise, CollectingReporter, ErrorReporter, Report, TracingReporter};
pub use types::{ContainerId, ObjectId, Opt, PropertyId, TypeId};
