//! Update-log wire format for Bento containers
//!
//! An updating container records its edits as binary instruction streams:
//!
//! - One value stream per touched object, stored in that object's updates
//!   property, grouping value operations under `NewProperty`/`NewType`
//!   headers
//! - One delete-list stream on the control object, holding the structural
//!   deletions that are replayed after every value stream
//!
//! This crate only knows the bytes. Generating instructions from touch
//! records and replaying them against a container lives in the engine.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;

pub use format::{
    decode_stream, encode_stream, DataRef, FormatVersion, Instruction, InstructionReader,
    InstructionWriter, LogError, Opcode,
};
