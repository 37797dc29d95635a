//! Binary update-log formats
//!
//! - `opcode`: control byte values of update instructions
//! - `instruction`: decoded instructions and their big-endian encoding

pub mod instruction;
pub mod opcode;

pub use instruction::{
    decode_stream, encode_stream, DataRef, FormatVersion, Instruction, InstructionReader,
    InstructionWriter, LogError,
};
pub use opcode::Opcode;
