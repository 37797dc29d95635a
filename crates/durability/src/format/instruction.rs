//! Update instruction encoding and decoding
//!
//! An update stream is a flat sequence of instructions, each a control byte
//! followed by fixed-width big-endian operands:
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────┐
//! │ Control (1)  │ Operands (fixed per opcode, big-endian)   │
//! └──────────────┴───────────────────────────────────────────┘
//! ```
//!
//! Two streams exist per update session. Each touched object carries a
//! value stream of `[NewProperty|NewType] <value-op>...` groups, and the
//! control object carries one delete-list stream of `DeleteObject` and
//! `DeleteProperty1`/`DeleteProperty2` instructions. Both end with
//! `EndUpdates`.
//!
//! The legacy container format encodes the `SetInfoedValue` generation in
//! two bytes instead of four.

use crate::format::opcode::Opcode;
use bento_core::{ObjectId, Opt, PropertyId, TypeId, IMMEDIATE_CAPACITY};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Container format revision, selecting operand widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatVersion {
    /// Two-byte generation operands
    Legacy,
    /// Four-byte generation operands
    #[default]
    Current,
}

/// A byte range of inserted data in the updating container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRef {
    /// Offset in the updating container
    pub offset: u32,
    /// Length in bytes
    pub len: u32,
}

/// One decoded update instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// End of stream
    EndUpdates,
    /// Switch current property and type
    NewProperty {
        /// New current property
        property: PropertyId,
        /// New current type
        type_id: TypeId,
    },
    /// Switch current type on the same property
    NewType {
        /// New current type
        type_id: TypeId,
    },
    /// Delete an object
    DeleteObject {
        /// Deleted object
        object: ObjectId,
    },
    /// Delete a property, naming its object
    DeleteProperty1 {
        /// Owning object
        object: ObjectId,
        /// Deleted property
        property: PropertyId,
    },
    /// Delete another property of the previous object
    DeleteProperty2 {
        /// Deleted property
        property: PropertyId,
    },
    /// The value was moved away from the current address
    RemovedValue,
    /// The value at `from` was moved to the current address
    InsertedValue {
        /// Original address of the value
        from: Opt,
    },
    /// The value's type and generation changed
    SetInfoedValue {
        /// New type
        type_id: TypeId,
        /// New generation
        generation: u32,
    },
    /// Delete `amount` bytes at `offset`
    DeleteData {
        /// Start of the deleted range
        offset: u32,
        /// Number of bytes
        amount: u32,
    },
    /// Insert one data range at `insert_point`
    InsertData1 {
        /// Insertion offset in the value
        insert_point: u32,
        /// Inserted data
        data: DataRef,
    },
    /// Insert consecutive data ranges at `insert_point`
    InsertDataN {
        /// Insertion offset in the value
        insert_point: u32,
        /// Inserted data, in order
        data: SmallVec<[DataRef; 4]>,
    },
    /// Replace the whole immediate value
    ReplaceImmediate {
        /// Number of meaningful bytes
        len: u8,
        /// Inline bytes
        value: [u8; IMMEDIATE_CAPACITY],
    },
    /// Replace a base type array
    ReplaceBaseType {
        /// New base types, in order
        types: SmallVec<[TypeId; 4]>,
    },
    /// Delete the value
    DeleteValue,
}

impl Instruction {
    /// Control byte of this instruction
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::EndUpdates => Opcode::EndUpdates,
            Instruction::NewProperty { .. } => Opcode::NewProperty,
            Instruction::NewType { .. } => Opcode::NewType,
            Instruction::DeleteObject { .. } => Opcode::DeleteObject,
            Instruction::DeleteProperty1 { .. } => Opcode::DeleteProperty1,
            Instruction::DeleteProperty2 { .. } => Opcode::DeleteProperty2,
            Instruction::RemovedValue => Opcode::RemovedValue,
            Instruction::InsertedValue { .. } => Opcode::InsertedValue,
            Instruction::SetInfoedValue { .. } => Opcode::SetInfoedValue,
            Instruction::DeleteData { .. } => Opcode::DeleteData,
            Instruction::InsertData1 { .. } => Opcode::InsertData1,
            Instruction::InsertDataN { .. } => Opcode::InsertDataN,
            Instruction::ReplaceImmediate { .. } => Opcode::ReplaceImmediate,
            Instruction::ReplaceBaseType { .. } => Opcode::ReplaceBaseType,
            Instruction::DeleteValue => Opcode::DeleteValue,
        }
    }

    /// Build the cheapest insert instruction for a run of data ranges
    ///
    /// Returns `None` for an empty run.
    pub fn insert_data(insert_point: u32, data: &[DataRef]) -> Option<Self> {
        match data {
            [] => None,
            [single] => Some(Instruction::InsertData1 {
                insert_point,
                data: *single,
            }),
            many => Some(Instruction::InsertDataN {
                insert_point,
                data: many.iter().copied().collect(),
            }),
        }
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self, format: FormatVersion) -> usize {
        1 + match self {
            Instruction::EndUpdates | Instruction::RemovedValue | Instruction::DeleteValue => 0,
            Instruction::NewProperty { .. } => 8,
            Instruction::NewType { .. } => 4,
            Instruction::DeleteObject { .. } => 4,
            Instruction::DeleteProperty1 { .. } => 8,
            Instruction::DeleteProperty2 { .. } => 4,
            Instruction::InsertedValue { .. } => 12,
            Instruction::SetInfoedValue { .. } => match format {
                FormatVersion::Legacy => 6,
                FormatVersion::Current => 8,
            },
            Instruction::DeleteData { .. } => 8,
            Instruction::InsertData1 { .. } => 12,
            Instruction::InsertDataN { data, .. } => 8 + 8 * data.len(),
            Instruction::ReplaceImmediate { .. } => 1 + IMMEDIATE_CAPACITY,
            Instruction::ReplaceBaseType { types } => 2 + 4 * types.len(),
        }
    }

    /// Write this instruction
    pub fn encode<W: Write>(&self, writer: &mut W, format: FormatVersion) -> Result<(), LogError> {
        writer.write_u8(self.opcode().to_byte())?;
        match self {
            Instruction::EndUpdates | Instruction::RemovedValue | Instruction::DeleteValue => {}
            Instruction::NewProperty { property, type_id } => {
                writer.write_u32::<BigEndian>(property.get())?;
                writer.write_u32::<BigEndian>(type_id.get())?;
            }
            Instruction::NewType { type_id } => {
                writer.write_u32::<BigEndian>(type_id.get())?;
            }
            Instruction::DeleteObject { object } => {
                writer.write_u32::<BigEndian>(object.get())?;
            }
            Instruction::DeleteProperty1 { object, property } => {
                writer.write_u32::<BigEndian>(object.get())?;
                writer.write_u32::<BigEndian>(property.get())?;
            }
            Instruction::DeleteProperty2 { property } => {
                writer.write_u32::<BigEndian>(property.get())?;
            }
            Instruction::InsertedValue { from } => {
                writer.write_u32::<BigEndian>(from.object.get())?;
                writer.write_u32::<BigEndian>(from.property.get())?;
                writer.write_u32::<BigEndian>(from.type_id.get())?;
            }
            Instruction::SetInfoedValue {
                type_id,
                generation,
            } => {
                writer.write_u32::<BigEndian>(type_id.get())?;
                match format {
                    FormatVersion::Legacy => {
                        let narrow = u16::try_from(*generation)
                            .map_err(|_| LogError::GenerationOutOfRange(*generation))?;
                        writer.write_u16::<BigEndian>(narrow)?;
                    }
                    FormatVersion::Current => writer.write_u32::<BigEndian>(*generation)?,
                }
            }
            Instruction::DeleteData { offset, amount } => {
                writer.write_u32::<BigEndian>(*offset)?;
                writer.write_u32::<BigEndian>(*amount)?;
            }
            Instruction::InsertData1 { insert_point, data } => {
                writer.write_u32::<BigEndian>(*insert_point)?;
                writer.write_u32::<BigEndian>(data.offset)?;
                writer.write_u32::<BigEndian>(data.len)?;
            }
            Instruction::InsertDataN { insert_point, data } => {
                let count = u32::try_from(data.len())
                    .map_err(|_| LogError::InvalidOperand("too many insert ranges"))?;
                writer.write_u32::<BigEndian>(*insert_point)?;
                writer.write_u32::<BigEndian>(count)?;
                for range in data {
                    writer.write_u32::<BigEndian>(range.offset)?;
                    writer.write_u32::<BigEndian>(range.len)?;
                }
            }
            Instruction::ReplaceImmediate { len, value } => {
                if *len as usize > IMMEDIATE_CAPACITY {
                    return Err(LogError::InvalidOperand("immediate length"));
                }
                writer.write_u8(*len)?;
                writer.write_all(value)?;
            }
            Instruction::ReplaceBaseType { types } => {
                let count = u16::try_from(types.len())
                    .map_err(|_| LogError::InvalidOperand("too many base types"))?;
                writer.write_u16::<BigEndian>(count)?;
                for type_id in types {
                    writer.write_u32::<BigEndian>(type_id.get())?;
                }
            }
        }
        Ok(())
    }

    /// Read one instruction
    pub fn decode<R: Read>(reader: &mut R, format: FormatVersion) -> Result<Self, LogError> {
        let control = reader.read_u8()?;
        let opcode = Opcode::from_byte(control).ok_or(LogError::UnknownOpcode(control))?;
        let instruction = match opcode {
            Opcode::EndUpdates => Instruction::EndUpdates,
            Opcode::NewProperty => Instruction::NewProperty {
                property: PropertyId(reader.read_u32::<BigEndian>()?),
                type_id: TypeId(reader.read_u32::<BigEndian>()?),
            },
            Opcode::NewType => Instruction::NewType {
                type_id: TypeId(reader.read_u32::<BigEndian>()?),
            },
            Opcode::DeleteObject => Instruction::DeleteObject {
                object: ObjectId(reader.read_u32::<BigEndian>()?),
            },
            Opcode::DeleteProperty1 => Instruction::DeleteProperty1 {
                object: ObjectId(reader.read_u32::<BigEndian>()?),
                property: PropertyId(reader.read_u32::<BigEndian>()?),
            },
            Opcode::DeleteProperty2 => Instruction::DeleteProperty2 {
                property: PropertyId(reader.read_u32::<BigEndian>()?),
            },
            Opcode::RemovedValue => Instruction::RemovedValue,
            Opcode::InsertedValue => Instruction::InsertedValue {
                from: Opt::new(
                    ObjectId(reader.read_u32::<BigEndian>()?),
                    PropertyId(reader.read_u32::<BigEndian>()?),
                    TypeId(reader.read_u32::<BigEndian>()?),
                ),
            },
            Opcode::SetInfoedValue => Instruction::SetInfoedValue {
                type_id: TypeId(reader.read_u32::<BigEndian>()?),
                generation: match format {
                    FormatVersion::Legacy => reader.read_u16::<BigEndian>()? as u32,
                    FormatVersion::Current => reader.read_u32::<BigEndian>()?,
                },
            },
            Opcode::DeleteData => Instruction::DeleteData {
                offset: reader.read_u32::<BigEndian>()?,
                amount: reader.read_u32::<BigEndian>()?,
            },
            Opcode::InsertData1 => Instruction::InsertData1 {
                insert_point: reader.read_u32::<BigEndian>()?,
                data: read_data_ref(reader)?,
            },
            Opcode::InsertDataN => {
                let insert_point = reader.read_u32::<BigEndian>()?;
                let count = reader.read_u32::<BigEndian>()?;
                let mut data = SmallVec::new();
                for _ in 0..count {
                    data.push(read_data_ref(reader)?);
                }
                Instruction::InsertDataN { insert_point, data }
            }
            Opcode::ReplaceImmediate => {
                let len = reader.read_u8()?;
                if len as usize > IMMEDIATE_CAPACITY {
                    return Err(LogError::InvalidOperand("immediate length"));
                }
                let mut value = [0u8; IMMEDIATE_CAPACITY];
                reader.read_exact(&mut value)?;
                Instruction::ReplaceImmediate { len, value }
            }
            Opcode::ReplaceBaseType => {
                let count = reader.read_u16::<BigEndian>()?;
                let mut types = SmallVec::new();
                for _ in 0..count {
                    types.push(TypeId(reader.read_u32::<BigEndian>()?));
                }
                Instruction::ReplaceBaseType { types }
            }
            Opcode::DeleteValue => Instruction::DeleteValue,
        };
        Ok(instruction)
    }
}

fn read_data_ref<R: Read>(reader: &mut R) -> Result<DataRef, LogError> {
    Ok(DataRef {
        offset: reader.read_u32::<BigEndian>()?,
        len: reader.read_u32::<BigEndian>()?,
    })
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::NewProperty { property, type_id } => {
                write!(f, "NewProperty({}, {})", property, type_id)
            }
            Instruction::NewType { type_id } => write!(f, "NewType({})", type_id),
            Instruction::DeleteObject { object } => write!(f, "DeleteObject({})", object),
            Instruction::DeleteProperty1 { object, property } => {
                write!(f, "DeleteProperty1({}, {})", object, property)
            }
            Instruction::DeleteProperty2 { property } => write!(f, "DeleteProperty2({})", property),
            Instruction::InsertedValue { from } => write!(f, "InsertedValue{}", from),
            Instruction::SetInfoedValue {
                type_id,
                generation,
            } => write!(f, "SetInfoedValue({}, {})", type_id, generation),
            Instruction::DeleteData { offset, amount } => {
                write!(f, "DeleteData({}, {})", offset, amount)
            }
            Instruction::InsertData1 { insert_point, data } => write!(
                f,
                "InsertData1({}, {}, {})",
                insert_point, data.offset, data.len
            ),
            Instruction::InsertDataN { insert_point, data } => {
                write!(f, "InsertDataN({}, {})", insert_point, data.len())
            }
            Instruction::ReplaceImmediate { len, .. } => write!(f, "ReplaceImmediate({})", len),
            Instruction::ReplaceBaseType { types } => write!(f, "ReplaceBaseType({})", types.len()),
            other => write!(f, "{}", other.opcode()),
        }
    }
}

/// Update stream encoding errors
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying read or write failed; a short read means a truncated stream
    #[error("update stream I/O: {0}")]
    Io(#[from] io::Error),

    /// Control byte is not a known opcode
    #[error("unknown update control byte 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Generation does not fit the format's operand width
    #[error("generation {0} does not fit the legacy format")]
    GenerationOutOfRange(u32),

    /// Operand outside its encodable range
    #[error("invalid operand: {0}")]
    InvalidOperand(&'static str),
}

impl LogError {
    /// Whether the stream ended in the middle of an instruction
    pub fn is_truncated(&self) -> bool {
        matches!(self, LogError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Streaming instruction writer over any `Write`
#[derive(Debug)]
pub struct InstructionWriter<W: Write> {
    writer: W,
    format: FormatVersion,
    written: usize,
}

impl<W: Write> InstructionWriter<W> {
    /// Create a writer
    pub fn new(writer: W, format: FormatVersion) -> Self {
        InstructionWriter {
            writer,
            format,
            written: 0,
        }
    }

    /// Append one instruction
    pub fn write(&mut self, instruction: &Instruction) -> Result<(), LogError> {
        instruction.encode(&mut self.writer, self.format)?;
        self.written += 1;
        Ok(())
    }

    /// Number of instructions written
    pub fn written(&self) -> usize {
        self.written
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Streaming instruction reader over any `Read`
///
/// Yields instructions up to and excluding `EndUpdates`. Running out of
/// input before `EndUpdates` is an error, since the format has no other
/// way to mark the end of a stream.
#[derive(Debug)]
pub struct InstructionReader<R: Read> {
    reader: R,
    format: FormatVersion,
    finished: bool,
    decoded: usize,
}

impl<R: Read> InstructionReader<R> {
    /// Create a reader
    pub fn new(reader: R, format: FormatVersion) -> Self {
        InstructionReader {
            reader,
            format,
            finished: false,
            decoded: 0,
        }
    }

    /// Number of instructions decoded so far, excluding `EndUpdates`
    pub fn decoded(&self) -> usize {
        self.decoded
    }

    /// Read the next instruction, `None` after `EndUpdates`
    pub fn next_instruction(&mut self) -> Result<Option<Instruction>, LogError> {
        if self.finished {
            return Ok(None);
        }
        let instruction = match Instruction::decode(&mut self.reader, self.format) {
            Ok(instruction) => instruction,
            Err(e) => {
                tracing::warn!(
                    target: "bento::update",
                    decoded = self.decoded,
                    truncated = e.is_truncated(),
                    error = %e,
                    "Update stream decode failed"
                );
                return Err(e);
            }
        };
        match instruction {
            Instruction::EndUpdates => {
                self.finished = true;
                tracing::trace!(target: "bento::update", instructions = self.decoded, "Reached end of update stream");
                Ok(None)
            }
            instruction => {
                self.decoded += 1;
                Ok(Some(instruction))
            }
        }
    }
}

impl<R: Read> Iterator for InstructionReader<R> {
    type Item = Result<Instruction, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_instruction() {
            Ok(Some(instruction)) => Some(Ok(instruction)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Encode a whole stream, appending `EndUpdates`
pub fn encode_stream(instructions: &[Instruction], format: FormatVersion) -> Result<Vec<u8>, LogError> {
    let mut writer = InstructionWriter::new(Vec::new(), format);
    for instruction in instructions {
        writer.write(instruction)?;
    }
    writer.write(&Instruction::EndUpdates)?;
    Ok(writer.into_inner())
}

/// Decode a whole stream up to `EndUpdates`
pub fn decode_stream(bytes: &[u8], format: FormatVersion) -> Result<Vec<Instruction>, LogError> {
    InstructionReader::new(bytes, format).collect()
}
