//! Update Stream Format Tests
//!
//! Byte-level checks of whole update streams: the exact layout of a value
//! stream and a delete list, reading through short reads, and decoding of
//! arbitrary input without panicking.

use bento_core::{ObjectId, Opt, PropertyId, TypeId};
use bento_durability::{
    decode_stream, encode_stream, DataRef, FormatVersion, Instruction, InstructionReader,
    LogError, Opcode,
};
use proptest::prelude::*;
use smallvec::smallvec;
use std::io::{self, Read};

/// Reader that hands out one byte per call
struct Trickle<'a>(&'a [u8]);

impl Read for Trickle<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match (self.0.split_first(), out.first_mut()) {
            (Some((byte, rest)), Some(slot)) => {
                *slot = *byte;
                self.0 = rest;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

fn sample_value_stream() -> Vec<Instruction> {
    vec![
        Instruction::NewProperty {
            property: PropertyId(0x50),
            type_id: TypeId(0x60),
        },
        Instruction::DeleteData {
            offset: 30,
            amount: 20,
        },
        Instruction::InsertData1 {
            insert_point: 30,
            data: DataRef {
                offset: 0x100,
                len: 10,
            },
        },
        Instruction::NewType {
            type_id: TypeId(0x61),
        },
        Instruction::InsertedValue {
            from: Opt::new(ObjectId(0x41), PropertyId(0x51), TypeId(0x61)),
        },
        Instruction::SetInfoedValue {
            type_id: TypeId(0x62),
            generation: 3,
        },
        Instruction::NewProperty {
            property: PropertyId(5),
            type_id: TypeId(0x60),
        },
        Instruction::ReplaceBaseType {
            types: smallvec![TypeId(1), TypeId(2)],
        },
    ]
}

// ============================================================================
// Layout
// ============================================================================

#[test]
fn test_value_stream_layout() {
    let bytes = encode_stream(&sample_value_stream(), FormatVersion::Current).unwrap();
    #[rustfmt::skip]
    let expected: Vec<u8> = vec![
        0x01, 0, 0, 0, 0x50, 0, 0, 0, 0x60,
        0x09, 0, 0, 0, 30, 0, 0, 0, 20,
        0x0A, 0, 0, 0, 30, 0, 0, 1, 0, 0, 0, 0, 10,
        0x02, 0, 0, 0, 0x61,
        0x07, 0, 0, 0, 0x41, 0, 0, 0, 0x51, 0, 0, 0, 0x61,
        0x08, 0, 0, 0, 0x62, 0, 0, 0, 3,
        0x01, 0, 0, 0, 5, 0, 0, 0, 0x60,
        0x0D, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2,
        0xFF,
    ];
    assert_eq!(bytes, expected);
}

#[test]
fn test_legacy_stream_is_two_bytes_shorter_per_set_info() {
    let instructions = sample_value_stream();
    let current = encode_stream(&instructions, FormatVersion::Current).unwrap();
    let legacy = encode_stream(&instructions, FormatVersion::Legacy).unwrap();
    assert_eq!(current.len() - legacy.len(), 2);
    assert_eq!(decode_stream(&legacy, FormatVersion::Legacy).unwrap(), instructions);
}

#[test]
fn test_delete_list_layout() {
    let instructions = vec![
        Instruction::DeleteProperty1 {
            object: ObjectId(0x40),
            property: PropertyId(0x50),
        },
        Instruction::DeleteProperty2 {
            property: PropertyId(0x51),
        },
        Instruction::DeleteObject {
            object: ObjectId(0x42),
        },
    ];
    let bytes = encode_stream(&instructions, FormatVersion::Current).unwrap();
    #[rustfmt::skip]
    let expected: Vec<u8> = vec![
        0x04, 0, 0, 0, 0x40, 0, 0, 0, 0x50,
        0x05, 0, 0, 0, 0x51,
        0x03, 0, 0, 0, 0x42,
        0xFF,
    ];
    assert_eq!(bytes, expected);
    assert!(instructions.iter().all(|i| i.opcode().is_structural()));
}

#[test]
fn test_encoded_len_matches_bytes() {
    for format in [FormatVersion::Current, FormatVersion::Legacy] {
        let instructions = sample_value_stream();
        let bytes = encode_stream(&instructions, format).unwrap();
        let total: usize = instructions.iter().map(|i| i.encoded_len(format)).sum();
        assert_eq!(bytes.len(), total + Instruction::EndUpdates.encoded_len(format));
    }
}

// ============================================================================
// Reading
// ============================================================================

#[test]
fn test_short_reads_decode_whole_stream() {
    let instructions = sample_value_stream();
    let bytes = encode_stream(&instructions, FormatVersion::Current).unwrap();
    let decoded: Result<Vec<_>, _> =
        InstructionReader::new(Trickle(&bytes), FormatVersion::Current).collect();
    assert_eq!(decoded.unwrap(), instructions);
}

#[test]
fn test_trailing_bytes_after_end_ignored() {
    let mut bytes = encode_stream(&[Instruction::DeleteValue], FormatVersion::Current).unwrap();
    bytes.extend_from_slice(&[0x42, 0x42]);
    assert_eq!(
        decode_stream(&bytes, FormatVersion::Current).unwrap(),
        vec![Instruction::DeleteValue]
    );
}

#[test]
fn test_every_truncation_is_reported() {
    let bytes = encode_stream(&sample_value_stream(), FormatVersion::Current).unwrap();
    for cut in 0..bytes.len() {
        let err = decode_stream(&bytes[..cut], FormatVersion::Current).unwrap_err();
        assert!(err.is_truncated(), "cut at {} gave {}", cut, err);
    }
}

#[test]
fn test_unassigned_control_bytes() {
    for byte in (15u8..0xFF).chain(std::iter::once(0)) {
        assert!(Opcode::from_byte(byte).is_none());
        match decode_stream(&[byte], FormatVersion::Current) {
            Err(LogError::UnknownOpcode(b)) => assert_eq!(b, byte),
            other => panic!("byte {:#04x} decoded as {:?}", byte, other),
        }
    }
}

proptest! {
    #[test]
    fn test_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        for format in [FormatVersion::Current, FormatVersion::Legacy] {
            if let Ok(instructions) = decode_stream(&bytes, format) {
                prop_assert!(instructions.iter().all(|i| *i != Instruction::EndUpdates));
            }
        }
    }

    #[test]
    fn test_insert_run_uses_cheapest_form(
        lens in prop::collection::vec(1u32..1000, 0..8),
        at in any::<u32>(),
    ) {
        let mut offset = 0;
        let data: Vec<DataRef> = lens
            .iter()
            .map(|&len| {
                let range = DataRef { offset, len };
                offset += len;
                range
            })
            .collect();
        match Instruction::insert_data(at, &data) {
            None => prop_assert!(data.is_empty()),
            Some(instruction) => {
                let expected = if data.len() == 1 { Opcode::InsertData1 } else { Opcode::InsertDataN };
                prop_assert_eq!(instruction.opcode(), expected);
                let bytes = encode_stream(&[instruction.clone()], FormatVersion::Current).unwrap();
                prop_assert_eq!(decode_stream(&bytes, FormatVersion::Current).unwrap(), vec![instruction]);
            }
        }
    }
}
