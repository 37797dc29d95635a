//! Update instruction control bytes
//!
//! Every instruction starts with one control byte. The values are part of
//! the container format and shared by the generator and the interpreter.

use std::fmt;

/// Control byte of an update instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// End of an instruction stream
    EndUpdates = 0xFF,
    /// Switch to a new property and type: propertyId:4, typeId:4
    NewProperty = 1,
    /// Switch to a new type on the current property: typeId:4
    NewType = 2,
    /// Delete an object: objectId:4
    DeleteObject = 3,
    /// Delete a property of an object: objectId:4, propertyId:4
    DeleteProperty1 = 4,
    /// Delete a property of the previous object: propertyId:4
    DeleteProperty2 = 5,
    /// Value was moved away from here
    RemovedValue = 6,
    /// Value was moved here from: objectId:4, propertyId:4, typeId:4
    InsertedValue = 7,
    /// Value type and generation changed: typeId:4, generation:4 (2 in legacy)
    SetInfoedValue = 8,
    /// Delete data: offset:4, amount:4
    DeleteData = 9,
    /// Insert one data range: insertPoint:4, dataOffset:4, dataLength:4
    InsertData1 = 10,
    /// Insert n data ranges: insertPoint:4, n:4, n x (dataOffset:4, dataLength:4)
    InsertDataN = 11,
    /// Replace an immediate: length:1, value:4
    ReplaceImmediate = 12,
    /// Replace a base type array: n:2, n x typeId:4
    ReplaceBaseType = 13,
    /// Delete the value
    DeleteValue = 14,
}

impl Opcode {
    /// Decode a control byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0xFF => Opcode::EndUpdates,
            1 => Opcode::NewProperty,
            2 => Opcode::NewType,
            3 => Opcode::DeleteObject,
            4 => Opcode::DeleteProperty1,
            5 => Opcode::DeleteProperty2,
            6 => Opcode::RemovedValue,
            7 => Opcode::InsertedValue,
            8 => Opcode::SetInfoedValue,
            9 => Opcode::DeleteData,
            10 => Opcode::InsertData1,
            11 => Opcode::InsertDataN,
            12 => Opcode::ReplaceImmediate,
            13 => Opcode::ReplaceBaseType,
            14 => Opcode::DeleteValue,
            _ => return None,
        })
    }

    /// The control byte
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether this opcode belongs in the global delete-list stream
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Opcode::DeleteObject | Opcode::DeleteProperty1 | Opcode::DeleteProperty2
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_bytes_are_stable() {
        assert_eq!(Opcode::EndUpdates.to_byte(), 0xFF);
        assert_eq!(Opcode::NewProperty.to_byte(), 1);
        assert_eq!(Opcode::InsertDataN.to_byte(), 11);
        assert_eq!(Opcode::DeleteValue.to_byte(), 14);
    }

    #[test]
    fn test_every_opcode_decodes_to_itself() {
        for byte in (1u8..=14).chain(std::iter::once(0xFF)) {
            let op = Opcode::from_byte(byte).unwrap();
            assert_eq!(op.to_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_bytes_rejected() {
        assert!(Opcode::from_byte(0).is_none());
        assert!(Opcode::from_byte(15).is_none());
        assert!(Opcode::from_byte(0xFE).is_none());
    }

    #[test]
    fn test_structural_opcodes() {
        assert!(Opcode::DeleteObject.is_structural());
        assert!(Opcode::DeleteProperty2.is_structural());
        assert!(!Opcode::DeleteValue.is_structural());
    }
}
