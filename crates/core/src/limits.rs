//! Reserved ids and fixed format limits
//!
//! These values are part of the container format. Changing any of them
//! makes existing update logs unreadable.

use crate::types::{ObjectId, PropertyId, TypeId};

/// Largest value that is stored inline in its segment descriptor
pub const IMMEDIATE_CAPACITY: usize = 4;

/// Reserved control object that carries the global delete list
pub const CONTROL_OBJECT_ID: ObjectId = ObjectId(1);

/// Property holding an object's value-update instruction stream
pub const UPDATES_PROPERTY: PropertyId = PropertyId(2);

/// Property on the control object holding the delete-list stream
pub const DELETE_LIST_PROPERTY: PropertyId = PropertyId(3);

/// Type of every instruction-stream value
pub const UPDATES_TYPE: TypeId = TypeId(4);

/// Property whose values are arrays of base type ids
///
/// Each segment of such a value is a 4-byte immediate holding one type id.
pub const BASE_TYPES_PROPERTY: PropertyId = PropertyId(5);

/// First id handed out to user objects
pub const FIRST_USER_ID: u32 = 0x40;

/// Maximum number of string inserts carried by an error report
pub const MAX_ERROR_INSERTS: usize = 5;

/// Check whether a property id is reserved for update-log streams
pub fn is_update_log_property(property: PropertyId) -> bool {
    property == UPDATES_PROPERTY || property == DELETE_LIST_PROPERTY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_log_properties() {
        assert!(is_update_log_property(UPDATES_PROPERTY));
        assert!(is_update_log_property(DELETE_LIST_PROPERTY));
        assert!(!is_update_log_property(BASE_TYPES_PROPERTY));
        assert!(!is_update_log_property(PropertyId(FIRST_USER_ID)));
    }

    #[test]
    fn test_user_ids_clear_reserved_range() {
        assert!(FIRST_USER_ID > CONTROL_OBJECT_ID.get());
        assert!(FIRST_USER_ID > BASE_TYPES_PROPERTY.get());
    }
}
