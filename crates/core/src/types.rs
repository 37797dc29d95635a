//! Identity types for container objects
//!
//! This module defines the foundational identifiers:
//! - ObjectId: Stable 32-bit id of an object in a container
//! - PropertyId: 32-bit id of a property on an object
//! - TypeId: 32-bit id of a value type
//! - ContainerId: Index of a byte layer (target or an update layer)
//! - Opt: The (object, property, type) address of a value

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            /// Create an id from its raw value
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Get the raw 32-bit value
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Stable identifier of an object
    ///
    /// Object ids are assigned when an object is created and never change,
    /// which is what lets an update log written in one session be replayed
    /// against the same target in another.
    ObjectId,
    "#"
);

id_type!(
    /// Identifier of a property owned by an object
    PropertyId,
    "p"
);

id_type!(
    /// Identifier of a value type
    TypeId,
    "t"
);

impl TypeId {
    /// Placeholder type used by entries that address a property, not a value
    pub const NONE: TypeId = TypeId(0);
}

/// Index of a byte layer within a container
///
/// Layer 0 is the base target. Every applied update image adds one layer
/// on top; the updating container of a session is always the topmost layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ContainerId(pub u16);

impl ContainerId {
    /// The base target layer
    pub const TARGET: ContainerId = ContainerId(0);

    /// Layer index as usize, for indexing layer tables
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer{}", self.0)
    }
}

/// The (object, property, type) address of a value
///
/// Captured when a value is first touched in a session, so it names where
/// the value lived before any edit of that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Opt {
    /// Owning object
    pub object: ObjectId,
    /// Owning property
    pub property: PropertyId,
    /// Value type
    pub type_id: TypeId,
}

impl Opt {
    /// Create an OPT address
    pub fn new(object: ObjectId, property: PropertyId, type_id: TypeId) -> Self {
        Self {
            object,
            property,
            type_id,
        }
    }

    /// Address of a whole property (no value type)
    pub fn property(object: ObjectId, property: PropertyId) -> Self {
        Self::new(object, property, TypeId::NONE)
    }
}

impl fmt::Display for Opt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.object, self.property, self.type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(ObjectId(7).to_string(), "#7");
        assert_eq!(PropertyId(12).to_string(), "p12");
        assert_eq!(TypeId(3).to_string(), "t3");
        assert_eq!(ContainerId(2).to_string(), "layer2");
    }

    #[test]
    fn test_opt_display() {
        let opt = Opt::new(ObjectId(70), PropertyId(71), TypeId(72));
        assert_eq!(opt.to_string(), "(#70, p71, t72)");
    }

    #[test]
    fn test_property_opt_has_no_type() {
        let opt = Opt::property(ObjectId(1), PropertyId(2));
        assert_eq!(opt.type_id, TypeId::NONE);
    }

    #[test]
    fn test_ids_order_by_raw_value() {
        let mut ids = vec![ObjectId(9), ObjectId(2), ObjectId(5)];
        ids.sort();
        assert_eq!(ids, vec![ObjectId(2), ObjectId(5), ObjectId(9)]);
    }
}
