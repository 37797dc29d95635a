//! Container byte layers
//!
//! A container's bytes are split into layers: the base target (layer 0)
//! and one layer per applied update image. A session's updating container
//! is always the topmost layer and is the only one that may be written.

use bento_core::ContainerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte layer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    /// No layer with this id
    #[error("container layer {0} does not exist")]
    MissingLayer(ContainerId),

    /// Range outside the layer's end of file
    #[error("range {offset}+{len} outside {container} of size {size}")]
    OutOfRange {
        /// Layer
        container: ContainerId,
        /// Requested offset
        offset: u32,
        /// Requested length
        len: u32,
        /// Layer size
        size: u32,
    },

    /// Layer would grow past the 32-bit offset space
    #[error("container layer {0} is full")]
    Full(ContainerId),
}

/// The bytes of one container layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteStore {
    bytes: Vec<u8>,
}

impl ByteStore {
    /// Create an empty layer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a layer from existing bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ByteStore { bytes }
    }

    /// End-of-file offset
    pub fn eof(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// All bytes of the layer
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Borrow `len` bytes at `offset`
    pub fn slice(&self, offset: u32, len: u32) -> Option<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(len as usize)?;
        self.bytes.get(start..end)
    }

    /// Extend end-of-file by `len` zero bytes, returning the old end
    pub fn extend(&mut self, len: u32) -> Option<u32> {
        let eof = self.eof();
        eof.checked_add(len)?;
        self.bytes.resize(self.bytes.len() + len as usize, 0);
        Some(eof)
    }

    /// Overwrite bytes inside the current end of file
    pub fn write_at(&mut self, offset: u32, data: &[u8]) -> bool {
        let start = offset as usize;
        match self.bytes.get_mut(start..start + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

/// The ordered stack of byte layers of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layers {
    stores: Vec<ByteStore>,
}

impl Default for Layers {
    fn default() -> Self {
        Self::new()
    }
}

impl Layers {
    /// Create a stack holding an empty target layer
    pub fn new() -> Self {
        Layers {
            stores: vec![ByteStore::new()],
        }
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Always false: the target layer is always present
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Id of the topmost layer
    pub fn top(&self) -> ContainerId {
        ContainerId((self.stores.len() - 1) as u16)
    }

    /// Push a layer, returning its id
    pub fn push(&mut self, store: ByteStore) -> ContainerId {
        self.stores.push(store);
        self.top()
    }

    /// Remove and return the topmost layer, never the target
    pub fn pop(&mut self) -> Option<ByteStore> {
        if self.stores.len() > 1 {
            self.stores.pop()
        } else {
            None
        }
    }

    /// Get a layer
    pub fn get(&self, id: ContainerId) -> Result<&ByteStore, LayerError> {
        self.stores
            .get(id.index())
            .ok_or(LayerError::MissingLayer(id))
    }

    /// Get a mutable layer
    pub fn get_mut(&mut self, id: ContainerId) -> Result<&mut ByteStore, LayerError> {
        self.stores
            .get_mut(id.index())
            .ok_or(LayerError::MissingLayer(id))
    }

    /// Read bytes of a layer
    pub fn read(&self, id: ContainerId, offset: u32, len: u32) -> Result<&[u8], LayerError> {
        let store = self.get(id)?;
        store.slice(offset, len).ok_or(LayerError::OutOfRange {
            container: id,
            offset,
            len,
            size: store.eof(),
        })
    }

    /// Overwrite bytes of a layer inside its end of file
    pub fn write(&mut self, id: ContainerId, offset: u32, data: &[u8]) -> Result<(), LayerError> {
        let store = self.get_mut(id)?;
        let size = store.eof();
        if store.write_at(offset, data) {
            Ok(())
        } else {
            Err(LayerError::OutOfRange {
                container: id,
                offset,
                len: data.len() as u32,
                size,
            })
        }
    }
}
