//! Update generation and replay
//!
//! [`generate_updates`] runs at session close and turns the touch records
//! into instruction streams stored in the updating layer. [`apply_updates`]
//! runs when an update image is opened on its target and replays those
//! streams through the same segment editor.

mod encoder;
mod interpreter;

pub use encoder::diff_segments;
pub(crate) use encoder::generate_updates;
pub(crate) use interpreter::apply_updates;
