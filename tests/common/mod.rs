//! Shared test utilities for the root integration suites.
//!
//! Import via `mod common;` from a suite's main.rs.

#![allow(dead_code)]

pub use bento::{
    CollectingReporter, Container, ContainerConfig, ErrorCode, FormatVersion, ObjectId, Opt,
    PropertyId, Target, TargetBuilder, TypeId, UpdateImage, ValueContents,
};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

pub const TITLE: PropertyId = PropertyId(0x50);
pub const BODY: PropertyId = PropertyId(0x51);
pub const NOTES: PropertyId = PropertyId(0x52);
pub const TEXT: TypeId = TypeId(0x60);
pub const RAW: TypeId = TypeId(0x61);

// ============================================================================
// Documents
// ============================================================================

/// A small document target and the ids of its objects
pub struct Document {
    pub target: Target,
    pub pages: Vec<ObjectId>,
}

/// Build a target with `pages` objects, each holding a short title and a
/// body split over two stored segments
pub fn document(pages: usize) -> Document {
    let mut builder = TargetBuilder::new();
    let mut ids = Vec::with_capacity(pages);
    for page in 0..pages {
        let id = builder.object();
        builder.value(id, TITLE, TEXT, format!("p{}", page).as_bytes()).unwrap();
        let head = vec![b'a' + (page % 26) as u8; 48];
        let tail = vec![b'A' + (page % 26) as u8; 80];
        builder
            .segmented_value(id, BODY, TEXT, &[&head, &tail])
            .unwrap();
        ids.push(id);
    }
    Document {
        target: builder.build(),
        pages: ids,
    }
}

// ============================================================================
// Sessions
// ============================================================================

pub fn config() -> ContainerConfig {
    ContainerConfig::for_testing()
}

pub fn session(target: &Target) -> Container {
    Container::open_for_update(target.clone(), config()).unwrap()
}

/// Close a session, returning its image and the contents it must replay to
pub fn close(container: Container) -> (UpdateImage, BTreeMap<Opt, ValueContents>) {
    let expected = container.contents().unwrap();
    (container.close().unwrap(), expected)
}

/// Open `target` read-only and stack `images` on it in order
pub fn replay(target: Target, images: &[UpdateImage]) -> Container {
    let mut container = Container::open(target, config()).unwrap();
    for image in images {
        container.apply_image(image).unwrap();
    }
    container
}

/// Save an image under `dir` and read it back
pub fn through_file(dir: &TempDir, name: &str, image: &UpdateImage) -> UpdateImage {
    let path = dir.path().join(name);
    image.save(&path).unwrap();
    load(&path)
}

fn load(path: &Path) -> UpdateImage {
    UpdateImage::load(path).unwrap()
}
