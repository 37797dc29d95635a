//! Multi-session workflows over the public `bento` API.

#[path = "../common/mod.rs"]
mod common;

mod churn;
mod stacking;
