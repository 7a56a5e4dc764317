//! FxHash-based hash maps and sets used throughout the crate.

pub use rustc_hash::{FxHashMap, FxHashSet};
