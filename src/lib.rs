//! Mapfuse intermediate representation library.
//!
//! This crate defines the operator DAG a map-algebra runtime lowers user
//! expressions into, together with everything needed to construct it
//! correctly: typed metadata bundles, value-numbered per-kind factories,
//! loop regions with feedback twins, subgraph cloning, and the visitor
//! protocol consumed by the fusion partitioner and the kernel code
//! generator.
//!
//! The crate deliberately stops at the IR boundary. Device dispatch and
//! raster format back-ends are reached only through the interfaces in
//! [`device`] and [`file`].

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use cranelift_entity as entity;

pub use crate::result::{IrError, IrResult};

pub mod device;
pub mod file;
pub mod ir;
pub mod result;

mod fx;
