//! Intermediate representation of map-algebra expressions.
//!
//! The [`Dag`] container owns every node; nodes reference each other through
//! [`NodeId`]s, so the arena can be shared read-only once construction ends.

mod dag;
mod data_value;
mod dims;
mod entities;
mod loops;
mod mask;
mod meta;
mod node;
mod ops;
mod types;
mod visitor;

pub use self::dag::{Dag, DisplayNode};
pub use self::data_value::{DataValue, Ieee32, Ieee64, ValFix};
pub use self::dims::{BlockSize, Coord, DataShape, DataSize, MemOrder, NumDim, StreamDir};
pub use self::entities::{LoopId, NodeId};
pub use self::loops::{CarriedVar, LoopData};
pub use self::mask::Mask;
pub use self::meta::MetaData;
pub use self::node::{MergeMode, Node, NodeData, NodeKind, SIGNATURE_VERSION};
pub use self::ops::{BinaryOp, Pattern, PercentType, RandDist, ReductionType, UnaryOp};
pub use self::types::DataType;
pub use self::visitor::Visitor;
