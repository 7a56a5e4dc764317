//! IR entity references.
//!
//! Nodes and loop regions are arena-allocated; edges between them are stored
//! as `u32` index newtypes rather than references, both for compactness and
//! so the arena can be grown without invalidating anything. There is a
//! separate index type per entity so we don't lose type safety.

use crate::entity::entity_impl;

/// An opaque reference to an operator node in a [`Dag`](crate::ir::Dag).
///
/// While the order is stable, it is arbitrary and carries no scheduling
/// meaning; deterministic orderings tie-break on the node's logical id.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
entity_impl!(NodeId, "n");

/// An opaque reference to a loop region in a [`Dag`](crate::ir::Dag).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u32);
entity_impl!(LoopId, "loop");
