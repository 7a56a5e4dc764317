//! Node kinds, payloads, and the shared vertex record.
//!
//! Every node is one [`Node`] record holding the fields all kinds share,
//! plus a [`NodeData`] payload for the kind-specific parameters. Passes
//! dispatch by matching on the payload tag rather than through a class
//! hierarchy.

use smallvec::SmallVec;

use crate::file::FileHandle;
use crate::ir::data_value::DataValue;
use crate::ir::dims::{BlockSize, Coord};
use crate::ir::entities::{LoopId, NodeId};
use crate::ir::mask::Mask;
use crate::ir::meta::MetaData;
use crate::ir::ops::{BinaryOp, Pattern, PercentType, RandDist, ReductionType, UnaryOp};
use crate::ir::types::DataType;

/// Version tag prefixed to every node signature.
///
/// Signatures are the cache key for compiled kernels downstream; bump this
/// character whenever any kind's signature recipe changes so stale kernels
/// are never reused.
pub const SIGNATURE_VERSION: char = '1';

/// The discriminator identifying which operator a node represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum NodeKind {
    Constant,
    Empty,
    Index,
    Rand,
    Read,
    Unary,
    Binary,
    Conditional,
    Cast,
    FocalFunc,
    FocalPercent,
    FocalFlow,
    Neighbor,
    ZonalReduc,
    RadialScan,
    SpreadScan,
    Barrier,
    Write,
    Checkpoint,
    LoopCond,
    LoopHead,
    LoopTail,
    Feedback,
    Merge,
    Switch,
    Access,
    Temporal,
    Identity,
    Summary,
    Stats,
}

impl NodeKind {
    /// The kind tag: the single character leading every signature.
    pub fn class_signature(self) -> char {
        match self {
            Self::Constant => 'C',
            Self::Empty => 'E',
            Self::Index => 'X',
            Self::Rand => 'D',
            Self::Read => 'I',
            Self::Unary => 'U',
            Self::Binary => 'B',
            Self::Conditional => 'Q',
            Self::Cast => 'T',
            Self::FocalFunc => 'F',
            Self::FocalPercent => 'P',
            Self::FocalFlow => 'V',
            Self::Neighbor => 'N',
            Self::ZonalReduc => 'Z',
            Self::RadialScan => 'R',
            Self::SpreadScan => 'S',
            Self::Barrier => 'W',
            Self::Write => 'O',
            Self::Checkpoint => 'K',
            Self::LoopCond => 'c',
            Self::LoopHead => 'h',
            Self::LoopTail => 't',
            Self::Feedback => 'f',
            Self::Merge => 'M',
            Self::Switch => 'G',
            Self::Access => 'A',
            Self::Temporal => 'm',
            Self::Identity => 'd',
            Self::Summary => 'y',
            Self::Stats => 's',
        }
    }

    /// Human-readable kind name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Constant => "Constant",
            Self::Empty => "Empty",
            Self::Index => "Index",
            Self::Rand => "Rand",
            Self::Read => "Read",
            Self::Unary => "Unary",
            Self::Binary => "Binary",
            Self::Conditional => "Conditional",
            Self::Cast => "Cast",
            Self::FocalFunc => "FocalFunc",
            Self::FocalPercent => "FocalPercent",
            Self::FocalFlow => "FocalFlow",
            Self::Neighbor => "Neighbor",
            Self::ZonalReduc => "ZonalReduc",
            Self::RadialScan => "RadialScan",
            Self::SpreadScan => "SpreadScan",
            Self::Barrier => "Barrier",
            Self::Write => "Write",
            Self::Checkpoint => "Checkpoint",
            Self::LoopCond => "LoopCond",
            Self::LoopHead => "LoopHead",
            Self::LoopTail => "LoopTail",
            Self::Feedback => "Feedback",
            Self::Merge => "Merge",
            Self::Switch => "Switch",
            Self::Access => "Access",
            Self::Temporal => "Temporal",
            Self::Identity => "Identity",
            Self::Summary => "Summary",
            Self::Stats => "Stats",
        }
    }
}

/// Which construction mode a [`NodeData::Merge`] was built in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeMode {
    /// One operand via `prev`, the other via a `forw` back-edge installed
    /// when the owning loop is sealed.
    While,
    /// Both operands via `prev`.
    IfElse,
}

/// Kind-specific payload of a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeData {
    /// A literal scalar or dense constant raster.
    Constant {
        /// The constant cell value.
        value: DataValue,
    },
    /// An uninitialized placeholder raster.
    Empty,
    /// The cell index along one axis.
    Index {
        /// Axis the index runs along.
        axis: u8,
    },
    /// A pseudo-random raster derived from a seed value.
    Rand {
        /// The distribution cells are drawn from.
        dist: RandDist,
    },
    /// A raster streamed in from a file; the path lives on the handle.
    Read,
    /// An element-wise unary operator.
    Unary {
        /// The operator.
        op: UnaryOp,
    },
    /// An element-wise binary operator with scalar broadcasting.
    Binary {
        /// The operator.
        op: BinaryOp,
    },
    /// Element-wise select between two values by a truth mask.
    Conditional,
    /// An element-wise type conversion.
    Cast {
        /// Target cell type.
        to: DataType,
    },
    /// A neighborhood reduction under a stencil mask.
    FocalFunc {
        /// The stencil.
        mask: Mask,
        /// The reduction applied over the stencil cells.
        reduc: ReductionType,
    },
    /// A neighborhood percentage/percentile statistic under a stencil mask.
    FocalPercent {
        /// The stencil.
        mask: Mask,
        /// Which statistic.
        percent: PercentType,
    },
    /// Steepest-descent flow direction over the 3x3 neighborhood.
    FocalFlow,
    /// The value of the cell at a fixed offset from the centre.
    Neighbor {
        /// Offset from the centre cell.
        offset: Coord,
    },
    /// A whole-raster reduction to a scalar.
    ZonalReduc {
        /// The reduction.
        reduc: ReductionType,
    },
    /// Iterative propagation outward from a start coordinate.
    RadialScan {
        /// The start coordinate.
        start: Coord,
    },
    /// Iterative front propagation along a direction raster.
    SpreadScan {
        /// The reduction merging incoming fronts.
        reduc: ReductionType,
    },
    /// A materialization boundary between fused regions.
    Barrier,
    /// A raster streamed out to a file.
    Write,
    /// A raster spilled to an anonymous temporary file.
    Checkpoint,
    /// The scalar condition of a loop region.
    LoopCond {
        /// Owning loop, set when the region is sealed.
        owner: Option<LoopId>,
    },
    /// The entry marker of a loop-carried variable.
    LoopHead {
        /// Owning loop, set when the region is sealed.
        owner: Option<LoopId>,
    },
    /// The externally visible output of a loop-carried variable.
    LoopTail {
        /// Owning loop.
        owner: Option<LoopId>,
    },
    /// One half of a feed-in/feed-out twin pair.
    Feedback {
        /// True for the feed-in port, false for the feed-out port.
        input: bool,
        /// The twin feedback node, installed when the pair is complete.
        twin: Option<NodeId>,
        /// Owning loop.
        owner: Option<LoopId>,
    },
    /// A join of two alternative dataflow paths.
    Merge {
        /// Construction mode.
        mode: MergeMode,
    },
    /// Routes one of two values by a scalar condition.
    Switch,
    /// The value of one cell at a fixed coordinate, as a scalar.
    Access {
        /// The coordinate read.
        coord: Coord,
    },
    /// An anonymous intermediate raster materialized by another operator.
    Temporal,
    /// A pass-through; keeps a value alive across rewires.
    Identity,
    /// A whole-raster statistic reduced to a scalar.
    Summary {
        /// The statistic.
        reduc: ReductionType,
    },
    /// Per-block statistics of a raster: one cell per block.
    Stats,
}

impl NodeData {
    /// The kind tag of this payload.
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Constant { .. } => NodeKind::Constant,
            Self::Empty => NodeKind::Empty,
            Self::Index { .. } => NodeKind::Index,
            Self::Rand { .. } => NodeKind::Rand,
            Self::Read => NodeKind::Read,
            Self::Unary { .. } => NodeKind::Unary,
            Self::Binary { .. } => NodeKind::Binary,
            Self::Conditional => NodeKind::Conditional,
            Self::Cast { .. } => NodeKind::Cast,
            Self::FocalFunc { .. } => NodeKind::FocalFunc,
            Self::FocalPercent { .. } => NodeKind::FocalPercent,
            Self::FocalFlow => NodeKind::FocalFlow,
            Self::Neighbor { .. } => NodeKind::Neighbor,
            Self::ZonalReduc { .. } => NodeKind::ZonalReduc,
            Self::RadialScan { .. } => NodeKind::RadialScan,
            Self::SpreadScan { .. } => NodeKind::SpreadScan,
            Self::Barrier => NodeKind::Barrier,
            Self::Write => NodeKind::Write,
            Self::Checkpoint => NodeKind::Checkpoint,
            Self::LoopCond { .. } => NodeKind::LoopCond,
            Self::LoopHead { .. } => NodeKind::LoopHead,
            Self::LoopTail { .. } => NodeKind::LoopTail,
            Self::Feedback { .. } => NodeKind::Feedback,
            Self::Merge { .. } => NodeKind::Merge,
            Self::Switch => NodeKind::Switch,
            Self::Access { .. } => NodeKind::Access,
            Self::Temporal => NodeKind::Temporal,
            Self::Identity => NodeKind::Identity,
            Self::Summary { .. } => NodeKind::Summary,
            Self::Stats => NodeKind::Stats,
        }
    }
}

/// One vertex of the operator dag.
///
/// All edges are [`NodeId`]s into the owning [`Dag`](crate::ir::Dag) arena.
/// `prev` is positional and frozen after construction (loop sealing is the
/// one documented splice point); `next`, `back`, and `forw` are
/// insertion-ordered and idempotent.
#[derive(Clone)]
pub struct Node {
    pub(crate) id: u64,
    pub(crate) meta: MetaData,
    pub(crate) data: NodeData,
    pub(crate) prev: SmallVec<[NodeId; 4]>,
    pub(crate) next: SmallVec<[NodeId; 4]>,
    pub(crate) back: SmallVec<[NodeId; 2]>,
    pub(crate) forw: SmallVec<[NodeId; 2]>,
    pub(crate) file: Option<FileHandle>,
    pub(crate) in_spatial_reach: Mask,
    pub(crate) out_spatial_reach: Mask,
}

impl Node {
    /// The logical SSA id.
    ///
    /// Ids are allocated monotonically and never reused; feedback ports
    /// adopt the id of the value they stand for, so the id names the logical
    /// value while the arena [`NodeId`] names the vertex.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The node's metadata bundle.
    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    /// The kind payload.
    pub fn data(&self) -> &NodeData {
        &self.data
    }

    /// The kind tag.
    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }

    /// Positional dataflow operands.
    pub fn prev(&self) -> &[NodeId] {
        &self.prev
    }

    /// Dataflow consumers, in registration order.
    pub fn next(&self) -> &[NodeId] {
        &self.next
    }

    /// Reverse control-flow edges of feedback ports.
    pub fn back(&self) -> &[NodeId] {
        &self.back
    }

    /// Forward control-flow edges symmetric to [`Node::back`].
    pub fn forw(&self) -> &[NodeId] {
        &self.forw
    }

    /// The raster file handle, present only on I/O nodes.
    pub fn file(&self) -> Option<&FileHandle> {
        self.file.as_ref()
    }

    /// Conservative stencil footprint the node reads.
    pub fn in_spatial_reach(&self) -> &Mask {
        &self.in_spatial_reach
    }

    /// Conservative stencil footprint the node writes.
    pub fn out_spatial_reach(&self) -> &Mask {
        &self.out_spatial_reach
    }

    /// The fusion classification of this node.
    pub fn pattern(&self) -> Pattern {
        match self.data {
            NodeData::Constant { .. }
            | NodeData::Empty
            | NodeData::Index { .. }
            | NodeData::Rand { .. }
            | NodeData::Read
            | NodeData::Write
            | NodeData::Checkpoint
            | NodeData::LoopCond { .. }
            | NodeData::LoopHead { .. }
            | NodeData::LoopTail { .. }
            | NodeData::Feedback { .. }
            | NodeData::Access { .. }
            | NodeData::Temporal => Pattern::Free,
            NodeData::Unary { .. }
            | NodeData::Binary { .. }
            | NodeData::Conditional
            | NodeData::Cast { .. }
            | NodeData::Identity => Pattern::Local,
            NodeData::FocalFunc { .. }
            | NodeData::FocalPercent { .. }
            | NodeData::FocalFlow
            | NodeData::Neighbor { .. } => Pattern::Focal,
            NodeData::ZonalReduc { .. } => Pattern::Zonal,
            NodeData::RadialScan { .. } => Pattern::Radial,
            NodeData::SpreadScan { .. } => Pattern::Spread,
            NodeData::Barrier => Pattern::Barrier,
            NodeData::Merge { .. } | NodeData::Switch => Pattern::Merge,
            NodeData::Summary { .. } | NodeData::Stats => Pattern::Stats,
        }
    }

    /// The per-axis border this node reads beyond a block's interior.
    pub fn halo(&self) -> BlockSize {
        let rank = self.meta.num_dim().rank();
        match &self.data {
            NodeData::FocalFunc { mask, .. } | NodeData::FocalPercent { mask, .. } => mask.halo(),
            NodeData::FocalFlow => Coord::fill(rank, 1),
            NodeData::Neighbor { offset } => offset.abs(),
            _ => Coord::fill(rank, 0),
        }
    }

    /// True for the feed-in half of a feedback pair.
    pub fn feed_in(&self) -> bool {
        matches!(self.data, NodeData::Feedback { input: true, .. })
    }

    /// True for the feed-out half of a feedback pair.
    pub fn feed_out(&self) -> bool {
        matches!(self.data, NodeData::Feedback { input: false, .. })
    }

    /// The twin of a feedback port, once the pair is complete.
    pub fn twin(&self) -> Option<NodeId> {
        match self.data {
            NodeData::Feedback { twin, .. } => twin,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_signatures_are_unique() {
        let kinds = [
            NodeKind::Constant,
            NodeKind::Empty,
            NodeKind::Index,
            NodeKind::Rand,
            NodeKind::Read,
            NodeKind::Unary,
            NodeKind::Binary,
            NodeKind::Conditional,
            NodeKind::Cast,
            NodeKind::FocalFunc,
            NodeKind::FocalPercent,
            NodeKind::FocalFlow,
            NodeKind::Neighbor,
            NodeKind::ZonalReduc,
            NodeKind::RadialScan,
            NodeKind::SpreadScan,
            NodeKind::Barrier,
            NodeKind::Write,
            NodeKind::Checkpoint,
            NodeKind::LoopCond,
            NodeKind::LoopHead,
            NodeKind::LoopTail,
            NodeKind::Feedback,
            NodeKind::Merge,
            NodeKind::Switch,
            NodeKind::Access,
            NodeKind::Temporal,
            NodeKind::Identity,
            NodeKind::Summary,
            NodeKind::Stats,
        ];
        let mut seen = std::collections::HashSet::new();
        for kind in kinds {
            assert!(
                seen.insert(kind.class_signature()),
                "duplicate class signature for {}",
                kind.name()
            );
        }
    }
}
