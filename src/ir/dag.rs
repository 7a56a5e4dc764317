//! The dag container: arena, per-kind factories, and value numbering.
//!
//! Every node is created through a factory on [`Dag`]. A factory validates
//! its operands, computes the result metadata from the kind's rule, builds a
//! structural key, and consults the value-numbering table: a hit returns the
//! canonical existing node, a miss installs a new one and registers it as a
//! consumer on each operand. Construction is single-threaded per dag; once
//! factories stop being called the dag can be shared read-only by any number
//! of visitors.

use std::path::{Path, PathBuf};

use log::trace;
use smallvec::{smallvec, SmallVec};

use crate::entity::PrimaryMap;
use crate::file::{self, FileHandle};
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::data_value::{DataValue, ValFix};
use crate::ir::dims::{BlockSize, Coord, DataSize, MemOrder, NumDim, StreamDir};
use crate::ir::entities::{LoopId, NodeId};
use crate::ir::loops::LoopData;
use crate::ir::mask::Mask;
use crate::ir::meta::MetaData;
use crate::ir::node::{MergeMode, Node, NodeData, NodeKind, SIGNATURE_VERSION};
use crate::ir::ops::{BinaryOp, PercentType, RandDist, ReductionType, UnaryOp};
use crate::ir::types::DataType;
use crate::result::{IrError, IrResult};

/// Structural key of a factory-built node.
///
/// Keys use operand identity rather than operand signatures: only
/// already-canonical subexpressions collide, which keeps every factory O(1).
#[derive(Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    prev: SmallVec<[NodeId; 4]>,
    data: NodeData,
    meta: Option<MetaData>,
    path: Option<PathBuf>,
}

impl NodeKey {
    fn new(prev: &[NodeId], data: NodeData) -> Self {
        Self {
            prev: SmallVec::from_slice(prev),
            data,
            meta: None,
            path: None,
        }
    }

    fn with_meta(mut self, meta: MetaData) -> Self {
        self.meta = Some(meta);
        self
    }

    fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }
}

/// The operator dag of one expression build.
///
/// The dag owns every node and loop region; all edges are [`NodeId`]s into
/// its arena. Nodes are never removed during steady-state construction; the
/// only removal paths are dropping the dag and
/// [`Dag::discard_loop`](crate::ir::Dag::discard_loop).
pub struct Dag {
    pub(crate) nodes: PrimaryMap<NodeId, Node>,
    pub(crate) loops: PrimaryMap<LoopId, LoopData>,
    table: FxHashMap<NodeKey, NodeId>,
    pub(crate) dead: FxHashSet<NodeId>,
    next_id: u64,
    live: usize,
}

impl Dag {
    /// Create an empty dag.
    pub fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            loops: PrimaryMap::new(),
            table: FxHashMap::default(),
            dead: FxHashSet::default(),
            next_id: 0,
            live: 0,
        }
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// Borrow one node.
    pub fn node(&self, n: NodeId) -> &Node {
        &self.nodes[n]
    }

    /// Iterate over the live nodes in arena order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().filter(|(n, _)| !self.dead.contains(n))
    }

    /// Returns an object that displays `n`.
    pub fn display_node(&self, n: NodeId) -> DisplayNode<'_> {
        DisplayNode(self, n)
    }

    // ------------------------------------------------------------------
    // Arena and edge plumbing.

    /// Validate that `n` names a live node of this dag.
    pub(crate) fn check_node(&self, n: NodeId, what: &str) -> IrResult<&Node> {
        if !self.nodes.is_valid(n) || self.dead.contains(&n) {
            return Err(IrError::invalid(format!(
                "{what} operand {n} is not a live node of this dag"
            )));
        }
        Ok(&self.nodes[n])
    }

    /// Allocate a node and register it as a consumer on each operand.
    pub(crate) fn alloc(
        &mut self,
        meta: MetaData,
        data: NodeData,
        prev: SmallVec<[NodeId; 4]>,
        file: Option<FileHandle>,
    ) -> NodeId {
        let dim = meta.num_dim();
        let node = Node {
            id: self.next_id,
            meta,
            data,
            prev: prev.clone(),
            next: SmallVec::new(),
            back: SmallVec::new(),
            forw: SmallVec::new(),
            file,
            in_spatial_reach: Mask::unit(dim),
            out_spatial_reach: Mask::unit(dim),
        };
        self.next_id += 1;
        self.live += 1;
        let n = self.nodes.push(node);
        for p in prev {
            self.add_next(p, n);
        }
        trace!("built {}", self.display_node(n));
        n
    }

    fn intern(
        &mut self,
        key: NodeKey,
        meta: MetaData,
        data: NodeData,
        prev: SmallVec<[NodeId; 4]>,
        file: Option<FileHandle>,
    ) -> NodeId {
        if let Some(&n) = self.table.get(&key) {
            trace!("value numbering hit: {} -> {n}", data.kind().name());
            return n;
        }
        let n = self.alloc(meta, data, prev, file);
        self.table.insert(key, n);
        n
    }

    /// Idempotent `next` registration.
    pub(crate) fn add_next(&mut self, from: NodeId, to: NodeId) {
        let node = &mut self.nodes[from];
        if !node.next.contains(&to) {
            node.next.push(to);
        }
    }

    pub(crate) fn remove_next(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].next.retain(|&mut n| n != to);
    }

    /// Install the symmetric `forw`/`back` pair `to ∈ forw(from)`,
    /// `from ∈ back(to)`.
    pub(crate) fn link_forw(&mut self, from: NodeId, to: NodeId) {
        let node = &mut self.nodes[from];
        if !node.forw.contains(&to) {
            node.forw.push(to);
        }
        let node = &mut self.nodes[to];
        if !node.back.contains(&from) {
            node.back.push(from);
        }
    }

    /// Replace `old` with `new` in a node's positional operand list.
    ///
    /// The caller owns the symmetric `next` maintenance on `old` and `new`;
    /// this is only used while a loop region is being sealed.
    pub(crate) fn update_prev(&mut self, node: NodeId, old: NodeId, new: NodeId) {
        for p in &mut self.nodes[node].prev {
            if *p == old {
                *p = new;
            }
        }
    }

    fn derived_meta(src: &MetaData, dt: DataType) -> MetaData {
        MetaData::new(src.data_size(), dt, src.mem_order(), src.block_size())
    }

    fn check_block(size: DataSize, block: BlockSize, kind: NodeKind) -> IrResult<()> {
        if !size.is_empty() && (block.rank() != size.rank() || !block.all_positive()) {
            return Err(IrError::invalid(format!(
                "{} of extent {size} needs a positive block extent of equal rank, got {block}",
                kind.name()
            )));
        }
        Ok(())
    }

    fn check_raster(&self, n: NodeId, kind: NodeKind) -> IrResult<MetaData> {
        let meta = *self.check_node(n, kind.name())?.meta();
        if meta.num_dim() == NumDim::D0 {
            return Err(IrError::invalid(format!(
                "{} rejects a D0 operand",
                kind.name()
            )));
        }
        Ok(meta)
    }

    /// The stream direction of a join: `In` only when both arms stream in,
    /// otherwise `Io`.
    pub(crate) fn join_stream(lhs: StreamDir, rhs: StreamDir) -> StreamDir {
        if lhs == StreamDir::In && rhs == StreamDir::In {
            StreamDir::In
        } else {
            StreamDir::Io
        }
    }

    // ------------------------------------------------------------------
    // Source factories.

    /// A constant value; a scalar when `size` is empty, a dense constant
    /// raster otherwise.
    pub fn constant(
        &mut self,
        value: DataValue,
        size: DataSize,
        order: MemOrder,
        block: BlockSize,
    ) -> IrResult<NodeId> {
        Self::check_block(size, block, NodeKind::Constant)?;
        let meta = MetaData::new(size, value.datatype(), order, block);
        let data = NodeData::Constant { value };
        let key = NodeKey::new(&[], data.clone()).with_meta(meta);
        Ok(self.intern(key, meta, data, smallvec![], None))
    }

    /// A scalar constant.
    pub fn scalar(&mut self, value: DataValue) -> IrResult<NodeId> {
        self.constant(
            value,
            DataSize::default(),
            MemOrder::RowPos,
            BlockSize::default(),
        )
    }

    /// An uninitialized placeholder raster.
    pub fn empty(
        &mut self,
        size: DataSize,
        dt: DataType,
        order: MemOrder,
        block: BlockSize,
    ) -> IrResult<NodeId> {
        Self::check_block(size, block, NodeKind::Empty)?;
        let meta = MetaData::new(size, dt, order, block);
        let key = NodeKey::new(&[], NodeData::Empty).with_meta(meta);
        Ok(self.intern(key, meta, NodeData::Empty, smallvec![], None))
    }

    /// The cell index along `axis`, as an `S64` raster of the given extent.
    pub fn index(
        &mut self,
        size: DataSize,
        axis: usize,
        order: MemOrder,
        block: BlockSize,
    ) -> IrResult<NodeId> {
        if size.is_empty() {
            return Err(IrError::invalid("Index rejects a D0 extent"));
        }
        if axis >= size.rank() {
            return Err(IrError::invalid(format!(
                "Index axis {axis} out of range for extent {size}"
            )));
        }
        Self::check_block(size, block, NodeKind::Index)?;
        let meta = MetaData::new(size, DataType::S64, order, block);
        let data = NodeData::Index { axis: axis as u8 };
        let key = NodeKey::new(&[], data.clone()).with_meta(meta);
        Ok(self.intern(key, meta, data, smallvec![], None))
    }

    /// A pseudo-random raster drawn from `dist`, keyed by a seed value.
    pub fn rand(
        &mut self,
        seed: NodeId,
        size: DataSize,
        dt: DataType,
        order: MemOrder,
        block: BlockSize,
        dist: RandDist,
    ) -> IrResult<NodeId> {
        self.check_node(seed, "Rand seed")?;
        Self::check_block(size, block, NodeKind::Rand)?;
        let meta = MetaData::new(size, dt, order, block);
        let data = NodeData::Rand { dist };
        let key = NodeKey::new(&[seed], data.clone()).with_meta(meta);
        Ok(self.intern(key, meta, data, smallvec![seed], None))
    }

    // ------------------------------------------------------------------
    // I/O factories.

    /// A raster streamed in from `path`. The format is inferred from the
    /// suffix and the metadata comes from the file itself.
    pub fn read(&mut self, path: &Path) -> IrResult<NodeId> {
        let key = NodeKey::new(&[], NodeData::Read).with_path(path);
        if let Some(&n) = self.table.get(&key) {
            trace!("value numbering hit: Read {} -> {n}", path.display());
            return Ok(n);
        }
        let handle = file::factory(path)?;
        handle.open(StreamDir::In)?;
        let meta = handle.metadata()?;
        let n = self.alloc(meta, NodeData::Read, smallvec![], Some(handle));
        self.table.insert(key, n);
        Ok(n)
    }

    /// Stream a raster out to `path`. Infers the format, configures the
    /// file from the operand's metadata, and opens it for output; any
    /// failure aborts the factory with nothing installed.
    pub fn write(&mut self, prev: NodeId, path: &Path) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::Write)?;
        let key = NodeKey::new(&[prev], NodeData::Write).with_path(path);
        if let Some(&n) = self.table.get(&key) {
            trace!("value numbering hit: Write {} -> {n}", path.display());
            return Ok(n);
        }
        let handle = file::factory(path)?;
        handle.set_metadata(pmeta, StreamDir::Out)?;
        handle.open(StreamDir::Out)?;
        let meta = pmeta.with_stream_dir(StreamDir::Out);
        let n = self.alloc(meta, NodeData::Write, smallvec![prev], Some(handle));
        self.table.insert(key, n);
        Ok(n)
    }

    /// Spill a raster to an anonymous temporary file.
    pub fn checkpoint(&mut self, prev: NodeId) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::Checkpoint)?;
        let key = NodeKey::new(&[prev], NodeData::Checkpoint);
        if let Some(&n) = self.table.get(&key) {
            return Ok(n);
        }
        let handle = file::scratch()?;
        handle.set_metadata(pmeta, StreamDir::Io)?;
        handle.open(StreamDir::Io)?;
        let meta = pmeta.with_stream_dir(StreamDir::Io);
        let n = self.alloc(meta, NodeData::Checkpoint, smallvec![prev], Some(handle));
        self.table.insert(key, n);
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Local factories.

    /// An element-wise unary operator.
    pub fn unary(&mut self, op: UnaryOp, prev: NodeId) -> IrResult<NodeId> {
        let pmeta = *self.check_node(prev, "Unary")?.meta();
        let meta = Self::derived_meta(&pmeta, op.result_type(pmeta.data_type()));
        let data = NodeData::Unary { op };
        let key = NodeKey::new(&[prev], data.clone());
        Ok(self.intern(key, meta, data, smallvec![prev], None))
    }

    /// An element-wise binary operator with scalar broadcasting: a `D0`
    /// operand combines with every cell of the other.
    pub fn binary(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> IrResult<NodeId> {
        let lm = *self.check_node(lhs, "Binary lhs")?.meta();
        let rm = *self.check_node(rhs, "Binary rhs")?.meta();
        let base = if lm.num_dim() == NumDim::D0 && rm.num_dim() != NumDim::D0 {
            rm
        } else {
            lm
        };
        if lm.num_dim() != NumDim::D0
            && rm.num_dim() != NumDim::D0
            && lm.data_size() != rm.data_size()
        {
            return Err(IrError::MetaDataMismatch { lhs: lm, rhs: rm });
        }
        let dt = op.result_type(lm.data_type(), rm.data_type());
        let meta = Self::derived_meta(&base, dt);
        let data = NodeData::Binary { op };
        let key = NodeKey::new(&[lhs, rhs], data.clone());
        Ok(self.intern(key, meta, data, smallvec![lhs, rhs], None))
    }

    /// Element-wise select: where `cond` is non-zero take `a`, else `b`.
    pub fn conditional(&mut self, cond: NodeId, a: NodeId, b: NodeId) -> IrResult<NodeId> {
        let cm = *self.check_node(cond, "Conditional cond")?.meta();
        let am = *self.check_node(a, "Conditional lhs")?.meta();
        let bm = *self.check_node(b, "Conditional rhs")?.meta();
        if cm.data_type() != DataType::U8 {
            return Err(IrError::invalid(format!(
                "Conditional condition must be u8, got {}",
                cm.data_type()
            )));
        }
        let base = if am.num_dim() == NumDim::D0 && bm.num_dim() != NumDim::D0 {
            bm
        } else {
            am
        };
        for (name, m) in [("lhs", &am), ("rhs", &bm), ("cond", &cm)] {
            if m.num_dim() != NumDim::D0 && m.data_size() != base.data_size() {
                return Err(IrError::invalid(format!(
                    "Conditional {name} extent {} does not match {}",
                    m.data_size(),
                    base.data_size()
                )));
            }
        }
        let dt = DataType::promote(am.data_type(), bm.data_type());
        let meta = Self::derived_meta(&base, dt);
        let key = NodeKey::new(&[cond, a, b], NodeData::Conditional);
        Ok(self.intern(key, meta, NodeData::Conditional, smallvec![cond, a, b], None))
    }

    /// An element-wise conversion to `to`.
    pub fn cast(&mut self, prev: NodeId, to: DataType) -> IrResult<NodeId> {
        let pmeta = *self.check_node(prev, "Cast")?.meta();
        let meta = Self::derived_meta(&pmeta, to);
        let data = NodeData::Cast { to };
        let key = NodeKey::new(&[prev], data.clone());
        Ok(self.intern(key, meta, data, smallvec![prev], None))
    }

    /// A pass-through node.
    pub fn identity(&mut self, prev: NodeId) -> IrResult<NodeId> {
        let pmeta = *self.check_node(prev, "Identity")?.meta();
        let meta = Self::derived_meta(&pmeta, pmeta.data_type());
        let key = NodeKey::new(&[prev], NodeData::Identity);
        Ok(self.intern(key, meta, NodeData::Identity, smallvec![prev], None))
    }

    // ------------------------------------------------------------------
    // Focal factories.

    /// A neighborhood reduction under a stencil mask.
    pub fn focal_func(&mut self, prev: NodeId, mask: Mask, reduc: ReductionType) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::FocalFunc)?;
        if mask.numdim() != pmeta.num_dim() {
            return Err(IrError::invalid(format!(
                "FocalFunc mask rank {} does not match operand rank {}",
                mask.numdim(),
                pmeta.num_dim()
            )));
        }
        let meta = Self::derived_meta(&pmeta, pmeta.data_type());
        let data = NodeData::FocalFunc {
            mask: mask.clone(),
            reduc,
        };
        let key = NodeKey::new(&[prev], data.clone());
        let n = self.intern(key, meta, data, smallvec![prev], None);
        self.nodes[n].in_spatial_reach = mask;
        Ok(n)
    }

    /// A neighborhood percentage/percentile statistic.
    pub fn focal_percent(
        &mut self,
        prev: NodeId,
        mask: Mask,
        percent: PercentType,
    ) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::FocalPercent)?;
        if mask.numdim() != pmeta.num_dim() {
            return Err(IrError::invalid(format!(
                "FocalPercent mask rank {} does not match operand rank {}",
                mask.numdim(),
                pmeta.num_dim()
            )));
        }
        let meta = Self::derived_meta(&pmeta, pmeta.data_type());
        let data = NodeData::FocalPercent {
            mask: mask.clone(),
            percent,
        };
        let key = NodeKey::new(&[prev], data.clone());
        let n = self.intern(key, meta, data, smallvec![prev], None);
        self.nodes[n].in_spatial_reach = mask;
        Ok(n)
    }

    /// Steepest-descent flow direction over the 3x3 neighborhood; the
    /// result encodes directions as `U8`.
    pub fn focal_flow(&mut self, prev: NodeId) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::FocalFlow)?;
        let meta = Self::derived_meta(&pmeta, DataType::U8);
        let key = NodeKey::new(&[prev], NodeData::FocalFlow);
        let n = self.intern(key, meta, NodeData::FocalFlow, smallvec![prev], None);
        let rank = pmeta.num_dim().rank();
        self.nodes[n].in_spatial_reach = Mask::full(Coord::fill(rank, 3));
        Ok(n)
    }

    /// The value of the cell at a fixed offset from the centre.
    pub fn neighbor(&mut self, prev: NodeId, offset: Coord) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::Neighbor)?;
        if offset.rank() != pmeta.num_dim().rank() {
            return Err(IrError::invalid(format!(
                "Neighbor offset {offset} does not match operand rank {}",
                pmeta.num_dim()
            )));
        }
        let meta = Self::derived_meta(&pmeta, pmeta.data_type());
        let data = NodeData::Neighbor { offset };
        let key = NodeKey::new(&[prev], data.clone());
        let n = self.intern(key, meta, data, smallvec![prev], None);
        let rank = offset.rank();
        let reach = offset.abs() * Coord::fill(rank, 2) + Coord::fill(rank, 1);
        self.nodes[n].in_spatial_reach = Mask::full(reach);
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Zonal, radial, and spreading factories.

    /// Reduce a whole raster to one scalar.
    pub fn zonal_reduc(&mut self, prev: NodeId, reduc: ReductionType) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::ZonalReduc)?;
        let meta = MetaData::new(
            DataSize::default(),
            pmeta.data_type(),
            pmeta.mem_order(),
            BlockSize::default(),
        );
        let data = NodeData::ZonalReduc { reduc };
        let key = NodeKey::new(&[prev], data.clone());
        Ok(self.intern(key, meta, data, smallvec![prev], None))
    }

    /// Iterative propagation outward from `start`.
    pub fn radial_scan(&mut self, prev: NodeId, start: Coord) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::RadialScan)?;
        if start.rank() != pmeta.num_dim().rank() {
            return Err(IrError::invalid(format!(
                "RadialScan start {start} does not match operand rank {}",
                pmeta.num_dim()
            )));
        }
        let meta = Self::derived_meta(&pmeta, pmeta.data_type());
        let data = NodeData::RadialScan { start };
        let key = NodeKey::new(&[prev], data.clone());
        Ok(self.intern(key, meta, data, smallvec![prev], None))
    }

    /// Iterative front propagation along a `U8` direction raster.
    ///
    /// Besides the two visible operands the scan keeps three internal
    /// temporals: the spreading front, a double buffer for it, and a `U16`
    /// stability raster recording which cells changed last round. All five
    /// operand slots are populated and every temporal registers the scan as
    /// its consumer.
    pub fn spread_scan(
        &mut self,
        prev: NodeId,
        dir: NodeId,
        reduc: ReductionType,
    ) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::SpreadScan)?;
        let dmeta = *self.check_node(dir, "SpreadScan dir")?.meta();
        if dmeta.data_type() != DataType::U8 {
            return Err(IrError::invalid(format!(
                "SpreadScan direction must be u8, got {}",
                dmeta.data_type()
            )));
        }
        if dmeta.data_size() != pmeta.data_size() {
            return Err(IrError::MetaDataMismatch {
                lhs: pmeta,
                rhs: dmeta,
            });
        }
        let data = NodeData::SpreadScan { reduc };
        let key = NodeKey::new(&[prev, dir], data.clone());
        if let Some(&n) = self.table.get(&key) {
            trace!("value numbering hit: SpreadScan -> {n}");
            return Ok(n);
        }
        let spread = self.temporal(pmeta.with_stream_dir(StreamDir::None));
        let buffer = self.temporal(pmeta.with_stream_dir(StreamDir::None));
        let stable = self.temporal(pmeta.with_data_type(DataType::U16));
        let meta = Self::derived_meta(&pmeta, pmeta.data_type());
        let n = self.alloc(meta, data, smallvec![prev, dir, spread, buffer, stable], None);
        self.table.insert(key, n);
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Boundary, join, and auxiliary factories.

    /// A materialization boundary between fused regions.
    pub fn barrier(&mut self, prev: NodeId) -> IrResult<NodeId> {
        let pmeta = *self.check_node(prev, "Barrier")?.meta();
        let meta = Self::derived_meta(&pmeta, pmeta.data_type());
        let key = NodeKey::new(&[prev], NodeData::Barrier);
        Ok(self.intern(key, meta, NodeData::Barrier, smallvec![prev], None))
    }

    /// Join two alternative values of an if-else region.
    ///
    /// Both operands arrive positionally and must agree on metadata modulo
    /// stream direction.
    pub fn merge_ifelse(&mut self, lhs: NodeId, rhs: NodeId) -> IrResult<NodeId> {
        let lm = *self.check_node(lhs, "Merge lhs")?.meta();
        let rm = *self.check_node(rhs, "Merge rhs")?.meta();
        if !lm.same_value_shape(&rm) {
            return Err(IrError::MetaDataMismatch { lhs: lm, rhs: rm });
        }
        let meta = lm.with_stream_dir(Self::join_stream(lm.stream_dir(), rm.stream_dir()));
        let data = NodeData::Merge {
            mode: MergeMode::IfElse,
        };
        let key = NodeKey::new(&[lhs, rhs], data.clone());
        if let Some(&n) = self.table.get(&key) {
            return Ok(n);
        }
        let file = match (self.nodes[lhs].file.clone(), self.nodes[rhs].file.clone()) {
            (Some(a), Some(b)) if std::sync::Arc::ptr_eq(&a, &b) => Some(b),
            _ => None,
        };
        let n = self.alloc(meta, data, smallvec![lhs, rhs], file);
        self.table.insert(key, n);
        Ok(n)
    }

    /// Route one of two values by a scalar condition.
    pub fn switch(&mut self, cond: NodeId, a: NodeId, b: NodeId) -> IrResult<NodeId> {
        let cm = *self.check_node(cond, "Switch cond")?.meta();
        if cm.num_dim() != NumDim::D0 || cm.data_type() != DataType::U8 {
            return Err(IrError::invalid(format!(
                "Switch condition must be a u8 scalar, got {} {}",
                cm.num_dim(),
                cm.data_type()
            )));
        }
        let am = *self.check_node(a, "Switch lhs")?.meta();
        let bm = *self.check_node(b, "Switch rhs")?.meta();
        if !am.same_value_shape(&bm) {
            return Err(IrError::MetaDataMismatch { lhs: am, rhs: bm });
        }
        let meta = am.with_stream_dir(Self::join_stream(am.stream_dir(), bm.stream_dir()));
        let key = NodeKey::new(&[cond, a, b], NodeData::Switch);
        Ok(self.intern(key, meta, NodeData::Switch, smallvec![cond, a, b], None))
    }

    /// Read one cell at a fixed coordinate, as a scalar.
    pub fn access(&mut self, prev: NodeId, coord: Coord) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::Access)?;
        let size = pmeta.data_size();
        if coord.rank() != size.rank()
            || (0..coord.rank()).any(|ax| coord.get(ax) < 0 || coord.get(ax) >= size.get(ax))
        {
            return Err(IrError::invalid(format!(
                "Access coordinate {coord} outside extent {size}"
            )));
        }
        let meta = MetaData::new(
            DataSize::default(),
            pmeta.data_type(),
            pmeta.mem_order(),
            BlockSize::default(),
        );
        let data = NodeData::Access { coord };
        let key = NodeKey::new(&[prev], data.clone());
        Ok(self.intern(key, meta, data, smallvec![prev], None))
    }

    /// An anonymous intermediate raster. Temporals are never value
    /// numbered: each call materializes a fresh one.
    pub fn temporal(&mut self, meta: MetaData) -> NodeId {
        self.alloc(meta, NodeData::Temporal, smallvec![], None)
    }

    /// A whole-raster statistic reduced to a scalar.
    pub fn summary(&mut self, prev: NodeId, reduc: ReductionType) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::Summary)?;
        let meta = MetaData::new(
            DataSize::default(),
            pmeta.data_type(),
            pmeta.mem_order(),
            BlockSize::default(),
        );
        let data = NodeData::Summary { reduc };
        let key = NodeKey::new(&[prev], data.clone());
        Ok(self.intern(key, meta, data, smallvec![prev], None))
    }

    /// Per-block statistics of a raster: one cell per block.
    pub fn stats(&mut self, prev: NodeId) -> IrResult<NodeId> {
        let pmeta = self.check_raster(prev, NodeKind::Stats)?;
        let shape = pmeta.data_shape();
        if shape.is_empty() {
            return Err(IrError::invalid(
                "Stats needs an operand with a block decomposition",
            ));
        }
        let meta = MetaData::new(
            shape,
            pmeta.data_type(),
            pmeta.mem_order(),
            Coord::fill(shape.rank(), 1),
        );
        let key = NodeKey::new(&[prev], NodeData::Stats);
        Ok(self.intern(key, meta, NodeData::Stats, smallvec![prev], None))
    }

    // ------------------------------------------------------------------
    // Merge accessors and constant folding.

    /// The left operand of a merge: always `prev[0]`.
    pub fn merge_left(&self, n: NodeId) -> IrResult<NodeId> {
        let node = self.check_node(n, "Merge")?;
        match node.data() {
            NodeData::Merge { .. } => Ok(node.prev()[0]),
            _ => Err(IrError::invalid(format!("{n} is not a Merge"))),
        }
    }

    /// The right operand of a merge: `prev[1]` when both operands are
    /// positional, otherwise the single `forw` back-edge.
    pub fn merge_right(&self, n: NodeId) -> IrResult<NodeId> {
        let node = self.check_node(n, "Merge")?;
        match node.data() {
            NodeData::Merge { .. } => {}
            _ => return Err(IrError::invalid(format!("{n} is not a Merge"))),
        }
        if node.prev().len() + node.forw().len() != 2 {
            return Err(IrError::invalid(format!(
                "{n} is an unsealed merge with no right operand yet"
            )));
        }
        if node.prev().len() == 2 {
            Ok(node.prev()[1])
        } else {
            Ok(node.forw()[0])
        }
    }

    /// Fold one node in a scalar environment.
    ///
    /// Constants fold to their value. A `D0` merge expects exactly one of
    /// its operands to be resolved in `env` and propagates that value; both
    /// or neither resolved is a construction error in the caller's fold
    /// order.
    pub fn compute_scalar(
        &self,
        n: NodeId,
        env: &mut FxHashMap<NodeId, DataValue>,
    ) -> IrResult<DataValue> {
        let node = self.check_node(n, "fold")?;
        let value = match node.data() {
            NodeData::Constant { value } => *value,
            NodeData::Merge { .. } => {
                if node.meta().num_dim() != NumDim::D0 {
                    return Err(IrError::invalid(format!("{n} is not a D0 merge")));
                }
                let left = env.get(&self.merge_left(n)?).copied();
                let right = env.get(&self.merge_right(n)?).copied();
                match (left, right) {
                    (Some(v), None) | (None, Some(v)) => v,
                    _ => {
                        return Err(IrError::invalid(format!(
                            "merge {n} fold requires exactly one resolved operand"
                        )));
                    }
                }
            }
            _ => {
                return Err(IrError::invalid(format!(
                    "scalar folding is not defined for {}",
                    node.kind().name()
                )));
            }
        };
        env.insert(n, value);
        Ok(value)
    }

    /// Coordinate-wise analogue of [`Dag::compute_scalar`].
    pub fn compute_fixed(
        &self,
        n: NodeId,
        coord: Coord,
        env: &mut FxHashMap<(NodeId, Coord), ValFix>,
    ) -> IrResult<ValFix> {
        let node = self.check_node(n, "fold")?;
        let vf = match node.data() {
            NodeData::Constant { value } => ValFix::fixed(*value),
            NodeData::Write => {
                let prev = node.prev()[0];
                *env.get(&(prev, coord)).ok_or_else(|| {
                    IrError::invalid(format!("write {n} fold requires its operand resolved"))
                })?
            }
            NodeData::Merge { .. } => {
                let left = env.get(&(self.merge_left(n)?, coord)).copied();
                let right = env.get(&(self.merge_right(n)?, coord)).copied();
                match (left, right) {
                    (Some(v), None) | (None, Some(v)) => v,
                    _ => {
                        return Err(IrError::invalid(format!(
                            "merge {n} fold requires exactly one resolved operand"
                        )));
                    }
                }
            }
            _ => {
                return Err(IrError::invalid(format!(
                    "fixed folding is not defined for {}",
                    node.kind().name()
                )));
            }
        };
        env.insert((n, coord), vf);
        Ok(vf)
    }

    // ------------------------------------------------------------------
    // Cloning.

    /// Clone a subgraph, returning the old-to-new mapping.
    ///
    /// Nodes are cloned in a stable arena order and every internal edge is
    /// rebuilt against the cloned peers; operands outside the set are kept
    /// as shared inputs. Feedback twins inside the set are rewired through
    /// the mapping. Clones get fresh ids and bypass value numbering.
    pub fn clone_subgraph(&mut self, set: &[NodeId]) -> IrResult<FxHashMap<NodeId, NodeId>> {
        for &n in set {
            self.check_node(n, "clone")?;
        }
        let mut order: Vec<NodeId> = set.to_vec();
        order.sort_unstable();
        order.dedup();

        let mut map = FxHashMap::default();
        for &old in &order {
            let src = &self.nodes[old];
            let node = Node {
                id: self.next_id,
                meta: src.meta,
                data: src.data.clone(),
                prev: SmallVec::new(),
                next: SmallVec::new(),
                back: SmallVec::new(),
                forw: SmallVec::new(),
                file: src.file.clone(),
                in_spatial_reach: src.in_spatial_reach.clone(),
                out_spatial_reach: src.out_spatial_reach.clone(),
            };
            self.next_id += 1;
            self.live += 1;
            let new = self.nodes.push(node);
            map.insert(old, new);
        }

        for &old in &order {
            let new = map[&old];
            let prev: SmallVec<[NodeId; 4]> = self.nodes[old]
                .prev
                .iter()
                .map(|p| map.get(p).copied().unwrap_or(*p))
                .collect();
            for &p in &prev {
                self.add_next(p, new);
            }
            self.nodes[new].prev = prev;

            let forw: SmallVec<[NodeId; 2]> = self.nodes[old].forw.clone();
            for t in forw {
                let to = map.get(&t).copied().unwrap_or(t);
                self.link_forw(new, to);
            }

            if let NodeData::Feedback {
                twin: Some(twin), ..
            } = &mut self.nodes[new].data
            {
                if let Some(&mapped) = map.get(twin) {
                    *twin = mapped;
                }
            }
        }
        Ok(map)
    }

    /// Retire killed nodes: evict every value-numbering entry that names
    /// or references them and mark them dead.
    pub(crate) fn retire_nodes(&mut self, kill: &FxHashSet<NodeId>) {
        self.table
            .retain(|key, n| !kill.contains(n) && !key.prev.iter().any(|p| kill.contains(p)));
        for &n in kill {
            if self.dead.insert(n) {
                self.live -= 1;
            }
        }
    }

    /// Check the dag's structural invariants: primary edge symmetry,
    /// control edge symmetry, and acyclicity of the `prev` graph.
    pub fn verify(&self) -> IrResult<()> {
        for (a, node) in self.nodes() {
            for &b in node.next() {
                if !self.nodes[b].prev.contains(&a) {
                    return Err(IrError::invalid(format!(
                        "{b} in next({a}) but {a} not in prev({b})"
                    )));
                }
            }
            for &p in node.prev() {
                if !self.nodes[p].next.contains(&a) {
                    return Err(IrError::invalid(format!(
                        "{p} in prev({a}) but {a} not in next({p})"
                    )));
                }
            }
            for &t in node.forw() {
                if !self.nodes[t].back.contains(&a) {
                    return Err(IrError::invalid(format!("forw({a}) not mirrored in back({t})")));
                }
            }
            for &t in node.back() {
                if !self.nodes[t].forw.contains(&a) {
                    return Err(IrError::invalid(format!("back({a}) not mirrored in forw({t})")));
                }
            }
        }

        // Feedback cycles may only run over forw/back edges; the primary
        // graph must stay a dag for the scheduler.
        let mut state: FxHashMap<NodeId, u8> = FxHashMap::default();
        for (root, _) in self.nodes() {
            if state.get(&root).copied() == Some(2) {
                continue;
            }
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
            state.insert(root, 1);
            while let Some(&(n, idx)) = stack.last() {
                let prevs = &self.nodes[n].prev;
                if idx < prevs.len() {
                    let p = prevs[idx];
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match state.get(&p).copied() {
                        Some(1) => {
                            return Err(IrError::invalid(format!(
                                "cycle through {p} in the primary graph"
                            )));
                        }
                        Some(2) => {}
                        _ => {
                            state.insert(p, 1);
                            stack.push((p, 0));
                        }
                    }
                } else {
                    state.insert(n, 2);
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Signatures.

    fn push_operand_sig(&self, s: &mut String, n: NodeId) {
        let meta = self.nodes[n].meta();
        s.push_str(&format!("{}{}", meta.num_dim(), meta.data_type()));
    }

    /// The deterministic signature of a node: the kernel-cache key.
    ///
    /// The signature aggregates the version tag, the kind tag, and every
    /// field that can influence generated device code. Two nodes with equal
    /// signatures are observationally identical to the code generator.
    pub fn signature(&self, n: NodeId) -> String {
        let node = &self.nodes[n];
        let mut s = String::new();
        s.push(SIGNATURE_VERSION);
        s.push(node.kind().class_signature());
        match node.data() {
            NodeData::Constant { value } => {
                s.push_str(&format!(
                    "{}{}{value}",
                    node.meta().num_dim(),
                    node.meta().data_type()
                ));
            }
            NodeData::Empty | NodeData::Temporal => {
                s.push_str(&format!(
                    "{}{}",
                    node.meta().num_dim(),
                    node.meta().data_type()
                ));
            }
            NodeData::Index { axis } => {
                s.push_str(&format!("{}{}", node.meta().num_dim(), axis));
            }
            NodeData::Rand { dist } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&format!(
                    "{}{}{dist}",
                    node.meta().num_dim(),
                    node.meta().data_type()
                ));
            }
            NodeData::Read | NodeData::Write => {
                if let NodeData::Write = node.data() {
                    self.push_operand_sig(&mut s, node.prev()[0]);
                } else {
                    s.push_str(&format!(
                        "{}{}",
                        node.meta().num_dim(),
                        node.meta().data_type()
                    ));
                }
                if let Some(file) = node.file() {
                    s.push_str(&file.path().display().to_string());
                }
            }
            NodeData::Checkpoint | NodeData::Barrier | NodeData::FocalFlow | NodeData::Identity => {
                self.push_operand_sig(&mut s, node.prev()[0]);
            }
            NodeData::Unary { op } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&op.to_string());
            }
            NodeData::Binary { op } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                self.push_operand_sig(&mut s, node.prev()[1]);
                s.push_str(&op.to_string());
            }
            NodeData::Conditional | NodeData::Switch => {
                for &p in node.prev() {
                    self.push_operand_sig(&mut s, p);
                }
            }
            NodeData::Cast { to } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&to.to_string());
            }
            NodeData::FocalFunc { mask, reduc } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&mask.signature());
                s.push_str(&reduc.to_string());
            }
            NodeData::FocalPercent { mask, percent } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&mask.signature());
                s.push_str(&percent.to_string());
            }
            NodeData::Neighbor { offset } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&offset.to_string());
            }
            NodeData::ZonalReduc { reduc } | NodeData::Summary { reduc } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&reduc.to_string());
            }
            NodeData::RadialScan { start } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&start.to_string());
            }
            NodeData::SpreadScan { reduc } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                self.push_operand_sig(&mut s, node.prev()[1]);
                s.push_str(&reduc.to_string());
            }
            NodeData::Access { coord } => {
                self.push_operand_sig(&mut s, node.prev()[0]);
                s.push_str(&coord.to_string());
            }
            NodeData::Stats => {
                self.push_operand_sig(&mut s, node.prev()[0]);
            }
            NodeData::LoopCond { .. }
            | NodeData::LoopHead { .. }
            | NodeData::LoopTail { .. }
            | NodeData::Feedback { .. } => {
                s.push_str(&format!(
                    "{}{}",
                    node.meta().num_dim(),
                    node.meta().data_type()
                ));
            }
            NodeData::Merge { .. } => {
                if let Ok(left) = self.merge_left(n) {
                    self.push_operand_sig(&mut s, left);
                }
                if let Ok(right) = self.merge_right(n) {
                    self.push_operand_sig(&mut s, right);
                }
            }
        }
        s
    }
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Index<NodeId> for Dag {
    type Output = Node;

    fn index(&self, n: NodeId) -> &Node {
        &self.nodes[n]
    }
}

/// Object that can display a node for debugging.
pub struct DisplayNode<'a>(pub(crate) &'a Dag, pub(crate) NodeId);

impl std::fmt::Display for DisplayNode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let node = &self.0.nodes[self.1];
        write!(f, "{} = {}", self.1, node.kind().name())?;
        if !node.prev().is_empty() {
            write!(f, "(")?;
            for (i, p) in node.prev().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{p}")?;
            }
            write!(f, ")")?;
        }
        write!(f, " : {}{}", node.meta().num_dim(), node.meta().data_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NumDim;

    fn meta_args() -> (DataSize, MemOrder, BlockSize) {
        (Coord::new(&[4, 4]), MemOrder::RowPos, Coord::new(&[2, 2]))
    }

    fn raster(dag: &mut Dag, dt: DataType) -> NodeId {
        let (size, order, block) = meta_args();
        dag.empty(size, dt, order, block).unwrap()
    }

    #[test]
    fn constants_are_value_numbered() {
        let mut dag = Dag::new();
        let a = dag.scalar(DataValue::from(3.14f32)).unwrap();
        let b = dag.scalar(DataValue::from(3.14f32)).unwrap();
        assert_eq!(a, b);
        assert_eq!(dag.node_count(), 1);

        let c = dag.scalar(DataValue::from(2.71f32)).unwrap();
        assert_ne!(a, c);
        assert_eq!(dag.node_count(), 2);
    }

    #[test]
    fn zonal_edges_and_metadata() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let z = dag.zonal_reduc(r, ReductionType::Sum).unwrap();

        assert!(dag.node(r).next().contains(&z));
        assert_eq!(dag.node(z).prev()[0], r);
        assert_eq!(dag.node(z).meta().num_dim(), NumDim::D0);
        assert_eq!(dag.node(z).meta().data_type(), DataType::F32);
        dag.verify().unwrap();
    }

    #[test]
    fn focal_flow_metadata() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let flow = dag.focal_flow(r).unwrap();

        let node = dag.node(flow);
        assert_eq!(node.meta().data_type(), DataType::U8);
        assert_eq!(node.meta().num_dim(), dag.node(r).meta().num_dim());
        assert_eq!(node.halo(), Coord::new(&[1, 1]));
    }

    #[test]
    fn focal_rejects_scalars() {
        let mut dag = Dag::new();
        let s = dag.scalar(DataValue::from(1i32)).unwrap();
        let before = dag.node_count();

        let err = dag.focal_flow(s).unwrap_err();
        assert!(matches!(err, IrError::InvalidConstruction(_)));
        assert_eq!(dag.node_count(), before);
    }

    #[test]
    fn binary_broadcast_and_promotion() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::U16);
        let k = dag.scalar(DataValue::from(2i32)).unwrap();

        let sum = dag.binary(BinaryOp::Add, r, k).unwrap();
        let node = dag.node(sum);
        assert_eq!(node.meta().data_size(), Coord::new(&[4, 4]));
        assert_eq!(node.meta().data_type(), DataType::S32);

        let cmp = dag.binary(BinaryOp::Less, r, k).unwrap();
        assert_eq!(dag.node(cmp).meta().data_type(), DataType::U8);

        // Same operator, same operands: one node.
        let again = dag.binary(BinaryOp::Add, r, k).unwrap();
        assert_eq!(sum, again);
        dag.verify().unwrap();
    }

    #[test]
    fn binary_extent_mismatch() {
        let mut dag = Dag::new();
        let a = raster(&mut dag, DataType::F32);
        let b = dag
            .empty(
                Coord::new(&[8, 8]),
                DataType::F32,
                MemOrder::RowPos,
                Coord::new(&[2, 2]),
            )
            .unwrap();
        assert!(matches!(
            dag.binary(BinaryOp::Add, a, b),
            Err(IrError::MetaDataMismatch { .. })
        ));
    }

    #[test]
    fn focal_func_reach_is_its_mask() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let mask = Mask::full(Coord::new(&[3, 3]));
        let f = dag.focal_func(r, mask.clone(), ReductionType::Max).unwrap();

        assert_eq!(dag.node(f).in_spatial_reach(), &mask);
        assert_eq!(dag.node(f).halo(), Coord::new(&[1, 1]));

        let again = dag.focal_func(r, mask, ReductionType::Max).unwrap();
        assert_eq!(f, again);
        let other = dag
            .focal_func(r, Mask::full(Coord::new(&[5, 5])), ReductionType::Max)
            .unwrap();
        assert_ne!(f, other);
    }

    #[test]
    fn spread_scan_populates_all_operands() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let dir = raster(&mut dag, DataType::U8);
        let scan = dag.spread_scan(r, dir, ReductionType::Max).unwrap();

        let prev: Vec<NodeId> = dag.node(scan).prev().to_vec();
        assert_eq!(prev.len(), 5);
        assert_eq!(prev[0], r);
        assert_eq!(prev[1], dir);
        for &t in &prev[2..] {
            assert_eq!(dag.node(t).kind(), NodeKind::Temporal);
            assert!(dag.node(t).next().contains(&scan));
        }
        // The stability raster is widened to u16.
        assert_eq!(dag.node(prev[4]).meta().data_type(), DataType::U16);
        dag.verify().unwrap();

        // The scan itself is value numbered on its visible operands.
        let again = dag.spread_scan(r, dir, ReductionType::Max).unwrap();
        assert_eq!(scan, again);
    }

    #[test]
    fn spread_scan_rejects_bad_direction() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let dir = raster(&mut dag, DataType::U32);
        assert!(dag.spread_scan(r, dir, ReductionType::Max).is_err());
    }

    #[test]
    fn write_rejects_scalars() {
        let mut dag = Dag::new();
        let s = dag.scalar(DataValue::from(0i32)).unwrap();
        assert!(dag.write(s, Path::new("out.bin")).is_err());
    }

    #[test]
    fn read_write_round_trip_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.bin");

        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let w = dag.write(r, &path).unwrap();
        assert_eq!(dag.node(w).meta().stream_dir(), StreamDir::Out);
        assert!(dag.node(w).file().is_some());

        let rd = dag.read(&path).unwrap();
        let node = dag.node(rd);
        assert_eq!(node.meta().data_size(), Coord::new(&[4, 4]));
        assert_eq!(node.meta().data_type(), DataType::F32);
        assert_eq!(node.meta().stream_dir(), StreamDir::In);

        // Reading the same path again returns the canonical node.
        assert_eq!(dag.read(&path).unwrap(), rd);
    }

    #[test]
    fn checkpoint_streams_both_ways() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::S32);
        let ck = dag.checkpoint(r).unwrap();
        assert_eq!(dag.node(ck).meta().stream_dir(), StreamDir::Io);
        assert!(dag.node(ck).file().is_some());
        assert_eq!(dag.checkpoint(r).unwrap(), ck);
    }

    #[test]
    fn merge_ifelse_checks_shapes() {
        let mut dag = Dag::new();
        let a = raster(&mut dag, DataType::F32);
        let b = raster(&mut dag, DataType::F64);
        assert!(matches!(
            dag.merge_ifelse(a, b),
            Err(IrError::MetaDataMismatch { .. })
        ));

        let c = raster(&mut dag, DataType::F32);
        assert_eq!(a, c); // same empty raster, value numbered
        let d = dag.unary(UnaryOp::Sqrt, a).unwrap();
        let m = dag.merge_ifelse(a, d).unwrap();
        assert_eq!(dag.merge_left(m).unwrap(), a);
        assert_eq!(dag.merge_right(m).unwrap(), d);
        assert_eq!(dag.node(m).meta().stream_dir(), StreamDir::Io);
    }

    #[test]
    fn signatures_are_deterministic_across_builds() {
        let build = || {
            let mut dag = Dag::new();
            let r = raster(&mut dag, DataType::F32);
            let f = dag
                .focal_func(r, Mask::full(Coord::new(&[3, 3])), ReductionType::Min)
                .unwrap();
            let z = dag.zonal_reduc(f, ReductionType::Sum).unwrap();
            (dag.signature(r), dag.signature(f), dag.signature(z))
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn signatures_separate_kinds_and_params() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let zs = dag.zonal_reduc(r, ReductionType::Sum).unwrap();
        let zm = dag.zonal_reduc(r, ReductionType::Max).unwrap();
        assert_ne!(dag.signature(zs), dag.signature(zm));
        assert!(dag.signature(zs).starts_with("1Z"));
    }

    #[test]
    fn scalar_folding() {
        let mut dag = Dag::new();
        let k = dag.scalar(DataValue::from(7i64)).unwrap();
        let mut env = FxHashMap::default();
        assert_eq!(
            dag.compute_scalar(k, &mut env).unwrap(),
            DataValue::from(7i64)
        );
        assert_eq!(env.get(&k), Some(&DataValue::from(7i64)));

        // Folding is undefined for spatial operators.
        let r = raster(&mut dag, DataType::F32);
        assert!(dag.compute_scalar(r, &mut env).is_err());
    }

    #[test]
    fn fixed_folding_propagates_through_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fold.bin");

        let mut dag = Dag::new();
        let c = dag
            .constant(
                DataValue::from(9i32),
                Coord::new(&[4, 4]),
                MemOrder::RowPos,
                Coord::new(&[2, 2]),
            )
            .unwrap();
        let w = dag.write(c, &path).unwrap();

        let coord = Coord::new(&[1, 0]);
        let mut env = FxHashMap::default();
        // The write needs its operand resolved first.
        assert!(dag.compute_fixed(w, coord, &mut env).is_err());

        let vf = dag.compute_fixed(c, coord, &mut env).unwrap();
        assert!(vf.fixed);
        assert_eq!(
            dag.compute_fixed(w, coord, &mut env).unwrap(),
            ValFix::fixed(DataValue::from(9i32))
        );
    }

    #[test]
    fn clone_preserves_structure() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let f = dag.focal_flow(r).unwrap();
        let z = dag.zonal_reduc(f, ReductionType::Or).unwrap();

        let map = dag.clone_subgraph(&[r, f, z]).unwrap();
        assert_eq!(map.len(), 3);
        for (&old, &new) in &map {
            assert_ne!(old, new);
            assert_ne!(dag.node(old).id(), dag.node(new).id());
            assert_eq!(dag.signature(old), dag.signature(new));
        }
        let nf = map[&f];
        assert_eq!(dag.node(nf).prev()[0], map[&r]);
        assert!(dag.node(map[&r]).next().contains(&nf));
        dag.verify().unwrap();
    }

    #[test]
    fn source_metadata_rules() {
        let mut dag = Dag::new();
        let (size, order, block) = meta_args();

        let idx = dag.index(size, 1, order, block).unwrap();
        assert_eq!(dag.node(idx).meta().data_type(), DataType::S64);
        assert!(dag.index(size, 2, order, block).is_err());

        let seed = dag.scalar(DataValue::from(42i64)).unwrap();
        let noise = dag
            .rand(seed, size, DataType::F32, order, block, RandDist::Uniform)
            .unwrap();
        assert_eq!(dag.node(noise).prev()[0], seed);
        assert_eq!(dag.node(noise).meta().data_shape(), Coord::new(&[2, 2]));

        // A raster constant needs a usable block decomposition.
        assert!(dag
            .constant(DataValue::from(0u8), size, order, BlockSize::default())
            .is_err());
    }

    #[test]
    fn local_metadata_rules() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::U16);

        let wide = dag.cast(r, DataType::F64).unwrap();
        assert_eq!(dag.node(wide).meta().data_type(), DataType::F64);

        let zero = dag.scalar(DataValue::from(0i32)).unwrap();
        let mask = dag.binary(BinaryOp::Greater, r, zero).unwrap();
        let pick = dag.conditional(mask, wide, r).unwrap();
        assert_eq!(dag.node(pick).meta().data_type(), DataType::F64);
        assert_eq!(dag.node(pick).prev(), &[mask, wide, r]);

        // The condition must be a truth mask.
        assert!(dag.conditional(r, wide, r).is_err());

        let same = dag.identity(r).unwrap();
        assert_eq!(dag.node(same).pattern(), crate::ir::Pattern::Local);

        let near = dag.neighbor(r, Coord::new(&[0, -2])).unwrap();
        assert_eq!(dag.node(near).halo(), Coord::new(&[0, 2]));
    }

    #[test]
    fn collapse_and_join_rules() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);

        let total = dag.summary(r, ReductionType::Sum).unwrap();
        assert_eq!(dag.node(total).meta().num_dim(), NumDim::D0);

        let per_block = dag.stats(r).unwrap();
        assert_eq!(dag.node(per_block).meta().data_size(), Coord::new(&[2, 2]));
        assert_eq!(dag.node(per_block).meta().block_size(), Coord::new(&[1, 1]));

        let cell = dag.access(r, Coord::new(&[3, 0])).unwrap();
        assert_eq!(dag.node(cell).meta().num_dim(), NumDim::D0);
        assert!(dag.access(r, Coord::new(&[4, 0])).is_err());

        let wall = dag.barrier(r).unwrap();
        assert_eq!(dag.node(wall).pattern(), crate::ir::Pattern::Barrier);
        assert_eq!(dag.node(wall).meta(), dag.node(r).meta());

        let scan = dag.radial_scan(r, Coord::new(&[0, 0])).unwrap();
        assert_eq!(dag.node(scan).pattern(), crate::ir::Pattern::Radial);

        // Switch needs a scalar condition and agreeing arms.
        let flow = dag.focal_flow(r).unwrap();
        let flag = dag.zonal_reduc(flow, ReductionType::Or).unwrap();
        let other = dag.unary(UnaryOp::Sqrt, r).unwrap();
        let routed = dag.switch(flag, r, other).unwrap();
        assert_eq!(dag.node(routed).prev(), &[flag, r, other]);
        assert!(dag.switch(other, r, other).is_err());

        let pct = dag
            .focal_percent(r, Mask::full(Coord::new(&[3, 3])), PercentType::Percentile)
            .unwrap();
        assert_eq!(dag.node(pct).halo(), Coord::new(&[1, 1]));
        dag.verify().unwrap();
    }

    #[test]
    fn display() {
        let mut dag = Dag::new();
        let r = raster(&mut dag, DataType::F32);
        let f = dag.focal_flow(r).unwrap();
        assert_eq!(dag.display_node(f).to_string(), "n1 = FocalFlow(n0) : D2u8");
    }
}
