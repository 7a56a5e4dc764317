//! The immutable metadata bundle every node carries.

use crate::ir::dims::{BlockSize, DataShape, DataSize, MemOrder, NumDim, StreamDir};
use crate::ir::types::DataType;

/// Type, shape, order, and streaming metadata of one IR value.
///
/// A `MetaData` is a plain value; once a node is inserted into a dag its
/// metadata never changes. The derived fields (`num_dim`, `data_shape`) are
/// computed from the extent at construction, never stored independently by
/// callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetaData {
    data_size: DataSize,
    data_type: DataType,
    mem_order: MemOrder,
    block_size: BlockSize,
    num_dim: NumDim,
    data_shape: DataShape,
    stream_dir: StreamDir,
}

impl MetaData {
    /// Bundle the four caller-facing fields and derive the rest.
    ///
    /// `data_shape` is the per-axis block count, `ceil(data_size /
    /// block_size)`; it stays empty when the extent is `D0` or no positive
    /// block extent of matching rank is given.
    pub fn new(
        data_size: DataSize,
        data_type: DataType,
        mem_order: MemOrder,
        block_size: BlockSize,
    ) -> Self {
        let num_dim = data_size.numdim();
        let data_shape = if !data_size.is_empty()
            && block_size.rank() == data_size.rank()
            && block_size.all_positive()
        {
            data_size.ceil_div(block_size)
        } else {
            DataShape::default()
        };
        Self {
            data_size,
            data_type,
            mem_order,
            block_size,
            num_dim,
            data_shape,
            stream_dir: StreamDir::None,
        }
    }

    /// The cell extent.
    pub fn data_size(&self) -> DataSize {
        self.data_size
    }

    /// The cell type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The traversal order.
    pub fn mem_order(&self) -> MemOrder {
        self.mem_order
    }

    /// The block extent.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// The dimensionality, derived from the extent.
    pub fn num_dim(&self) -> NumDim {
        self.num_dim
    }

    /// The per-axis block count, derived from extent and block extent.
    pub fn data_shape(&self) -> DataShape {
        self.data_shape
    }

    /// The streaming direction.
    pub fn stream_dir(&self) -> StreamDir {
        self.stream_dir
    }

    /// The same bundle with another streaming direction.
    pub fn with_stream_dir(mut self, dir: StreamDir) -> Self {
        self.stream_dir = dir;
        self
    }

    /// The same bundle with another cell type.
    pub fn with_data_type(mut self, dt: DataType) -> Self {
        self.data_type = dt;
        self
    }

    /// Whether two bundles describe the same value shape: equal on every
    /// field except the streaming direction. This is the agreement merges
    /// and switches require of their operands.
    pub fn same_value_shape(&self, other: &Self) -> bool {
        self.data_size == other.data_size
            && self.data_type == other.data_type
            && self.mem_order == other.mem_order
            && self.block_size == other.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::dims::Coord;

    #[test]
    fn derived_fields() {
        let meta = MetaData::new(
            Coord::new(&[100, 60]),
            DataType::F32,
            MemOrder::RowPos,
            Coord::new(&[32, 32]),
        );
        assert_eq!(meta.num_dim(), NumDim::D2);
        assert_eq!(meta.data_shape(), Coord::new(&[4, 2]));
        assert_eq!(meta.stream_dir(), StreamDir::None);
    }

    #[test]
    fn scalar_metadata() {
        let meta = MetaData::new(
            DataSize::default(),
            DataType::U8,
            MemOrder::RowPos,
            BlockSize::default(),
        );
        assert_eq!(meta.num_dim(), NumDim::D0);
        assert!(meta.data_shape().is_empty());
    }

    #[test]
    fn value_shape_ignores_stream() {
        let a = MetaData::new(
            Coord::new(&[8, 8]),
            DataType::S32,
            MemOrder::RowPos,
            Coord::new(&[4, 4]),
        );
        let b = a.with_stream_dir(StreamDir::Io);
        assert!(a.same_value_shape(&b));
        assert!(!a.same_value_shape(&a.with_data_type(DataType::S64)));
    }
}
