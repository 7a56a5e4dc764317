//! Operator vocabularies and the fusion classification.

use core::fmt;

use crate::ir::data_value::DataValue;
use crate::ir::types::DataType;

/// Element-wise unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Floor,
    Ceil,
}

impl UnaryOp {
    /// Result type of the operator for an operand of type `dt`.
    ///
    /// `Not` produces a `U8` truth mask; everything else keeps the operand
    /// type.
    pub fn result_type(self, dt: DataType) -> DataType {
        match self {
            Self::Not => DataType::U8,
            _ => dt,
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Neg => "neg",
            Self::Not => "not",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
        };
        f.write_str(s)
    }
}

/// Element-wise binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Min,
    Max,
    Equal,
    NotEqual,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
}

impl BinaryOp {
    /// True for comparison and logical operators, whose result is a `U8`
    /// truth mask instead of the promoted operand type.
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::Less
                | Self::LessEq
                | Self::Greater
                | Self::GreaterEq
                | Self::And
                | Self::Or
        )
    }

    /// Result type for operands of types `lhs` and `rhs`.
    pub fn result_type(self, lhs: DataType, rhs: DataType) -> DataType {
        if self.is_relational() {
            DataType::U8
        } else {
            DataType::promote(lhs, rhs)
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::Pow => "pow",
            Self::Min => "min",
            Self::Max => "max",
            Self::Equal => "eq",
            Self::NotEqual => "ne",
            Self::Less => "lt",
            Self::LessEq => "le",
            Self::Greater => "gt",
            Self::GreaterEq => "ge",
            Self::And => "and",
            Self::Or => "or",
        };
        f.write_str(s)
    }
}

/// Reduction operators used by focal, zonal, and spreading kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ReductionType {
    Sum,
    Prod,
    Min,
    Max,
    And,
    Or,
}

impl ReductionType {
    /// The neutral accumulator value of this reduction for cells of type
    /// `dt`: the value that leaves any other operand unchanged.
    pub fn neutral(self, dt: DataType) -> DataValue {
        match self {
            Self::Sum | Self::Or => DataValue::zero(dt),
            Self::Prod | Self::And => DataValue::one(dt),
            Self::Min => DataValue::max_of(dt),
            Self::Max => DataValue::min_of(dt),
        }
    }
}

impl fmt::Display for ReductionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Sum => "sum",
            Self::Prod => "prod",
            Self::Min => "min",
            Self::Max => "max",
            Self::And => "and",
            Self::Or => "or",
        };
        f.write_str(s)
    }
}

/// Focal percentage statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PercentType {
    /// Fraction of neighborhood cells below the centre value.
    Percentage,
    /// Rank of the centre value within its neighborhood.
    Percentile,
}

impl fmt::Display for PercentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Percentage => "percentage",
            Self::Percentile => "percentile",
        };
        f.write_str(s)
    }
}

/// Distributions for random sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RandDist {
    /// Uniform over the cell type's range.
    Uniform,
    /// Standard normal.
    Normal,
}

impl fmt::Display for RandDist {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Uniform => "uniform",
            Self::Normal => "normal",
        };
        f.write_str(s)
    }
}

/// Fusion-relevant classification of an operator.
///
/// The fusion partitioner groups nodes into clusters by pattern
/// compatibility; the pattern says nothing about value semantics, only about
/// the data access shape a kernel for the node would have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// No spatial access at all: sources, I/O endpoints, control markers.
    Free,
    /// Reads exactly its own cell.
    Local,
    /// Reads a fixed neighborhood around its own cell.
    Focal,
    /// Collapses a whole raster to a scalar.
    Zonal,
    /// Iterative front propagation along a direction raster.
    Spread,
    /// Iterative propagation outward from a start coordinate.
    Radial,
    /// Joins two alternative dataflow paths.
    Merge,
    /// Per-block or whole-raster statistics.
    Stats,
    /// Forces a materialization boundary between fused regions.
    Barrier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_values() {
        assert_eq!(ReductionType::Sum.neutral(DataType::S32), DataValue::S32(0));
        assert_eq!(ReductionType::Prod.neutral(DataType::U16), DataValue::U16(1));
        assert_eq!(
            ReductionType::Min.neutral(DataType::U8),
            DataValue::U8(u8::MAX)
        );
        assert_eq!(
            ReductionType::Max.neutral(DataType::S16),
            DataValue::S16(i16::MIN)
        );
    }

    #[test]
    fn relational_result_types() {
        assert_eq!(
            BinaryOp::Less.result_type(DataType::F32, DataType::F32),
            DataType::U8
        );
        assert_eq!(
            BinaryOp::Add.result_type(DataType::U8, DataType::S32),
            DataType::S32
        );
    }
}
