//! Double dispatch for external analyses and code generators.
//!
//! The IR does not walk the graph for you: a visitor picks its own
//! traversal order and calls [`Dag::accept`] per node, which dispatches to
//! the one method matching the node's kind. Visitors get a shared borrow of
//! the dag, so they cannot mutate structural fields; annotations belong in
//! side tables keyed by [`NodeId`].

use crate::ir::dag::Dag;
use crate::ir::entities::NodeId;
use crate::ir::node::NodeData;

/// One visit entry per concrete node kind, each a no-op by default.
#[allow(unused_variables, missing_docs, reason = "one self-describing hook per kind")]
pub trait Visitor {
    fn visit_constant(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_empty(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_index(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_rand(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_read(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_unary(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_binary(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_conditional(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_cast(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_focal_func(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_focal_percent(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_focal_flow(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_neighbor(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_zonal_reduc(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_radial_scan(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_spread_scan(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_barrier(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_write(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_checkpoint(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_loop_cond(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_loop_head(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_loop_tail(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_feedback(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_merge(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_switch(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_access(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_temporal(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_identity(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_summary(&mut self, dag: &Dag, node: NodeId) {}
    fn visit_stats(&mut self, dag: &Dag, node: NodeId) {}
}

impl Dag {
    /// Dispatch `node` to the visitor method matching its kind.
    pub fn accept(&self, node: NodeId, visitor: &mut dyn Visitor) {
        match self.node(node).data() {
            NodeData::Constant { .. } => visitor.visit_constant(self, node),
            NodeData::Empty => visitor.visit_empty(self, node),
            NodeData::Index { .. } => visitor.visit_index(self, node),
            NodeData::Rand { .. } => visitor.visit_rand(self, node),
            NodeData::Read => visitor.visit_read(self, node),
            NodeData::Unary { .. } => visitor.visit_unary(self, node),
            NodeData::Binary { .. } => visitor.visit_binary(self, node),
            NodeData::Conditional => visitor.visit_conditional(self, node),
            NodeData::Cast { .. } => visitor.visit_cast(self, node),
            NodeData::FocalFunc { .. } => visitor.visit_focal_func(self, node),
            NodeData::FocalPercent { .. } => visitor.visit_focal_percent(self, node),
            NodeData::FocalFlow => visitor.visit_focal_flow(self, node),
            NodeData::Neighbor { .. } => visitor.visit_neighbor(self, node),
            NodeData::ZonalReduc { .. } => visitor.visit_zonal_reduc(self, node),
            NodeData::RadialScan { .. } => visitor.visit_radial_scan(self, node),
            NodeData::SpreadScan { .. } => visitor.visit_spread_scan(self, node),
            NodeData::Barrier => visitor.visit_barrier(self, node),
            NodeData::Write => visitor.visit_write(self, node),
            NodeData::Checkpoint => visitor.visit_checkpoint(self, node),
            NodeData::LoopCond { .. } => visitor.visit_loop_cond(self, node),
            NodeData::LoopHead { .. } => visitor.visit_loop_head(self, node),
            NodeData::LoopTail { .. } => visitor.visit_loop_tail(self, node),
            NodeData::Feedback { .. } => visitor.visit_feedback(self, node),
            NodeData::Merge { .. } => visitor.visit_merge(self, node),
            NodeData::Switch => visitor.visit_switch(self, node),
            NodeData::Access { .. } => visitor.visit_access(self, node),
            NodeData::Temporal => visitor.visit_temporal(self, node),
            NodeData::Identity => visitor.visit_identity(self, node),
            NodeData::Summary { .. } => visitor.visit_summary(self, node),
            NodeData::Stats => visitor.visit_stats(self, node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::dims::{Coord, MemOrder};
    use crate::ir::ops::{Pattern, ReductionType};
    use crate::ir::types::DataType;

    /// Counts clusters the way a fusion partitioner would start to: one
    /// bucket per pattern.
    #[derive(Default)]
    struct PatternCounter {
        free: usize,
        focal: usize,
        zonal: usize,
    }

    impl Visitor for PatternCounter {
        fn visit_empty(&mut self, dag: &Dag, node: NodeId) {
            assert_eq!(dag.node(node).pattern(), Pattern::Free);
            self.free += 1;
        }

        fn visit_focal_flow(&mut self, dag: &Dag, node: NodeId) {
            assert_eq!(dag.node(node).pattern(), Pattern::Focal);
            self.focal += 1;
        }

        fn visit_zonal_reduc(&mut self, dag: &Dag, node: NodeId) {
            assert_eq!(dag.node(node).pattern(), Pattern::Zonal);
            self.zonal += 1;
        }
    }

    #[test]
    fn accept_dispatches_by_kind() {
        let mut dag = Dag::new();
        let r = dag
            .empty(
                Coord::new(&[4, 4]),
                DataType::F32,
                MemOrder::RowPos,
                Coord::new(&[2, 2]),
            )
            .unwrap();
        let flow = dag.focal_flow(r).unwrap();
        let z = dag.zonal_reduc(flow, ReductionType::Or).unwrap();

        let mut counter = PatternCounter::default();
        for n in [r, flow, z] {
            dag.accept(n, &mut counter);
        }
        assert_eq!(counter.free, 1);
        assert_eq!(counter.focal, 1);
        assert_eq!(counter.zonal, 1);
    }
}
