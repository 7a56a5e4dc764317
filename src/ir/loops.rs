//! Structured loop regions and feedback construction.
//!
//! A loop models `while (cond) { body }` iteration as a dag with explicit
//! feedback edges. Per carried variable the wiring is:
//!
//! ```text
//! init -> Merge -> LoopHead -> FeedIn -> body ... body_tail -> FeedOut -> LoopTail
//!           ^                    |                                |
//!           +----- forw ---------+--------------- forw -----------+
//! ```
//!
//! The while-merge reads its right operand over a `forw` back-edge, so the
//! `prev`/`next` graph stays acyclic and the scheduler never sees a cycle.
//! The caller builds the merge, the head, and the condition and body over
//! the head; [`Dag::make_loop`] then seals the region, splicing a feed-in
//! between each head and its in-loop consumers and twinning it with a
//! feed-out on the body tail.

use log::debug;
use smallvec::smallvec;

use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::dag::Dag;
use crate::ir::dims::{BlockSize, DataSize, NumDim};
use crate::ir::entities::{LoopId, NodeId};
use crate::ir::meta::MetaData;
use crate::ir::node::{MergeMode, NodeData};
use crate::ir::types::DataType;
use crate::result::{IrError, IrResult};

/// One sealed loop region.
///
/// The region owns its nodes: discarding the loop drops every node of it
/// that is not shared outside.
pub struct LoopData {
    pub(crate) cond: NodeId,
    pub(crate) body: Vec<NodeId>,
    pub(crate) heads: Vec<NodeId>,
    pub(crate) merges: Vec<NodeId>,
    pub(crate) tails: Vec<NodeId>,
    pub(crate) feedbacks: Vec<(NodeId, NodeId)>,
    pub(crate) discarded: bool,
}

impl LoopData {
    /// The `LoopCond` node producing the scalar continuation flag.
    pub fn condition(&self) -> NodeId {
        self.cond
    }

    /// The body subgraph, in the order the caller supplied it (the raw
    /// condition expression is appended if it was not already listed).
    pub fn body(&self) -> &[NodeId] {
        &self.body
    }

    /// The `LoopHead` marker per carried variable.
    pub fn heads(&self) -> &[NodeId] {
        &self.heads
    }

    /// The while-merge per carried variable.
    pub fn merges(&self) -> &[NodeId] {
        &self.merges
    }

    /// The `LoopTail` per externally visible output.
    pub fn tails(&self) -> &[NodeId] {
        &self.tails
    }

    /// The feed-in/feed-out twin per carried variable.
    pub fn feedbacks(&self) -> &[(NodeId, NodeId)] {
        &self.feedbacks
    }

    fn region_nodes(&self) -> Vec<NodeId> {
        let mut set = Vec::new();
        set.push(self.cond);
        set.extend_from_slice(&self.body);
        set.extend_from_slice(&self.heads);
        set.extend_from_slice(&self.merges);
        set.extend_from_slice(&self.tails);
        for &(fi, fo) in &self.feedbacks {
            set.push(fi);
            set.push(fo);
        }
        set.sort_unstable();
        set.dedup();
        set
    }
}

/// One loop-carried variable handed to [`Dag::make_loop`]: the while-merge
/// and head built before the body, and the body node producing the next
/// iteration's value.
#[derive(Clone, Copy, Debug)]
pub struct CarriedVar {
    /// The while-merge created by [`Dag::merge_while`].
    pub merge: NodeId,
    /// The `LoopHead` created by [`Dag::loop_head`].
    pub head: NodeId,
    /// The body node whose value feeds the next iteration.
    pub body_tail: NodeId,
}

impl Dag {
    /// Begin a loop-carried variable: a merge whose left operand is the
    /// initial value and whose right operand arrives over a `forw`
    /// back-edge once the loop is sealed.
    ///
    /// While-merges are unique per call, not value numbered: two loops over
    /// the same initial value are different regions.
    pub fn merge_while(&mut self, init: NodeId) -> IrResult<NodeId> {
        let meta = *self.check_node(init, "Merge init")?.meta();
        Ok(self.alloc(
            meta,
            NodeData::Merge {
                mode: MergeMode::While,
            },
            smallvec![init],
            None,
        ))
    }

    /// The in-loop name of a carried variable; condition and body read the
    /// variable through this node.
    pub fn loop_head(&mut self, merge: NodeId) -> IrResult<NodeId> {
        let node = self.check_node(merge, "LoopHead")?;
        if !matches!(
            node.data(),
            NodeData::Merge {
                mode: MergeMode::While
            }
        ) {
            return Err(IrError::invalid(format!(
                "LoopHead expects a while merge, got {}",
                node.kind().name()
            )));
        }
        let meta = *node.meta();
        Ok(self.alloc(
            meta,
            NodeData::LoopHead { owner: None },
            smallvec![merge],
            None,
        ))
    }

    /// Seal a loop region.
    ///
    /// `cond` is the scalar `u8` continuation expression, `body` the body
    /// subgraph (the condition expression is adopted into it), and
    /// `carried` one entry per loop-carried variable. Sealing wraps the
    /// condition in a `LoopCond`, re-parents every in-loop consumer of each
    /// head onto a fresh feed-in, twins it with a feed-out on the body
    /// tail, completes the while-merges, and exposes one `LoopTail` per
    /// carried variable.
    pub fn make_loop(
        &mut self,
        cond: NodeId,
        body: Vec<NodeId>,
        carried: &[CarriedVar],
    ) -> IrResult<LoopId> {
        let cmeta = *self.check_node(cond, "loop condition")?.meta();
        if cmeta.num_dim() != NumDim::D0 || cmeta.data_type() != DataType::U8 {
            return Err(IrError::invalid(format!(
                "loop condition must be a u8 scalar, got {} {}",
                cmeta.num_dim(),
                cmeta.data_type()
            )));
        }
        for &b in &body {
            self.check_node(b, "loop body")?;
        }
        if carried.is_empty() {
            return Err(IrError::invalid("a loop needs at least one carried variable"));
        }

        let mut body = body;
        if !body.contains(&cond) {
            body.push(cond);
        }
        let mut membership: FxHashSet<NodeId> = body.iter().copied().collect();

        // Validate every carried variable up front: a failed seal installs
        // nothing.
        for var in carried {
            let merge_node = self.check_node(var.merge, "carried merge")?;
            let sealed = !matches!(
                merge_node.data(),
                NodeData::Merge {
                    mode: MergeMode::While
                }
            ) || !merge_node.forw().is_empty()
                || merge_node.prev().len() != 1;
            if sealed {
                return Err(IrError::invalid(format!(
                    "{} is not an unsealed while merge",
                    var.merge
                )));
            }
            let init = merge_node.prev()[0];

            let head_node = self.check_node(var.head, "carried head")?;
            let head_ok = matches!(head_node.data(), NodeData::LoopHead { owner: None })
                && head_node.prev().first() == Some(&var.merge);
            if !head_ok {
                return Err(IrError::invalid(format!(
                    "{} is not the unowned LoopHead of {}",
                    var.head, var.merge
                )));
            }

            if !membership.contains(&var.body_tail) {
                return Err(IrError::invalid(format!(
                    "body tail {} is not part of the loop body",
                    var.body_tail
                )));
            }
            let init_meta = *self.nodes[init].meta();
            let tail_meta = *self.nodes[var.body_tail].meta();
            if !init_meta.same_value_shape(&tail_meta) {
                return Err(IrError::MetaDataMismatch {
                    lhs: init_meta,
                    rhs: tail_meta,
                });
            }
        }

        let lp = self.loops.push(LoopData {
            cond,
            body: Vec::new(),
            heads: Vec::new(),
            merges: Vec::new(),
            tails: Vec::new(),
            feedbacks: Vec::new(),
            discarded: false,
        });

        let cond_meta = MetaData::new(
            DataSize::default(),
            DataType::U8,
            cmeta.mem_order(),
            BlockSize::default(),
        );
        let loop_cond = self.alloc(
            cond_meta,
            NodeData::LoopCond { owner: Some(lp) },
            smallvec![cond],
            None,
        );

        membership.insert(loop_cond);

        let mut heads = Vec::new();
        let mut merges = Vec::new();
        let mut tails = Vec::new();
        let mut feedbacks = Vec::new();

        for var in carried {
            let init = self.nodes[var.merge].prev[0];
            let init_meta = *self.nodes[init].meta();
            let tail_meta = *self.nodes[var.body_tail].meta();

            // Feed-in: adopts id and metadata from the head, so downstream
            // signatures see the carried value as one logical name.
            let head_meta = *self.nodes[var.head].meta();
            let head_id = self.nodes[var.head].id;
            let feed_in = self.alloc(
                head_meta,
                NodeData::Feedback {
                    input: true,
                    twin: None,
                    owner: Some(lp),
                },
                smallvec![var.head],
                None,
            );
            self.nodes[feed_in].id = head_id;

            // Every in-loop consumer of the head now reads the feed-in.
            let consumers: Vec<NodeId> = self.nodes[var.head]
                .next
                .iter()
                .copied()
                .filter(|c| *c != feed_in && membership.contains(c))
                .collect();
            for c in consumers {
                self.update_prev(c, var.head, feed_in);
                self.remove_next(var.head, c);
                self.add_next(feed_in, c);
            }

            // Feed-out: adopts id and metadata from the body tail.
            let tail_id = self.nodes[var.body_tail].id;
            let feed_out = self.alloc(
                tail_meta,
                NodeData::Feedback {
                    input: false,
                    twin: Some(feed_in),
                    owner: Some(lp),
                },
                smallvec![var.body_tail],
                None,
            );
            self.nodes[feed_out].id = tail_id;
            if let NodeData::Feedback { twin, .. } = &mut self.nodes[feed_in].data {
                *twin = Some(feed_out);
            }
            self.link_forw(feed_in, feed_out);

            // Complete the while-merge: its right operand arrives over the
            // back-edge, and its stream direction joins both arms.
            self.link_forw(var.merge, feed_out);
            let dir = Dag::join_stream(init_meta.stream_dir(), tail_meta.stream_dir());
            self.nodes[var.merge].meta = self.nodes[var.merge].meta.with_stream_dir(dir);
            if let NodeData::LoopHead { owner } = &mut self.nodes[var.head].data {
                *owner = Some(lp);
            }

            // The externally visible output of the carried variable.
            let tail = self.alloc(
                tail_meta,
                NodeData::LoopTail { owner: Some(lp) },
                smallvec![feed_out],
                None,
            );

            heads.push(var.head);
            merges.push(var.merge);
            tails.push(tail);
            feedbacks.push((feed_in, feed_out));
        }

        let data = &mut self.loops[lp];
        data.cond = loop_cond;
        data.body = body;
        data.heads = heads;
        data.merges = merges;
        data.tails = tails;
        data.feedbacks = feedbacks;
        debug!(
            "sealed {lp}: {} carried, {} body nodes",
            data.merges.len(),
            data.body.len()
        );
        Ok(lp)
    }

    /// Borrow one loop region.
    pub fn loop_data(&self, lp: LoopId) -> &LoopData {
        &self.loops[lp]
    }

    /// The nodes of a region, deduplicated and in arena order.
    pub fn loop_nodes(&self, lp: LoopId) -> Vec<NodeId> {
        self.loops[lp].region_nodes()
    }

    /// Clone a whole loop region, registering the clone as a new region.
    ///
    /// External inputs (initial values, rasters read inside the body) are
    /// shared, everything belonging to the region is copied and rewired
    /// through the old-to-new mapping, twins and owner tags included.
    pub fn clone_loop(&mut self, lp: LoopId) -> IrResult<(LoopId, FxHashMap<NodeId, NodeId>)> {
        if self.loops[lp].discarded {
            return Err(IrError::invalid(format!("{lp} was discarded")));
        }
        let set = self.loops[lp].region_nodes();
        let map = self.clone_subgraph(&set)?;
        let mapped = |n: NodeId| map.get(&n).copied().unwrap_or(n);

        let src = &self.loops[lp];
        let data = LoopData {
            cond: mapped(src.cond),
            body: src.body.iter().copied().map(mapped).collect(),
            heads: src.heads.iter().copied().map(mapped).collect(),
            merges: src.merges.iter().copied().map(mapped).collect(),
            tails: src.tails.iter().copied().map(mapped).collect(),
            feedbacks: src
                .feedbacks
                .iter()
                .map(|&(fi, fo)| (mapped(fi), mapped(fo)))
                .collect(),
            discarded: false,
        };
        let new_lp = self.loops.push(data);

        for &new in map.values() {
            match &mut self.nodes[new].data {
                NodeData::LoopCond { owner }
                | NodeData::LoopHead { owner }
                | NodeData::LoopTail { owner }
                | NodeData::Feedback { owner, .. } => *owner = Some(new_lp),
                _ => {}
            }
        }
        Ok((new_lp, map))
    }

    /// Discard a loop region, dropping every region node that is not shared
    /// outside it. This is the only steady-state removal path in the IR.
    pub fn discard_loop(&mut self, lp: LoopId) -> IrResult<()> {
        if self.loops[lp].discarded {
            return Err(IrError::invalid(format!("{lp} was already discarded")));
        }
        let mut kill: FxHashSet<NodeId> = self.loops[lp].region_nodes().into_iter().collect();

        // A region node with a consumer outside the doomed set survives,
        // and keeps its operand chain alive through the next rounds.
        loop {
            let survivors: Vec<NodeId> = kill
                .iter()
                .copied()
                .filter(|&x| self.nodes[x].next.iter().any(|c| !kill.contains(c)))
                .collect();
            if survivors.is_empty() {
                break;
            }
            for s in survivors {
                kill.remove(&s);
            }
        }

        for &x in &kill {
            let prevs = self.nodes[x].prev.clone();
            for p in prevs {
                if !kill.contains(&p) {
                    self.remove_next(p, x);
                }
            }
            let forw = self.nodes[x].forw.clone();
            for t in forw {
                if !kill.contains(&t) {
                    self.nodes[t].back.retain(|&mut b| b != x);
                }
            }
            let back = self.nodes[x].back.clone();
            for t in back {
                if !kill.contains(&t) {
                    self.nodes[t].forw.retain(|&mut f| f != x);
                }
            }
            let node = &mut self.nodes[x];
            node.prev.clear();
            node.next.clear();
            node.back.clear();
            node.forw.clear();
            node.file = None;
        }

        debug!("discarding {lp}: {} nodes retired", kill.len());
        self.retire_nodes(&kill);
        self.loops[lp].discarded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::dims::{Coord, MemOrder};
    use crate::ir::node::NodeKind;
    use crate::ir::ops::{BinaryOp, ReductionType};
    use crate::ir::DataValue;

    struct WhileLoop {
        dag: Dag,
        init: NodeId,
        merge: NodeId,
        head: NodeId,
        next: NodeId,
        lp: LoopId,
    }

    /// `x = 0 (D2); while (any(x < 10)) { x = x + 1 }`
    fn build_raster_loop() -> WhileLoop {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut dag = Dag::new();
        let init = dag
            .constant(
                DataValue::from(0i32),
                Coord::new(&[4, 4]),
                MemOrder::RowPos,
                Coord::new(&[2, 2]),
            )
            .unwrap();
        let one = dag.scalar(DataValue::from(1i32)).unwrap();
        let ten = dag.scalar(DataValue::from(10i32)).unwrap();

        let merge = dag.merge_while(init).unwrap();
        let head = dag.loop_head(merge).unwrap();
        let next = dag.binary(BinaryOp::Add, head, one).unwrap();
        let below = dag.binary(BinaryOp::Less, head, ten).unwrap();
        let cond = dag.zonal_reduc(below, ReductionType::Or).unwrap();

        let lp = dag
            .make_loop(
                cond,
                vec![next, below],
                &[CarriedVar {
                    merge,
                    head,
                    body_tail: next,
                }],
            )
            .unwrap();
        WhileLoop {
            dag,
            init,
            merge,
            head,
            next,
            lp,
        }
    }

    #[test]
    fn while_merge_reads_init_and_feedback() {
        let w = build_raster_loop();
        let dag = &w.dag;
        let merge = dag.node(w.merge);

        assert_eq!(merge.prev().len() + merge.forw().len(), 2);
        assert_eq!(dag.merge_left(w.merge).unwrap(), w.init);
        assert_eq!(
            dag.signature(dag.merge_left(w.merge).unwrap()),
            dag.signature(w.init)
        );

        let right = dag.merge_right(w.merge).unwrap();
        assert!(dag.node(right).feed_out());
        assert_eq!(dag.node(right).prev()[0], w.next);
        dag.verify().unwrap();
    }

    #[test]
    fn head_consumers_are_spliced_onto_the_feed_in() {
        let w = build_raster_loop();
        let dag = &w.dag;
        let (feed_in, feed_out) = dag.loop_data(w.lp).feedbacks()[0];

        // The head's only consumer is now the feed-in; the body reads the
        // carried value through it.
        assert_eq!(dag.node(w.head).next(), &[feed_in]);
        assert_eq!(dag.node(w.next).prev()[0], feed_in);
        assert!(dag.node(feed_in).feed_in());

        // Cross-iteration edges.
        assert!(dag.node(feed_in).forw().contains(&feed_out));
        assert!(dag.node(feed_out).back().contains(&feed_in));
        assert!(dag.node(w.merge).forw().contains(&feed_out));
    }

    #[test]
    fn feedback_twins_are_mutually_consistent() {
        let w = build_raster_loop();
        let dag = &w.dag;
        for &(fi, fo) in dag.loop_data(w.lp).feedbacks() {
            assert_eq!(dag.node(fi).twin(), Some(fo));
            assert_eq!(dag.node(fo).twin(), Some(fi));
            let fi_twin = dag.node(fi).twin().unwrap();
            assert_eq!(dag.node(fi_twin).twin(), Some(fi));
        }
    }

    #[test]
    fn feedback_adopts_id_and_metadata() {
        let w = build_raster_loop();
        let dag = &w.dag;
        let (feed_in, feed_out) = dag.loop_data(w.lp).feedbacks()[0];

        assert_eq!(dag.node(feed_in).id(), dag.node(w.head).id());
        assert_eq!(dag.node(feed_in).meta(), dag.node(w.head).meta());
        assert_eq!(dag.node(feed_out).id(), dag.node(w.next).id());
    }

    #[test]
    fn loop_cond_and_tail_shape() {
        let w = build_raster_loop();
        let dag = &w.dag;
        let data = dag.loop_data(w.lp);

        let cond = dag.node(data.condition());
        assert_eq!(cond.kind(), NodeKind::LoopCond);
        assert_eq!(cond.meta().num_dim(), NumDim::D0);
        assert_eq!(cond.meta().data_type(), DataType::U8);

        assert_eq!(data.tails().len(), 1);
        let tail = dag.node(data.tails()[0]);
        assert_eq!(tail.kind(), NodeKind::LoopTail);
        assert_eq!(tail.prev()[0], data.feedbacks()[0].1);
    }

    #[test]
    fn cloned_region_is_isomorphic_and_fresh() {
        let mut w = build_raster_loop();
        let set: Vec<NodeId> = {
            let mut s = w.dag.loop_nodes(w.lp);
            s.push(w.init);
            // the two scalar constants feeding the body
            for (n, node) in w.dag.nodes() {
                if node.kind() == NodeKind::Constant && node.meta().num_dim() == NumDim::D0 {
                    s.push(n);
                }
            }
            s
        };
        let count_before = w.dag.node_count();
        let map = w.dag.clone_subgraph(&set).unwrap();
        assert_eq!(map.len(), set.len());
        assert_eq!(w.dag.node_count(), count_before + set.len());

        let cloned: FxHashSet<NodeId> = map.values().copied().collect();
        for (&old, &new) in &map {
            assert_ne!(old, new);
            assert_ne!(w.dag.node(old).id(), w.dag.node(new).id());
            // Internal edges stay internal.
            for p in w.dag.node(new).prev() {
                assert!(cloned.contains(p), "clone {new} reads outside the clone set");
            }
        }

        // Twins are rewired through the mapping, and signatures survive.
        let (fi, fo) = w.dag.loop_data(w.lp).feedbacks()[0];
        assert_eq!(w.dag.node(map[&fi]).twin(), Some(map[&fo]));
        assert_eq!(w.dag.signature(map[&w.merge]), w.dag.signature(w.merge));
        w.dag.verify().unwrap();
    }

    #[test]
    fn clone_loop_registers_a_new_region() {
        let mut w = build_raster_loop();
        let (lp2, map) = w.dag.clone_loop(w.lp).unwrap();
        assert_ne!(lp2, w.lp);

        let data = w.dag.loop_data(lp2);
        assert_eq!(data.merges()[0], map[&w.merge]);
        let (fi, _) = data.feedbacks()[0];
        assert!(matches!(
            w.dag.node(fi).data(),
            NodeData::Feedback {
                owner: Some(owner), ..
            } if *owner == lp2
        ));
        // The cloned merge shares the original init as an external input.
        assert_eq!(w.dag.merge_left(map[&w.merge]).unwrap(), w.init);
        w.dag.verify().unwrap();
    }

    #[test]
    fn discard_drops_exclusive_nodes_only() {
        let mut w = build_raster_loop();
        let before = w.dag.node_count();
        let region = w.dag.loop_nodes(w.lp).len();

        w.dag.discard_loop(w.lp).unwrap();
        assert_eq!(w.dag.node_count(), before - region);
        // The initial value is outside the region and survives, with the
        // merge edge gone.
        assert!(w.dag.node(w.init).next().is_empty());
        w.dag.verify().unwrap();
        assert!(w.dag.discard_loop(w.lp).is_err());
    }

    #[test]
    fn scalar_loop_merge_folds_one_arm() {
        let mut dag = Dag::new();
        let init = dag.scalar(DataValue::from(0i32)).unwrap();
        let one = dag.scalar(DataValue::from(1i32)).unwrap();
        let ten = dag.scalar(DataValue::from(10i32)).unwrap();

        let merge = dag.merge_while(init).unwrap();
        let head = dag.loop_head(merge).unwrap();
        let next = dag.binary(BinaryOp::Add, head, one).unwrap();
        let cond = dag.binary(BinaryOp::Less, head, ten).unwrap();
        dag.make_loop(
            cond,
            vec![next],
            &[CarriedVar {
                merge,
                head,
                body_tail: next,
            }],
        )
        .unwrap();

        let feed_out = dag.merge_right(merge).unwrap();

        let mut env = FxHashMap::default();
        dag.compute_scalar(init, &mut env).unwrap();
        assert_eq!(
            dag.compute_scalar(merge, &mut env).unwrap(),
            DataValue::from(0i32)
        );

        // Both arms resolved is a fold-order error.
        env.insert(feed_out, DataValue::from(5i32));
        env.remove(&merge);
        assert!(dag.compute_scalar(merge, &mut env).is_err());
    }

    #[test]
    fn make_loop_rejects_reuse_and_bad_conditions() {
        let mut dag = Dag::new();
        let init = dag.scalar(DataValue::from(0i32)).unwrap();
        let one = dag.scalar(DataValue::from(1i32)).unwrap();
        let merge = dag.merge_while(init).unwrap();
        let head = dag.loop_head(merge).unwrap();
        let next = dag.binary(BinaryOp::Add, head, one).unwrap();

        // A non-u8 condition is rejected.
        let err = dag
            .make_loop(
                next,
                vec![next],
                &[CarriedVar {
                    merge,
                    head,
                    body_tail: next,
                }],
            )
            .unwrap_err();
        assert!(matches!(err, IrError::InvalidConstruction(_)));

        // Seal it properly, then try to seal the same merge again.
        let ten = dag.scalar(DataValue::from(10i32)).unwrap();
        let cond = dag.binary(BinaryOp::Less, head, ten).unwrap();
        dag.make_loop(
            cond,
            vec![next],
            &[CarriedVar {
                merge,
                head,
                body_tail: next,
            }],
        )
        .unwrap();

        let cond2 = dag.binary(BinaryOp::Greater, head, ten).unwrap();
        assert!(dag
            .make_loop(
                cond2,
                vec![next],
                &[CarriedVar {
                    merge,
                    head,
                    body_tail: next,
                }],
            )
            .is_err());
    }
}
