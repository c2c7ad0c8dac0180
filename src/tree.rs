use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use crate::bounds::Extents;
use crate::controller::BoxController;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::grid::BoxNode;
use crate::leaf::LeafBox;
use crate::progress::ProgressReporter;

/// Result of a bulk insert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BulkAddOutcome {
    /// Events inserted into the tree.
    pub added: u64,
    /// Events outside the root extents, dropped and counted.
    pub rejected: u64,
    /// Whether the caller's progress reporter cancelled the operation. The
    /// tree is consistent but incomplete: finished splits stay, flagged
    /// boxes stay flagged for a later pass.
    pub cancelled: bool,
}

/// The box tree: a root node plus the shared controller that owns all
/// policy, statistics and (optionally) the disk write buffer.
///
/// The two phases of operation map onto the borrow system: insertion takes
/// `&self` and may run from many rayon workers at once (only per-leaf data
/// mutexes are touched), while the split pass takes `&mut self` and is the
/// only thing that mutates the structure. The driver alternates them.
#[derive(Debug)]
pub struct EventTree<E, const ND: usize> {
    controller: Arc<BoxController>,
    root: BoxNode<E, ND>,
}

impl<E: Event<ND>, const ND: usize> EventTree<E, ND> {
    /// Create a tree over `extents`, rooted in a single depth-0 leaf.
    pub fn new(extents: Extents<ND>, controller: Arc<BoxController>) -> Result<Self> {
        if controller.num_dims() != ND {
            return Err(Error::InvalidArgument(format!(
                "controller is {}-dimensional, tree is {ND}-dimensional",
                controller.num_dims()
            )));
        }
        let root = BoxNode::Leaf(LeafBox::new(controller.next_id(), 0, extents));
        Ok(Self { controller, root })
    }

    pub fn controller(&self) -> &Arc<BoxController> {
        &self.controller
    }

    pub fn extents(&self) -> &Extents<ND> {
        self.root.extents()
    }

    pub fn root(&self) -> &BoxNode<E, ND> {
        &self.root
    }

    pub fn n_points(&self) -> u64 {
        self.root.n_points()
    }

    pub fn signal_total(&self) -> f64 {
        self.root.signal_total()
    }

    pub fn error_squared_total(&self) -> f64 {
        self.root.error_squared_total()
    }

    pub fn leaf_count(&self) -> usize {
        self.root.leaf_count()
    }

    /// Insert one event. Returns `false` (without inserting) when the
    /// coordinates fall outside the root extents. Splitting is deferred;
    /// call [`EventTree::split_all_if_needed`] afterwards.
    pub fn add_event(&self, event: E) -> Result<bool> {
        if !self.root.extents().contains(event.coords()) {
            return Ok(false);
        }
        self.root.add_event(&self.controller, event)?;
        Ok(true)
    }

    /// Force-convert the root leaf into a grid, regardless of the split
    /// policy. A no-op when the root is already a grid. This is the one
    /// caller path that bypasses `will_split`'s depth ceiling, so with
    /// `max_depth == 0` it widens the ceiling through `track_num_boxes`.
    pub fn split_root_box(&mut self) -> Result<()> {
        self.root.split_in_place(&self.controller)?;
        Ok(())
    }

    /// Run one deferred split pass: snapshot-and-clear the pending set, then
    /// convert every still-leaf box it names. Independent subtrees are
    /// processed in parallel. Boxes flagged during the pass (children that
    /// crossed the threshold while being filled) are handled by the next
    /// pass. Returns the number of conversions.
    pub fn split_all_if_needed(&mut self) -> Result<usize> {
        let flagged = self.controller.take_boxes_to_split();
        if flagged.is_empty() {
            return Ok(0);
        }
        let converted = self.root.split_flagged(&self.controller, &flagged)?;
        debug!(
            flagged = flagged.len(),
            converted,
            total_boxes = self.controller.total_num_boxes(),
            "split pass finished"
        );
        Ok(converted)
    }

    /// Bulk-insert a batch of events.
    ///
    /// The root is grid-split up front, then the batch is consumed in
    /// blocks of `tasks_per_block × events_per_task`: each block's chunks
    /// are inserted in parallel over `&self`, the workers are joined, and a
    /// split pass runs before the next block. Progress is reported and
    /// cancellation polled between blocks.
    pub fn add_events(
        &mut self,
        events: &[E],
        progress: &dyn ProgressReporter,
    ) -> Result<BulkAddOutcome> {
        self.split_root_box()?;

        let (events_per_task, tasks_per_block) = self.controller.adding_events_parameters();
        let block_len = events_per_task * tasks_per_block;
        let mut outcome = BulkAddOutcome::default();

        let mut start = 0;
        while start < events.len() {
            let block = &events[start..events.len().min(start + block_len)];
            start += block.len();

            let root = &self.root;
            let controller = &self.controller;
            let counts: Vec<(u64, u64)> = block
                .par_chunks(events_per_task)
                .map(|chunk| -> Result<(u64, u64)> {
                    let mut added = 0;
                    let mut rejected = 0;
                    for event in chunk {
                        if root.extents().contains(event.coords()) {
                            root.add_event(controller, event.clone())?;
                            added += 1;
                        } else {
                            rejected += 1;
                        }
                    }
                    Ok((added, rejected))
                })
                .collect::<Result<_>>()?;
            for (added, rejected) in counts {
                outcome.added += added;
                outcome.rejected += rejected;
            }

            self.split_all_if_needed()?;

            progress.report(start as f64 / events.len() as f64, "adding events");
            if progress.cancelled() {
                outcome.cancelled = true;
                break;
            }
        }
        Ok(outcome)
    }

    /// Iterate over every leaf box in the tree.
    pub fn leaves(&self) -> LeafIter<'_, E, ND> {
        LeafIter {
            stack: vec![&self.root],
            predicate: None,
        }
    }

    /// Iterate over the leaf boxes whose extents satisfy `predicate`.
    /// Subtrees whose whole extents fail the predicate are pruned without
    /// descending.
    pub fn leaves_filtered<'a>(
        &'a self,
        predicate: impl Fn(&Extents<ND>) -> bool + 'a,
    ) -> LeafIter<'a, E, ND> {
        LeafIter {
            stack: vec![&self.root],
            predicate: Some(Box::new(predicate)),
        }
    }

    /// Evict every in-memory leaf payload through the disk buffer. Returns
    /// the number of leaves staged. The buffer flushes to the file whenever
    /// its budget is exceeded along the way.
    pub fn evict_all_leaves(&self) -> Result<usize> {
        let mut staged = 0;
        for leaf in self.leaves() {
            if !leaf.is_on_disk() && leaf.n_points() > 0 {
                leaf.stage_to_disk(&self.controller)?;
                staged += 1;
            }
        }
        Ok(staged)
    }
}

/// Depth-first iterator over leaf boxes, with optional spatial pruning.
pub struct LeafIter<'a, E, const ND: usize> {
    stack: Vec<&'a BoxNode<E, ND>>,
    #[allow(clippy::type_complexity)]
    predicate: Option<Box<dyn Fn(&Extents<ND>) -> bool + 'a>>,
}

impl<'a, E: Event<ND>, const ND: usize> Iterator for LeafIter<'a, E, ND> {
    type Item = &'a LeafBox<E, ND>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            if let Some(pred) = &self.predicate {
                if !pred(node.extents()) {
                    continue;
                }
            }
            match node {
                BoxNode::Leaf(leaf) => return Some(leaf),
                BoxNode::Grid(grid) => self.stack.extend(grid.children().iter()),
            }
        }
        None
    }
}
