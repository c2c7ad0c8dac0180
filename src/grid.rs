use std::collections::BTreeSet;

use rayon::prelude::*;

use crate::bounds::Extents;
use crate::controller::BoxController;
use crate::error::Result;
use crate::event::Event;
use crate::leaf::LeafBox;

/// A node of the box tree: either a leaf holding events or a grid of child
/// nodes covering the same extents. Leaf-to-grid is the only structural
/// transition and is terminal for that node.
#[derive(Debug)]
pub enum BoxNode<E, const ND: usize> {
    Leaf(LeafBox<E, ND>),
    Grid(GridBox<E, ND>),
}

impl<E: Event<ND>, const ND: usize> BoxNode<E, ND> {
    pub fn id(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.id(),
            Self::Grid(grid) => grid.id(),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.depth(),
            Self::Grid(grid) => grid.depth(),
        }
    }

    pub fn extents(&self) -> &Extents<ND> {
        match self {
            Self::Leaf(leaf) => leaf.extents(),
            Self::Grid(grid) => grid.extents(),
        }
    }

    pub fn n_points(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.n_points(),
            Self::Grid(grid) => grid.n_points(),
        }
    }

    pub fn signal_total(&self) -> f64 {
        match self {
            Self::Leaf(leaf) => leaf.signal_total(),
            Self::Grid(grid) => grid.signal_total(),
        }
    }

    pub fn error_squared_total(&self) -> f64 {
        match self {
            Self::Leaf(leaf) => leaf.error_squared_total(),
            Self::Grid(grid) => grid.error_squared_total(),
        }
    }

    /// Number of leaf boxes in this subtree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Grid(grid) => grid.children.iter().map(Self::leaf_count).sum(),
        }
    }

    /// Insert one event, descending to the matching leaf. The structure is
    /// not modified (`&self`): insertion and splitting are alternated
    /// phases, never interleaved.
    pub fn add_event(&self, controller: &BoxController, event: E) -> Result<()> {
        match self {
            Self::Leaf(leaf) => leaf.add_event(controller, event),
            Self::Grid(grid) => grid.add_event(controller, event),
        }
    }

    /// Convert this node into a grid if it is a leaf. Returns whether a
    /// conversion happened.
    pub(crate) fn split_in_place(&mut self, controller: &BoxController) -> Result<bool> {
        let grid = match self {
            Self::Leaf(leaf) => GridBox::from_leaf(leaf, controller)?,
            Self::Grid(_) => return Ok(false),
        };
        *self = Self::Grid(grid);
        Ok(true)
    }

    /// Recursively split every leaf in this subtree whose ID is in the
    /// flagged snapshot. Children that cross the threshold during
    /// redistribution are flagged again for the next pass, never split in
    /// this one, which bounds the work of a single pass. Returns the number
    /// of conversions.
    pub(crate) fn split_flagged(
        &mut self,
        controller: &BoxController,
        flagged: &BTreeSet<u64>,
    ) -> Result<usize> {
        match self {
            Self::Leaf(leaf) => {
                if flagged.contains(&leaf.id()) {
                    self.split_in_place(controller)?;
                    Ok(1)
                } else {
                    Ok(0)
                }
            }
            // Sibling subtrees are independent: each split only touches its
            // own nodes, and the controller's ID/stats structures are
            // individually synchronized.
            Self::Grid(grid) => grid
                .children
                .par_iter_mut()
                .map(|child| child.split_flagged(controller, flagged))
                .try_reduce(|| 0, |a, b| Ok(a + b)),
        }
    }
}

/// An interior node: a fixed-arity grid of child nodes tiling the parent
/// extents, `split[d]` children per dimension in row-major order.
#[derive(Debug)]
pub struct GridBox<E, const ND: usize> {
    id: u64,
    depth: usize,
    extents: Extents<ND>,
    split: [usize; ND],
    children: Vec<BoxNode<E, ND>>,
}

impl<E: Event<ND>, const ND: usize> GridBox<E, ND> {
    /// Convert a leaf into a grid: fresh IDs and evenly subdivided extents
    /// for the children, every event redistributed by coordinate, exactly
    /// one `track_num_boxes` call, and the old leaf unflagged and forgotten
    /// by the disk buffer.
    pub(crate) fn from_leaf(leaf: &LeafBox<E, ND>, controller: &BoxController) -> Result<Self> {
        let events = leaf.take_events(controller)?;

        // Snapshot the fan-out once; the policy may change under us but one
        // grid must stay internally consistent.
        let split_vec = controller.split_into_all();
        let mut split = [1_usize; ND];
        split.copy_from_slice(&split_vec);
        let num_split: usize = split.iter().product();

        let mut children = Vec::with_capacity(num_split);
        for flat in 0..num_split {
            let indices = unflatten::<ND>(&split, flat);
            let child_extents = leaf.extents().child(&split, &indices);
            children.push(BoxNode::Leaf(LeafBox::new(
                controller.next_id(),
                leaf.depth() + 1,
                child_extents,
            )));
        }

        let grid = Self {
            id: leaf.id(),
            depth: leaf.depth(),
            extents: *leaf.extents(),
            split,
            children,
        };
        for event in events {
            let flat = grid.child_index(event.coords());
            grid.children[flat].add_event(controller, event)?;
        }

        controller.track_num_boxes(leaf.depth());
        controller.remove_tracked_box(leaf.id());
        if let Some(buffer) = controller.disk_buffer() {
            buffer.forget(leaf.id());
        }
        Ok(grid)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn extents(&self) -> &Extents<ND> {
        &self.extents
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn children(&self) -> &[BoxNode<E, ND>] {
        &self.children
    }

    pub fn n_points(&self) -> u64 {
        self.children.iter().map(BoxNode::n_points).sum()
    }

    pub fn signal_total(&self) -> f64 {
        self.children.iter().map(BoxNode::signal_total).sum()
    }

    pub fn error_squared_total(&self) -> f64 {
        self.children.iter().map(BoxNode::error_squared_total).sum()
    }

    /// Flat child index for a coordinate inside these extents.
    fn child_index(&self, coords: &[f32; ND]) -> usize {
        let indices = self.extents.child_indices(&self.split, coords);
        flatten::<ND>(&self.split, &indices)
    }

    pub fn add_event(&self, controller: &BoxController, event: E) -> Result<()> {
        let flat = self.child_index(event.coords());
        self.children[flat].add_event(controller, event)
    }
}

/// Row-major flattening of per-dimension child positions.
fn flatten<const ND: usize>(split: &[usize; ND], indices: &[usize; ND]) -> usize {
    let mut flat = 0;
    for d in (0..ND).rev() {
        flat = flat * split[d] + indices[d];
    }
    flat
}

fn unflatten<const ND: usize>(split: &[usize; ND], mut flat: usize) -> [usize; ND] {
    let mut indices = [0_usize; ND];
    for d in 0..ND {
        indices[d] = flat % split[d];
        flat /= split[d];
    }
    indices
}
