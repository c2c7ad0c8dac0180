/// Axis-aligned extents of a box in N-dimensional space.
///
/// Coordinates are stored as `f32` (events carry single-precision positions),
/// one `(min, max)` pair per dimension. The number of dimensions is a
/// compile-time constant shared by every box in one tree.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extents<const ND: usize> {
    pub min: [f32; ND],
    pub max: [f32; ND],
}

impl<const ND: usize> Extents<ND> {
    pub fn new(min: [f32; ND], max: [f32; ND]) -> Self {
        Self { min, max }
    }

    /// Check whether a coordinate lies inside (inclusive on both sides).
    pub fn contains(&self, coords: &[f32; ND]) -> bool {
        for d in 0..ND {
            if coords[d] < self.min[d] || coords[d] > self.max[d] {
                return false;
            }
        }
        true
    }

    /// Width of the extents along one dimension.
    pub fn width(&self, dim: usize) -> f32 {
        self.max[dim] - self.min[dim]
    }

    /// Midpoint of the extents.
    pub fn center(&self) -> [f32; ND] {
        let mut c = [0.0_f32; ND];
        for d in 0..ND {
            c[d] = self.min[d] + self.width(d) / 2.0;
        }
        c
    }

    /// Volume of the box (product of widths).
    pub fn volume(&self) -> f64 {
        let mut v = 1.0;
        for d in 0..ND {
            v *= f64::from(self.width(d));
        }
        v
    }

    /// Extents of one child when these extents are divided evenly into
    /// `split[d]` parts per dimension.
    ///
    /// `indices[d]` is the child's position along dimension `d`, starting at
    /// the minimum edge. The last child along each dimension ends exactly at
    /// `max` so the children tile the parent without gaps.
    pub fn child(&self, split: &[usize], indices: &[usize; ND]) -> Self {
        let mut min = [0.0_f32; ND];
        let mut max = [0.0_f32; ND];
        for d in 0..ND {
            let step = self.width(d) / split[d] as f32;
            min[d] = self.min[d] + indices[d] as f32 * step;
            max[d] = if indices[d] + 1 == split[d] {
                self.max[d]
            } else {
                self.min[d] + (indices[d] + 1) as f32 * step
            };
        }
        Self { min, max }
    }

    /// Per-dimension child position for a coordinate, clamped into range so
    /// that coordinates on the outer boundary land in the edge child.
    pub fn child_indices(&self, split: &[usize], coords: &[f32; ND]) -> [usize; ND] {
        let mut indices = [0_usize; ND];
        for d in 0..ND {
            let scale = split[d] as f32 / self.width(d);
            let idx = ((coords[d] - self.min[d]) * scale) as isize;
            indices[d] = idx.clamp(0, split[d] as isize - 1) as usize;
        }
        indices
    }
}
