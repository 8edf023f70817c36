//! Staggered field storage with ghost layers.
//!
//! Every array holds the interior `Nx × Ny × Nz` samples of one component
//! plus [`GHOST`] layers on each face. Indices are signed so ghost samples
//! are addressed as `-GHOST..0` and `N..N + GHOST`. Storage is X fastest.

use crate::error::{PicError, Result};

/// Ghost layer width on every face.
pub const GHOST: usize = 2;

/// The ten field arrays, in control-point order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldComponent {
    Ex,
    Ey,
    Ez,
    Hx,
    Hy,
    Hz,
    Jx,
    Jy,
    Jz,
    Rho,
}

impl FieldComponent {
    pub const ALL: [FieldComponent; 10] = [
        FieldComponent::Ex,
        FieldComponent::Ey,
        FieldComponent::Ez,
        FieldComponent::Hx,
        FieldComponent::Hy,
        FieldComponent::Hz,
        FieldComponent::Jx,
        FieldComponent::Jy,
        FieldComponent::Jz,
        FieldComponent::Rho,
    ];
    pub const ELECTRIC: [FieldComponent; 3] =
        [FieldComponent::Ex, FieldComponent::Ey, FieldComponent::Ez];
    pub const MAGNETIC: [FieldComponent; 3] =
        [FieldComponent::Hx, FieldComponent::Hy, FieldComponent::Hz];
    pub const CURRENT: [FieldComponent; 3] =
        [FieldComponent::Jx, FieldComponent::Jy, FieldComponent::Jz];

    /// Position in [`FieldComponent::ALL`].
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldComponent::Ex => "Ex",
            FieldComponent::Ey => "Ey",
            FieldComponent::Ez => "Ez",
            FieldComponent::Hx => "Hx",
            FieldComponent::Hy => "Hy",
            FieldComponent::Hz => "Hz",
            FieldComponent::Jx => "Jx",
            FieldComponent::Jy => "Jy",
            FieldComponent::Jz => "Jz",
            FieldComponent::Rho => "Rho",
        }
    }

    /// Offset of the sample from its base node, in cells.
    pub fn stagger(self) -> [f64; 3] {
        match self {
            FieldComponent::Ex | FieldComponent::Jx => [0.5, 0.0, 0.0],
            FieldComponent::Ey | FieldComponent::Jy => [0.0, 0.5, 0.0],
            FieldComponent::Ez | FieldComponent::Jz => [0.0, 0.0, 0.5],
            FieldComponent::Hx => [0.0, 0.5, 0.5],
            FieldComponent::Hy => [0.5, 0.0, 0.5],
            FieldComponent::Hz => [0.5, 0.5, 0.0],
            FieldComponent::Rho => [0.0, 0.0, 0.0],
        }
    }
}

/// Explicit node range: `extent` nodes per axis starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRange {
    pub start: [isize; 3],
    pub extent: [usize; 3],
}

impl NodeRange {
    pub fn new(start: [isize; 3], extent: [usize; 3]) -> Self {
        Self { start, extent }
    }

    /// All interior nodes of an `n` grid.
    pub fn interior(n: [usize; 3]) -> Self {
        Self::new([0, 0, 0], n)
    }

    /// Interior nodes plus `width` ghost nodes on the low side of every axis.
    pub fn with_low_ghosts(n: [usize; 3], width: usize) -> Self {
        let w = width as isize;
        Self::new([-w, -w, -w], [n[0] + width, n[1] + width, n[2] + width])
    }

    pub fn len(&self) -> usize {
        self.extent[0] * self.extent[1] * self.extent[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End (exclusive) along `axis`.
    #[inline]
    pub fn end(&self, axis: usize) -> isize {
        self.start[axis] + self.extent[axis] as isize
    }

    /// Nodes in X-fastest order.
    pub fn iter(&self) -> impl Iterator<Item = [isize; 3]> + '_ {
        (self.start[2]..self.end(2)).flat_map(move |k| {
            (self.start[1]..self.end(1))
                .flat_map(move |j| (self.start[0]..self.end(0)).map(move |i| [i, j, k]))
        })
    }
}

/// 3D array with ghost layers.
#[derive(Debug, Clone, PartialEq)]
pub struct Array3D {
    n: [usize; 3],
    padded: [usize; 3],
    data: Vec<f64>,
}

impl Array3D {
    /// Create a new array of `n` interior samples filled with zeros.
    pub fn zeros(n: [usize; 3]) -> Self {
        let padded = [n[0] + 2 * GHOST, n[1] + 2 * GHOST, n[2] + 2 * GHOST];
        Self {
            n,
            padded,
            data: vec![0.0; padded[0] * padded[1] * padded[2]],
        }
    }

    /// Interior dimensions.
    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        self.n
    }

    /// Dimensions including ghost layers.
    #[inline]
    pub fn padded_dims(&self) -> [usize; 3] {
        self.padded
    }

    /// Whether `(i, j, k)` addresses an interior or ghost sample.
    #[inline]
    pub fn contains(&self, i: isize, j: isize, k: isize) -> bool {
        let g = GHOST as isize;
        i >= -g
            && j >= -g
            && k >= -g
            && i < (self.n[0] + GHOST) as isize
            && j < (self.n[1] + GHOST) as isize
            && k < (self.n[2] + GHOST) as isize
    }

    /// Flat storage index of `(i, j, k)`.
    #[inline]
    pub fn index(&self, i: isize, j: isize, k: isize) -> usize {
        debug_assert!(self.contains(i, j, k), "({i}, {j}, {k}) outside {:?}", self.n);
        let g = GHOST as isize;
        let (px, py) = (self.padded[0] as isize, self.padded[1] as isize);
        ((i + g) + px * ((j + g) + py * (k + g))) as usize
    }

    #[inline]
    pub fn get(&self, i: isize, j: isize, k: isize) -> f64 {
        self.data[self.index(i, j, k)]
    }

    #[inline]
    pub fn set(&mut self, i: isize, j: isize, k: isize, value: f64) {
        let idx = self.index(i, j, k);
        self.data[idx] = value;
    }

    #[inline]
    pub fn add(&mut self, i: isize, j: isize, k: isize, value: f64) {
        let idx = self.index(i, j, k);
        self.data[idx] += value;
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Number of values in one X plane including ghosts.
    #[inline]
    pub fn plane_len(&self) -> usize {
        self.padded[1] * self.padded[2]
    }

    /// Clear all values to zero.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Zero every ghost sample, leaving the interior untouched.
    pub fn zero_ghosts(&mut self) {
        let n = self.n;
        let g = GHOST as isize;
        for k in -g..(n[2] as isize + g) {
            for j in -g..(n[1] as isize + g) {
                for i in -g..(n[0] as isize + g) {
                    let inside = i >= 0
                        && j >= 0
                        && k >= 0
                        && i < n[0] as isize
                        && j < n[1] as isize
                        && k < n[2] as isize;
                    if !inside {
                        self.set(i, j, k, 0.0);
                    }
                }
            }
        }
    }

    /// Interior values, X fastest.
    pub fn interior_values(&self) -> Vec<f64> {
        NodeRange::interior(self.n)
            .iter()
            .map(|[i, j, k]| self.get(i, j, k))
            .collect()
    }

    /// Overwrite the interior from X-fastest values.
    pub fn set_interior_values(&mut self, values: &[f64]) -> Result<()> {
        let expected = self.n[0] * self.n[1] * self.n[2];
        if values.len() != expected {
            return Err(PicError::ShapeMismatch(format!(
                "expected {expected} interior values, got {}",
                values.len()
            )));
        }
        for ([i, j, k], &v) in NodeRange::interior(self.n).iter().zip(values) {
            self.set(i, j, k, v);
        }
        Ok(())
    }

    /// Copy `count` X planes starting at `start`, over the full padded Y/Z extent.
    pub fn x_planes(&self, start: isize, count: usize) -> Vec<f64> {
        let g = GHOST as isize;
        let mut out = Vec::with_capacity(count * self.plane_len());
        for i in start..start + count as isize {
            for k in -g..(self.n[2] as isize + g) {
                for j in -g..(self.n[1] as isize + g) {
                    out.push(self.get(i, j, k));
                }
            }
        }
        out
    }

    /// Overwrite (or accumulate into) `count` X planes starting at `start`.
    pub fn write_x_planes(&mut self, start: isize, count: usize, values: &[f64], accumulate: bool) -> Result<()> {
        if values.len() != count * self.plane_len() {
            return Err(PicError::ShapeMismatch(format!(
                "expected {} plane values, got {}",
                count * self.plane_len(),
                values.len()
            )));
        }
        let g = GHOST as isize;
        let mut it = values.iter();
        for i in start..start + count as isize {
            for k in -g..(self.n[2] as isize + g) {
                for j in -g..(self.n[1] as isize + g) {
                    if let Some(&v) = it.next() {
                        if accumulate {
                            self.add(i, j, k, v);
                        } else {
                            self.set(i, j, k, v);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// First non-finite value in storage, as `(flat index, value)`.
    pub fn first_non_finite(&self) -> Option<(usize, f64)> {
        self.data
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite())
            .map(|(i, &v)| (i, v))
    }

    /// Sum of interior values.
    pub fn interior_sum(&self) -> f64 {
        NodeRange::interior(self.n)
            .iter()
            .map(|[i, j, k]| self.get(i, j, k))
            .sum()
    }

    /// Squared norm of interior values.
    pub fn interior_norm_squared(&self) -> f64 {
        NodeRange::interior(self.n)
            .iter()
            .map(|[i, j, k]| {
                let v = self.get(i, j, k);
                v * v
            })
            .sum()
    }
}

/// Mutable field groups borrowed at once, each slice in x, y, z order.
pub struct FieldViewMut<'a> {
    pub e: &'a mut [Array3D],
    pub h: &'a mut [Array3D],
    pub j: &'a mut [Array3D],
    pub rho: &'a mut Array3D,
}

/// The ten field, current and charge arrays of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldArrays {
    arrays: Vec<Array3D>,
}

impl FieldArrays {
    pub fn zeros(n: [usize; 3]) -> Self {
        Self {
            arrays: FieldComponent::ALL.iter().map(|_| Array3D::zeros(n)).collect(),
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.arrays[0].dims()
    }

    #[inline]
    pub fn get(&self, component: FieldComponent) -> &Array3D {
        &self.arrays[component.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, component: FieldComponent) -> &mut Array3D {
        &mut self.arrays[component.index()]
    }

    /// Disjoint mutable views of the electric, magnetic, current and
    /// charge groups.
    pub fn split_mut(&mut self) -> FieldViewMut<'_> {
        let (e, rest) = self.arrays.split_at_mut(3);
        let (h, rest) = rest.split_at_mut(3);
        let (j, rho) = rest.split_at_mut(3);
        FieldViewMut {
            e,
            h,
            j,
            rho: &mut rho[0],
        }
    }

    /// Arrays in control-point order.
    pub fn iter(&self) -> impl Iterator<Item = (FieldComponent, &Array3D)> {
        FieldComponent::ALL.iter().copied().zip(self.arrays.iter())
    }

    /// Zero the current arrays and, when `include_rho`, the charge array.
    pub fn clear_sources(&mut self, include_rho: bool) {
        for c in FieldComponent::CURRENT {
            self.get_mut(c).clear();
        }
        if include_rho {
            self.get_mut(FieldComponent::Rho).clear();
        }
    }
}
