//! Cloud-in-cell interpolation weights on staggered grids.
//!
//! A sample living at `(i + stagger) * h` is addressed by the integer base
//! index `i`. For a coordinate `x` measured in cells from the grid origin,
//! the two bracketing samples are `floor(x - stagger)` and the next one.

/// Linear weights of a point between two neighbouring samples along one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CicStencil {
    /// Lower sample index.
    pub base: isize,
    /// Weights of `base` and `base + 1`, summing to one.
    pub weights: [f64; 2],
}

/// Compute the linear stencil for coordinate `s` (in cells) and a sample
/// stagger of `0.0` (node) or `0.5` (half cell).
#[inline]
pub fn cic_stencil(s: f64, stagger: f64) -> CicStencil {
    let t = s - stagger;
    let base = t.floor();
    let frac = t - base;
    CicStencil {
        base: base as isize,
        weights: [1.0 - frac, frac],
    }
}

/// Trilinear weight of corner `(a, b, c)` (each 0 or 1) of three stencils.
#[inline]
pub fn corner_weight(sx: &CicStencil, sy: &CicStencil, sz: &CicStencil, a: usize, b: usize, c: usize) -> f64 {
    sx.weights[a] * sy.weights[b] * sz.weights[c]
}
