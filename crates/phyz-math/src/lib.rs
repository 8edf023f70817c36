//! Math primitives shared by the phyz plasma crates.
//!
//! Provides the `Vec3` alias used for positions, momenta and field samples,
//! periodic coordinate handling, and linear (cloud-in-cell) interpolation
//! weights on staggered grids.

pub mod interp;
pub mod periodic;

pub use interp::{CicStencil, cic_stencil, corner_weight};
pub use periodic::{minimum_image_index, wrap_coordinate, wrap_index};

use nalgebra as na;

/// 3D vector alias.
pub type Vec3 = na::Vector3<f64>;

/// Convert a `Vec3` into a plain array (x, y, z).
#[inline]
pub fn to_array(v: &Vec3) -> [f64; 3] {
    [v.x, v.y, v.z]
}

/// Build a `Vec3` from a plain array.
#[inline]
pub fn from_array(a: [f64; 3]) -> Vec3 {
    Vec3::new(a[0], a[1], a[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_conversion() {
        let v = Vec3::new(1.0, -2.0, 3.5);
        assert_eq!(from_array(to_array(&v)), v);
    }
}
