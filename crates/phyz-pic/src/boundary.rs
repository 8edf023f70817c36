//! Periodic boundary enforcement on ghost layers.
//!
//! Y and Z wrap locally since every partition holds their full extent.
//! X goes through the [`Exchange`], which for a single partition hands the
//! planes back to itself.

use crate::error::Result;
use crate::exchange::Exchange;
use crate::field::{Array3D, FieldArrays, FieldComponent, GHOST, NodeRange};

/// Copy every ghost node of `range` along `axis` from the opposite face.
///
/// Nodes of `range` that are interior along `axis` are left alone.
pub fn evaluate_periodic(array: &mut Array3D, axis: usize, range: NodeRange) {
    let n = array.dims()[axis] as isize;
    for p in range.iter() {
        if p[axis] < 0 || p[axis] >= n {
            let mut src = p;
            src[axis] = p[axis].rem_euclid(n);
            let v = array.get(src[0], src[1], src[2]);
            array.set(p[0], p[1], p[2], v);
        }
    }
}

/// Add every ghost node of `range` along `axis` onto the opposite face and
/// zero the ghost.
pub fn fold_periodic(array: &mut Array3D, axis: usize, range: NodeRange) {
    let n = array.dims()[axis] as isize;
    for p in range.iter() {
        if p[axis] < 0 || p[axis] >= n {
            let mut dst = p;
            dst[axis] = p[axis].rem_euclid(n);
            let v = array.get(p[0], p[1], p[2]);
            array.add(dst[0], dst[1], dst[2], v);
            array.set(p[0], p[1], p[2], 0.0);
        }
    }
}

fn z_ghosts(n: [usize; 3]) -> NodeRange {
    let g = GHOST as isize;
    NodeRange::new([0, 0, -g], [n[0], n[1], n[2] + 2 * GHOST])
}

fn y_ghosts(n: [usize; 3]) -> NodeRange {
    let g = GHOST as isize;
    NodeRange::new([0, -g, -g], [n[0], n[1] + 2 * GHOST, n[2] + 2 * GHOST])
}

/// Refresh all ghost nodes of one array from periodic images.
///
/// Z first, then Y over the interior X range, then whole X planes (with
/// their Y/Z ghosts) through the exchange, so corners are consistent.
pub fn fill_ghosts<X: Exchange + ?Sized>(array: &mut Array3D, exchange: &X) -> Result<()> {
    let n = array.dims();
    evaluate_periodic(array, 2, z_ghosts(n));
    evaluate_periodic(array, 1, y_ghosts(n));

    let to_low = array.x_planes(0, GHOST);
    let to_high = array.x_planes((n[0] - GHOST) as isize, GHOST);
    let (from_low, from_high) = exchange.exchange_planes(to_low, to_high)?;
    array.write_x_planes(-(GHOST as isize), GHOST, &from_low, false)?;
    array.write_x_planes(n[0] as isize, GHOST, &from_high, false)?;
    Ok(())
}

/// Fold ghost contributions onto their periodic images, then refill ghosts.
///
/// Used for deposited sources: X planes travel to the neighbour first, then
/// Y and Z fold locally, which carries corner contributions to the right
/// owner.
pub fn fold_ghosts<X: Exchange + ?Sized>(array: &mut Array3D, exchange: &X) -> Result<()> {
    let n = array.dims();
    let g = GHOST as isize;

    let to_low = array.x_planes(-g, GHOST);
    let to_high = array.x_planes(n[0] as isize, GHOST);
    let (from_low, from_high) = exchange.exchange_planes(to_low, to_high)?;
    array.write_x_planes(0, GHOST, &from_low, true)?;
    array.write_x_planes((n[0] - GHOST) as isize, GHOST, &from_high, true)?;

    fold_periodic(array, 1, y_ghosts(n));
    fold_periodic(array, 2, z_ghosts(n));
    array.zero_ghosts();
    fill_ghosts(array, exchange)
}

/// Fill ghosts of several components.
pub fn fill_components<X: Exchange + ?Sized>(
    fields: &mut FieldArrays,
    components: &[FieldComponent],
    exchange: &X,
) -> Result<()> {
    for &c in components {
        fill_ghosts(fields.get_mut(c), exchange)?;
    }
    Ok(())
}

/// Fold ghosts of several components.
pub fn fold_components<X: Exchange + ?Sized>(
    fields: &mut FieldArrays,
    components: &[FieldComponent],
    exchange: &X,
) -> Result<()> {
    for &c in components {
        fold_ghosts(fields.get_mut(c), exchange)?;
    }
    Ok(())
}
