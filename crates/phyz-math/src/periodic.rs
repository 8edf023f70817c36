//! Periodic wrapping of coordinates and grid indices.

/// Wrap a coordinate into `[0, length)`.
///
/// The result is strictly below `length` even when rounding of
/// `x + length` lands exactly on the upper bound.
#[inline]
pub fn wrap_coordinate(x: f64, length: f64) -> f64 {
    let mut r = x % length;
    if r < 0.0 {
        r += length;
    }
    if r >= length { 0.0 } else { r }
}

/// Wrap an index into `[0, n)`.
#[inline]
pub fn wrap_index(i: isize, n: usize) -> usize {
    i.rem_euclid(n as isize) as usize
}

/// Shortest signed index displacement from `from` to `to` on a ring of `n`.
///
/// Ties (exactly half the ring) resolve towards the positive direction.
#[inline]
pub fn minimum_image_index(from: isize, to: isize, n: usize) -> isize {
    let n = n as isize;
    let mut d = (to - from).rem_euclid(n);
    if d > n / 2 {
        d -= n;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_coordinate() {
        assert_eq!(wrap_coordinate(0.5, 2.0), 0.5);
        assert_eq!(wrap_coordinate(2.5, 2.0), 0.5);
        assert_eq!(wrap_coordinate(-0.5, 2.0), 1.5);
        assert_eq!(wrap_coordinate(2.0, 2.0), 0.0);
        // -tiny + L rounds to L, must still land inside
        let w = wrap_coordinate(-1e-18, 1.0);
        assert!((0.0..1.0).contains(&w));
    }

    #[test]
    fn test_wrap_index() {
        assert_eq!(wrap_index(-1, 4), 3);
        assert_eq!(wrap_index(4, 4), 0);
        assert_eq!(wrap_index(2, 4), 2);
    }

    #[test]
    fn test_minimum_image_index() {
        assert_eq!(minimum_image_index(3, 0, 4), 1);
        assert_eq!(minimum_image_index(0, 3, 4), -1);
        assert_eq!(minimum_image_index(1, 1, 4), 0);
        assert_eq!(minimum_image_index(0, 2, 4), 2);
        assert_eq!(minimum_image_index(0, 5, 8), -3);
    }
}
