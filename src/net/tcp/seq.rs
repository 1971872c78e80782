//! Sequence number comparisons modulo 2^32
//!
//! Each predicate walks the ring from `a`: `b` is inside the interval when its
//! distance from `a` is within the bounds given by `c`. An empty interval
//! (`a == c`) contains nothing, except that `le_le(a, a, a)` holds.

/// `a <= b < c`
pub fn le_lt(a: u32, b: u32, c: u32) -> bool {
    b.wrapping_sub(a) < c.wrapping_sub(a)
}

/// `a < b <= c`
pub fn lt_le(a: u32, b: u32, c: u32) -> bool {
    let b = b.wrapping_sub(a);
    b != 0 && b <= c.wrapping_sub(a)
}

/// `a <= b <= c`
pub fn le_le(a: u32, b: u32, c: u32) -> bool {
    b.wrapping_sub(a) <= c.wrapping_sub(a)
}

/// `a < b < c`
pub fn lt_lt(a: u32, b: u32, c: u32) -> bool {
    let b = b.wrapping_sub(a);
    b != 0 && b < c.wrapping_sub(a)
}
