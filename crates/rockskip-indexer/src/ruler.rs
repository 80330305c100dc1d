//! Ruler arithmetic behind the compressed ancestry chain.
//!
//! Commit heights start at 1 on top of a synthetic root at height 0. The
//! ancestor pointer of the commit at height `h` is the `ruler(h)`-th hop of
//! its parent, so following ancestor pointers from any commit reaches the
//! root in `O(log h)` steps.

/// Number of trailing zero bits of `n` (OEIS A007814), with `ruler(0) == 0`.
pub fn ruler(n: u32) -> usize {
    if n == 0 {
        return 0;
    }
    n.trailing_zeros() as usize
}
