//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(addr: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Next power of two that is at least `n`, with a floor of `min`.
pub fn pow2_at_least(n: usize, min: usize) -> usize {
    n.max(min).next_power_of_two()
}
