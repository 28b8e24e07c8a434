// Copyright 2025 xipcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::{Debug, Display},
    ops::{Add, BitAnd, Not, Range, Sub},
};

/// An unsigned trait that used by the utils.
pub trait Unsigned:
    Add<Output = Self>
    + Sub<Output = Self>
    + BitAnd<Output = Self>
    + Not<Output = Self>
    + Sized
    + From<u8>
    + Eq
    + Debug
    + Display
    + Clone
    + Copy
{
}

impl<
        U: Add<Output = Self>
            + Sub<Output = Self>
            + BitAnd<Output = Self>
            + Not<Output = Self>
            + Sized
            + From<u8>
            + Eq
            + Debug
            + Display
            + Clone
            + Copy,
    > Unsigned for U
{
}

/// Check if the given value is a power of 2.
#[inline(always)]
pub fn is_pow2<U: Unsigned>(v: U) -> bool {
    v != U::from(0) && v & (v - U::from(1)) == U::from(0)
}

/// Debug assert that the given value is a power of 2.
#[inline(always)]
pub fn debug_assert_pow2<U: Unsigned>(v: U) {
    debug_assert_eq!(v & (v - U::from(1)), U::from(0), "v: {}", v);
}

/// Check if the given value is aligned with the given align.
///
/// Note: The given align must be a power of 2.
#[inline(always)]
pub fn is_aligned<U: Unsigned>(align: U, v: U) -> bool {
    debug_assert_pow2(align);
    v & (align - U::from(1)) == U::from(0)
}

/// Align up the given value with the given align.
///
/// Note: The given align must be a power of 2.
#[inline(always)]
pub fn align_up<U: Unsigned>(align: U, v: U) -> U {
    debug_assert_pow2(align);
    (v + align - U::from(1)) & !(align - U::from(1))
}

/// Align down the given value with the given align.
///
/// Note: The given align must be a power of 2.
#[inline(always)]
pub fn align_down<U: Unsigned>(align: U, v: U) -> U {
    debug_assert_pow2(align);
    v & !(align - U::from(1))
}

/// Indices of the `block`-sized units touched by the byte range `[offset, offset + len)`.
///
/// An empty range touches no unit.
#[inline]
pub fn block_span(block: u64, offset: u64, len: u64) -> Range<u64> {
    if len == 0 {
        return offset / block..offset / block;
    }
    let start = align_down(block, offset) / block;
    let end = align_up(block, offset + len) / block;
    start..end
}

/// Whether the half-open ranges `[a, a + alen)` and `[b, b + blen)` overlap.
#[inline]
pub fn overlaps(a: u64, alen: u64, b: u64, blen: u64) -> bool {
    !(a + alen <= b || b + blen <= a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(4096u64, 1), 4096);
        assert_eq!(align_up(4096u64, 4096), 4096);
        assert_eq!(align_down(4096u64, 4095), 0);
        assert_eq!(align_down(2u64 << 20, (2 << 20) + 5), 2 << 20);
        assert!(is_aligned(4096usize, 8192));
        assert!(!is_aligned(4096usize, 8193));
        assert!(is_pow2(1u64 << 21));
        assert!(!is_pow2(0u64));
        assert!(!is_pow2(3u64));
    }

    #[test]
    fn test_block_span() {
        assert_eq!(block_span(4096, 0, 5), 0..1);
        assert_eq!(block_span(4096, 4095, 2), 0..2);
        assert_eq!(block_span(4096, 4096, 4096), 1..2);
        assert_eq!(block_span(4096, 8192, 0), 2..2);
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps(0, 10, 5, 10));
        assert!(overlaps(5, 10, 0, 10));
        assert!(!overlaps(0, 10, 10, 10));
        assert!(!overlaps(10, 10, 0, 10));
        assert!(overlaps(0, 100, 10, 1));
    }
}
