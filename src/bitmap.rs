// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use core::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Number of kernels addressable by a process group.
pub const KERNEL_BITMAP_BITS: usize = 128;

/// Number of 32-bit words in the routing bitmap carried by a command.
pub const ROUTING_BITMAP_WORDS: usize = 5;

/// Fixed-width 128-bit set of kernel ids.
///
/// Bit `n` selects kernel `n`. On the wire the bitmap is four little-endian
/// 32-bit words, word 0 holding kernels 0..32.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelBitmap(u128);

impl KernelBitmap {
    pub const EMPTY: KernelBitmap = KernelBitmap(0);
    pub const FULL: KernelBitmap = KernelBitmap(u128::MAX);

    pub const fn from_bits(bits: u128) -> Self {
        KernelBitmap(bits)
    }

    pub const fn bits(self) -> u128 {
        self.0
    }

    /// Builds a bitmap holding a single kernel.
    pub fn single(kernel: usize) -> Self {
        let mut bitmap = Self::EMPTY;
        bitmap.set(kernel);
        bitmap
    }

    pub fn from_words(words: [u32; 4]) -> Self {
        let bits = words
            .iter()
            .rev()
            .fold(0u128, |acc, word| (acc << 32) | u128::from(*word));
        KernelBitmap(bits)
    }

    pub fn to_words(self) -> [u32; 4] {
        [
            self.0 as u32,
            (self.0 >> 32) as u32,
            (self.0 >> 64) as u32,
            (self.0 >> 96) as u32,
        ]
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        KernelBitmap(u128::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    /// Sets `kernel`. Ids outside the bitmap are ignored.
    pub fn set(&mut self, kernel: usize) {
        if kernel < KERNEL_BITMAP_BITS {
            self.0 |= 1u128 << kernel;
        }
    }

    pub fn clear(&mut self, kernel: usize) {
        if kernel < KERNEL_BITMAP_BITS {
            self.0 &= !(1u128 << kernel);
        }
    }

    pub fn is_set(self, kernel: usize) -> bool {
        kernel < KERNEL_BITMAP_BITS && self.0 & (1u128 << kernel) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn union(self, other: KernelBitmap) -> Self {
        KernelBitmap(self.0 | other.0)
    }

    pub fn intersection(self, other: KernelBitmap) -> Self {
        KernelBitmap(self.0 & other.0)
    }

    pub fn complement(self) -> Self {
        KernelBitmap(!self.0)
    }

    /// Kernels of `self` that are not in `other`.
    pub fn difference(self, other: KernelBitmap) -> Self {
        self.intersection(other.complement())
    }

    pub fn intersects(self, other: KernelBitmap) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Lowest kernel id present in the set.
    pub fn first_set(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Iterates the kernel ids present, lowest first.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut rest = self;
        std::iter::from_fn(move || {
            let kernel = rest.first_set()?;
            rest.clear(kernel);
            Some(kernel)
        })
    }
}

impl BitOr for KernelBitmap {
    type Output = KernelBitmap;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitAnd for KernelBitmap {
    type Output = KernelBitmap;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.intersection(rhs)
    }
}

impl Not for KernelBitmap {
    type Output = KernelBitmap;

    fn not(self) -> Self::Output {
        self.complement()
    }
}

impl FromIterator<usize> for KernelBitmap {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut bitmap = KernelBitmap::EMPTY;
        for kernel in iter {
            bitmap.set(kernel);
        }
        bitmap
    }
}

impl fmt::Display for KernelBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#034x}", self.0)
    }
}

/// Routing bitmap selecting the data paths of a process group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoutingBitmap([u32; ROUTING_BITMAP_WORDS]);

impl RoutingBitmap {
    /// Builds the bitmap from a byte array where bit `n` lives in byte
    /// `n / 8` at position `n % 8`. Bits beyond the bitmap width are dropped.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = [0u32; ROUTING_BITMAP_WORDS];
        for (i, byte) in bytes.iter().enumerate().take(ROUTING_BITMAP_WORDS * 4) {
            words[i / 4] |= u32::from(*byte) << ((i % 4) * 8);
        }
        RoutingBitmap(words)
    }

    pub fn words(&self) -> [u32; ROUTING_BITMAP_WORDS] {
        self.0
    }

    pub fn is_set(&self, bit: usize) -> bool {
        bit < ROUTING_BITMAP_WORDS * 32 && self.0[bit / 32] & (1 << (bit % 32)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }
}
