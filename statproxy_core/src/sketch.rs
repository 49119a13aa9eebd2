//! HyperLogLog cardinality sketch.
//!
//! Fixed precision of 14 bits, 16384 one-byte registers, for a standard error
//! of roughly 0.81%. Small cardinalities are estimated by linear counting so a
//! sketch that saw a single distinct value estimates exactly 1.
//!
//! The binary form produced by [`Sketch::marshal`] is a version byte, the
//! precision byte and then every register in index order.

use std::hash::Hasher;

use rustc_hash::FxHasher;

/// Number of index bits.
pub const PRECISION: u8 = 14;
const REGISTERS: usize = 1 << PRECISION;
const MAX_RANK: u8 = 64 - PRECISION + 1;
const VERSION: u8 = 1;
const HEADER: usize = 2;

/// Errors produced when unmarshalling a [`Sketch`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The blob is not the size of a marshalled sketch.
    #[error("sketch blob is {len} bytes, expected {expected}")]
    Length {
        /// Observed size
        len: usize,
        /// Required size
        expected: usize,
    },
    /// The blob was written by an unknown format version.
    #[error("unsupported sketch version {0}")]
    Version(u8),
    /// The blob was written with a different precision.
    #[error("sketch precision {0} does not match {PRECISION}")]
    Precision(u8),
    /// A register holds a rank no insert can produce.
    #[error("register {index} holds impossible rank {rank}")]
    Register {
        /// Register index
        index: usize,
        /// Offending rank
        rank: u8,
    },
}

/// Approximate distinct-value counter.
#[derive(Clone, PartialEq, Eq)]
pub struct Sketch {
    registers: Box<[u8]>,
}

impl std::fmt::Debug for Sketch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sketch")
            .field("precision", &PRECISION)
            .field("estimate", &self.estimate())
            .finish()
    }
}

impl Default for Sketch {
    fn default() -> Self {
        Self::new()
    }
}

// FxHash is fast but its high bits are weak for short keys; the murmur3
// finalizer spreads them before the register index is taken.
fn hash(value: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_usize(value.len());
    hasher.write(value);
    let mut h = hasher.finish();
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

impl Sketch {
    /// Create an empty sketch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registers: vec![0; REGISTERS].into_boxed_slice(),
        }
    }

    /// Record one occurrence of `value`.
    pub fn insert(&mut self, value: &[u8]) {
        let h = hash(value);
        #[allow(clippy::cast_possible_truncation)]
        let index = (h >> (64 - PRECISION)) as usize;
        // The guard bit caps the rank at MAX_RANK when the remaining bits are
        // all zero.
        let rest = (h << PRECISION) | (1 << (PRECISION - 1));
        #[allow(clippy::cast_possible_truncation)]
        let rank = rest.leading_zeros() as u8 + 1;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// True if nothing was ever inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// Estimate the number of distinct values inserted.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn estimate(&self) -> u64 {
        let m = REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let mut sum = 0.0;
        let mut zeros = 0usize;
        for &rank in &*self.registers {
            sum += 2f64.powi(-i32::from(rank));
            if rank == 0 {
                zeros += 1;
            }
        }
        let raw = alpha * m * m / sum;
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }

    /// Fold `other` into this sketch. The result estimates the union.
    pub fn merge(&mut self, other: &Sketch) {
        for (mine, theirs) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    /// Serialize the sketch registers.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(HEADER + REGISTERS);
        blob.push(VERSION);
        blob.push(PRECISION);
        blob.extend_from_slice(&self.registers);
        blob
    }

    /// Deserialize a blob produced by [`Sketch::marshal`].
    ///
    /// # Errors
    ///
    /// Function will return an error if the blob has the wrong size, version
    /// or precision, or holds a register rank no insert could produce.
    pub fn unmarshal(blob: &[u8]) -> Result<Self, Error> {
        let expected = HEADER + REGISTERS;
        if blob.len() < HEADER {
            return Err(Error::Length {
                len: blob.len(),
                expected,
            });
        }
        if blob[0] != VERSION {
            return Err(Error::Version(blob[0]));
        }
        if blob[1] != PRECISION {
            return Err(Error::Precision(blob[1]));
        }
        if blob.len() != expected {
            return Err(Error::Length {
                len: blob.len(),
                expected,
            });
        }
        let registers = &blob[HEADER..];
        if let Some((index, &rank)) = registers
            .iter()
            .enumerate()
            .find(|&(_, &rank)| rank > MAX_RANK)
        {
            return Err(Error::Register { index, rank });
        }
        Ok(Self {
            registers: registers.into(),
        })
    }
}
