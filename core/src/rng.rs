//! Deterministic substream randomness.
//!
//! Replications draw their generators from a precomputed table of MT19937
//! states whose rows are far apart in the generator's period, so successive
//! rows give non-overlapping streams. A row index is a stable identity: the
//! same index always reproduces the same stream.
//!
//! Handing the same row to two consumers is well defined but means they draw
//! the *same* sequence interleaved; see [SharedRng].

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use anyhow::anyhow;
use memmap2::Mmap;
use rand::seq::SliceRandom;
use rand::{Error, Rng, RngCore, SeedableRng};

use crate::error::{ResultExt, SystemError, TypedResult};
use crate::problem;

/// Words in an MT19937 state vector
pub const STATE_WORDS: usize = 624;

/// Bytes of one table row (a raw little-endian state vector)
const ROW_BYTES: usize = STATE_WORDS * 4;

const MATRIX_A: u32 = 0x9908_b0df;
const UPPER_MASK: u32 = 0x8000_0000;
const LOWER_MASK: u32 = 0x7fff_ffff;

/// The classic 32-bit Mersenne Twister.
///
/// Implemented in-crate because the substream provider restores generators
/// from raw 624-word state vectors, which is not an entry point the usual
/// generator crates expose. Plugs into the `rand` ecosystem through
/// [RngCore], so `rand_distr` samplers drive it directly.
#[derive(Clone, PartialEq, Eq)]
pub struct Mt19937 {
    state: [u32; STATE_WORDS],
    index: usize,
}

impl Mt19937 {
    /// Standard seeding (Knuth multiplier array initialization).
    pub fn new(seed: u32) -> Self {
        let mut state = [0u32; STATE_WORDS];
        state[0] = seed;
        for i in 1..STATE_WORDS {
            state[i] = 1_812_433_253u32
                .wrapping_mul(state[i - 1] ^ (state[i - 1] >> 30))
                .wrapping_add(i as u32);
        }
        Self {
            state,
            index: STATE_WORDS,
        }
    }

    /// Installs a raw state vector with position 624, forcing a twist before
    /// the first output. Two generators restored from the same vector are
    /// observationally identical.
    pub fn from_state(state: &[u32; STATE_WORDS]) -> Self {
        Self {
            state: *state,
            index: STATE_WORDS,
        }
    }

    fn twist(&mut self) {
        for i in 0..STATE_WORDS {
            let x = (self.state[i] & UPPER_MASK) | (self.state[(i + 1) % STATE_WORDS] & LOWER_MASK);
            let mut x_a = x >> 1;
            if x & 1 != 0 {
                x_a ^= MATRIX_A;
            }
            self.state[i] = self.state[(i + 397) % STATE_WORDS] ^ x_a;
        }
        self.index = 0;
    }
}

impl fmt::Debug for Mt19937 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mt19937").field("index", &self.index).finish()
    }
}

impl RngCore for Mt19937 {
    fn next_u32(&mut self) -> u32 {
        if self.index >= STATE_WORDS {
            self.twist();
        }
        let mut y = self.state[self.index];
        self.index += 1;

        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^ (y >> 18)
    }

    fn next_u64(&mut self) -> u64 {
        let lo = self.next_u32() as u64;
        let hi = self.next_u32() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for Mt19937 {
    type Seed = [u8; 4];

    fn from_seed(seed: Self::Seed) -> Self {
        Self::new(u32::from_le_bytes(seed))
    }
}

/// A generator handle shareable between the streams of one replication.
///
/// Sharing is the substream de-duplication strategy: streams holding clones
/// of the same handle draw one sequence interleaved. That is intentional
/// inside a replication and must never happen across replications.
pub type SharedRng = Rc<RefCell<Mt19937>>;

/// Wraps a generator into a [SharedRng] handle.
pub fn share(rng: Mt19937) -> SharedRng {
    Rc::new(RefCell::new(rng))
}

/// A read-only, memory-mapped table of MT19937 starting states.
///
/// The file is headerless: raw little-endian u32 words, 624 per row,
/// row-major (canonically 10 000 rows).
#[derive(Debug)]
pub struct SubstreamTable {
    map: Mmap,
    rows: usize,
}

impl SubstreamTable {
    pub fn open(path: impl AsRef<Path>) -> TypedResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| anyhow!("cannot open substream table {path:?}: {e}"))
            .typ(SystemError::SubstreamTable)?;
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| anyhow!("cannot map substream table {path:?}: {e}"))
            .typ(SystemError::SubstreamTable)?;
        if map.len() == 0 || map.len() % ROW_BYTES != 0 {
            problem!(
                SubstreamTable,
                "table length {} is not a positive multiple of the {ROW_BYTES}-byte row size",
                map.len()
            );
        }
        let rows = map.len() / ROW_BYTES;
        debug!("mapped substream table {path:?} with {rows} rows");
        Ok(Self { map, rows })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// The raw state vector stored at a row.
    pub fn state(&self, index: usize) -> TypedResult<[u32; STATE_WORDS]> {
        if index >= self.rows {
            problem!(
                SubstreamTable,
                "substream index {index} out of range for {} rows",
                self.rows
            );
        }
        let row = &self.map[index * ROW_BYTES..(index + 1) * ROW_BYTES];
        let mut state = [0u32; STATE_WORDS];
        for (word, bytes) in state.iter_mut().zip(row.chunks_exact(4)) {
            *word = u32::from_le_bytes(bytes.try_into().expect("chunk is 4 bytes"));
        }
        Ok(state)
    }

    /// A generator restored from a row.
    pub fn rng(&self, index: usize) -> TypedResult<Mt19937> {
        Ok(Mt19937::from_state(&self.state(index)?))
    }
}

/// The sole source of substream assignments.
///
/// Yields each row index exactly once, sequentially from `start` (wrapping)
/// or in a shuffled order.
#[derive(Debug, Clone)]
pub struct SubstreamIndices {
    order: std::vec::IntoIter<usize>,
}

impl SubstreamIndices {
    pub fn sequential(rows: usize, start: usize) -> Self {
        let order: Vec<usize> = (start..rows).chain(0..start.min(rows)).collect();
        Self {
            order: order.into_iter(),
        }
    }

    pub fn shuffled<R: Rng + ?Sized>(rows: usize, rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..rows).collect();
        order.shuffle(rng);
        Self {
            order: order.into_iter(),
        }
    }
}

impl Iterator for SubstreamIndices {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.order.next()
    }
}
