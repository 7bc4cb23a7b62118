//! Operation mix, key encoding and value generation.
//!
//! A worker turns integer draws into store operations with the types in this module: a [`Mix`]
//! picks the next [`Op`], a [`KeyBuilder`] turns a key index into a fixed-size key, and a
//! [`ValueBuilder`] hands out value bytes whose size follows a [`Distribution`].

use crate::distribution::Distribution;
use crate::error::ConfigError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;

// {{{ mix

/// The operations a traffic worker can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Update,
    Insert,
    Scan,
    ReadModifyWrite,
    Generic,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Read => "read",
            Op::Update => "update",
            Op::Insert => "insert",
            Op::Scan => "scan",
            Op::ReadModifyWrite => "rmw",
            Op::Generic => "generic",
        };
        f.write_str(s)
    }
}

/// Number of slots of a [`Mix`] table, one per percentage point.
pub const MIX_SLOTS: usize = 100;

/// A table of 100 slots that maps a uniform draw in `[0, 100)` to an operation. Each operation
/// occupies as many slots as its percentage.
#[derive(Debug, Clone)]
pub struct Mix {
    table: Vec<Op>,
}

impl Mix {
    /// Build a table from `(op, percentage)` pairs, filled in the given order. The percentages
    /// must add up to exactly 100.
    pub fn new(entries: &[(Op, u8)]) -> Result<Self, ConfigError> {
        let total: u32 = entries.iter().map(|(_, p)| *p as u32).sum();
        if total != MIX_SLOTS as u32 {
            return Err(ConfigError::MixNotHundred(total));
        }
        let mut table = Vec::with_capacity(MIX_SLOTS);
        for (op, perc) in entries {
            table.extend(std::iter::repeat(*op).take(*perc as usize));
        }
        Ok(Self { table })
    }

    pub fn next(&self, rng: &mut impl Rng) -> Op {
        self.table[rng.random_range(0..MIX_SLOTS)]
    }
}

// }}} mix

// {{{ keys

/// Literal prefix of unsharded keys.
pub const KEY_PREFIX: &[u8] = b"U: ";

/// Width of a shard prefix.
pub const SHARD_SIZE: usize = 8;

/// Base seed of the per-index generator of random keys.
const RANDOM_KEY_SEED: u64 = 1118388721419649241;

/// Random keys draw their bytes from `'0'` onwards within this many characters.
const RANDOM_KEY_CHARS: u8 = 62;

/// Random suffixes of sharded keys draw raw bytes below this bound.
const RANDOM_SUFFIX_BOUND: u8 = 250;

/// Shard prefixes starting with this byte are rejected, as stores reserve that key range.
const RESERVED_SHARD_BYTE: u8 = 0xFF;

/// The four key layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// `U: ` followed by the zero-padded decimal index.
    Fkvb,
    /// The whole key is random, derived from the index.
    Random,
    /// A per-worker shard prefix followed by the zero-padded decimal index.
    ShardedFkvb,
    /// A per-worker shard prefix followed by random bytes derived from the index.
    ShardedRandom,
}

impl KeyType {
    pub fn is_sharded(&self) -> bool {
        matches!(self, KeyType::ShardedFkvb | KeyType::ShardedRandom)
    }
}

impl FromStr for KeyType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fkvb" => Ok(KeyType::Fkvb),
            "random" => Ok(KeyType::Random),
            "sharded_fkvb" => Ok(KeyType::ShardedFkvb),
            "sharded_random" => Ok(KeyType::ShardedRandom),
            _ => Err(ConfigError::UnknownKeyType(s.to_string())),
        }
    }
}

/// Number of decimal digits of `x`.
pub fn digits(x: u64) -> usize {
    x.checked_ilog10().map_or(1, |d| d as usize + 1)
}

/// Derive the shard prefix of worker `tid` from `seed`.
///
/// The shard generator skips `tid` draws, then every attempt concatenates the high 32 bits of two
/// 63-bit draws. Attempts are repeated until the first byte is not reserved.
pub fn shard_prefix(seed: u64, tid: u64) -> [u8; SHARD_SIZE] {
    const MASK: u64 = 0xFFFF_FFFF_0000_0000;
    const SEED_RANGE: u64 = 100_000_000_000;
    let mut shard_rng = StdRng::seed_from_u64(seed);
    for _ in 0..tid {
        shard_rng.random_range(0..SEED_RANGE);
    }
    loop {
        let s1 = StdRng::seed_from_u64(shard_rng.random_range(0..SEED_RANGE))
            .random_range(0..1u64 << 63);
        let s2 = StdRng::seed_from_u64(shard_rng.random_range(0..SEED_RANGE))
            .random_range(0..1u64 << 63);
        let bytes = ((s1 & MASK) | ((s2 & MASK) >> 32)).to_le_bytes();
        if bytes[0] != RESERVED_SHARD_BYTE {
            return bytes;
        }
    }
}

/// Encodes key indices into fixed-size keys.
///
/// Random layouts reseed their generator from the index on every call, so the same index always
/// yields the same key.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    key_type: KeyType,
    key_size: usize,
    prefix: Vec<u8>,
    rng: StdRng,
}

impl KeyBuilder {
    /// `shard` is only used by the sharded layouts.
    pub fn new(
        key_type: KeyType,
        key_size: usize,
        num_keys: u64,
        shard: [u8; SHARD_SIZE],
    ) -> Result<Self, ConfigError> {
        let prefix = match key_type {
            KeyType::Fkvb => KEY_PREFIX.to_vec(),
            // the whole key is random, but it still has to fit the decimal layout
            KeyType::Random => Vec::new(),
            KeyType::ShardedFkvb | KeyType::ShardedRandom => shard.to_vec(),
        };
        let prefix_len = match key_type {
            KeyType::Random => KEY_PREFIX.len(),
            _ => prefix.len(),
        };
        if key_size <= prefix_len || key_size - prefix_len < digits(num_keys) {
            return Err(ConfigError::KeyTooNarrow {
                num_keys,
                key_size,
                prefix_len,
            });
        }
        Ok(Self {
            key_type,
            key_size,
            prefix,
            rng: StdRng::seed_from_u64(RANDOM_KEY_SEED),
        })
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn payload(&self) -> usize {
        self.key_size - self.prefix.len()
    }

    /// Write the key of `index` into `out`, replacing its content.
    pub fn build(&mut self, index: u64, out: &mut Vec<u8>) -> Result<(), ConfigError> {
        out.clear();
        out.extend_from_slice(&self.prefix);
        match self.key_type {
            KeyType::Fkvb | KeyType::ShardedFkvb => {
                let payload = self.payload();
                if digits(index) > payload {
                    return Err(ConfigError::KeyTooNarrow {
                        num_keys: index,
                        key_size: self.key_size,
                        prefix_len: self.prefix.len(),
                    });
                }
                out.resize(self.key_size, b'0');
                let mut k = index;
                for slot in out.iter_mut().rev().take(digits(index)) {
                    *slot = b'0' + (k % 10) as u8;
                    k /= 10;
                }
            }
            KeyType::Random => {
                self.rng = StdRng::seed_from_u64(RANDOM_KEY_SEED.wrapping_add(index));
                for _ in 0..self.key_size {
                    out.push(b'0' + self.rng.random_range(0..RANDOM_KEY_CHARS));
                }
            }
            KeyType::ShardedRandom => {
                self.rng = StdRng::seed_from_u64(RANDOM_KEY_SEED.wrapping_add(index));
                for _ in 0..self.payload() {
                    out.push(self.rng.random_range(0..RANDOM_SUFFIX_BOUND));
                }
            }
        }
        Ok(())
    }

    /// Recover the index of a decimal key. Random layouts cannot be decoded.
    pub fn decode(&self, key: &[u8]) -> Option<u64> {
        if !matches!(self.key_type, KeyType::Fkvb | KeyType::ShardedFkvb) {
            return None;
        }
        if key.len() != self.key_size {
            return None;
        }
        let payload = key.strip_prefix(self.prefix.as_slice())?;
        payload.iter().try_fold(0u64, |acc, b| {
            if b.is_ascii_digit() {
                acc.checked_mul(10)?.checked_add((b - b'0') as u64)
            } else {
                None
            }
        })
    }
}

// }}} keys

// {{{ values

/// Size of the byte pool values are sliced from.
pub const VALUE_POOL_SIZE: usize = 1 << 20;

/// Pool bytes are printable, in `[65, 127)`.
const VALUE_BYTE_RANGE: std::ops::Range<u8> = 65..127;

/// Hands out value bytes sliced from a pre-generated pool.
///
/// The cursor restarts from zero when the next value would run past the end of the pool, so the
/// same bytes may be reused across values.
#[derive(Debug, Clone)]
pub struct ValueBuilder {
    pool: Box<[u8]>,
    cursor: usize,
    sizes: Distribution,
}

impl ValueBuilder {
    pub fn new(sizes: Distribution, seed: u64) -> Result<Self, ConfigError> {
        let max = sizes.upper().saturating_sub(1);
        if max > VALUE_POOL_SIZE as u64 {
            return Err(ConfigError::ValueTooLarge {
                size: max,
                pool: VALUE_POOL_SIZE,
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let pool = (0..VALUE_POOL_SIZE)
            .map(|_| rng.random_range(VALUE_BYTE_RANGE))
            .collect();
        Ok(Self {
            pool,
            cursor: 0,
            sizes,
        })
    }

    /// The bytes of the next value.
    pub fn next(&mut self) -> &[u8] {
        let size = self.sizes.next() as usize;
        if self.cursor + size > self.pool.len() {
            self.cursor = 0;
        }
        let start = self.cursor;
        self.cursor += size;
        &self.pool[start..start + size]
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

// }}} values

#[cfg(test)]
mod tests {
    use super::*;

    fn full_mix() -> Mix {
        Mix::new(&[
            (Op::Scan, 5),
            (Op::Read, 50),
            (Op::Update, 20),
            (Op::ReadModifyWrite, 10),
            (Op::Insert, 10),
            (Op::Generic, 5),
        ])
        .unwrap()
    }

    #[test]
    fn mix_one_type_only() {
        let mut rng = StdRng::seed_from_u64(1);
        let mix = Mix::new(&[(Op::Read, 100), (Op::Update, 0)]).unwrap();
        for _ in 0..1000 {
            assert_eq!(mix.next(&mut rng), Op::Read);
        }
    }

    #[test]
    fn mix_frequencies() {
        let mut rng = StdRng::seed_from_u64(2);
        let mix = full_mix();
        let mut counts = hashbrown::HashMap::new();
        let n = 1_000_000;
        for _ in 0..n {
            *counts.entry(mix.next(&mut rng)).or_insert(0u64) += 1;
        }
        for (op, perc) in [
            (Op::Scan, 5),
            (Op::Read, 50),
            (Op::Update, 20),
            (Op::ReadModifyWrite, 10),
            (Op::Insert, 10),
            (Op::Generic, 5),
        ] {
            let got = counts[&op] as f64 * 100.0 / n as f64;
            assert!((got - perc as f64).abs() < 0.5, "{op}: {got}");
        }
    }

    #[test]
    fn mix_rejects_bad_sum() {
        assert_eq!(
            Mix::new(&[(Op::Read, 60), (Op::Update, 30)]).unwrap_err(),
            ConfigError::MixNotHundred(90)
        );
        assert_eq!(
            Mix::new(&[(Op::Read, 100), (Op::Scan, 1)]).unwrap_err(),
            ConfigError::MixNotHundred(101)
        );
    }

    #[test]
    fn key_type_parse() {
        assert_eq!("fkvb".parse::<KeyType>(), Ok(KeyType::Fkvb));
        assert_eq!("sharded_random".parse::<KeyType>(), Ok(KeyType::ShardedRandom));
        assert_eq!(
            "shuffled".parse::<KeyType>(),
            Err(ConfigError::UnknownKeyType("shuffled".to_string()))
        );
    }

    #[test]
    fn digits_of() {
        assert_eq!(digits(0), 1);
        assert_eq!(digits(9), 1);
        assert_eq!(digits(10), 2);
        assert_eq!(digits(1000), 4);
        assert_eq!(digits(u64::MAX), 20);
    }

    #[test]
    fn fkvb_layout() {
        let mut kb = KeyBuilder::new(KeyType::Fkvb, 16, 1000, [0; SHARD_SIZE]).unwrap();
        let mut key = Vec::new();
        kb.build(42, &mut key).unwrap();
        assert_eq!(key, b"U: 0000000000042");
        kb.build(0, &mut key).unwrap();
        assert_eq!(key, b"U: 0000000000000");
    }

    #[test]
    fn fkvb_round_trip() {
        let num_keys = 5000;
        let mut kb = KeyBuilder::new(KeyType::Fkvb, 8, num_keys, [0; SHARD_SIZE]).unwrap();
        let mut key = Vec::new();
        for i in 0..num_keys {
            kb.build(i, &mut key).unwrap();
            assert_eq!(key.len(), 8);
            assert_eq!(kb.decode(&key), Some(i));
        }
    }

    #[test]
    fn sharded_fkvb_round_trip() {
        let shard = shard_prefix(7, 3);
        let num_keys = 1000;
        let mut kb = KeyBuilder::new(KeyType::ShardedFkvb, 12, num_keys, shard).unwrap();
        let mut key = Vec::new();
        for i in 0..num_keys {
            kb.build(i, &mut key).unwrap();
            assert_eq!(&key[..SHARD_SIZE], &shard);
            assert_eq!(kb.decode(&key), Some(i));
        }
    }

    #[test]
    fn fkvb_order_follows_index() {
        let mut kb = KeyBuilder::new(KeyType::Fkvb, 10, 1000, [0; SHARD_SIZE]).unwrap();
        let (mut a, mut b) = (Vec::new(), Vec::new());
        kb.build(9, &mut a).unwrap();
        kb.build(10, &mut b).unwrap();
        assert!(a < b);
    }

    #[test]
    fn key_too_narrow() {
        assert_eq!(
            KeyBuilder::new(KeyType::Fkvb, 6, 1000, [0; SHARD_SIZE]).unwrap_err(),
            ConfigError::KeyTooNarrow {
                num_keys: 1000,
                key_size: 6,
                prefix_len: 3
            }
        );
        assert!(KeyBuilder::new(KeyType::Fkvb, 7, 1000, [0; SHARD_SIZE]).is_ok());
        assert!(KeyBuilder::new(KeyType::ShardedFkvb, 8, 10, [0; SHARD_SIZE]).is_err());
        assert!(KeyBuilder::new(KeyType::Random, 3, 10, [0; SHARD_SIZE]).is_err());
        let mut kb = KeyBuilder::new(KeyType::Fkvb, 7, 1000, [0; SHARD_SIZE]).unwrap();
        let mut key = Vec::new();
        assert!(kb.build(10000, &mut key).is_err());
    }

    #[test]
    fn random_keys_are_reproducible() {
        let mut kb = KeyBuilder::new(KeyType::Random, 16, 1000, [0; SHARD_SIZE]).unwrap();
        let (mut a, mut b, mut c) = (Vec::new(), Vec::new(), Vec::new());
        kb.build(7, &mut a).unwrap();
        kb.build(8, &mut b).unwrap();
        kb.build(7, &mut c).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.iter().all(|c| (b'0'..b'0' + 62).contains(c)));
        assert_eq!(kb.decode(&a), None);
    }

    #[test]
    fn sharded_random_keys() {
        let shard = shard_prefix(11, 0);
        let mut kb = KeyBuilder::new(KeyType::ShardedRandom, 24, 1000, shard).unwrap();
        let (mut a, mut b) = (Vec::new(), Vec::new());
        kb.build(5, &mut a).unwrap();
        kb.build(5, &mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);
        assert_eq!(&a[..SHARD_SIZE], &shard);
        assert!(a[SHARD_SIZE..].iter().all(|c| *c < 250));
    }

    #[test]
    fn shard_prefixes() {
        for tid in 0..200 {
            let shard = shard_prefix(99, tid);
            assert_ne!(shard[0], 0xFF);
            assert_eq!(shard, shard_prefix(99, tid));
        }
        assert_ne!(shard_prefix(99, 0), shard_prefix(99, 1));
    }

    #[test]
    fn values_slice_the_pool() {
        let mut vb = ValueBuilder::new(Distribution::constant(1000), 3).unwrap();
        let first = vb.next().to_vec();
        assert_eq!(first.len(), 1000);
        assert!(first.iter().all(|b| (65..127).contains(b)));
        assert_eq!(vb.cursor(), 1000);
        // the pool is exhausted after this many values, and the cursor starts over
        let fits = VALUE_POOL_SIZE / 1000;
        for _ in 1..fits {
            vb.next();
        }
        assert_eq!(vb.cursor(), fits * 1000);
        let again = vb.next().to_vec();
        assert_eq!(again, first);
        assert_eq!(vb.cursor(), 1000);
    }

    #[test]
    fn values_follow_size_distribution() {
        let sizes = Distribution::uniform(8, 16, 5).unwrap();
        let mut vb = ValueBuilder::new(sizes, 3).unwrap();
        for _ in 0..1000 {
            let len = vb.next().len();
            assert!((8..16).contains(&len));
        }
    }

    #[test]
    fn values_must_fit_the_pool() {
        assert_eq!(
            ValueBuilder::new(Distribution::constant(VALUE_POOL_SIZE as u64 + 1), 0).unwrap_err(),
            ConfigError::ValueTooLarge {
                size: VALUE_POOL_SIZE as u64 + 1,
                pool: VALUE_POOL_SIZE
            }
        );
    }
}
