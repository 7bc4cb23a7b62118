//! Integer generators for key indices, scan lengths and value sizes.
//!
//! ## Configuration Format
//!
//! A distribution is written as a short string in the benchmark configuration:
//!
//! - `uniform`: uniform over the whole key space `[0, num_keys)`.
//! - `uniform_<lo>_<hi>`: uniform over `[lo, hi)`.
//! - `zipf_<hot>_<access>`: zipfian over the key space, with the skew calibrated so that `hot`
//!   percent of the keys receive `access` percent of the draws.
//! - `const_<n>`: always `n`.
//!
//! The underscore right after the keyword is optional, so `const8` and `uniform8_16` are accepted
//! as well.
//!
//! Every generator owns its random state, seeded explicitly, so a worker replays the same sequence
//! for the same seed.

use crate::error::{CalibrationError, ConfigError};
use hashbrown::HashMap;
use log::{debug, info};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

// {{{ spec

/// A parsed distribution string, not yet bound to a domain or a seed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistributionSpec {
    /// Uniform over `[0, domain)`.
    Uniform,
    /// Uniform over `[lo, hi)`.
    UniformRange { lo: u64, hi: u64 },
    /// Zipfian over `[0, domain)`, `hot_pct` percent of the domain receiving `access_pct` percent
    /// of the draws.
    Zipf { hot_pct: u32, access_pct: u32 },
    Constant(u64),
}

fn parse_pair(s: &str) -> Option<(u64, u64)> {
    let (a, b) = s.split_once('_')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(keyword)?;
    Some(rest.strip_prefix('_').unwrap_or(rest))
}

impl FromStr for DistributionSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ConfigError::MalformedDistribution(s.to_string());
        if s == "uniform" {
            return Ok(Self::Uniform);
        }
        if let Some(rest) = strip_keyword(s, "uniform") {
            let (lo, hi) = parse_pair(rest).ok_or_else(malformed)?;
            if lo >= hi {
                return Err(ConfigError::EmptyRange(s.to_string()));
            }
            return Ok(Self::UniformRange { lo, hi });
        }
        if let Some(rest) = strip_keyword(s, "zipf") {
            let (hot, access) = parse_pair(rest).ok_or_else(malformed)?;
            let (hot_pct, access_pct) = match (u32::try_from(hot), u32::try_from(access)) {
                (Ok(h), Ok(a)) => (h, a),
                _ => return Err(malformed()),
            };
            check_target(access_pct, hot_pct)?;
            return Ok(Self::Zipf {
                hot_pct,
                access_pct,
            });
        }
        if let Some(rest) = strip_keyword(s, "const") {
            let n = rest.parse().map_err(|_| malformed())?;
            return Ok(Self::Constant(n));
        }
        Err(malformed())
    }
}

impl DistributionSpec {
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    /// The exclusive upper bound of the values this distribution can produce over `domain`.
    pub fn upper_bound(&self, domain: u64) -> u64 {
        match self {
            Self::Uniform | Self::Zipf { .. } => domain,
            Self::UniformRange { hi, .. } => *hi,
            Self::Constant(n) => n + 1,
        }
    }

    /// Bind the distribution to `domain` and a seed. Zipfian skews are looked up in (or added to)
    /// `skews`.
    pub fn build(
        &self,
        domain: u64,
        seed: u64,
        skews: &SkewCache,
    ) -> Result<Distribution, ConfigError> {
        let dist = match *self {
            Self::Uniform => Distribution::uniform(0, domain, seed)?,
            Self::UniformRange { lo, hi } => Distribution::uniform(lo, hi, seed)?,
            Self::Zipf {
                hot_pct,
                access_pct,
            } => {
                let skew = skews.get_or_calibrate(access_pct, hot_pct, domain)?;
                Distribution::zipfian(domain, skew, seed)?
            }
            Self::Constant(n) => Distribution::constant(n),
        };
        Ok(dist)
    }
}

// }}} spec

// {{{ distribution

/// A seeded integer generator. Every draw lies in `[lower, upper)`, except for `Constant`, which
/// always returns its value.
#[derive(Debug, Clone)]
pub enum Distribution {
    Sequential { lower: u64, upper: u64, pos: u64 },
    Uniform { lower: u64, upper: u64, rng: StdRng },
    Zipfian { zipf: Zipfian, rng: StdRng },
    Constant(u64),
}

impl Distribution {
    /// Visits `lower, lower + 1, ..., upper - 1` and wraps around.
    pub fn sequential(lower: u64, upper: u64) -> Result<Self, ConfigError> {
        if lower >= upper {
            return Err(ConfigError::EmptyRange(format!("sequential [{lower}, {upper})")));
        }
        Ok(Self::Sequential {
            lower,
            upper,
            pos: lower,
        })
    }

    pub fn uniform(lower: u64, upper: u64, seed: u64) -> Result<Self, ConfigError> {
        if lower >= upper {
            return Err(ConfigError::EmptyRange(format!("uniform [{lower}, {upper})")));
        }
        Ok(Self::Uniform {
            lower,
            upper,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn zipfian(n: u64, skew: f64, seed: u64) -> Result<Self, ConfigError> {
        if n == 0 {
            return Err(ConfigError::EmptyRange("zipfian over 0 keys".to_string()));
        }
        Ok(Self::Zipfian {
            zipf: Zipfian::new(n, skew)?,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn constant(value: u64) -> Self {
        Self::Constant(value)
    }

    pub fn next(&mut self) -> u64 {
        match self {
            Self::Sequential { lower, upper, pos } => {
                let v = *pos;
                *pos += 1;
                if *pos >= *upper {
                    *pos = *lower;
                }
                v
            }
            Self::Uniform { lower, upper, rng } => rng.random_range(*lower..*upper),
            Self::Zipfian { zipf, rng } => zipf.sample(rng.random::<f64>()),
            Self::Constant(v) => *v,
        }
    }

    pub fn lower(&self) -> u64 {
        match self {
            Self::Sequential { lower, .. } | Self::Uniform { lower, .. } => *lower,
            Self::Zipfian { .. } => 0,
            Self::Constant(v) => *v,
        }
    }

    /// Exclusive upper bound of the draws.
    pub fn upper(&self) -> u64 {
        match self {
            Self::Sequential { upper, .. } | Self::Uniform { upper, .. } => *upper,
            Self::Zipfian { zipf, .. } => zipf.n,
            Self::Constant(v) => v + 1,
        }
    }
}

// }}} distribution

// {{{ zipfian

/// Inverse-CDF zipfian transform over `[0, n)`.
///
/// The exponent is corrected by a factor that shrinks with the size of the key space, and uniform
/// draws are mapped into `[cutoff, 1)` so the transform never lands past the last key.
#[derive(Debug, Clone, PartialEq)]
pub struct Zipfian {
    n: u64,
    skew: f64,
    mk_inv: f64,
    cutoff: f64,
}

impl Zipfian {
    pub fn new(n: u64, skew: f64) -> Result<Self, CalibrationError> {
        let nf = n as f64;
        let expo = (nf.log10() - 1.0).max(0.0);
        let dtmp = (1.0 + 0.16 / 2f64.powf(expo)) * skew - 1.0;
        if dtmp.abs() < 1e-12 || !dtmp.is_finite() {
            return Err(CalibrationError::DegenerateSkew(skew));
        }
        Ok(Self {
            n,
            skew,
            mk_inv: -1.0 / dtmp,
            cutoff: nf.powf(-dtmp),
        })
    }

    pub fn skew(&self) -> f64 {
        self.skew
    }

    /// Map a uniform draw `u01` in `[0, 1)` to a key index.
    pub fn sample(&self, u01: f64) -> u64 {
        let u = u01 * (1.0 - self.cutoff) + self.cutoff;
        let z = (u.powf(self.mk_inv) as u64).saturating_sub(1);
        z.min(self.n - 1)
    }
}

// }}} zipfian

// {{{ calibration

/// Number of draws simulated per calibration step.
pub const CALIBRATION_DRAWS: usize = 1_000_000;

/// Upper bound on the number of skew adjustments.
pub const CALIBRATION_MAX_ITERATIONS: usize = 1000;

/// Number of times the measurement may jump across the target before giving up.
const CALIBRATION_MAX_CROSSINGS: usize = 16;

const CALIBRATION_SEED: u64 = 0x5EED_2F1F;

const CALIBRATION_STEP: f64 = 0.01;

fn check_target(access_pct: u32, hot_pct: u32) -> Result<(), CalibrationError> {
    if hot_pct == 0 || hot_pct >= 100 || access_pct == 0 || access_pct >= 100 {
        return Err(CalibrationError::InvalidTarget {
            access_pct,
            hot_pct,
        });
    }
    Ok(())
}

/// Percentage of `draws` samples that fall into the first `hot_pct` percent of the key space.
pub fn hot_access_pct(zipf: &Zipfian, hot_pct: u32, draws: usize, seed: u64) -> f64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let limit = zipf.n as f64 * hot_pct as f64 / 100.0;
    let hits = (0..draws)
        .filter(|_| (zipf.sample(rng.random::<f64>()) as f64) < limit)
        .count();
    hits as f64 * 100.0 / draws as f64
}

/// Search the skew for which `hot_pct` percent of `n` keys receive `access_pct` percent of the
/// accesses, moving the skew by 0.01 per step.
pub fn compute_skew(access_pct: u32, hot_pct: u32, n: u64) -> Result<f64, CalibrationError> {
    check_target(access_pct, hot_pct)?;
    let mut skew = 1.0f64;
    let mut crossings = 0;
    let mut last_below: Option<bool> = None;
    for i in 0..CALIBRATION_MAX_ITERATIONS {
        let zipf = Zipfian::new(n, skew)?;
        let measured = hot_access_pct(&zipf, hot_pct, CALIBRATION_DRAWS, CALIBRATION_SEED) as u32;
        debug!(
            "calibration step {}: skew {:.2} gives {}% of accesses to {}% of keys",
            i, skew, measured, hot_pct
        );
        if measured == access_pct {
            return Ok(skew);
        }
        let below = measured < access_pct;
        if last_below.is_some_and(|b| b != below) {
            crossings += 1;
            if crossings > CALIBRATION_MAX_CROSSINGS {
                break;
            }
        }
        last_below = Some(below);
        // more skew concentrates more accesses on the hot set
        skew += if below {
            CALIBRATION_STEP
        } else {
            -CALIBRATION_STEP
        };
    }
    Err(CalibrationError::NotConverged {
        access_pct,
        hot_pct,
        num_keys: n,
        iterations: CALIBRATION_MAX_ITERATIONS,
        skew,
    })
}

/// Calibrated skews, keyed by `(access_pct, hot_pct, n)`.
///
/// One cache is shared by all workers of a benchmark so each distinct target is only calibrated
/// once.
#[derive(Debug, Default)]
pub struct SkewCache(Mutex<HashMap<(u32, u32, u64), f64>>);

impl SkewCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_calibrate(
        &self,
        access_pct: u32,
        hot_pct: u32,
        n: u64,
    ) -> Result<f64, CalibrationError> {
        let mut cache = self.0.lock();
        if let Some(skew) = cache.get(&(access_pct, hot_pct, n)) {
            return Ok(*skew);
        }
        let skew = compute_skew(access_pct, hot_pct, n)?;
        info!(
            "Calibrated zipfian skew {:.2}: {}% of {} keys receive {}% of accesses",
            skew, hot_pct, n, access_pct
        );
        cache.insert((access_pct, hot_pct, n), skew);
        Ok(skew)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

// }}} calibration
