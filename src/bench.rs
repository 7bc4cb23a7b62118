//! The core benchmark functionality.
//!
//! A benchmark runs in two phases. In the **load** phase, population workers write every key of
//! the key space once, each worker owning a disjoint slice of it. In the **run** phase, traffic
//! workers issue the configured operation mix until their budget is used up. Between the phases,
//! the harness either sleeps for a grace period or waits on a barrier file, so that several client
//! processes can start their traffic at the same time.
//!
//! ## Configuration Format
//!
//! A benchmark configuration file is formatted in TOML. It consists of a `[store]` table that
//! selects and configures the store (see [`mod@crate::stores`]) and a `[benchmark]` table:
//!
//! ```toml
//! [store]
//! name = "btreemap"
//!
//! [benchmark]
//! read_perc = 50
//! update_perc = 50
//! num_keys = 100000
//! key_size = 16
//! key_dist = "zipf_10_90"
//! value_size = "const64"
//! duration = "sec30"
//! threads = 4
//! population_threads = 4
//! ```
//!
//! Available options and their defaults can be found in [`BenchmarkOpt`]. Every option can be
//! overridden by an environment variable without changing the TOML file: for example,
//! `ORDBENCH_BENCHMARK__SEED=7` sets `seed` in `[benchmark]`.
//!
//! ## Reproducibility
//!
//! All random streams (key indices, operation mix, scan lengths, values, shard prefixes) are
//! derived from `seed`. Two runs with the same configuration and seed issue the same sequence of
//! operations on every worker, regardless of thread scheduling.
//!
//! ## Output Format
//!
//! Per-epoch results are written to `<output>.loadxput` and `<output>.runxput`, see
//! [`mod@crate::stats`]. After each phase, a summary line is printed to stdout:
//!
//! ```txt
//! phase run finish . duration 30.00 total 1000000 mops 0.03 min_us 0.05 max_us 100.00 avg_us 50.00 p50_us 50.00 p95_us 95.00 p99_us 99.00 p999_us 100.00
//! ```

use crate::batch::{GenericBatch, KVBatch, ReadSlots};
use crate::distribution::{Distribution, DistributionSpec, SkewCache};
use crate::error::{ConfigError, Error, Result, StoreError};
use crate::stats::{Breakdown, EpochSample, OpKind, Stats, Summary};
use crate::stores::{BenchKVStore, BenchKVStoreOpt};
use crate::thread::JoinHandle;
use crate::workload::{shard_prefix, KeyBuilder, KeyType, Mix, Op, ValueBuilder, VALUE_POOL_SIZE};
use crate::{KVStore, KVStoreHandle};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use quanta::Clock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// {{{ benchmark

/// Length determines when a traffic worker should stop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Length {
    /// `ops<N>`: each worker executes `N` operations.
    Count(u64),
    /// `sec<N>`: each worker runs for `N` seconds.
    Timeout(Duration),
}

impl FromStr for Length {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = || ConfigError::MalformedDuration(s.to_string());
        let (count, n) = if let Some(n) = s.strip_prefix("ops") {
            (true, n)
        } else if let Some(n) = s.strip_prefix("sec") {
            (false, n)
        } else {
            return Err(malformed());
        };
        let n: u64 = n.parse().map_err(|_| malformed())?;
        if n == 0 {
            return Err(ConfigError::NotPositive("duration"));
        }
        Ok(if count {
            Length::Count(n)
        } else {
            Length::Timeout(Duration::from_secs(n))
        })
    }
}

/// The `[benchmark]` table, deserialized from TOML. Every field has a default.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BenchmarkOpt {
    /// Percentages of the operation mix. They must add up to 100.
    ///
    /// Default: 100% reads.
    pub read_perc: u8,
    pub update_perc: u8,
    pub insert_perc: u8,
    pub scan_perc: u8,
    pub rmw_perc: u8,
    pub generic_perc: u8,

    /// Sub-operations per generic transaction.
    ///
    /// Default: 10.
    pub generic_ops: usize,

    /// Percentage of reads among the sub-operations of a generic transaction, the rest are
    /// updates.
    ///
    /// Default: 0.
    pub generic_rp: u8,

    /// Size of the key space.
    ///
    /// Default: 10000.
    pub num_keys: u64,

    /// Size of every key in bytes.
    ///
    /// Default: 16.
    pub key_size: usize,

    /// Key layout: `fkvb`, `random`, `sharded_fkvb` or `sharded_random`.
    ///
    /// Default: "fkvb".
    pub key_type: String,

    /// Distribution of the key indices accessed by traffic workers.
    ///
    /// Default: "uniform".
    pub key_dist: String,

    /// Distribution of value sizes. Must be constant when `generic_perc` is positive.
    ///
    /// Default: "const8".
    pub value_size: String,

    /// Distribution of the number of keys covered by a scan.
    ///
    /// Default: "const10".
    pub scan_len: String,

    /// `ops<N>` or `sec<N>`, per traffic worker.
    ///
    /// Default: "sec60".
    pub duration: String,

    /// Number of traffic workers.
    ///
    /// Default: 1.
    pub threads: usize,

    /// Number of population workers. Zero skips the load phase.
    ///
    /// Default: 1.
    pub population_threads: usize,

    /// Keys written per bulk call during population. 1 writes keys one by one.
    ///
    /// Default: 20.
    pub bulk: usize,

    /// Root seed. Drawn at random and logged if absent.
    pub seed: Option<u64>,

    /// Index of this client process among `num_instances` processes sharing the key space.
    ///
    /// Default: 0 of 1.
    pub instance_id: usize,
    pub num_instances: usize,

    /// If set, the file is created after population and the run phase starts once it is removed.
    pub load_barrier: Option<PathBuf>,

    /// Sleep between the phases when there is no barrier, in milliseconds.
    ///
    /// Default: 5000.
    pub grace_ms: u64,

    /// Sleep of every traffic worker before its statistics are reset, in milliseconds.
    ///
    /// Default: 0.
    pub warmup_ms: u64,

    /// Sleep after every operation of a time-bounded run, in microseconds.
    ///
    /// Default: 0.
    pub sleep_us: u64,

    /// Attempts of a failing write before the run is declared failed.
    ///
    /// Default: 18.
    pub retry_attempts: u32,

    /// First sleep between write attempts, doubled after every attempt, in microseconds.
    ///
    /// Default: 1000.
    pub retry_backoff_us: u64,

    /// Prefix of the result files. Nothing is written if absent.
    pub output: Option<PathBuf>,

    /// Pin every worker to a core.
    ///
    /// Default: false.
    pub pin: bool,
}

impl Default for BenchmarkOpt {
    fn default() -> Self {
        Self {
            read_perc: 100,
            update_perc: 0,
            insert_perc: 0,
            scan_perc: 0,
            rmw_perc: 0,
            generic_perc: 0,
            generic_ops: 10,
            generic_rp: 0,
            num_keys: 10000,
            key_size: 16,
            key_type: "fkvb".to_string(),
            key_dist: "uniform".to_string(),
            value_size: "const8".to_string(),
            scan_len: "const10".to_string(),
            duration: "sec60".to_string(),
            threads: 1,
            population_threads: 1,
            bulk: 20,
            seed: None,
            instance_id: 0,
            num_instances: 1,
            load_barrier: None,
            grace_ms: 5000,
            warmup_ms: 0,
            sleep_us: 0,
            retry_attempts: 18,
            retry_backoff_us: 1000,
            output: None,
            pin: false,
        }
    }
}

/// A validated benchmark, ready to run.
#[derive(Debug, Clone)]
pub struct Benchmark {
    mix: Mix,
    generic_mix: Option<Mix>,
    generic_ops: usize,
    scan: bool,
    num_keys: u64,
    key_size: usize,
    key_type: KeyType,
    key_dist: DistributionSpec,
    value_size: DistributionSpec,
    max_value_size: usize,
    scan_len: DistributionSpec,
    len: Length,
    threads: usize,
    population_threads: usize,
    bulk: usize,
    seed: u64,
    instance_id: usize,
    num_instances: usize,
    load_barrier: Option<PathBuf>,
    grace: Duration,
    warmup: Duration,
    sleep: Duration,
    backoff: Backoff,
    output: Option<PathBuf>,
    pin: bool,
}

impl Benchmark {
    pub fn new(opt: &BenchmarkOpt) -> std::result::Result<Self, ConfigError> {
        let mix = Mix::new(&[
            (Op::Read, opt.read_perc),
            (Op::Update, opt.update_perc),
            (Op::Insert, opt.insert_perc),
            (Op::Scan, opt.scan_perc),
            (Op::ReadModifyWrite, opt.rmw_perc),
            (Op::Generic, opt.generic_perc),
        ])?;
        if opt.num_keys == 0 {
            return Err(ConfigError::NotPositive("num_keys"));
        }
        if opt.threads == 0 && opt.population_threads == 0 {
            return Err(ConfigError::NotPositive("threads"));
        }
        if opt.bulk == 0 {
            return Err(ConfigError::NotPositive("bulk"));
        }
        if opt.retry_attempts == 0 {
            return Err(ConfigError::NotPositive("retry_attempts"));
        }
        if opt.num_instances == 0 {
            return Err(ConfigError::NotPositive("num_instances"));
        }
        if opt.instance_id >= opt.num_instances {
            return Err(ConfigError::OutOfRange {
                name: "instance_id",
                value: opt.instance_id as u64,
                max: opt.num_instances as u64 - 1,
            });
        }

        let key_type: KeyType = opt.key_type.parse()?;
        KeyBuilder::new(key_type, opt.key_size, opt.num_keys, [0; 8])?;
        let key_dist: DistributionSpec = opt.key_dist.parse()?;
        if key_dist.upper_bound(opt.num_keys) > opt.num_keys {
            return Err(ConfigError::OutOfRange {
                name: "key_dist",
                value: key_dist.upper_bound(opt.num_keys) - 1,
                max: opt.num_keys - 1,
            });
        }
        let value_size: DistributionSpec = opt.value_size.parse()?;
        let max_value_size = value_size.upper_bound(opt.num_keys).saturating_sub(1);
        if max_value_size > VALUE_POOL_SIZE as u64 {
            return Err(ConfigError::ValueTooLarge {
                size: max_value_size,
                pool: VALUE_POOL_SIZE,
            });
        }
        let scan_len: DistributionSpec = opt.scan_len.parse()?;

        let generic_mix = if opt.generic_perc > 0 {
            if !value_size.is_constant() {
                return Err(ConfigError::GenericNeedsConstantValue(opt.value_size.clone()));
            }
            if opt.generic_ops == 0 {
                return Err(ConfigError::NotPositive("generic_ops"));
            }
            if opt.generic_rp > 100 {
                return Err(ConfigError::OutOfRange {
                    name: "generic_rp",
                    value: opt.generic_rp as u64,
                    max: 100,
                });
            }
            Some(Mix::new(&[
                (Op::Read, opt.generic_rp),
                (Op::Update, 100 - opt.generic_rp),
            ])?)
        } else {
            None
        };

        let len: Length = opt.duration.parse()?;
        let seed = opt.seed.unwrap_or_else(rand::random);

        Ok(Self {
            mix,
            generic_mix,
            generic_ops: opt.generic_ops,
            scan: opt.scan_perc > 0,
            num_keys: opt.num_keys,
            key_size: opt.key_size,
            key_type,
            key_dist,
            value_size,
            max_value_size: max_value_size as usize,
            scan_len,
            len,
            threads: opt.threads,
            population_threads: opt.population_threads,
            bulk: opt.bulk,
            seed,
            instance_id: opt.instance_id,
            num_instances: opt.num_instances,
            load_barrier: opt.load_barrier.clone(),
            grace: Duration::from_millis(opt.grace_ms),
            warmup: Duration::from_millis(opt.warmup_ms),
            sleep: Duration::from_micros(opt.sleep_us),
            backoff: Backoff::new(
                opt.retry_attempts,
                Duration::from_micros(opt.retry_backoff_us),
            ),
            output: opt.output.clone(),
            pin: opt.pin,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn len(&self) -> Length {
        self.len
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn population_threads(&self) -> usize {
        self.population_threads
    }

    pub fn load_barrier(&self) -> Option<&Path> {
        self.load_barrier.as_deref()
    }

    /// The sub-range of key indices written by population worker `id`.
    pub fn population_range(&self, id: usize) -> Range<u64> {
        if self.key_type.is_sharded() {
            return 0..self.num_keys;
        }
        population_range(
            self.num_keys,
            self.instance_id,
            self.num_instances,
            id,
            self.population_threads,
        )
    }
}

/// Split `[0, num_keys)` evenly across instances, then the share of `instance` evenly across
/// `workers`. The last instance and the last worker take the remainders.
pub fn population_range(
    num_keys: u64,
    instance: usize,
    instances: usize,
    worker: usize,
    workers: usize,
) -> Range<u64> {
    let split = |range: Range<u64>, i: usize, n: usize| {
        let per = (range.end - range.start) / n as u64;
        let start = range.start + per * i as u64;
        let end = if i + 1 == n { range.end } else { start + per };
        start..end
    };
    split(split(0..num_keys, instance, instances), worker, workers)
}

#[derive(Deserialize, Debug)]
struct BenchOpt {
    store: BenchKVStoreOpt,
    #[serde(default)]
    benchmark: BenchmarkOpt,
}

/// Parse a configuration document, apply environment overrides, validate the benchmark and create
/// the store.
pub fn init(text: &str) -> Result<(BenchKVStore, Benchmark)> {
    let opt: BenchOpt = Figment::new()
        .merge(Toml::string(text))
        .merge(Env::prefixed("ORDBENCH_").split("__"))
        .extract()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    debug!("Creating benchmark with the following configurations: {:?}", opt);
    let benchmark = Benchmark::new(&opt.benchmark)?;
    let store = BenchKVStore::new(&opt.store)?;
    Ok((store, benchmark))
}

// }}} benchmark

// {{{ control

/// Shared cancellation handle of a benchmark.
///
/// Workers poll it once per operation. The process layer (signal handlers, an operator) uses it to
/// stop a run or to release the barrier between the phases.
#[derive(Debug, Default)]
pub struct Control {
    failed: AtomicBool,
    stopped: AtomicBool,
    released: Mutex<bool>,
    gate: Condvar,
}

impl Control {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the run as failed. All workers stop after their current operation.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Relaxed);
        self.wake();
    }

    /// Stop all workers after their current operation, without failing the run.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.wake();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn should_stop(&self) -> bool {
        self.is_failed() || self.stopped.load(Ordering::Relaxed)
    }

    pub fn release_barrier(&self) {
        *self.released.lock() = true;
        self.gate.notify_all();
    }

    fn wake(&self) {
        let _guard = self.released.lock();
        self.gate.notify_all();
    }

    /// Wait up to `timeout` for the barrier to be released. Returns `true` once the barrier is
    /// released or the run is stopping.
    pub fn wait_barrier_for(&self, timeout: Duration) -> bool {
        let mut released = self.released.lock();
        if !*released && !self.should_stop() {
            self.gate.wait_for(&mut released, timeout);
        }
        *released || self.should_stop()
    }
}

// }}} control

// {{{ backoff

/// Bounded exponential backoff for store writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    attempts: u32,
    initial: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, initial: Duration) -> Self {
        Self { attempts, initial }
    }

    /// Call `op` until it succeeds, at most `attempts` times. `sleep` is called between attempts
    /// with a delay that starts at `initial` and doubles every time. The last error is returned
    /// once all attempts fail.
    pub fn retry<T>(
        &self,
        mut op: impl FnMut() -> std::result::Result<T, StoreError>,
        mut sleep: impl FnMut(Duration),
    ) -> std::result::Result<T, StoreError> {
        let mut delay = self.initial;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "Attempt {}/{} failed, retrying in {:?}: {}",
                        attempt, self.attempts, delay, e
                    );
                    sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// }}} backoff

// {{{ workers

/// Range of the per-worker seeds drawn from the root seed.
const WORKER_SEED_RANGE: u64 = 1_000_000_000;

/// Range of the per-stream seeds drawn from a worker seed.
const STREAM_SEED_RANGE: u64 = 123_321_456_654_789_987;

/// Traffic worker 0 calls [`KVStore::print_stats`] this often, in seconds.
const PRINT_STATS_SECS: u64 = 60;

/// One seed per traffic worker, then one per population worker.
fn worker_seeds(seed: u64, traffic: usize, population: usize) -> (Vec<u64>, Vec<u64>) {
    let mut root = StdRng::seed_from_u64(seed);
    let traffic = (0..traffic)
        .map(|_| root.random_range(0..WORKER_SEED_RANGE))
        .collect();
    let population = (0..population)
        .map(|_| root.random_range(0..WORKER_SEED_RANGE))
        .collect();
    (traffic, population)
}

fn build_key(
    builder: &mut KeyBuilder,
    index: u64,
    out: &mut Vec<u8>,
) -> std::result::Result<(), StoreError> {
    builder
        .build(index, out)
        .map_err(|e| StoreError::Failed(e.to_string()))
}

trait PhaseWorker: Send + 'static {
    fn run(&mut self, store: &dyn KVStore, handle: &mut dyn KVStoreHandle, control: &Control);

    fn stats(&self) -> &Stats;
}

/// Scratch state of generic transactions.
struct GenericState {
    mix: Mix,
    rng: StdRng,
    batch: GenericBatch,
    slots: ReadSlots,
}

struct TrafficWorker {
    id: usize,
    len: Length,
    num_keys: u64,
    mix: Mix,
    mix_rng: StdRng,
    keys: Distribution,
    key_builder: KeyBuilder,
    values: ValueBuilder,
    scan_len: Option<Distribution>,
    generic: Option<GenericState>,
    backoff: Backoff,
    warmup: Duration,
    sleep: Duration,
    key: Vec<u8>,
    end_key: Vec<u8>,
    buf: Vec<u8>,
    stats: Stats,
}

impl TrafficWorker {
    fn new(
        b: &Benchmark,
        id: usize,
        seed: u64,
        skews: &SkewCache,
        clock: Clock,
    ) -> std::result::Result<Self, ConfigError> {
        let mut streams = StdRng::seed_from_u64(seed);
        for _ in 0..((1 + b.instance_id) * b.threads + id) {
            let _ = streams.random_range(0..STREAM_SEED_RANGE);
        }
        let key_seed = streams.random_range(0..STREAM_SEED_RANGE).wrapping_add(seed);
        let mix_seed = streams.random_range(0..STREAM_SEED_RANGE);
        let scan_len = if b.scan {
            let scan_seed = streams.random_range(0..STREAM_SEED_RANGE);
            Some(b.scan_len.build(b.num_keys, scan_seed, skews)?)
        } else {
            None
        };
        let generic = match &b.generic_mix {
            Some(mix) => Some(GenericState {
                mix: mix.clone(),
                rng: StdRng::seed_from_u64(streams.random_range(0..STREAM_SEED_RANGE)),
                batch: GenericBatch::new(b.generic_ops, b.key_size, b.max_value_size),
                slots: ReadSlots::new(b.generic_ops, b.max_value_size),
            }),
            None => None,
        };

        let tid = b.instance_id * b.threads + id;
        let shard = shard_prefix(b.seed, tid as u64);
        if b.key_type.is_sharded() {
            info!("Traffic worker {} uses shard prefix {:02x?}", id, shard);
        }
        Ok(Self {
            id,
            len: b.len,
            num_keys: b.num_keys,
            mix: b.mix.clone(),
            mix_rng: StdRng::seed_from_u64(mix_seed),
            keys: b.key_dist.build(b.num_keys, key_seed, skews)?,
            key_builder: KeyBuilder::new(b.key_type, b.key_size, b.num_keys, shard)?,
            values: ValueBuilder::new(b.value_size.build(b.num_keys, seed, skews)?, seed)?,
            scan_len,
            generic,
            backoff: b.backoff,
            warmup: b.warmup,
            sleep: b.sleep,
            key: Vec::with_capacity(b.key_size),
            end_key: Vec::with_capacity(b.key_size),
            buf: vec![0u8; b.max_value_size.max(1)],
            stats: Stats::new(id, clock, seed),
        })
    }

    fn execute(
        &mut self,
        op: Op,
        handle: &mut dyn KVStoreHandle,
    ) -> std::result::Result<(), StoreError> {
        let Self {
            keys,
            key_builder,
            values,
            key,
            end_key,
            buf,
            backoff,
            scan_len,
            generic,
            num_keys,
            ..
        } = self;
        match op {
            Op::Read => {
                build_key(key_builder, keys.next(), key)?;
                handle.get(key, buf)?;
            }
            Op::Update | Op::Insert => {
                build_key(key_builder, keys.next(), key)?;
                let value = values.next();
                backoff.retry(|| handle.put(key, value), std::thread::sleep)?;
            }
            Op::ReadModifyWrite => {
                build_key(key_builder, keys.next(), key)?;
                match handle.get(key, buf)? {
                    Some(len) => handle.put(key, &buf[..len.min(buf.len())])?,
                    None => handle.put(key, values.next())?,
                }
            }
            Op::Scan => {
                let start = keys.next();
                let len = scan_len.as_mut().map_or(0, |d| d.next());
                let end = start.saturating_add(len).min(*num_keys);
                build_key(key_builder, start, key)?;
                build_key(key_builder, end, end_key)?;
                let (lo, hi) = if key > end_key {
                    (&end_key[..], &key[..])
                } else {
                    (&key[..], &end_key[..])
                };
                handle.get_range(lo, hi)?;
            }
            Op::Generic => {
                let g = generic
                    .as_mut()
                    .ok_or(StoreError::Unsupported("generic transactions not configured"))?;
                g.batch.clear();
                for _ in 0..g.batch.arity() {
                    build_key(key_builder, keys.next(), key)?;
                    match g.mix.next(&mut g.rng) {
                        Op::Read => g.batch.push_read(key)?,
                        _ => g.batch.push_write(key, values.next())?,
                    }
                }
                handle.generic(&g.batch, &mut g.slots)?;
            }
        }
        Ok(())
    }

    fn record(&mut self, op: Op, latency: u64, handle: &dyn KVStoreHandle) {
        self.stats.add(op.into(), latency);
        if let Some(timing) = handle.txn_timing() {
            self.stats.add_latency(OpKind::Init, timing.begin);
            self.stats.add_latency(OpKind::Commit, timing.commit);
            if op == Op::Generic {
                self.stats
                    .add_breakdown(Breakdown::new(latency, timing.begin, timing.commit));
            }
        }
    }
}

impl PhaseWorker for TrafficWorker {
    fn run(&mut self, store: &dyn KVStore, handle: &mut dyn KVStoreHandle, control: &Control) {
        if !self.warmup.is_zero() {
            std::thread::sleep(self.warmup);
        }
        self.stats.reset();
        let clock = self.stats.clock().clone();
        let start = clock.now();
        let mut done = 0u64;
        let mut next_report = 1u64;
        let mut next_print = PRINT_STATS_SECS;
        while !control.should_stop() {
            match self.len {
                Length::Count(c) if done >= c => break,
                Length::Timeout(d) if clock.now().duration_since(start) >= d => break,
                _ => {}
            }
            let op = self.mix.next(&mut self.mix_rng);
            let t = clock.now();
            let result = self.execute(op, handle);
            let latency = clock.now().duration_since(t).as_nanos() as u64;
            if let Err(e) = result {
                error!("Traffic worker {} failed on {}: {}", self.id, op, e);
                control.fail();
                break;
            }
            self.record(op, latency, handle);
            done += 1;

            if let Length::Timeout(_) = self.len {
                if !self.sleep.is_zero() {
                    std::thread::sleep(self.sleep);
                }
                if self.id == 0 {
                    let elapsed = clock.now().duration_since(start).as_secs();
                    if elapsed >= next_report {
                        info!("Traffic worker 0: {} ops after {}s", done, elapsed);
                        next_report = elapsed + 1;
                    }
                    if elapsed >= next_print {
                        store.print_stats();
                        next_print += PRINT_STATS_SECS;
                    }
                }
            }
        }
        debug!("Traffic worker {} done after {} ops", self.id, done);
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Population progress is logged every `progress_step` keys.
fn progress_step(total: u64) -> u64 {
    let step = ((total as f64 * 0.01) / 1000.0).round() as u64 * 1000;
    match step {
        0 if total < 1000 => 10,
        0 if total < 100_000 => 100,
        0 => 1000,
        s => s,
    }
}

struct PopulationWorker {
    id: usize,
    range: Range<u64>,
    keys: Option<Distribution>,
    key_builder: KeyBuilder,
    values: ValueBuilder,
    bulk: usize,
    backoff: Backoff,
    batch: KVBatch,
    key: Vec<u8>,
    stats: Stats,
}

impl PopulationWorker {
    fn new(
        b: &Benchmark,
        id: usize,
        seed: u64,
        skews: &SkewCache,
        clock: Clock,
    ) -> std::result::Result<Self, ConfigError> {
        let range = b.population_range(id);
        let keys = if range.is_empty() {
            None
        } else {
            Some(Distribution::sequential(range.start, range.end)?)
        };
        let tid = b.instance_id * b.population_threads + id;
        let shard = shard_prefix(b.seed, tid as u64);
        Ok(Self {
            id,
            range,
            keys,
            key_builder: KeyBuilder::new(b.key_type, b.key_size, b.num_keys, shard)?,
            values: ValueBuilder::new(b.value_size.build(b.num_keys, seed, skews)?, seed)?,
            bulk: b.bulk,
            backoff: b.backoff,
            batch: KVBatch::with_capacity(b.bulk, b.key_size, b.max_value_size),
            key: Vec::with_capacity(b.key_size),
            stats: Stats::new(id, clock, seed),
        })
    }

    fn write_batch(
        &mut self,
        handle: &mut dyn KVStoreHandle,
        n: u64,
    ) -> std::result::Result<(), StoreError> {
        let Some(keys) = self.keys.as_mut() else {
            return Ok(());
        };
        self.batch.clear();
        for _ in 0..n {
            build_key(&mut self.key_builder, keys.next(), &mut self.key)?;
            self.batch.push(&self.key, self.values.next());
        }
        let batch = &self.batch;
        match batch.get(0) {
            Some((key, value)) if batch.len() == 1 => self
                .backoff
                .retry(|| handle.put(key, value), std::thread::sleep),
            _ => self
                .backoff
                .retry(|| handle.put_bulk(batch), std::thread::sleep),
        }
    }
}

impl PhaseWorker for PopulationWorker {
    fn run(&mut self, store: &dyn KVStore, handle: &mut dyn KVStoreHandle, control: &Control) {
        self.stats.reset();
        let clock = self.stats.clock().clone();
        let total = self.range.end - self.range.start;
        let step = progress_step(total);
        let mut written = 0u64;
        while written < total && !control.should_stop() {
            let n = (self.bulk as u64).min(total - written);
            let t = clock.now();
            let result = self.write_batch(handle, n);
            let latency = clock.now().duration_since(t).as_nanos() as u64;
            if let Err(e) = result {
                error!("Population worker {} failed: {}", self.id, e);
                control.fail();
                break;
            }
            for _ in 0..n {
                self.stats.add(OpKind::Insert, latency / n);
            }
            let before = written;
            written += n;
            if self.id == 0 && written / step > before / step {
                info!(
                    "Population worker 0: {}/{} keys ({}%)",
                    written,
                    total,
                    written * 100 / total
                );
                if (written / step) % 10 == 0 {
                    store.print_stats();
                }
            }
        }
        debug!(
            "Population worker {} wrote {} keys of [{}, {})",
            self.id, written, self.range.start, self.range.end
        );
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }
}

// }}} workers

// {{{ bencher

/// Results of one phase.
#[derive(Debug)]
pub struct PhaseReport {
    pub duration: Duration,
    pub summary: Summary,
    /// Epoch counters of every worker, in worker order.
    pub epochs: Vec<Vec<EpochSample>>,
}

impl PhaseReport {
    pub fn ops(&self) -> u64 {
        self.epochs.iter().flatten().map(|e| e.ops).sum()
    }
}

/// Results of a whole benchmark. A phase is `None` if it did not run.
#[derive(Debug, Default)]
pub struct Report {
    pub load: Option<PhaseReport>,
    pub run: Option<PhaseReport>,
}

fn xput_path(prefix: &Path, ext: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Spawn one thread per worker with the store's [`crate::thread::Thread`], and hand the workers
/// back once all threads have been joined. Workers whose thread panicked are lost, and fail the
/// run.
fn run_phase<W: PhaseWorker>(
    store: &Arc<Box<dyn KVStore>>,
    control: &Arc<Control>,
    workers: Vec<W>,
    pin: bool,
) -> Vec<W> {
    let slots: Arc<Vec<Mutex<Option<W>>>> =
        Arc::new(workers.iter().map(|_| Mutex::new(None)).collect());
    let thread = store.thread();
    let handles: Vec<Box<dyn JoinHandle>> = workers
        .into_iter()
        .enumerate()
        .map(|(i, mut worker)| {
            let store = store.clone();
            let control = control.clone();
            let slots = slots.clone();
            thread.spawn(Box::new(move || {
                if pin {
                    store.thread().pin(i);
                }
                let mut handle = store.handle();
                handle.thread_local_entry();
                worker.run(&**store, handle.as_mut(), &control);
                handle.thread_local_exit();
                *slots[i].lock() = Some(worker);
            }))
        })
        .collect();
    for handle in handles {
        if !handle.join() {
            error!("A worker thread panicked");
            control.fail();
        }
    }
    slots.iter().filter_map(|s| s.lock().take()).collect()
}

/// Append every worker's epochs to the phase's result file and print the phase summary.
fn finish_phase<W: PhaseWorker>(
    phase: &str,
    workers: &[W],
    duration: Duration,
    output: Option<&Path>,
) -> Result<PhaseReport> {
    if let Some(prefix) = output {
        let path = xput_path(prefix, &format!("{}xput", phase));
        let mut file = BufWriter::new(OpenOptions::new().create(true).append(true).open(&path)?);
        for w in workers {
            w.stats().dump(&mut file)?;
        }
        file.flush()?;
        debug!("Results of phase {} written to {}", phase, path.display());
    }
    let mut summary = Summary::new();
    for w in workers {
        summary.merge(w.stats().summary());
    }
    println!("{}", summary.line(phase, duration));
    Ok(PhaseReport {
        duration,
        summary,
        epochs: workers
            .iter()
            .map(|w| w.stats().epochs().iter().map(|e| e.sample).collect())
            .collect(),
    })
}

/// Poll interval of the barrier file.
const BARRIER_POLL: Duration = Duration::from_millis(100);

fn wait_after_population(b: &Benchmark, control: &Control) -> Result<()> {
    match &b.load_barrier {
        Some(path) => {
            File::create(path)?;
            info!(
                "Population done, remove {} to start the run phase",
                path.display()
            );
            while path.exists() {
                if control.wait_barrier_for(BARRIER_POLL) {
                    break;
                }
            }
        }
        None if !b.grace.is_zero() => {
            info!("Population done, sleeping {:?}", b.grace);
            std::thread::sleep(b.grace);
        }
        None => {}
    }
    Ok(())
}

/// Load then run. Stops at the first phase whose results cannot be written.
fn run_phases(
    store: &Arc<Box<dyn KVStore>>,
    b: &Benchmark,
    control: &Arc<Control>,
    clock: &Clock,
    population: Vec<PopulationWorker>,
    traffic: Vec<TrafficWorker>,
) -> Result<Report> {
    let mut report = Report::default();

    if !population.is_empty() {
        info!(
            "Populating {} keys with {} workers",
            b.num_keys,
            population.len()
        );
        let start = clock.now();
        let workers = run_phase(store, control, population, b.pin);
        let duration = clock.now().duration_since(start);
        report.load = Some(finish_phase("load", &workers, duration, b.output.as_deref())?);
        if !control.should_stop() {
            wait_after_population(b, control)?;
        }
    }

    if !traffic.is_empty() && !control.should_stop() {
        info!("Running traffic with {} workers", traffic.len());
        let start = clock.now();
        let workers = run_phase(store, control, traffic, b.pin);
        let duration = clock.now().duration_since(start);
        report.run = Some(finish_phase("run", &workers, duration, b.output.as_deref())?);
    }

    Ok(report)
}

/// Run a benchmark against `store`: load, optional barrier, run, shutdown.
///
/// All workers are built before the store is touched, so configuration problems surface before any
/// key is written. If a worker fails, the remaining workers stop, the statistics collected so far
/// are still written, and [`Error::Failed`] is returned. The store is shut down on every path
/// that got past [`KVStore::init`].
pub fn bench(
    store: Arc<Box<dyn KVStore>>,
    benchmark: &Benchmark,
    control: &Arc<Control>,
) -> Result<Report> {
    let b = benchmark;
    info!("Running benchmark with seed {}", b.seed);
    if let Some(prefix) = &b.output {
        File::create(xput_path(prefix, "loadxput"))?;
        File::create(xput_path(prefix, "runxput"))?;
    }

    let clock = Clock::new();
    let skews = SkewCache::new();
    let (traffic_seeds, population_seeds) =
        worker_seeds(b.seed, b.threads, b.population_threads);
    let population = population_seeds
        .iter()
        .enumerate()
        .map(|(i, seed)| PopulationWorker::new(b, i, *seed, &skews, clock.clone()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let traffic = traffic_seeds
        .iter()
        .enumerate()
        .map(|(i, seed)| TrafficWorker::new(b, i, *seed, &skews, clock.clone()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    store.init()?;
    let phases = run_phases(&store, b, control, &clock, population, traffic);
    // the store is shut down even if writing the results failed
    store.print_stats();
    let shutdown = store.shutdown();
    let report = phases?;
    shutdown?;
    if control.is_failed() {
        return Err(Error::Failed(
            "a worker stopped on a store error or the run was interrupted".to_string(),
        ));
    }
    Ok(report)
}

// }}} bencher

// {{{ tests


// }}} tests
