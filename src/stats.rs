//! Bounded-memory latency and throughput statistics.
//!
//! Every worker owns one [`Stats`]. Completed operations are counted in one-second epochs, and
//! their latencies are sampled into fixed-size reservoirs, one per epoch and operation kind, so
//! memory stays constant per epoch no matter how many operations run.
//!
//! ## Output Format
//!
//! After a phase, every worker appends one line per epoch to the phase's result file
//! (`<output>.loadxput` or `<output>.runxput`). All latencies are in nanoseconds:
//!
//! ```txt
//! worker epoch ops cumul debt p50_insert p99_insert p50_generic p99_generic avg_init p50_init
//! p99_init avg_commit p50_commit p99_commit avg_update p50_update p99_update p50_bd_begin
//! p50_bd_commit p50_bd_total p99_bd_begin p99_bd_commit p99_bd_total
//! ```
//!
//! - `ops`, `cumul`: number of operations started in the epoch and the sum of their latencies.
//! - `debt`: how far the last operation of the epoch ran past the epoch boundary. It is only a
//!   consistency check of the one-epoch-per-second cadence.
//! - `bd_*`: begin, commit and total latency of generic transactions, as reported by the store.
//!
//! Percentiles of an empty reservoir are printed as `0`.
//!
//! In addition, [`Summary`] aggregates all latencies of a phase into an [`hdrhistogram`] and prints
//! a single line once the phase is done:
//!
//! ```txt
//! phase run finish . duration 10.00 total 1000000 mops 0.10 min_us 0.05 max_us 100.00 avg_us 50.00 p50_us 50.00 p95_us 95.00 p99_us 99.00 p999_us 100.00
//! ```

use crate::workload::Op;
use hdrhistogram::Histogram;
use log::{debug, warn};
use quanta::{Clock, Instant};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{self, Write};
use std::time::Duration;

/// Samples kept per reservoir.
pub const RESERVOIR_SIZE: usize = 1000;

/// Width of an epoch in nanoseconds.
pub const EPOCH_NANOS: u64 = 1_000_000_000;

// {{{ reservoir

/// A uniform random sample of a stream of unknown length (algorithm R).
///
/// The first `capacity` values are kept unconditionally, every later value replaces a random slot
/// with probability `capacity / seen`. Storage is only allocated on the first insert.
#[derive(Debug, Clone)]
pub struct Reservoir<T> {
    capacity: usize,
    values: Vec<T>,
    seen: u64,
}

impl<T> Default for Reservoir<T> {
    fn default() -> Self {
        Self::with_capacity(RESERVOIR_SIZE)
    }
}

impl<T: Copy + Ord + Default> Reservoir<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> Reservoir<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            values: Vec::new(),
            seen: 0,
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }
}

impl<T: Copy + Ord + Default> Reservoir<T> {
    pub fn add(&mut self, value: T, rng: &mut impl Rng) {
        self.seen += 1;
        if self.values.len() < self.capacity {
            if self.values.is_empty() {
                self.values.reserve_exact(self.capacity);
            }
            self.values.push(value);
        } else {
            let slot = rng.random_range(0..self.seen);
            if slot < self.capacity as u64 {
                self.values[slot as usize] = value;
            }
        }
    }

    /// A sorted snapshot, the only way to query percentiles.
    pub fn sorted(&self) -> Sorted<T> {
        let mut values = self.values.clone();
        values.sort_unstable();
        Sorted { values }
    }
}

/// Sorted samples of a [`Reservoir`].
#[derive(Debug, Clone)]
pub struct Sorted<T> {
    values: Vec<T>,
}

impl<T: Copy + Default> Sorted<T> {
    /// The sample at `p * len`, `p` in `(0, 1]`. An empty snapshot yields the default value.
    pub fn percentile(&self, p: f64) -> T {
        debug_assert!(p > 0.0 && p <= 1.0, "percentile {p} out of (0, 1]");
        if self.values.is_empty() {
            return T::default();
        }
        let index = ((p * self.values.len() as f64) as usize).min(self.values.len() - 1);
        self.values[index]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Sorted<u64> {
    pub fn average(&self) -> u64 {
        if self.values.is_empty() {
            return 0;
        }
        let sum: u128 = self.values.iter().map(|v| *v as u128).sum();
        (sum / self.values.len() as u128) as u64
    }
}

// }}} reservoir

// {{{ epochs

/// Latency categories with their own reservoirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Update,
    Insert,
    Scan,
    ReadModifyWrite,
    Generic,
    /// Transaction begin, reported by the store.
    Init,
    /// Transaction commit, reported by the store.
    Commit,
}

impl OpKind {
    pub const COUNT: usize = 8;

    fn index(self) -> usize {
        self as usize
    }
}

impl From<Op> for OpKind {
    fn from(op: Op) -> Self {
        match op {
            Op::Read => OpKind::Read,
            Op::Update => OpKind::Update,
            Op::Insert => OpKind::Insert,
            Op::Scan => OpKind::Scan,
            Op::ReadModifyWrite => OpKind::ReadModifyWrite,
            Op::Generic => OpKind::Generic,
        }
    }
}

/// Decomposition of a generic transaction's latency. Ordered by total latency first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Breakdown {
    pub total: u64,
    pub begin: u64,
    pub body: u64,
    pub commit: u64,
}

impl Breakdown {
    /// The body is whatever is left of `total` after begin and commit.
    pub fn new(total: u64, begin: u64, commit: u64) -> Self {
        Self {
            total,
            begin,
            body: total.saturating_sub(begin + commit),
            commit,
        }
    }
}

/// Throughput counters of one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochSample {
    pub ops: u64,
    /// Sum of the latencies of the operations counted in `ops`.
    pub cumul: u64,
    pub debt: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Epoch {
    pub sample: EpochSample,
    latencies: [Reservoir<u64>; OpKind::COUNT],
    breakdown: Reservoir<Breakdown>,
}

impl Epoch {
    pub fn latencies(&self, kind: OpKind) -> &Reservoir<u64> {
        &self.latencies[kind.index()]
    }

    pub fn breakdown(&self) -> &Reservoir<Breakdown> {
        &self.breakdown
    }

    /// One result line, without the trailing newline.
    pub fn line(&self, worker: usize, index: usize) -> String {
        let insert = self.latencies(OpKind::Insert).sorted();
        let generic = self.latencies(OpKind::Generic).sorted();
        let init = self.latencies(OpKind::Init).sorted();
        let commit = self.latencies(OpKind::Commit).sorted();
        let update = self.latencies(OpKind::Update).sorted();
        let breakdown = self.breakdown.sorted();
        let (bd50, bd99) = (breakdown.percentile(0.5), breakdown.percentile(0.99));
        let s = &self.sample;
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            worker,
            index,
            s.ops,
            s.cumul,
            s.debt,
            insert.percentile(0.5),
            insert.percentile(0.99),
            generic.percentile(0.5),
            generic.percentile(0.99),
            init.average(),
            init.percentile(0.5),
            init.percentile(0.99),
            commit.average(),
            commit.percentile(0.5),
            commit.percentile(0.99),
            update.average(),
            update.percentile(0.5),
            update.percentile(0.99),
            bd50.begin,
            bd50.commit,
            bd50.total,
            bd99.begin,
            bd99.commit,
            bd99.total,
        )
    }
}

// }}} epochs

// {{{ stats

/// Per-worker statistics: dense one-second epochs since the last [`Stats::reset`].
pub struct Stats {
    id: usize,
    clock: Clock,
    start: Instant,
    end_curr_epoch: u64,
    epochs: Vec<Epoch>,
    summary: Summary,
    rng: StdRng,
}

impl Stats {
    /// `seed` drives the reservoir replacement policy.
    pub fn new(id: usize, clock: Clock, seed: u64) -> Self {
        let start = clock.now();
        let mut stats = Self {
            id,
            clock,
            start,
            end_curr_epoch: EPOCH_NANOS,
            epochs: Vec::new(),
            summary: Summary::new(),
            rng: StdRng::seed_from_u64(seed),
        };
        stats.reset();
        stats
    }

    /// Drop everything collected so far and restart epoch 0 now.
    pub fn reset(&mut self) {
        self.start = self.clock.now();
        self.end_curr_epoch = EPOCH_NANOS;
        self.epochs.clear();
        self.epochs.push(Epoch::default());
        self.summary = Summary::new();
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn current(&mut self) -> &mut Epoch {
        let last = self.epochs.len() - 1;
        &mut self.epochs[last]
    }

    /// Count one completed operation of `latency` nanoseconds.
    ///
    /// The whole latency is charged to the current epoch, then epochs are appended, possibly
    /// empty ones, until the current epoch covers the present.
    pub fn add(&mut self, kind: OpKind, latency: u64) {
        self.summary.record(latency);
        let epoch = self.epochs.len() - 1;
        let e = &mut self.epochs[epoch];
        e.sample.ops += 1;
        e.sample.cumul += latency;
        e.latencies[kind.index()].add(latency, &mut self.rng);

        let elapsed = self.clock.now().duration_since(self.start).as_nanos() as u64;
        if elapsed >= self.end_curr_epoch {
            let spill = elapsed - self.end_curr_epoch;
            self.current().sample.debt = latency.min(spill);
        }
        while elapsed >= self.end_curr_epoch {
            if self.id == 0 {
                let s = self.current().sample;
                debug!(
                    "worker {} epoch {} ops {} cumul {}",
                    self.id,
                    self.epochs.len() - 1,
                    s.ops,
                    s.cumul
                );
            }
            self.epochs.push(Epoch::default());
            self.end_curr_epoch = self.epochs.len() as u64 * EPOCH_NANOS;
        }
    }

    /// Sample a latency without counting an operation, for the parts of an operation that the
    /// store times on its own.
    pub fn add_latency(&mut self, kind: OpKind, latency: u64) {
        let epoch = self.epochs.len() - 1;
        self.epochs[epoch].latencies[kind.index()].add(latency, &mut self.rng);
    }

    pub fn add_breakdown(&mut self, breakdown: Breakdown) {
        let epoch = self.epochs.len() - 1;
        self.epochs[epoch].breakdown.add(breakdown, &mut self.rng);
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    pub fn total_ops(&self) -> u64 {
        self.epochs.iter().map(|e| e.sample.ops).sum()
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Write one line per epoch.
    pub fn dump(&self, w: &mut impl Write) -> io::Result<()> {
        for (i, epoch) in self.epochs.iter().enumerate() {
            writeln!(w, "{}", epoch.line(self.id, i))?;
        }
        w.flush()
    }
}

// }}} stats

// {{{ summary

/// Phase-wide latency histogram, in nanoseconds.
#[derive(Debug, Clone)]
pub struct Summary {
    hdr: Histogram<u64>,
}

impl Default for Summary {
    fn default() -> Self {
        Self::new()
    }
}

impl Summary {
    pub fn new() -> Self {
        // 3 significant digits is always a valid precision
        let hdr = Histogram::new(3).expect("valid histogram precision");
        Self { hdr }
    }

    pub fn record(&mut self, nanos: u64) {
        // auto-resizing, so this only fails if the value overflows the histogram
        if let Err(e) = self.hdr.record(nanos) {
            warn!("Dropping latency {} ns: {}", nanos, e);
        }
    }

    pub fn merge(&mut self, other: &Summary) {
        if let Err(e) = self.hdr.add(&other.hdr) {
            warn!("Dropping latency histogram of a worker: {}", e);
        }
    }

    pub fn total(&self) -> u64 {
        self.hdr.len()
    }

    /// The `phase <name> finish .` line for a phase that ran for `duration`.
    pub fn line(&self, phase: &str, duration: Duration) -> String {
        let secs = duration.as_secs_f64();
        let total = self.total();
        let mops = if secs > 0.0 {
            total as f64 / secs / 1_000_000.0
        } else {
            0.0
        };
        let hdr = &self.hdr;
        format!(
            "phase {} finish . duration {:.2} total {} mops {:.2} \
             min_us {:.2} max_us {:.2} avg_us {:.2} \
             p50_us {:.2} p95_us {:.2} p99_us {:.2} p999_us {:.2}",
            phase,
            secs,
            total,
            mops,
            hdr.min() as f64 / 1000.0,
            hdr.max() as f64 / 1000.0,
            hdr.mean() / 1000.0,
            hdr.value_at_quantile(0.50) as f64 / 1000.0,
            hdr.value_at_quantile(0.95) as f64 / 1000.0,
            hdr.value_at_quantile(0.99) as f64 / 1000.0,
            hdr.value_at_quantile(0.999) as f64 / 1000.0,
        )
    }
}

// }}} summary

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_keeps_first_values() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut r = Reservoir::<u64>::new();
        assert!(r.is_empty());
        for i in 0..RESERVOIR_SIZE as u64 {
            r.add(i, &mut rng);
        }
        assert_eq!(r.len(), RESERVOIR_SIZE);
        assert!(r.values().iter().enumerate().all(|(i, v)| i as u64 == *v));
        for i in 0..10 * RESERVOIR_SIZE as u64 {
            r.add(i, &mut rng);
        }
        assert_eq!(r.len(), RESERVOIR_SIZE);
        assert_eq!(r.seen(), 11 * RESERVOIR_SIZE as u64);
    }

    #[test]
    fn reservoir_inclusion_is_uniform() {
        let (capacity, items, trials) = (10usize, 50u64, 20000);
        let mut rng = StdRng::seed_from_u64(17);
        let mut included = vec![0u64; items as usize];
        for _ in 0..trials {
            let mut r = Reservoir::with_capacity(capacity);
            for i in 0..items {
                r.add(i, &mut rng);
            }
            for v in r.values() {
                included[*v as usize] += 1;
            }
        }
        let expected = capacity as f64 / items as f64;
        for (i, c) in included.iter().enumerate() {
            let p = *c as f64 / trials as f64;
            assert!((p - expected).abs() < 0.02, "item {i}: {p}");
        }
    }

    #[test]
    fn percentiles_and_average() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut r = Reservoir::new();
        for v in (1..=100u64).rev() {
            r.add(v, &mut rng);
        }
        let sorted = r.sorted();
        assert_eq!(sorted.len(), 100);
        assert_eq!(sorted.percentile(0.5), 51);
        assert_eq!(sorted.percentile(0.99), 100);
        assert_eq!(sorted.percentile(1.0), 100);
        assert_eq!(sorted.average(), 50);

        let empty = Reservoir::<u64>::new().sorted();
        assert_eq!(empty.percentile(0.5), 0);
        assert_eq!(empty.average(), 0);
    }

    #[test]
    fn breakdown_orders_by_total() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut r = Reservoir::new();
        r.add(Breakdown::new(300, 10, 20), &mut rng);
        r.add(Breakdown::new(100, 50, 40), &mut rng);
        r.add(Breakdown::new(200, 1, 1), &mut rng);
        let sorted = r.sorted();
        assert_eq!(sorted.percentile(0.01).total, 100);
        assert_eq!(sorted.percentile(0.01).body, 10);
        assert_eq!(sorted.percentile(0.99).total, 300);
        assert_eq!(Breakdown::new(5, 10, 10).body, 0);
    }

    #[test]
    fn epochs_are_dense() {
        let (clock, mock) = Clock::mock();
        let mut stats = Stats::new(1, clock, 0);
        for _ in 0..10 {
            stats.add(OpKind::Read, 100);
        }
        assert_eq!(stats.epochs().len(), 1);

        mock.increment(Duration::from_millis(3500));
        stats.add(OpKind::Update, 2_000_000_000);
        // the late operation is charged to the epoch it was recorded in
        assert_eq!(stats.epochs().len(), 4);
        let first = stats.epochs()[0].sample;
        assert_eq!(first.ops, 11);
        assert_eq!(first.cumul, 10 * 100 + 2_000_000_000);
        assert_eq!(first.debt, 2_000_000_000);
        assert_eq!(stats.epochs()[1].sample, EpochSample::default());
        assert_eq!(stats.epochs()[2].sample, EpochSample::default());

        mock.increment(Duration::from_millis(100));
        stats.add(OpKind::Read, 7);
        assert_eq!(stats.epochs().len(), 4);
        assert_eq!(stats.epochs()[3].sample.ops, 1);
        assert_eq!(stats.total_ops(), 12);
    }

    #[test]
    fn debt_is_bounded_by_latency() {
        let (clock, mock) = Clock::mock();
        let mut stats = Stats::new(0, clock, 0);
        mock.increment(Duration::from_millis(1200));
        stats.add(OpKind::Read, 50);
        assert_eq!(stats.epochs()[0].sample.debt, 50);
        assert_eq!(stats.epochs().len(), 2);
    }

    #[test]
    fn reset_starts_over() {
        let (clock, mock) = Clock::mock();
        let mut stats = Stats::new(0, clock, 0);
        mock.increment(Duration::from_secs(5));
        stats.add(OpKind::Read, 1);
        assert_eq!(stats.epochs().len(), 6);
        stats.reset();
        assert_eq!(stats.epochs().len(), 1);
        assert_eq!(stats.total_ops(), 0);
        assert_eq!(stats.summary().total(), 0);
        stats.add(OpKind::Read, 1);
        assert_eq!(stats.epochs().len(), 1);
    }

    #[test]
    fn dump_schema() {
        let (clock, mock) = Clock::mock();
        let mut stats = Stats::new(3, clock, 0);
        stats.add(OpKind::Insert, 10);
        stats.add(OpKind::Insert, 20);
        stats.add(OpKind::Update, 40);
        stats.add_latency(OpKind::Init, 4);
        stats.add_latency(OpKind::Commit, 6);
        stats.add(OpKind::Generic, 100);
        stats.add_breakdown(Breakdown::new(100, 4, 6));
        mock.increment(Duration::from_millis(1500));
        stats.add(OpKind::Read, 5);

        let mut out = Vec::new();
        stats.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let fields: Vec<u64> = lines[0]
            .split(' ')
            .map(|f| f.parse().unwrap())
            .collect();
        assert_eq!(fields.len(), 24);
        assert_eq!(
            fields,
            vec![
                3, 0, 5, 175, 5, 20, 20, 100, 100, 4, 4, 4, 6, 6, 6, 40, 40, 40, 4, 6, 100, 4,
                6, 100
            ]
        );
        assert_eq!(lines[1], "3 1 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0");
    }

    #[test]
    fn summary_line() {
        let mut a = Summary::new();
        let mut b = Summary::new();
        for v in 1..=1000u64 {
            a.record(v * 1000);
            b.record(v * 1000);
        }
        a.merge(&b);
        assert_eq!(a.total(), 2000);
        let line = a.line("run", Duration::from_secs(2));
        assert!(line.starts_with("phase run finish . duration 2.00 total 2000 mops 0.00 min_us 1.00"));
        assert!(line.contains(" p99_us "));
        assert!(Summary::new().line("load", Duration::ZERO).contains("mops 0.00"));
    }

    fn field(line: &str, name: &str) -> f64 {
        let mut it = line.split_whitespace();
        while let Some(w) = it.next() {
            if w == name {
                return it.next().unwrap().parse().unwrap();
            }
        }
        panic!("no {} in {}", name, line);
    }

    #[test]
    fn summary_keeps_large_latencies() {
        let mut a = Summary::new();
        let mut b = Summary::new();
        for v in 1000..=1_000_000u64 {
            a.record(v);
            b.record(v);
        }
        a.merge(&b);
        assert_eq!(a.total(), 2 * 999_001);
        let line = a.line("run", Duration::from_secs(1));
        // 3 significant digits
        let close = |got: f64, want: f64| (got - want).abs() <= want * 0.002;
        assert!(close(field(&line, "min_us"), 1.0), "{}", line);
        assert!(close(field(&line, "max_us"), 1000.0), "{}", line);
        assert!(close(field(&line, "avg_us"), 500.5), "{}", line);
        assert!(close(field(&line, "p50_us"), 500.5), "{}", line);
        assert!(close(field(&line, "p99_us"), 990.0), "{}", line);
        assert!(field(&line, "p999_us") >= field(&line, "p99_us"));
    }
}
