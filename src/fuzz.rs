use std::collections::HashSet;
use std::io;

use rand_core::RngCore;
use rand_mt::Mt19937GenRand64;
use thiserror::Error;

use crate::munge::MungedBitcode;
use crate::records::Record;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("can't fuzz an empty list of records")]
    EmptyRecordList,
}

/// Random number source for fuzzing. Not thread safe; the fuzzer takes the
/// generator by reference so no global state is involved.
pub trait RandomNumberGenerator {
    fn next_value(&mut self) -> u64;

    /// A value in `[0, limit)`.
    fn choose_in_range(&mut self, limit: u64) -> u64 {
        debug_assert!(limit > 0);
        self.next_value() % limit
    }
}

/// MT19937-64 keyed from a UTF-8 seed string and a salt. The same
/// `(seed, salt)` pair always yields the same value sequence.
pub struct SeededRng {
    engine: Mt19937GenRand64,
    seed: String,
}

fn keyed_engine(seed: &str, salt: u64) -> Mt19937GenRand64 {
    let key = std::iter::once(salt).chain(seed.as_bytes().iter().map(|&b| u64::from(b)));
    Mt19937GenRand64::new_with_key(key)
}

impl SeededRng {
    pub fn new(seed: &str) -> Self {
        Self {
            engine: keyed_engine(seed, 0),
            seed: seed.to_owned(),
        }
    }

    /// Reseed by salting the construction seed with `salt`.
    pub fn salt_seed(&mut self, salt: u64) {
        self.engine = keyed_engine(&self.seed, salt);
    }
}

impl RandomNumberGenerator for SeededRng {
    fn next_value(&mut self) -> u64 {
        self.engine.next_u64()
    }
}

/// Counts how many times each value in `[0, size)` was drawn.
struct DistCounter {
    counts: Vec<usize>,
    total: usize,
}

impl DistCounter {
    fn new(size: usize) -> Self {
        Self {
            counts: vec![0; size],
            total: 0,
        }
    }

    fn increment(&mut self, value: usize) -> usize {
        self.counts[value] += 1;
        self.total += 1;
        value
    }
}

#[derive(Clone, Copy)]
struct WeightedValue<T> {
    value: T,
    weight: u64,
}

const fn wv<T>(value: T, weight: u64) -> WeightedValue<T> {
    WeightedValue { value, weight }
}

/// Draws values with probability proportional to their weights.
struct WeightedDistribution<T: 'static> {
    dist: &'static [WeightedValue<T>],
    total_weight: u64,
}

impl<T: Copy + 'static> WeightedDistribution<T> {
    fn new(dist: &'static [WeightedValue<T>]) -> Self {
        let total_weight = dist.iter().map(|wv| wv.weight).sum();
        Self { dist, total_weight }
    }

    fn choose_index(&self, rng: &mut dyn RandomNumberGenerator) -> usize {
        let mut weighted_sum = rng.choose_in_range(self.total_weight);
        for (i, wv) in self.dist.iter().enumerate() {
            if weighted_sum < wv.weight {
                return i;
            }
            weighted_sum -= wv.weight;
        }
        unreachable!("weighted sum below total weight")
    }

    fn choose(&self, rng: &mut dyn RandomNumberGenerator) -> T {
        self.dist[self.choose_index(rng)].value
    }
}

#[derive(Clone, Copy)]
struct Range {
    min: u64,
    max: u64,
}

/// Weighted ranges; drawing picks a range, then a value inside it.
struct WeightedRangeDistribution {
    dist: WeightedDistribution<Range>,
}

impl WeightedRangeDistribution {
    fn new(dist: &'static [WeightedValue<Range>]) -> Self {
        Self {
            dist: WeightedDistribution::new(dist),
        }
    }

    fn choose_value(&self, rng: &mut dyn RandomNumberGenerator) -> u64 {
        let range = self.dist.choose(rng);
        range.min + rng.choose_in_range(range.max - range.min + 1)
    }
}

/// The editing moves the fuzzer can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Insert,
    Mutate,
    Remove,
    Replace,
    Swap,
}

impl EditAction {
    pub fn name(&self) -> &'static str {
        match self {
            EditAction::Insert => "Insert",
            EditAction::Mutate => "Mutate",
            EditAction::Remove => "Remove",
            EditAction::Replace => "Replace",
            EditAction::Swap => "Swap",
        }
    }
}

const ACTION_DIST: &[WeightedValue<EditAction>] = &[
    wv(EditAction::Insert, 3),
    wv(EditAction::Mutate, 5),
    wv(EditAction::Remove, 1),
    wv(EditAction::Replace, 1),
    wv(EditAction::Swap, 1),
];

const fn range(min: u64, max: u64, weight: u64) -> WeightedValue<Range> {
    wv(Range { min, max }, weight)
}

/// Non-negative record values: small values dominate, with a long tail.
const POS_VALUE_DIST: &[WeightedValue<Range>] = &[
    range(0, 6, 100),
    range(7, 20, 50),
    range(21, 40, 10),
    range(41, 100, 2),
    range(101, 4096, 1),
];

/// Odds of flipping a generated value to its two's-complement negation.
const NEG_VALUE_DIST: &[WeightedValue<bool>] = &[wv(true, 1), wv(false, 100)];

/// Generated record sizes (always at least one value).
const RECORD_SIZE_DIST: &[WeightedValue<Range>] = &[
    range(1, 3, 1000),
    range(4, 7, 100),
    range(7, 100, 1),
];

/// Sentinel entry drawing a random code disjoint from the named ones.
const OTHER_RECORD_CODE: u64 = 575757575;

/// Record codes to generate. Weights approximate how many thousand
/// instances of each code appear in a large frozen executable (1 when
/// under a thousand).
const RECORD_CODE_DIST: &[WeightedValue<u64>] = &[
    wv(1, 1),
    wv(1, 1),
    wv(8, 7),
    wv(1, 1),
    wv(2, 1),
    wv(3, 1),
    wv(4, 1),
    wv(7, 1),
    wv(12, 1),
    wv(21, 1),
    wv(1, 1),
    wv(2, 1),
    wv(1, 15),
    wv(3, 1),
    wv(4, 115),
    wv(6, 1),
    wv(0, 14),
    wv(1, 1),
    wv(2, 2),
    wv(3, 18),
    wv(4, 20),
    wv(5, 1),
    wv(1, 6),
    wv(2, 402),
    wv(3, 61),
    wv(6, 1),
    wv(7, 1),
    wv(10, 7),
    wv(11, 223),
    wv(12, 7),
    wv(15, 1),
    wv(16, 84),
    wv(19, 34),
    wv(20, 225),
    wv(24, 461),
    wv(28, 140),
    wv(29, 10),
    wv(34, 80),
    wv(43, 36),
    wv(44, 5),
    wv(crate::records::ENTER_BLOCK_CODE, 1),
    wv(crate::records::EXIT_BLOCK_CODE, 1),
    wv(crate::records::DEFINE_ABBREV_CODE, 1),
    wv(OTHER_RECORD_CODE, 1),
];

/// Applies weighted random edits to a munged bitcode. Every edit targets a
/// random base-record index; the overlay is cleared at the start of each
/// `fuzz` call so repeated calls are independent mutations of the input.
pub struct SimpleRecordFuzzer<'a, R: RandomNumberGenerator> {
    bitcode: &'a mut MungedBitcode,
    rng: &'a mut R,
    record_counter: DistCounter,
    action_weight: WeightedDistribution<EditAction>,
    action_counter: DistCounter,
    record_size_weight: WeightedRangeDistribution,
    pos_value_weight: WeightedRangeDistribution,
    neg_value_weight: WeightedDistribution<bool>,
    record_code_weight: WeightedDistribution<u64>,
    used_record_codes: HashSet<u64>,
}

impl<'a, R: RandomNumberGenerator> SimpleRecordFuzzer<'a, R> {
    pub fn new(bitcode: &'a mut MungedBitcode, rng: &'a mut R) -> Result<Self, Error> {
        if bitcode.base_records().is_empty() {
            return Err(Error::EmptyRecordList);
        }
        let num_records = bitcode.base_records().len();
        let used_record_codes = RECORD_CODE_DIST.iter().map(|wv| wv.value).collect();
        Ok(Self {
            bitcode,
            rng,
            record_counter: DistCounter::new(num_records),
            action_weight: WeightedDistribution::new(ACTION_DIST),
            action_counter: DistCounter::new(ACTION_DIST.len()),
            record_size_weight: WeightedRangeDistribution::new(RECORD_SIZE_DIST),
            pos_value_weight: WeightedRangeDistribution::new(POS_VALUE_DIST),
            neg_value_weight: WeightedDistribution::new(NEG_VALUE_DIST),
            record_code_weight: WeightedDistribution::new(RECORD_CODE_DIST),
            used_record_codes,
        })
    }

    /// The bitcode being fuzzed, for writing out results.
    pub fn bitcode(&self) -> &MungedBitcode {
        self.bitcode
    }

    /// The generator, e.g. to reseed between fuzzing rounds.
    pub fn generator(&mut self) -> &mut R {
        self.rng
    }

    /// Apply `count / base` worth of edits (at least one) to the bitcode.
    pub fn fuzz(&mut self, count: u32, base: u32) {
        self.bitcode.remove_edits();
        let num_records = self.bitcode.base_records().len();
        let num_actions =
            (num_records * count as usize / base.max(1) as usize).max(1);
        for _ in 0..num_actions {
            let action = self.choose_action();
            self.apply_action(action);
        }
    }

    fn choose_action(&mut self) -> EditAction {
        let index = self.action_weight.choose_index(self.rng);
        ACTION_DIST[self.action_counter.increment(index)].value
    }

    fn choose_record_index(&mut self) -> usize {
        let limit = self.bitcode.base_records().len() as u64;
        self.record_counter
            .increment(self.rng.choose_in_range(limit) as usize)
    }

    fn choose_record_code(&mut self) -> u64 {
        let code = self.record_code_weight.choose(self.rng);
        if code != OTHER_RECORD_CODE {
            return code;
        }
        let mut code = self.rng.choose_in_range(u64::from(u32::MAX));
        while self.used_record_codes.contains(&code) {
            code += 1;
        }
        code
    }

    fn choose_value(&mut self) -> u64 {
        let value = self.pos_value_weight.choose_value(self.rng);
        if self.neg_value_weight.choose(self.rng) {
            value.wrapping_neg()
        } else {
            value
        }
    }

    fn choose_record(&mut self) -> Record {
        let code = self.choose_record_code();
        let num_values = self.record_size_weight.choose_value(self.rng) as usize;
        let mut values = Vec::with_capacity(num_values);
        for _ in 0..num_values {
            values.push(self.choose_value());
        }
        Record::unabbreviated(code, values)
    }

    fn mutate_record(&mut self, record: &mut Record) {
        let index = self.rng.choose_in_range(record.values.len() as u64 + 1);
        if index == 0 {
            record.code = self.choose_record_code();
        } else {
            record.values[index as usize - 1] = self.choose_value();
        }
    }

    fn apply_action(&mut self, action: EditAction) {
        let index = self.choose_record_index();
        match action {
            EditAction::Insert => {
                let record = self.choose_record();
                if self.rng.choose_in_range(2) != 0 {
                    self.bitcode.add_before(index, record);
                } else {
                    self.bitcode.add_after(index, record);
                }
            }
            EditAction::Remove => self.bitcode.remove(index),
            EditAction::Replace => {
                let record = self.choose_record();
                self.bitcode.replace(index, record);
            }
            EditAction::Mutate => {
                let mut record = self.bitcode.base_records()[index].clone();
                self.mutate_record(&mut record);
                self.bitcode.replace(index, record);
            }
            EditAction::Swap => {
                let index2 = self.choose_record_index();
                let first = self.bitcode.base_records()[index].clone();
                let second = self.bitcode.base_records()[index2].clone();
                self.bitcode.replace(index, second);
                self.bitcode.replace(index2, first);
            }
        }
    }

    /// How many times each base record was targeted, over all fuzz calls.
    pub fn show_record_distribution(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let total = self.record_counter.total;
        writeln!(out, "Edit Record Distribution (Total: {total}):")?;
        for (i, &count) in self.record_counter.counts.iter().enumerate() {
            writeln!(out, "  {i}: {count} ({}%)", percentage(count, total))?;
        }
        Ok(())
    }

    /// How often each action was wanted versus applied.
    pub fn show_edit_distribution(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let total_weight = self.action_weight.total_weight as usize;
        let total_count = self.action_counter.total;
        writeln!(out, "Edit Action Distribution (Total: {total_count}):")?;
        for (i, wv) in ACTION_DIST.iter().enumerate() {
            let count = self.action_counter.counts[i];
            writeln!(
                out,
                "  {} - Wanted: {}%, Applied: {} ({}%)",
                wv.value.name(),
                percentage(wv.weight as usize, total_weight),
                count,
                percentage(count, total_count),
            )?;
        }
        Ok(())
    }
}

fn percentage(count: usize, total: usize) -> u64 {
    if total == 0 {
        return 0;
    }
    (100.0 * count as f64 / total as f64).round() as u64
}
