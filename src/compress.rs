use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

use crate::bitstream::{
    unabbreviated_bits, Abbreviation, BuiltinAbbrevId, CodeSelector, Operand,
    BLOCKINFO_BLOCK_ID, BLOCKINFO_CODE_SETBID, FIRST_APPLICATION_ABBREV,
};
use crate::header::Header;
use crate::records::{
    read_record_list, Record, DEFINE_ABBREV_CODE, ENTER_BLOCK_CODE, EXIT_BLOCK_CODE, HEADER_CODE,
};
use crate::write::{self, BitstreamWriter};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Records(#[from] crate::records::Error),
    #[error("bad abbreviation index {abbrev} in block {block_id}")]
    BadAbbrevIndex { block_id: u32, abbrev: u32 },
    #[error("malformed abbreviation definition record")]
    BadAbbrevRecord,
    #[error(transparent)]
    Write(#[from] write::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressFlags {
    /// Strip every abbreviation instead of choosing better ones.
    pub remove_abbreviations: bool,
}

/// Record sizes above this share one lookup bucket, and candidate
/// abbreviations for them keep their trailing array.
const VALUE_INDEX_CUTOFF: usize = 8;

/// Abbreviations chosen fewer times than this are dropped; their records
/// fall back to unabbreviated form.
const MIN_USAGE_COUNT: u32 = 5;

/// Marker for "emit unabbreviated" in selection queues.
const UNABBREV: u32 = BuiltinAbbrevId::UnabbrevRecord as u32;

/// The candidate abbreviation pool for one block id. Internal indices
/// start at `FIRST_APPLICATION_ABBREV` like bitstream indices, but cover
/// local and inherited abbreviations alike.
#[derive(Default)]
struct BlockAbbrevs {
    abbrevs: Vec<Rc<Abbreviation>>,
}

impl BlockAbbrevs {
    fn find(&self, abbrev: &Abbreviation) -> Option<u32> {
        self.abbrevs
            .iter()
            .position(|a| a.as_ref() == abbrev)
            .map(|i| i as u32 + FIRST_APPLICATION_ABBREV)
    }

    /// Add a canonical abbreviation, deduplicating against the pool.
    /// Returns its internal index.
    fn add(&mut self, abbrev: Abbreviation) -> u32 {
        if let Some(index) = self.find(&abbrev) {
            return index;
        }
        self.abbrevs.push(Rc::new(abbrev));
        self.abbrevs.len() as u32 - 1 + FIRST_APPLICATION_ABBREV
    }

    fn get(&self, index: u32) -> Option<&Rc<Abbreviation>> {
        let i = index.checked_sub(FIRST_APPLICATION_ABBREV)?;
        self.abbrevs.get(i as usize)
    }
}

/// Frequency data for records read with one (abbreviation, code, size)
/// shape. Value counts are tracked per position up to the cutoff.
#[derive(Default)]
struct ShapeDist {
    count: u32,
    value_counts: Vec<HashMap<u64, u32>>,
}

type ShapeKey = (u32, u64, usize);

#[derive(Default)]
struct BlockDist {
    shapes: HashMap<ShapeKey, ShapeDist>,
}

fn clamp_size(size: usize) -> usize {
    if size > VALUE_INDEX_CUTOFF {
        VALUE_INDEX_CUTOFF + 1
    } else {
        size
    }
}

/// An abbreviation unrolled to a fixed number of value operands, so a
/// single position can be replaced with a literal. The trailing array pair
/// survives only for shapes that can be bigger than the unrolled size.
struct Unrolled {
    code_op: Operand,
    value_ops: Vec<Operand>,
    more_ops: Vec<Operand>,
}

impl Unrolled {
    fn new(abbrev: &Abbreviation, num_values: usize, can_be_bigger: bool) -> Option<Self> {
        let ops = abbrev.ops();
        let mut next = 0usize;
        let mut take = || -> Option<Operand> {
            match ops.get(next)? {
                // The array encodes every remaining value; don't advance.
                Operand::Array => ops.get(next + 1).copied(),
                &op => {
                    next += 1;
                    Some(op)
                }
            }
        };
        let code_op = take()?;
        let mut value_ops = Vec::with_capacity(num_values);
        for _ in 0..num_values {
            value_ops.push(take()?);
        }
        drop(take);
        let more_ops = if can_be_bigger {
            ops[next..].to_vec()
        } else {
            // A fully unrolled array disappears; leftover scalars mean the
            // shape never matched this abbreviation.
            if next < ops.len() && ops[next] != Operand::Array {
                return None;
            }
            Vec::new()
        };
        Some(Self {
            code_op,
            value_ops,
            more_ops,
        })
    }

    fn restore(&self) -> Abbreviation {
        let mut ops = Vec::with_capacity(1 + self.value_ops.len() + self.more_ops.len());
        ops.push(self.code_op);
        ops.extend_from_slice(&self.value_ops);
        ops.extend_from_slice(&self.more_ops);
        Abbreviation::new(ops).simplify()
    }

    fn with_code(&self, code_op: Operand) -> Self {
        Self {
            code_op,
            value_ops: self.value_ops.clone(),
            more_ops: self.more_ops.clone(),
        }
    }

    fn with_value_literal(&self, index: usize, value: u64) -> Self {
        let mut value_ops = self.value_ops.clone();
        value_ops[index] = Operand::Literal(value);
        Self {
            code_op: self.code_op,
            value_ops,
            more_ops: self.more_ops.clone(),
        }
    }
}

/// Analysis output: existing plus candidate abbreviations per block id.
struct AbbrevPools {
    pools: BTreeMap<u32, BlockAbbrevs>,
    dists: BTreeMap<u32, BlockDist>,
}

impl AbbrevPools {
    fn pool(&mut self, block_id: u32) -> &mut BlockAbbrevs {
        self.pools.entry(block_id).or_default()
    }
}

/// Walks a record list resolving each record's bitstream abbreviation
/// index to the internal pool index of the block it appears in.
struct Walk {
    /// Innermost last: (block id, bitstream-to-internal map for locals).
    frames: Vec<(u32, Vec<u32>)>,
    /// BLOCKINFO-inherited abbreviations per block id, in bitstream order.
    globals: HashMap<u32, Vec<u32>>,
    /// Depth of the blockinfo block being traversed, if any.
    in_blockinfo: Option<usize>,
    set_bid: Option<u32>,
}

impl Walk {
    fn new() -> Self {
        Self {
            frames: Vec::new(),
            globals: HashMap::new(),
            in_blockinfo: None,
            set_bid: None,
        }
    }

    fn cur_block_id(&self) -> Option<u32> {
        self.frames.last().map(|f| f.0)
    }

    /// Handle a structural record, returning true when it (or the
    /// blockinfo contents it belongs to) is not a plain data record.
    fn step(&mut self, record: &Record, pools: &mut AbbrevPools) -> Result<bool, Error> {
        match record.code {
            ENTER_BLOCK_CODE => {
                let id = record.values.first().copied().unwrap_or_default() as u32;
                self.frames.push((id, Vec::new()));
                if id == BLOCKINFO_BLOCK_ID && self.in_blockinfo.is_none() {
                    self.in_blockinfo = Some(self.frames.len());
                    self.set_bid = None;
                }
                Ok(true)
            }
            EXIT_BLOCK_CODE => {
                if self.in_blockinfo == Some(self.frames.len()) {
                    self.in_blockinfo = None;
                }
                let _ = self.frames.pop();
                Ok(true)
            }
            DEFINE_ABBREV_CODE => {
                let abbrev = parse_abbrev_record(&record.values)?;
                if self.in_blockinfo.is_some() {
                    let bid = self.set_bid.ok_or(Error::BadAbbrevRecord)?;
                    let internal = pools.pool(bid).add(abbrev);
                    self.globals.entry(bid).or_default().push(internal);
                } else if let Some(frame) = self.frames.last_mut() {
                    let internal = pools.pool(frame.0).add(abbrev);
                    frame.1.push(internal);
                }
                Ok(true)
            }
            HEADER_CODE => Ok(true),
            _ if self.in_blockinfo.is_some() => {
                if record.code == BLOCKINFO_CODE_SETBID {
                    let bid = record.values.first().copied().unwrap_or_default();
                    self.set_bid = u32::try_from(bid).ok();
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Internal pool index for a plain record's bitstream index.
    fn resolve(&self, block_id: u32, abbrev: u32) -> Result<u32, Error> {
        if abbrev <= UNABBREV {
            return Ok(UNABBREV);
        }
        let k = (abbrev - FIRST_APPLICATION_ABBREV) as usize;
        let globals = self
            .globals
            .get(&block_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let internal = if k < globals.len() {
            Some(globals[k])
        } else {
            self.frames
                .last()
                .and_then(|f| f.1.get(k - globals.len()))
                .copied()
        };
        internal.ok_or(Error::BadAbbrevIndex { block_id, abbrev })
    }
}

/// Rebuild an abbreviation from a `DEFINE_ABBREV` record's values.
fn parse_abbrev_record(values: &[u64]) -> Result<Abbreviation, Error> {
    let mut i = 0usize;
    let mut next = || -> Result<u64, Error> {
        let v = values.get(i).copied().ok_or(Error::BadAbbrevRecord)?;
        i += 1;
        Ok(v)
    };
    let num_ops = next()?;
    if num_ops == 0 {
        return Err(Error::BadAbbrevRecord);
    }
    let mut ops = Vec::with_capacity(num_ops.min(64) as usize);
    for _ in 0..num_ops {
        match next()? {
            1 => ops.push(Operand::Literal(next()?)),
            0 => match next()? {
                1 => ops.push(Operand::Fixed(
                    u32::try_from(next()?).map_err(|_| Error::BadAbbrevRecord)?,
                )),
                2 => ops.push(Operand::Vbr(
                    u32::try_from(next()?).map_err(|_| Error::BadAbbrevRecord)?,
                )),
                3 => ops.push(Operand::Array),
                4 => ops.push(Operand::Char6),
                _ => return Err(Error::BadAbbrevRecord),
            },
            _ => return Err(Error::BadAbbrevRecord),
        }
    }
    drop(next);
    if i != values.len() {
        return Err(Error::BadAbbrevRecord);
    }
    let abbrev = Abbreviation::new(ops).simplify();
    abbrev.validate().map_err(|_| Error::BadAbbrevRecord)?;
    Ok(abbrev)
}

/// The default encoding of any record, as an abbreviation: every value
/// (and the code) as VBR6.
fn unabbreviated_shape() -> Abbreviation {
    Abbreviation::new(vec![Operand::Array, Operand::Vbr(6)])
}

/// Pass 1: collect existing abbreviations and the distribution of record
/// shapes, then grow the pools with literalized candidates.
fn analyze(records: &[Record]) -> Result<AbbrevPools, Error> {
    let mut pools = AbbrevPools {
        pools: BTreeMap::new(),
        dists: BTreeMap::new(),
    };
    let mut walk = Walk::new();
    for record in records {
        if walk.step(record, &mut pools)? {
            continue;
        }
        let Some(block_id) = walk.cur_block_id() else {
            continue;
        };
        let internal = walk.resolve(block_id, record.abbrev)?;
        let _ = pools.pool(block_id);
        let size = clamp_size(record.values.len());
        let tracked = size.min(VALUE_INDEX_CUTOFF);
        let shape = pools
            .dists
            .entry(block_id)
            .or_default()
            .shapes
            .entry((internal, record.code, size))
            .or_default();
        shape.count += 1;
        if shape.value_counts.len() < tracked {
            shape.value_counts.resize_with(tracked, HashMap::new);
        }
        for (i, &v) in record.values.iter().take(VALUE_INDEX_CUTOFF).enumerate() {
            *shape.value_counts[i].entry(v).or_default() += 1;
        }
    }

    add_candidates(&mut pools);
    Ok(pools)
}

/// Specialize observed shapes with literal constants: once through the
/// record code, once through the most constant value position.
fn add_candidates(pools: &mut AbbrevPools) {
    let mut candidates: BTreeMap<(u32, Abbreviation), u32> = BTreeMap::new();

    for (&block_id, dist) in &pools.dists {
        let Some(pool) = pools.pools.get(&block_id) else {
            continue;
        };
        for (&(internal, code, size), shape) in &dist.shapes {
            let base = match pool.get(internal) {
                Some(abbrev) => Rc::clone(abbrev),
                None => Rc::new(unabbreviated_shape()),
            };
            let can_be_bigger = size > VALUE_INDEX_CUTOFF;
            let Some(unrolled) =
                Unrolled::new(&base, size.min(VALUE_INDEX_CUTOFF), can_be_bigger)
            else {
                continue;
            };

            if !unrolled.code_op.is_literal() {
                let cand = unrolled.with_code(Operand::Literal(code));
                add_candidate(&mut candidates, pool, block_id, cand.restore(), shape.count);
            }

            // Most frequent single value over the non-literal positions.
            let best = shape
                .value_counts
                .iter()
                .enumerate()
                .filter(|(i, _)| {
                    matches!(unrolled.value_ops.get(*i), Some(op) if !op.is_literal())
                })
                .filter_map(|(i, counts)| counts.iter().map(move |(&v, &n)| (n, i, v)).max())
                .max();
            if let Some((n, i, v)) = best {
                let cand = unrolled.with_value_literal(i, v);
                add_candidate(&mut candidates, pool, block_id, cand.restore(), n);
            }
        }
    }

    // Install, most frequent first; rare refinements are noise.
    let mut ordered: Vec<(u32, (u32, Abbreviation))> = candidates
        .into_iter()
        .map(|(key, count)| (count, key))
        .collect();
    ordered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let Some(&(top, _)) = ordered.first() else {
        return;
    };
    let min = top >> 2;
    for (count, (block_id, abbrev)) in ordered {
        if count < min {
            break;
        }
        debug!("candidate abbreviation (block {block_id}, {count} uses): {abbrev:?}");
        let _ = pools.pool(block_id).add(abbrev);
    }
}

fn add_candidate(
    candidates: &mut BTreeMap<(u32, Abbreviation), u32>,
    pool: &BlockAbbrevs,
    block_id: u32,
    abbrev: Abbreviation,
    count: u32,
) {
    if abbrev.validate().is_err() || pool.find(&abbrev).is_some() {
        return;
    }
    *candidates.entry((block_id, abbrev)).or_default() += count;
}

/// Per-size index of pool entries that might match a record of that size.
/// `matches` still verifies; the index only narrows the search.
struct SizeLookup {
    buckets: Vec<Vec<u32>>,
}

impl SizeLookup {
    fn build(pool: &BlockAbbrevs) -> Self {
        let mut buckets = vec![Vec::new(); VALUE_INDEX_CUTOFF + 2];
        for (i, abbrev) in pool.abbrevs.iter().enumerate() {
            let index = i as u32 + FIRST_APPLICATION_ABBREV;
            let ops = abbrev.ops();
            if let Some(array_at) = ops.iter().position(|op| *op == Operand::Array) {
                // The code consumes one scalar; the array absorbs any
                // number of trailing values.
                let min_values = array_at.saturating_sub(1);
                for bucket in buckets.iter_mut().skip(min_values) {
                    bucket.push(index);
                }
            } else {
                let num_values = ops.len() - 1;
                if num_values <= VALUE_INDEX_CUTOFF {
                    buckets[num_values].push(index);
                } else {
                    buckets[VALUE_INDEX_CUTOFF + 1].push(index);
                }
            }
        }
        Self { buckets }
    }

    fn candidates(&self, num_values: usize) -> &[u32] {
        &self.buckets[clamp_size(num_values)]
    }
}

/// Pass 2a: pick the cheapest applicable abbreviation for every record,
/// in stream order, per block id. Ties break toward the first candidate.
fn choose(
    records: &[Record],
    pools: &mut AbbrevPools,
) -> Result<BTreeMap<u32, Vec<u32>>, Error> {
    let lookups: BTreeMap<u32, SizeLookup> = pools
        .pools
        .iter()
        .map(|(&id, pool)| (id, SizeLookup::build(pool)))
        .collect();

    let mut queues: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut walk = Walk::new();
    let mut scratch = Vec::new();
    for record in records {
        if walk.step(record, pools)? {
            continue;
        }
        let Some(block_id) = walk.cur_block_id() else {
            continue;
        };
        scratch.clear();
        scratch.push(record.code);
        scratch.extend_from_slice(&record.values);

        let mut best = UNABBREV;
        let mut best_bits = unabbreviated_bits(record.code, &record.values);
        if let (Some(pool), Some(lookup)) =
            (pools.pools.get(&block_id), lookups.get(&block_id))
        {
            for &index in lookup.candidates(record.values.len()) {
                let Some(abbrev) = pool.get(index) else {
                    continue;
                };
                if let Some(bits) = abbrev.matches(&scratch) {
                    if bits < best_bits || (bits == best_bits && best == UNABBREV) {
                        best = index;
                        best_bits = bits;
                    }
                }
            }
        }
        queues.entry(block_id).or_default().push(best);
    }
    Ok(queues)
}

/// Pass 2b: drop rarely used abbreviations and renumber the queues to the
/// bitstream indices the writer will assign.
fn keep_frequent(
    pools: &AbbrevPools,
    queues: &mut BTreeMap<u32, Vec<u32>>,
) -> BTreeMap<u32, Vec<Rc<Abbreviation>>> {
    let mut kept: BTreeMap<u32, Vec<Rc<Abbreviation>>> = BTreeMap::new();
    for (&block_id, queue) in queues.iter_mut() {
        let Some(pool) = pools.pools.get(&block_id) else {
            continue;
        };
        let mut usage: BTreeMap<u32, u32> = BTreeMap::new();
        for &index in queue.iter() {
            if index != UNABBREV {
                *usage.entry(index).or_default() += 1;
            }
        }
        let mut remap: HashMap<u32, u32> = HashMap::new();
        let mut abbrevs = Vec::new();
        for (&index, &count) in &usage {
            if count < MIN_USAGE_COUNT {
                continue;
            }
            if let Some(abbrev) = pool.get(index) {
                let _ = remap.insert(index, abbrevs.len() as u32 + FIRST_APPLICATION_ABBREV);
                abbrevs.push(Rc::clone(abbrev));
            }
        }
        for index in queue.iter_mut() {
            *index = remap.get(index).copied().unwrap_or(UNABBREV);
        }
        if !abbrevs.is_empty() {
            let _ = kept.insert(block_id, abbrevs);
        }
    }
    kept
}

/// Pass 2c: rewrite the stream. All kept abbreviations live in one
/// top-level BLOCKINFO block, so every block inherits its table.
fn emit(
    records: &[Record],
    header: &Header,
    kept: &BTreeMap<u32, Vec<Rc<Abbreviation>>>,
    queues: &BTreeMap<u32, Vec<u32>>,
    flags: CompressFlags,
) -> Result<Vec<u8>, Error> {
    let mut writer = BitstreamWriter::new();
    writer.write_header(header);

    if !flags.remove_abbreviations && !kept.is_empty() {
        writer.enter_blockinfo_block();
        for (&block_id, abbrevs) in kept {
            for abbrev in abbrevs {
                let _ = writer.emit_blockinfo_abbrev(block_id, Rc::clone(abbrev))?;
            }
        }
        writer.exit_block();
    }

    let mut cursors: BTreeMap<u32, usize> = BTreeMap::new();
    let mut open_blocks: Vec<u32> = Vec::new();
    let mut depth = 0usize;
    let mut skip_blockinfo_at: Option<usize> = None;
    for record in records {
        match record.code {
            ENTER_BLOCK_CODE => {
                depth += 1;
                if skip_blockinfo_at.is_some() {
                    continue;
                }
                let id = record.values.first().copied().unwrap_or_default() as u32;
                if id == BLOCKINFO_BLOCK_ID {
                    skip_blockinfo_at = Some(depth);
                    continue;
                }
                if flags.remove_abbreviations {
                    writer.enter_subblock(id, CodeSelector::OUTER);
                } else {
                    writer.enter_subblock_default(id);
                }
                open_blocks.push(id);
            }
            EXIT_BLOCK_CODE => {
                if skip_blockinfo_at == Some(depth) {
                    skip_blockinfo_at = None;
                } else if skip_blockinfo_at.is_none() && !open_blocks.is_empty() {
                    writer.exit_block();
                    let _ = open_blocks.pop();
                }
                depth = depth.saturating_sub(1);
            }
            DEFINE_ABBREV_CODE | HEADER_CODE => {}
            _ => {
                if skip_blockinfo_at.is_some() {
                    continue;
                }
                let Some(&block_id) = open_blocks.last() else {
                    continue;
                };
                let chosen = if flags.remove_abbreviations {
                    UNABBREV
                } else {
                    let cursor = cursors.entry(block_id).or_default();
                    let queue = queues.get(&block_id).map(Vec::as_slice).unwrap_or_default();
                    let index = queue.get(*cursor).copied().unwrap_or(UNABBREV);
                    *cursor += 1;
                    index
                };
                if chosen == UNABBREV {
                    writer.emit_unabbrev_record(record.code, &record.values);
                } else {
                    writer.emit_abbrev_record(chosen, record.code, &record.values)?;
                }
            }
        }
    }
    Ok(writer.into_bytes())
}

/// Compress a bitstream: collect candidate abbreviations, choose the best
/// fit for each record, and rewrite the stream with the kept set. Record
/// contents are preserved exactly; only their encodings change.
pub fn compress(bytes: &[u8], flags: CompressFlags) -> Result<Vec<u8>, Error> {
    let mut source = bytes;
    let (header, _) =
        Header::read_from(&mut source).map_err(crate::records::Error::from)?;
    if !header.is_readable() {
        return Err(crate::records::Error::UnreadableHeader.into());
    }
    let records = read_record_list(bytes)?;

    let mut pools = analyze(&records)?;
    let mut queues = choose(&records, &mut pools)?;
    let kept = keep_frequent(&pools, &mut queues);
    emit(&records, &header, &kept, &queues, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::{write_records, WriteFlags};

    /// The payloads an application reader would see: plain records outside
    /// any BLOCKINFO block, as (block id, code, values).
    fn payloads(bytes: &[u8]) -> Vec<(u32, u64, Vec<u64>)> {
        let records = read_record_list(bytes).unwrap();
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut in_blockinfo = 0usize;
        for r in records {
            match r.code {
                ENTER_BLOCK_CODE => {
                    let id = r.values[0] as u32;
                    if id == BLOCKINFO_BLOCK_ID || in_blockinfo > 0 {
                        in_blockinfo += 1;
                    }
                    stack.push(id);
                }
                EXIT_BLOCK_CODE => {
                    in_blockinfo = in_blockinfo.saturating_sub(1);
                    let _ = stack.pop();
                }
                DEFINE_ABBREV_CODE | HEADER_CODE => {}
                _ if in_blockinfo > 0 => {}
                _ => out.push((*stack.last().unwrap(), r.code, r.values)),
            }
        }
        out
    }

    fn repetitive_stream() -> Vec<u8> {
        let mut records = vec![Record::enter_block(8, 2)];
        for i in 0..40 {
            records.push(Record::unabbreviated(5, vec![1, 2, i % 4]));
        }
        for i in 0..10 {
            records.push(Record::unabbreviated(6, vec![i]));
        }
        records.push(Record::exit_block());
        let (bytes, results) = write_records(&records, true, WriteFlags::default());
        assert_eq!(0, results.num_errors);
        bytes
    }

    #[test]
    fn compression_preserves_record_payloads() {
        let input = repetitive_stream();
        let output = compress(&input, CompressFlags::default()).unwrap();
        assert_eq!(output.len() % 4, 0);
        assert_eq!(payloads(&input), payloads(&output));
    }

    #[test]
    fn repeated_records_get_abbreviated() {
        let input = repetitive_stream();
        let output = compress(&input, CompressFlags::default()).unwrap();
        let records = read_record_list(&output).unwrap();
        let abbreviated = records
            .iter()
            .filter(|r| r.code == 5 && r.abbrev >= FIRST_APPLICATION_ABBREV)
            .count();
        assert_eq!(40, abbreviated, "the dominant shape should compress");
        assert!(output.len() < input.len());
    }

    #[test]
    fn rare_shapes_fall_back_to_unabbreviated() {
        // Four instances sit below the usage threshold.
        let mut records = vec![Record::enter_block(8, 2)];
        for _ in 0..4 {
            records.push(Record::unabbreviated(5, vec![1]));
        }
        records.push(Record::exit_block());
        let (input, _) = write_records(&records, true, WriteFlags::default());
        let output = compress(&input, CompressFlags::default()).unwrap();
        let records = read_record_list(&output).unwrap();
        assert!(records.iter().all(|r| r.abbrev <= UNABBREV));
    }

    #[test]
    fn existing_abbreviations_survive_when_still_best() {
        let mut records = vec![
            Record::enter_block(8, 3),
            // [Literal(7), Fixed(4)]
            Record::new(
                2,
                DEFINE_ABBREV_CODE,
                vec![2, 1, 7, 0, 1, 4],
            ),
        ];
        for i in 0..12 {
            records.push(Record::new(4, 7, vec![i % 16]));
        }
        records.push(Record::exit_block());
        let (input, results) = write_records(&records, true, WriteFlags::default());
        assert_eq!(0, results.num_errors);

        let output = compress(&input, CompressFlags::default()).unwrap();
        assert_eq!(payloads(&input), payloads(&output));
        // One record is claimed by a literal-pair candidate that gets
        // pruned, so it falls back to unabbreviated form.
        let out_records = read_record_list(&output).unwrap();
        let abbreviated = out_records
            .iter()
            .filter(|r| r.code == 7 && r.abbrev >= FIRST_APPLICATION_ABBREV)
            .count();
        assert_eq!(11, abbreviated);
    }

    #[test]
    fn remove_abbreviations_mode_strips_everything() {
        let input = repetitive_stream();
        let compressed = compress(&input, CompressFlags::default()).unwrap();
        let flags = CompressFlags {
            remove_abbreviations: true,
        };
        let stripped = compress(&compressed, flags).unwrap();
        let records = read_record_list(&stripped).unwrap();
        assert!(records.iter().all(|r| r.abbrev <= UNABBREV));
        assert_eq!(payloads(&input), payloads(&stripped));
    }
}
