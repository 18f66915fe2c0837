use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::error;

use crate::bits::BitWriter;
use crate::bitstream::{
    Abbreviation, AbbrevError, BuiltinAbbrevId, CodeSelector, Operand, bits_needed, encode_char6,
    BLOCKINFO_BLOCK_ID, BLOCKINFO_CODE_SETBID, BLOCK_ID_WIDTH, BLOCK_SIZE_WIDTH, CODE_LEN_WIDTH,
    DEFAULT_MAX_ABBREV, FIRST_APPLICATION_ABBREV, MAX_ABBREV_WIDTH, MIN_ABBREV_WIDTH,
};
use crate::header::Header;
use crate::records::{
    Record, DEFINE_ABBREV_CODE, ENTER_BLOCK_CODE, EXIT_BLOCK_CODE, HEADER_CODE,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no abbreviation at index {0} in current block")]
    NoSuchAbbrev(u32),
    #[error("record does not match abbreviation operands")]
    AbbrevMismatch,
    #[error(transparent)]
    Abbrev(#[from] AbbrevError),
}

struct WriterScope {
    prev_selector: CodeSelector,
    prev_abbrevs: Vec<Rc<Abbreviation>>,
    /// Word index of the reserved block-length slot.
    start_size_word: usize,
    /// Exclusive upper bound for abbreviation indices in this block.
    abbrev_index_limit: u64,
}

/// Mirror of the reader: emits codes at the current block's width, tracks
/// scopes with backpatched word lengths, and owns the BLOCKINFO tables it
/// emits so nested blocks inherit their abbreviations.
#[derive(Default)]
pub struct BitstreamWriter {
    bits: BitWriter,
    selector: CodeSelector,
    abbrevs: Vec<Rc<Abbreviation>>,
    scopes: Vec<WriterScope>,
    blockinfo: HashMap<u32, Vec<Rc<Abbreviation>>>,
    blockinfo_cur_bid: Option<u32>,
}

impl BitstreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the stream header; only sensible before any block.
    pub fn write_header(&mut self, header: &Header) {
        debug_assert!(self.scopes.is_empty());
        header
            .write_to(&mut self.bits)
            .expect("constructed headers are encodable");
    }

    pub fn current_bit_no(&self) -> u64 {
        self.bits.current_bit_no()
    }

    /// Largest abbreviation index currently defined.
    pub fn max_cur_abbrev_index(&self) -> u64 {
        self.abbrevs.len() as u64 + u64::from(DEFAULT_MAX_ABBREV)
    }

    fn abbrev_index_limit(&self) -> u64 {
        self.scopes
            .last()
            .map(|s| s.abbrev_index_limit)
            .unwrap_or_else(|| self.selector.abbrev_index_limit() + 1)
    }

    pub fn get_abbreviation(&self, index: u32) -> Option<&Rc<Abbreviation>> {
        if u64::from(index) >= self.abbrev_index_limit() {
            return None;
        }
        let i = index.checked_sub(FIRST_APPLICATION_ABBREV)?;
        self.abbrevs.get(i as usize)
    }

    pub fn is_user_record_abbreviation(&self, index: u32) -> bool {
        self.get_abbreviation(index).is_some()
    }

    /// Emit an abbreviation index or builtin code at the current width.
    pub fn emit_code(&mut self, code: u32) {
        if self.selector.is_fixed {
            self.bits.emit(code, self.selector.num_bits);
        } else {
            self.bits.emit_vbr(code, self.selector.num_bits);
        }
    }

    /// Emit a deliberately out-of-range abbreviation index, masked to the
    /// field width; reader fuzz tests depend on the stream staying decodable
    /// up to this point.
    pub fn emit_bad_abbrev_index(&mut self, index: u32) {
        let masked = if self.selector.num_bits == 32 {
            index
        } else {
            index & ((1 << self.selector.num_bits) - 1)
        };
        self.bits.emit(masked, self.selector.num_bits);
    }

    /// Open a block: code, VBR8 id, VBR4 width, align, then a length slot
    /// that `exit_block` backpatches. Inherited BLOCKINFO abbreviations are
    /// installed ahead of any locals.
    pub fn enter_subblock(&mut self, block_id: u32, selector: CodeSelector) {
        debug_assert!(selector.is_fixed, "block code widths are fixed");
        self.emit_code(BuiltinAbbrevId::EnterSubblock as u32);
        self.bits.emit_vbr(block_id, BLOCK_ID_WIDTH);
        self.bits.emit_vbr(selector.num_bits, CODE_LEN_WIDTH);
        self.bits.flush_to_word();

        let start_size_word = self.bits.word_index();
        self.bits.emit(0, BLOCK_SIZE_WIDTH);

        let mut abbrevs = self
            .blockinfo
            .get(&block_id)
            .cloned()
            .unwrap_or_default();
        std::mem::swap(&mut abbrevs, &mut self.abbrevs);
        self.scopes.push(WriterScope {
            prev_selector: self.selector,
            prev_abbrevs: abbrevs,
            start_size_word,
            abbrev_index_limit: 1u64 << selector.num_bits,
        });
        self.selector = selector;
    }

    /// Open a block wide enough for its inherited abbreviations.
    pub fn enter_subblock_default(&mut self, block_id: u32) {
        let inherited = self.blockinfo.get(&block_id).map_or(0, Vec::len) as u64;
        let selector =
            CodeSelector::for_max_abbrev(u64::from(DEFAULT_MAX_ABBREV) + inherited);
        self.enter_subblock(block_id, selector);
    }

    pub fn enter_blockinfo_block(&mut self) {
        self.enter_subblock_default(BLOCKINFO_BLOCK_ID);
        self.blockinfo_cur_bid = None;
    }

    /// Close the current block and backpatch its word length.
    pub fn exit_block(&mut self) {
        let scope = self.scopes.pop().expect("block scope imbalance");
        self.emit_code(BuiltinAbbrevId::EndBlock as u32);
        self.bits.flush_to_word();

        let size_in_words = self.bits.word_index() - scope.start_size_word - 1;
        self.bits
            .backpatch_word(scope.start_size_word * 4, size_in_words as u32);

        self.selector = scope.prev_selector;
        self.abbrevs = scope.prev_abbrevs;
    }

    pub fn emit_unabbrev_record(&mut self, code: u64, values: &[u64]) {
        self.emit_code(BuiltinAbbrevId::UnabbrevRecord as u32);
        self.bits.emit_vbr64(code, 6);
        self.bits.emit_vbr(values.len() as u32, 6);
        for &v in values {
            self.bits.emit_vbr64(v, 6);
        }
    }

    fn emit_scalar(&mut self, op: Operand, v: u64) {
        match op {
            Operand::Literal(_) => {}
            Operand::Fixed(0) | Operand::Vbr(0) => {}
            Operand::Fixed(w) => self.bits.emit(v as u32, w),
            Operand::Vbr(w) => self.bits.emit_vbr64(v, w),
            Operand::Char6 => {
                let c = encode_char6(v).expect("checked against abbreviation");
                self.bits.emit(c, 6);
            }
            Operand::Array => unreachable!("array is not a scalar operand"),
        }
    }

    /// Emit a record through the abbreviation at `abbrev_id`. The record is
    /// checked against the operands first so a mismatch emits nothing.
    pub fn emit_abbrev_record(
        &mut self,
        abbrev_id: u32,
        code: u64,
        values: &[u64],
    ) -> Result<(), Error> {
        let abbrev = self
            .get_abbreviation(abbrev_id)
            .cloned()
            .ok_or(Error::NoSuchAbbrev(abbrev_id))?;
        let mut all = Vec::with_capacity(values.len() + 1);
        all.push(code);
        all.extend_from_slice(values);
        if abbrev.matches(&all).is_none() {
            return Err(Error::AbbrevMismatch);
        }

        self.emit_code(abbrev_id);
        let ops = abbrev.ops();
        let mut vi = 0usize;
        let mut oi = 0usize;
        while oi < ops.len() {
            if ops[oi] == Operand::Array {
                let elt = ops[oi + 1];
                self.bits.emit_vbr((all.len() - vi) as u32, 6);
                while vi < all.len() {
                    self.emit_scalar(elt, all[vi]);
                    vi += 1;
                }
                break;
            }
            self.emit_scalar(ops[oi], all[vi]);
            vi += 1;
            oi += 1;
        }
        Ok(())
    }

    fn encode_abbrev_def(&mut self, abbrev: &Abbreviation) {
        self.emit_code(BuiltinAbbrevId::DefineAbbrev as u32);
        self.bits.emit_vbr(abbrev.ops().len() as u32, 5);
        for op in abbrev.ops() {
            match *op {
                Operand::Literal(v) => {
                    self.bits.emit(1, 1);
                    self.bits.emit_vbr64(v, 8);
                }
                op => {
                    self.bits.emit(0, 1);
                    self.bits.emit(op.encoded_kind(), 3);
                    if let Operand::Fixed(w) | Operand::Vbr(w) = op {
                        self.bits.emit_vbr64(u64::from(w), 5);
                    }
                }
            }
        }
    }

    /// Define an abbreviation in the current block. Returns its index.
    pub fn emit_abbrev(&mut self, abbrev: Rc<Abbreviation>) -> Result<u32, Error> {
        abbrev.validate()?;
        self.encode_abbrev_def(&abbrev);
        self.abbrevs.push(abbrev);
        Ok(self.abbrevs.len() as u32 - 1 + FIRST_APPLICATION_ABBREV)
    }

    /// Define an abbreviation for all later blocks with `block_id`; only
    /// meaningful inside a BLOCKINFO block. Emits a SETBID record when the
    /// target block changes.
    pub fn emit_blockinfo_abbrev(
        &mut self,
        block_id: u32,
        abbrev: Rc<Abbreviation>,
    ) -> Result<u32, Error> {
        abbrev.validate()?;
        if self.blockinfo_cur_bid != Some(block_id) {
            self.emit_unabbrev_record(BLOCKINFO_CODE_SETBID, &[u64::from(block_id)]);
            self.blockinfo_cur_bid = Some(block_id);
        }
        self.encode_abbrev_def(&abbrev);
        let info = self.blockinfo.entry(block_id).or_default();
        info.push(abbrev);
        Ok(info.len() as u32 - 1 + FIRST_APPLICATION_ABBREV)
    }

    pub fn flush_to_word(&mut self) {
        self.bits.flush_to_word();
    }

    pub fn bytes(&self) -> &[u8] {
        self.bits.bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.scopes.is_empty(), "block scope imbalance");
        self.bits.into_bytes()
    }
}

/// Options for writing a record list back into a bitstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFlags {
    /// Replace invalid emissions with best-effort valid ones.
    pub try_to_recover: bool,
    /// Emit one invalid abbreviation index, then close the stream cleanly,
    /// so readers can be tested against the error.
    pub write_bad_abbrev_index: bool,
}

impl WriteFlags {
    pub fn recovering() -> Self {
        Self {
            try_to_recover: true,
            write_bad_abbrev_index: false,
        }
    }
}

/// Outcome counters for a record-list write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResults {
    pub num_errors: usize,
    pub num_repairs: usize,
    pub wrote_bad_abbrev_index: bool,
}

impl WriteResults {
    /// Whether the produced stream can be trusted under `flags`.
    pub fn succeeded(&self, flags: &WriteFlags) -> bool {
        self.num_errors == 0
            || (flags.try_to_recover && self.num_errors == self.num_repairs)
    }
}

/// The block id reported for records outside any block, and used for the
/// synthetic block wrapped around them during recovery.
const UNKNOWN_BLOCK_ID: u32 = u32::MAX;

struct WriteState {
    writer: BitstreamWriter,
    flags: WriteFlags,
    results: WriteResults,
    /// Innermost frame last; the bottom frame is the outermost scope.
    scopes: Vec<(Option<u32>, u64)>,
    set_bid: Option<u64>,
}

impl WriteState {
    fn new(flags: WriteFlags) -> Self {
        debug_assert!(!(flags.try_to_recover && flags.write_bad_abbrev_index));
        Self {
            writer: BitstreamWriter::new(),
            flags,
            results: WriteResults::default(),
            scopes: vec![(None, u64::from(DEFAULT_MAX_ABBREV))],
            set_bid: None,
        }
    }

    fn at_outermost_scope(&self) -> bool {
        self.scopes.len() == 1
    }

    fn cur_block_id(&self) -> Option<u32> {
        self.scopes.last().and_then(|s| s.0)
    }

    fn block_label(&self) -> String {
        match self.cur_block_id() {
            Some(UNKNOWN_BLOCK_ID) | None => "unknown".to_string(),
            Some(id) => id.to_string(),
        }
    }

    fn error(&mut self, message: &str, record: Option<&Record>) {
        self.results.num_errors += 1;
        match record {
            Some(record) => {
                error!("Error (Block {}): {message}: {record}", self.block_label());
            }
            None => error!("Error (Block {}): {message}", self.block_label()),
        }
    }

    fn recoverable_error(&mut self, message: &str, record: Option<&Record>) {
        if self.flags.try_to_recover {
            self.results.num_repairs += 1;
        }
        self.error(message, record);
    }

    fn enter_block(&mut self, block_id: u64, num_bits: u64, record: &Record) -> bool {
        let mut num_bits = num_bits;
        if !(u64::from(MIN_ABBREV_WIDTH)..=u64::from(MAX_ABBREV_WIDTH)).contains(&num_bits) {
            self.recoverable_error(
                &format!(
                    "block code width {num_bits} invalid, must be in \
                     [{MIN_ABBREV_WIDTH}..{MAX_ABBREV_WIDTH}]"
                ),
                Some(record),
            );
            if !self.flags.try_to_recover {
                return false;
            }
            num_bits = u64::from(MAX_ABBREV_WIDTH);
        }
        let block_id = match u32::try_from(block_id) {
            Ok(id) => id,
            Err(_) => {
                self.recoverable_error("block id too large", Some(record));
                if !self.flags.try_to_recover {
                    return false;
                }
                UNKNOWN_BLOCK_ID
            }
        };

        let max_abbrev = (1u64 << num_bits) - 1;
        self.scopes.push((Some(block_id), max_abbrev));
        if block_id == BLOCKINFO_BLOCK_ID {
            let default_bits = bits_needed(u64::from(DEFAULT_MAX_ABBREV));
            if num_bits != u64::from(default_bits) {
                self.recoverable_error(
                    &format!("BLOCKINFO code width must be {default_bits}, found {num_bits}"),
                    Some(record),
                );
                if !self.flags.try_to_recover {
                    return false;
                }
            }
            self.writer.enter_blockinfo_block();
        } else {
            self.writer.enter_subblock(
                block_id,
                CodeSelector {
                    is_fixed: true,
                    num_bits: num_bits as u32,
                },
            );
        }
        true
    }

    fn exit_block(&mut self) -> bool {
        if self.at_outermost_scope() {
            return false;
        }
        self.writer.exit_block();
        self.scopes.pop();
        true
    }

    /// Convert a `DEFINE_ABBREV` record's values back to an abbreviation.
    /// Malformed definitions are recoverable by dropping the definition.
    fn build_abbrev(&mut self, record: &Record) -> Option<Abbreviation> {
        let values = &record.values;
        let mut index = 0usize;
        let mut next = |state: &mut Self, what: &str| -> Option<u64> {
            match values.get(index) {
                Some(&v) => {
                    index += 1;
                    Some(v)
                }
                None => {
                    state.recoverable_error(
                        &format!("malformed {what} abbreviation"),
                        Some(record),
                    );
                    None
                }
            }
        };
        let num_ops = next(self, "truncated")?;
        if num_ops == 0 {
            self.recoverable_error(
                "abbreviation must contain at least one operand",
                Some(record),
            );
            return None;
        }
        let mut ops = Vec::new();
        for _ in 0..num_ops {
            match next(self, "truncated")? {
                1 => ops.push(Operand::Literal(next(self, "literal")?)),
                0 => match next(self, "untagged")? {
                    1 => {
                        let w = next(self, "fixed")?;
                        match u32::try_from(w).ok().filter(|&w| w <= MAX_ABBREV_WIDTH) {
                            Some(w) => ops.push(Operand::Fixed(w)),
                            None => {
                                self.recoverable_error(
                                    "fixed width out of range",
                                    Some(record),
                                );
                                return None;
                            }
                        }
                    }
                    2 => {
                        let w = next(self, "vbr")?;
                        match u32::try_from(w)
                            .ok()
                            .filter(|&w| w <= MAX_ABBREV_WIDTH && w != 1)
                        {
                            Some(w) => ops.push(Operand::Vbr(w)),
                            None => {
                                self.recoverable_error("vbr width out of range", Some(record));
                                return None;
                            }
                        }
                    }
                    3 => ops.push(Operand::Array),
                    4 => ops.push(Operand::Char6),
                    kind => {
                        self.recoverable_error(
                            &format!("unknown abbreviation operand kind {kind}"),
                            Some(record),
                        );
                        return None;
                    }
                },
                flag => {
                    self.recoverable_error(
                        &format!("bad abbreviation literal flag {flag}"),
                        Some(record),
                    );
                    return None;
                }
            }
        }
        if index != values.len() {
            self.recoverable_error("trailing abbreviation operands", Some(record));
            return None;
        }
        let abbrev = Abbreviation::new(ops).simplify();
        if let Err(err) = abbrev.validate() {
            self.recoverable_error(&err.to_string(), Some(record));
            return None;
        }
        Some(abbrev)
    }

    /// Emit one record. Returns false when writing cannot continue.
    fn emit_record(&mut self, record: &Record) -> bool {
        match record.code {
            ENTER_BLOCK_CODE => {
                if record.abbrev != BuiltinAbbrevId::EnterSubblock as u32 {
                    self.recoverable_error(
                        "illegal abbreviation index in enter-block record",
                        Some(record),
                    );
                    if !self.flags.try_to_recover {
                        return false;
                    }
                }
                if record.values.len() != 2 {
                    self.recoverable_error(
                        &format!(
                            "enter-block record expects 2 values, found {}",
                            record.values.len()
                        ),
                        Some(record),
                    );
                    if !self.flags.try_to_recover {
                        return false;
                    }
                }
                let block_id = record.values.first().copied().unwrap_or(u64::from(UNKNOWN_BLOCK_ID));
                let num_bits = record
                    .values
                    .get(1)
                    .copied()
                    .unwrap_or(u64::from(MAX_ABBREV_WIDTH));
                self.enter_block(block_id, num_bits, record)
            }
            EXIT_BLOCK_CODE => {
                if self.at_outermost_scope() {
                    self.recoverable_error("extraneous exit block", Some(record));
                    return self.flags.try_to_recover;
                }
                if record.abbrev != BuiltinAbbrevId::EndBlock as u32 {
                    self.recoverable_error(
                        "illegal abbreviation index in exit-block record",
                        Some(record),
                    );
                    if !self.flags.try_to_recover {
                        return false;
                    }
                }
                if !record.values.is_empty() {
                    self.recoverable_error("exit block should not have values", Some(record));
                    if !self.flags.try_to_recover {
                        return false;
                    }
                }
                if !self.exit_block() {
                    self.error("failed to write exit block", Some(record));
                    return false;
                }
                true
            }
            DEFINE_ABBREV_CODE => {
                if record.abbrev != BuiltinAbbrevId::DefineAbbrev as u32 {
                    self.recoverable_error(
                        "illegal abbreviation index in define-abbreviation record",
                        Some(record),
                    );
                    if !self.flags.try_to_recover {
                        return false;
                    }
                }
                let in_blockinfo = self.cur_block_id() == Some(BLOCKINFO_BLOCK_ID);
                let limit = self.scopes.last().map(|s| s.1).unwrap_or_default();
                if !in_blockinfo && self.writer.max_cur_abbrev_index() >= limit {
                    self.recoverable_error(
                        &format!("exceeds abbreviation index limit of {limit}"),
                        Some(record),
                    );
                    // Recover by not writing the definition.
                    return self.flags.try_to_recover;
                }
                let Some(abbrev) = self.build_abbrev(record) else {
                    return self.flags.try_to_recover;
                };
                let abbrev = Rc::new(abbrev);
                let result = if in_blockinfo {
                    let bid = self
                        .set_bid
                        .and_then(|v| u32::try_from(v).ok())
                        .unwrap_or(UNKNOWN_BLOCK_ID);
                    self.writer.emit_blockinfo_abbrev(bid, abbrev)
                } else {
                    self.writer.emit_abbrev(abbrev)
                };
                if let Err(err) = result {
                    self.recoverable_error(&err.to_string(), Some(record));
                    return self.flags.try_to_recover;
                }
                true
            }
            HEADER_CODE => {
                // No abbreviation index on the wire; raw bytes only.
                for &v in &record.values {
                    if v > 0xff {
                        self.recoverable_error("header byte out of range", Some(record));
                        if !self.flags.try_to_recover {
                            return false;
                        }
                    }
                    self.writer.bits.emit((v & 0xff) as u32, 8);
                }
                true
            }
            _ => self.emit_plain_record(record),
        }
    }

    fn emit_plain_record(&mut self, record: &Record) -> bool {
        let mut uses_default = record.abbrev == BuiltinAbbrevId::UnabbrevRecord as u32;
        if self.at_outermost_scope() {
            self.recoverable_error("record outside block", Some(record));
            if !self.flags.try_to_recover {
                return false;
            }
            // Synthetic block to hold the stray record.
            if !self.enter_block(
                u64::from(UNKNOWN_BLOCK_ID),
                u64::from(DEFAULT_MAX_ABBREV),
                record,
            ) {
                self.error("failed to recover from record outside block", Some(record));
                return false;
            }
            uses_default = true;
        }

        if !uses_default && !self.writer.is_user_record_abbreviation(record.abbrev) {
            if self.flags.write_bad_abbrev_index {
                self.error("illegal abbreviation index", Some(record));
                self.results.wrote_bad_abbrev_index = true;
                self.writer.emit_bad_abbrev_index(record.abbrev);
                self.finish(true);
                return false;
            }
            self.recoverable_error("illegal abbreviation index", Some(record));
            if !self.flags.try_to_recover {
                return false;
            }
            uses_default = true;
        }

        if self.cur_block_id() == Some(BLOCKINFO_BLOCK_ID)
            && record.code == BLOCKINFO_CODE_SETBID
        {
            // The writer emits SETBID itself when abbreviations switch
            // blocks; only the target needs recording.
            if record.values.len() != 1 {
                self.error(
                    &format!(
                        "SETBID record expects 1 value, found {}",
                        record.values.len()
                    ),
                    Some(record),
                );
                return false;
            }
            self.set_bid = Some(record.values[0]);
            return true;
        }

        if uses_default {
            self.writer.emit_unabbrev_record(record.code, &record.values);
            return true;
        }
        match self
            .writer
            .emit_abbrev_record(record.abbrev, record.code, &record.values)
        {
            Ok(()) => true,
            Err(err) => {
                self.recoverable_error(&err.to_string(), Some(record));
                if !self.flags.try_to_recover {
                    return false;
                }
                self.writer.emit_unabbrev_record(record.code, &record.values);
                true
            }
        }
    }

    fn finish(&mut self, recover_silently: bool) {
        while !self.at_outermost_scope() {
            if !recover_silently {
                self.recoverable_error("missing close block", None);
            }
            if !self.exit_block() {
                self.error("failed to add missing close block at end of file", None);
                break;
            }
        }
        if self.writer.current_bit_no() % 32 != 0 {
            if !recover_silently {
                self.recoverable_error("written bitstream not word aligned", None);
            }
            // Forced so the output stays well formed.
            self.writer.flush_to_word();
        }
    }
}

/// Write a sequence of records as a bitstream, optionally prefixed with the
/// standard header, applying the recovery policy in `flags`.
pub fn write_records<'a, I>(records: I, add_header: bool, flags: WriteFlags) -> (Vec<u8>, WriteResults)
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut state = WriteState::new(flags);
    if add_header {
        state.writer.write_header(&Header::standard());
    }
    for record in records {
        if !state.emit_record(record) {
            break;
        }
    }
    let silently = state.results.num_errors > 0 && !flags.try_to_recover;
    state.finish(silently);
    let results = state.results;
    (state.writer.into_bytes(), results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::{AdvanceFlags, BitstreamReader, Entry};

    #[test]
    fn writes_word_aligned_streams() {
        let records = [
            Record::enter_block(8, 2),
            Record::unabbreviated(1, vec![0, 0]),
            Record::exit_block(),
        ];
        let (bytes, results) = write_records(&records, true, WriteFlags::default());
        assert_eq!(results, WriteResults::default());
        assert_eq!(bytes.len() % 4, 0);
    }

    #[test]
    fn abbreviated_emission_round_trips() {
        let mut w = BitstreamWriter::new();
        w.enter_subblock(
            9,
            CodeSelector {
                is_fixed: true,
                num_bits: 3,
            },
        );
        let abbrev = Rc::new(Abbreviation::new(vec![
            Operand::Literal(4),
            Operand::Vbr(6),
            Operand::Array,
            Operand::Char6,
        ]));
        let index = w.emit_abbrev(abbrev).unwrap();
        assert_eq!(FIRST_APPLICATION_ABBREV, index);
        w.emit_abbrev_record(index, 4, &[65, u64::from(b'h'), u64::from(b'i')])
            .unwrap();
        assert_eq!(
            Err(Error::AbbrevMismatch),
            w.emit_abbrev_record(index, 5, &[65]),
        );
        w.exit_block();
        let bytes = w.into_bytes();

        let mut r = BitstreamReader::new(bytes.as_slice());
        assert_eq!(Entry::SubBlock(9), r.advance(AdvanceFlags::empty()).unwrap());
        r.enter_block(9).unwrap();
        let Entry::Record(aid) = r.advance(AdvanceFlags::empty()).unwrap() else {
            panic!("expected record");
        };
        assert_eq!(index, aid);
        assert_eq!(
            (4, vec![65, u64::from(b'h'), u64::from(b'i')]),
            r.read_record(aid).unwrap()
        );
        assert_eq!(Entry::EndBlock, r.advance(AdvanceFlags::empty()).unwrap());
    }

    #[test]
    fn blockinfo_abbrevs_are_inherited_by_writer_scopes() {
        let mut w = BitstreamWriter::new();
        w.enter_blockinfo_block();
        let abbrev = Rc::new(Abbreviation::new(vec![
            Operand::Literal(2),
            Operand::Fixed(8),
        ]));
        let index = w.emit_blockinfo_abbrev(12, abbrev).unwrap();
        assert_eq!(FIRST_APPLICATION_ABBREV, index);
        w.exit_block();
        w.enter_subblock(
            12,
            CodeSelector {
                is_fixed: true,
                num_bits: 3,
            },
        );
        w.emit_abbrev_record(index, 2, &[200]).unwrap();
        w.exit_block();
        let bytes = w.into_bytes();

        let mut r = BitstreamReader::new(bytes.as_slice());
        assert_eq!(Entry::SubBlock(0), r.advance(AdvanceFlags::empty()).unwrap());
        r.read_blockinfo_block().unwrap();
        assert_eq!(1, r.blockinfo_abbrevs(12).len());
        assert_eq!(Entry::SubBlock(12), r.advance(AdvanceFlags::empty()).unwrap());
        r.enter_block(12).unwrap();
        let Entry::Record(aid) = r.advance(AdvanceFlags::empty()).unwrap() else {
            panic!("expected record");
        };
        assert_eq!((2, vec![200]), r.read_record(aid).unwrap());
        assert_eq!(Entry::EndBlock, r.advance(AdvanceFlags::empty()).unwrap());
        assert!(r.at_end());
    }

    #[test]
    fn recovery_clamps_bad_code_width() {
        let records = [
            Record::enter_block(8, 40),
            Record::unabbreviated(1, vec![7]),
            Record::exit_block(),
        ];
        let flags = WriteFlags::recovering();
        let (bytes, results) = write_records(&records, true, flags);
        assert_eq!(1, results.num_errors);
        assert_eq!(1, results.num_repairs);
        assert!(results.succeeded(&flags));

        let list = crate::records::read_record_list(&bytes).unwrap();
        assert_eq!(
            list,
            vec![
                Record::enter_block(8, 32),
                Record::unabbreviated(1, vec![7]),
                Record::exit_block(),
            ]
        );
    }

    #[test]
    fn default_mode_aborts_on_error() {
        let records = [Record::enter_block(8, 40)];
        let (_, results) = write_records(&records, true, WriteFlags::default());
        assert_eq!(1, results.num_errors);
        assert_eq!(0, results.num_repairs);
        assert!(!results.succeeded(&WriteFlags::default()));
    }

    #[test]
    fn recovery_closes_unbalanced_blocks() {
        let records = [
            Record::enter_block(8, 2),
            Record::unabbreviated(1, vec![]),
        ];
        let flags = WriteFlags::recovering();
        let (bytes, results) = write_records(&records, true, flags);
        assert!(results.succeeded(&flags));
        assert_eq!(1, results.num_repairs);
        let list = crate::records::read_record_list(&bytes).unwrap();
        assert_eq!(
            list,
            vec![
                Record::enter_block(8, 2),
                Record::unabbreviated(1, vec![]),
                Record::exit_block(),
            ]
        );
    }

    #[test]
    fn stray_record_is_wrapped_in_a_synthetic_block() {
        let records = [Record::unabbreviated(1, vec![0, 0])];
        let flags = WriteFlags::recovering();
        let (bytes, results) = write_records(&records, true, flags);
        assert!(results.succeeded(&flags));
        let list = crate::records::read_record_list(&bytes).unwrap();
        assert_eq!(3, list.len());
        assert!(list[0].is_enter_block());
        assert_eq!(u64::from(u32::MAX), list[0].values[0]);
        assert_eq!(Record::unabbreviated(1, vec![0, 0]), list[1]);
        assert!(list[2].is_exit_block());
    }

    #[test]
    fn bad_abbrev_index_mode_emits_once_and_closes() {
        let records = [
            Record::enter_block(8, 3),
            Record::new(6, 1, vec![2]),
            Record::unabbreviated(1, vec![3]),
        ];
        let flags = WriteFlags {
            write_bad_abbrev_index: true,
            ..WriteFlags::default()
        };
        let (bytes, results) = write_records(&records, true, flags);
        assert!(results.wrote_bad_abbrev_index);
        assert_eq!(1, results.num_errors);
        assert_eq!(bytes.len() % 4, 0);
        // The reader sees the invalid index and reports it.
        assert!(crate::records::read_record_list(&bytes).is_err());
    }
}
