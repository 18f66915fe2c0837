use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;

use crate::bits::{self, BitReader, MemoryObject};
use crate::bitstream::{
    Abbreviation, AbbrevError, BuiltinAbbrevId, CodeSelector, Operand, decode_char6,
    BLOCKINFO_BLOCK_ID, BLOCKINFO_CODE_SETBID, BLOCK_ID_WIDTH, BLOCK_SIZE_WIDTH, CODE_LEN_WIDTH,
    FIRST_APPLICATION_ABBREV, MAX_ABBREV_WIDTH, MIN_ABBREV_WIDTH,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Bits(#[from] bits::Error),
    #[error("stream ended inside an entry")]
    TruncatedStream,
    #[error("vbr value wider than 64 bits")]
    VbrOverflow,
    #[error("block code width {0} out of range")]
    BadCodeWidth(u32),
    #[error("end block at top level")]
    ExtraEndBlock,
    #[error("no such abbreviation `{abbrev_id}` in block `{block_id}`")]
    NoSuchAbbrev { block_id: u32, abbrev_id: u32 },
    #[error("unknown abbreviation operand encoding `{0}`")]
    BadAbbrevEncoding(u32),
    #[error("invalid char6 value")]
    BadChar6,
    #[error(transparent)]
    Abbrev(#[from] AbbrevError),
    #[error("abbreviation defined before any SETBID record")]
    MissingSetBid,
    #[error("malformed SETBID record")]
    BadSetBid,
    #[error("abbreviated record produced no code")]
    EmptyAbbreviatedRecord,
    #[error("block skip runs past end of stream")]
    BadSkip,
    #[error("missing end block for block `{0}`")]
    MissingEndBlock(u32),
}

bitflags! {
    /// Modifiers for [`BitstreamReader::advance`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AdvanceFlags: u32 {
        /// Do not pop the block scope when an end-of-block is reached.
        const DONT_POP_BLOCK_AT_END = 1;
        /// Surface `DEFINE_ABBREV` as a record instead of processing it.
        const DONT_AUTOPROCESS_ABBREVS = 2;
    }
}

/// One step of the reader event stream. Malformed structure surfaces as the
/// `Err` arm of [`BitstreamReader::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// The current block closed (scope already popped unless suppressed).
    EndBlock,
    /// Start of a subblock; enter, skip, or descend.
    SubBlock(u32),
    /// A record headed by this abbreviation index; the caller must consume
    /// it with `read_record` or `skip_record` before advancing.
    Record(u32),
}

struct Scope {
    block_id: u32,
    prev_selector: CodeSelector,
    prev_abbrevs: Vec<Rc<Abbreviation>>,
}

/// Forward cursor over a frozen bitcode stream: tracks the current code
/// width, the per-block abbreviation table, and the abbreviations inherited
/// through BLOCKINFO.
pub struct BitstreamReader<M> {
    bits: BitReader<M>,
    selector: CodeSelector,
    abbrevs: Vec<Rc<Abbreviation>>,
    scopes: Vec<Scope>,
    blockinfo: HashMap<u32, Vec<Rc<Abbreviation>>>,
    blockinfo_read: bool,
}

impl<M: MemoryObject> BitstreamReader<M> {
    pub fn new(source: M) -> Self {
        Self::with_initial_address(source, 0)
    }

    /// Start past a header at word-aligned byte offset `initial_address`.
    pub fn with_initial_address(source: M, initial_address: u64) -> Self {
        Self {
            bits: BitReader::with_initial_address(source, initial_address),
            selector: CodeSelector::OUTER,
            abbrevs: Vec::new(),
            scopes: Vec::new(),
            blockinfo: HashMap::new(),
            blockinfo_read: false,
        }
    }

    pub fn current_bit_no(&self) -> u64 {
        self.bits.current_bit_no()
    }

    pub fn at_end(&mut self) -> bool {
        self.bits.at_end()
    }

    /// Width of the abbreviation-index field in the current scope.
    pub fn code_width(&self) -> u32 {
        self.selector.num_bits
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn current_block_id(&self) -> Option<u32> {
        self.scopes.last().map(|s| s.block_id)
    }

    /// Whether a BLOCKINFO block has already been parsed; later ones skip.
    pub fn blockinfo_read(&self) -> bool {
        self.blockinfo_read
    }

    pub fn blockinfo_abbrevs(&self, block_id: u32) -> &[Rc<Abbreviation>] {
        self.blockinfo
            .get(&block_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn check_bits(&self) -> Result<(), Error> {
        if self.bits.ran_off_end() {
            return Err(Error::TruncatedStream);
        }
        if self.bits.vbr_overflowed() {
            return Err(Error::VbrOverflow);
        }
        Ok(())
    }

    fn read_code(&mut self) -> u32 {
        if self.selector.is_fixed {
            self.bits.read(self.selector.num_bits) as u32
        } else {
            self.bits.read_vbr(self.selector.num_bits)
        }
    }

    /// Produce the next entry. `DEFINE_ABBREV` is appended to the current
    /// scope and skipped over unless `DONT_AUTOPROCESS_ABBREVS` is set.
    pub fn advance(&mut self, flags: AdvanceFlags) -> Result<Entry, Error> {
        loop {
            if self.at_end() {
                return match self.scopes.last() {
                    Some(scope) => Err(Error::MissingEndBlock(scope.block_id)),
                    None => Err(Error::TruncatedStream),
                };
            }
            let code = self.read_code();
            self.check_bits()?;
            match BuiltinAbbrevId::try_from(code) {
                Ok(BuiltinAbbrevId::EndBlock) => {
                    self.bits.skip_to_four_byte_boundary();
                    if !flags.contains(AdvanceFlags::DONT_POP_BLOCK_AT_END) {
                        self.pop_scope()?;
                    }
                    return Ok(Entry::EndBlock);
                }
                Ok(BuiltinAbbrevId::EnterSubblock) => {
                    let id = self.bits.read_vbr(BLOCK_ID_WIDTH);
                    self.check_bits()?;
                    return Ok(Entry::SubBlock(id));
                }
                Ok(BuiltinAbbrevId::DefineAbbrev)
                    if !flags.contains(AdvanceFlags::DONT_AUTOPROCESS_ABBREVS) =>
                {
                    let (abbrev, _) = self.read_abbrev()?;
                    self.abbrevs.push(abbrev);
                }
                _ => return Ok(Entry::Record(code)),
            }
        }
    }

    fn pop_scope(&mut self) -> Result<(), Error> {
        let scope = self.scopes.pop().ok_or(Error::ExtraEndBlock)?;
        self.selector = scope.prev_selector;
        self.abbrevs = scope.prev_abbrevs;
        Ok(())
    }

    /// Having been handed `SubBlock(block_id)`, descend into the block.
    /// Returns the block's declared length in words.
    pub fn enter_block(&mut self, block_id: u32) -> Result<u32, Error> {
        let mut abbrevs = self.blockinfo_abbrevs(block_id).to_vec();
        std::mem::swap(&mut abbrevs, &mut self.abbrevs);
        self.scopes.push(Scope {
            block_id,
            prev_selector: self.selector,
            prev_abbrevs: abbrevs,
        });

        let num_bits = self.bits.read_vbr(CODE_LEN_WIDTH);
        self.bits.skip_to_four_byte_boundary();
        let num_words = self.bits.read(BLOCK_SIZE_WIDTH) as u32;
        self.check_bits()?;
        if !(MIN_ABBREV_WIDTH..=MAX_ABBREV_WIDTH).contains(&num_bits) {
            return Err(Error::BadCodeWidth(num_bits));
        }
        if self.at_end() {
            return Err(Error::TruncatedStream);
        }
        self.selector = CodeSelector {
            is_fixed: true,
            num_bits,
        };
        if block_id == BLOCKINFO_BLOCK_ID {
            self.blockinfo_read = true;
        }
        Ok(num_words)
    }

    /// Having been handed `SubBlock(_)`, skip the block body by its
    /// declared word count.
    pub fn skip_block(&mut self) -> Result<(), Error> {
        let _ = self.bits.read_vbr(CODE_LEN_WIDTH);
        self.bits.skip_to_four_byte_boundary();
        let num_words = self.bits.read(BLOCK_SIZE_WIDTH);
        self.check_bits()?;
        if self.at_end() {
            return Err(Error::BadSkip);
        }
        let target = self.bits.current_bit_no() + num_words * 32;
        self.bits.jump_to_bit(target).map_err(|_| Error::BadSkip)
    }

    /// Read a `DEFINE_ABBREV` body. Returns the abbreviation in canonical
    /// form plus its record-value encoding, without installing it anywhere.
    pub fn read_abbrev(&mut self) -> Result<(Rc<Abbreviation>, Vec<u64>), Error> {
        let num_ops = self.bits.read_vbr(5);
        self.check_bits()?;
        let mut ops = Vec::new();
        let mut values = vec![u64::from(num_ops)];
        for _ in 0..num_ops {
            if self.bits.read(1) != 0 {
                let v = self.bits.read_vbr64(8);
                ops.push(Operand::Literal(v));
                values.extend([1, v]);
            } else {
                let kind = self.bits.read(3) as u32;
                match kind {
                    1 => {
                        let w = self.bits.read_vbr(5);
                        ops.push(Operand::Fixed(w));
                        values.extend([0, 1, u64::from(w)]);
                    }
                    2 => {
                        let w = self.bits.read_vbr(5);
                        ops.push(Operand::Vbr(w));
                        values.extend([0, 2, u64::from(w)]);
                    }
                    3 => {
                        ops.push(Operand::Array);
                        values.extend([0, 3]);
                    }
                    4 => {
                        ops.push(Operand::Char6);
                        values.extend([0, 4]);
                    }
                    _ => {
                        self.check_bits()?;
                        return Err(Error::BadAbbrevEncoding(kind));
                    }
                }
            }
            self.check_bits()?;
        }
        let abbrev = Abbreviation::new(ops).simplify();
        abbrev.validate()?;
        Ok((Rc::new(abbrev), values))
    }

    /// Append an abbreviation to the current scope, as a caller-driven
    /// replacement for the autoprocessed path.
    pub fn add_local_abbrev(&mut self, abbrev: Rc<Abbreviation>) {
        self.abbrevs.push(abbrev);
    }

    /// Append to the inherited table for `block_id`, as BLOCKINFO does.
    pub fn add_blockinfo_abbrev(&mut self, block_id: u32, abbrev: Rc<Abbreviation>) {
        self.blockinfo.entry(block_id).or_default().push(abbrev);
    }

    fn get_abbrev(&self, abbrev_id: u32) -> Result<Rc<Abbreviation>, Error> {
        abbrev_id
            .checked_sub(FIRST_APPLICATION_ABBREV)
            .and_then(|i| self.abbrevs.get(i as usize))
            .cloned()
            .ok_or(Error::NoSuchAbbrev {
                block_id: self.current_block_id().unwrap_or(u32::MAX),
                abbrev_id,
            })
    }

    fn read_scalar(&mut self, op: Operand) -> Result<u64, Error> {
        Ok(match op {
            Operand::Literal(v) => v,
            Operand::Fixed(0) | Operand::Vbr(0) => 0,
            Operand::Fixed(w) => self.bits.read(w),
            Operand::Vbr(w) => self.bits.read_vbr64(w),
            Operand::Char6 => decode_char6(self.bits.read(6)).ok_or(Error::BadChar6)?,
            Operand::Array => unreachable!("array is not a scalar operand"),
        })
    }

    /// Decode the record headed by `abbrev_id` into its code and values.
    pub fn read_record(&mut self, abbrev_id: u32) -> Result<(u64, Vec<u64>), Error> {
        if abbrev_id == BuiltinAbbrevId::UnabbrevRecord as u32 {
            let code = self.bits.read_vbr64(6);
            let n = self.bits.read_vbr(6);
            self.check_bits()?;
            let mut values = Vec::with_capacity(n.min(4096) as usize);
            for _ in 0..n {
                values.push(self.bits.read_vbr64(6));
                self.check_bits()?;
            }
            return Ok((code, values));
        }

        let abbrev = self.get_abbrev(abbrev_id)?;
        let mut vals = Vec::with_capacity(abbrev.ops().len());
        let ops = abbrev.ops();
        let mut i = 0;
        while i < ops.len() {
            if ops[i] == Operand::Array {
                let n = self.bits.read_vbr(6);
                self.check_bits()?;
                let elt = ops[i + 1];
                for _ in 0..n {
                    vals.push(self.read_scalar(elt)?);
                    self.check_bits()?;
                }
                break;
            }
            vals.push(self.read_scalar(ops[i])?);
            self.check_bits()?;
            i += 1;
        }
        if vals.is_empty() {
            return Err(Error::EmptyAbbreviatedRecord);
        }
        let code = vals.remove(0);
        Ok((code, vals))
    }

    /// Decode and discard the record headed by `abbrev_id`.
    pub fn skip_record(&mut self, abbrev_id: u32) -> Result<(), Error> {
        if abbrev_id == BuiltinAbbrevId::UnabbrevRecord as u32 {
            let _ = self.bits.read_vbr64(6);
            let n = self.bits.read_vbr(6);
            self.check_bits()?;
            for _ in 0..n {
                let _ = self.bits.read_vbr64(6);
                self.check_bits()?;
            }
            return Ok(());
        }
        let abbrev = self.get_abbrev(abbrev_id)?;
        let ops = abbrev.ops();
        let mut i = 0;
        while i < ops.len() {
            if ops[i] == Operand::Array {
                let n = self.bits.read_vbr(6);
                self.check_bits()?;
                let elt = ops[i + 1];
                for _ in 0..n {
                    let _ = self.read_scalar(elt)?;
                    self.check_bits()?;
                }
                break;
            }
            let _ = self.read_scalar(ops[i])?;
            self.check_bits()?;
            i += 1;
        }
        Ok(())
    }

    /// Having been handed `SubBlock(BLOCKINFO_BLOCK_ID)`, parse its
    /// contents into the inherited-abbreviation table and leave the block.
    /// A second BLOCKINFO block is skipped wholesale.
    pub fn read_blockinfo_block(&mut self) -> Result<(), Error> {
        if self.blockinfo_read {
            return self.skip_block();
        }
        let _ = self.enter_block(BLOCKINFO_BLOCK_ID)?;
        let mut cur_bid: Option<u32> = None;
        loop {
            match self.advance(AdvanceFlags::DONT_AUTOPROCESS_ABBREVS)? {
                Entry::EndBlock => return Ok(()),
                // Nested blocks carry nothing BLOCKINFO cares about.
                Entry::SubBlock(_) => self.skip_block()?,
                Entry::Record(code) if code == BuiltinAbbrevId::DefineAbbrev as u32 => {
                    let bid = cur_bid.ok_or(Error::MissingSetBid)?;
                    let (abbrev, _) = self.read_abbrev()?;
                    self.add_blockinfo_abbrev(bid, abbrev);
                }
                Entry::Record(abbrev_id) => {
                    let (code, values) = self.read_record(abbrev_id)?;
                    if code == BLOCKINFO_CODE_SETBID {
                        let bid = values.first().ok_or(Error::BadSetBid)?;
                        cur_bid = Some(u32::try_from(*bid).map_err(|_| Error::BadSetBid)?);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitWriter;

    // Hand-assemble a stream: one block (id 5, 2-bit codes) holding a
    // single unabbreviated record <7, [3, 4]>.
    fn tiny_block() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.emit(BuiltinAbbrevId::EnterSubblock as u32, 2);
        w.emit_vbr(5, BLOCK_ID_WIDTH);
        w.emit_vbr(2, CODE_LEN_WIDTH);
        w.flush_to_word();
        let len_at = w.buffer_len();
        w.emit(0, 32);
        w.emit(BuiltinAbbrevId::UnabbrevRecord as u32, 2);
        w.emit_vbr(7, 6);
        w.emit_vbr(2, 6);
        w.emit_vbr64(3, 6);
        w.emit_vbr64(4, 6);
        w.emit(BuiltinAbbrevId::EndBlock as u32, 2);
        w.flush_to_word();
        let words = (w.buffer_len() - len_at - 4) / 4;
        w.backpatch_word(len_at, words as u32);
        w.into_bytes()
    }

    #[test]
    fn reads_a_minimal_block() {
        let bytes = tiny_block();
        assert_eq!(bytes.len() % 4, 0);
        let mut r = BitstreamReader::new(bytes.as_slice());
        assert_eq!(Entry::SubBlock(5), r.advance(AdvanceFlags::empty()).unwrap());
        r.enter_block(5).unwrap();
        assert_eq!(2, r.code_width());
        let Entry::Record(abbrev_id) = r.advance(AdvanceFlags::empty()).unwrap() else {
            panic!("expected record");
        };
        assert_eq!(BuiltinAbbrevId::UnabbrevRecord as u32, abbrev_id);
        assert_eq!((7, vec![3, 4]), r.read_record(abbrev_id).unwrap());
        assert_eq!(Entry::EndBlock, r.advance(AdvanceFlags::empty()).unwrap());
        assert!(r.at_end());
    }

    #[test]
    fn skips_a_block_by_word_count() {
        let bytes = tiny_block();
        let mut r = BitstreamReader::new(bytes.as_slice());
        assert_eq!(Entry::SubBlock(5), r.advance(AdvanceFlags::empty()).unwrap());
        r.skip_block().unwrap();
        assert!(r.at_end());
    }

    #[test]
    fn truncation_is_an_error_not_a_short_record() {
        let mut bytes = tiny_block();
        bytes.truncate(8);
        let mut r = BitstreamReader::new(bytes.as_slice());
        assert_eq!(Entry::SubBlock(5), r.advance(AdvanceFlags::empty()).unwrap());
        // The length word and record body are gone.
        assert!(r.enter_block(5).is_err());
    }

    #[test]
    fn rejects_zero_code_width() {
        let mut w = BitWriter::new();
        w.emit(BuiltinAbbrevId::EnterSubblock as u32, 2);
        w.emit_vbr(5, BLOCK_ID_WIDTH);
        w.emit_vbr(0, CODE_LEN_WIDTH);
        w.flush_to_word();
        w.emit(0, 32);
        w.emit(0, 32);
        let bytes = w.into_bytes();
        let mut r = BitstreamReader::new(bytes.as_slice());
        assert_eq!(Entry::SubBlock(5), r.advance(AdvanceFlags::empty()).unwrap());
        assert_eq!(Err(Error::BadCodeWidth(0)), r.enter_block(5));
    }

    #[test]
    fn end_block_at_top_level_is_an_error() {
        let mut w = BitWriter::new();
        w.emit(BuiltinAbbrevId::EndBlock as u32, 2);
        w.flush_to_word();
        let bytes = w.into_bytes();
        let mut r = BitstreamReader::new(bytes.as_slice());
        assert_eq!(Err(Error::ExtraEndBlock), r.advance(AdvanceFlags::empty()));
    }
}
