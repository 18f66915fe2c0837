use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Width of the block id field in an `ENTER_SUBBLOCK` header.
pub const BLOCK_ID_WIDTH: u32 = 8;
/// Width of the new-code-length field in an `ENTER_SUBBLOCK` header.
pub const CODE_LEN_WIDTH: u32 = 4;
/// Width of the word-count field in an `ENTER_SUBBLOCK` header.
pub const BLOCK_SIZE_WIDTH: u32 = 32;
/// Largest permitted abbreviation-index width.
pub const MAX_ABBREV_WIDTH: u32 = 32;
/// Smallest permitted abbreviation-index width; enough for the reserved ids.
pub const MIN_ABBREV_WIDTH: u32 = 2;

/// The BLOCKINFO block id.
pub const BLOCKINFO_BLOCK_ID: u32 = 0;
/// The record code inside BLOCKINFO that selects the block being described.
pub const BLOCKINFO_CODE_SETBID: u64 = 1;

/// Largest reserved abbreviation index.
pub const DEFAULT_MAX_ABBREV: u32 = BuiltinAbbrevId::UnabbrevRecord as u32;
/// First index that refers to an application-defined abbreviation.
pub const FIRST_APPLICATION_ABBREV: u32 = 4;

/// Reserved abbreviation indices at the head of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum BuiltinAbbrevId {
    EndBlock = 0,
    EnterSubblock = 1,
    DefineAbbrev = 2,
    UnabbrevRecord = 3,
}

/// Number of bits needed to represent `v` as an unsigned field.
pub fn bits_needed(v: u64) -> u32 {
    (64 - v.leading_zeros()).max(1)
}

/// How record codes and abbreviation indices are encoded in the current
/// block: a fixed or VBR field of `num_bits` bits. Block scopes always carry
/// fixed selectors; the VBR form survives for completeness of the wire model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSelector {
    pub is_fixed: bool,
    pub num_bits: u32,
}

impl CodeSelector {
    /// The implicit outer scope: fixed 2-bit codes.
    pub const OUTER: Self = Self {
        is_fixed: true,
        num_bits: MIN_ABBREV_WIDTH,
    };

    /// Selector wide enough for abbreviation indices up to `max_abbrev`.
    pub fn for_max_abbrev(max_abbrev: u64) -> Self {
        Self {
            is_fixed: true,
            num_bits: bits_needed(max_abbrev).max(MIN_ABBREV_WIDTH),
        }
    }

    /// Largest abbreviation index representable under this selector.
    pub fn abbrev_index_limit(&self) -> u64 {
        (1u64 << self.num_bits) - 1
    }
}

impl Default for CodeSelector {
    fn default() -> Self {
        Self::OUTER
    }
}

/// One operand of an abbreviation. `Array` consumes all remaining record
/// values, each encoded by the operand that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operand {
    /// A fixed value carried by the abbreviation itself; emits no bits.
    Literal(u64),
    /// An unsigned integer in exactly `width` bits.
    Fixed(u32),
    /// A VBR-encoded unsigned integer with chunk width `width`.
    Vbr(u32),
    /// Preceded at runtime by a VBR6 element count.
    Array,
    /// 6-bit encoding of `[a-zA-Z0-9._]`.
    Char6,
}

impl Operand {
    /// Wire tag for non-literal operands in a `DEFINE_ABBREV` record.
    pub fn encoded_kind(&self) -> u32 {
        match self {
            Operand::Literal(_) => 0,
            Operand::Fixed(_) => 1,
            Operand::Vbr(_) => 2,
            Operand::Array => 3,
            Operand::Char6 => 4,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Operand::Literal(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbbrevError {
    #[error("abbreviation has no operands")]
    Empty,
    #[error("array operand must be second-to-last")]
    MisplacedArray,
    #[error("operand width {0} exceeds 32 bits")]
    WidthTooWide(u32),
    #[error("vbr operand width {0} is below 2")]
    VbrWidthTooNarrow(u32),
}

/// An ordered, non-empty list of operands prescribing how a record is
/// encoded. Payload is immutable once built; scopes share abbreviations by
/// reference count (`Rc<Abbreviation>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Abbreviation {
    ops: Vec<Operand>,
}

impl Abbreviation {
    pub fn new(ops: Vec<Operand>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[Operand] {
        &self.ops
    }

    /// Structural validity: non-empty, widths in range, at most one array
    /// placed second-to-last with a scalar element operand.
    pub fn validate(&self) -> Result<(), AbbrevError> {
        if self.ops.is_empty() {
            return Err(AbbrevError::Empty);
        }
        for (i, op) in self.ops.iter().enumerate() {
            match *op {
                Operand::Fixed(w) | Operand::Vbr(w) if w > MAX_ABBREV_WIDTH => {
                    return Err(AbbrevError::WidthTooWide(w));
                }
                Operand::Vbr(w) if w < 2 && w != 0 => {
                    return Err(AbbrevError::VbrWidthTooNarrow(w));
                }
                Operand::Array => {
                    if i + 2 != self.ops.len() || matches!(self.ops[i + 1], Operand::Array) {
                        return Err(AbbrevError::MisplacedArray);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Canonical copy: `fixed(0)` and `vbr(0)` encode no bits and always
    /// decode as zero, so they collapse to `Literal(0)`. Equivalent
    /// abbreviations compare equal after simplification.
    pub fn simplify(&self) -> Self {
        let ops = self
            .ops
            .iter()
            .map(|op| match *op {
                Operand::Fixed(0) | Operand::Vbr(0) => Operand::Literal(0),
                op => op,
            })
            .collect();
        Self { ops }
    }

    /// Whether this abbreviation can encode `values` (the record code
    /// followed by the payload), and at what cost in bits, excluding the
    /// abbreviation-index field itself.
    pub fn matches(&self, values: &[u64]) -> Option<u64> {
        let mut bits = 0u64;
        let mut vi = 0usize;
        let mut oi = 0usize;
        while oi < self.ops.len() {
            match self.ops[oi] {
                Operand::Array => {
                    // Trailing element operand encodes the rest.
                    let elt = *self.ops.get(oi + 1)?;
                    if oi + 2 != self.ops.len() {
                        return None;
                    }
                    bits += vbr_bits(values.len() as u64 - vi as u64, 6);
                    while vi < values.len() {
                        bits += scalar_match_bits(elt, values[vi])?;
                        vi += 1;
                    }
                    oi = self.ops.len();
                }
                op => {
                    let v = *values.get(vi)?;
                    bits += scalar_match_bits(op, v)?;
                    vi += 1;
                    oi += 1;
                }
            }
        }
        (vi == values.len()).then_some(bits)
    }
}

fn scalar_match_bits(op: Operand, v: u64) -> Option<u64> {
    match op {
        Operand::Literal(lit) => (v == lit).then_some(0),
        Operand::Fixed(w) => {
            // The reader caps fixed fields at 32 bits.
            if w > 32 || v >> 32 != 0 {
                return None;
            }
            (w == 32 || v >> w == 0).then_some(u64::from(w))
        }
        Operand::Vbr(w) => match w {
            0 => (v == 0).then_some(0),
            1 => None,
            2..=32 => Some(vbr_bits(v, w)),
            _ => None,
        },
        Operand::Char6 => encode_char6(v).map(|_| 6),
        Operand::Array => None,
    }
}

/// Bits taken by `v` under VBR with chunk width `w`.
pub fn vbr_bits(mut v: u64, w: u32) -> u64 {
    let mut bits = 0u64;
    loop {
        bits += u64::from(w);
        if v >> (w - 1) == 0 {
            return bits;
        }
        v >>= w - 1;
    }
}

/// Bits taken by a record emitted unabbreviated: VBR6 code, VBR6 length,
/// VBR6 per value. The abbreviation-index field is excluded, as in
/// `Abbreviation::matches`.
pub fn unabbreviated_bits(code: u64, values: &[u64]) -> u64 {
    let mut bits = vbr_bits(code, 6) + vbr_bits(values.len() as u64, 6);
    for &v in values {
        bits += vbr_bits(v, 6);
    }
    bits
}

/// Decode a char6 value into its character, as a record value.
pub fn decode_char6(v: u64) -> Option<u64> {
    let ch = match v {
        0..=25 => v as u8 + b'a',
        26..=51 => v as u8 - 26 + b'A',
        52..=61 => v as u8 - 52 + b'0',
        62 => b'.',
        63 => b'_',
        _ => return None,
    };
    Some(u64::from(ch))
}

/// Encode a character (as a record value) into its char6 value.
pub fn encode_char6(v: u64) -> Option<u32> {
    let ch = u8::try_from(v).ok()?;
    match ch {
        b'a'..=b'z' => Some(u32::from(ch - b'a')),
        b'A'..=b'Z' => Some(u32::from(ch - b'A') + 26),
        b'0'..=b'9' => Some(u32::from(ch - b'0') + 52),
        b'.' => Some(62),
        b'_' => Some(63),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char6_table_round_trips() {
        for v in 0..64u64 {
            let ch = decode_char6(v).unwrap();
            assert_eq!(Some(v as u32), encode_char6(ch));
        }
        assert_eq!(None, decode_char6(64));
        assert_eq!(None, encode_char6(u64::from(b' ')));
        assert_eq!(Some(0), encode_char6(u64::from(b'a')));
        assert_eq!(Some(26), encode_char6(u64::from(b'A')));
        assert_eq!(Some(52), encode_char6(u64::from(b'0')));
    }

    #[test]
    fn simplify_collapses_zero_widths() {
        let a = Abbreviation::new(vec![
            Operand::Fixed(0),
            Operand::Vbr(0),
            Operand::Fixed(3),
        ]);
        let s = a.simplify();
        assert_eq!(
            s.ops(),
            &[Operand::Literal(0), Operand::Literal(0), Operand::Fixed(3)]
        );
        // Idempotent, and equality is pointwise on the canonical form.
        assert_eq!(s, s.simplify());
        let b = Abbreviation::new(vec![
            Operand::Literal(0),
            Operand::Vbr(0),
            Operand::Fixed(3),
        ]);
        assert_eq!(s, b.simplify());
    }

    #[test]
    fn validate_rejects_misplaced_array() {
        let last = Abbreviation::new(vec![Operand::Fixed(3), Operand::Array]);
        assert_eq!(Err(AbbrevError::MisplacedArray), last.validate());
        let early = Abbreviation::new(vec![Operand::Array, Operand::Fixed(3), Operand::Vbr(6)]);
        assert_eq!(Err(AbbrevError::MisplacedArray), early.validate());
        let ok = Abbreviation::new(vec![Operand::Fixed(3), Operand::Array, Operand::Char6]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn match_cost_counts_operand_bits() {
        // Fixed(3) + VBR(6) of 65 (two chunks) + array count 3 + 3 chars.
        let abbrev = Abbreviation::new(vec![
            Operand::Fixed(3),
            Operand::Vbr(6),
            Operand::Array,
            Operand::Char6,
        ]);
        let values = [
            2,
            65,
            u64::from(b'a'),
            u64::from(b'b'),
            u64::from(b'c'),
        ];
        assert_eq!(Some(3 + 12 + 6 + 18), abbrev.matches(&values));
    }

    #[test]
    fn match_rejects_unencodable_values() {
        let abbrev = Abbreviation::new(vec![Operand::Literal(7), Operand::Fixed(4)]);
        assert_eq!(Some(4), abbrev.matches(&[7, 15]));
        assert_eq!(None, abbrev.matches(&[8, 15]), "literal mismatch");
        assert_eq!(None, abbrev.matches(&[7, 16]), "does not fit in 4 bits");
        assert_eq!(None, abbrev.matches(&[7]), "too few values");
        assert_eq!(None, abbrev.matches(&[7, 1, 2]), "too many values");
        let c6 = Abbreviation::new(vec![Operand::Literal(0), Operand::Char6]);
        assert_eq!(None, c6.matches(&[0, u64::from(b'!')]));
    }

    #[test]
    fn unabbreviated_cost() {
        // code 1 (6) + count 2 (6) + two values (6 + 6).
        assert_eq!(24, unabbreviated_bits(1, &[0, 0]));
        assert_eq!(vbr_bits(65, 6), 12);
    }
}
