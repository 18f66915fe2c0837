//! PNaCl ("frozen") bitcode toolkit in Rust.
//!
//! The wire format is a variable-bit-width, block-structured container in
//! which every record is a tagged sequence of unsigned integers,
//! compressed through per-block abbreviation templates. On top of the
//! bit-exact reader and writer sit record-level tools: an editable
//! ("munged") record list, a deterministic record fuzzer, a stream
//! analyzer and an abbreviation-selecting compressor.

/// Stream statistics and structure dumps
pub mod analyze;
/// Bit-level reading and writing
pub mod bits;
/// Abbreviations, operands and wire constants
pub mod bitstream;
/// Abbreviation-selecting stream rewriter
pub mod compress;
/// Record-level fuzzing
pub mod fuzz;
/// The PEXE file header
pub mod header;
/// Record lists with an edit overlay
pub mod munge;
/// Bitstream reader
pub mod read;
/// Records and record lists
pub mod records;
/// Textual record form
pub mod text;
/// Bitstream writer
pub mod write;

pub use self::bits::{BitReader, BitWriter, MemoryObject, StreamingSource};
pub use self::bitstream::{Abbreviation, BuiltinAbbrevId, CodeSelector, Operand};
pub use self::fuzz::{RandomNumberGenerator, SeededRng, SimpleRecordFuzzer};
pub use self::header::Header;
pub use self::munge::MungedBitcode;
pub use self::read::{AdvanceFlags, BitstreamReader, Entry};
pub use self::records::{Record, RecordList};
pub use self::write::{BitstreamWriter, WriteFlags, WriteResults};
