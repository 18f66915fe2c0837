use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::bits::MemoryObject;
use crate::bitstream::{BuiltinAbbrevId, BLOCKINFO_BLOCK_ID, BLOCKINFO_CODE_SETBID};
use crate::header::{self, Header};
use crate::read::{self, AdvanceFlags, BitstreamReader, Entry};

/// Virtual record codes modeling stream structure in a record list. They
/// sit at the top of the code space so they cannot collide with the codes
/// of application blocks.
pub const ENTER_BLOCK_CODE: u64 = 65535;
pub const EXIT_BLOCK_CODE: u64 = 65534;
pub const DEFINE_ABBREV_CODE: u64 = 65533;
pub const HEADER_CODE: u64 = 65532;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("value expected at index {0}")]
    MissingValue(usize),
    #[error("out of range value {1} at index {0}")]
    OutOfRange(usize, u64),
    #[error("bitcode stream must be a multiple of 4 bytes in length")]
    Unaligned,
    #[error("invalid bitcode header: {0}")]
    Header(#[from] header::Error),
    #[error("bitcode header is not readable")]
    UnreadableHeader,
    #[error(transparent)]
    Read(#[from] read::Error),
}

/// A bitcode record with the abbreviation index it was (or should be)
/// encoded with. Values hold the payload; the record code sits apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub abbrev: u32,
    pub code: u64,
    pub values: Vec<u64>,
}

impl Record {
    pub fn new(abbrev: u32, code: u64, values: Vec<u64>) -> Self {
        Self {
            abbrev,
            code,
            values,
        }
    }

    /// A record carrying no abbreviation, as most edits produce.
    pub fn unabbreviated(code: u64, values: Vec<u64>) -> Self {
        Self::new(BuiltinAbbrevId::UnabbrevRecord as u32, code, values)
    }

    /// The structural record opening a block.
    pub fn enter_block(block_id: u64, code_width: u64) -> Self {
        Self::new(
            BuiltinAbbrevId::EnterSubblock as u32,
            ENTER_BLOCK_CODE,
            vec![block_id, code_width],
        )
    }

    /// The structural record closing a block.
    pub fn exit_block() -> Self {
        Self::new(BuiltinAbbrevId::EndBlock as u32, EXIT_BLOCK_CODE, vec![])
    }

    pub fn is_enter_block(&self) -> bool {
        self.code == ENTER_BLOCK_CODE
    }

    pub fn is_exit_block(&self) -> bool {
        self.code == EXIT_BLOCK_CODE
    }

    /// Replace contents from an array form `AbbrevIndex, Code, Values...,
    /// Terminator`, starting at `*index`; leaves `*index` after the record.
    pub fn read_from_array(
        values: &[u64],
        terminator: u64,
        index: &mut usize,
    ) -> Result<Self, Error> {
        let abbrev = read_scalar::<u32>(values, terminator, index)?;
        let code = read_value(values, terminator, index)?;
        let mut payload = Vec::new();
        while *index < values.len() {
            let v = values[*index];
            *index += 1;
            if v == terminator {
                break;
            }
            payload.push(v);
        }
        Ok(Self::new(abbrev, code, payload))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: <{}", self.abbrev, self.code)?;
        for v in &self.values {
            write!(f, ", {v}")?;
        }
        f.write_str(">")
    }
}

fn read_value(values: &[u64], terminator: u64, index: &mut usize) -> Result<u64, Error> {
    if *index < values.len() && values[*index] != terminator {
        let v = values[*index];
        *index += 1;
        return Ok(v);
    }
    Err(Error::MissingValue(*index))
}

fn read_scalar<T: TryFrom<u64>>(
    values: &[u64],
    terminator: u64,
    index: &mut usize,
) -> Result<T, Error> {
    let v = read_value(values, terminator, index)?;
    T::try_from(v).map_err(|_| Error::OutOfRange(*index - 1, v))
}

/// An ordered list of records, the in-memory form of a whole stream.
pub type RecordList = Vec<Record>;

/// Build a record list from the array form used by tests and munging
/// scripts: each record is `AbbrevIndex, Code, Values..., Terminator`.
pub fn record_list_from_array(values: &[u64], terminator: u64) -> Result<RecordList, Error> {
    let mut records = RecordList::new();
    let mut index = 0;
    while index < values.len() {
        records.push(Record::read_from_array(values, terminator, &mut index)?);
    }
    Ok(records)
}

/// Parse a binary stream into its record list. Structural records (block
/// enters and exits, abbreviation definitions, BLOCKINFO contents) appear
/// in the list under their virtual codes; the header does not.
pub fn read_record_list(bytes: &[u8]) -> Result<RecordList, Error> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Unaligned);
    }
    read_record_list_from_source(bytes)
}

/// Same as [`read_record_list`] over any byte source (no length check).
pub fn read_record_list_from_source<M: MemoryObject>(mut source: M) -> Result<RecordList, Error> {
    let (header, header_size) = Header::read_from(&mut source)?;
    if !header.is_readable() {
        return Err(Error::UnreadableHeader);
    }
    if !header.is_supported() {
        warn!("reading bitcode with unsupported header fields");
    }

    let mut reader = BitstreamReader::with_initial_address(source, header_size);
    let mut records = RecordList::new();
    let mut block_stack: Vec<u32> = Vec::new();
    let mut cur_bid: Option<u32> = None;

    while !reader.at_end() || !block_stack.is_empty() {
        match reader.advance(AdvanceFlags::DONT_AUTOPROCESS_ABBREVS)? {
            Entry::SubBlock(id) => {
                if id == BLOCKINFO_BLOCK_ID && reader.blockinfo_read() {
                    reader.skip_block()?;
                    continue;
                }
                reader.enter_block(id)?;
                records.push(Record::enter_block(
                    u64::from(id),
                    u64::from(reader.code_width()),
                ));
                block_stack.push(id);
                if id == BLOCKINFO_BLOCK_ID {
                    cur_bid = None;
                }
            }
            Entry::EndBlock => {
                records.push(Record::exit_block());
                block_stack.pop();
            }
            Entry::Record(code) if code == BuiltinAbbrevId::DefineAbbrev as u32 => {
                let (abbrev, values) = reader.read_abbrev()?;
                if block_stack.last() == Some(&BLOCKINFO_BLOCK_ID) {
                    let bid = cur_bid.ok_or(read::Error::MissingSetBid)?;
                    reader.add_blockinfo_abbrev(bid, abbrev);
                } else {
                    reader.add_local_abbrev(abbrev);
                }
                records.push(Record::new(
                    BuiltinAbbrevId::DefineAbbrev as u32,
                    DEFINE_ABBREV_CODE,
                    values,
                ));
            }
            Entry::Record(abbrev_id) => {
                let (code, values) = reader.read_record(abbrev_id)?;
                if block_stack.last() == Some(&BLOCKINFO_BLOCK_ID)
                    && code == BLOCKINFO_CODE_SETBID
                {
                    let bid = values.first().ok_or(read::Error::BadSetBid)?;
                    cur_bid =
                        Some(u32::try_from(*bid).map_err(|_| read::Error::BadSetBid)?);
                }
                records.push(Record::new(abbrev_id, code, values));
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_form_round_trip() {
        const T: u64 = u64::MAX;
        let records = record_list_from_array(
            &[
                1, ENTER_BLOCK_CODE, 8, 2, T, //
                3, 1, 10, 20, T, //
                0, EXIT_BLOCK_CODE, T,
            ],
            T,
        )
        .unwrap();
        assert_eq!(
            records,
            vec![
                Record::enter_block(8, 2),
                Record::unabbreviated(1, vec![10, 20]),
                Record::exit_block(),
            ]
        );
    }

    #[test]
    fn array_form_rejects_missing_code() {
        const T: u64 = u64::MAX;
        assert_eq!(
            record_list_from_array(&[3, T], T),
            Err(Error::MissingValue(1))
        );
        assert_eq!(
            record_list_from_array(&[u64::from(u32::MAX) + 1, 1, T], T),
            Err(Error::OutOfRange(0, u64::from(u32::MAX) + 1))
        );
    }

    #[test]
    fn record_display() {
        assert_eq!("3: <8, 1, 2>", Record::unabbreviated(8, vec![1, 2]).to_string());
        assert_eq!("3: <9>", Record::unabbreviated(9, vec![]).to_string());
    }
}
