use thiserror::Error;
use tracing::warn;

use crate::bitstream::{BLOCKINFO_BLOCK_ID, BLOCKINFO_CODE_SETBID, MIN_ABBREV_WIDTH};
use crate::records::{
    Record, RecordList, DEFINE_ABBREV_CODE, ENTER_BLOCK_CODE, EXIT_BLOCK_CODE, HEADER_CODE,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("bitcode record doesn't begin with a record code")]
    NoCodeForRecord,
    #[error("value expected after separator, but not found")]
    NoValueAfterSeparator,
    #[error("separator or terminator expected after value")]
    NoSeparatorOrTerminator,
    #[error("newline expected after terminating semicolon")]
    NoNewlineAfterTerminator,
    #[error("bitcode headers not allowed in bitcode text")]
    HeaderNotAllowed,
    #[error("bitcode abbreviations not allowed in bitcode text")]
    AbbreviationsNotAllowed,
    #[error("blocks not allowed within the blockinfo block")]
    BlockInBlockinfo,
    #[error("invalid record found in blockinfo block")]
    RecordInBlockinfo,
    #[error("block enter record must carry 2 values, found {0}")]
    BadEnterBlock(usize),
}

struct TextParser<'a> {
    buffer: &'a [u8],
    cursor: usize,
}

impl<'a> TextParser<'a> {
    fn new(buffer: &'a str) -> Self {
        Self {
            buffer: buffer.as_bytes(),
            cursor: 0,
        }
    }

    fn at_eof(&self) -> bool {
        self.cursor == self.buffer.len()
    }

    fn skip_spaces(&mut self) {
        while let Some(&b) = self.buffer.get(self.cursor) {
            if b == b' ' || b == b'\t' || b == b'\r' {
                self.cursor += 1;
            } else {
                break;
            }
        }
    }

    fn read_char(&mut self, wanted: u8) -> bool {
        if self.buffer.get(self.cursor) == Some(&wanted) {
            self.cursor += 1;
            return true;
        }
        false
    }

    /// Parse a decimal number; does not check for overflow.
    fn read_number(&mut self) -> Option<u64> {
        let mut value = 0u64;
        let mut found = false;
        while let Some(&b) = self.buffer.get(self.cursor) {
            if !b.is_ascii_digit() {
                break;
            }
            value = value.wrapping_mul(10).wrapping_add(u64::from(b - b'0'));
            found = true;
            self.cursor += 1;
        }
        found.then_some(value)
    }

    fn read_record(&mut self) -> Result<Option<Record>, Error> {
        self.skip_spaces();
        if self.read_char(b'\n') {
            return Ok(None);
        }
        let Some(code) = self.read_number() else {
            if self.at_eof() {
                return Ok(None);
            }
            return Err(Error::NoCodeForRecord);
        };
        let mut values = Vec::new();
        loop {
            self.skip_spaces();
            if self.read_char(b',') {
                self.skip_spaces();
                values.push(self.read_number().ok_or(Error::NoValueAfterSeparator)?);
                continue;
            }
            if self.read_char(b';') {
                break;
            }
            return Err(Error::NoSeparatorOrTerminator);
        }
        self.skip_spaces();
        if !self.read_char(b'\n') && !self.at_eof() {
            return Err(Error::NoNewlineAfterTerminator);
        }

        let abbrev = match code {
            ENTER_BLOCK_CODE => 1,
            EXIT_BLOCK_CODE => 0,
            HEADER_CODE => return Err(Error::HeaderNotAllowed),
            DEFINE_ABBREV_CODE => return Err(Error::AbbreviationsNotAllowed),
            _ => 3,
        };
        Ok(Some(Record::new(abbrev, code, values)))
    }
}

/// Parse the textual record form: one record per line, comma-separated
/// integers, semicolon-terminated. No header, no abbreviations.
pub fn parse_text_records(text: &str) -> Result<RecordList, Error> {
    let mut parser = TextParser::new(text);
    let mut records = RecordList::new();
    while !parser.at_eof() {
        if let Some(record) = parser.read_record()? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Print records in the textual form. Abbreviation definitions and header
/// records are dropped, and the whole BLOCKINFO block with them; block
/// enters are normalized to the default code width.
pub fn write_text_records<'a, I>(records: I) -> Result<String, Error>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut out = String::new();
    let mut in_blockinfo = false;
    for record in records {
        match record.code {
            ENTER_BLOCK_CODE => {
                if in_blockinfo {
                    return Err(Error::BlockInBlockinfo);
                }
                if record.values.len() != 2 {
                    return Err(Error::BadEnterBlock(record.values.len()));
                }
                if record.values[0] == u64::from(BLOCKINFO_BLOCK_ID) {
                    in_blockinfo = true;
                    continue;
                }
                out.push_str(&format!(
                    "{}, {}, {};\n",
                    ENTER_BLOCK_CODE, record.values[0], MIN_ABBREV_WIDTH
                ));
            }
            EXIT_BLOCK_CODE => {
                if in_blockinfo {
                    in_blockinfo = false;
                    continue;
                }
                if !record.values.is_empty() {
                    warn!("block exit record carries values; dropping them");
                }
                out.push_str(&format!("{EXIT_BLOCK_CODE};\n"));
            }
            DEFINE_ABBREV_CODE | HEADER_CODE => {}
            _ => {
                if in_blockinfo {
                    if record.code == BLOCKINFO_CODE_SETBID {
                        continue;
                    }
                    return Err(Error::RecordInBlockinfo);
                }
                out.push_str(&record.code.to_string());
                for v in &record.values {
                    out.push_str(&format!(", {v}"));
                }
                out.push_str(";\n");
            }
        }
    }
    Ok(out)
}
