use num_enum::TryFromPrimitive;
use thiserror::Error;

use crate::bits::{BitWriter, MemoryObject};

/// The four magic bytes opening every frozen bitcode file.
pub const MAGIC: [u8; 4] = *b"PEXE";

/// Version of the wire format this crate reads and writes.
pub const SUPPORTED_VERSION: u32 = 2;

/// Tag of the mandatory version field.
pub const TAG_PNACL_VERSION: u16 = 1;

const WORD_SIZE: usize = 4;
/// Bytes taken by the typed-id/length subfields of one header field.
const TAG_LEN_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("bad magic number (not a PEXE file)")]
    BadMagic,
    #[error("truncated header")]
    Truncated,
    #[error("header field overruns declared field area")]
    FieldOverrun,
    #[error("header fields do not fill declared field area")]
    FieldUnderrun,
    #[error("unknown header field kind {0}")]
    BadFieldKind(u16),
    #[error("header field payload too long to encode")]
    FieldTooLong,
}

/// Payload interpretation of a header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum FieldKind {
    Buffer = 0,
    UInt32 = 1,
}

/// One tagged header field: `{id, kind, payload}` encoded as two
/// little-endian u16 subfields (`id << 4 | kind`, payload length) followed
/// by the payload, padded to a word boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub tag: u16,
    pub kind: FieldKind,
    data: Vec<u8>,
}

impl HeaderField {
    pub fn uint32(tag: u16, value: u32) -> Self {
        Self {
            tag,
            kind: FieldKind::UInt32,
            data: value.to_le_bytes().to_vec(),
        }
    }

    pub fn buffer(tag: u16, data: Vec<u8>) -> Self {
        Self {
            tag,
            kind: FieldKind::Buffer,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn uint32_value(&self) -> Option<u32> {
        if self.kind != FieldKind::UInt32 {
            return None;
        }
        let bytes: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    fn typed_id(&self) -> u16 {
        (self.tag << 4) | self.kind as u16
    }

    /// Encoded size including subfields and padding.
    fn total_size(&self) -> usize {
        let unpadded = TAG_LEN_SIZE + self.data.len();
        unpadded + pad_to_word(unpadded)
    }
}

fn pad_to_word(len: usize) -> usize {
    (WORD_SIZE - (len & (WORD_SIZE - 1))) & (WORD_SIZE - 1)
}

/// The 16-byte-aligned prelude of a frozen bitcode stream. Built when a
/// stream is opened and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    fields: Vec<HeaderField>,
}

impl Header {
    pub fn new(fields: Vec<HeaderField>) -> Self {
        Self { fields }
    }

    /// The standard header carrying only the supported version.
    pub fn standard() -> Self {
        Self::new(vec![HeaderField::uint32(
            TAG_PNACL_VERSION,
            SUPPORTED_VERSION,
        )])
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn field_with_tag(&self, tag: u16) -> Option<&HeaderField> {
        self.fields.iter().find(|f| f.tag == tag)
    }

    pub fn version(&self) -> Option<u32> {
        self.field_with_tag(TAG_PNACL_VERSION)?.uint32_value()
    }

    /// Readable: structure and the version field parse.
    pub fn is_readable(&self) -> bool {
        self.version() == Some(SUPPORTED_VERSION)
    }

    /// Supported: readable with no unknown fields alongside the version.
    pub fn is_supported(&self) -> bool {
        self.is_readable() && self.fields.len() == 1
    }

    /// Encoded size in bytes, including magic and the prefix word.
    pub fn byte_size(&self) -> usize {
        2 * WORD_SIZE + self.fields.iter().map(HeaderField::total_size).sum::<usize>()
    }

    /// Parse a header from the front of `source`. Returns the header and
    /// the number of bytes it occupies.
    pub fn read_from<M: MemoryObject>(source: &mut M) -> Result<(Self, u64), Error> {
        let mut prefix = [0u8; 2 * WORD_SIZE];
        if source.read_bytes(0, &mut prefix) != prefix.len() {
            return Err(Error::Truncated);
        }
        if prefix[..4] != MAGIC {
            return Err(Error::BadMagic);
        }
        let num_fields = u16::from_le_bytes([prefix[4], prefix[5]]) as usize;
        let num_bytes = u16::from_le_bytes([prefix[6], prefix[7]]) as usize;

        let mut area = vec![0u8; num_bytes];
        if source.read_bytes(2 * WORD_SIZE as u64, &mut area) != num_bytes {
            return Err(Error::Truncated);
        }

        let mut fields = Vec::with_capacity(num_fields);
        let mut offset = 0usize;
        for _ in 0..num_fields {
            if offset + TAG_LEN_SIZE > num_bytes {
                return Err(Error::FieldOverrun);
            }
            let typed_id = u16::from_le_bytes([area[offset], area[offset + 1]]);
            let len = u16::from_le_bytes([area[offset + 2], area[offset + 3]]) as usize;
            if offset + TAG_LEN_SIZE + len > num_bytes {
                return Err(Error::FieldOverrun);
            }
            let data = area[offset + TAG_LEN_SIZE..offset + TAG_LEN_SIZE + len].to_vec();
            let kind = FieldKind::try_from(typed_id & 0xf)
                .map_err(|_| Error::BadFieldKind(typed_id & 0xf))?;
            let field = HeaderField {
                tag: typed_id >> 4,
                kind,
                data,
            };
            offset += field.total_size();
            fields.push(field);
        }
        if offset != num_bytes {
            return Err(Error::FieldUnderrun);
        }
        Ok((Self { fields }, (2 * WORD_SIZE + num_bytes) as u64))
    }

    /// Emit the header at the front of a word-aligned bit stream. The
    /// prefix word is reserved first and backpatched with
    /// `num_fields | (num_bytes << 16)` once the fields are out.
    pub fn write_to(&self, w: &mut BitWriter) -> Result<(), Error> {
        debug_assert_eq!(w.current_bit_no() % 32, 0);
        for byte in MAGIC {
            w.emit(u32::from(byte), 8);
        }
        let prefix_byte = w.buffer_len();
        w.emit(0, 32);

        let mut num_bytes = 0usize;
        for field in &self.fields {
            if field.data.len() > usize::from(u16::MAX) {
                return Err(Error::FieldTooLong);
            }
            w.emit(u32::from(field.typed_id()), 16);
            w.emit(field.data.len() as u32, 16);
            for &byte in &field.data {
                w.emit(u32::from(byte), 8);
            }
            for _ in 0..pad_to_word(TAG_LEN_SIZE + field.data.len()) {
                w.emit(0, 8);
            }
            num_bytes += field.total_size();
        }
        if num_bytes > usize::from(u16::MAX) || self.fields.len() > usize::from(u16::MAX) {
            return Err(Error::FieldTooLong);
        }
        w.backpatch_word(
            prefix_byte,
            self.fields.len() as u32 | (num_bytes as u32) << 16,
        );
        Ok(())
    }
}
