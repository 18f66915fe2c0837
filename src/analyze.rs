use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

use crate::bitstream::{BuiltinAbbrevId, BLOCKINFO_BLOCK_ID, BLOCKINFO_CODE_SETBID};
use crate::header::Header;
use crate::read::{self, AdvanceFlags, BitstreamReader, Entry};
use crate::records;

#[derive(Debug, Error)]
pub enum Error {
    #[error("record found outside any block")]
    TopLevelRecord,
    #[error(transparent)]
    Records(#[from] records::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<read::Error> for Error {
    fn from(err: read::Error) -> Self {
        Self::Records(err.into())
    }
}

impl From<crate::header::Error> for Error {
    fn from(err: crate::header::Error) -> Self {
        Self::Records(err.into())
    }
}

/// What the analyzer prints while walking the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    /// Emit an XML-like dump of blocks and records.
    pub dump: bool,
    /// With `dump`, omit block sizes and abbreviation indices.
    pub dump_only_records: bool,
    /// Skip the per-block record-code histogram in the summary.
    pub no_histogram: bool,
    /// Wrap dumped record operands after this many per line.
    pub ops_per_line: Option<usize>,
}

/// Statistics for one block id, accumulated over all its instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub num_instances: usize,
    pub num_bits: u64,
    pub num_subblocks: usize,
    pub num_abbrevs: usize,
    pub num_records: usize,
    pub num_abbreviated_records: usize,
    pub record_code_dist: BTreeMap<u64, usize>,
}

/// Result of walking a stream: per-block-id statistics keyed by id.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub block_stats: BTreeMap<u32, BlockStats>,
    pub num_top_blocks: usize,
    pub stream_size_bits: u64,
}

fn block_name(block_id: u32) -> String {
    if block_id == BLOCKINFO_BLOCK_ID {
        "BLOCKINFO_BLOCK".to_string()
    } else {
        format!("UnknownBlock{block_id}")
    }
}

struct Analyzer<'w> {
    analysis: Analysis,
    options: DumpOptions,
    out: &'w mut dyn io::Write,
    indent: usize,
}

impl Analyzer<'_> {
    fn indentation(&self) -> String {
        "  ".repeat(self.indent)
    }

    fn stats(&mut self, block_id: u32) -> &mut BlockStats {
        self.analysis.block_stats.entry(block_id).or_default()
    }

    fn dump_record(
        &mut self,
        label: &str,
        abbrev_id: Option<u32>,
        values: &[u64],
    ) -> io::Result<()> {
        if !self.options.dump {
            return Ok(());
        }
        let indent = self.indentation();
        write!(self.out, "{indent}<{label}")?;
        if let Some(abbrev_id) = abbrev_id {
            if !self.options.dump_only_records
                && abbrev_id != BuiltinAbbrevId::UnabbrevRecord as u32
            {
                write!(self.out, " abbrevid={abbrev_id}")?;
            }
        }
        for (i, v) in values.iter().enumerate() {
            if let Some(per_line) = self.options.ops_per_line {
                if i > 0 && per_line > 0 && i % per_line == 0 {
                    write!(self.out, "\n{indent} {}", " ".repeat(label.len()))?;
                }
            }
            write!(self.out, " op{i}={}", *v as i64)?;
        }
        writeln!(self.out, "/>")
    }

    fn walk<M: crate::bits::MemoryObject>(
        &mut self,
        reader: &mut BitstreamReader<M>,
    ) -> Result<(), Error> {
        // Innermost last: (block id, bit position at block start).
        let mut stack: Vec<(u32, u64)> = Vec::new();
        let mut cur_bid: Option<u32> = None;

        while !reader.at_end() || !stack.is_empty() {
            match reader.advance(AdvanceFlags::DONT_AUTOPROCESS_ABBREVS)? {
                Entry::SubBlock(id) => {
                    let start_bit = reader.current_bit_no();
                    if id == BLOCKINFO_BLOCK_ID && reader.blockinfo_read() {
                        reader.skip_block()?;
                        continue;
                    }
                    if stack.is_empty() {
                        self.analysis.num_top_blocks += 1;
                    }
                    let num_words = reader.enter_block(id)?;
                    match stack.last() {
                        Some(&(parent, _)) => self.stats(parent).num_subblocks += 1,
                        None => {}
                    }
                    self.stats(id).num_instances += 1;
                    if self.options.dump {
                        let indent = self.indentation();
                        write!(self.out, "{indent}<{}", block_name(id))?;
                        if !self.options.dump_only_records {
                            write!(
                                self.out,
                                " NumWords={num_words} BlockCodeSize={}",
                                reader.code_width()
                            )?;
                        }
                        writeln!(self.out, ">")?;
                    }
                    self.indent += 1;
                    stack.push((id, start_bit));
                    if id == BLOCKINFO_BLOCK_ID {
                        cur_bid = None;
                    }
                }
                Entry::EndBlock => {
                    let (id, start_bit) = stack.pop().ok_or(Error::TopLevelRecord)?;
                    self.stats(id).num_bits += reader.current_bit_no() - start_bit;
                    self.indent -= 1;
                    if self.options.dump {
                        writeln!(self.out, "{}</{}>", self.indentation(), block_name(id))?;
                    }
                }
                Entry::Record(code) if code == BuiltinAbbrevId::DefineAbbrev as u32 => {
                    let (abbrev, values) = reader.read_abbrev()?;
                    let Some(&(block_id, _)) = stack.last() else {
                        return Err(Error::TopLevelRecord);
                    };
                    if block_id == BLOCKINFO_BLOCK_ID {
                        let bid = cur_bid.ok_or(read::Error::MissingSetBid)?;
                        reader.add_blockinfo_abbrev(bid, abbrev);
                        // Inherited abbreviations count against their target.
                        self.stats(bid).num_abbrevs += 1;
                    } else {
                        reader.add_local_abbrev(abbrev);
                        self.stats(block_id).num_abbrevs += 1;
                    }
                    self.dump_record("DEFINE_ABBREV", None, &values)?;
                }
                Entry::Record(abbrev_id) => {
                    let (code, values) = reader.read_record(abbrev_id)?;
                    let Some(&(block_id, _)) = stack.last() else {
                        return Err(Error::TopLevelRecord);
                    };
                    if block_id == BLOCKINFO_BLOCK_ID && code == BLOCKINFO_CODE_SETBID {
                        let bid = values.first().ok_or(read::Error::BadSetBid)?;
                        cur_bid =
                            Some(u32::try_from(*bid).map_err(|_| read::Error::BadSetBid)?);
                    }
                    let stats = self.stats(block_id);
                    stats.num_records += 1;
                    if abbrev_id != BuiltinAbbrevId::UnabbrevRecord as u32 {
                        stats.num_abbreviated_records += 1;
                    }
                    *stats.record_code_dist.entry(code).or_default() += 1;
                    self.dump_record(
                        &format!("UnknownCode{code}"),
                        Some(abbrev_id),
                        &values,
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Walk a bitstream collecting per-block statistics, optionally dumping
/// its structure to `out` as it goes.
pub fn analyze_bitcode(
    bytes: &[u8],
    out: &mut dyn io::Write,
    options: DumpOptions,
) -> Result<Analysis, Error> {
    if bytes.len() % 4 != 0 {
        return Err(records::Error::Unaligned.into());
    }
    let mut source = bytes;
    let (header, header_size) = Header::read_from(&mut source)?;
    if !header.is_readable() {
        return Err(records::Error::UnreadableHeader.into());
    }
    if options.dump {
        for field in header.fields() {
            match field.uint32_value() {
                Some(v) => writeln!(out, "Field {}: {v}", field.tag)?,
                None => writeln!(out, "Field {}: {:02x?}", field.tag, field.data())?,
            }
        }
        writeln!(out)?;
    }

    let mut reader = BitstreamReader::with_initial_address(source, header_size);
    let mut analyzer = Analyzer {
        analysis: Analysis {
            stream_size_bits: bytes.len() as u64 * 8,
            ..Analysis::default()
        },
        options,
        out,
        indent: 0,
    };
    analyzer.walk(&mut reader)?;
    Ok(analyzer.analysis)
}

fn size_line(bits: f64) -> String {
    format!("{bits:.2}b/{:.2}B/{}W", bits / 8.0, (bits / 32.0) as u64)
}

/// Print the per-block summary in the analyzer's report layout.
pub fn print_summary(
    analysis: &Analysis,
    out: &mut dyn io::Write,
    options: DumpOptions,
) -> io::Result<()> {
    writeln!(
        out,
        "  Total size: {}",
        size_line(analysis.stream_size_bits as f64)
    )?;
    writeln!(out, "  # Toplevel Blocks: {}", analysis.num_top_blocks)?;
    writeln!(out)?;
    writeln!(out, "Per-block Summary:")?;
    for (&block_id, stats) in &analysis.block_stats {
        writeln!(out, "  Block ID #{block_id} ({}):", block_name(block_id))?;
        writeln!(out, "      Num Instances: {}", stats.num_instances)?;
        writeln!(out, "         Total Size: {}", size_line(stats.num_bits as f64))?;
        let pct = stats.num_bits as f64 * 100.0 / analysis.stream_size_bits as f64;
        writeln!(out, "    Percent of file: {pct:.4}%")?;
        if stats.num_instances > 1 {
            let n = stats.num_instances as f64;
            writeln!(
                out,
                "       Average Size: {}",
                size_line(stats.num_bits as f64 / n)
            )?;
            writeln!(
                out,
                "  Tot/Avg SubBlocks: {}/{:.4}",
                stats.num_subblocks,
                stats.num_subblocks as f64 / n
            )?;
            writeln!(
                out,
                "    Tot/Avg Abbrevs: {}/{:.4}",
                stats.num_abbrevs,
                stats.num_abbrevs as f64 / n
            )?;
            writeln!(
                out,
                "    Tot/Avg Records: {}/{:.4}",
                stats.num_records,
                stats.num_records as f64 / n
            )?;
        } else {
            writeln!(out, "      Num SubBlocks: {}", stats.num_subblocks)?;
            writeln!(out, "        Num Abbrevs: {}", stats.num_abbrevs)?;
            writeln!(out, "        Num Records: {}", stats.num_records)?;
        }
        if stats.num_records > 0 {
            let pct = stats.num_abbreviated_records as f64 * 100.0 / stats.num_records as f64;
            writeln!(out, "    Percent Abbrevs: {pct:.4}%")?;
        }
        writeln!(out)?;
        if !options.no_histogram && !stats.record_code_dist.is_empty() {
            writeln!(out, "    Record Histogram:")?;
            writeln!(out, "\t  Count Record Kind")?;
            let mut by_count: Vec<(&u64, &usize)> = stats.record_code_dist.iter().collect();
            by_count.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (code, count) in by_count {
                writeln!(out, "\t{count:>7} UnknownCode{code}")?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Record;
    use crate::write::{write_records, WriteFlags};

    fn sample_stream() -> Vec<u8> {
        let records = [
            Record::enter_block(8, 3),
            Record::unabbreviated(1, vec![2]),
            Record::new(2, records::DEFINE_ABBREV_CODE, vec![2, 1, 4, 0, 2, 6]),
            Record::new(4, 4, vec![11]),
            Record::enter_block(9, 2),
            Record::unabbreviated(6, vec![1, 2, 3]),
            Record::exit_block(),
            Record::exit_block(),
        ];
        let (bytes, results) = write_records(&records, true, WriteFlags::default());
        assert_eq!(0, results.num_errors);
        bytes
    }

    #[test]
    fn collects_per_block_statistics() {
        let bytes = sample_stream();
        let mut out = Vec::new();
        let analysis = analyze_bitcode(&bytes, &mut out, DumpOptions::default()).unwrap();
        assert_eq!(1, analysis.num_top_blocks);

        let outer = &analysis.block_stats[&8];
        assert_eq!(1, outer.num_instances);
        assert_eq!(1, outer.num_subblocks);
        assert_eq!(1, outer.num_abbrevs);
        assert_eq!(2, outer.num_records);
        assert_eq!(1, outer.num_abbreviated_records);
        assert_eq!(1, outer.record_code_dist[&1]);
        assert_eq!(1, outer.record_code_dist[&4]);

        let inner = &analysis.block_stats[&9];
        assert_eq!(1, inner.num_instances);
        assert_eq!(0, inner.num_subblocks);
        assert_eq!(1, inner.num_records);
        assert_eq!(0, inner.num_abbreviated_records);
        assert!(inner.num_bits > 0);
        assert!(outer.num_bits > inner.num_bits);
    }

    #[test]
    fn dump_produces_nested_elements() {
        let bytes = sample_stream();
        let mut out = Vec::new();
        let options = DumpOptions {
            dump: true,
            ..DumpOptions::default()
        };
        analyze_bitcode(&bytes, &mut out, options).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("<UnknownBlock8 NumWords="));
        assert!(text.contains("  <UnknownBlock9"));
        assert!(text.contains("<UnknownCode4 abbrevid=4 op0=11/>"));
        assert!(text.contains("<UnknownCode6 op0=1 op1=2 op2=3/>"));
        assert!(text.contains("</UnknownBlock8>"));
    }

    #[test]
    fn summary_mentions_every_block() {
        let bytes = sample_stream();
        let mut sink = Vec::new();
        let analysis = analyze_bitcode(&bytes, &mut sink, DumpOptions::default()).unwrap();
        let mut out = Vec::new();
        print_summary(&analysis, &mut out, DumpOptions::default()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("# Toplevel Blocks: 1"));
        assert!(text.contains("Block ID #8"));
        assert!(text.contains("Block ID #9"));
        assert!(text.contains("Record Histogram:"));
    }
}
