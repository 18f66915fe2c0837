use std::fs;
use std::io::{self, Read as _, Write as _};
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use pnacl_bitcode::analyze::{analyze_bitcode, print_summary, DumpOptions};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Analyze the block and record structure of a PNaCl bitcode file")]
struct CommandLine {
    /// Input bitcode file, or `-` for stdin
    #[clap(default_value = "-")]
    input: PathBuf,

    /// Write the report to this file instead of stdout
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Dump the stream structure while reading it
    #[clap(long)]
    dump: bool,

    /// With --dump, print records without sizes or abbreviation indices
    #[clap(long)]
    dump_only_records: bool,

    /// Omit the per-block record-code histograms
    #[clap(long)]
    no_histogram: bool,

    /// Wrap dumped record operands after this many per line
    #[clap(long, value_name = "n")]
    ops_per_line: Option<usize>,

    /// Set the log level (error, warn, info, debug, trace)
    #[clap(long, value_name = "level")]
    log_level: Option<Level>,
}

fn init_tracing(level: Option<Level>) {
    let filter = EnvFilter::from_default_env();
    let filter = match level {
        Some(level) => filter.add_directive(level.into()),
        None => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn read_input(path: &PathBuf) -> anyhow::Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut bytes = Vec::new();
        io::stdin()
            .read_to_end(&mut bytes)
            .context("reading stdin")?;
        return Ok(bytes);
    }
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let CommandLine {
        input,
        output,
        dump,
        dump_only_records,
        no_histogram,
        ops_per_line,
        log_level,
    } = Parser::parse();
    init_tracing(log_level);

    let bytes = read_input(&input)?;
    let options = DumpOptions {
        dump,
        dump_only_records,
        no_histogram,
        ops_per_line,
    };

    let mut out: Box<dyn io::Write> = match &output {
        Some(path) => Box::new(
            fs::File::create(path).with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    let analysis = analyze_bitcode(&bytes, &mut out, options)
        .with_context(|| format!("analyzing {}", input.display()))?;
    if options.dump {
        writeln!(out)?;
        writeln!(out)?;
    }
    if !options.dump_only_records {
        print_summary(&analysis, &mut out, options)?;
    }
    Ok(())
}
