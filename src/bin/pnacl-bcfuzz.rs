use std::fs;
use std::io::{self, Read as _};
use std::path::PathBuf;

use anyhow::{bail, Context as _};
use clap::Parser;
use pnacl_bitcode::munge::MungedBitcode;
use pnacl_bitcode::records::read_record_list;
use pnacl_bitcode::text::write_text_records;
use pnacl_bitcode::write::WriteFlags;
use pnacl_bitcode::{SeededRng, SimpleRecordFuzzer};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Generate record-level fuzzed PNaCl bitcode files")]
struct CommandLine {
    /// Input frozen bitcode file, or `-` for stdin
    #[clap(default_value = "-")]
    input: PathBuf,

    /// Output prefix; fuzzed files are written as <prefix>-<n>
    #[clap(short, long)]
    output: String,

    /// Number of fuzzed files to generate
    #[clap(long, default_value_t = 1)]
    count: u64,

    /// Convert the input to textual records (written to --output) instead
    /// of fuzzing
    #[clap(long)]
    convert_to_text: bool,

    /// Seed the random number generator with this string rather than the
    /// input path
    #[clap(long, value_name = "seed")]
    random_seed: Option<String>,

    /// Show how many times each record was edited
    #[clap(long)]
    record_distribution: bool,

    /// Show how many times each editing action was applied
    #[clap(long)]
    edit_distribution: bool,

    /// Percentage of records to edit, relative to --percentage-base
    #[clap(long, default_value_t = 1)]
    edit_percentage: u32,

    /// Base that --edit-percentage is measured against
    #[clap(long, default_value_t = 100)]
    percentage_base: u32,

    /// Show the records written to each fuzzed file
    #[clap(long)]
    verbose: bool,

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
    let args = CommandLine::parse();
    init_tracing(args.log_level);

    let bytes = read_input(&args.input)?;

    if args.convert_to_text {
        let records = read_record_list(&bytes)
            .with_context(|| format!("parsing {}", args.input.display()))?;
        let text = write_text_records(&records).context("printing records")?;
        fs::write(&args.output, text)
            .with_context(|| format!("writing {}", &args.output))?;
        return Ok(());
    }

    if args.edit_percentage > args.percentage_base {
        bail!(
            "edit percentage {} must not exceed {}",
            args.edit_percentage,
            args.percentage_base
        );
    }

    let seed = args
        .random_seed
        .clone()
        .unwrap_or_else(|| args.input.display().to_string());
    let mut rng = SeededRng::new(&seed);
    let mut bitcode = MungedBitcode::from_bitcode(&bytes)
        .with_context(|| format!("parsing {}", args.input.display()))?;
    let mut fuzzer = SimpleRecordFuzzer::new(&mut bitcode, &mut rng)
        .context("creating fuzzer")?;

    let flags = WriteFlags::recovering();
    for i in 1..=args.count {
        fuzzer.generator().salt_seed(i);
        fuzzer.fuzz(args.edit_percentage, args.percentage_base);
        let path = format!("{}-{i}", args.output);
        if args.verbose {
            eprintln!("Generating {path}");
            for record in fuzzer.bitcode().iter() {
                eprintln!("  {record}");
            }
        }
        let (buffer, results) = fuzzer.bitcode().write(true, flags);
        if !results.succeeded(&flags) {
            bail!("failed to write fuzzed bitcode: {path}");
        }
        fs::write(&path, buffer).with_context(|| format!("writing {path}"))?;
    }

    let mut stdout = io::stdout();
    if args.record_distribution {
        fuzzer.show_record_distribution(&mut stdout)?;
    }
    if args.edit_distribution {
        fuzzer.show_edit_distribution(&mut stdout)?;
    }
    Ok(())
}
