use std::fs;
use std::io::{self, Read as _, Write as _};
use std::path::PathBuf;

use anyhow::{bail, Context as _};
use clap::Parser;
use pnacl_bitcode::records::read_record_list;
use pnacl_bitcode::text::{parse_text_records, write_text_records};
use pnacl_bitcode::write::{write_records, WriteFlags};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Convert PNaCl bitcode between binary and textual records")]
struct CommandLine {
    /// Input file, or `-` for stdin
    #[clap(default_value = "-")]
    input: PathBuf,

    /// Output file, or `-` for stdout
    #[clap(short, long, default_value = "-")]
    output: PathBuf,

    /// Convert binary bitcode to textual records
    #[clap(long, conflicts_with = "from_text")]
    to_text: bool,

    /// Convert textual records to binary bitcode
    #[clap(long)]
    from_text: bool,

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

fn write_output(path: &PathBuf, bytes: &[u8]) -> anyhow::Result<()> {
    if path.as_os_str() == "-" {
        io::stdout().write_all(bytes).context("writing stdout")?;
        return Ok(());
    }
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let CommandLine {
        input,
        output,
        to_text,
        from_text,
        log_level,
    } = Parser::parse();
    init_tracing(log_level);

    if to_text == from_text {
        bail!("exactly one of --to-text and --from-text is required");
    }

    let bytes = read_input(&input)?;
    if to_text {
        let records =
            read_record_list(&bytes).with_context(|| format!("parsing {}", input.display()))?;
        let text = write_text_records(&records).context("printing records")?;
        return write_output(&output, text.as_bytes());
    }

    let text = String::from_utf8(bytes).context("input is not valid UTF-8")?;
    let records = parse_text_records(&text)
        .with_context(|| format!("parsing {}", input.display()))?;
    let flags = WriteFlags::default();
    let (buffer, results) = write_records(&records, true, flags);
    if !results.succeeded(&flags) {
        bail!(
            "unable to generate bitcode from textual records ({} errors)",
            results.num_errors
        );
    }
    write_output(&output, &buffer)
}
