use std::fs;
use std::io::{self, Read as _, Write as _};
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use pnacl_bitcode::compress::{compress, CompressFlags};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Rewrite a PNaCl bitcode file with better abbreviations")]
struct CommandLine {
    /// Input bitcode file, or `-` for stdin
    #[clap(default_value = "-")]
    input: PathBuf,

    /// Output bitcode file, or `-` for stdout
    #[clap(short, long, default_value = "-")]
    output: PathBuf,

    /// Strip all abbreviations instead of choosing better ones
    #[clap(long)]
    remove_abbreviations: bool,

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
        remove_abbreviations,
        log_level,
    } = Parser::parse();
    init_tracing(log_level);

    let bytes = read_input(&input)?;
    let flags = CompressFlags {
        remove_abbreviations,
    };
    let compressed =
        compress(&bytes, flags).with_context(|| format!("compressing {}", input.display()))?;

    if output.as_os_str() == "-" {
        io::stdout()
            .write_all(&compressed)
            .context("writing stdout")?;
    } else {
        fs::write(&output, compressed)
            .with_context(|| format!("writing {}", output.display()))?;
    }
    Ok(())
}
