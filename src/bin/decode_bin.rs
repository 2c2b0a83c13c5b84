//! Run a grammar over a binary file and print the resulting range tree.
//!
//! Usage:
//!   decode_bin GRAMMAR DATA [--start N[.B]] [--end N[.B]] [--max-steps N] [--hex]
//!   decode_bin GRAMMAR --codecs
//!
//! Logging goes to stderr; set `RUST_LOG=binscope=trace` to follow the scheduler.

use anyhow::Context;
use binscope::{dump, load, Offset, Parser as GrammarRunner, ParserConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "decode_bin")]
#[command(about = "Parse a binary file with a binscope grammar and dump the range tree")]
struct Args {
    /// Grammar source file
    grammar: PathBuf,

    /// Binary input file
    data: Option<PathBuf>,

    /// Offset to start parsing at (`byte` or `byte.bit`)
    #[arg(long, default_value = "0")]
    start: Offset,

    /// Offset to stop parsing at; defaults to the end of the file
    #[arg(long)]
    end: Option<Offset>,

    /// Abort after this many scheduler steps
    #[arg(long = "max-steps")]
    max_steps: Option<usize>,

    /// Show a hex preview of the bytes each leaf covers
    #[arg(long)]
    hex: bool,

    /// List the codecs available to the grammar and exit
    #[arg(long)]
    codecs: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,binscope=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let grammar = load(&args.grammar).map_err(|e| anyhow::anyhow!(e))?;
    let mut config = ParserConfig::default().with_start(args.start);
    if let Some(end) = args.end {
        config = config.with_end(end);
    }
    if let Some(max) = args.max_steps {
        config = config.with_max_steps(max);
    }
    let runner = GrammarRunner::new(&grammar)?.with_config(config);

    if args.codecs {
        for name in runner.codec_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let data_path = args
        .data
        .as_ref()
        .context("DATA is required unless --codecs is given")?;
    let data = std::fs::read(data_path).with_context(|| format!("reading {}", data_path.display()))?;
    info!(
        grammar = %args.grammar.display(),
        bytes = data.len(),
        instructions = grammar.node_count(),
        "parsing"
    );

    let tree = runner.parse(&data)?;
    let text = if args.hex {
        dump::render_with_bytes(&tree, &data)
    } else {
        dump::render(&tree)
    };
    println!("{}", text);
    println!("parsed [{}..{})", tree.start, tree.end);
    if !tree.errors.is_empty() {
        warn!(errors = tree.errors.len(), "parse finished with errors");
        println!("{}", dump::render_errors(&tree));
    }
    Ok(())
}
