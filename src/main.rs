use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use httpdvr::{
    archive::{ArchiveRecord, read_archive},
    config::Config,
    logging,
    mode::Mode,
};

#[derive(Debug, Parser)]
#[command(name = "httpdvr")]
struct Cli {
    /// Optional path to config TOML. If omitted, ./httpdvr.toml is used when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the exchanges stored in an archive.
    Inspect {
        /// Archive to read; defaults to the configured archive path.
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Print the mode the current configuration and environment resolve to.
    Mode,
}

fn render_record(record: &ArchiveRecord) -> String {
    let exchange = &record.exchange;
    let outcome = match (&exchange.response, &exchange.error) {
        (Some(response), _) => format!("{} ({} bytes)", response.status, response.body.len()),
        (None, Some(error)) => format!("error {}: {}", error.kind.as_str(), error.message),
        (None, None) => "no outcome".to_owned(),
    };
    format!(
        "{}\t{}\t{}\t{outcome}",
        record.sequence, exchange.request.method, exchange.request.url
    )
}

fn mode_summary(config: &Config) -> String {
    let flags = config.mode;
    let mode = Mode::from_flags(
        flags.record,
        flags.replay,
        flags.passthrough,
        flags.default_replay,
    );
    format!(
        "mode: {mode}\n\
         record: {}\n\
         replay: {}\n\
         passthrough: {}\n\
         default_replay: {}\n\
         archive: {}",
        flags.record,
        flags.replay,
        flags.passthrough,
        flags.default_replay,
        config.archive.path.display()
    )
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let config = Config::load(cli.config.as_deref(), &cwd)?;
    logging::init(&config, cli.log_level.as_deref())?;

    match cli.command {
        Command::Inspect { archive } => {
            let path = archive.unwrap_or_else(|| config.archive.path.clone());
            let records = read_archive(&path)?;
            for record in &records {
                println!("{}", render_record(record));
            }
            eprintln!("{} exchanges in {}", records.len(), path.display());
        }
        Command::Mode => println!("{}", mode_summary(&config)),
    }

    Ok(())
}
