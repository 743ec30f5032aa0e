//! gammafit CLI

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use gf_likelihood::{LikeSession, TsResult};
use serde::Serialize;
use std::path::{Path, PathBuf};

mod analysis;

use analysis::AnalysisDocument;

#[derive(Parser)]
#[command(name = "gammafit")]
#[command(about = "gammafit - Poisson likelihood of gamma-ray sky maps")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test statistic of the source model against background only
    Ts {
        #[command(flatten)]
        io: SessionArgs,

        /// Evaluate at the current nuisance values without the internal fit
        #[arg(long)]
        no_internal_fit: bool,
    },

    /// Gaussian-weight estimate of the common norm and its error
    Estimate {
        #[command(flatten)]
        io: SessionArgs,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Analysis document (JSON)
    #[arg(short, long)]
    input: PathBuf,

    /// Pretty JSON result file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Worker threads, 0 for one per core
    #[arg(long, default_value = "0")]
    threads: usize,
}

impl SessionArgs {
    fn session(&self) -> Result<LikeSession> {
        if self.threads > 0 {
            // a global pool may already exist; keep it
            let _ = rayon::ThreadPoolBuilder::new().num_threads(self.threads).build_global();
        }
        tracing::info!(path = %self.input.display(), "loading analysis");
        let session = AnalysisDocument::read(&self.input)?.build_session()?;
        tracing::info!(bins = session.calc_bins().len(), roi = ?session.roi(), "session ready");
        Ok(session)
    }

    fn emit(&self, value: &impl Serialize) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        match &self.output {
            Some(path) => write_file(path, &text),
            None => {
                println!("{text}");
                Ok(())
            }
        }
    }
}

/// Test statistic with its derived quantities
#[derive(Serialize)]
struct TsReport<'a> {
    #[serde(flatten)]
    result: &'a TsResult,
    significance: f64,
    converged: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).with_writer(std::io::stderr).init();

    match cli.command {
        Commands::Ts { io, no_internal_fit } => cmd_ts(&io, !no_internal_fit),
        Commands::Estimate { io } => io.emit(&io.session()?.estimate_norm_and_sigma()?),
    }
}

fn cmd_ts(io: &SessionArgs, internal_fit: bool) -> Result<()> {
    let mut session = io.session()?;
    let result = session.calc_test_statistic(internal_fit)?;
    let clamped = session.negative_background_count();
    if clamped > 0 {
        tracing::warn!(count = clamped, "negative background values clamped to zero");
    }
    tracing::info!(ts = result.ts, common_norm = result.common_norm, "test statistic");
    io.emit(&TsReport { result: &result, significance: result.significance(), converged: result.converged() })
}

fn write_file(path: &Path, text: &str) -> Result<()> {
    std::fs::write(path, text)?;
    tracing::info!(path = %path.display(), "result written");
    Ok(())
}
