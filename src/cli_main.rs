use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::analyze::AnalyzeOptions;
use crate::commands::benchmark::BenchmarkShape;
use crate::commands::{analyze, benchmark, init_config, read_fits};

pub fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so table/json/csv output on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Analyze {
            paths,
            recursive,
            format,
            config,
            cache_db,
            sigma,
            tuning,
        } => {
            analyze(AnalyzeOptions {
                paths: &paths,
                recursive,
                format,
                config: config.as_deref(),
                cache_db: cache_db.as_deref(),
                sigma,
                tuning: &tuning,
            })?;
        }
        Commands::ReadFits { path, format } => {
            read_fits(&path, format)?;
        }
        Commands::Benchmark {
            frames,
            width,
            height,
            stars,
            star_sigma,
            config,
            tuning,
        } => {
            benchmark(
                BenchmarkShape {
                    frames,
                    width,
                    height,
                    stars,
                    star_sigma,
                },
                config.as_deref(),
                &tuning,
            )?;
        }
        Commands::InitConfig { path, force } => {
            init_config(&path, force)?;
        }
    }

    Ok(())
}
