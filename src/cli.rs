use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::ConfigOverrides;

#[derive(Parser)]
#[command(name = "subframe-guard")]
#[command(about = "Measure FWHM, eccentricity and SNR of astronomical subframes", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze FITS frames and report per-frame quality metrics
    Analyze {
        /// FITS files or directories containing them
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// SQLite file used to persist results between runs
        #[arg(long)]
        cache_db: Option<PathBuf>,

        /// Sigma threshold for flagging outlier frames
        #[arg(long, default_value_t = 2.0)]
        sigma: f64,

        #[command(flatten)]
        tuning: TuningOptions,
    },

    /// Show dimensions, optics and background statistics of a FITS file
    ReadFits {
        /// Path to FITS file
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Time the pipeline on generated star fields
    Benchmark {
        /// Number of frames to generate
        #[arg(long, default_value_t = 16)]
        frames: usize,

        /// Frame width in pixels
        #[arg(long, default_value_t = 1024)]
        width: usize,

        /// Frame height in pixels
        #[arg(long, default_value_t = 768)]
        height: usize,

        /// Stars per frame
        #[arg(long, default_value_t = 150)]
        stars: usize,

        /// Star sigma in pixels
        #[arg(long, default_value_t = 1.8)]
        star_sigma: f64,

        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        tuning: TuningOptions,
    },

    /// Write the default configuration to a TOML file
    InitConfig {
        /// Destination path
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

/// Command line overrides of the configuration file.
#[derive(Args, Debug, Clone, Default)]
pub struct TuningOptions {
    /// Expected star FWHM in pixels
    #[arg(long)]
    pub fwhm: Option<f64>,

    /// Detection threshold in noise sigmas
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Maximum stars kept per frame
    #[arg(long)]
    pub max_stars: Option<usize>,

    /// Maximum pixels sampled for background statistics
    #[arg(long)]
    pub sample_limit: Option<usize>,

    /// PSF cutout half-size as a multiple of the FWHM
    #[arg(long)]
    pub cutout_scale: Option<f64>,

    /// Fitter iteration cap
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Fitter convergence tolerance
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Allowed ratio between fitted and expected sigma
    #[arg(long)]
    pub max_sigma_ratio: Option<f64>,

    /// Largest accepted residual as a fraction of amplitude
    #[arg(long)]
    pub max_residual: Option<f64>,

    /// Per-star outlier rejection in MAD sigmas
    #[arg(long)]
    pub outlier_sigma: Option<f64>,

    /// Minimum valid stars before per-star outliers are rejected
    #[arg(long)]
    pub outlier_min_population: Option<usize>,

    /// Number of worker threads
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,
}

impl TuningOptions {
    pub fn to_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            expected_fwhm_pixels: self.fwhm,
            detection_threshold_sigma: self.threshold,
            max_stars_per_frame: self.max_stars,
            statistics_sample_limit: self.sample_limit,
            cutout_scale: self.cutout_scale,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            max_sigma_ratio: self.max_sigma_ratio,
            max_residual_fraction: self.max_residual,
            outlier_sigma: self.outlier_sigma,
            outlier_min_population: self.outlier_min_population,
            workers: self.workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_analyze_with_overrides() {
        let cli = Cli::try_parse_from([
            "subframe-guard",
            "analyze",
            "lights/",
            "extra.fits",
            "--recursive",
            "--format",
            "json",
            "--fwhm",
            "4.2",
            "-j",
            "3",
        ])
        .unwrap();

        match cli.command {
            Commands::Analyze {
                paths,
                recursive,
                format,
                tuning,
                sigma,
                ..
            } => {
                assert_eq!(paths.len(), 2);
                assert!(recursive);
                assert_eq!(format, OutputFormat::Json);
                assert_eq!(sigma, 2.0);
                let overrides = tuning.to_overrides();
                assert_eq!(overrides.expected_fwhm_pixels, Some(4.2));
                assert_eq!(overrides.workers, Some(3));
                assert_eq!(overrides.detection_threshold_sigma, None);
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn test_analyze_requires_paths() {
        assert!(Cli::try_parse_from(["subframe-guard", "analyze"]).is_err());
    }
}
