use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::metrics::AggregationParams;
use crate::psf_fitting::FitParams;
use crate::star_detection::DetectionParams;

const DEFAULT_EXPECTED_FWHM: f64 = 5.0;
const DEFAULT_THRESHOLD_SIGMA: f64 = 5.0;
const DEFAULT_MAX_STARS: usize = 500;
const DEFAULT_SAMPLE_LIMIT: usize = 250_000;
const DEFAULT_CUTOUT_SCALE: f64 = 2.0;
const DEFAULT_MAX_ITERATIONS: usize = 100;
const DEFAULT_TOLERANCE: f64 = 1e-6;
const DEFAULT_MAX_SIGMA_RATIO: f64 = 4.0;
const DEFAULT_MAX_RESIDUAL_FRACTION: f64 = 0.5;
const DEFAULT_OUTLIER_SIGMA: f64 = 3.0;
const DEFAULT_OUTLIER_MIN_POPULATION: usize = 5;
/// Smallest expected FWHM the fitter can resolve.
pub const MIN_EXPECTED_FWHM: f64 = 1.0;

/// Invalid configuration. Fatal to starting a batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("{field} must be a positive finite number, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },
    #[error("{field} must be at least 1.0, got {value}")]
    RatioBelowOne { field: &'static str, value: f64 },
    #[error("detection.expected_fwhm_pixels must be at least 1 pixel, got {0}")]
    FwhmTooSmall(f64),
}

/// Main configuration structure for SubFrame Guard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Star detection settings
    #[serde(default)]
    pub detection: DetectionConfig,
    /// PSF fitter settings
    #[serde(default)]
    pub fitting: FittingConfig,
    /// Per-frame aggregation settings
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Worker pool settings
    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Expected star FWHM in pixels (default: 5.0)
    pub expected_fwhm_pixels: Option<f64>,
    /// Detection threshold in noise sigmas above background (default: 5.0)
    pub detection_threshold_sigma: Option<f64>,
    /// Maximum stars kept per frame (default: 500)
    pub max_stars_per_frame: Option<usize>,
    /// Maximum pixels sampled for background statistics (default: 250000)
    pub statistics_sample_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittingConfig {
    /// Cutout half-size as a multiple of the expected FWHM (default: 2.0)
    pub cutout_scale: Option<f64>,
    /// Levenberg-Marquardt iteration cap (default: 100)
    pub max_iterations: Option<usize>,
    /// Relative SSR change for convergence (default: 1e-6)
    pub tolerance: Option<f64>,
    /// Allowed ratio between fitted and expected sigma (default: 4.0)
    pub max_sigma_ratio: Option<f64>,
    /// Largest accepted RMS residual over amplitude (default: 0.5)
    pub max_residual_fraction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Per-star outlier rejection in MAD sigmas (default: 3.0)
    pub outlier_sigma: Option<f64>,
    /// Minimum valid stars before outliers are rejected (default: 5)
    pub outlier_min_population: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Number of worker threads (default: half of the available cores)
    pub count: Option<usize>,
}

/// Values given on the command line. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub expected_fwhm_pixels: Option<f64>,
    pub detection_threshold_sigma: Option<f64>,
    pub max_stars_per_frame: Option<usize>,
    pub statistics_sample_limit: Option<usize>,
    pub cutout_scale: Option<f64>,
    pub max_iterations: Option<usize>,
    pub tolerance: Option<f64>,
    pub max_sigma_ratio: Option<f64>,
    pub max_residual_fraction: Option<f64>,
    pub outlier_sigma: Option<f64>,
    pub outlier_min_population: Option<usize>,
    pub workers: Option<usize>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            expected_fwhm_pixels: Some(DEFAULT_EXPECTED_FWHM),
            detection_threshold_sigma: Some(DEFAULT_THRESHOLD_SIGMA),
            max_stars_per_frame: Some(DEFAULT_MAX_STARS),
            statistics_sample_limit: Some(DEFAULT_SAMPLE_LIMIT),
        }
    }
}

impl Default for FittingConfig {
    fn default() -> Self {
        Self {
            cutout_scale: Some(DEFAULT_CUTOUT_SCALE),
            max_iterations: Some(DEFAULT_MAX_ITERATIONS),
            tolerance: Some(DEFAULT_TOLERANCE),
            max_sigma_ratio: Some(DEFAULT_MAX_SIGMA_RATIO),
            max_residual_fraction: Some(DEFAULT_MAX_RESIDUAL_FRACTION),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            outlier_sigma: Some(DEFAULT_OUTLIER_SIGMA),
            outlier_min_population: Some(DEFAULT_OUTLIER_MIN_POPULATION),
        }
    }
}

/// Threads the platform reports as available, at least 1.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Default worker count: half the available parallelism, at least 1.
pub fn default_worker_count() -> usize {
    (available_parallelism() / 2).max(1)
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml_edit::de::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_string = toml_edit::ser::to_string_pretty(self)
            .context("Failed to serialize configuration to TOML")?;

        std::fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Merge configuration with command line arguments, prioritizing CLI values
    pub fn merge_with_cli(&mut self, cli: &ConfigOverrides) {
        fn take<T: Copy>(target: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *target = value;
            }
        }

        take(&mut self.detection.expected_fwhm_pixels, cli.expected_fwhm_pixels);
        take(
            &mut self.detection.detection_threshold_sigma,
            cli.detection_threshold_sigma,
        );
        take(&mut self.detection.max_stars_per_frame, cli.max_stars_per_frame);
        take(
            &mut self.detection.statistics_sample_limit,
            cli.statistics_sample_limit,
        );
        take(&mut self.fitting.cutout_scale, cli.cutout_scale);
        take(&mut self.fitting.max_iterations, cli.max_iterations);
        take(&mut self.fitting.tolerance, cli.tolerance);
        take(&mut self.fitting.max_sigma_ratio, cli.max_sigma_ratio);
        take(
            &mut self.fitting.max_residual_fraction,
            cli.max_residual_fraction,
        );
        take(&mut self.aggregation.outlier_sigma, cli.outlier_sigma);
        take(
            &mut self.aggregation.outlier_min_population,
            cli.outlier_min_population,
        );
        take(&mut self.workers.count, cli.workers);
    }

    /// Get the effective values with defaults applied
    pub fn get_expected_fwhm(&self) -> f64 {
        self.detection
            .expected_fwhm_pixels
            .unwrap_or(DEFAULT_EXPECTED_FWHM)
    }

    pub fn get_threshold_sigma(&self) -> f64 {
        self.detection
            .detection_threshold_sigma
            .unwrap_or(DEFAULT_THRESHOLD_SIGMA)
    }

    pub fn get_max_stars(&self) -> usize {
        self.detection
            .max_stars_per_frame
            .unwrap_or(DEFAULT_MAX_STARS)
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            expected_fwhm: self.get_expected_fwhm(),
            threshold_sigma: self.get_threshold_sigma(),
            max_stars: self.get_max_stars(),
            sample_limit: self
                .detection
                .statistics_sample_limit
                .unwrap_or(DEFAULT_SAMPLE_LIMIT),
        }
    }

    pub fn fit_params(&self) -> FitParams {
        FitParams {
            expected_fwhm: self.get_expected_fwhm(),
            cutout_scale: self.fitting.cutout_scale.unwrap_or(DEFAULT_CUTOUT_SCALE),
            max_iterations: self
                .fitting
                .max_iterations
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            tolerance: self.fitting.tolerance.unwrap_or(DEFAULT_TOLERANCE),
            max_sigma_ratio: self
                .fitting
                .max_sigma_ratio
                .unwrap_or(DEFAULT_MAX_SIGMA_RATIO),
            max_residual_fraction: self
                .fitting
                .max_residual_fraction
                .unwrap_or(DEFAULT_MAX_RESIDUAL_FRACTION),
        }
    }

    pub fn aggregation_params(&self) -> AggregationParams {
        AggregationParams {
            outlier_sigma: self
                .aggregation
                .outlier_sigma
                .unwrap_or(DEFAULT_OUTLIER_SIGMA),
            outlier_min_population: self
                .aggregation
                .outlier_min_population
                .unwrap_or(DEFAULT_OUTLIER_MIN_POPULATION),
        }
    }

    /// Worker threads to use: the configured count (or the default), clamped
    /// to the available parallelism.
    pub fn effective_worker_count(&self) -> usize {
        let available = available_parallelism();
        match self.workers.count {
            Some(requested) if requested > available => {
                warn!(
                    "⚠️ Requested {} workers but only {} threads are available, using {}",
                    requested, available, available
                );
                available
            }
            Some(requested) => requested.max(1),
            None => default_worker_count(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        fn positive(field: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::NotPositive { field, value })
            }
        }

        if self.workers.count == Some(0) {
            return Err(ConfigError::ZeroWorkers);
        }

        let detection = self.detection_params();
        positive("detection.expected_fwhm_pixels", detection.expected_fwhm)?;
        if detection.expected_fwhm < MIN_EXPECTED_FWHM {
            return Err(ConfigError::FwhmTooSmall(detection.expected_fwhm));
        }
        positive(
            "detection.detection_threshold_sigma",
            detection.threshold_sigma,
        )?;
        if detection.max_stars == 0 {
            return Err(ConfigError::ZeroCount {
                field: "detection.max_stars_per_frame",
            });
        }
        if detection.sample_limit == 0 {
            return Err(ConfigError::ZeroCount {
                field: "detection.statistics_sample_limit",
            });
        }

        let fitting = self.fit_params();
        positive("fitting.cutout_scale", fitting.cutout_scale)?;
        if fitting.max_iterations == 0 {
            return Err(ConfigError::ZeroCount {
                field: "fitting.max_iterations",
            });
        }
        positive("fitting.tolerance", fitting.tolerance)?;
        positive("fitting.max_sigma_ratio", fitting.max_sigma_ratio)?;
        if fitting.max_sigma_ratio < 1.0 {
            return Err(ConfigError::RatioBelowOne {
                field: "fitting.max_sigma_ratio",
                value: fitting.max_sigma_ratio,
            });
        }
        positive(
            "fitting.max_residual_fraction",
            fitting.max_residual_fraction,
        )?;

        positive(
            "aggregation.outlier_sigma",
            self.aggregation_params().outlier_sigma,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.get_expected_fwhm(), 5.0);
        assert_eq!(config.get_threshold_sigma(), 5.0);
        assert_eq!(config.get_max_stars(), 500);
        assert_eq!(config.detection_params(), DetectionParams::default());
        assert_eq!(config.fit_params(), FitParams::default());
        assert_eq!(config.aggregation_params(), AggregationParams::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_string = toml_edit::ser::to_string_pretty(&config).unwrap();

        // Should contain all major sections
        assert!(toml_string.contains("[detection]"));
        assert!(toml_string.contains("[fitting]"));
        assert!(toml_string.contains("[aggregation]"));

        // Parse back
        let parsed: Config = toml_edit::de::from_str(&toml_string).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml_edit::de::from_str(
            "[detection]\nexpected_fwhm_pixels = 3.5\n\n[workers]\ncount = 2\n",
        )
        .unwrap();
        assert_eq!(parsed.get_expected_fwhm(), 3.5);
        assert_eq!(parsed.get_threshold_sigma(), 5.0);
        assert_eq!(parsed.fit_params().max_iterations, 100);
        assert_eq!(parsed.workers.count, Some(2));
    }

    #[test]
    fn test_config_merge_with_cli() {
        let mut config = Config::default();
        config.merge_with_cli(&ConfigOverrides {
            expected_fwhm_pixels: Some(7.0),
            max_stars_per_frame: Some(50),
            outlier_sigma: Some(2.5),
            workers: Some(3),
            ..ConfigOverrides::default()
        });

        assert_eq!(config.get_expected_fwhm(), 7.0);
        assert_eq!(config.fit_params().expected_fwhm, 7.0);
        assert_eq!(config.get_max_stars(), 50);
        assert_eq!(config.aggregation_params().outlier_sigma, 2.5);
        assert_eq!(config.workers.count, Some(3));
        // Untouched values keep their configured defaults
        assert_eq!(config.get_threshold_sigma(), 5.0);
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = Config::default();
        config.workers.count = Some(2);
        let temp_file = NamedTempFile::new().unwrap();

        config.to_file(temp_file.path()).unwrap();

        let loaded_config = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config, config);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.workers.count = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroWorkers));

        let mut config = Config::default();
        config.detection.expected_fwhm_pixels = Some(-1.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "detection.expected_fwhm_pixels",
                ..
            })
        ));

        let mut config = Config::default();
        config.detection.expected_fwhm_pixels = Some(0.05);
        assert_eq!(config.validate(), Err(ConfigError::FwhmTooSmall(0.05)));

        let mut config = Config::default();
        config.detection.detection_threshold_sigma = Some(f64::NAN);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detection.max_stars_per_frame = Some(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCount {
                field: "detection.max_stars_per_frame"
            })
        );

        let mut config = Config::default();
        config.fitting.max_sigma_ratio = Some(0.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RatioBelowOne { .. })
        ));

        let mut config = Config::default();
        config.fitting.max_iterations = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_worker_count_is_clamped() {
        let available = available_parallelism();
        let mut config = Config::default();
        assert_eq!(config.effective_worker_count(), default_worker_count());

        config.workers.count = Some(available + 8);
        assert_eq!(config.effective_worker_count(), available);

        config.workers.count = Some(1);
        assert_eq!(config.effective_worker_count(), 1);
    }
}
