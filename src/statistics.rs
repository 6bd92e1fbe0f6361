//! Robust statistics: median / MAD helpers and the band statistics computed
//! over a population of per-frame metrics.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::models::FrameMetrics;

/// Scale from median absolute deviation to a Gaussian standard deviation.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Default number of sigmas beyond which a frame is flagged as an outlier.
pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 2.0;

fn total_cmp(a: &f64, b: &f64) -> Ordering {
    a.total_cmp(b)
}

/// Median of a slice, reordering it in place. Returns `None` for an empty slice.
pub fn median_in_place(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        return Some(upper);
    }
    let lower_max = lower.iter().copied().max_by(total_cmp).unwrap_or(upper);
    Some((lower_max + upper) / 2.0)
}

/// Median of a slice without touching the input.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut scratch = values.to_vec();
    median_in_place(&mut scratch)
}

/// Median and MAD of a slice. The slice is reused as scratch space and holds
/// the absolute deviations afterwards.
pub fn median_and_mad_in_place(values: &mut [f64]) -> Option<(f64, f64)> {
    let center = median_in_place(values)?;
    for v in values.iter_mut() {
        *v = (*v - center).abs();
    }
    let mad = median_in_place(values)?;
    Some((center, mad))
}

/// Median and MAD-derived sigma of a slice.
pub fn median_and_sigma(values: &[f64]) -> Option<(f64, f64)> {
    let mut scratch = values.to_vec();
    median_and_mad_in_place(&mut scratch).map(|(m, mad)| (m, mad * MAD_TO_SIGMA))
}

/// Per-frame metric that can be banded across a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Fwhm,
    FwhmArcsec,
    Eccentricity,
    Snr,
    StarCount,
    Background,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Fwhm,
        Metric::FwhmArcsec,
        Metric::Eccentricity,
        Metric::Snr,
        Metric::StarCount,
        Metric::Background,
    ];

    /// Value of this metric for one frame. Failed frames and undefined
    /// metrics yield `None`.
    pub fn extract(self, frame: &FrameMetrics) -> Option<f64> {
        if frame.is_failed() {
            return None;
        }
        let value = match self {
            Metric::Fwhm => frame.fwhm_pixels,
            Metric::FwhmArcsec => frame.fwhm_arcsec,
            Metric::Eccentricity => frame.eccentricity,
            Metric::Snr => frame.snr,
            Metric::StarCount => Some(frame.star_count as f64),
            Metric::Background => frame.background_level,
        };
        value.filter(|v| v.is_finite())
    }

    pub fn name(self) -> &'static str {
        match self {
            Metric::Fwhm => "fwhm",
            Metric::FwhmArcsec => "fwhm_arcsec",
            Metric::Eccentricity => "eccentricity",
            Metric::Snr => "snr",
            Metric::StarCount => "star_count",
            Metric::Background => "background",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Metric::Fwhm => "px",
            Metric::FwhmArcsec => "\"",
            Metric::Eccentricity | Metric::Snr | Metric::StarCount => "",
            Metric::Background => "ADU",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fwhm" | "fwhm_pixels" => Ok(Metric::Fwhm),
            "fwhm_arcsec" => Ok(Metric::FwhmArcsec),
            "eccentricity" | "ecc" => Ok(Metric::Eccentricity),
            "snr" => Ok(Metric::Snr),
            "star_count" | "stars" => Ok(Metric::StarCount),
            "background" | "bg" => Ok(Metric::Background),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}

/// Median and MAD-sigma bands of one metric across a population.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandStatistics {
    pub count: usize,
    pub median: f64,
    pub mad: f64,
    pub sigma: f64,
    pub band_1sigma: (f64, f64),
    pub band_2sigma: (f64, f64),
    pub min: f64,
    pub max: f64,
}

impl BandStatistics {
    /// Band statistics over the finite values of `values`. `None` when there
    /// are none.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return None;
        }
        let count = finite.len();
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let (median, mad) = median_and_mad_in_place(&mut finite)?;
        let sigma = mad * MAD_TO_SIGMA;

        Some(Self {
            count,
            median,
            mad,
            sigma,
            band_1sigma: (median - sigma, median + sigma),
            band_2sigma: (median - 2.0 * sigma, median + 2.0 * sigma),
            min,
            max,
        })
    }

    /// Whether `value` lies more than `threshold` sigmas from the median.
    /// Never true for a zero-sigma population.
    pub fn is_outlier(&self, value: f64, threshold: f64) -> bool {
        if self.sigma == 0.0 || !value.is_finite() {
            return false;
        }
        (value - self.median).abs() > threshold * self.sigma
    }

    /// Signed distance from the median in sigmas, `None` when sigma is zero.
    pub fn sigma_deviation(&self, value: f64) -> Option<f64> {
        if self.sigma == 0.0 {
            return None;
        }
        Some((value - self.median) / self.sigma)
    }
}

/// Values of `metric` for every frame, in frame order, `None` where undefined.
pub fn metric_values(frames: &[FrameMetrics], metric: Metric) -> Vec<Option<f64>> {
    frames.iter().map(|f| metric.extract(f)).collect()
}

pub fn band_statistics(frames: &[FrameMetrics], metric: Metric) -> Option<BandStatistics> {
    let values: Vec<f64> = frames.iter().filter_map(|f| metric.extract(f)).collect();
    BandStatistics::from_values(&values)
}

/// Band statistics of every metric that has at least one defined value.
pub fn all_band_statistics(frames: &[FrameMetrics]) -> Vec<(Metric, BandStatistics)> {
    Metric::ALL
        .iter()
        .filter_map(|&metric| band_statistics(frames, metric).map(|stats| (metric, stats)))
        .collect()
}

/// Indices of frames whose `metric` lies beyond `threshold` sigmas.
pub fn outlier_indices(frames: &[FrameMetrics], metric: Metric, threshold: f64) -> Vec<usize> {
    let Some(stats) = band_statistics(frames, metric) else {
        return Vec::new();
    };
    frames
        .iter()
        .enumerate()
        .filter_map(|(i, frame)| {
            let value = metric.extract(frame)?;
            stats.is_outlier(value, threshold).then_some(i)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;
    use crate::synthetic::normal_samples;
    use std::path::{Path, PathBuf};

    fn frame(name: &str, fwhm: Option<f64>, stars: usize) -> FrameMetrics {
        FrameMetrics {
            path: PathBuf::from(name),
            file_name: name.to_string(),
            file_size: 0,
            modified_ns: 0,
            star_count: stars,
            candidates_detected: stars,
            fits_rejected: 0,
            fwhm_pixels: fwhm,
            fwhm_arcsec: None,
            eccentricity: fwhm.map(|_| 0.3),
            snr: None,
            background_level: Some(1000.0),
            noise_sigma: Some(10.0),
            arcsec_per_pixel: None,
            failure: None,
        }
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_bands_are_symmetric() {
        let stats = BandStatistics::from_values(&[1.0, 2.0, 3.0, 4.0, 10.0]).unwrap();
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.mad, 1.0);
        assert!((stats.sigma - 1.4826).abs() < 1e-12);
        let (lo1, hi1) = stats.band_1sigma;
        let (lo2, hi2) = stats.band_2sigma;
        assert!((stats.median - lo1 - (hi1 - stats.median)).abs() < 1e-12);
        assert!((stats.median - lo2 - (hi2 - stats.median)).abs() < 1e-12);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 10.0);
        assert_eq!(stats.count, 5);
    }

    #[test]
    fn test_constant_population_collapses() {
        let stats = BandStatistics::from_values(&[2.5; 8]).unwrap();
        assert_eq!(stats.sigma, 0.0);
        assert_eq!(stats.band_1sigma, (2.5, 2.5));
        assert_eq!(stats.band_2sigma, (2.5, 2.5));
        assert!(!stats.is_outlier(100.0, 2.0));
        assert_eq!(stats.sigma_deviation(3.0), None);
    }

    #[test]
    fn test_non_finite_values_ignored() {
        assert!(BandStatistics::from_values(&[]).is_none());
        assert!(BandStatistics::from_values(&[f64::NAN, f64::INFINITY]).is_none());

        let stats = BandStatistics::from_values(&[1.0, f64::NAN, 3.0]).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.median, 2.0);
    }

    #[test]
    fn test_mad_sigma_matches_gaussian_std() {
        let samples = normal_samples(50_000, 100.0, 5.0, 7);
        let stats = BandStatistics::from_values(&samples).unwrap();
        assert!((stats.median - 100.0).abs() < 0.15, "median {}", stats.median);
        assert!((stats.sigma - 5.0).abs() < 0.15, "sigma {}", stats.sigma);
    }

    #[test]
    fn test_sigma_deviation_sign() {
        let stats = BandStatistics::from_values(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert!(stats.sigma_deviation(1.0).unwrap() < 0.0);
        assert!(stats.sigma_deviation(5.0).unwrap() > 0.0);
        assert_eq!(stats.sigma_deviation(3.0), Some(0.0));
    }

    #[test]
    fn test_outlier_indices_skip_failed_and_missing() {
        let mut frames = vec![
            frame("a.fits", Some(3.0), 10),
            frame("b.fits", Some(3.1), 11),
            frame("c.fits", Some(2.95), 12),
            frame("d.fits", Some(3.05), 10),
            frame("e.fits", Some(6.0), 9),
            frame("f.fits", None, 0),
        ];
        frames.push(FrameMetrics::failed(
            Path::new("g.fits"),
            FailureKind::Load,
            "not a FITS file",
        ));

        let outliers = outlier_indices(&frames, Metric::Fwhm, DEFAULT_OUTLIER_THRESHOLD);
        assert_eq!(outliers, vec![4]);

        let stats = band_statistics(&frames, Metric::Fwhm).unwrap();
        assert_eq!(stats.count, 5);

        // star_count is defined for the zero-star frame but not for the failed one
        let stars = band_statistics(&frames, Metric::StarCount).unwrap();
        assert_eq!(stars.count, 6);
    }

    #[test]
    fn test_all_band_statistics_skips_undefined_metrics() {
        let frames = vec![frame("a.fits", Some(3.0), 10), frame("b.fits", Some(3.2), 12)];
        let all = all_band_statistics(&frames);
        let metrics: Vec<Metric> = all.iter().map(|(m, _)| *m).collect();
        assert!(metrics.contains(&Metric::Fwhm));
        assert!(metrics.contains(&Metric::Background));
        assert!(!metrics.contains(&Metric::FwhmArcsec));
        assert!(!metrics.contains(&Metric::Snr));
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("FWHM".parse::<Metric>().unwrap(), Metric::Fwhm);
        assert_eq!("fwhm-arcsec".parse::<Metric>().unwrap(), Metric::FwhmArcsec);
        assert_eq!("stars".parse::<Metric>().unwrap(), Metric::StarCount);
        assert!("hfr".parse::<Metric>().is_err());
    }
}
