use crate::models::{FileIdentity, FrameMetrics, HeaderInfo, PsfFit};
use crate::star_detection::ImageStatistics;
use crate::statistics::median_and_sigma;

/// Outlier trimming applied to per-star values before averaging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationParams {
    /// Values further than this many MAD-sigmas from the median are dropped.
    pub outlier_sigma: f64,
    /// Trimming only happens with at least this many valid stars.
    pub outlier_min_population: usize,
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            outlier_sigma: 3.0,
            outlier_min_population: 5,
        }
    }
}

/// Mean of `values` after dropping those beyond `outlier_sigma` MAD-sigmas of
/// the median. `None` for an empty input.
pub fn trimmed_mean(values: &[f64], params: &AggregationParams) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let kept: Vec<f64> = match median_and_sigma(values) {
        Some((median, sigma)) if values.len() >= params.outlier_min_population && sigma > 0.0 => {
            let limit = params.outlier_sigma * sigma;
            values
                .iter()
                .copied()
                .filter(|v| (v - median).abs() <= limit)
                .collect()
        }
        _ => values.to_vec(),
    };
    if kept.is_empty() {
        return None;
    }
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Reduce the per-star fits and global statistics of one frame to its
/// metric record. Only valid fits contribute.
pub fn aggregate(
    identity: &FileIdentity,
    candidates_detected: usize,
    fits: &[PsfFit],
    stats: &ImageStatistics,
    header: &HeaderInfo,
    params: &AggregationParams,
) -> FrameMetrics {
    let valid: Vec<&PsfFit> = fits.iter().filter(|f| f.is_valid()).collect();

    let fwhm: Vec<f64> = valid.iter().map(|f| f.fwhm()).collect();
    let eccentricity: Vec<f64> = valid.iter().map(|f| f.eccentricity()).collect();
    let snr = if stats.noise_sigma > 0.0 {
        let ratios: Vec<f64> = valid
            .iter()
            .map(|f| f.amplitude / stats.noise_sigma)
            .collect();
        trimmed_mean(&ratios, params)
    } else {
        None
    };

    let fwhm_pixels = trimmed_mean(&fwhm, params);
    let arcsec_per_pixel = header.arcsec_per_pixel();
    let fwhm_arcsec = fwhm_pixels.zip(arcsec_per_pixel).map(|(f, s)| f * s);

    FrameMetrics {
        path: identity.path.clone(),
        file_name: identity.file_name(),
        file_size: identity.size,
        modified_ns: identity.modified_ns,
        star_count: valid.len(),
        candidates_detected,
        fits_rejected: fits.len() - valid.len(),
        fwhm_pixels,
        fwhm_arcsec,
        eccentricity: trimmed_mean(&eccentricity, params),
        snr,
        background_level: Some(stats.background).filter(|b| b.is_finite()),
        noise_sigma: Some(stats.noise_sigma).filter(|n| n.is_finite()),
        arcsec_per_pixel,
        failure: None,
    }
}
