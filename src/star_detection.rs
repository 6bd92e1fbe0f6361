//! Star detection: robust background and noise estimation, matched-filter
//! smoothing, local-maximum search and candidate cleanup.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use std::collections::HashMap;
use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use tracing::{debug, trace};

use crate::models::{PixelMatrix, StarCandidate, FWHM_PER_SIGMA};
use crate::statistics::{median_and_mad_in_place, median_in_place, MAD_TO_SIGMA};

/// Parameters of the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub expected_fwhm: f64,
    pub threshold_sigma: f64,
    pub max_stars: usize,
    /// Upper bound on pixels sampled for the global statistics.
    pub sample_limit: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            expected_fwhm: 5.0,
            threshold_sigma: 5.0,
            max_stars: 500,
            sample_limit: 250_000,
        }
    }
}

/// Global background and noise of a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageStatistics {
    /// Median pixel value.
    pub background: f64,
    /// MAD-derived noise sigma.
    pub noise_sigma: f64,
    pub sampled_pixels: usize,
}

impl ImageStatistics {
    pub fn compute(pixels: &PixelMatrix, sample_limit: usize) -> Self {
        let bump = Bump::new();
        Self::compute_in(pixels, sample_limit, &bump)
    }

    /// Compute using `bump` for the sample buffer. Frames with more than
    /// `sample_limit` pixels are sampled on a regular stride.
    pub fn compute_in(pixels: &PixelMatrix, sample_limit: usize, bump: &Bump) -> Self {
        let data = pixels.data();
        let stride = if sample_limit == 0 || data.len() <= sample_limit {
            1
        } else {
            data.len().div_ceil(sample_limit)
        };

        let mut sample = BumpVec::with_capacity_in(data.len() / stride + 1, bump);
        sample.extend(
            data.iter()
                .step_by(stride)
                .map(|&v| v as f64)
                .filter(|v| v.is_finite()),
        );

        let sampled_pixels = sample.len();
        let (background, mad) = median_and_mad_in_place(&mut sample).unwrap_or((0.0, 0.0));
        Self {
            background,
            noise_sigma: mad * MAD_TO_SIGMA,
            sampled_pixels,
        }
    }

    pub fn threshold(&self, sigma: f64) -> f64 {
        self.background + sigma * self.noise_sigma
    }
}

/// Find candidate stars, brightest first.
pub fn detect_stars(pixels: &PixelMatrix, params: &DetectionParams) -> Vec<StarCandidate> {
    let bump = Bump::new();
    let stats = ImageStatistics::compute_in(pixels, params.sample_limit, &bump);
    detect_stars_with(pixels, &stats, params, &bump)
}

/// Find candidate stars using precomputed global statistics.
pub fn detect_stars_with(
    pixels: &PixelMatrix,
    stats: &ImageStatistics,
    params: &DetectionParams,
    bump: &Bump,
) -> Vec<StarCandidate> {
    let width = pixels.width();
    let height = pixels.height();
    let fwhm = params.expected_fwhm;
    let threshold = stats.threshold(params.threshold_sigma);

    let smoothed = smooth(pixels, fwhm / FWHM_PER_SIGMA / 2.0);
    let radius = ((fwhm / 2.0).round() as usize).max(1);
    let ring_half = ((2.0 * fwhm).round() as usize).max(1);

    let mut candidates = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let raw = pixels.get(x, y) as f64;
            if !(raw > threshold) {
                continue;
            }
            if !is_local_max(&smoothed, width, height, x, y, radius) {
                continue;
            }
            let background =
                ring_median(pixels, x, y, ring_half, bump).unwrap_or(stats.background);
            candidates.push(StarCandidate {
                x,
                y,
                peak: raw,
                background,
            });
        }
    }
    let raw_count = candidates.len();

    candidates.sort_by(|a, b| b.peak.total_cmp(&a.peak));
    let merged = merge_close(candidates, fwhm);
    let mut kept: Vec<StarCandidate> = merged
        .into_iter()
        .filter(|c| !near_border(c, width, height, fwhm))
        .collect();
    kept.truncate(params.max_stars);

    debug!(
        "🔭 {} local maxima above {:.1}, {} candidates kept (bg {:.1}, noise {:.2})",
        raw_count,
        threshold,
        kept.len(),
        stats.background,
        stats.noise_sigma
    );
    kept
}

fn smooth(pixels: &PixelMatrix, sigma: f64) -> Vec<f32> {
    let buffer: Option<ImageBuffer<Luma<f32>, Vec<f32>>> = ImageBuffer::from_raw(
        pixels.width() as u32,
        pixels.height() as u32,
        pixels.data().to_vec(),
    );
    match buffer {
        Some(image) if sigma > 0.0 => gaussian_blur_f32(&image, sigma as f32).into_raw(),
        Some(image) => image.into_raw(),
        None => pixels.data().to_vec(),
    }
}

/// Strict local maximum of `smoothed` within a square window. Equal values
/// earlier in raster order win, so a plateau yields one maximum.
fn is_local_max(
    smoothed: &[f32],
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    radius: usize,
) -> bool {
    let center_index = y * width + x;
    let center = smoothed[center_index];
    let y0 = y.saturating_sub(radius);
    let y1 = (y + radius).min(height - 1);
    let x0 = x.saturating_sub(radius);
    let x1 = (x + radius).min(width - 1);

    for ny in y0..=y1 {
        for nx in x0..=x1 {
            let index = ny * width + nx;
            if index == center_index {
                continue;
            }
            let value = smoothed[index];
            if value > center || (value == center && index < center_index) {
                return false;
            }
        }
    }
    true
}

/// Median of the pixels on the border of the box of half-size `half` around
/// (x, y), clipped to the frame.
fn ring_median(pixels: &PixelMatrix, x: usize, y: usize, half: usize, bump: &Bump) -> Option<f64> {
    let width = pixels.width() as isize;
    let height = pixels.height() as isize;
    let (cx, cy, h) = (x as isize, y as isize, half as isize);

    let mut ring = BumpVec::with_capacity_in(8 * half, bump);
    for dy in -h..=h {
        for dx in -h..=h {
            if dx.abs() != h && dy.abs() != h {
                continue;
            }
            let (px, py) = (cx + dx, cy + dy);
            if px < 0 || py < 0 || px >= width || py >= height {
                continue;
            }
            let value = pixels.get(px as usize, py as usize) as f64;
            if value.is_finite() {
                ring.push(value);
            }
        }
    }
    median_in_place(&mut ring)
}

/// Drop candidates closer than `distance` to a brighter one. Input must be
/// sorted brightest first. Kept candidates are bucketed on a grid of
/// `distance`-sized cells so each check only visits the 3x3 neighborhood.
fn merge_close(sorted: Vec<StarCandidate>, distance: f64) -> Vec<StarCandidate> {
    let limit = distance * distance;
    let cell = distance.max(1.0);
    let cell_of = |c: &StarCandidate| ((c.x as f64 / cell) as i64, (c.y as f64 / cell) as i64);

    let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    let mut kept: Vec<StarCandidate> = Vec::with_capacity(sorted.len());
    for candidate in sorted {
        let (cx, cy) = cell_of(&candidate);
        let crowded = (cx - 1..=cx + 1)
            .flat_map(|gx| (cy - 1..=cy + 1).map(move |gy| (gx, gy)))
            .filter_map(|key| grid.get(&key))
            .flatten()
            .any(|&i| {
                let dx = kept[i].x as f64 - candidate.x as f64;
                let dy = kept[i].y as f64 - candidate.y as f64;
                dx * dx + dy * dy < limit
            });
        if crowded {
            trace!("merging candidate at ({}, {})", candidate.x, candidate.y);
        } else {
            grid.entry((cx, cy)).or_default().push(kept.len());
            kept.push(candidate);
        }
    }
    kept
}

fn near_border(candidate: &StarCandidate, width: usize, height: usize, margin: f64) -> bool {
    let x = candidate.x as f64;
    let y = candidate.y as f64;
    x < margin
        || y < margin
        || (width - 1) as f64 - x < margin
        || (height - 1) as f64 - y < margin
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{StarField, SyntheticStar};

    fn params() -> DetectionParams {
        DetectionParams::default()
    }

    #[test]
    fn test_image_statistics_on_noise() {
        let pixels = StarField::new(200, 200, 1000.0, 10.0).render();
        let stats = ImageStatistics::compute(&pixels, 250_000);
        assert_eq!(stats.sampled_pixels, 40_000);
        assert!((stats.background - 1000.0).abs() < 0.5);
        assert!((stats.noise_sigma - 10.0).abs() < 0.5);
    }

    #[test]
    fn test_image_statistics_subsamples_large_frames() {
        let pixels = StarField::new(300, 300, 500.0, 5.0).render();
        let stats = ImageStatistics::compute(&pixels, 10_000);
        assert!(stats.sampled_pixels <= 10_000);
        assert!(stats.sampled_pixels > 5_000);
        assert!((stats.background - 500.0).abs() < 0.5);
    }

    #[test]
    fn test_flat_noise_has_no_candidates() {
        let pixels = StarField::new(256, 256, 1000.0, 10.0).with_seed(3).render();
        assert!(detect_stars(&pixels, &params()).is_empty());
    }

    #[test]
    fn test_constant_frame_has_no_candidates() {
        let pixels = PixelMatrix::new(64, 64, vec![100.0; 64 * 64]).unwrap();
        assert!(detect_stars(&pixels, &params()).is_empty());
    }

    #[test]
    fn test_detects_isolated_stars_brightest_first() {
        let pixels = StarField::new(128, 128, 1000.0, 5.0)
            .with_star(SyntheticStar::round(30.0, 30.0, 2000.0, 2.0))
            .with_star(SyntheticStar::round(90.0, 40.0, 4000.0, 2.0))
            .with_star(SyntheticStar::round(60.0, 95.0, 1000.0, 2.0))
            .render();

        let candidates = detect_stars(&pixels, &params());
        assert_eq!(candidates.len(), 3, "{:?}", candidates);
        assert_eq!((candidates[0].x, candidates[0].y), (90, 40));
        assert_eq!((candidates[1].x, candidates[1].y), (30, 30));
        assert_eq!((candidates[2].x, candidates[2].y), (60, 95));
        for c in &candidates {
            assert!((c.background - 1000.0).abs() < 10.0, "bg {}", c.background);
            assert!(c.peak > c.background);
        }
    }

    #[test]
    fn test_close_pair_is_merged() {
        let pixels = StarField::new(96, 96, 100.0, 1.0)
            .with_star(SyntheticStar::round(48.0, 48.0, 3000.0, 1.5))
            .with_star(SyntheticStar::round(51.0, 48.0, 1500.0, 1.5))
            .render();

        let candidates = detect_stars(&pixels, &params());
        assert_eq!(candidates.len(), 1, "{:?}", candidates);
        assert_eq!((candidates[0].x, candidates[0].y), (48, 48));
    }

    #[test]
    fn test_merge_on_dense_field_keeps_brightest_spacing() {
        // Every pixel of a 60x60 patch, brightness falling off from one corner
        let mut sorted: Vec<StarCandidate> = (0..60)
            .flat_map(|y| (0..60).map(move |x| (x, y)))
            .map(|(x, y)| StarCandidate {
                x,
                y,
                peak: 10_000.0 - (x * 61 + y) as f64,
                background: 0.0,
            })
            .collect();
        sorted.sort_by(|a, b| b.peak.total_cmp(&a.peak));

        let distance = 5.0;
        let kept = merge_close(sorted.clone(), distance);

        let mut expected: Vec<StarCandidate> = Vec::new();
        for c in sorted {
            let crowded = expected.iter().any(|k| {
                let dx = k.x as f64 - c.x as f64;
                let dy = k.y as f64 - c.y as f64;
                dx * dx + dy * dy < distance * distance
            });
            if !crowded {
                expected.push(c);
            }
        }
        assert_eq!(kept, expected);
        assert_eq!((kept[0].x, kept[0].y), (0, 0));
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                let d = ((a.x as f64 - b.x as f64).powi(2) + (a.y as f64 - b.y as f64).powi(2)).sqrt();
                assert!(d >= distance);
            }
        }
    }

    #[test]
    fn test_border_stars_are_dropped() {
        let pixels = StarField::new(80, 80, 100.0, 1.0)
            .with_star(SyntheticStar::round(2.0, 40.0, 3000.0, 1.5))
            .with_star(SyntheticStar::round(40.0, 40.0, 3000.0, 1.5))
            .render();

        let candidates = detect_stars(&pixels, &params());
        assert_eq!(candidates.len(), 1);
        assert_eq!((candidates[0].x, candidates[0].y), (40, 40));
    }

    #[test]
    fn test_max_stars_cap() {
        let mut field = StarField::new(200, 200, 100.0, 1.0);
        for i in 0..4 {
            for j in 0..4 {
                field = field.with_star(SyntheticStar::round(
                    30.0 + 40.0 * i as f64,
                    30.0 + 40.0 * j as f64,
                    1000.0 + 100.0 * (i * 4 + j) as f64,
                    1.5,
                ));
            }
        }
        let pixels = field.render();
        let capped = DetectionParams {
            max_stars: 5,
            ..params()
        };
        let candidates = detect_stars(&pixels, &capped);
        assert_eq!(candidates.len(), 5);
        assert!(candidates.windows(2).all(|w| w[0].peak >= w[1].peak));
    }

    #[test]
    fn test_plateau_yields_single_maximum() {
        let smoothed = vec![
            0.0, 0.0, 0.0, 0.0, //
            0.0, 5.0, 5.0, 0.0, //
            0.0, 5.0, 5.0, 0.0, //
            0.0, 0.0, 0.0, 0.0,
        ];
        let maxima: Vec<(usize, usize)> = (0..4)
            .flat_map(|y| (0..4).map(move |x| (x, y)))
            .filter(|&(x, y)| is_local_max(&smoothed, 4, 4, x, y, 1))
            .filter(|&(x, y)| smoothed[y * 4 + x] > 0.0)
            .collect();
        assert_eq!(maxima, vec![(1, 1)]);
    }
}
