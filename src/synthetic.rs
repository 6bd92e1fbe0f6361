//! Synthetic star fields for benchmarks and tests.
//!
//! Frames are rendered as a flat sky plus Gaussian read noise plus elliptical
//! Gaussian stars, and can be written out as minimal single-HDU FITS files
//! (`BITPIX = -32`) so the whole pipeline, loader included, can be exercised
//! without real data.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use byteorder::{BigEndian, WriteBytesExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::PixelMatrix;

const FITS_BLOCK: usize = 2880;

/// One elliptical Gaussian star.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticStar {
    pub x: f64,
    pub y: f64,
    pub amplitude: f64,
    pub sigma_major: f64,
    pub sigma_minor: f64,
    pub theta: f64,
}

impl SyntheticStar {
    pub fn round(x: f64, y: f64, amplitude: f64, sigma: f64) -> Self {
        Self {
            x,
            y,
            amplitude,
            sigma_major: sigma,
            sigma_minor: sigma,
            theta: 0.0,
        }
    }
}

/// Description of a synthetic frame.
#[derive(Debug, Clone)]
pub struct StarField {
    pub width: usize,
    pub height: usize,
    pub background: f64,
    pub noise_sigma: f64,
    pub stars: Vec<SyntheticStar>,
    pub seed: u64,
}

impl StarField {
    pub fn new(width: usize, height: usize, background: f64, noise_sigma: f64) -> Self {
        Self {
            width,
            height,
            background,
            noise_sigma,
            stars: Vec::new(),
            seed: 0x5eed,
        }
    }

    pub fn with_star(mut self, star: SyntheticStar) -> Self {
        self.stars.push(star);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Scatter `count` stars at random positions at least `margin` pixels from
    /// the border, with amplitudes between `min_amplitude` and `max_amplitude`.
    pub fn with_random_stars(
        mut self,
        count: usize,
        sigma: f64,
        min_amplitude: f64,
        max_amplitude: f64,
        margin: f64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1));
        let max_x = (self.width as f64 - margin).max(margin + 1.0);
        let max_y = (self.height as f64 - margin).max(margin + 1.0);
        for _ in 0..count {
            self.stars.push(SyntheticStar::round(
                rng.random_range(margin..max_x),
                rng.random_range(margin..max_y),
                rng.random_range(min_amplitude..=max_amplitude),
                sigma,
            ));
        }
        self
    }

    pub fn render(&self) -> PixelMatrix {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut data: Vec<f64> = (0..self.width * self.height)
            .map(|_| self.background + self.noise_sigma * standard_normal(&mut rng))
            .collect();

        for star in &self.stars {
            let reach = (star.sigma_major.max(star.sigma_minor) * 6.0).ceil();
            let x0 = (star.x - reach).floor().max(0.0) as usize;
            let y0 = (star.y - reach).floor().max(0.0) as usize;
            let x1 = ((star.x + reach).ceil() as usize).min(self.width.saturating_sub(1));
            let y1 = ((star.y + reach).ceil() as usize).min(self.height.saturating_sub(1));
            let (sin_t, cos_t) = star.theta.sin_cos();
            let inv_a = 1.0 / (2.0 * star.sigma_major * star.sigma_major);
            let inv_b = 1.0 / (2.0 * star.sigma_minor * star.sigma_minor);

            for y in y0..=y1 {
                for x in x0..=x1 {
                    let dx = x as f64 - star.x;
                    let dy = y as f64 - star.y;
                    let u = dx * cos_t + dy * sin_t;
                    let v = -dx * sin_t + dy * cos_t;
                    data[y * self.width + x] +=
                        star.amplitude * (-(u * u * inv_a + v * v * inv_b)).exp();
                }
            }
        }

        let pixels = data.into_iter().map(|v| v as f32).collect();
        PixelMatrix::new(self.width, self.height, pixels)
            .unwrap_or_else(|| unreachable!("render buffer always matches the field shape"))
    }
}

/// Box–Muller standard normal sample.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Draw `count` samples from N(mean, sigma²).
pub fn normal_samples(count: usize, mean: f64, sigma: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| mean + sigma * standard_normal(&mut rng))
        .collect()
}

/// Optional optics cards written into the primary header.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitsHeaderCards {
    pub pixel_size_um: Option<f64>,
    pub focal_length_mm: Option<f64>,
}

/// Write a single-HDU 32-bit float FITS file.
pub fn write_fits(
    path: &Path,
    width: usize,
    height: usize,
    data: &[f32],
    cards: &FitsHeaderCards,
) -> Result<()> {
    anyhow::ensure!(
        data.len() == width * height,
        "pixel buffer has {} values, expected {}x{}",
        data.len(),
        width,
        height
    );

    let mut header = String::new();
    push_card(&mut header, "SIMPLE", "T");
    push_card(&mut header, "BITPIX", "-32");
    push_card(&mut header, "NAXIS", "2");
    push_card(&mut header, "NAXIS1", &width.to_string());
    push_card(&mut header, "NAXIS2", &height.to_string());
    if let Some(pixel) = cards.pixel_size_um {
        push_card(&mut header, "XPIXSZ", &format!("{:.6}", pixel));
    }
    if let Some(focal) = cards.focal_length_mm {
        push_card(&mut header, "FOCALLEN", &format!("{:.6}", focal));
    }
    header.push_str(&format!("{:<80}", "END"));
    while header.len() % FITS_BLOCK != 0 {
        header.push(' ');
    }

    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(header.as_bytes())?;
    for &value in data {
        writer.write_f32::<BigEndian>(value)?;
    }
    let data_bytes = data.len() * 4;
    let padding = (FITS_BLOCK - data_bytes % FITS_BLOCK) % FITS_BLOCK;
    writer.write_all(&vec![0u8; padding])?;
    writer.flush()?;
    Ok(())
}

/// Render a field and write it as FITS in one step.
pub fn write_field(path: &Path, field: &StarField, cards: &FitsHeaderCards) -> Result<()> {
    let pixels = field.render();
    write_fits(path, pixels.width(), pixels.height(), pixels.data(), cards)
}

fn push_card(header: &mut String, keyword: &str, value: &str) {
    header.push_str(&format!("{:<8}= {:>20}{:<50}", keyword, value, ""));
}
