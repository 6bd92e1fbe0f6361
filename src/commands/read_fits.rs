use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::fmt_opt;
use crate::cli::OutputFormat;
use crate::frame_loader::{FitsLoader, FrameLoader};
use crate::models::{FileIdentity, HeaderInfo};
use crate::star_detection::ImageStatistics;

/// Everything `read-fits` reports about one file.
#[derive(Debug, Clone, Serialize)]
pub struct FitsSummary {
    pub path: PathBuf,
    pub file_size: u64,
    pub width: usize,
    pub height: usize,
    pub header: HeaderInfo,
    pub arcsec_per_pixel: Option<f64>,
    pub background: f64,
    pub noise_sigma: f64,
    pub min: f32,
    pub max: f32,
}

pub fn summarize(path: &Path) -> Result<FitsSummary> {
    let identity = FileIdentity::from_path(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let frame = FitsLoader.load(path)?;
    let stats = ImageStatistics::compute(&frame.pixels, 0);

    let (min, max) = frame
        .pixels
        .data()
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    Ok(FitsSummary {
        path: path.to_path_buf(),
        file_size: identity.size,
        width: frame.pixels.width(),
        height: frame.pixels.height(),
        header: frame.header,
        arcsec_per_pixel: frame.header.arcsec_per_pixel(),
        background: stats.background,
        noise_sigma: stats.noise_sigma,
        min,
        max,
    })
}

pub fn read_fits(path: &Path, format: OutputFormat) -> Result<()> {
    let summary = summarize(path)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Csv => print!("{}", render_csv(&summary)),
        OutputFormat::Table => print!("{}", render_table(&summary)),
    }
    Ok(())
}

fn render_table(s: &FitsSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "📁 {}", s.path.display());
    let _ = writeln!(out, "  Size:           {} bytes", s.file_size);
    let _ = writeln!(out, "  Dimensions:     {} x {}", s.width, s.height);
    let _ = writeln!(out, "  Pixel size:     {} µm", fmt_opt(s.header.pixel_size_um, 2));
    let _ = writeln!(out, "  Focal length:   {} mm", fmt_opt(s.header.focal_length_mm, 1));
    let _ = writeln!(out, "  Plate scale:    {} \"/px", fmt_opt(s.arcsec_per_pixel, 3));
    let _ = writeln!(out, "  Background:     {:.2}", s.background);
    let _ = writeln!(out, "  Noise sigma:    {:.2}", s.noise_sigma);
    let _ = writeln!(out, "  Range:          {:.1} .. {:.1}", s.min, s.max);
    out
}

fn render_csv(s: &FitsSummary) -> String {
    let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
    format!(
        "path,file_size,width,height,pixel_size_um,focal_length_mm,arcsec_per_pixel,background,noise_sigma,min,max\n{},{},{},{},{},{},{},{},{},{},{}\n",
        s.path.display(),
        s.file_size,
        s.width,
        s.height,
        opt(s.header.pixel_size_um),
        opt(s.header.focal_length_mm),
        opt(s.arcsec_per_pixel),
        s.background,
        s.noise_sigma,
        s.min,
        s.max
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{write_field, FitsHeaderCards, StarField, SyntheticStar};
    use tempfile::TempDir;

    #[test]
    fn test_summarize_synthetic_frame() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("light.fits");
        let field = StarField::new(64, 48, 1000.0, 10.0)
            .with_star(SyntheticStar::round(32.0, 24.0, 5000.0, 2.0));
        let cards = FitsHeaderCards {
            pixel_size_um: Some(3.76),
            focal_length_mm: Some(500.0),
        };
        write_field(&path, &field, &cards).unwrap();

        let summary = summarize(&path).unwrap();
        assert_eq!((summary.width, summary.height), (64, 48));
        assert_eq!(summary.header.pixel_size_um, Some(3.76));
        assert!((summary.arcsec_per_pixel.unwrap() - 1.551).abs() < 0.001);
        assert!((summary.background - 1000.0).abs() < 5.0);
        assert!(summary.max > 5000.0);

        let table = render_table(&summary);
        assert!(table.contains("64 x 48"));
        let csv = render_csv(&summary);
        assert_eq!(csv.lines().count(), 2);
    }

    #[test]
    fn test_summarize_missing_file_fails() {
        assert!(summarize(Path::new("/no/such/frame.fits")).is_err());
    }
}
