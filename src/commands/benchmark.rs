use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use super::{fmt_opt, load_config};
use crate::cache::MetricsCache;
use crate::cli::TuningOptions;
use crate::orchestrator::{BatchReport, Orchestrator};
use crate::statistics::Metric;
use crate::synthetic::{write_field, FitsHeaderCards, StarField};

/// Shape of the generated benchmark frames.
#[derive(Debug, Clone, Copy)]
pub struct BenchmarkShape {
    pub frames: usize,
    pub width: usize,
    pub height: usize,
    pub stars: usize,
    pub star_sigma: f64,
}

pub fn benchmark(
    shape: BenchmarkShape,
    config_path: Option<&Path>,
    tuning: &TuningOptions,
) -> Result<()> {
    anyhow::ensure!(shape.frames > 0, "At least one frame is required");
    let config = load_config(config_path, tuning)?;

    let temp = TempDir::new().context("Failed to create scratch directory")?;
    let started = Instant::now();
    let paths = generate_frames(temp.path(), &shape)?;
    println!(
        "🧪 Generated {} frames of {}x{} with {} stars in {}",
        paths.len(),
        shape.width,
        shape.height,
        shape.stars,
        short_duration(started.elapsed())
    );

    let orchestrator = Orchestrator::with_fits_loader(&config, MetricsCache::new())?;
    println!("⚙️  Using {} worker(s)", orchestrator.workers());

    let fresh = orchestrator.run(&paths, |_| {});
    report_pass("Fresh", &fresh);
    let cached = orchestrator.run(&paths, |_| {});
    report_pass("Cached", &cached);

    if let Some(stats) = fresh.band_statistics(Metric::Fwhm) {
        println!(
            "📏 FWHM median {:.3} px (expected {:.3}), spread σ {:.3}",
            stats.median,
            shape.star_sigma * crate::models::FWHM_PER_SIGMA,
            stats.sigma
        );
    }
    if let Some(stats) = fresh.band_statistics(Metric::StarCount) {
        println!("⭐ Stars per frame: median {:.0} of {}", stats.median, shape.stars);
    }
    Ok(())
}

fn generate_frames(dir: &Path, shape: &BenchmarkShape) -> Result<Vec<PathBuf>> {
    let cards = FitsHeaderCards {
        pixel_size_um: Some(3.76),
        focal_length_mm: Some(500.0),
    };
    let margin = (shape.star_sigma * 8.0).max(4.0);

    (0..shape.frames)
        .map(|i| {
            let path = dir.join(format!("bench_{:04}.fits", i));
            let field = StarField::new(shape.width, shape.height, 1000.0, 12.0)
                .with_seed(i as u64 + 1)
                .with_random_stars(shape.stars, shape.star_sigma, 800.0, 20_000.0, margin);
            write_field(&path, &field, &cards)?;
            Ok(path)
        })
        .collect()
}

fn report_pass(label: &str, report: &BatchReport) {
    let s = &report.summary;
    let per_frame = if s.total_files > 0 {
        s.elapsed / s.total_files as u32
    } else {
        Duration::ZERO
    };
    let fwhm = report.band_statistics(Metric::Fwhm).map(|b| b.median);
    println!(
        "⏱️  {:<7} {} total, {} per frame ({} analyzed, {} cached, {} failed, median FWHM {})",
        label,
        short_duration(s.elapsed),
        short_duration(per_frame),
        s.frames_analyzed,
        s.cache_hits,
        s.frames_failed,
        fmt_opt(fwhm, 3)
    );
}

fn short_duration(d: Duration) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_micros(d.as_micros() as u64 / 1000 * 1000))
}
