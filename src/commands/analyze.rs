use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{fmt_opt, load_config};
use crate::cache::MetricsCache;
use crate::cache_store::{open_connection, CacheStore};
use crate::cli::{OutputFormat, TuningOptions};
use crate::models::FrameMetrics;
use crate::orchestrator::{BatchReport, BatchState, BatchSummary, Orchestrator};
use crate::statistics::{BandStatistics, Metric};
use crate::worklist::discover_frames;

pub struct AnalyzeOptions<'a> {
    pub paths: &'a [PathBuf],
    pub recursive: bool,
    pub format: OutputFormat,
    pub config: Option<&'a Path>,
    pub cache_db: Option<&'a Path>,
    pub sigma: f64,
    pub tuning: &'a TuningOptions,
}

pub fn analyze(options: AnalyzeOptions) -> Result<()> {
    let config = load_config(options.config, options.tuning)?;
    let frames = discover_frames(options.paths, options.recursive)?;
    if frames.is_empty() {
        println!("No FITS files found");
        return Ok(());
    }

    let cache = MetricsCache::new();
    let connection = match options.cache_db {
        Some(path) => {
            let conn = open_connection(path)?;
            let store = CacheStore::new(&conn);
            store.init_schema()?;
            let restored = store.load_into(&cache)?;
            let pruned = cache.prune_missing();
            tracing::info!(
                "💾 Loaded {} cached results from {:?} ({} pruned)",
                restored,
                path,
                pruned
            );
            Some(conn)
        }
        None => None,
    };

    let orchestrator = Arc::new(Orchestrator::with_fits_loader(&config, cache.clone())?);
    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(async {
        let mut handle = orchestrator.spawn(frames);

        let cancel = handle.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("🛑 Interrupt received, finishing frames in flight");
                cancel.cancel();
            }
        });

        while let Some(progress) = handle.progress.recv().await {
            let marker = if progress.failed {
                "❌"
            } else if progress.cached {
                "💾"
            } else {
                "✅"
            };
            tracing::info!(
                "[{}/{}] {} {}",
                progress.completed,
                progress.total,
                marker,
                progress.file_name
            );
        }

        handle.wait().await.context("Batch analysis task failed")
    })?;

    if let Some(conn) = &connection {
        CacheStore::new(conn)
            .save(&cache)
            .context("Failed to save analysis cache")?;
    }

    let output = match options.format {
        OutputFormat::Table => render_table(&report, options.sigma),
        OutputFormat::Csv => render_csv(&report),
        OutputFormat::Json => render_json(&report, options.sigma)?,
    };
    print!("{}", output);
    Ok(())
}

fn status_of(frame: &FrameMetrics) -> String {
    match &frame.failure {
        Some(failure) => format!("FAILED: {}", failure.message),
        None if frame.star_count == 0 => "no stars".to_string(),
        None => "ok".to_string(),
    }
}

/// Names of the metrics on which each frame is an outlier.
fn outlier_flags(report: &BatchReport, sigma: f64) -> Vec<Vec<Metric>> {
    let mut flags = vec![Vec::new(); report.frames.len()];
    for metric in Metric::ALL {
        for index in report.outlier_indices(metric, sigma) {
            flags[index].push(metric);
        }
    }
    flags
}

pub fn render_table(report: &BatchReport, sigma: f64) -> String {
    let mut out = String::new();
    let flags = outlier_flags(report, sigma);

    let _ = writeln!(
        out,
        "{:<40} {:>6} {:>8} {:>8} {:>6} {:>8} {:>10}  {}",
        "File", "Stars", "FWHM px", "FWHM \"", "Ecc", "SNR", "Background", "Status"
    );
    let _ = writeln!(out, "{}", "-".repeat(100));
    for (frame, flagged) in report.frames.iter().zip(&flags) {
        let mut status = status_of(frame);
        if !flagged.is_empty() {
            let names: Vec<&str> = flagged.iter().map(|m| m.name()).collect();
            status.push_str(&format!(" [outlier: {}]", names.join(", ")));
        }
        let _ = writeln!(
            out,
            "{:<40} {:>6} {:>8} {:>8} {:>6} {:>8} {:>10}  {}",
            truncate(&frame.file_name, 40),
            frame.star_count,
            fmt_opt(frame.fwhm_pixels, 2),
            fmt_opt(frame.fwhm_arcsec, 2),
            fmt_opt(frame.eccentricity, 3),
            fmt_opt(frame.snr, 1),
            fmt_opt(frame.background_level, 1),
            status
        );
    }

    let bands = report.all_band_statistics();
    if !bands.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<14} {:>6} {:>10} {:>10} {:>23} {:>23}",
            "Metric", "N", "Median", "Sigma", "±1σ", "±2σ"
        );
        for (metric, stats) in &bands {
            let _ = writeln!(
                out,
                "{:<14} {:>6} {:>10.3} {:>10.3} {:>10.3} .. {:>9.3} {:>10.3} .. {:>9.3}",
                metric.name(),
                stats.count,
                stats.median,
                stats.sigma,
                stats.band_1sigma.0,
                stats.band_1sigma.1,
                stats.band_2sigma.0,
                stats.band_2sigma.1
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", summary_line(report));
    out
}

fn summary_line(report: &BatchReport) -> String {
    let s = &report.summary;
    let state = match report.state {
        BatchState::Cancelled => " (cancelled)",
        _ => "",
    };
    format!(
        "{} frames{}: {} analyzed, {} cached, {} failed, {} skipped, {} worker(s), {}",
        s.total_files,
        state,
        s.frames_analyzed,
        s.cache_hits,
        s.frames_failed,
        s.frames_skipped,
        s.workers_used,
        humantime::format_duration(std::time::Duration::from_millis(
            s.elapsed.as_millis() as u64
        ))
    )
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        return name.to_string();
    }
    let tail: String = name
        .chars()
        .rev()
        .take(width - 1)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

pub fn render_csv(report: &BatchReport) -> String {
    let mut out = String::from(
        "path,file_name,star_count,candidates_detected,fits_rejected,fwhm_pixels,fwhm_arcsec,eccentricity,snr,background,noise_sigma,failure\n",
    );
    let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
    for frame in &report.frames {
        let failure = frame
            .failure
            .as_ref()
            .map(|f| csv_escape(&f.message))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            csv_escape(&frame.path.display().to_string()),
            csv_escape(&frame.file_name),
            frame.star_count,
            frame.candidates_detected,
            frame.fits_rejected,
            opt(frame.fwhm_pixels),
            opt(frame.fwhm_arcsec),
            opt(frame.eccentricity),
            opt(frame.snr),
            opt(frame.background_level),
            opt(frame.noise_sigma),
            failure
        );
    }
    out
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    state: BatchState,
    summary: &'a BatchSummary,
    frames: &'a [FrameMetrics],
    statistics: BTreeMap<&'static str, BandStatistics>,
    outliers: BTreeMap<&'static str, Vec<&'a str>>,
}

pub fn render_json(report: &BatchReport, sigma: f64) -> Result<String> {
    let statistics = report
        .all_band_statistics()
        .into_iter()
        .map(|(metric, stats)| (metric.name(), stats))
        .collect();
    let outliers = Metric::ALL
        .iter()
        .map(|&metric| {
            let names = report
                .outlier_indices(metric, sigma)
                .into_iter()
                .map(|i| report.frames[i].file_name.as_str())
                .collect::<Vec<_>>();
            (metric.name(), names)
        })
        .filter(|(_, names)| !names.is_empty())
        .collect();

    let json = JsonReport {
        state: report.state,
        summary: &report.summary,
        frames: &report.frames,
        statistics,
        outliers,
    };
    let mut text = serde_json::to_string_pretty(&json).context("Failed to serialize report")?;
    text.push('\n');
    Ok(text)
}
