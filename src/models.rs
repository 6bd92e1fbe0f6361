use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Conversion factor from (pixel size in µm / focal length in mm) to arcsec per pixel.
pub const ARCSEC_PER_RADIAN_MILLI: f64 = 206.265;

/// Gaussian FWHM-to-sigma factor, 2·sqrt(2·ln 2).
pub const FWHM_PER_SIGMA: f64 = 2.3548;

/// Immutable 2-D array of pixel intensities, row-major.
#[derive(Debug, Clone)]
pub struct PixelMatrix {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl PixelMatrix {
    /// Build a matrix from row-major data. Returns `None` when the buffer does
    /// not match the requested shape or the frame is empty.
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Option<Self> {
        if width == 0 || height == 0 || data.len() != width * height {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Optics information read from the frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub pixel_size_um: Option<f64>,
    pub focal_length_mm: Option<f64>,
}

impl HeaderInfo {
    /// Plate scale in arcsec/pixel, if both optics values are known and positive.
    pub fn arcsec_per_pixel(&self) -> Option<f64> {
        match (self.pixel_size_um, self.focal_length_mm) {
            (Some(pixel), Some(focal)) if pixel > 0.0 && focal > 0.0 => {
                Some(pixel / focal * ARCSEC_PER_RADIAN_MILLI)
            }
            _ => None,
        }
    }
}

/// A decoded frame ready for analysis.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: PixelMatrix,
    pub header: HeaderInfo,
}

/// Content identity of a file on disk. Any change to size or modification
/// time yields a different identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub size: u64,
    pub modified_ns: u64,
}

impl FileIdentity {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        let modified_ns = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified_ns,
        })
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Local intensity peak found by the star detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarCandidate {
    pub x: usize,
    pub y: usize,
    pub peak: f64,
    pub background: f64,
}

/// Why a PSF fit was excluded from aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Valid,
    InsufficientData,
    Singular,
    DidNotConverge,
    NonPositiveAmplitude,
    CentroidDrift,
    SigmaOutOfRange,
    ResidualTooLarge,
}

/// Elliptical Gaussian fit of one star.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsfFit {
    pub x: f64,
    pub y: f64,
    pub amplitude: f64,
    pub background: f64,
    pub sigma_major: f64,
    pub sigma_minor: f64,
    /// Rotation of the major axis in radians, in `[-π/2, π/2)`.
    pub theta: f64,
    pub rms_residual: f64,
    /// `rms_residual / amplitude`.
    pub normalized_residual: f64,
    pub iterations: usize,
    pub converged: bool,
    pub status: FitStatus,
}

impl PsfFit {
    pub fn is_valid(&self) -> bool {
        self.converged && self.status == FitStatus::Valid
    }

    pub fn fwhm(&self) -> f64 {
        FWHM_PER_SIGMA * (self.sigma_major * self.sigma_minor).sqrt()
    }

    pub fn eccentricity(&self) -> f64 {
        if self.sigma_major <= 0.0 {
            return 0.0;
        }
        let ratio = (self.sigma_minor / self.sigma_major).min(1.0);
        (1.0 - ratio * ratio).sqrt()
    }
}

/// Category of a per-file failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The file could not be read or decoded.
    Load,
    /// The analysis pipeline panicked on this file.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Quality metrics of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub modified_ns: u64,
    pub star_count: usize,
    pub candidates_detected: usize,
    pub fits_rejected: usize,
    pub fwhm_pixels: Option<f64>,
    pub fwhm_arcsec: Option<f64>,
    pub eccentricity: Option<f64>,
    pub snr: Option<f64>,
    pub background_level: Option<f64>,
    pub noise_sigma: Option<f64>,
    pub arcsec_per_pixel: Option<f64>,
    pub failure: Option<FrameFailure>,
}

impl FrameMetrics {
    /// A record for a frame that could not be analyzed. The message always
    /// carries the file path so failures in one batch stay distinguishable.
    pub fn failed(path: &Path, kind: FailureKind, reason: impl std::fmt::Display) -> Self {
        let (file_size, modified_ns) = FileIdentity::from_path(path)
            .map(|id| (id.size, id.modified_ns))
            .unwrap_or((0, 0));
        let reason = reason.to_string();
        let display = path.display().to_string();
        let message = if reason.contains(&display) {
            reason
        } else {
            format!("{}: {}", display, reason)
        };
        Self {
            path: path.to_path_buf(),
            file_name: file_name_of(path),
            file_size,
            modified_ns,
            star_count: 0,
            candidates_detected: 0,
            fits_rejected: 0,
            fwhm_pixels: None,
            fwhm_arcsec: None,
            eccentricity: None,
            snr: None,
            background_level: None,
            noise_sigma: None,
            arcsec_per_pixel: None,
            failure: Some(FrameFailure { kind, message }),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            path: self.path.clone(),
            size: self.file_size,
            modified_ns: self.modified_ns,
        }
    }
}
