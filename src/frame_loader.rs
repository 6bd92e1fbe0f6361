use std::fs::File;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use fitrs::{Fits, FitsData, HeaderValue, Hdu};
use thiserror::Error;

use crate::models::{FileIdentity, Frame, HeaderInfo, PixelMatrix};

const FITS_BLOCK: usize = 2880;
const FITS_CARD: usize = 80;

/// Header keywords that carry the pixel size in microns, in lookup order.
const PIXEL_SIZE_KEYS: &[&str] = &["XPIXSZ", "PIXSIZE", "PIXSIZE1", "XPIXELSZ"];
/// Header keywords that carry the focal length in millimeters, in lookup order.
const FOCAL_LENGTH_KEYS: &[&str] = &["FOCALLEN", "FOCAL", "FOCALLENGTH", "FL"];

/// Reasons a frame could not be loaded. Every variant names the file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{path}: file not found")]
    NotFound { path: PathBuf },
    #[error("{path}: I/O error: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: not a FITS file")]
    NotFits { path: PathBuf },
    #[error("{path}: no image data found")]
    NoImageData { path: PathBuf },
    #[error("{path}: corrupt FITS container: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl LoadError {
    pub fn path(&self) -> &Path {
        match self {
            LoadError::NotFound { path }
            | LoadError::Io { path, .. }
            | LoadError::NotFits { path }
            | LoadError::NoImageData { path }
            | LoadError::Corrupt { path, .. } => path,
        }
    }

    fn from_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            LoadError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            LoadError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Source of frames for the analysis pipeline.
pub trait FrameLoader: Send + Sync {
    /// Decode the pixel matrix and optics header of one file.
    fn load(&self, path: &Path) -> Result<Frame, LoadError>;

    /// Resolve the content identity used as the cache key.
    fn identify(&self, path: &Path) -> Result<FileIdentity, LoadError> {
        FileIdentity::from_path(path).map_err(|e| LoadError::from_io(path, e))
    }
}

/// FITS loader backed by `fitrs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FitsLoader;

impl FrameLoader for FitsLoader {
    fn load(&self, path: &Path) -> Result<Frame, LoadError> {
        check_container(path)?;

        // fitrs panics on some malformed inputs; keep that contained to this file.
        let decoded = panic::catch_unwind(AssertUnwindSafe(|| decode_fits(path)));
        match decoded {
            Ok(result) => result,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "decoder panicked".to_string());
                Err(LoadError::Corrupt {
                    path: path.to_path_buf(),
                    reason,
                })
            }
        }
    }
}

/// Validate the primary header before handing the file to the decoder:
/// `SIMPLE` card, an `END` card, and enough bytes for the declared data.
fn check_container(path: &Path) -> Result<(), LoadError> {
    let mut file = File::open(path).map_err(|e| LoadError::from_io(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| LoadError::from_io(path, e))?
        .len() as usize;

    let corrupt = |reason: &str| LoadError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut block = vec![0u8; FITS_BLOCK];
    let mut header_bytes = 0usize;
    let mut bitpix: Option<i64> = None;
    let mut axes: Vec<(usize, i64)> = Vec::new();
    let mut naxis: Option<i64> = None;

    loop {
        if let Err(e) = file.read_exact(&mut block) {
            if header_bytes == 0 {
                return Err(LoadError::NotFits {
                    path: path.to_path_buf(),
                });
            }
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(corrupt("header has no END card"));
            }
            return Err(LoadError::from_io(path, e));
        }
        if header_bytes == 0 && !block.starts_with(b"SIMPLE  =") {
            return Err(LoadError::NotFits {
                path: path.to_path_buf(),
            });
        }
        header_bytes += FITS_BLOCK;

        for card in block.chunks(FITS_CARD) {
            let keyword = String::from_utf8_lossy(&card[..8]);
            let keyword = keyword.trim_end();
            if keyword == "END" {
                let Some(bitpix) = bitpix else {
                    return Err(corrupt("missing BITPIX"));
                };
                let Some(naxis) = naxis else {
                    return Err(corrupt("missing NAXIS"));
                };
                let data_bytes = if naxis == 0 {
                    0
                } else {
                    let mut count = 1usize;
                    for n in 1..=naxis as usize {
                        let len = axes
                            .iter()
                            .find(|(i, _)| *i == n)
                            .map(|(_, v)| *v)
                            .ok_or_else(|| corrupt(&format!("missing NAXIS{}", n)))?;
                        if len < 0 {
                            return Err(corrupt(&format!("negative NAXIS{}", n)));
                        }
                        count = count.saturating_mul(len as usize);
                    }
                    count.saturating_mul((bitpix.unsigned_abs() / 8) as usize)
                };
                if header_bytes.saturating_add(data_bytes) > file_len {
                    return Err(corrupt("data section is truncated"));
                }
                return Ok(());
            }

            let value = card_integer(card);
            match keyword {
                "BITPIX" => match value {
                    Some(v @ (8 | 16 | 32 | 64 | -32 | -64)) => bitpix = Some(v),
                    _ => return Err(corrupt("unsupported BITPIX")),
                },
                "NAXIS" => naxis = value,
                k if k.starts_with("NAXIS") => {
                    if let (Ok(index), Some(v)) = (k[5..].parse::<usize>(), value) {
                        axes.push((index, v));
                    }
                }
                _ => {}
            }
        }
    }
}

fn card_integer(card: &[u8]) -> Option<i64> {
    if card.len() < 10 || &card[8..10] != b"= " {
        return None;
    }
    let text = String::from_utf8_lossy(&card[10..]);
    let value = text.split('/').next()?.trim();
    value.parse::<i64>().ok()
}

fn decode_fits(path: &Path) -> Result<Frame, LoadError> {
    let fits = Fits::open(path).map_err(|e| LoadError::from_io(path, e))?;

    let mut index = 0;
    while let Some(hdu) = fits.get(index) {
        if let Some(pixels) = image_plane(&hdu) {
            let header = header_info(&hdu);
            tracing::trace!(
                "📷 Loaded {}x{} frame from HDU {} of {:?}",
                pixels.width(),
                pixels.height(),
                index,
                path
            );
            return Ok(Frame { pixels, header });
        }
        index += 1;
    }

    Err(LoadError::NoImageData {
        path: path.to_path_buf(),
    })
}

/// Extract the first 2-D plane of an HDU's data.
fn image_plane(hdu: &Hdu) -> Option<PixelMatrix> {
    fn plane<T: Copy>(
        shape: &[usize],
        data: &[T],
        convert: impl Fn(T) -> f32,
    ) -> Option<PixelMatrix> {
        if shape.len() < 2 {
            return None;
        }
        let (width, height) = (shape[0], shape[1]);
        let count = width.checked_mul(height)?;
        if count == 0 || data.len() < count {
            return None;
        }
        let pixels = data[..count].iter().map(|&v| convert(v)).collect();
        PixelMatrix::new(width, height, pixels)
    }

    match hdu.read_data() {
        FitsData::FloatingPoint32(array) => plane(&array.shape, &array.data, |v| v),
        FitsData::FloatingPoint64(array) => plane(&array.shape, &array.data, |v| v as f32),
        FitsData::IntegersI32(array) => {
            plane(&array.shape, &array.data, |v| v.unwrap_or(0) as f32)
        }
        FitsData::IntegersU32(array) => {
            plane(&array.shape, &array.data, |v| v.unwrap_or(0) as f32)
        }
        FitsData::Characters(_) => None,
    }
}

fn header_info(hdu: &Hdu) -> HeaderInfo {
    HeaderInfo {
        pixel_size_um: first_numeric(hdu, PIXEL_SIZE_KEYS),
        focal_length_mm: first_numeric(hdu, FOCAL_LENGTH_KEYS),
    }
}

fn first_numeric(hdu: &Hdu, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match hdu.value(key)? {
        HeaderValue::RealFloatingNumber(v) => Some(*v),
        HeaderValue::IntegerNumber(v) => Some(*v as f64),
        HeaderValue::CharacterString(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
    .filter(|v| v.is_finite() && *v > 0.0)
}
