use anyhow::{bail, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Calibration and tooling directories never scanned for lights.
const SKIPPED_DIRECTORIES: &[&str] = &["DARK", "FLAT", "BIAS", ".git", "target", ".cache"];

const FITS_EXTENSIONS: &[&str] = &["fits", "fit", "fts"];

pub fn is_fits_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| FITS_EXTENSIONS.iter().any(|f| ext.eq_ignore_ascii_case(f)))
}

/// Build the ordered worklist from files and directories given by the user.
///
/// Files are taken as given whatever their extension, so a mislabeled file
/// is reported as a load failure instead of silently dropped. Directories
/// contribute their FITS files, descending into subdirectories when
/// `recursive` is set. The result is deduplicated and sorted by file name,
/// then full path.
pub fn discover_frames(roots: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();
    for root in roots {
        if root.is_file() {
            found.insert(root.clone());
        } else if root.is_dir() {
            scan_directory(root, recursive, &mut found);
        } else {
            bail!("Path does not exist: {}", root.display());
        }
    }

    let mut frames: Vec<PathBuf> = found.into_iter().collect();
    frames.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    tracing::info!("🗂️ Found {} frame(s) to analyze", frames.len());
    Ok(frames)
}

fn scan_directory(dir: &Path, recursive: bool, found: &mut BTreeSet<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("⚠️  Cannot read directory {:?}: {}", dir, e);
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::trace!("⚠️  Error reading entry in {:?}: {}", dir, e);
                continue;
            }
        };

        let path = entry.path();
        if path.is_dir() {
            if !recursive {
                continue;
            }
            let skipped = path
                .file_name()
                .map(|n| SKIPPED_DIRECTORIES.contains(&n.to_string_lossy().as_ref()))
                .unwrap_or(false);
            if skipped {
                tracing::trace!("⏭️  Skipping directory: {:?}", path);
                continue;
            }
            scan_directory(&path, recursive, found);
        } else if is_fits_path(&path) {
            found.insert(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_extension_matching() {
        assert!(is_fits_path(Path::new("a.fits")));
        assert!(is_fits_path(Path::new("a.FIT")));
        assert!(is_fits_path(Path::new("a.Fts")));
        assert!(!is_fits_path(Path::new("a.xisf")));
        assert!(!is_fits_path(Path::new("fits")));
    }

    #[test]
    fn test_discover_flat_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(&root.join("b_light.fits"));
        touch(&root.join("a_light.FIT"));
        touch(&root.join("notes.txt"));
        touch(&root.join("night2/c_light.fits"));

        let frames = discover_frames(&[root.to_path_buf()], false).unwrap();
        let names: Vec<String> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_light.FIT", "b_light.fits"]);
    }

    #[test]
    fn test_discover_recursive_skips_calibration() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(&root.join("night1/light_1.fits"));
        touch(&root.join("night2/light_2.fts"));
        touch(&root.join("night1/DARK/dark_1.fits"));
        touch(&root.join("FLAT/flat_1.fits"));
        touch(&root.join(".git/objects.fits"));

        let frames = discover_frames(&[root.to_path_buf()], true).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].ends_with("night1/light_1.fits"));
        assert!(frames[1].ends_with("night2/light_2.fts"));
    }

    #[test]
    fn test_explicit_files_are_kept_and_deduplicated() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let odd = root.join("frame.dat");
        let light = root.join("light.fits");
        touch(&odd);
        touch(&light);

        let frames =
            discover_frames(&[odd.clone(), light.clone(), root.to_path_buf()], false).unwrap();
        assert_eq!(frames, vec![odd, light]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let err = discover_frames(&[PathBuf::from("/no/such/dir")], false).unwrap_err();
        assert!(err.to_string().contains("/no/such/dir"));
    }
}
