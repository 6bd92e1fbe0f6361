use anyhow::{bail, Result};
use std::path::Path;

use crate::config::Config;

/// Write the default configuration to `path`, refusing to clobber an
/// existing file unless `force` is set.
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().to_file(path)?;
    println!("📝 Wrote default configuration to {}", path.display());
    Ok(())
}
