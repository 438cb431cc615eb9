//! Placing dataset files into a reconciled view on disk.

use crate::config::MaterializeMode;
use crate::ContinualResult;
use std::fs;
use std::path::Path;

/// Strategy for making a source file visible at a destination path.
pub trait Materializer: Send + Sync {
    /// Make `src` available at `dst`. An existing `dst` is left untouched.
    fn place(&self, src: &Path, dst: &Path) -> ContinualResult<()>;

    /// Strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Symlink each file, falling back to a copy where symlinks fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymlinkOrCopy;

/// Always copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOnly;

fn prepare(dst: &Path) -> ContinualResult<bool> {
    if dst.symlink_metadata().is_ok() {
        return Ok(false);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(true)
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(src, dst)
}

#[cfg(not(any(unix, windows)))]
fn symlink(_src: &Path, _dst: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks unsupported",
    ))
}

impl Materializer for SymlinkOrCopy {
    fn place(&self, src: &Path, dst: &Path) -> ContinualResult<()> {
        if !prepare(dst)? {
            return Ok(());
        }
        let target = fs::canonicalize(src).unwrap_or_else(|_| src.to_path_buf());
        if let Err(e) = symlink(&target, dst) {
            tracing::debug!(src = %src.display(), error = %e, "symlink failed, copying");
            fs::copy(src, dst)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "symlink_or_copy"
    }
}

impl Materializer for CopyOnly {
    fn place(&self, src: &Path, dst: &Path) -> ContinualResult<()> {
        if prepare(dst)? {
            fs::copy(src, dst)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "copy"
    }
}

/// Materializer for a configured mode.
pub fn materializer_for(mode: MaterializeMode) -> Box<dyn Materializer> {
    match mode {
        MaterializeMode::SymlinkOrCopy => Box::new(SymlinkOrCopy),
        MaterializeMode::Copy => Box::new(CopyOnly),
    }
}
