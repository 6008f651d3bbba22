use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

static STAGING_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Replaces `path` with `content` in one rename; readers see the old or the
/// new text, never a partial write.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("'{}' does not name a file", path.display());
    };
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let staged = staging_path(dir, file_name);
    let written = stage(&staged, content).and_then(|()| {
        fs::rename(&staged, path).with_context(|| {
            format!("failed to move {} into {}", staged.display(), path.display())
        })
    });
    if written.is_err() {
        let _ = fs::remove_file(&staged);
    }
    written
}

/// Unique per process and per call, so concurrent writers never share a file.
fn staging_path(dir: &Path, file_name: &str) -> PathBuf {
    let sequence = STAGING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".{file_name}.{}-{sequence}.staged", std::process::id()))
}

fn stage(staged: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staged)
        .with_context(|| format!("failed to create {}", staged.display()))?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write {}", staged.display()))
}
