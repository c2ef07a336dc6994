//! Free space queries and byte formatting

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Format bytes as human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const SUFFIXES: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    let mut value = bytes as f64;
    let mut index = 0;
    while value > 1024.0 && index < SUFFIXES.len() - 1 {
        value /= 1024.0;
        index += 1;
    }

    let number = format!("{:.2}", value);
    let number = number.strip_suffix(".00").unwrap_or(&number);

    format!("{} {}", number, SUFFIXES[index])
}

/// Free bytes on the filesystem holding `path`
///
/// Destinations that do not exist yet are measured at their nearest
/// existing ancestor.
#[cfg(unix)]
pub fn free_space(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let existing = nearest_existing(path);
    let c_path = CString::new(existing.as_os_str().as_bytes())?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a valid out pointer
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        bail!(
            "statvfs failed for {}: {}",
            existing.display(),
            std::io::Error::last_os_error()
        );
    }

    Ok((stat.f_frsize as u64).saturating_mul(stat.f_bfree as u64))
}

#[cfg(not(unix))]
pub fn free_space(path: &Path) -> Result<u64> {
    bail!("Free space query is not supported for {}", path.display())
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    loop {
        if current.exists() {
            return current;
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent.to_path_buf(),
            _ => return PathBuf::from("."),
        }
    }
}

/// The space check passes only when strictly more is available than required
pub fn has_space(required: u64, available: u64) -> bool {
    required < available
}
