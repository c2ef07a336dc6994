//! Teardown of temporary state
//!
//! Mounted images, half-built image files and the working directory are
//! tracked here so both a normal exit and an interrupt can release them.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::dmg;
use crate::error::LoopsError;

#[derive(Debug, Default)]
pub struct Cleanup {
    mounts: Vec<PathBuf>,
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

pub type SharedCleanup = Arc<Mutex<Cleanup>>;

impl Cleanup {
    pub fn shared() -> SharedCleanup {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn track_mount(&mut self, mountpoint: &Path) {
        self.mounts.push(mountpoint.to_path_buf());
    }

    /// Forget a mount that has already been ejected
    pub fn release_mount(&mut self, mountpoint: &Path) {
        self.mounts.retain(|m| m != mountpoint);
    }

    pub fn track_file(&mut self, file: &Path) {
        self.files.push(file.to_path_buf());
    }

    /// Keep a file that is no longer temporary
    pub fn release_file(&mut self, file: &Path) {
        self.files.retain(|f| f != file);
    }

    pub fn track_dir(&mut self, dir: &Path) {
        self.dirs.push(dir.to_path_buf());
    }

    /// Eject every tracked mount, then remove tracked files and directories
    pub fn run(&mut self) {
        for mountpoint in self.mounts.drain(..) {
            dmg::eject(&mountpoint, false);
        }

        for file in self.files.drain(..) {
            if file.exists() {
                match std::fs::remove_file(&file) {
                    Ok(()) => tracing::warn!("Removed incomplete {}", file.display()),
                    Err(e) => tracing::debug!("Failed to remove {}: {}", file.display(), e),
                }
            }
        }

        for dir in self.dirs.drain(..) {
            if dir.exists() {
                match std::fs::remove_dir_all(&dir) {
                    Ok(()) => tracing::warn!("Tidied up temporary working directory."),
                    Err(e) => tracing::debug!("Failed to remove {}: {}", dir.display(), e),
                }
            }
        }
    }
}

/// Run cleanup on a shared handle, tolerating a poisoned lock
pub fn run_shared(shared: &SharedCleanup) {
    match shared.lock() {
        Ok(mut cleanup) => cleanup.run(),
        Err(poisoned) => poisoned.into_inner().run(),
    }
}

/// Clean up and exit when the process is interrupted
pub fn install_handler(shared: SharedCleanup) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::warn!("Interrupted, cleaning up");
        run_shared(&shared);
        std::process::exit(i32::from(LoopsError::Interrupted.code()));
    })
    .context("Failed to set signal handler")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_removes_tracked_dirs() {
        let root = tempdir().unwrap();
        let work = root.path().join("work");
        std::fs::create_dir_all(work.join("nested")).unwrap();

        let shared = Cleanup::shared();
        shared.lock().unwrap().track_dir(&work);
        run_shared(&shared);

        assert!(!work.exists());
        assert!(shared.lock().unwrap().dirs.is_empty());
    }

    #[test]
    fn test_run_removes_tracked_files() {
        let root = tempdir().unwrap();
        let sparse = root.path().join("content.dmg.sparseimage");
        let kept = root.path().join("kept.dmg.sparseimage");
        std::fs::write(&sparse, b"partial").unwrap();
        std::fs::write(&kept, b"done").unwrap();

        let shared = Cleanup::shared();
        {
            let mut cleanup = shared.lock().unwrap();
            cleanup.track_file(&sparse);
            cleanup.track_file(&kept);
            cleanup.release_file(&kept);
        }
        run_shared(&shared);

        assert!(!sparse.exists());
        assert!(kept.exists());
        assert!(shared.lock().unwrap().files.is_empty());
    }

    #[test]
    fn test_release_mount() {
        let mut cleanup = Cleanup::default();
        cleanup.track_mount(Path::new("/tmp/a"));
        cleanup.track_mount(Path::new("/tmp/b"));
        cleanup.release_mount(Path::new("/tmp/a"));
        assert_eq!(cleanup.mounts, vec![PathBuf::from("/tmp/b")]);
    }
}
