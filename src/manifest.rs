//! Manifest loading
//!
//! A manifest reference is a URL, a file on disk or a bare manifest name
//! on the content feed. Remote manifests are fetched into a temporary
//! file inside the work directory which is removed as soon as it has been
//! parsed. Loading never fails: an unusable manifest yields no entries.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use plist::Dictionary;

use crate::codec;
use crate::config::FeedConfig;
use crate::net::{FetchOptions, Probe};

/// Where a manifest lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRef {
    Url(String),
    Path(PathBuf),
}

impl ManifestRef {
    /// Resolve a user supplied manifest name
    ///
    /// URLs are kept, existing files are read in place and anything else
    /// is looked up on the feed.
    pub fn resolve(name: &str, feed_url: &str) -> Self {
        if is_url(name) {
            return ManifestRef::Url(name.to_string());
        }

        let path = Path::new(name);
        if path.exists() {
            return ManifestRef::Path(path.to_path_buf());
        }

        ManifestRef::Url(format!("{}/{}", feed_url.trim_end_matches('/'), name))
    }

    pub fn as_source(&self) -> String {
        match self {
            ManifestRef::Url(url) => url.clone(),
            ManifestRef::Path(path) => path.display().to_string(),
        }
    }
}

impl fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_source())
    }
}

pub fn is_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Reads manifests into raw package tables
pub struct ManifestLoader<'a> {
    probe: &'a dyn Probe,
    feed: &'a FeedConfig,
    work_dir: &'a Path,
}

impl<'a> ManifestLoader<'a> {
    pub fn new(probe: &'a dyn Probe, feed: &'a FeedConfig, work_dir: &'a Path) -> Self {
        Self {
            probe,
            feed,
            work_dir,
        }
    }

    /// Raw package entries of a manifest; empty when it cannot be used
    pub fn load(&self, reference: &ManifestRef) -> Dictionary {
        match self.try_load(reference) {
            Ok(entries) => {
                tracing::debug!("Loaded {} packages from {}", entries.len(), reference);
                entries
            }
            Err(e) => {
                tracing::warn!("{:#}", e);
                Dictionary::new()
            }
        }
    }

    fn try_load(&self, reference: &ManifestRef) -> Result<Dictionary> {
        let manifest = match reference {
            ManifestRef::Url(url) => self.fetch(url)?,
            ManifestRef::Path(path) => {
                if !path.exists() {
                    bail!("{} not found", path.display());
                }
                codec::read(path)?
            }
        };

        codec::packages(manifest)
            .with_context(|| format!("No packages listed in {}", reference))
    }

    fn fetch(&self, url: &str) -> Result<Dictionary> {
        let status = self.probe.status(url);
        if !self.feed.is_ok(status) {
            bail!("{} not found (HTTP {})", url, status);
        }

        std::fs::create_dir_all(self.work_dir)
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;

        // Removed on drop whether or not parsing succeeds
        let temp = tempfile::Builder::new()
            .prefix("manifest-")
            .suffix(".plist")
            .tempfile_in(self.work_dir)
            .with_context(|| format!("Failed to create a temporary file in {}", self.work_dir.display()))?;

        let options = FetchOptions {
            quiet: true,
            resume: false,
        };
        self.probe.fetch(url, temp.path(), options)?;
        tracing::debug!("Fetched {}", url);

        let manifest = codec::read(temp.path());
        tracing::debug!("Tidying up {}", temp.path().display());
        manifest
    }
}
