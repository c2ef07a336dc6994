//! Package sources
//!
//! Turns a requested source (an installed application or a manifest) into
//! package records through the loader, patch table and record builder.

use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use regex::Regex;

use crate::codec;
use crate::config::ApplicationConfig;
use crate::manifest::{ManifestLoader, ManifestRef};
use crate::package::{PackageRecord, RecordBuilder};
use crate::patch::PatchTable;
use crate::registry::IdentityRegistry;
use crate::system;
use crate::version::Version;

/// A requested package source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Installed application, looked up by short name
    Application(String),
    /// Manifest on the feed, at a URL or on disk
    Manifest(ManifestRef),
}

/// Version details from an application bundle's `Info.plist`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub name: Option<String>,
    pub bundle_id: Option<String>,
    pub version: Option<String>,
    pub min_os: Option<String>,
}

impl AppInfo {
    pub fn from_dict(info: &Dictionary) -> Self {
        let get = |key: &str| info.get(key).and_then(Value::as_string).map(str::to_string);
        Self {
            name: get("CFBundleName"),
            bundle_id: get("CFBundleIdentifier"),
            version: get("CFBundleShortVersionString"),
            min_os: get("LSMinimumSystemVersion"),
        }
    }
}

/// Newest `{app}NNNN.plist` in a directory
pub fn newest_manifest(dir: &Path, app: &str) -> Option<PathBuf> {
    let pattern = Regex::new(&format!(r"^{}(\d+)\.plist$", regex::escape(app))).ok()?;

    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let number = pattern.captures(&name)?.get(1)?.as_str().to_string();
            Some((Version::parse(&number), entry.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}

/// Loads records from sources
pub struct SourceReader<'a> {
    loader: &'a ManifestLoader<'a>,
    patches: &'a PatchTable,
    builder: &'a RecordBuilder<'a>,
}

impl<'a> SourceReader<'a> {
    pub fn new(
        loader: &'a ManifestLoader<'a>,
        patches: &'a PatchTable,
        builder: &'a RecordBuilder<'a>,
    ) -> Self {
        Self {
            loader,
            patches,
            builder,
        }
    }

    /// Records of a manifest
    pub fn manifest(
        &self,
        reference: &ManifestRef,
        comparing: bool,
        registry: &mut IdentityRegistry,
    ) -> Vec<PackageRecord> {
        let entries = self.loader.load(reference);
        if entries.is_empty() {
            return Vec::new();
        }

        tracing::debug!("Loaded packages from {}", reference);
        self.patches.materialize(
            entries,
            &reference.as_source(),
            comparing,
            registry,
            self.builder,
        )
    }

    /// Records of the newest manifest shipped inside an installed application
    pub fn application(
        &self,
        name: &str,
        app: &ApplicationConfig,
        app_folder: &Path,
        registry: &mut IdentityRegistry,
    ) -> Vec<PackageRecord> {
        let contents = app_folder.join(&app.bundle).join("Contents");
        let resources = contents.join("Resources");

        if !resources.exists() {
            tracing::info!("{} is not installed", app.bundle);
            return Vec::new();
        }

        match codec::read(&contents.join("Info.plist")) {
            Ok(info) => {
                let info = AppInfo::from_dict(&info);
                if let Some(bundle_id) = &info.bundle_id {
                    tracing::debug!("Found {} at {}", bundle_id, contents.display());
                }
                tracing::warn!(
                    "{} {} requires macOS {} (macOS {} installed)",
                    info.name.as_deref().unwrap_or(name),
                    info.version.as_deref().unwrap_or("unknown"),
                    info.min_os.as_deref().unwrap_or("unknown"),
                    system::os_version()
                );
            }
            Err(e) => tracing::debug!("{:#}", e),
        }

        match newest_manifest(&resources, name) {
            Some(path) => self.manifest(&ManifestRef::Path(path), false, registry),
            None => {
                tracing::info!("No {} manifest found in {}", name, resources.display());
                Vec::new()
            }
        }
    }
}
