//! Download and deployment command implementation

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;

use super::{is_disk_image, Options};
use crate::cleanup::{Cleanup, SharedCleanup};
use crate::config::Config;
use crate::disk::{self, format_bytes};
use crate::dmg;
use crate::driver::{Driver, DriverOptions, FailureLog};
use crate::error::LoopsError;
use crate::installer::SystemInstaller;
use crate::manifest::{ManifestLoader, ManifestRef};
use crate::net::Probe;
use crate::package::{Layout, Mirror, RecordBuilder};
use crate::patch::PatchTable;
use crate::pkgutil::Pkgutil;
use crate::reconcile::{verify_space, DiscoveryStats, Reconciler, RunMode, Selection, SpaceContext};
use crate::source::{Source, SourceReader};

/// Sources requested on the command line
fn sources(options: &Options, config: &Config, manifests: &[String]) -> Vec<Source> {
    let mut result = Vec::new();

    // Update checks replace application sources with the manifests they found
    if !options.check_updates {
        for app in config.expand_apps(&options.apps) {
            result.push(Source::Application(app));
        }
    }

    for name in manifests {
        result.push(Source::Manifest(ManifestRef::resolve(
            name,
            &config.feed.feed_url,
        )));
    }

    result
}

/// Mount a disk image mirror, returning its mount
fn mount_mirror(image: &str, config: &Config, cleanup: &SharedCleanup) -> Result<PathBuf> {
    let mountpoint = PathBuf::from(format!("{}_source", config.dmg.mountpoint.display()));
    let mounted = dmg::mount(image, &mountpoint, true)
        .map_err(|e| LoopsError::DiskImage(format!("{:#}", e)))?;
    lock(cleanup).track_mount(&mounted.mountpoint);
    Ok(mounted.mountpoint)
}

fn lock(cleanup: &SharedCleanup) -> std::sync::MutexGuard<'_, Cleanup> {
    match cleanup.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A disk image being built for this run
#[derive(Debug, PartialEq, Eq)]
struct Build {
    target: PathBuf,
    sparse: PathBuf,
    mountpoint: PathBuf,
}

impl Build {
    /// Paths of the image without touching the disk
    fn planned(target: &Path, config: &Config) -> Self {
        Self {
            target: target.to_path_buf(),
            sparse: dmg::sparse_path(target),
            mountpoint: config.dmg.mountpoint.clone(),
        }
    }

    /// Create and mount the sparse image; both are torn down if the run fails
    fn create(&mut self, apfs: bool, config: &Config, cleanup: &SharedCleanup) -> Result<()> {
        let fs = if apfs {
            "APFS"
        } else {
            config.dmg.default_fs.as_str()
        };
        let (sparse, mounted) = dmg::create_sparse(&self.target, fs, &config.dmg)
            .map_err(|e| LoopsError::DiskImage(format!("{:#}", e)))?;

        let mut tracked = lock(cleanup);
        tracked.track_mount(&mounted.mountpoint);
        tracked.track_file(&sparse);

        if mounted.mountpoint != self.mountpoint {
            tracing::warn!(
                "{} mounted at {} instead of {}",
                sparse.display(),
                mounted.mountpoint.display(),
                self.mountpoint.display()
            );
        }
        self.sparse = sparse;
        self.mountpoint = mounted.mountpoint;
        Ok(())
    }
}

/// Download (and in deployment runs, install) the selected packages
pub fn run(
    options: &Options,
    config: &Config,
    probe: &dyn Probe,
    manifests: &[String],
    cleanup: &SharedCleanup,
) -> Result<()> {
    let run_id = Local::now().format("%Y%m%d%H%M%S");
    tracing::debug!("Run {}", run_id);

    let selection = Selection::new(options.mandatory, options.optional)?;
    let mode = if options.deployment {
        RunMode::Deployment {
            force: options.force,
        }
    } else {
        RunMode::Download
    };

    let work_dir = &config.paths.work_dir;
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;
    lock(cleanup).track_dir(work_dir);

    if options.dry_run {
        println!("{}", "Dry run mode - no changes will be made".yellow());
        println!();
    }

    // Package mirror
    let mirror = match options.pkg_server.as_deref().map(|m| m.trim_end_matches('/')) {
        Some(image) if is_disk_image(image) => Some(Mirror::DiskImage {
            mount: mount_mirror(image, config, cleanup)?,
        }),
        Some(url) => Some(Mirror::Http(url.to_string())),
        None => None,
    };

    // Disk image being built; created only once the space check passes
    let mut build = options
        .build_dmg
        .as_deref()
        .map(|target| Build::planned(target, config));

    let destination = match (&build, options.deployment) {
        (Some(build), _) => build.mountpoint.clone(),
        (None, true) => work_dir.clone(),
        (None, false) => options.destination.clone(),
    };

    let install_target = options
        .install_target
        .clone()
        .unwrap_or_else(|| config.install.target.clone());

    let mut layout = Layout::new(&config.feed.feed_url, &destination);
    layout.cache_server = options.cache_server.clone();
    layout.mirror = mirror;
    layout.flat = options.flat_mirror;
    layout.install_in_place = options.deployment && layout.source_is_local();

    println!(
        "{}",
        if options.dry_run {
            "Processing Apple audio content (dry run), this may take some time."
        } else {
            "Processing Apple audio content, this may take some time."
        }
        .cyan()
    );
    if !options.deployment {
        tracing::info!("Download destination is {}", destination.display());
    }

    // Resolve every source
    let database = Pkgutil;
    let patches = PatchTable::load(config.paths.patches.as_deref())?;
    let loader = ManifestLoader::new(probe, &config.feed, work_dir);
    let builder = RecordBuilder::new(&layout, probe, &database);
    let reader = SourceReader::new(&loader, &patches, &builder);

    let mut reconciler = Reconciler::new();
    for source in sources(options, config, manifests) {
        let records = match &source {
            Source::Application(name) => match config.applications.get(name) {
                Some(app) => reader.application(
                    name,
                    app,
                    &config.install.app_folder,
                    reconciler.registry_mut(),
                ),
                None => {
                    tracing::warn!("Unknown application {}", name);
                    Vec::new()
                }
            },
            Source::Manifest(reference) => reader.manifest(reference, false, reconciler.registry_mut()),
        };
        reconciler.add(records);
    }

    if reconciler.is_empty() {
        if options.dry_run {
            println!("{}", "No packages found.".yellow());
            return Ok(());
        }
        return Err(LoopsError::NoPackages.into());
    }

    let plan = reconciler.plan(mode, selection);
    let stats = DiscoveryStats::from_records(&plan.packages);
    println!("{}", stats.message(selection));

    // Space check runs before the first transfer
    let space = match (&build, options.deployment, layout.source_is_local()) {
        (_, true, true) => SpaceContext::DeployFromImage {
            install_target: install_target.clone(),
        },
        (_, true, false) => SpaceContext::Deploy {
            install_target: install_target.clone(),
        },
        (Some(build), false, _) => SpaceContext::BuildImage {
            image: build.target.clone(),
        },
        (None, false, _) => SpaceContext::Download {
            destination: destination.clone(),
        },
    };
    let (required, path) = space.requirement(&plan);
    let available = disk::free_space(&path)?;
    tracing::debug!(
        "{} required, {} available on {}",
        format_bytes(required),
        format_bytes(available),
        path.display()
    );
    verify_space(required, available, &path, options.dry_run)?;

    if plan.is_empty() {
        nothing_to_do(&config.paths.log_dir);
        return Ok(());
    }

    if let Some(build) = build.as_mut() {
        if !options.dry_run {
            build.create(options.apfs, config, cleanup)?;
        }
    }

    let installer = SystemInstaller;
    let driver_options = DriverOptions {
        mode,
        dry_run: options.dry_run,
        force: options.force,
        quiet: options.silent,
        allow_untrusted: options.unsigned,
        install_target,
        sleep: options.sleep.map(Duration::from_secs),
    };
    let mut driver = Driver::new(
        probe,
        &installer,
        driver_options,
        FailureLog::in_dir(&config.paths.log_dir),
    );
    let summary = driver.run(&plan);

    println!();
    if summary.failed == 0 {
        if !options.dry_run {
            println!(
                "{} Processed {} package(s)",
                "✓".green().bold(),
                summary.total
            );
        }
    } else {
        println!(
            "{} {} of {} package(s) failed",
            "✗".red().bold(),
            summary.failed,
            summary.total
        );
        if let Some(log) = &summary.failure_log {
            println!("  See {}", log.display());
        }
    }

    if let Some(build) = &build {
        if !options.dry_run {
            finish_image(build, cleanup)?;
        }
    }

    Ok(())
}

/// A run with no work has no failures, so a stale failure log goes too
fn nothing_to_do(log_dir: &Path) {
    println!("{}", "Nothing to do.".green());
    FailureLog::in_dir(log_dir).finish();
}

/// Convert the sparse image into its final compressed form
fn finish_image(build: &Build, cleanup: &SharedCleanup) -> Result<()> {
    dmg::convert_sparse(&build.sparse, &build.target, &build.mountpoint)
        .map_err(|e| LoopsError::DiskImage(format!("{:#}", e)))?;
    lock(cleanup).release_mount(&build.mountpoint);

    remove_sparse(&build.sparse);
    lock(cleanup).release_file(&build.sparse);
    println!("{} Created {}", "✓".green(), build.target.display());
    Ok(())
}

fn remove_sparse(sparse: &Path) {
    match std::fs::remove_file(sparse) {
        Ok(()) => tracing::debug!("Removed {}", sparse.display()),
        Err(e) => tracing::warn!("Failed to remove {}: {}", sparse.display(), e),
    }
}
