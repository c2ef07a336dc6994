//! Execution driver
//!
//! Walks the plan once, in order. Each package is downloaded and, in
//! deployment runs, installed straight away. A failed package is written
//! to the failure log and the run moves on to the next one.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;

use crate::disk::format_bytes;
use crate::installer::Installer;
use crate::net::{FetchOptions, Probe};
use crate::package::PackageRecord;
use crate::reconcile::{Plan, RunMode};

/// File name of the failure log inside the log directory
pub const FAILURE_LOG: &str = "loopkit_failed_installs.log";

/// Where a package got to during the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Downloading,
    Downloaded,
    Installing,
    Installed,
    Failed,
}

/// Run switches for the driver
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub mode: RunMode,
    pub dry_run: bool,
    /// Discard existing downloads before fetching
    pub force: bool,
    pub quiet: bool,
    pub allow_untrusted: bool,
    pub install_target: PathBuf,
    /// Pause between installs
    pub sleep: Option<Duration>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Download,
            dry_run: false,
            force: false,
            quiet: true,
            allow_untrusted: false,
            install_target: PathBuf::from("/"),
            sleep: None,
        }
    }
}

/// Append-only record of failed packages, removed when a run is clean
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    count: usize,
}

impl FailureLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, count: 0 }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(FAILURE_LOG))
    }

    /// Record one failure
    pub fn record(&mut self, record: &PackageRecord, error: &str) {
        self.count += 1;
        if let Err(e) = self.append(record, error) {
            tracing::error!("Failed to write {}: {:#}", self.path.display(), e);
        }
    }

    fn append(&self, record: &PackageRecord, error: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        writeln!(
            file,
            "{} {} {} -> {}: {}",
            Local::now().to_rfc3339(),
            record.identity,
            record.resolved_url,
            record.destination_path.display(),
            error
        )?;
        Ok(())
    }

    /// Remove the log when nothing failed; returns its path otherwise
    pub fn finish(&self) -> Option<PathBuf> {
        if self.count == 0 {
            if self.path.exists() {
                if let Err(e) = fs::remove_file(&self.path) {
                    tracing::debug!("Failed to remove {}: {}", self.path.display(), e);
                }
            }
            None
        } else {
            Some(self.path.clone())
        }
    }
}

/// Outcome of a pass over the plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub downloaded: usize,
    pub installed: usize,
    pub failed: usize,
    pub failure_log: Option<PathBuf>,
}

pub struct Driver<'a> {
    probe: &'a dyn Probe,
    installer: &'a dyn Installer,
    options: DriverOptions,
    failures: FailureLog,
}

impl<'a> Driver<'a> {
    pub fn new(
        probe: &'a dyn Probe,
        installer: &'a dyn Installer,
        options: DriverOptions,
        failures: FailureLog,
    ) -> Self {
        Self {
            probe,
            installer,
            options,
            failures,
        }
    }

    /// Process every package of the plan in order
    pub fn run(&mut self, plan: &Plan) -> RunSummary {
        let total = plan.len();
        let width = total.to_string().len();
        let mut summary = RunSummary {
            total,
            ..RunSummary::default()
        };

        for (index, record) in plan.packages.iter().enumerate() {
            let counter = format!("{:0width$}", index + 1, width = width);
            let stage = self.process(record, &counter, total);

            match stage {
                Stage::Downloaded => summary.downloaded += 1,
                Stage::Installed => {
                    summary.downloaded += 1;
                    summary.installed += 1;
                }
                Stage::Failed => summary.failed += 1,
                _ => {}
            }

            let last = index + 1 == total;
            if self.options.mode.is_deployment() && !self.options.dry_run && !last {
                if let Some(pause) = self.options.sleep {
                    tracing::debug!("Sleeping {}s", pause.as_secs());
                    std::thread::sleep(pause);
                }
            }
        }

        summary.failure_log = self.failures.finish();
        summary
    }

    fn process(&mut self, record: &PackageRecord, counter: &str, total: usize) -> Stage {
        let dry_run = self.options.dry_run;

        tracing::info!(
            "{} {} of {} - {} ({})",
            if dry_run { "Download" } else { "Downloading" },
            counter,
            total,
            record.download_name,
            format_bytes(record.download_size_bytes)
        );
        if let Some(warning) = status_warning(record) {
            tracing::warn!("{}", warning);
        }
        tracing::debug!(
            "{} {} {} (installed {}), file checks {:?}",
            record.identity,
            record.package_name.as_deref().unwrap_or("-"),
            record.manifest_version,
            record.installed_version,
            record.file_check_paths
        );

        if dry_run {
            if self.options.mode.is_deployment() {
                tracing::info!(
                    "{} {} of {} - {}",
                    if record.needs_upgrade { "Upgrade" } else { "Install" },
                    counter,
                    total,
                    record.download_name
                );
            }
            return Stage::Pending;
        }

        let stage = match self.download(record) {
            Ok(stage) => stage,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!("{} {}: {}", "✗".red(), record.download_name, message);
                self.failures.record(record, &message);
                return Stage::Failed;
            }
        };

        if !self.options.mode.is_deployment() {
            return stage;
        }

        self.install(record, counter, total)
    }

    fn download(&self, record: &PackageRecord) -> Result<Stage> {
        tracing::debug!("{} {:?}", record.identity, Stage::Downloading);
        let dest = &record.destination_path;
        let in_place = record.local_source && Path::new(&record.resolved_url) == dest.as_path();

        if in_place {
            return Ok(Stage::Downloaded);
        }

        if self.options.force {
            remove_if_present(dest);
        }

        if record.local_source {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&record.resolved_url, dest)
                .with_context(|| format!("Failed to copy {}", record.resolved_url))?;
        } else {
            let options = FetchOptions {
                quiet: self.options.quiet,
                resume: true,
            };
            self.probe.fetch(&record.resolved_url, dest, options)?;
        }

        Ok(Stage::Downloaded)
    }

    fn install(&mut self, record: &PackageRecord, counter: &str, total: usize) -> Stage {
        tracing::info!(
            "{} {} of {} - {}",
            if record.needs_upgrade { "Upgrading" } else { "Installing" },
            counter,
            total,
            record.download_name
        );

        tracing::debug!("{} {:?}", record.identity, Stage::Installing);
        let outcome = self.installer.install(
            &record.destination_path,
            &self.options.install_target,
            self.options.allow_untrusted,
        );

        if !outcome.success() {
            tracing::error!("{} {}: {}", "✗".red(), record.download_name, outcome.message);
            self.failures.record(
                record,
                &format!("installer exited with {}: {}", outcome.code, outcome.message),
            );
            return Stage::Failed;
        }

        tracing::info!("{} Installed {}", "✓".green(), record.download_name);

        // Files on a mounted image are installed in place and left alone
        if !record.local_source {
            remove_if_present(&record.destination_path);
            tracing::debug!("Tidied up {}", record.download_name);
        }

        Stage::Installed
    }
}

/// Warning for a source that did not answer with success when it was resolved
pub fn status_warning(record: &PackageRecord) -> Option<String> {
    match record.remote_status {
        200..=299 => None,
        _ if record.local_source => Some(format!("{} not found on mounted image", record.resolved_url)),
        0 => Some(format!("{} was unreachable", record.resolved_url)),
        status => Some(format!("{} returned HTTP {}", record.resolved_url, status)),
    }
}

/// Force mode starts every download from scratch
fn remove_if_present(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
