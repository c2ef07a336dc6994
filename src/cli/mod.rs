//! Command-line interface for loopkit

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{ArgGroup, Args};

use crate::cleanup::SharedCleanup;
use crate::compare::{self as diff, DiffStyle};
use crate::config::Config;
use crate::error::LoopsError;
use crate::manifest::is_url;
use crate::net::{HttpProbe, Probe};
use crate::system;

mod compare;
mod install;
mod update;

#[derive(Debug, Clone, Args)]
#[command(group(ArgGroup::new("source").args(["apps", "plists", "fetch_latest"])))]
pub struct Options {
    /// Process content for installed applications ("all" for every one)
    #[arg(long, num_args = 1.., value_name = "APP")]
    pub apps: Vec<String>,

    /// Process manifests by name, URL or path ("all" for the newest of each app)
    #[arg(long, num_args = 1.., value_name = "PLIST")]
    pub plists: Vec<String>,

    /// Process the newest supported manifest of the named applications
    #[arg(long, num_args = 1.., value_name = "APP")]
    pub fetch_latest: Vec<String>,

    /// Select mandatory packages
    #[arg(short, long)]
    pub mandatory: bool,

    /// Select optional packages
    #[arg(short, long)]
    pub optional: bool,

    /// Install packages after downloading them (requires root)
    #[arg(long)]
    pub deployment: bool,

    /// Download destination
    #[arg(long, value_name = "DIR", default_value = "/tmp")]
    pub destination: PathBuf,

    /// Alternate package mirror: an HTTP(S) URL or a .dmg path
    #[arg(long, value_name = "URL|PATH")]
    pub pkg_server: Option<String>,

    /// Caching server in http://host:port format
    #[arg(long, value_name = "URL")]
    pub cache_server: Option<String>,

    /// Mirror without the server folder structure
    #[arg(long)]
    pub flat_mirror: bool,

    /// Download into a disk image written to PATH
    #[arg(short = 'b', long, value_name = "PATH")]
    pub build_dmg: Option<PathBuf>,

    /// Build the disk image with APFS
    #[arg(long)]
    pub apfs: bool,

    /// Download and install even when already satisfied
    #[arg(short, long)]
    pub force: bool,

    /// Show what would happen without downloading or installing
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Compare the packages of two manifests for the same application
    #[arg(long, num_args = 2, value_names = ["PLIST", "PLIST"])]
    pub compare: Vec<String>,

    /// Comparison output style
    #[arg(long, value_enum)]
    pub compare_style: Option<DiffStyle>,

    /// Look for newer manifests before processing
    #[arg(long)]
    pub check_updates: bool,

    /// How many minor and patch versions ahead to look
    #[arg(long, num_args = 2, value_names = ["MINOR", "PATCH"], default_values_t = [3, 9])]
    pub check_ahead: Vec<u32>,

    /// Target volume for installs
    #[arg(long, value_name = "PATH")]
    pub install_target: Option<PathBuf>,

    /// Install unsigned packages
    #[arg(long)]
    pub unsigned: bool,

    /// Seconds to pause between installs
    #[arg(long, value_name = "SECS")]
    pub sleep: Option<u64>,

    /// Only log warnings and errors, no progress bars
    #[arg(short, long)]
    pub silent: bool,
}

impl Options {
    fn has_source(&self) -> bool {
        !self.apps.is_empty()
            || !self.plists.is_empty()
            || !self.fetch_latest.is_empty()
            || self.check_updates
    }
}

/// Split `http://host:port/path` into scheme and port
fn scheme_and_port(url: &str) -> (Option<&str>, Option<u16>) {
    let Some((scheme, rest)) = url.split_once("://") else {
        return (None, None);
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    let port = authority
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok());
    (Some(scheme), port)
}

/// Check argument combinations before any work starts
pub fn validate(
    options: &Options,
    config: &Config,
    probe: &dyn Probe,
    is_root: bool,
) -> crate::error::Result<()> {
    let comparing = !options.compare.is_empty();

    if options.deployment && !options.dry_run && !is_root {
        return Err(LoopsError::NotRoot);
    }

    if !comparing && !options.mandatory && !options.optional {
        return Err(LoopsError::NoSelection);
    }

    if options.apfs && options.build_dmg.is_none() {
        return Err(LoopsError::ApfsWithoutBuild);
    }

    if let Some(cache) = &options.cache_server {
        let (scheme, port) = scheme_and_port(cache);
        if port.is_none() {
            return Err(LoopsError::CacheServerPort);
        }
        if scheme != Some("http") {
            return Err(LoopsError::CacheServerScheme);
        }
    }

    if let Some(mirror) = &options.pkg_server {
        validate_mirror(mirror.trim_end_matches('/'), config, probe)?;
    }

    if options.cache_server.is_some() && options.pkg_server.is_some() {
        return Err(LoopsError::CacheServerAndMirror);
    }

    if options.compare_style.is_some() && !comparing {
        return Err(LoopsError::CompareStyleWithoutCompare);
    }

    if comparing {
        diff::check_same_application(&options.compare[0], &options.compare[1])?;
    } else if !options.has_source() {
        return Err(LoopsError::NoSourceSelected);
    }

    Ok(())
}

fn validate_mirror(mirror: &str, config: &Config, probe: &dyn Probe) -> crate::error::Result<()> {
    if let (Some(scheme), _) = scheme_and_port(mirror) {
        if scheme != "http" && scheme != "https" {
            return Err(LoopsError::MirrorScheme);
        }
    }

    if is_disk_image(mirror) {
        if !is_url(mirror) && !Path::new(mirror).exists() {
            return Err(LoopsError::MirrorPathMissing(mirror.to_string()));
        }
        return Ok(());
    }

    let test_urls: Vec<String> = config
        .feed
        .mirror_test_paths
        .iter()
        .map(|p| format!("{}/{}", mirror, p))
        .collect();
    if !test_urls.iter().any(|u| config.feed.is_ok(probe.status(u))) {
        let listed: Vec<String> = test_urls.iter().map(|u| format!("'{}'", u)).collect();
        return Err(LoopsError::MirrorContentMissing(listed.join(", and/or ")));
    }

    if is_url(mirror) {
        let status = probe.status(mirror);
        if status != 0 && !config.feed.is_ok(status) {
            return Err(LoopsError::MirrorStatus(status));
        }
    }

    Ok(())
}

pub fn is_disk_image(path: &str) -> bool {
    path.ends_with(".dmg")
}

/// Execute a validated run
pub fn execute(options: Options, config: &Config, cleanup: &SharedCleanup) -> Result<()> {
    let probe = HttpProbe::new(&config.feed)?;
    validate(&options, config, &probe, system::is_root())?;

    if !options.compare.is_empty() {
        return compare::run(&options, config, &probe);
    }

    let mut manifests = manifest_names(&options, config);
    if options.check_updates {
        manifests = update::run(&options, config, &probe, &manifests)?;
    }

    install::run(&options, config, &probe, &manifests, cleanup)
}

/// Manifest names selected by `--plists` and `--fetch-latest`
pub fn manifest_names(options: &Options, config: &Config) -> Vec<String> {
    let mut names = Vec::new();

    if options.plists.iter().any(|p| p == "all") {
        names.extend(config.latest_manifests(&["all".to_string()]));
    } else {
        names.extend(options.plists.iter().cloned());
    }

    if !options.fetch_latest.is_empty() {
        names.extend(config.latest_manifests(&options.fetch_latest));
    }

    names
}
