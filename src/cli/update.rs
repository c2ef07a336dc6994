//! Manifest update check command

use anyhow::Result;
use colored::Colorize;

use super::Options;
use crate::compare::application_of;
use crate::config::Config;
use crate::net::Probe;
use crate::system;
use crate::updater::{cache_path, CheckAhead, UpdateCache, UpdateChecker};

/// Applications to check, each with the manifest to fall back on
fn targets(options: &Options, config: &Config, manifests: &[String]) -> Vec<(String, String)> {
    if !manifests.is_empty() {
        return manifests
            .iter()
            .map(|m| (application_of(m), m.clone()))
            .filter(|(app, _)| config.applications.contains_key(app))
            .collect();
    }

    let apps = if options.apps.is_empty() {
        config.applications.keys().cloned().collect()
    } else {
        config.expand_apps(&options.apps)
    };

    apps.into_iter()
        .filter_map(|app| {
            let latest = config.applications.get(&app)?.latest()?.to_string();
            Some((app, latest))
        })
        .collect()
}

/// Manifest each application was known by before this check
fn known_manifests(cache: &UpdateCache, apps: &[(String, String)]) -> Vec<String> {
    apps.iter()
        .map(|(app, fallback)| {
            cache
                .apps
                .get(app)
                .map_or_else(|| fallback.clone(), |entry| entry.manifest.clone())
        })
        .collect()
}

/// Look for newer manifests and return the ones to process
pub fn run(
    options: &Options,
    config: &Config,
    probe: &dyn Probe,
    manifests: &[String],
) -> Result<Vec<String>> {
    println!("{}", "Checking for updated manifests...".cyan());

    let path = cache_path(
        &config.paths.update_cache_system,
        &config.paths.update_cache_user,
        system::is_root(),
    );
    let mut cache = UpdateCache::load(&path);

    let defaults = CheckAhead::default();
    let ahead = CheckAhead {
        minor: options.check_ahead.first().copied().unwrap_or(defaults.minor),
        patch: options.check_ahead.get(1).copied().unwrap_or(defaults.patch),
    };

    let apps = targets(options, config, manifests);
    let known = known_manifests(&cache, &apps);
    let found = UpdateChecker::new(probe, &config.feed, ahead).check(&mut cache, &apps);

    if let Err(e) = cache.save(&path) {
        tracing::warn!("Could not save update cache: {:#}", e);
    }

    for (((app, _), previous), current) in apps.iter().zip(&known).zip(&found) {
        if previous == current {
            println!("  {} {} {}", "✓".cyan(), app.bold(), "(up to date)".dimmed());
        } else {
            println!("  {} {} {}", "✓".green(), app.bold(), current.green());
        }
    }
    println!();

    Ok(found)
}
