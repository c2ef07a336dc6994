//! Manifest update checks
//!
//! New content releases publish manifests whose names bump the version
//! number in the file name. The checker probes names ahead of the last
//! known manifest of each application and remembers what it found in a
//! small property list cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Local};
use plist::{Dictionary, Value};

use crate::codec;
use crate::config::FeedConfig;
use crate::net::Probe;

const MANIFEST_KEY: &str = "manifest";
const LAST_CHECKED_KEY: &str = "last_checked";
const LAST_UPDATED_KEY: &str = "last_updated";

/// How far ahead of the known version to look
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckAhead {
    pub minor: u32,
    pub patch: u32,
}

impl Default for CheckAhead {
    fn default() -> Self {
        Self { minor: 3, patch: 9 }
    }
}

/// Split `1021` into major `10`, minor `2` and patch `1`
pub fn split_version(number: &str) -> Option<(String, u32, u32)> {
    if number.len() < 3 || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (major, rest) = number.split_at(number.len() - 2);
    let minor = rest[..1].parse().ok()?;
    let patch = rest[1..].parse().ok()?;
    Some((major.to_string(), minor, patch))
}

/// Manifest names to probe, oldest first
///
/// Minor and patch are single digits in manifest names so both ranges
/// stop at 9.
pub fn candidates(app: &str, manifest: &str, ahead: CheckAhead) -> Vec<String> {
    let Some(number) = manifest
        .strip_prefix(app)
        .and_then(|rest| rest.strip_suffix(".plist"))
    else {
        return Vec::new();
    };

    let Some((major, minor, patch)) = split_version(number) else {
        return Vec::new();
    };

    let last_minor = (minor + ahead.minor).min(9);
    let last_patch = (patch + ahead.patch).min(9);

    (minor..=last_minor)
        .flat_map(|m| (0..=last_patch).map(move |p| (m, p)))
        .map(|(m, p)| format!("{}{}{}{}.plist", app, major, m, p))
        .collect()
}

/// What is known about one application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUpdate {
    pub manifest: String,
    pub last_checked: Option<DateTime<Local>>,
    pub last_updated: Option<DateTime<Local>>,
}

impl AppUpdate {
    fn from_dict(dict: &Dictionary) -> Option<Self> {
        let timestamp = |key: &str| {
            dict.get(key)
                .and_then(Value::as_string)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Local))
        };

        Some(Self {
            manifest: dict.get(MANIFEST_KEY)?.as_string()?.to_string(),
            last_checked: timestamp(LAST_CHECKED_KEY),
            last_updated: timestamp(LAST_UPDATED_KEY),
        })
    }

    fn to_dict(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(MANIFEST_KEY.into(), Value::String(self.manifest.clone()));
        if let Some(t) = self.last_checked {
            dict.insert(LAST_CHECKED_KEY.into(), Value::String(t.to_rfc3339()));
        }
        if let Some(t) = self.last_updated {
            dict.insert(LAST_UPDATED_KEY.into(), Value::String(t.to_rfc3339()));
        }
        dict
    }
}

/// Persisted update-check state
#[derive(Debug, Clone, Default)]
pub struct UpdateCache {
    pub apps: BTreeMap<String, AppUpdate>,
}

impl UpdateCache {
    /// Read the cache; a missing or unreadable file starts empty
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match codec::read(path) {
            Ok(dict) => {
                let apps = dict
                    .iter()
                    .filter_map(|(app, value)| {
                        let entry = AppUpdate::from_dict(value.as_dictionary()?)?;
                        Some((app.clone(), entry))
                    })
                    .collect();
                Self { apps }
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable update cache: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dict = self
            .apps
            .iter()
            .map(|(app, entry)| (app.clone(), Value::Dictionary(entry.to_dict())))
            .collect::<Dictionary>();
        codec::write(&dict, path)
    }
}

/// Cache location for the current user
pub fn cache_path(system: &Path, user: &Path, root: bool) -> PathBuf {
    if root {
        system.to_path_buf()
    } else {
        user.to_path_buf()
    }
}

pub struct UpdateChecker<'a> {
    probe: &'a dyn Probe,
    feed: &'a FeedConfig,
    ahead: CheckAhead,
}

impl<'a> UpdateChecker<'a> {
    pub fn new(probe: &'a dyn Probe, feed: &'a FeedConfig, ahead: CheckAhead) -> Self {
        Self { probe, feed, ahead }
    }

    /// Newest reachable manifest for each `(app, fallback manifest)` pair
    ///
    /// The cache is updated in place; the caller persists it.
    pub fn check(&self, cache: &mut UpdateCache, apps: &[(String, String)]) -> Vec<String> {
        let now = Local::now();
        let mut found = Vec::new();
        let mut updated = Vec::new();

        for (app, fallback) in apps {
            let entry = cache.apps.entry(app.clone()).or_insert_with(|| AppUpdate {
                manifest: fallback.clone(),
                last_checked: None,
                last_updated: None,
            });

            let mut message = format!("Checking for updated sources to {}", app);
            if let Some(t) = entry.last_checked {
                message.push_str(&format!(" (last checked {})", t.format("%Y-%m-%d %H:%M:%S")));
            }
            if let Some(t) = entry.last_updated {
                message.push_str(&format!(
                    " - last updates found on {}",
                    t.format("%Y-%m-%d %H:%M:%S")
                ));
            }
            tracing::info!("{}", message);

            let newest = candidates(app, &entry.manifest, self.ahead)
                .into_iter()
                .filter(|name| {
                    let url = format!("{}/{}", self.feed.feed_url.trim_end_matches('/'), name);
                    tracing::debug!("Checking {}", url);
                    self.feed.is_ok(self.probe.status(&url))
                })
                .last();

            if let Some(name) = newest {
                if name != entry.manifest {
                    tracing::debug!("Found updated source {}", name);
                    entry.manifest = name.clone();
                    entry.last_updated = Some(now);
                    updated.push(name);
                }
            }

            entry.last_checked = Some(now);
            found.push(entry.manifest.clone());
        }

        if updated.is_empty() {
            let names: Vec<&str> = apps.iter().map(|(app, _)| app.as_str()).collect();
            tracing::info!(
                "No updated sources found for {}, using last known current sources",
                names.join(", ")
            );
        } else {
            tracing::info!("Found updated sources {}, using updated sources", updated.join(", "));
        }

        found
    }
}
