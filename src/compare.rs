//! Manifest comparison
//!
//! Diffs the package lists of two manifests for the same application.
//! Ignore markers are not applied so both sides list every package.

use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use similar::{ChangeTag, TextDiff};

use crate::error::LoopsError;
use crate::manifest::ManifestRef;
use crate::package::PackageRecord;
use crate::patch::manifest_name;
use crate::reconcile::order;
use crate::registry::IdentityRegistry;
use crate::source::SourceReader;

/// Diff output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DiffStyle {
    /// Every line, prefixed `- `, `+ ` or two spaces
    #[default]
    Compare,
    /// Unified diff with file headers and hunks
    Unified,
}

fn version_suffix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+\.plist$").expect("valid manifest suffix pattern"))
}

/// Application a manifest belongs to (`garageband1021.plist` -> `garageband`)
pub fn application_of(manifest: &str) -> String {
    version_suffix()
        .replace(manifest_name(manifest), "")
        .into_owned()
}

/// Both manifests must belong to the same application
pub fn check_same_application(a: &str, b: &str) -> Result<(), LoopsError> {
    let mut apps = [application_of(a), application_of(b)];
    apps.sort();
    if apps[0] != apps[1] {
        let [first, second] = apps;
        return Err(LoopsError::CompareDifferentApplications(first, second));
    }
    Ok(())
}

/// Execution ordered `name (Mandatory|Optional, size)` lines
pub fn summaries(records: Vec<PackageRecord>) -> Vec<String> {
    for record in records.iter().filter(|r| r.ignored) {
        tracing::debug!("{} is listed but ignored in normal runs", record.identity);
    }
    order(records).iter().map(PackageRecord::summary).collect()
}

/// Render the diff of two summary lists
pub fn render(from: &str, to: &str, old: &[String], new: &[String], style: DiffStyle) -> Vec<String> {
    let old: Vec<&str> = old.iter().map(String::as_str).collect();
    let new: Vec<&str> = new.iter().map(String::as_str).collect();
    let diff = TextDiff::from_slices(&old, &new);

    match style {
        DiffStyle::Compare => diff
            .iter_all_changes()
            .map(|change| format!("{} {}", sign(change.tag()), change.value()))
            .collect(),
        DiffStyle::Unified => {
            let mut lines = Vec::new();
            let unified = diff.unified_diff();
            for (index, hunk) in unified.iter_hunks().enumerate() {
                if index == 0 {
                    lines.push(format!("--- {}", from));
                    lines.push(format!("+++ {}", to));
                }
                lines.push(hunk.header().to_string());
                for change in hunk.iter_changes() {
                    lines.push(format!("{}{}", sign(change.tag()), change.value()));
                }
            }
            lines
        }
    }
}

fn sign(tag: ChangeTag) -> &'static str {
    match tag {
        ChangeTag::Delete => "-",
        ChangeTag::Insert => "+",
        ChangeTag::Equal => " ",
    }
}

/// Load both manifests and diff their package lists
///
/// Each side gets its own identity registry so packages shared by both
/// manifests show up on both sides.
pub fn compare(
    reader: &SourceReader,
    a: &ManifestRef,
    b: &ManifestRef,
    style: DiffStyle,
) -> Result<Vec<String>, LoopsError> {
    check_same_application(&a.as_source(), &b.as_source())?;

    let packages_a = reader.manifest(a, true, &mut IdentityRegistry::new());
    let packages_b = reader.manifest(b, true, &mut IdentityRegistry::new());

    let missing: Vec<String> = [(a, &packages_a), (b, &packages_b)]
        .iter()
        .filter(|(_, packages)| packages.is_empty())
        .map(|(reference, _)| reference.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(LoopsError::NothingToCompare(missing.join(" and ")));
    }

    Ok(render(
        &a.to_string(),
        &b.to_string(),
        &summaries(packages_a),
        &summaries(packages_b),
        style,
    ))
}
