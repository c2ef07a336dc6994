//! Reconciliation
//!
//! Merges records from every source, keeps what the run mode and
//! selection call for, orders them for execution and totals their sizes.

use std::path::{Path, PathBuf};

use crate::disk::{format_bytes, has_space};
use crate::error::LoopsError;
use crate::package::PackageRecord;
use crate::registry::IdentityRegistry;

/// What the run does with the selected packages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Download only; install state is not consulted
    Download,
    /// Download and install; `force` keeps already satisfied packages
    Deployment { force: bool },
}

impl RunMode {
    pub fn is_deployment(&self) -> bool {
        matches!(self, RunMode::Deployment { .. })
    }
}

/// Mandatory and/or optional packages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub mandatory: bool,
    pub optional: bool,
}

impl Selection {
    /// At least one of the two must be chosen
    pub fn new(mandatory: bool, optional: bool) -> Result<Self, LoopsError> {
        if !mandatory && !optional {
            return Err(LoopsError::NoSelection);
        }
        Ok(Self {
            mandatory,
            optional,
        })
    }

    pub fn accepts(&self, record: &PackageRecord) -> bool {
        if record.mandatory {
            self.mandatory
        } else {
            self.optional
        }
    }
}

/// Does a record still need work in this mode?
pub fn eligible(record: &PackageRecord, mode: RunMode) -> bool {
    match mode {
        RunMode::Download => true,
        RunMode::Deployment { force } => force || record.needs_upgrade || !record.is_installed,
    }
}

/// Unsequenced records by name, then sequenced records by number
pub fn order(records: Vec<PackageRecord>) -> Vec<PackageRecord> {
    let (mut sequenced, mut unsequenced): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|r| r.sequence_number.is_some());

    unsequenced.sort_by(|a, b| a.download_name.cmp(&b.download_name));
    sequenced.sort_by(|a, b| {
        a.sequence_number
            .cmp(&b.sequence_number)
            .then_with(|| a.download_name.cmp(&b.download_name))
    });

    unsequenced.extend(sequenced);
    unsequenced
}

/// The ordered work list of a run
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub packages: Vec<PackageRecord>,
    /// Sum of download sizes
    pub download_bytes: u64,
    /// Sum of installed sizes
    pub installed_bytes: u64,
}

impl Plan {
    pub fn new(packages: Vec<PackageRecord>) -> Self {
        let packages = order(packages);
        let download_bytes = packages.iter().map(|p| p.download_size_bytes).sum();
        let installed_bytes = packages.iter().map(|p| p.installed_size_bytes).sum();
        Self {
            packages,
            download_bytes,
            installed_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Owns the identity registry and the union of all sources
#[derive(Debug, Default)]
pub struct Reconciler {
    registry: IdentityRegistry,
    merged: IdentityRegistry,
    records: Vec<PackageRecord>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry handed to the patch layer while sources load
    pub fn registry_mut(&mut self) -> &mut IdentityRegistry {
        &mut self.registry
    }

    /// Union with another record set; the first record of an identity wins
    pub fn add(&mut self, records: Vec<PackageRecord>) {
        for record in records {
            if self.merged.claim(&record.identity) {
                self.records.push(record);
            } else {
                tracing::debug!("Dropping duplicate {}", record.identity);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Filter by mode and selection, then order
    pub fn plan(self, mode: RunMode, selection: Selection) -> Plan {
        tracing::debug!(
            "{} records from {} materialized identities",
            self.len(),
            self.registry.len()
        );
        let kept = self
            .records
            .into_iter()
            .filter(|r| selection.accepts(r))
            .filter(|r| eligible(r, mode))
            .collect();
        Plan::new(kept)
    }
}

/// Counts and sizes split by mandatory/optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub mandatory_count: usize,
    pub optional_count: usize,
    pub mandatory_download: u64,
    pub optional_download: u64,
    pub mandatory_installed: u64,
    pub optional_installed: u64,
}

impl DiscoveryStats {
    pub fn from_records(records: &[PackageRecord]) -> Self {
        let mut stats = Self::default();
        for record in records {
            if record.mandatory {
                stats.mandatory_count += 1;
                stats.mandatory_download += record.download_size_bytes;
                stats.mandatory_installed += record.installed_size_bytes;
            } else {
                stats.optional_count += 1;
                stats.optional_download += record.download_size_bytes;
                stats.optional_installed += record.installed_size_bytes;
            }
        }
        stats
    }

    pub fn message(&self, selection: Selection) -> String {
        let mut parts = Vec::new();

        if selection.mandatory && self.mandatory_count > 0 {
            parts.push(format!(
                "{} mandatory packages ({} download size, {} installed size)",
                self.mandatory_count,
                format_bytes(self.mandatory_download),
                format_bytes(self.mandatory_installed)
            ));
        }

        if selection.optional && self.optional_count > 0 {
            parts.push(format!(
                "{} optional packages ({} download size, {} installed size)",
                self.optional_count,
                format_bytes(self.optional_download),
                format_bytes(self.optional_installed)
            ));
        }

        if parts.is_empty() {
            "No packages to process".to_string()
        } else {
            format!("Discovered {}", parts.join(" and "))
        }
    }
}

/// Where the packages of a run end up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceContext {
    /// Deployment installing in place from a mounted image
    DeployFromImage { install_target: PathBuf },
    /// Deployment downloading then installing
    Deploy { install_target: PathBuf },
    /// Downloading into a disk image that will be written to `image`
    BuildImage { image: PathBuf },
    /// Downloading into a folder
    Download { destination: PathBuf },
}

impl SpaceContext {
    /// Bytes needed and the path whose filesystem must hold them
    pub fn requirement(&self, plan: &Plan) -> (u64, PathBuf) {
        match self {
            SpaceContext::DeployFromImage { install_target } => {
                (plan.installed_bytes, install_target.clone())
            }
            SpaceContext::Deploy { install_target } => (
                plan.download_bytes.saturating_add(plan.installed_bytes),
                install_target.clone(),
            ),
            SpaceContext::BuildImage { image } => (
                plan.download_bytes,
                image
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
            ),
            SpaceContext::Download { destination } => (plan.download_bytes, destination.clone()),
        }
    }
}

/// Fail unless strictly more space is available than required
///
/// A dry run only reports the shortfall.
pub fn verify_space(
    required: u64,
    available: u64,
    path: &Path,
    dry_run: bool,
) -> Result<(), LoopsError> {
    if has_space(required, available) {
        tracing::warn!("Freespace checks passed.");
        return Ok(());
    }

    let error = LoopsError::InsufficientSpace {
        path: path.display().to_string(),
        required: format_bytes(required),
        available: format_bytes(available),
    };

    if dry_run {
        tracing::warn!("{}", error);
        Ok(())
    } else {
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::FakeProbe;
    use crate::package::{Layout, RawEntry, RecordBuilder};
    use crate::patch::PatchTable;
    use crate::pkgutil::testing::FakeDatabase;
    use crate::version::Version;
    use plist::{Dictionary, Value};
    use tempfile::tempdir;

    const FEED: &str = "https://audiocontentdownload.apple.com/lp10_ms3_content_2016";

    fn record(name: &str, seq: Option<u32>, mandatory: bool) -> PackageRecord {
        PackageRecord {
            identity: format!("com.example.{}", name),
            download_name: name.to_string(),
            package_name: None,
            sequence_number: seq,
            file_check_paths: Vec::new(),
            installed_size_bytes: 10,
            mandatory,
            manifest_version: Version::parse("1.0"),
            installed_version: Version::sentinel(),
            is_installed: false,
            needs_upgrade: false,
            resolved_url: format!("{}/{}", FEED, name),
            destination_path: PathBuf::from("/tmp/loops").join(name),
            download_size_bytes: 100,
            remote_status: 200,
            ignored: false,
            local_source: false,
        }
    }

    fn scenario_entries() -> Dictionary {
        let mut attrs = Dictionary::new();
        attrs.insert("IsMandatory".into(), Value::Boolean(true));
        attrs.insert("InstalledSize".into(), Value::Integer(1000.into()));
        attrs.insert("DownloadName".into(), Value::String("pkgA_001_.pkg".into()));
        attrs.insert("PackageID".into(), Value::String("com.example.a".into()));
        attrs.insert("PackageVersion".into(), Value::String("1.0".into()));
        let mut entries = Dictionary::new();
        entries.insert("pkgA.pkg".into(), Value::Dictionary(attrs));
        entries
    }

    #[test]
    fn test_selection_requires_one() {
        assert!(matches!(Selection::new(false, false), Err(LoopsError::NoSelection)));
        assert!(Selection::new(true, false).is_ok());
    }

    #[test]
    fn test_sequenced_after_unsequenced() {
        let ordered = order(vec![record("a_003_.pkg", Some(3), true), record("z.pkg", None, true)]);
        assert_eq!(ordered[0].download_name, "z.pkg");
        assert_eq!(ordered[1].download_name, "a_003_.pkg");
    }

    #[test]
    fn test_order_numeric_sequence() {
        let ordered = order(vec![
            record("b_010_.pkg", Some(10), true),
            record("c.pkg", None, true),
            record("a_002_.pkg", Some(2), true),
            record("a.pkg", None, true),
        ]);
        let names: Vec<_> = ordered.iter().map(|r| r.download_name.as_str()).collect();
        assert_eq!(names, vec!["a.pkg", "c.pkg", "a_002_.pkg", "b_010_.pkg"]);
    }

    #[test]
    fn test_union_with_itself_is_unchanged() {
        let set = vec![record("a.pkg", None, true), record("b.pkg", None, false)];
        let mut reconciler = Reconciler::new();
        reconciler.add(set.clone());
        reconciler.add(set.clone());
        assert_eq!(reconciler.len(), set.len());
    }

    #[test]
    fn test_deployment_filter() {
        let mut installed = record("a.pkg", None, true);
        installed.is_installed = true;
        let mut upgrade = record("b.pkg", None, true);
        upgrade.needs_upgrade = true;
        let fresh = record("c.pkg", None, true);

        let deploy = RunMode::Deployment { force: false };
        assert!(!eligible(&installed, deploy));
        assert!(eligible(&upgrade, deploy));
        assert!(eligible(&fresh, deploy));
        assert!(eligible(&installed, RunMode::Deployment { force: true }));
        assert!(eligible(&installed, RunMode::Download));
    }

    #[test]
    fn test_selection_filter_and_totals() {
        let mut reconciler = Reconciler::new();
        reconciler.add(vec![record("a.pkg", None, true), record("b.pkg", None, false)]);

        let plan = reconciler.plan(RunMode::Download, Selection::new(false, true).unwrap());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.packages[0].download_name, "b.pkg");
        assert_eq!(plan.download_bytes, 100);
        assert_eq!(plan.installed_bytes, 10);
    }

    #[test]
    fn test_scenario_fresh_package_downloads() {
        let layout = Layout::new(FEED, Path::new("/tmp/loops"));
        let probe = FakeProbe::new().with(&format!("{}/pkgA_001_.pkg", FEED), 200, 2048);
        let database = FakeDatabase::default();
        let builder = RecordBuilder::new(&layout, &probe, &database);

        let mut reconciler = Reconciler::new();
        let records = PatchTable::default().materialize(
            scenario_entries(),
            "appX10.plist",
            false,
            reconciler.registry_mut(),
            &builder,
        );
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(!record.is_installed);
        assert!(!record.needs_upgrade);
        assert_eq!(record.sequence_number, Some(1));

        reconciler.add(records);
        let plan = reconciler.plan(RunMode::Download, Selection::new(true, false).unwrap());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.download_bytes, 2048);
        assert_eq!(plan.installed_bytes, 1000);
    }

    #[test]
    fn test_scenario_newer_install_skipped_in_deployment() {
        let dir = tempdir().unwrap();
        let check = dir.path().join("Drums");
        std::fs::write(&check, b"").unwrap();

        let mut entries = scenario_entries();
        if let Some(Value::Dictionary(attrs)) = entries.get_mut("pkgA.pkg") {
            attrs.insert(
                "FileCheck".into(),
                Value::String(check.display().to_string()),
            );
        }

        let layout = Layout::new(FEED, Path::new("/tmp/loops"));
        let probe = FakeProbe::new();
        let database = FakeDatabase::default().with("com.example.a", "2.0");
        let builder = RecordBuilder::new(&layout, &probe, &database);
        let selection = Selection::new(true, false).unwrap();

        let build = || {
            let mut reconciler = Reconciler::new();
            let records = PatchTable::default().materialize(
                entries.clone(),
                "appX10.plist",
                false,
                reconciler.registry_mut(),
                &builder,
            );
            assert!(records[0].is_installed);
            reconciler.add(records);
            reconciler
        };

        let deploy = build().plan(RunMode::Deployment { force: false }, selection);
        assert!(deploy.is_empty());

        let download = build().plan(RunMode::Download, selection);
        assert_eq!(download.len(), 1);
    }

    #[test]
    fn test_raw_entry_identity_typo() {
        let mut attrs = Dictionary::new();
        attrs.insert("PackageID".into(), Value::String("com.apple. pkg.a".into()));
        assert_eq!(
            RawEntry::from_dict(&attrs).identity().as_deref(),
            Some("com.applepkg.a")
        );
    }

    #[test]
    fn test_space_requirement_targets() {
        let mut plan = Plan::new(vec![record("a.pkg", None, true)]);
        plan.download_bytes = 100;
        plan.installed_bytes = 10;

        let deploy = SpaceContext::Deploy {
            install_target: PathBuf::from("/"),
        };
        assert_eq!(deploy.requirement(&plan), (110, PathBuf::from("/")));

        let in_place = SpaceContext::DeployFromImage {
            install_target: PathBuf::from("/"),
        };
        assert_eq!(in_place.requirement(&plan), (10, PathBuf::from("/")));

        let image = SpaceContext::BuildImage {
            image: PathBuf::from("/Volumes/Store/loops.dmg"),
        };
        assert_eq!(image.requirement(&plan), (100, PathBuf::from("/Volumes/Store")));
    }

    #[test]
    fn test_verify_space_strict() {
        let path = Path::new("/tmp");
        assert!(verify_space(10, 11, path, false).is_ok());
        assert!(matches!(
            verify_space(10, 10, path, false),
            Err(LoopsError::InsufficientSpace { .. })
        ));
        assert!(verify_space(10, 10, path, true).is_ok());
    }

    #[test]
    fn test_discovery_message() {
        let records = vec![record("a.pkg", None, true), record("b.pkg", None, false)];
        let stats = DiscoveryStats::from_records(&records);
        assert_eq!(stats.mandatory_count, 1);
        assert_eq!(stats.optional_download, 100);

        let both = stats.message(Selection::new(true, true).unwrap());
        assert_eq!(
            both,
            "Discovered 1 mandatory packages (100 B download size, 10 B installed size) and 1 optional packages (100 B download size, 10 B installed size)"
        );

        let none = DiscoveryStats::default().message(Selection::new(true, false).unwrap());
        assert_eq!(none, "No packages to process");
    }
}
