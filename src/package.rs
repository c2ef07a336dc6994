//! Package records
//!
//! A [`PackageRecord`] is the fully resolved form of one manifest entry:
//! where it comes from, where it goes, how big it is and whether the
//! machine already has it.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use plist::{Dictionary, Value};
use regex::Regex;

use crate::net::Probe;
use crate::pkgutil::PackageDatabase;
use crate::version::Version;

/// Marker a patch sets to keep an entry out of normal runs
pub const IGNORE_KEY: &str = "Ignore";

/// Legacy manifests point one content folder at another through `..`
const LEGACY_SEGMENT: &str = "lp10_ms3_content_2016/../lp10_ms3_content_2013";
const LEGACY_TARGET: &str = "lp10_ms3_content_2013";

/// Collapse the legacy `2016/../2013` path segment
pub fn collapse_legacy_path(path: &str) -> String {
    path.replace(LEGACY_SEGMENT, LEGACY_TARGET)
}

fn sequence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"_(\d+)_").expect("valid sequence pattern"))
}

/// Sequence number embedded as `_NNN_` in a download name
pub fn sequence_number(download_name: &str) -> Option<u32> {
    sequence_pattern()
        .captures(download_name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Last path component of a download name
pub fn bare_name(download_name: &str) -> &str {
    download_name
        .rsplit('/')
        .next()
        .unwrap_or(download_name)
}

/// Split a URL into its host and path (path keeps its leading slash)
pub fn split_url(url: &str) -> (&str, &str) {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    }
}

/// One manifest entry mapped to named fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntry {
    /// `PackageID`
    pub package_id: Option<String>,
    /// `DownloadName`
    pub download_name: Option<String>,
    /// `FileCheck`, a string or an array of strings
    pub file_check: Vec<PathBuf>,
    /// `InstalledSize`, integer, real or numeric string; default 0
    pub installed_size: u64,
    /// `IsMandatory`; default false
    pub mandatory: bool,
    /// `PackageName`
    pub package_name: Option<String>,
    /// `PackageVersion`; default `0.0.0`
    pub version: Version,
    /// Patch ignore marker; default false
    pub ignored: bool,
}

impl RawEntry {
    /// Map a raw attribute dictionary to a typed entry
    pub fn from_dict(attrs: &Dictionary) -> Self {
        let file_check = match attrs.get("FileCheck") {
            Some(Value::String(s)) => vec![PathBuf::from(s)],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_string)
                .map(PathBuf::from)
                .collect(),
            _ => Vec::new(),
        };

        let version = match attrs.get("PackageVersion") {
            Some(Value::String(s)) => Version::parse(s),
            Some(Value::Integer(i)) => i
                .as_signed()
                .map(Version::from_int)
                .unwrap_or_default(),
            Some(Value::Real(r)) => Version::from_real(*r),
            _ => Version::sentinel(),
        };

        Self {
            package_id: string_attr(attrs, "PackageID"),
            download_name: string_attr(attrs, "DownloadName"),
            file_check,
            installed_size: size_attr(attrs.get("InstalledSize")),
            mandatory: bool_attr(attrs.get("IsMandatory")),
            package_name: string_attr(attrs, "PackageName"),
            version,
            ignored: bool_attr(attrs.get(IGNORE_KEY)),
        }
    }

    /// Identity with the upstream ". " typo removed
    pub fn identity(&self) -> Option<String> {
        self.package_id
            .as_deref()
            .map(|id| id.replace(". ", ""))
            .filter(|id| !id.is_empty())
    }
}

fn string_attr(attrs: &Dictionary, key: &str) -> Option<String> {
    attrs
        .get(key)
        .and_then(Value::as_string)
        .map(str::to_string)
}

fn size_attr(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Integer(i)) => i.as_unsigned().unwrap_or(0),
        Some(Value::Real(r)) if r.is_finite() && *r > 0.0 => *r as u64,
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && *f > 0.0)
            .map(|f| f as u64)
            .unwrap_or(0),
        _ => 0,
    }
}

fn bool_attr(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Boolean(b)) => *b,
        Some(Value::Integer(i)) => i.as_signed().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

/// Alternate source for package files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mirror {
    /// HTTP(S) mirror of the content server root
    Http(String),
    /// Disk image mounted at `mount`
    DiskImage { mount: PathBuf },
}

/// How source URLs and destinations are derived for a run
#[derive(Debug, Clone)]
pub struct Layout {
    /// Directory on the content server the manifests live in
    pub feed_url: String,
    /// Local root downloads are written under
    pub destination: PathBuf,
    /// Caching server (`http://host:port`)
    pub cache_server: Option<String>,
    /// Alternate package mirror
    pub mirror: Option<Mirror>,
    /// Store everything in one directory instead of mirroring server paths
    pub flat: bool,
    /// Install straight from a mounted image instead of downloading
    pub install_in_place: bool,
}

impl Layout {
    /// Plain download layout rooted at `destination`
    pub fn new(feed_url: &str, destination: &Path) -> Self {
        Self {
            feed_url: feed_url.trim_end_matches('/').to_string(),
            destination: destination.to_path_buf(),
            cache_server: None,
            mirror: None,
            flat: false,
            install_in_place: false,
        }
    }

    /// Server URL of a download name before any rewriting
    pub fn origin_url(&self, download_name: &str) -> String {
        collapse_legacy_path(&format!("{}/{}", self.feed_url, download_name))
    }

    /// Source location after cache server or mirror rewriting
    pub fn resolve_url(&self, download_name: &str) -> String {
        let url = self.origin_url(download_name);
        let (host, path) = split_url(&url);

        if let Some(cache) = &self.cache_server {
            return format!("{}{}?source={}", cache.trim_end_matches('/'), path, host);
        }

        match &self.mirror {
            Some(Mirror::Http(base)) => {
                let base = base.trim_end_matches('/');
                if self.flat {
                    format!("{}/{}", base, bare_name(download_name))
                } else {
                    format!("{}{}", base, path)
                }
            }
            Some(Mirror::DiskImage { mount }) => {
                if self.flat {
                    mount.join(bare_name(download_name)).display().to_string()
                } else {
                    mount.join(path.trim_start_matches('/')).display().to_string()
                }
            }
            None => url,
        }
    }

    /// Local path a package is written to (or installed from)
    pub fn resolve_destination(&self, download_name: &str) -> PathBuf {
        if self.install_in_place && self.source_is_local() {
            return PathBuf::from(self.resolve_url(download_name));
        }

        if self.flat {
            return self.destination.join(bare_name(download_name));
        }

        let url = self.origin_url(download_name);
        let (_, path) = split_url(&url);
        self.destination.join(path.trim_start_matches('/'))
    }

    /// Package files are read from a mounted volume
    pub fn source_is_local(&self) -> bool {
        matches!(self.mirror, Some(Mirror::DiskImage { .. }))
    }
}

/// A fully resolved package
#[derive(Debug, Clone)]
pub struct PackageRecord {
    pub identity: String,
    /// Bare file name used for display and ordering
    pub download_name: String,
    pub package_name: Option<String>,
    pub sequence_number: Option<u32>,
    pub file_check_paths: Vec<PathBuf>,
    pub installed_size_bytes: u64,
    pub mandatory: bool,
    pub manifest_version: Version,
    pub installed_version: Version,
    pub is_installed: bool,
    pub needs_upgrade: bool,
    pub resolved_url: String,
    pub destination_path: PathBuf,
    pub download_size_bytes: u64,
    pub remote_status: u16,
    pub ignored: bool,
    /// Source is a file on a mounted volume rather than a URL
    pub local_source: bool,
}

impl PackageRecord {
    /// `name (Mandatory|Optional, size)` summary line
    pub fn summary(&self) -> String {
        format!(
            "{} ({}, {})",
            self.download_name,
            if self.mandatory { "Mandatory" } else { "Optional" },
            crate::disk::format_bytes(self.download_size_bytes)
        )
    }
}

/// Installed means a check path exists and the receipt is strictly newer
/// than the manifest version.
pub fn is_installed(check_paths: &[PathBuf], installed: &Version, manifest: &Version) -> bool {
    check_paths.iter().any(|p| p.exists()) && installed > manifest
}

/// An upgrade is due when a real receipt is older than the manifest
pub fn needs_upgrade(installed: &Version, manifest: &Version) -> bool {
    !installed.is_sentinel() && installed < manifest
}

/// Builds records for one run
pub struct RecordBuilder<'a> {
    layout: &'a Layout,
    probe: &'a dyn Probe,
    database: &'a dyn PackageDatabase,
}

impl<'a> RecordBuilder<'a> {
    pub fn new(layout: &'a Layout, probe: &'a dyn Probe, database: &'a dyn PackageDatabase) -> Self {
        Self {
            layout,
            probe,
            database,
        }
    }

    /// Build a record; entries without an identity or download name yield `None`
    pub fn build(&self, entry: &RawEntry) -> Option<PackageRecord> {
        let identity = entry.identity()?;
        let raw_name = entry.download_name.as_deref()?;

        let resolved_url = self.layout.resolve_url(raw_name);
        let destination_path = self.layout.resolve_destination(raw_name);
        let local_source = self.layout.source_is_local();
        tracing::debug!("Set package URL for {} to {}", identity, resolved_url);

        let (download_size_bytes, remote_status) = if local_source {
            match std::fs::metadata(&resolved_url) {
                Ok(meta) => (meta.len(), 200),
                Err(_) => (0, 404),
            }
        } else {
            let head = self.probe.head(&resolved_url);
            (head.content_length, head.status)
        };

        let installed_version = self
            .database
            .installed_version(&identity)
            .unwrap_or_default();
        let installed = is_installed(&entry.file_check, &installed_version, &entry.version);
        let upgrade = needs_upgrade(&installed_version, &entry.version);

        let download_name = bare_name(raw_name).to_string();

        Some(PackageRecord {
            identity,
            sequence_number: sequence_number(&download_name),
            download_name,
            package_name: entry.package_name.clone(),
            file_check_paths: entry.file_check.clone(),
            installed_size_bytes: entry.installed_size,
            mandatory: entry.mandatory,
            manifest_version: entry.version.clone(),
            installed_version,
            is_installed: installed,
            needs_upgrade: upgrade,
            resolved_url,
            destination_path,
            download_size_bytes,
            remote_status,
            ignored: entry.ignored,
            local_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::FakeProbe;
    use crate::pkgutil::testing::FakeDatabase;
    use tempfile::tempdir;

    const FEED: &str = "https://audiocontentdownload.apple.com/lp10_ms3_content_2016";

    fn dict(pairs: &[(&str, Value)]) -> Dictionary {
        let mut d = Dictionary::new();
        for (k, v) in pairs {
            d.insert(k.to_string(), v.clone());
        }
        d
    }

    #[test]
    fn test_collapse_legacy_path() {
        assert_eq!(
            collapse_legacy_path("https://host/lp10_ms3_content_2016/../lp10_ms3_content_2013/a.pkg"),
            "https://host/lp10_ms3_content_2013/a.pkg"
        );
        assert_eq!(
            collapse_legacy_path("https://host/lp10_ms3_content_2016/a.pkg"),
            "https://host/lp10_ms3_content_2016/a.pkg"
        );
    }

    #[test]
    fn test_sequence_number() {
        assert_eq!(sequence_number("pkgA_001_.pkg"), Some(1));
        assert_eq!(sequence_number("MAContent_123_Drums.pkg"), Some(123));
        assert_eq!(sequence_number("pkgA.pkg"), None);
        assert_eq!(sequence_number("pkg_A_.pkg"), None);
    }

    #[test]
    fn test_raw_entry_mapping() {
        let attrs = dict(&[
            ("PackageID", Value::String("com.apple.pkg. MAContent10".into())),
            ("DownloadName", Value::String("a.pkg".into())),
            ("InstalledSize", Value::String("1000".into())),
            ("IsMandatory", Value::Boolean(true)),
            ("PackageVersion", Value::Integer(2.into())),
            (
                "FileCheck",
                Value::Array(vec![Value::String("/a".into()), Value::String("/b".into())]),
            ),
        ]);

        let entry = RawEntry::from_dict(&attrs);
        assert_eq!(entry.identity().as_deref(), Some("com.apple.pkgMAContent10"));
        assert_eq!(entry.installed_size, 1000);
        assert!(entry.mandatory);
        assert_eq!(entry.version, Version::parse("2.0"));
        assert_eq!(entry.file_check.len(), 2);
        assert!(!entry.ignored);

        let empty = RawEntry::from_dict(&Dictionary::new());
        assert_eq!(empty.identity(), None);
        assert!(empty.version.is_sentinel());
        assert_eq!(empty.installed_size, 0);
    }

    #[test]
    fn test_resolve_plain() {
        let layout = Layout::new(FEED, Path::new("/tmp/loops"));
        assert_eq!(layout.resolve_url("a.pkg"), format!("{}/a.pkg", FEED));
        assert_eq!(
            layout.resolve_destination("../lp10_ms3_content_2013/b.pkg"),
            PathBuf::from("/tmp/loops/lp10_ms3_content_2013/b.pkg")
        );
    }

    #[test]
    fn test_resolve_cache_server() {
        let mut layout = Layout::new(FEED, Path::new("/tmp/loops"));
        layout.cache_server = Some("http://cache.local:49672".to_string());
        assert_eq!(
            layout.resolve_url("a.pkg"),
            "http://cache.local:49672/lp10_ms3_content_2016/a.pkg?source=audiocontentdownload.apple.com"
        );
    }

    #[test]
    fn test_resolve_http_mirror() {
        let mut layout = Layout::new(FEED, Path::new("/tmp/loops"));
        layout.mirror = Some(Mirror::Http("https://mirror.local/content/".to_string()));
        assert_eq!(
            layout.resolve_url("../lp10_ms3_content_2013/b.pkg"),
            "https://mirror.local/content/lp10_ms3_content_2013/b.pkg"
        );

        layout.flat = true;
        assert_eq!(
            layout.resolve_url("../lp10_ms3_content_2013/b.pkg"),
            "https://mirror.local/content/b.pkg"
        );
        assert_eq!(
            layout.resolve_destination("../lp10_ms3_content_2013/b.pkg"),
            PathBuf::from("/tmp/loops/b.pkg")
        );
    }

    #[test]
    fn test_resolve_disk_image_in_place() {
        let mut layout = Layout::new(FEED, Path::new("/tmp/work"));
        layout.mirror = Some(Mirror::DiskImage {
            mount: PathBuf::from("/tmp/loopkit_dmg"),
        });
        layout.install_in_place = true;

        assert_eq!(
            layout.resolve_url("a.pkg"),
            "/tmp/loopkit_dmg/lp10_ms3_content_2016/a.pkg"
        );
        assert_eq!(
            layout.resolve_destination("a.pkg"),
            PathBuf::from("/tmp/loopkit_dmg/lp10_ms3_content_2016/a.pkg")
        );
        assert!(layout.source_is_local());
    }

    #[test]
    fn test_installed_and_upgrade_exclusive() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("present");
        std::fs::write(&present, b"").unwrap();
        let checks = vec![present];

        let newer = Version::parse("2.0");
        let older = Version::parse("0.5");
        let manifest = Version::parse("1.0");

        assert!(is_installed(&checks, &newer, &manifest));
        assert!(!needs_upgrade(&newer, &manifest));

        assert!(!is_installed(&checks, &older, &manifest));
        assert!(needs_upgrade(&older, &manifest));

        // Equal versions are neither installed nor upgradable
        assert!(!is_installed(&checks, &manifest, &manifest));
        assert!(!needs_upgrade(&manifest, &manifest));

        // Absent receipt never upgrades
        assert!(!needs_upgrade(&Version::sentinel(), &manifest));
        assert!(!is_installed(&[], &newer, &manifest));
    }

    #[test]
    fn test_build_record() {
        let layout = Layout::new(FEED, Path::new("/tmp/loops"));
        let url = format!("{}/pkgA_001_.pkg", FEED);
        let probe = FakeProbe::new().with(&url, 200, 5000);
        let database = FakeDatabase::default();
        let builder = RecordBuilder::new(&layout, &probe, &database);

        let entry = RawEntry::from_dict(&dict(&[
            ("PackageID", Value::String("com.example.a".into())),
            ("DownloadName", Value::String("pkgA_001_.pkg".into())),
            ("InstalledSize", Value::Integer(1000.into())),
            ("IsMandatory", Value::Boolean(true)),
        ]));

        let record = builder.build(&entry).unwrap();
        assert_eq!(record.identity, "com.example.a");
        assert_eq!(record.sequence_number, Some(1));
        assert_eq!(record.download_size_bytes, 5000);
        assert_eq!(record.remote_status, 200);
        assert!(!record.is_installed);
        assert!(!record.needs_upgrade);
        assert!(record.installed_version.is_sentinel());
        assert_eq!(record.summary(), "pkgA_001_.pkg (Mandatory, 4.88 KB)");
    }

    /// Counts metadata requests separately from single HEAD requests
    #[derive(Default)]
    struct CountingProbe {
        heads: std::cell::Cell<usize>,
        separate: std::cell::Cell<usize>,
    }

    impl Probe for CountingProbe {
        fn status(&self, _url: &str) -> u16 {
            self.separate.set(self.separate.get() + 1);
            200
        }

        fn headers(&self, _url: &str) -> std::collections::HashMap<String, String> {
            self.separate.set(self.separate.get() + 1);
            std::collections::HashMap::new()
        }

        fn fetch(
            &self,
            _url: &str,
            dest: &Path,
            _options: crate::net::FetchOptions,
        ) -> anyhow::Result<PathBuf> {
            Ok(dest.to_path_buf())
        }

        fn head(&self, _url: &str) -> crate::net::Head {
            self.heads.set(self.heads.get() + 1);
            crate::net::Head {
                status: 200,
                content_length: 7,
            }
        }
    }

    #[test]
    fn test_build_makes_one_request_per_package() {
        let layout = Layout::new(FEED, Path::new("/tmp/loops"));
        let probe = CountingProbe::default();
        let database = FakeDatabase::default();
        let builder = RecordBuilder::new(&layout, &probe, &database);

        let entry = RawEntry::from_dict(&dict(&[
            ("PackageID", Value::String("com.example.d".into())),
            ("DownloadName", Value::String("d.pkg".into())),
        ]));

        let record = builder.build(&entry).unwrap();
        assert_eq!(record.remote_status, 200);
        assert_eq!(record.download_size_bytes, 7);
        assert_eq!(probe.heads.get(), 1);
        assert_eq!(probe.separate.get(), 0);
    }

    #[test]
    fn test_build_unreachable_tolerated() {
        let layout = Layout::new(FEED, Path::new("/tmp/loops"));
        let probe = FakeProbe::new();
        let database = FakeDatabase::default();
        let builder = RecordBuilder::new(&layout, &probe, &database);

        let entry = RawEntry::from_dict(&dict(&[
            ("PackageID", Value::String("com.example.b".into())),
            ("DownloadName", Value::String("b.pkg".into())),
        ]));

        let record = builder.build(&entry).unwrap();
        assert_eq!(record.download_size_bytes, 0);
        assert_eq!(record.remote_status, 0);
    }

    #[test]
    fn test_build_local_source_uses_stat() {
        let mount = tempdir().unwrap();
        let file = mount.path().join("lp10_ms3_content_2016").join("c.pkg");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, vec![0u8; 321]).unwrap();

        let mut layout = Layout::new(FEED, Path::new("/tmp/work"));
        layout.mirror = Some(Mirror::DiskImage {
            mount: mount.path().to_path_buf(),
        });
        let probe = FakeProbe::new();
        let database = FakeDatabase::default();
        let builder = RecordBuilder::new(&layout, &probe, &database);

        let entry = RawEntry::from_dict(&dict(&[
            ("PackageID", Value::String("com.example.c".into())),
            ("DownloadName", Value::String("c.pkg".into())),
        ]));

        let record = builder.build(&entry).unwrap();
        assert!(record.local_source);
        assert_eq!(record.download_size_bytes, 321);
        assert_eq!(record.remote_status, 200);
    }
}
