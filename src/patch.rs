//! Attribute patches
//!
//! Manifests published upstream carry the occasional wrong attribute. A
//! patch table keyed by manifest file name and entry name overlays
//! corrections before records are built, and can mark entries as ignored.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use plist::{Dictionary, Value};

use crate::package::{PackageRecord, RawEntry, RecordBuilder};
use crate::registry::IdentityRegistry;

const DEFAULT_PATCHES: &str = include_str!("../resources/patches.toml");

/// Corrections keyed by manifest name, then entry name
#[derive(Debug, Clone, Default)]
pub struct PatchTable {
    manifests: BTreeMap<String, BTreeMap<String, Dictionary>>,
}

impl PatchTable {
    /// The compiled-in table
    pub fn builtin() -> Result<Self> {
        Self::parse(DEFAULT_PATCHES).context("Failed to parse built-in patch table")
    }

    /// Load a replacement table, or the built-in one when `path` is `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read patch table: {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Failed to parse patch table: {}", path.display()))
            }
            None => Self::builtin(),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: BTreeMap<String, BTreeMap<String, toml::Table>> = toml::from_str(content)?;

        let manifests = raw
            .into_iter()
            .map(|(manifest, entries)| {
                let entries = entries
                    .into_iter()
                    .map(|(name, attrs)| {
                        let dict = attrs
                            .into_iter()
                            .map(|(k, v)| (k, to_plist(v)))
                            .collect::<Dictionary>();
                        (name, dict)
                    })
                    .collect();
                (manifest, entries)
            })
            .collect();

        Ok(Self { manifests })
    }

    /// Corrections for one entry of one manifest
    pub fn lookup(&self, manifest: &str, entry: &str) -> Option<&Dictionary> {
        self.manifests.get(manifest)?.get(entry)
    }

    /// Shallow merge of the correction over the raw attributes
    pub fn apply(&self, manifest: &str, entry: &str, attrs: &mut Dictionary) -> bool {
        match self.lookup(manifest, entry) {
            Some(patch) => {
                for (key, value) in patch {
                    attrs.insert(key.clone(), value.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Patch every entry of a manifest and build records for the survivors
    ///
    /// Ignored entries are dropped unless `comparing`. Identities already
    /// held by `registry` are skipped.
    pub fn materialize(
        &self,
        entries: Dictionary,
        source: &str,
        comparing: bool,
        registry: &mut IdentityRegistry,
        builder: &RecordBuilder,
    ) -> Vec<PackageRecord> {
        let manifest = manifest_name(source);
        let total = entries.len();
        let mut records = Vec::new();

        for (count, (name, value)) in entries.into_iter().enumerate() {
            let Value::Dictionary(mut attrs) = value else {
                tracing::debug!("Skipping malformed entry {} in {}", name, manifest);
                continue;
            };

            if self.apply(manifest, &name, &mut attrs) {
                tracing::debug!("Patched attributes for {}", name);
            }

            let entry = RawEntry::from_dict(&attrs);
            let Some(identity) = entry.identity() else {
                tracing::warn!("No package identity for {} in {}", name, manifest);
                continue;
            };

            if entry.ignored && !comparing {
                tracing::info!(
                    "Ignoring {}, package ({} of {})",
                    identity,
                    count + 1,
                    total
                );
                continue;
            }

            if registry.contains(&identity) {
                tracing::info!("Already processed {} - skipping", identity);
                continue;
            }

            match builder.build(&entry) {
                Some(record) => {
                    registry.claim(&identity);
                    records.push(record);
                }
                None => {
                    tracing::warn!("No download name for {} in {}", identity, manifest);
                    continue;
                }
            }

            tracing::info!(
                "Processed {}, package ({} of {})",
                identity,
                count + 1,
                total
            );
        }

        records
    }
}

/// File name of a manifest path or URL
pub fn manifest_name(source: &str) -> &str {
    source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(source)
}

fn to_plist(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Integer(i.into()),
        toml::Value::Float(f) => Value::Real(f),
        toml::Value::Boolean(b) => Value::Boolean(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(to_plist).collect()),
        toml::Value::Table(table) => Value::Dictionary(
            table
                .into_iter()
                .map(|(k, v)| (k, to_plist(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::FakeProbe;
    use crate::package::Layout;
    use crate::pkgutil::testing::FakeDatabase;

    const FEED: &str = "https://audiocontentdownload.apple.com/lp10_ms3_content_2016";

    const TABLE: &str = r#"
["appX10.plist"."b.pkg"]
Ignore = true

["appX10.plist"."c.pkg"]
IsMandatory = true
InstalledSize = 42
"#;

    fn entry(id: &str, download: &str) -> Value {
        let mut d = Dictionary::new();
        d.insert("PackageID".into(), Value::String(id.into()));
        d.insert("DownloadName".into(), Value::String(download.into()));
        Value::Dictionary(d)
    }

    fn entries() -> Dictionary {
        let mut d = Dictionary::new();
        d.insert("a.pkg".into(), entry("com.example.a", "a.pkg"));
        d.insert("b.pkg".into(), entry("com.example.b", "b.pkg"));
        d.insert("c.pkg".into(), entry("com.example.c", "c.pkg"));
        d
    }

    #[test]
    fn test_builtin_table_parses() {
        assert!(PatchTable::builtin().is_ok());
    }

    #[test]
    fn test_manifest_name() {
        assert_eq!(manifest_name("https://host/dir/appX10.plist"), "appX10.plist");
        assert_eq!(manifest_name("/tmp/appX10.plist"), "appX10.plist");
        assert_eq!(manifest_name("appX10.plist"), "appX10.plist");
    }

    #[test]
    fn test_overlay_wins() {
        let table = PatchTable::parse(TABLE).unwrap();
        let mut attrs = Dictionary::new();
        attrs.insert("IsMandatory".into(), Value::Boolean(false));
        attrs.insert("PackageID".into(), Value::String("com.example.c".into()));

        assert!(table.apply("appX10.plist", "c.pkg", &mut attrs));
        assert_eq!(attrs.get("IsMandatory"), Some(&Value::Boolean(true)));
        assert_eq!(
            attrs.get("PackageID"),
            Some(&Value::String("com.example.c".into()))
        );
        assert!(!table.apply("appY10.plist", "c.pkg", &mut attrs));
    }

    #[test]
    fn test_ignored_excluded_unless_comparing() {
        let table = PatchTable::parse(TABLE).unwrap();
        let layout = Layout::new(FEED, Path::new("/tmp/loops"));
        let probe = FakeProbe::new();
        let database = FakeDatabase::default();
        let builder = RecordBuilder::new(&layout, &probe, &database);

        let mut registry = IdentityRegistry::new();
        let normal = table.materialize(entries(), "appX10.plist", false, &mut registry, &builder);
        assert_eq!(normal.len(), 2);
        assert!(normal.iter().all(|r| r.identity != "com.example.b"));

        let mut registry = IdentityRegistry::new();
        let comparing = table.materialize(entries(), "appX10.plist", true, &mut registry, &builder);
        assert_eq!(comparing.len(), 3);
        assert!(comparing
            .iter()
            .any(|r| r.identity == "com.example.b" && r.ignored));

        let patched = comparing
            .iter()
            .find(|r| r.identity == "com.example.c")
            .unwrap();
        assert!(patched.mandatory);
        assert_eq!(patched.installed_size_bytes, 42);
    }

    #[test]
    fn test_registry_skips_duplicates() {
        let table = PatchTable::default();
        let layout = Layout::new(FEED, Path::new("/tmp/loops"));
        let probe = FakeProbe::new();
        let database = FakeDatabase::default();
        let builder = RecordBuilder::new(&layout, &probe, &database);

        let mut registry = IdentityRegistry::new();
        let first = table.materialize(entries(), "appX10.plist", false, &mut registry, &builder);
        let second = table.materialize(entries(), "appX20.plist", false, &mut registry, &builder);

        assert_eq!(first.len(), 3);
        assert!(second.is_empty());
        assert_eq!(registry.len(), 3);
    }
}
