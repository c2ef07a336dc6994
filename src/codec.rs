//! Property list codec
//!
//! Manifests, application `Info.plist` files, `pkgutil` and `hdiutil`
//! output and the update-check cache are all property lists.

use std::io::Cursor;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use plist::{Dictionary, Value};

/// Key holding the package table in a manifest
pub const PACKAGES_KEY: &str = "Packages";

/// Read a property list file whose root is a dictionary
pub fn read(path: &Path) -> Result<Dictionary> {
    let value = Value::from_file(path)
        .with_context(|| format!("Failed to read property list: {}", path.display()))?;
    value
        .into_dictionary()
        .ok_or_else(|| anyhow!("Property list root is not a dictionary: {}", path.display()))
}

/// Read property list bytes (command output) whose root is a dictionary
pub fn read_bytes(bytes: &[u8]) -> Result<Dictionary> {
    let value = Value::from_reader(Cursor::new(bytes)).context("Failed to parse property list")?;
    value
        .into_dictionary()
        .ok_or_else(|| anyhow!("Property list root is not a dictionary"))
}

/// Write a dictionary as an XML property list
pub fn write(dict: &Dictionary, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Value::Dictionary(dict.clone())
        .to_file_xml(path)
        .with_context(|| format!("Failed to write property list: {}", path.display()))
}

/// Extract the package table from a manifest dictionary
pub fn packages(mut manifest: Dictionary) -> Option<Dictionary> {
    manifest
        .remove(PACKAGES_KEY)
        .and_then(Value::into_dictionary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_packages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("manifest.plist");

        let mut entry = Dictionary::new();
        entry.insert("PackageID".to_string(), Value::String("com.example.a".into()));
        let mut table = Dictionary::new();
        table.insert("a.pkg".to_string(), Value::Dictionary(entry));
        let mut manifest = Dictionary::new();
        manifest.insert(PACKAGES_KEY.to_string(), Value::Dictionary(table));

        write(&manifest, &path).unwrap();
        let read_back = read(&path).unwrap();
        let table = packages(read_back).unwrap();
        assert!(table.contains_key("a.pkg"));
    }

    #[test]
    fn test_read_bytes_rejects_non_dictionary() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><array><string>x</string></array></plist>"#;
        assert!(read_bytes(xml).is_err());
    }

    #[test]
    fn test_read_bytes_dictionary() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>pkg-version</key><string>2.0</string></dict></plist>"#;
        let dict = read_bytes(xml).unwrap();
        assert_eq!(dict.get("pkg-version").and_then(Value::as_string), Some("2.0"));
    }
}
