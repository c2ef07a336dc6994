//! Disk image management through `hdiutil`

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use plist::{Dictionary, Value};
use regex::Regex;

use crate::codec;
use crate::config::DmgConfig;

const HDIUTIL: &str = "/usr/bin/hdiutil";

/// A mounted image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mounted {
    pub mountpoint: PathBuf,
    pub device: String,
}

/// Find the entity carrying both a mount point and a device entry
pub fn mounted_entity(output: &Dictionary) -> Option<Mounted> {
    let device_re = Regex::new(r"/dev/disk\d+").ok()?;
    let entities = output.get("system-entities")?.as_array()?;

    entities.iter().filter_map(Value::as_dictionary).find_map(|entity| {
        let mountpoint = entity.get("mount-point").and_then(Value::as_string)?;
        let dev_entry = entity.get("dev-entry").and_then(Value::as_string)?;
        let device = device_re.find(dev_entry)?.as_str().to_string();
        Some(Mounted {
            mountpoint: PathBuf::from(mountpoint),
            device,
        })
    })
}

/// Mount an image (path or URL) at `mountpoint`
pub fn mount(image: &str, mountpoint: &Path, read_only: bool) -> Result<Mounted> {
    let mut args = vec![
        "attach".to_string(),
        "-mountpoint".to_string(),
        mountpoint.display().to_string(),
        "-plist".to_string(),
        image.to_string(),
    ];
    if read_only {
        args.insert(1, "-readonly".to_string());
    }

    let output = Command::new(HDIUTIL)
        .args(&args)
        .output()
        .with_context(|| format!("Failed to run {}", HDIUTIL))?;
    tracing::debug!("{} {} ({:?})", HDIUTIL, args.join(" "), output.status.code());

    if !output.status.success() {
        bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }

    let dict = codec::read_bytes(&output.stdout)?;
    let mounted = mounted_entity(&dict)
        .with_context(|| format!("No mounted volume reported for {}", image))?;
    tracing::debug!("{} attached as {}", image, mounted.device);
    tracing::warn!("Mounted {} to {}", image, mounted.mountpoint.display());
    Ok(mounted)
}

/// Eject whatever is mounted at `mountpoint`
pub fn eject(mountpoint: &Path, silent: bool) {
    let result = Command::new(HDIUTIL)
        .args(["eject", "-quiet"])
        .arg(mountpoint)
        .output();

    match result {
        Ok(output) if output.status.success() => {
            if !silent {
                tracing::info!("Unmounted {}", mountpoint.display());
            }
        }
        Ok(output) => {
            tracing::debug!("{}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Err(e) => tracing::debug!("Failed to run {}: {}", HDIUTIL, e),
    }
}

/// Path of the sparse image backing a build target
pub fn sparse_path(target: &Path) -> PathBuf {
    if target.extension().is_some_and(|e| e == "sparseimage") {
        target.to_path_buf()
    } else {
        let mut os = target.as_os_str().to_os_string();
        os.push(".sparseimage");
        PathBuf::from(os)
    }
}

/// Create and mount a thin sparse image for building `target`
///
/// Returns the sparse image path and its mount.
pub fn create_sparse(target: &Path, fs: &str, config: &DmgConfig) -> Result<(PathBuf, Mounted)> {
    if !config.valid_fs.iter().any(|v| v == fs) {
        bail!("Unsupported disk image filesystem: {}", fs);
    }

    let sparse = sparse_path(target);

    if sparse.exists() && config.mountpoint.exists() {
        tracing::warn!(
            "Unmounting existing mount point for {}",
            config.mountpoint.display()
        );
        eject(&config.mountpoint, true);
        let mounted = mount(&sparse.display().to_string(), &config.mountpoint, false)?;
        return Ok((sparse, mounted));
    }

    let output = Command::new(HDIUTIL)
        .args(["create", "-ov", "-plist", "-volname"])
        .arg(&config.volume_name)
        .args(["-fs", fs, "-attach", "-type", "SPARSE", "-mountpoint"])
        .arg(&config.mountpoint)
        .arg(target)
        .output()
        .with_context(|| format!("Failed to run {}", HDIUTIL))?;

    if !output.status.success() {
        bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }

    tracing::warn!("Created temporary sparse image for {}", target.display());
    let dict = codec::read_bytes(&output.stdout)?;
    let mounted = mounted_entity(&dict)
        .with_context(|| format!("No mounted volume reported for {}", sparse.display()))?;
    Ok((sparse, mounted))
}

/// Convert a sparse image into a compressed read-only image
pub fn convert_sparse(sparse: &Path, target: &Path, mountpoint: &Path) -> Result<PathBuf> {
    tracing::info!("Converting {}", sparse.display());
    eject(mountpoint, true);

    let output = Command::new(HDIUTIL)
        .args(["convert", "-ov", "-quiet"])
        .arg(sparse)
        .args(["-format", "UDZO", "-o"])
        .arg(target)
        .output()
        .with_context(|| format!("Failed to run {}", HDIUTIL))?;

    if !output.status.success() {
        bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }

    tracing::info!("Created {}", target.display());
    Ok(target.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mounted_entity() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
  <key>system-entities</key>
  <array>
    <dict>
      <key>dev-entry</key><string>/dev/disk4</string>
    </dict>
    <dict>
      <key>dev-entry</key><string>/dev/disk4s1</string>
      <key>mount-point</key><string>/tmp/loopkit_dmg</string>
    </dict>
  </array>
</dict>
</plist>"#;
        let dict = codec::read_bytes(xml).unwrap();
        let mounted = mounted_entity(&dict).unwrap();
        assert_eq!(mounted.mountpoint, PathBuf::from("/tmp/loopkit_dmg"));
        assert_eq!(mounted.device, "/dev/disk4");
    }

    #[test]
    fn test_sparse_path() {
        assert_eq!(
            sparse_path(Path::new("/tmp/content.dmg")),
            PathBuf::from("/tmp/content.dmg.sparseimage")
        );
        assert_eq!(
            sparse_path(Path::new("/tmp/content.sparseimage")),
            PathBuf::from("/tmp/content.sparseimage")
        );
    }
}
