//! Host queries

use std::path::Path;

use plist::Value;

use crate::codec;
use crate::version::Version;

const SYSTEM_VERSION: &str = "/System/Library/CoreServices/SystemVersion.plist";

/// Running with an effective user id of 0
#[cfg(unix)]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
    false
}

/// Installed macOS version; the sentinel when it cannot be determined
pub fn os_version() -> Version {
    product_version(Path::new(SYSTEM_VERSION))
}

fn product_version(path: &Path) -> Version {
    codec::read(path)
        .ok()
        .and_then(|info| {
            info.get("ProductVersion")
                .and_then(Value::as_string)
                .map(Version::parse)
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::Dictionary;
    use tempfile::tempdir;

    #[test]
    fn test_product_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("SystemVersion.plist");
        let mut info = Dictionary::new();
        info.insert("ProductVersion".into(), Value::String("10.15.7".into()));
        codec::write(&info, &path).unwrap();

        assert_eq!(product_version(&path), Version::parse("10.15.7"));
        assert!(product_version(&dir.path().join("missing.plist")).is_sentinel());
    }
}
