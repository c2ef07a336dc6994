//! Local package receipt database

use std::process::Command;

use plist::Value;

use crate::codec;
use crate::version::Version;

const PKGUTIL: &str = "/usr/sbin/pkgutil";

/// Query for installed package versions
pub trait PackageDatabase {
    /// Installed version of a package identity, if any
    fn installed_version(&self, identity: &str) -> Option<Version>;
}

/// Receipt database queried through `pkgutil`
#[derive(Debug, Default)]
pub struct Pkgutil;

impl PackageDatabase for Pkgutil {
    fn installed_version(&self, identity: &str) -> Option<Version> {
        let output = match Command::new(PKGUTIL)
            .args(["--pkg-info-plist", identity])
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("Failed to run {}: {}", PKGUTIL, e);
                return None;
            }
        };

        if !output.status.success() {
            tracing::debug!(
                "{} --pkg-info-plist {}: {}",
                PKGUTIL,
                identity,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        let info = match codec::read_bytes(&output.stdout) {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!("Unreadable receipt for {}: {}", identity, e);
                return None;
            }
        };

        info.get("pkg-version")
            .and_then(Value::as_string)
            .map(Version::parse)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    /// Receipt database backed by a map
    #[derive(Default)]
    pub struct FakeDatabase {
        pub versions: HashMap<String, String>,
    }

    impl FakeDatabase {
        pub fn with(mut self, identity: &str, version: &str) -> Self {
            self.versions.insert(identity.to_string(), version.to_string());
            self
        }
    }

    impl PackageDatabase for FakeDatabase {
        fn installed_version(&self, identity: &str) -> Option<Version> {
            self.versions.get(identity).map(|v| Version::parse(v))
        }
    }
}
