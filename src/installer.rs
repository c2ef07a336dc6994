//! Package installation through the system installer

use std::path::Path;
use std::process::Command;

const INSTALLER: &str = "/usr/sbin/installer";

/// Exit code and message from one installer run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub code: i32,
    pub message: String,
}

impl InstallOutcome {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Installs a package file onto a target volume
pub trait Installer {
    fn install(&self, source: &Path, target: &Path, allow_untrusted: bool) -> InstallOutcome;
}

/// `/usr/sbin/installer`
#[derive(Debug, Default)]
pub struct SystemInstaller;

/// Argument vector for an installer run
pub fn install_args(source: &Path, target: &Path, allow_untrusted: bool) -> Vec<String> {
    let mut args = vec![
        "-dumplog".to_string(),
        "-pkg".to_string(),
        source.display().to_string(),
        "-target".to_string(),
        target.display().to_string(),
    ];

    if allow_untrusted {
        args.insert(0, "-allowUntrusted".to_string());
    }

    args
}

impl Installer for SystemInstaller {
    fn install(&self, source: &Path, target: &Path, allow_untrusted: bool) -> InstallOutcome {
        let args = install_args(source, target, allow_untrusted);
        tracing::debug!("{} {}", INSTALLER, args.join(" "));

        match Command::new(INSTALLER).args(&args).output() {
            Ok(output) => {
                let code = output.status.code().unwrap_or(-1);
                if code == 0 {
                    tracing::debug!("{}", String::from_utf8_lossy(&output.stdout).trim());
                    InstallOutcome {
                        code,
                        message: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    tracing::debug!("{}", stderr);
                    InstallOutcome {
                        code,
                        message: format!("{} - check '/var/log/install.log'", stderr),
                    }
                }
            }
            Err(e) => InstallOutcome {
                code: -1,
                message: format!("Failed to run {}: {}", INSTALLER, e),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::path::PathBuf;

    use super::*;

    /// Records installs; fails any source whose file name is listed
    #[derive(Default)]
    pub struct FakeInstaller {
        pub failing: Vec<String>,
        pub installed: RefCell<Vec<PathBuf>>,
    }

    impl Installer for FakeInstaller {
        fn install(&self, source: &Path, _target: &Path, _allow_untrusted: bool) -> InstallOutcome {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if self.failing.contains(&name) {
                return InstallOutcome {
                    code: 1,
                    message: format!("installer: {} is damaged", name),
                };
            }
            self.installed.borrow_mut().push(source.to_path_buf());
            InstallOutcome {
                code: 0,
                message: String::new(),
            }
        }
    }
}
