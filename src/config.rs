//! Configuration management for loopkit

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Audio content feed configuration
    #[serde(default)]
    pub feed: FeedConfig,

    /// Supported applications, keyed by short name (e.g. "garageband")
    #[serde(default = "default_applications")]
    pub applications: BTreeMap<String, ApplicationConfig>,

    /// Disk image configuration
    #[serde(default)]
    pub dmg: DmgConfig,

    /// Installation configuration
    #[serde(default)]
    pub install: InstallConfig,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Directory on the content server holding the manifests
    pub feed_url: String,

    /// HTTP status codes treated as reachable
    #[serde(default = "default_http_ok")]
    pub http_ok: Vec<u16>,

    /// Paths that must exist on an HTTP package mirror
    #[serde(default = "default_mirror_test_paths")]
    pub mirror_test_paths: Vec<String>,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Request timeout for probes (downloads are not limited)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_http_ok() -> Vec<u16> {
    vec![200, 301, 302, 303, 307, 308]
}

fn default_mirror_test_paths() -> Vec<String> {
    vec![
        "lp10_ms3_content_2013".to_string(),
        "lp10_ms3_content_2016".to_string(),
    ]
}

fn default_user_agent() -> String {
    format!("loopkit/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout() -> u64 {
    30
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            feed_url: "https://audiocontentdownload.apple.com/lp10_ms3_content_2016".to_string(),
            http_ok: default_http_ok(),
            mirror_test_paths: default_mirror_test_paths(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout(),
        }
    }
}

impl FeedConfig {
    /// Is this status one of the configured "OK" codes?
    pub fn is_ok(&self, status: u16) -> bool {
        self.http_ok.contains(&status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application bundle folder name
    pub bundle: String,

    /// Supported manifest file names, oldest first
    #[serde(default)]
    pub manifests: Vec<String>,
}

impl ApplicationConfig {
    /// The newest supported manifest
    pub fn latest(&self) -> Option<&str> {
        self.manifests.last().map(String::as_str)
    }
}

fn default_applications() -> BTreeMap<String, ApplicationConfig> {
    let mut apps = BTreeMap::new();
    apps.insert(
        "garageband".to_string(),
        ApplicationConfig {
            bundle: "GarageBand.app".to_string(),
            manifests: vec![
                "garageband1020.plist".to_string(),
                "garageband1021.plist".to_string(),
                "garageband1040.plist".to_string(),
            ],
        },
    );
    apps.insert(
        "logicpro".to_string(),
        ApplicationConfig {
            bundle: "Logic Pro X.app".to_string(),
            manifests: vec![
                "logicpro1050.plist".to_string(),
                "logicpro1060.plist".to_string(),
                "logicpro1070.plist".to_string(),
                "logicpro1080.plist".to_string(),
            ],
        },
    );
    apps.insert(
        "mainstage".to_string(),
        ApplicationConfig {
            bundle: "MainStage 3.app".to_string(),
            manifests: vec![
                "mainstage362.plist".to_string(),
                "mainstage370.plist".to_string(),
                "mainstage380.plist".to_string(),
            ],
        },
    );
    apps
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmgConfig {
    /// Where package images are mounted
    pub mountpoint: PathBuf,

    /// Volume name for built images
    pub volume_name: String,

    /// Filesystem for built images
    #[serde(default = "default_dmg_fs")]
    pub default_fs: String,

    /// Filesystems hdiutil accepts for sparse images
    #[serde(default = "default_valid_fs")]
    pub valid_fs: Vec<String>,
}

fn default_dmg_fs() -> String {
    "HFS+J".to_string()
}

fn default_valid_fs() -> Vec<String> {
    vec!["HFS+J".to_string(), "APFS".to_string()]
}

impl Default for DmgConfig {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/tmp/loopkit_dmg"),
            volume_name: "audiocontent".to_string(),
            default_fs: default_dmg_fs(),
            valid_fs: default_valid_fs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Target volume for the installer
    pub target: PathBuf,

    /// Folder holding the host applications
    pub app_folder: PathBuf,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::from("/"),
            app_folder: PathBuf::from("/Applications"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Temporary working directory
    pub work_dir: PathBuf,

    /// Log directory (failure log lives here)
    pub log_dir: PathBuf,

    /// Replacement attribute patch table
    #[serde(default)]
    pub patches: Option<PathBuf>,

    /// Update-check cache used when running as root
    pub update_cache_system: PathBuf,

    /// Update-check cache used otherwise
    pub update_cache_user: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let dirs = directories::ProjectDirs::from("com.github", "loopkit", "loopkit");
        let log_dir = dirs
            .as_ref()
            .map(|d| d.data_local_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("/var/log/loopkit"));
        let update_cache_user = dirs
            .as_ref()
            .map(|d| d.preference_dir().join("updates.plist"))
            .unwrap_or_else(|| PathBuf::from("~/.config/loopkit/updates.plist"));

        Self {
            work_dir: std::env::temp_dir().join("loopkit"),
            log_dir,
            patches: None,
            update_cache_system: PathBuf::from("/Library/Preferences/com.github.loopkit.updates.plist"),
            update_cache_user,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            applications: default_applications(),
            dmg: DmgConfig::default(),
            install: InstallConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try system config
            let system_config = PathBuf::from("/etc/loopkit/loopkit.conf");
            if system_config.exists() {
                return Some(system_config);
            }

            // Try user config
            directories::ProjectDirs::from("com.github", "loopkit", "loopkit")
                .map(|d| d.config_dir().join("loopkit.conf"))
                .filter(|p| p.exists())
        });

        match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {}", path.display()))
            }
            None => Ok(Config::default()),
        }
    }

    /// Newest manifest of each named application; "all" selects every one
    pub fn latest_manifests(&self, apps: &[String]) -> Vec<String> {
        let all = apps.iter().any(|a| a == "all");
        self.applications
            .iter()
            .filter(|(name, _)| all || apps.contains(name))
            .filter_map(|(_, app)| app.latest().map(str::to_string))
            .collect()
    }

    /// Expand "all" into the configured application names
    pub fn expand_apps(&self, apps: &[String]) -> Vec<String> {
        if apps.iter().any(|a| a == "all") {
            self.applications.keys().cloned().collect()
        } else {
            apps.to_vec()
        }
    }
}
