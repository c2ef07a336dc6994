//! Error types for loopkit

use std::process::ExitCode;

use thiserror::Error;

/// Fatal failure classes. Each one owns a reserved exit code so wrapping
/// scripts can tell them apart.
#[derive(Error, Debug)]
pub enum LoopsError {
    #[error("Insufficient space on {path}: {required} required, {available} available")]
    InsufficientSpace {
        path: String,
        required: String,
        available: String,
    },

    #[error("--compare-style: not allowed without argument --compare")]
    CompareStyleWithoutCompare,

    #[error("--compare: cannot compare property lists for different applications ({0} and {1})")]
    CompareDifferentApplications(String, String),

    #[error("--pkg-server: HTTP {0} for specified URL")]
    MirrorStatus(u16),

    #[error("--pkg-server: file path does not exist: {0}")]
    MirrorPathMissing(String),

    #[error("--pkg-server: mirrored content cannot be found, please ensure packages exist in {0}")]
    MirrorContentMissing(String),

    #[error("--pkg-server: HTTP/HTTPS scheme required")]
    MirrorScheme,

    #[error("--cache-server: https is not supported")]
    CacheServerScheme,

    #[error("--cache-server: requires a port number in http://example.org:556677 format")]
    CacheServerPort,

    #[error("--apfs: not allowed without argument -b/--build-dmg")]
    ApfsWithoutBuild,

    #[error("-m/--mandatory or -o/--optional or both are required")]
    NoSelection,

    #[error("--cache-server: not allowed with argument --pkg-server")]
    CacheServerAndMirror,

    #[error("You must be root to run in deployment mode")]
    NotRoot,

    #[error("One of --apps, --plists, --fetch-latest, --check-updates or --compare is required")]
    NoSourceSelected,

    #[error("No packages found in the selected sources")]
    NoPackages,

    #[error("Disk image operation failed: {0}")]
    DiskImage(String),

    #[error("Could not find packages in {0}")]
    NothingToCompare(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoopsError {
    /// Map the failure class to its reserved exit code
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    pub fn code(&self) -> u8 {
        match self {
            LoopsError::InsufficientSpace { .. } => 33,
            LoopsError::CompareStyleWithoutCompare => 51,
            LoopsError::CompareDifferentApplications(..) => 52,
            LoopsError::MirrorStatus(_) => 53,
            LoopsError::MirrorPathMissing(_) => 54,
            LoopsError::MirrorContentMissing(_) => 55,
            LoopsError::MirrorScheme => 56,
            LoopsError::CacheServerScheme => 57,
            LoopsError::CacheServerPort => 58,
            LoopsError::ApfsWithoutBuild => 59,
            LoopsError::NoSelection => 60,
            LoopsError::CacheServerAndMirror => 61,
            LoopsError::NotRoot => 66,
            LoopsError::NoSourceSelected => 67,
            LoopsError::NoPackages => 70,
            LoopsError::DiskImage(_) => 88,
            LoopsError::NothingToCompare(_) => 99,
            LoopsError::Interrupted => 130,
            LoopsError::Config(_) | LoopsError::Io(_) => 1,
        }
    }

    /// Validation failures print a usage hint before exiting
    pub fn is_usage(&self) -> bool {
        matches!(self.code(), 51..=61 | 67)
    }
}

/// Result type alias for loopkit operations
pub type Result<T> = std::result::Result<T, LoopsError>;
