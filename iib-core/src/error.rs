//! Error types for index image builds
//!
//! Every fatal condition surfaces as one [`IibError`] variant carrying a
//! single-sentence message. Callers match on the variant to tell
//! configuration problems, port contention, external tool failures and bad
//! input apart.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Who is holding a port that could not be leased
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionKind {
    /// Some unrelated process on the host has the port bound
    System,
    /// Another IIB worker holds the marker file for the port
    Worker,
}

impl fmt::Display for ContentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentionKind::System => f.write_str("system"),
            ContentionKind::Worker => f.write_str("worker"),
        }
    }
}

/// Which catalog a rendered bundle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSide {
    Source,
    Target,
}

impl fmt::Display for CatalogSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogSide::Source => f.write_str("source"),
            CatalogSide::Target => f.write_str("target"),
        }
    }
}

#[derive(Error, Debug)]
pub enum IibError {
    /// Missing mapping entries, unusable port ranges and similar
    #[error("Configuration error: {0}")]
    Config(String),

    /// The index image's platform version is not a single vX.Y token
    #[error("Invalid OCP version, \"{0}\", specified in Index Image")]
    InvalidPlatformVersion(String),

    #[error("{}", address_in_use_message(*port, *kind))]
    AddressInUse { port: u16, kind: ContentionKind },

    #[error("No free port has been found after {attempts} attempts.")]
    PortsExhausted { attempts: usize },

    #[error("Attempt to unlock not-locked {0}.")]
    LockNotHeld(String),

    /// An external command exited non-zero
    #[error("{context}: {detail}")]
    ToolFailed { context: String, detail: String },

    /// An external command succeeded but printed something we cannot use
    #[error("{0}")]
    ToolOutput(String),

    #[error("Cannot find generated cache at {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Bundle {bundle} in the {side} index image is not defined via digest")]
    UnpinnedBundle { bundle: String, side: CatalogSide },

    #[error("{0}")]
    Catalog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

fn address_in_use_message(port: u16, kind: ContentionKind) -> String {
    match kind {
        ContentionKind::System => format!("Port {port} is already in use."),
        ContentionKind::Worker => format!("Port {port} is already locked by other IIB worker."),
    }
}

impl IibError {
    /// Contention that a different candidate port set may resolve
    pub fn is_worker_contention(&self) -> bool {
        matches!(
            self,
            IibError::AddressInUse {
                kind: ContentionKind::Worker,
                ..
            }
        )
    }

    pub fn is_system_contention(&self) -> bool {
        matches!(
            self,
            IibError::AddressInUse {
                kind: ContentionKind::System,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, IibError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_in_use_messages() {
        let system = IibError::AddressInUse {
            port: 5000,
            kind: ContentionKind::System,
        };
        assert_eq!(system.to_string(), "Port 5000 is already in use.");
        assert!(system.is_system_contention());
        assert!(!system.is_worker_contention());

        let worker = IibError::AddressInUse {
            port: 5000,
            kind: ContentionKind::Worker,
        };
        assert_eq!(
            worker.to_string(),
            "Port 5000 is already locked by other IIB worker."
        );
        assert!(worker.is_worker_contention());
    }

    #[test]
    fn test_unpinned_bundle_message() {
        let err = IibError::UnpinnedBundle {
            bundle: "quay.io/bundle2:234567".to_string(),
            side: CatalogSide::Source,
        };
        assert_eq!(
            err.to_string(),
            "Bundle quay.io/bundle2:234567 in the source index image is not defined via digest"
        );
    }
}
