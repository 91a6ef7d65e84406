//! Operator bundles as rendered from a catalog

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::image::is_pinned;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub package_name: String,
    pub version: String,
    /// Pull spec of the bundle image
    pub bundle_path: String,
    pub csv_name: String,
}

impl Bundle {
    pub fn is_pinned(&self) -> bool {
        is_pinned(&self.bundle_path)
    }

    /// The `sha256:...` part of a digest-pinned pull spec
    pub fn digest(&self) -> Option<&str> {
        self.bundle_path
            .split_once('@')
            .map(|(_, digest)| digest)
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.bundle_path, self.package_name, self.csv_name)
    }
}
