//! Worker configuration
//!
//! ## Configuration Sources (in precedence order)
//!
//! 1. Path passed explicitly (the CLI `--config` flag)
//! 2. Path in the `IIB_WORKER_CONFIG` environment variable
//! 3. Built-in defaults
//!
//! ## Example
//!
//! ```yaml
//! default_opm: opm
//! ocp_opm_mapping:
//!   v4.15: opm-v1.40.0
//! opm_port_ranges:
//!   opm_port: [50051, 50151]
//!   opm_pprof_port: [50151, 50251]
//! deprecate_bundles_limit: 100
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{IibError, Result};

/// Environment variable naming a YAML config file
pub const CONFIG_ENV_VAR: &str = "IIB_WORKER_CONFIG";

/// Port purpose for the main opm serve port
pub const OPM_PORT: &str = "opm_port";

/// Port purpose for the opm profiling endpoint
pub const OPM_PPROF_PORT: &str = "opm_pprof_port";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// opm binary used when no mapping matches the index platform version
    #[serde(default = "default_opm")]
    pub default_opm: String,

    /// Platform version label (e.g. `v4.15`) to opm binary name
    #[serde(default)]
    pub ocp_opm_mapping: BTreeMap<String, String>,

    /// Half-open `[start, end)` port range per purpose
    #[serde(default = "default_port_ranges")]
    pub opm_port_ranges: BTreeMap<String, (u16, u16)>,

    /// Lowest opm version whose `serve` needs a lock on the pprof port
    #[serde(default = "default_pprof_min_version")]
    pub opm_pprof_lock_required_min_version: String,

    /// Lowest opm version accepting `migrate --migrate-level`
    #[serde(default = "default_migrate_level_min_version")]
    pub opm_migrate_level_min_version: String,

    /// Seconds between checks while waiting for opm to write its cache
    #[serde(default = "default_grpc_init_wait_time")]
    pub grpc_init_wait_time: u64,

    #[serde(default = "default_grpc_max_tries")]
    pub grpc_max_tries: u32,

    /// Bundles passed to a single `opm registry deprecatetruncate` call
    #[serde(default = "default_deprecate_bundles_limit")]
    pub deprecate_bundles_limit: usize,

    /// Shadow database location, relative to the build directory
    #[serde(default = "default_temp_index_db_path")]
    pub temp_index_db_path: PathBuf,

    /// Directory under the catalog root holding package deprecation files
    #[serde(default = "default_operator_deprecations_dir")]
    pub operator_deprecations_dir: String,

    /// Index image prefixes whose bundles may omit the platform-version label
    #[serde(default)]
    pub no_ocp_label_allow_list: Vec<String>,

    /// Container tool handed to opm (`--container-tool`)
    #[serde(default = "default_container_tool")]
    pub container_tool: Option<String>,

    /// Also move to the next port set when a port is bound by a non-IIB process
    #[serde(default)]
    pub retry_system_port_conflicts: bool,
}

fn default_opm() -> String {
    "opm".to_string()
}

fn default_port_ranges() -> BTreeMap<String, (u16, u16)> {
    BTreeMap::from([
        (OPM_PORT.to_string(), (50051, 50151)),
        (OPM_PPROF_PORT.to_string(), (50151, 50251)),
    ])
}

fn default_pprof_min_version() -> String {
    "1.29.0".to_string()
}

fn default_migrate_level_min_version() -> String {
    "1.46.0".to_string()
}

fn default_grpc_init_wait_time() -> u64 {
    1
}

fn default_grpc_max_tries() -> u32 {
    30
}

fn default_deprecate_bundles_limit() -> usize {
    100
}

fn default_temp_index_db_path() -> PathBuf {
    PathBuf::from("database/index.db")
}

fn default_operator_deprecations_dir() -> String {
    "operator-deprecations".to_string()
}

fn default_container_tool() -> Option<String> {
    Some("podman".to_string())
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_opm: default_opm(),
            ocp_opm_mapping: BTreeMap::new(),
            opm_port_ranges: default_port_ranges(),
            opm_pprof_lock_required_min_version: default_pprof_min_version(),
            opm_migrate_level_min_version: default_migrate_level_min_version(),
            grpc_init_wait_time: default_grpc_init_wait_time(),
            grpc_max_tries: default_grpc_max_tries(),
            deprecate_bundles_limit: default_deprecate_bundles_limit(),
            temp_index_db_path: default_temp_index_db_path(),
            operator_deprecations_dir: default_operator_deprecations_dir(),
            no_ocp_label_allow_list: Vec::new(),
            container_tool: default_container_tool(),
            retry_system_port_conflicts: false,
        }
    }
}

impl WorkerConfig {
    /// Load from an explicit path, then `IIB_WORKER_CONFIG`, then defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }

        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load_from_path(Path::new(&path)),
            None => {
                debug!("No worker config given, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IibError::Config(format!(
                "failed to read worker config {}: {e}",
                path.display()
            ))
        })?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded worker config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: WorkerConfig = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_opm.trim().is_empty() {
            return Err(IibError::Config("default_opm must not be empty".into()));
        }

        for (purpose, (start, end)) in &self.opm_port_ranges {
            if start >= end {
                return Err(IibError::Config(format!(
                    "port range for {purpose} is empty ({start}..{end})"
                )));
            }
        }

        if self.deprecate_bundles_limit == 0 {
            return Err(IibError::Config(
                "deprecate_bundles_limit must be at least 1".into(),
            ));
        }

        for (key, value) in [
            (
                "opm_pprof_lock_required_min_version",
                &self.opm_pprof_lock_required_min_version,
            ),
            (
                "opm_migrate_level_min_version",
                &self.opm_migrate_level_min_version,
            ),
        ] {
            semver::Version::parse(value).map_err(|e| {
                IibError::Config(format!("{key} is not a semantic version ({value}): {e}"))
            })?;
        }

        Ok(())
    }

    /// Whether bundles of `index` may carry no platform-version label
    pub fn allows_missing_ocp_label(&self, index: &str) -> bool {
        self.no_ocp_label_allow_list
            .iter()
            .any(|prefix| index.starts_with(prefix.as_str()))
    }

    /// How long to wait for `opm serve --cache-only` to produce a cache
    pub fn cache_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.grpc_init_wait_time * u64::from(self.grpc_max_tries))
    }
}
