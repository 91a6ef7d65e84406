//! opm binary selection and version-dependent capabilities

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::error::{IibError, Result};
use crate::exec::{CommandRunner, ToolCommand};

static OPM_VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"OpmVersion:"v?([^"]+)""#).expect("opm version pattern is valid")
});

/// The opm binary used for one build request
#[derive(Debug)]
pub struct OpmTool {
    binary: String,
    version: OnceCell<Version>,
}

impl OpmTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            version: OnceCell::new(),
        }
    }

    /// A tool whose version is already known; `opm version` is never run
    pub fn with_version(binary: impl Into<String>, version: Version) -> Self {
        Self {
            binary: binary.into(),
            version: OnceCell::new_with(Some(version)),
        }
    }

    /// Pick the binary mapped to `platform_label`, or the default one
    pub fn select(config: &WorkerConfig, platform_label: Option<&str>) -> Self {
        let binary = platform_label
            .and_then(|label| config.ocp_opm_mapping.get(label))
            .unwrap_or(&config.default_opm);
        info!(
            platform = platform_label.unwrap_or("<none>"),
            "Using {} for this request", binary
        );
        Self::new(binary.clone())
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Version reported by `<binary> version`, resolved once
    pub async fn version(&self, runner: &dyn CommandRunner, cwd: &Path) -> Result<&Version> {
        self.version
            .get_or_try_init(|| async {
                let cmd = ToolCommand::new(&self.binary, "Failed to get opm version")
                    .arg("version")
                    .current_dir(cwd);
                let output = runner.run(&cmd).await?;
                let version = parse_opm_version(&output)?;
                debug!(binary = %self.binary, %version, "Resolved opm version");
                Ok(version)
            })
            .await
    }
}

/// Extract the version from `opm version` output
///
/// `version.Version{OpmVersion:"v1.26.4", GoOs:"linux"}` gives `1.26.4`.
pub fn parse_opm_version(output: &str) -> Result<Version> {
    let not_found =
        || IibError::ToolOutput("Opm version not found in the output of \"OPM version\" command".into());

    let captured = OPM_VERSION_RE
        .captures(output)
        .and_then(|captures| captures.get(1))
        .ok_or_else(not_found)?;
    Version::parse(captured.as_str()).map_err(|_| not_found())
}

fn min_version(key: &str, value: &str) -> Result<Version> {
    Version::parse(value)
        .map_err(|e| IibError::Config(format!("{key} is not a semantic version ({value}): {e}")))
}

/// Whether `opm serve` of this version also binds a profiling port
pub fn supports_pprof_lock(config: &WorkerConfig, version: &Version) -> Result<bool> {
    let min = min_version(
        "opm_pprof_lock_required_min_version",
        &config.opm_pprof_lock_required_min_version,
    )?;
    Ok(*version >= min)
}

/// Whether `opm migrate` of this version accepts `--migrate-level`
pub fn supports_migrate_level(config: &WorkerConfig, version: &Version) -> Result<bool> {
    let min = min_version(
        "opm_migrate_level_min_version",
        &config.opm_migrate_level_min_version,
    )?;
    Ok(*version >= min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_opm_version() {
        let version =
            parse_opm_version(r#"version.Version{OpmVersion:"v1.26.4", GoOs:"linux"}"#).unwrap();
        assert_eq!(version, Version::new(1, 26, 4));
    }

    #[test]
    fn test_parse_opm_version_missing() {
        let err = parse_opm_version("OPM: command not found...").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Opm version not found in the output of \"OPM version\" command"
        );
    }

    #[test]
    fn test_select_uses_mapping_then_default() {
        let config = WorkerConfig {
            default_opm: "opm".to_string(),
            ocp_opm_mapping: BTreeMap::from([("v4.15".to_string(), "opm-v1.40.0".to_string())]),
            ..Default::default()
        };

        assert_eq!(OpmTool::select(&config, Some("v4.15")).binary(), "opm-v1.40.0");
        assert_eq!(OpmTool::select(&config, Some("v4.00")).binary(), "opm");
        assert_eq!(OpmTool::select(&config, None).binary(), "opm");
    }

    #[test]
    fn test_capabilities_follow_configured_minimums() {
        let config = WorkerConfig::default();
        assert!(!supports_migrate_level(&config, &Version::new(1, 26, 8)).unwrap());
        assert!(supports_migrate_level(&config, &Version::new(1, 47, 2)).unwrap());
        assert!(!supports_pprof_lock(&config, &Version::new(1, 28, 0)).unwrap());
        assert!(supports_pprof_lock(&config, &Version::new(1, 29, 0)).unwrap());
    }

    #[tokio::test]
    async fn test_preset_version_is_not_queried() {
        struct NoRunner;

        #[async_trait::async_trait]
        impl CommandRunner for NoRunner {
            async fn run(&self, cmd: &ToolCommand) -> Result<String> {
                panic!("unexpected command {cmd}");
            }

            async fn run_until_ready(
                &self,
                cmd: &ToolCommand,
                _: &Path,
                _: std::time::Duration,
            ) -> Result<()> {
                panic!("unexpected command {cmd}");
            }
        }

        let tool = OpmTool::with_version("opm", Version::new(1, 40, 0));
        let version = tool.version(&NoRunner, Path::new("/tmp")).await.unwrap();
        assert_eq!(*version, Version::new(1, 40, 0));
    }
}
