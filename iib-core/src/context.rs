//! Per-request build context
//!
//! Everything one build request needs travels in a [`BuildContext`]: the
//! scoped working directory, the worker config, the opm binary picked for
//! the request and the seams to the outside world. Concurrent requests never
//! share one, so nothing here is global.

use async_trait::async_trait;
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::exec::{CommandRunner, ProcessRunner, ToolCommand};
use crate::fsutil::copy_tree;
use crate::image::{ImageInspector, PodmanImages};
use crate::opm::OpmTool;
use crate::ports::{LeaseProvider, MarkerFileLeases, PortRetryPolicy};
use crate::state::{RequestStateRecorder, TracingStateRecorder};

pub struct BuildContext {
    pub request_id: u64,
    /// Removed when the context is dropped, whatever the outcome
    workdir: TempDir,
    pub config: Arc<WorkerConfig>,
    pub opm: OpmTool,
    pub runner: Arc<dyn CommandRunner>,
    pub images: Arc<dyn ImageInspector>,
    pub state: Arc<dyn RequestStateRecorder>,
    pub leases: Arc<dyn LeaseProvider>,
}

impl BuildContext {
    pub fn builder(request_id: u64, config: Arc<WorkerConfig>) -> BuildContextBuilder {
        BuildContextBuilder {
            request_id,
            config,
            opm: None,
            runner: None,
            images: None,
            state: None,
            leases: None,
            workdir_parent: None,
        }
    }

    pub fn base_dir(&self) -> &Path {
        self.workdir.path()
    }

    /// Switch to the opm binary mapped to `platform_label`
    pub fn select_opm(&mut self, platform_label: Option<&str>) {
        self.opm = OpmTool::select(&self.config, platform_label);
    }

    /// An opm invocation running in the working directory
    pub fn opm_command(&self, error_context: impl Into<String>) -> ToolCommand {
        ToolCommand::new(self.opm.binary(), error_context).current_dir(self.base_dir())
    }

    pub async fn opm_version(&self) -> Result<&Version> {
        self.opm.version(self.runner.as_ref(), self.base_dir()).await
    }

    pub fn port_policy(&self) -> PortRetryPolicy {
        PortRetryPolicy {
            retry_system_conflicts: self.config.retry_system_port_conflicts,
        }
    }

    pub fn set_state(&self, state: &str, reason: &str) {
        self.state.set_state(self.request_id, state, reason);
    }
}

pub struct BuildContextBuilder {
    request_id: u64,
    config: Arc<WorkerConfig>,
    opm: Option<OpmTool>,
    runner: Option<Arc<dyn CommandRunner>>,
    images: Option<Arc<dyn ImageInspector>>,
    state: Option<Arc<dyn RequestStateRecorder>>,
    leases: Option<Arc<dyn LeaseProvider>>,
    workdir_parent: Option<PathBuf>,
}

impl BuildContextBuilder {
    pub fn opm(mut self, opm: OpmTool) -> Self {
        self.opm = Some(opm);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn images(mut self, images: Arc<dyn ImageInspector>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn state_recorder(mut self, state: Arc<dyn RequestStateRecorder>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn leases(mut self, leases: Arc<dyn LeaseProvider>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Create the working directory under `parent` instead of the temp dir
    pub fn workdir_in(mut self, parent: impl Into<PathBuf>) -> Self {
        self.workdir_parent = Some(parent.into());
        self
    }

    pub fn build(self) -> Result<BuildContext> {
        let prefix = format!("iib-{}-", self.request_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let workdir = match &self.workdir_parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        debug!(request_id = self.request_id, workdir = %workdir.path().display(), "Created build directory");

        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ProcessRunner) as Arc<dyn CommandRunner>);
        let images = self
            .images
            .unwrap_or_else(|| Arc::new(PodmanImages::new(Arc::clone(&runner))) as Arc<dyn ImageInspector>);
        let opm = self
            .opm
            .unwrap_or_else(|| OpmTool::new(self.config.default_opm.clone()));

        Ok(BuildContext {
            request_id: self.request_id,
            workdir,
            config: self.config,
            opm,
            runner,
            images,
            state: self
                .state
                .unwrap_or_else(|| Arc::new(TracingStateRecorder) as Arc<dyn RequestStateRecorder>),
            leases: self
                .leases
                .unwrap_or_else(|| Arc::new(MarkerFileLeases::default()) as Arc<dyn LeaseProvider>),
        })
    }
}

/// Hands a finished build directory to whatever builds the image
#[async_trait]
pub trait IndexPublisher: Send + Sync {
    /// Returns where the build context ended up
    async fn publish(&self, ctx: &BuildContext, dockerfile: &Path) -> Result<PathBuf>;
}

/// Copies the build directory to `<root>/<request_id>`
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl IndexPublisher for DirectoryPublisher {
    async fn publish(&self, ctx: &BuildContext, dockerfile: &Path) -> Result<PathBuf> {
        let dest = self.root.join(ctx.request_id.to_string());
        copy_tree(ctx.base_dir(), &dest)?;
        info!(
            "Build context for request {} with {} published to {}",
            ctx.request_id,
            dockerfile.display(),
            dest.display()
        );
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workdir_removed_on_drop() {
        let parent = TempDir::new().unwrap();
        let ctx = BuildContext::builder(7, Arc::new(WorkerConfig::default()))
            .workdir_in(parent.path())
            .build()
            .unwrap();

        let base = ctx.base_dir().to_path_buf();
        assert!(base.starts_with(parent.path()));
        assert!(base
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("iib-7-"));
        std::fs::write(base.join("index.Dockerfile"), "FROM scratch").unwrap();

        drop(ctx);
        assert!(!base.exists());
    }

    #[test]
    fn test_opm_command_runs_in_workdir() {
        let mut ctx = BuildContext::builder(1, Arc::new(WorkerConfig::default()))
            .build()
            .unwrap();
        ctx.select_opm(None);

        let cmd = ctx.opm_command("Failed").arg("version");
        assert_eq!(cmd.to_string(), "opm version");
        assert_eq!(cmd.cwd.as_deref(), Some(ctx.base_dir()));
    }

    #[tokio::test]
    async fn test_directory_publisher_copies_build_dir() {
        let out = TempDir::new().unwrap();
        let ctx = BuildContext::builder(42, Arc::new(WorkerConfig::default()))
            .build()
            .unwrap();
        std::fs::create_dir_all(ctx.base_dir().join("configs/pkg")).unwrap();
        std::fs::write(ctx.base_dir().join("configs/pkg/catalog.json"), "{}").unwrap();
        let dockerfile = ctx.base_dir().join("index.Dockerfile");
        std::fs::write(&dockerfile, "FROM scratch").unwrap();

        let dest = DirectoryPublisher::new(out.path())
            .publish(&ctx, &dockerfile)
            .await
            .unwrap();

        assert_eq!(dest, out.path().join("42"));
        assert!(dest.join("configs/pkg/catalog.json").is_file());
        assert!(dest.join("index.Dockerfile").is_file());
    }
}
