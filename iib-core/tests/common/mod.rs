//! Test helpers shared by the integration tests
//!
//! Nothing here runs real `opm` or `podman`. [`RecordingRunner`] records
//! every command and leaves behind the files opm would have written, and
//! [`FakeImages`] serves labels and image content from memory.

#![allow(dead_code)]

use async_trait::async_trait;
use iib_core::config::WorkerConfig;
use iib_core::context::BuildContext;
use iib_core::error::{IibError, Result};
use iib_core::exec::{CommandRunner, ToolCommand};
use iib_core::image::ImageInspector;
use iib_core::opm::OpmTool;
use iib_core::ports::MarkerFileLeases;
use iib_core::state::RequestStateRecorder;
use semver::Version;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Records commands and imitates the files opm leaves behind
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<ToolCommand>>,
    /// `(needle, stdout)`: the first entry whose needle occurs in the
    /// command line wins
    outputs: Mutex<Vec<(String, String)>>,
    /// Commands containing this needle fail
    fail_on: Mutex<Option<String>>,
    /// `run_until_ready` exits without writing the cache
    skip_cache: Mutex<bool>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, needle: impl Into<String>, stdout: impl Into<String>) {
        self.outputs
            .lock()
            .unwrap()
            .push((needle.into(), stdout.into()));
    }

    pub fn fail_on(&self, needle: impl Into<String>) {
        *self.fail_on.lock().unwrap() = Some(needle.into());
    }

    pub fn skip_cache(&self) {
        *self.skip_cache.lock().unwrap() = true;
    }

    pub fn commands(&self) -> Vec<ToolCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Command lines without the program, e.g. `registry rm --database ...`
    pub fn lines(&self) -> Vec<String> {
        self.commands()
            .iter()
            .map(|cmd| cmd.args.join(" "))
            .collect()
    }

    /// Commands whose first arguments are `prefix`
    pub fn matching(&self, prefix: &[&str]) -> Vec<ToolCommand> {
        self.commands()
            .into_iter()
            .filter(|cmd| cmd.args.len() >= prefix.len() && cmd.args[..prefix.len()] == *prefix)
            .collect()
    }

    fn record(&self, cmd: &ToolCommand) -> Result<()> {
        self.commands.lock().unwrap().push(cmd.clone());
        if let Some(needle) = self.fail_on.lock().unwrap().as_deref() {
            if cmd.to_string().contains(needle) {
                return Err(IibError::ToolFailed {
                    context: cmd.error_context.clone(),
                    detail: "scripted failure".to_string(),
                });
            }
        }
        Ok(())
    }

    fn cwd(cmd: &ToolCommand) -> PathBuf {
        cmd.cwd.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Files opm would have written for `cmd`
    fn side_effects(cmd: &ToolCommand) -> std::io::Result<()> {
        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["migrate", .., fbc] => {
                let package = Path::new(fbc).join("example-operator");
                fs::create_dir_all(&package)?;
                fs::write(package.join("catalog.json"), "{}")?;
            }
            ["registry", "add", "--database", db, ..] => {
                let db = Path::new(db);
                if let Some(parent) = db.parent() {
                    fs::create_dir_all(parent)?;
                }
                if !db.exists() {
                    fs::write(db, "sqlite")?;
                }
            }
            ["index", "add", "--generate", ..] | ["index", "rm", "--generate", ..] => {
                let base = Self::cwd(cmd);
                fs::create_dir_all(base.join("database"))?;
                fs::write(base.join("database").join("index.db"), "sqlite")?;
                fs::write(base.join("index.Dockerfile"), "FROM scratch\n")?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &ToolCommand) -> Result<String> {
        self.record(cmd)?;
        Self::side_effects(cmd)?;

        let line = cmd.to_string();
        let outputs = self.outputs.lock().unwrap();
        Ok(outputs
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default())
    }

    async fn run_until_ready(&self, cmd: &ToolCommand, ready: &Path, _: Duration) -> Result<()> {
        self.record(cmd)?;
        if !*self.skip_cache.lock().unwrap() {
            if let Some(cache_dir) = ready.parent() {
                fs::create_dir_all(cache_dir)?;
            }
            fs::write(ready, "cache digest")?;
        }
        Ok(())
    }
}

/// What a fake image holds at one path
#[derive(Debug, Clone)]
pub enum Content {
    File(String),
    /// Relative file paths and their contents
    Tree(Vec<(String, String)>),
}

/// Labels and content of fake images
#[derive(Default)]
pub struct FakeImages {
    labels: Mutex<HashMap<(String, String), String>>,
    content: Mutex<HashMap<(String, String), Content>>,
    copies: Mutex<Vec<(String, String, PathBuf)>>,
}

impl FakeImages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_label(&self, image: &str, name: &str, value: &str) {
        self.labels
            .lock()
            .unwrap()
            .insert((image.to_string(), name.to_string()), value.to_string());
    }

    pub fn set_content(&self, image: &str, src: &str, content: Content) {
        self.content
            .lock()
            .unwrap()
            .insert((image.to_string(), src.to_string()), content);
    }

    /// `(image, src, dest)` of every copy made
    pub fn copies(&self) -> Vec<(String, String, PathBuf)> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageInspector for FakeImages {
    async fn label(&self, image: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .labels
            .lock()
            .unwrap()
            .get(&(image.to_string(), name.to_string()))
            .cloned())
    }

    async fn copy_from_image(&self, image: &str, src: &str, dest: &Path) -> Result<()> {
        self.copies
            .lock()
            .unwrap()
            .push((image.to_string(), src.to_string(), dest.to_path_buf()));

        let content = self
            .content
            .lock()
            .unwrap()
            .get(&(image.to_string(), src.to_string()))
            .cloned()
            .unwrap_or_else(|| Content::File("sqlite".to_string()));

        match content {
            Content::File(text) => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(dest, text)?;
            }
            Content::Tree(files) => {
                fs::create_dir_all(dest)?;
                for (relative, text) in files {
                    let path = dest.join(relative);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, text)?;
                }
            }
        }
        Ok(())
    }
}

/// Keeps every `(state, reason)` pair
#[derive(Default)]
pub struct RecordedStates(pub Mutex<Vec<(String, String)>>);

impl RequestStateRecorder for RecordedStates {
    fn set_state(&self, _: u64, state: &str, reason: &str) {
        self.0
            .lock()
            .unwrap()
            .push((state.to_string(), reason.to_string()));
    }
}

impl RecordedStates {
    pub fn states(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }
}

/// Everything a test needs around one build context
pub struct Harness {
    pub ctx: BuildContext,
    pub runner: Arc<RecordingRunner>,
    pub images: Arc<FakeImages>,
    pub states: Arc<RecordedStates>,
    /// Marker directory, private to the test
    pub locks: TempDir,
}

pub fn harness(config: WorkerConfig, opm_version: &str) -> Harness {
    init_test_logging();
    let runner = RecordingRunner::new();
    let images = FakeImages::new();
    let states = Arc::new(RecordedStates::default());
    let locks = TempDir::new().unwrap();
    let version = Version::parse(opm_version).unwrap();

    let ctx = BuildContext::builder(1, Arc::new(config))
        .opm(OpmTool::with_version("opm", version))
        .runner(runner.clone())
        .images(images.clone())
        .state_recorder(states.clone())
        .leases(Arc::new(MarkerFileLeases::new(locks.path().to_path_buf())))
        .build()
        .unwrap();

    Harness {
        ctx,
        runner,
        images,
        states,
        locks,
    }
}

/// Config with small, test-only port ranges
pub fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.opm_port_ranges = [
        (iib_core::config::OPM_PORT.to_string(), (47101, 47111)),
        (iib_core::config::OPM_PPROF_PORT.to_string(), (47201, 47211)),
    ]
    .into_iter()
    .collect();
    config
}

/// One `olm.bundle` document as `opm render` prints it
pub fn render_bundle(package: &str, csv: &str, version: &str, image: &str) -> String {
    serde_json::json!({
        "schema": "olm.bundle",
        "name": csv,
        "package": package,
        "image": image,
        "properties": [
            {"type": "olm.package", "value": {"packageName": package, "version": version}}
        ]
    })
    .to_string()
}
