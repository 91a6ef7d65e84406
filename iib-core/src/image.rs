//! Index image inspection and content extraction

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::exec::{CommandRunner, ToolCommand};
use crate::error::{IibError, Result};

/// Present on every file-based catalog image; value is the configs root
pub const FBC_CONFIGS_LABEL: &str = "operators.operatorframework.io.index.configs.v1";

/// Location of the database inside a database-backed index image
pub const INDEX_DATABASE_LABEL: &str = "operators.operatorframework.io.index.database.v1";

pub const DEFAULT_INDEX_DATABASE: &str = "/database/index.db";

/// Where FBC images built by IIB keep the database they were migrated from
pub const HIDDEN_INDEX_DATABASE: &str = "/var/lib/iib/_hidden/do.not.edit.db";

/// Platform version the index image is delivered for
pub const DELIVERY_VERSION_LABEL: &str = "com.redhat.index.delivery.version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFormat {
    /// Legacy `index.db`
    Database,
    /// Declarative config tree
    FileBased,
}

#[async_trait]
pub trait ImageInspector: Send + Sync {
    /// Value of label `name` on `image`, if set
    async fn label(&self, image: &str, name: &str) -> Result<Option<String>>;

    /// Copy `src` (a path inside `image`) to the local `dest`
    async fn copy_from_image(&self, image: &str, src: &str, dest: &Path) -> Result<()>;
}

/// Whether a pull spec references an image by digest
pub fn is_pinned(pull_spec: &str) -> bool {
    pull_spec.contains("@sha256:")
}

pub async fn catalog_format(images: &dyn ImageInspector, image: &str) -> Result<CatalogFormat> {
    let format = match images.label(image, FBC_CONFIGS_LABEL).await? {
        Some(_) => CatalogFormat::FileBased,
        None => CatalogFormat::Database,
    };
    debug!(image, ?format, "Detected catalog format");
    Ok(format)
}

pub async fn is_image_fbc(images: &dyn ImageInspector, image: &str) -> Result<bool> {
    Ok(catalog_format(images, image).await? == CatalogFormat::FileBased)
}

async fn copy_once(
    images: &dyn ImageInspector,
    image: &str,
    src: &str,
    dest: PathBuf,
) -> Result<PathBuf> {
    if dest.exists() {
        debug!("Reusing {} extracted earlier", dest.display());
        return Ok(dest);
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    info!("Copying {} from {} to {}", src, image, dest.display());
    images.copy_from_image(image, src, &dest).await?;
    Ok(dest)
}

/// Extract the database of a database-backed index to `base_dir/database/index.db`
pub async fn get_index_database(
    images: &dyn ImageInspector,
    image: &str,
    base_dir: &Path,
) -> Result<PathBuf> {
    let src = images
        .label(image, INDEX_DATABASE_LABEL)
        .await?
        .unwrap_or_else(|| DEFAULT_INDEX_DATABASE.to_string());
    copy_once(images, image, &src, base_dir.join("database").join("index.db")).await
}

/// Extract the configs root of an FBC index to `base_dir/configs`
pub async fn get_catalog_dir(
    images: &dyn ImageInspector,
    image: &str,
    base_dir: &Path,
) -> Result<PathBuf> {
    let src = images.label(image, FBC_CONFIGS_LABEL).await?.ok_or_else(|| {
        IibError::Catalog(format!(
            "Index image {image} is not a file-based catalog, it has no {FBC_CONFIGS_LABEL} label"
        ))
    })?;
    copy_once(images, image, &src, base_dir.join("configs")).await
}

/// Extract the hidden database of an FBC index built by IIB
pub async fn get_hidden_index_database(
    images: &dyn ImageInspector,
    image: &str,
    base_dir: &Path,
    temp_index_db_path: &Path,
) -> Result<PathBuf> {
    copy_once(
        images,
        image,
        HIDDEN_INDEX_DATABASE,
        base_dir.join(temp_index_db_path),
    )
    .await
}

/// Reads labels with `skopeo` and copies content out with `podman`
pub struct PodmanImages {
    runner: Arc<dyn CommandRunner>,
    labels: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl PodmanImages {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            labels: Mutex::new(HashMap::new()),
        }
    }

    async fn all_labels(&self, image: &str) -> Result<BTreeMap<String, String>> {
        if let Some(cached) = self
            .labels
            .lock()
            .ok()
            .and_then(|labels| labels.get(image).cloned())
        {
            return Ok(cached);
        }

        let cmd = ToolCommand::new("skopeo", format!("Failed to inspect {image}"))
            .args(["inspect", "--config"])
            .arg(format!("docker://{image}"));
        let output = self.runner.run(&cmd).await?;
        let parsed = parse_config_labels(&output)?;

        if let Ok(mut labels) = self.labels.lock() {
            labels.insert(image.to_string(), parsed.clone());
        }
        Ok(parsed)
    }
}

/// Labels from `skopeo inspect --config` output
fn parse_config_labels(output: &str) -> Result<BTreeMap<String, String>> {
    let config: Value = serde_json::from_str(output)?;
    let labels = config
        .pointer("/config/Labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(labels)
}

#[async_trait]
impl ImageInspector for PodmanImages {
    async fn label(&self, image: &str, name: &str) -> Result<Option<String>> {
        Ok(self.all_labels(image).await?.get(name).cloned())
    }

    async fn copy_from_image(&self, image: &str, src: &str, dest: &Path) -> Result<()> {
        let context = format!("Failed to copy {src} from {image}");
        let create = ToolCommand::new("podman", context.as_str())
            .args(["create", "--pull=missing", image]);
        let container = self.runner.run(&create).await?.trim().to_string();
        if container.is_empty() {
            return Err(IibError::ToolOutput(format!(
                "podman create returned no container id for {image}"
            )));
        }

        let copy = ToolCommand::new("podman", context.as_str())
            .arg("cp")
            .arg(format!("{container}:{src}"))
            .arg(dest.display().to_string());
        let copied = self.runner.run(&copy).await;

        let remove = ToolCommand::new("podman", format!("Failed to remove container {container}"))
            .args(["rm", "-f", container.as_str()]);
        let removed = self.runner.run(&remove).await;

        copied?;
        removed.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct CannedRunner {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for CannedRunner {
        async fn run(&self, cmd: &ToolCommand) -> Result<String> {
            self.calls.lock().unwrap().push(cmd.to_string());
            match cmd.args.first().map(String::as_str) {
                Some("inspect") => Ok(r#"{"config": {"Labels": {
                    "operators.operatorframework.io.index.configs.v1": "/configs",
                    "com.redhat.index.delivery.version": "v4.15"
                }}}"#
                    .to_string()),
                Some("create") => Ok("abc123\n".to_string()),
                _ => Ok(String::new()),
            }
        }

        async fn run_until_ready(&self, _: &ToolCommand, _: &Path, _: Duration) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_is_pinned() {
        assert!(is_pinned("quay.io/ns/bundle@sha256:123456"));
        assert!(!is_pinned("quay.io/ns/bundle:v1"));
    }

    #[tokio::test]
    async fn test_labels_are_read_once_per_image() {
        let runner = Arc::new(CannedRunner::default());
        let images = PodmanImages::new(runner.clone());

        assert!(is_image_fbc(&images, "quay.io/ns/index:v4.15").await.unwrap());
        assert_eq!(
            images
                .label("quay.io/ns/index:v4.15", DELIVERY_VERSION_LABEL)
                .await
                .unwrap()
                .as_deref(),
            Some("v4.15")
        );
        assert_eq!(
            images
                .label("quay.io/ns/index:v4.15", INDEX_DATABASE_LABEL)
                .await
                .unwrap(),
            None
        );

        assert_eq!(
            *runner.calls.lock().unwrap(),
            vec!["skopeo inspect --config docker://quay.io/ns/index:v4.15".to_string()]
        );
    }

    #[tokio::test]
    async fn test_copy_creates_copies_and_removes_container() {
        let runner = Arc::new(CannedRunner::default());
        let images = PodmanImages::new(runner.clone());

        images
            .copy_from_image("quay.io/ns/index:v4.15", "/configs", Path::new("/tmp/b/configs"))
            .await
            .unwrap();

        assert_eq!(
            *runner.calls.lock().unwrap(),
            vec![
                "podman create --pull=missing quay.io/ns/index:v4.15".to_string(),
                "podman cp abc123:/configs /tmp/b/configs".to_string(),
                "podman rm -f abc123".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_labels_without_labels() {
        let labels = parse_config_labels(r#"{"config": {}}"#).unwrap();
        assert!(labels.is_empty());
    }
}
