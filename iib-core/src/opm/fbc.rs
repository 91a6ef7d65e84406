//! File-based catalog operations
//!
//! FBC content is never edited directly. Every mutation is applied to a
//! shadow `index.db` kept in the working directory, and the visible catalog
//! is then regenerated from it with `opm migrate`, cache included. The
//! shadow ships inside the image at the hidden database path so that later
//! requests can pick it up again.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::dockerfile::create_dockerfile;
use super::registry::{deprecate_bundles_db, opm_registry_add, opm_registry_rm, AddOptions};
use super::version::supports_migrate_level;
use crate::config::{OPM_PORT, OPM_PPROF_PORT};
use crate::context::BuildContext;
use crate::error::{IibError, Result};
use crate::fsutil::{is_non_empty_dir, remove_dir_if_exists};
use crate::image::{catalog_format, get_hidden_index_database, get_index_database, CatalogFormat};
use crate::ports::{opm_port_stacks, with_port_leases};
use crate::state::STATE_IN_PROGRESS;

pub const CATALOG_DIR: &str = "catalog";
pub const CACHE_DIR: &str = "cache";
pub const INDEX_DOCKERFILE: &str = "index.Dockerfile";

const MIGRATE_LEVEL: &str = "bundle-object-to-csv-metadata";

/// opm writes this file last when building a cache
const CACHE_DIGEST_FILE: &str = "digest";

/// A change expressed against the database form of a catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogMutation {
    Add {
        bundles: Vec<String>,
        options: AddOptions,
    },
    Remove {
        packages: Vec<String>,
    },
    Deprecate {
        bundles: Vec<String>,
    },
}

impl CatalogMutation {
    pub async fn apply_to_database(&self, ctx: &BuildContext, index_db: &Path) -> Result<()> {
        match self {
            CatalogMutation::Add { bundles, options } => {
                opm_registry_add(ctx, index_db, bundles, options).await
            }
            CatalogMutation::Remove { packages } => opm_registry_rm(ctx, index_db, packages).await,
            CatalogMutation::Deprecate { bundles } => {
                deprecate_bundles_db(ctx, index_db, bundles).await.map(|_| ())
            }
        }
    }
}

pub async fn opm_validate(ctx: &BuildContext, fbc_dir: &Path) -> Result<()> {
    info!("Validating {}", fbc_dir.display());
    let cmd = ctx
        .opm_command("Failed to validate the content from config_dir")
        .arg("validate")
        .arg(fbc_dir.display().to_string());
    ctx.runner.run(&cmd).await?;
    Ok(())
}

/// Convert `index_db` into `base_dir/catalog`
///
/// A non-empty catalog directory is taken as already migrated. Returns the
/// catalog directory and, when requested, the generated cache directory.
pub async fn opm_migrate(
    ctx: &BuildContext,
    index_db: &Path,
    generate_cache: bool,
) -> Result<(PathBuf, Option<PathBuf>)> {
    let fbc_dir = ctx.base_dir().join(CATALOG_DIR);

    if is_non_empty_dir(&fbc_dir) {
        info!(
            "{} already contains a catalog, skipping migration",
            fbc_dir.display()
        );
    } else {
        let version = ctx.opm_version().await?;
        let mut cmd = ctx
            .opm_command("Failed to migrate index.db to file-based catalog")
            .arg("migrate");
        if supports_migrate_level(&ctx.config, version)? {
            cmd = cmd.args(["--migrate-level", MIGRATE_LEVEL]);
        }
        let cmd = cmd
            .arg(index_db.display().to_string())
            .arg(fbc_dir.display().to_string());
        ctx.runner.run(&cmd).await?;
        opm_validate(ctx, &fbc_dir).await?;
    }

    if !generate_cache {
        return Ok((fbc_dir, None));
    }

    let cache_dir = ctx.base_dir().join(CACHE_DIR);
    generate_cache_locally(ctx, &fbc_dir, &cache_dir).await?;
    Ok((fbc_dir, Some(cache_dir)))
}

/// Build the serve cache for `fbc_dir` by running `opm serve --cache-only`
/// on leased ports
pub async fn generate_cache_locally(
    ctx: &BuildContext,
    fbc_dir: &Path,
    cache_dir: &Path,
) -> Result<()> {
    remove_dir_if_exists(cache_dir)?;

    let fbc_dir = if fbc_dir.is_absolute() {
        fbc_dir.to_path_buf()
    } else {
        ctx.base_dir().join(fbc_dir)
    };
    let version = ctx.opm_version().await?;
    let mut ports = opm_port_stacks(&ctx.config, &[OPM_PORT, OPM_PPROF_PORT], version)?;

    with_port_leases(
        &mut ports,
        ctx.leases.as_ref(),
        ctx.port_policy(),
        |assignment| async move {
            let mut cmd = ctx
                .opm_command("Failed to generate cache for file-based catalog")
                .arg("serve")
                .arg(fbc_dir.display().to_string())
                .arg(format!("--cache-dir={}", cache_dir.display()))
                .args(["--cache-only", "--termination-log", "/dev/null"]);
            if let Some(port) = assignment.get(OPM_PORT) {
                cmd = cmd.arg("-p").arg(port.to_string());
            }
            if let Some(port) = assignment.get(OPM_PPROF_PORT) {
                cmd = cmd.arg("--pprof-addr").arg(format!("127.0.0.1:{port}"));
            }

            ctx.runner
                .run_until_ready(
                    &cmd,
                    &cache_dir.join(CACHE_DIGEST_FILE),
                    ctx.config.cache_wait(),
                )
                .await
        },
    )
    .await?;

    if !cache_dir.is_dir() {
        return Err(IibError::MissingArtifact(cache_dir.to_path_buf()));
    }
    debug!("Generated cache at {}", cache_dir.display());
    Ok(())
}

/// The shadow database for this build, created on first use
///
/// Taken from `from_index` (its hidden database for an FBC image, its
/// database otherwise) or, without an index, created empty.
pub async fn get_or_create_temp_index_db(
    ctx: &BuildContext,
    from_index: Option<&str>,
) -> Result<PathBuf> {
    let shadow = ctx.base_dir().join(&ctx.config.temp_index_db_path);
    if shadow.is_file() {
        debug!("Reusing shadow database {}", shadow.display());
        return Ok(shadow);
    }

    let images = ctx.images.as_ref();
    match from_index {
        Some(from_index) => match catalog_format(images, from_index).await? {
            CatalogFormat::FileBased => {
                get_hidden_index_database(
                    images,
                    from_index,
                    ctx.base_dir(),
                    &ctx.config.temp_index_db_path,
                )
                .await
            }
            CatalogFormat::Database => {
                let index_db = get_index_database(images, from_index, ctx.base_dir()).await?;
                if index_db != shadow {
                    if let Some(parent) = shadow.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(&index_db, &shadow)?;
                }
                Ok(shadow)
            }
        },
        None => {
            if let Some(parent) = shadow.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!("Creating empty shadow database {}", shadow.display());
            opm_registry_add(ctx, &shadow, &[], &AddOptions::default()).await?;
            Ok(shadow)
        }
    }
}

/// Regenerate the visible catalog, its cache and `index.Dockerfile` from
/// `index_db`
pub async fn project_catalog(
    ctx: &BuildContext,
    index_db: &Path,
    binary_image: &str,
) -> Result<PathBuf> {
    remove_dir_if_exists(&ctx.base_dir().join(CATALOG_DIR))?;
    let (fbc_dir, _) = opm_migrate(ctx, index_db, true).await?;
    create_dockerfile(
        &fbc_dir,
        ctx.base_dir(),
        Some(index_db),
        binary_image,
        Some(INDEX_DOCKERFILE),
    )
}

/// Apply `mutation` to the shadow database and regenerate the catalog
///
/// Returns the path of the written Dockerfile.
pub async fn mutate_fbc(
    ctx: &BuildContext,
    from_index: Option<&str>,
    binary_image: &str,
    mutation: &CatalogMutation,
) -> Result<PathBuf> {
    let index_db = get_or_create_temp_index_db(ctx, from_index).await?;
    mutation.apply_to_database(ctx, &index_db).await?;
    project_catalog(ctx, &index_db, binary_image).await
}

pub async fn opm_registry_add_fbc(
    ctx: &BuildContext,
    from_index: Option<&str>,
    bundles: &[String],
    binary_image: &str,
    options: &AddOptions,
) -> Result<PathBuf> {
    let mutation = CatalogMutation::Add {
        bundles: bundles.to_vec(),
        options: options.clone(),
    };
    mutate_fbc(ctx, from_index, binary_image, &mutation).await
}

pub async fn opm_registry_rm_fbc(
    ctx: &BuildContext,
    from_index: &str,
    operators: &[String],
    binary_image: &str,
) -> Result<PathBuf> {
    let mutation = CatalogMutation::Remove {
        packages: operators.to_vec(),
    };
    mutate_fbc(ctx, Some(from_index), binary_image, &mutation).await
}

pub async fn deprecate_bundles_fbc(
    ctx: &BuildContext,
    from_index: Option<&str>,
    bundles: &[String],
    binary_image: &str,
) -> Result<PathBuf> {
    let mutation = CatalogMutation::Deprecate {
        bundles: bundles.to_vec(),
    };
    mutate_fbc(ctx, from_index, binary_image, &mutation).await
}

/// Catalog with every listed operator removed, keeping the index's
/// non-package content
pub async fn opm_create_empty_fbc(
    ctx: &BuildContext,
    from_index: &str,
    binary_image: &str,
    operators: &[String],
) -> Result<PathBuf> {
    ctx.set_state(
        STATE_IN_PROGRESS,
        &format!("Removing all operators from {from_index}"),
    );
    opm_registry_rm_fbc(ctx, from_index, operators, binary_image).await
}
