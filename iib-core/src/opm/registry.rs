//! Database-level opm commands
//!
//! `opm registry ...` mutates an `index.db` in place. `opm index ...` is the
//! older variant that builds the index image itself (`--generate` only
//! writes the build context).

use std::path::{Path, PathBuf};
use tracing::info;

use super::dockerfile::create_database_dockerfile;
use super::fbc::INDEX_DOCKERFILE;
use crate::context::BuildContext;
use crate::error::Result;
use crate::exec::ToolCommand;
use crate::image::get_index_database;

/// Flags shared by the add commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOptions {
    pub overwrite_latest: bool,
    pub container_tool: Option<String>,
    /// Graph update mode, e.g. `semver` or `replaces`
    pub mode: Option<String>,
}

/// Comma-joined bundle list; an empty list is passed as `""` so opm still
/// validates the update graph
fn bundle_list_arg(bundles: &[String]) -> String {
    if bundles.is_empty() {
        "\"\"".to_string()
    } else {
        bundles.join(",")
    }
}

fn with_add_options(cmd: ToolCommand, options: &AddOptions) -> ToolCommand {
    cmd.flag_if(options.overwrite_latest, "--overwrite-latest")
        .opt_arg("--container-tool", options.container_tool.as_deref())
        .opt_arg("--mode", options.mode.as_deref())
        .arg("--enable-alpha")
}

fn db_arg(index_db: &Path) -> String {
    index_db.display().to_string()
}

pub fn registry_add_command(
    ctx: &BuildContext,
    index_db: &Path,
    bundles: &[String],
    options: &AddOptions,
) -> ToolCommand {
    let cmd = ctx
        .opm_command("Failed to add the bundles to the index image")
        .args(["registry", "add", "--database"])
        .arg(db_arg(index_db))
        .arg("--bundle-images")
        .arg(bundle_list_arg(bundles));
    with_add_options(cmd, options)
}

pub async fn opm_registry_add(
    ctx: &BuildContext,
    index_db: &Path,
    bundles: &[String],
    options: &AddOptions,
) -> Result<()> {
    info!(
        "Adding {} bundle(s) to {} via registry add",
        bundles.len(),
        index_db.display()
    );
    ctx.runner
        .run(&registry_add_command(ctx, index_db, bundles, options))
        .await?;
    Ok(())
}

pub async fn opm_registry_rm(ctx: &BuildContext, index_db: &Path, packages: &[String]) -> Result<()> {
    info!("Removing packages {:?} from {}", packages, index_db.display());
    let cmd = ctx
        .opm_command("Failed to remove operators from the index image")
        .args(["registry", "rm", "--database"])
        .arg(db_arg(index_db))
        .arg("--packages")
        .arg(packages.join(","));
    ctx.runner.run(&cmd).await?;
    Ok(())
}

/// One `deprecatetruncate` call, no batching
pub async fn opm_registry_deprecatetruncate(
    ctx: &BuildContext,
    index_db: &Path,
    bundles: &[String],
) -> Result<()> {
    let cmd = ctx
        .opm_command(format!(
            "Failed to deprecate the bundles on {}",
            index_db.display()
        ))
        .args(["registry", "deprecatetruncate", "--database"])
        .arg(db_arg(index_db))
        .arg("--bundle-images")
        .arg(bundles.join(","))
        .arg("--allow-package-removal");
    ctx.runner.run(&cmd).await?;
    Ok(())
}

/// Deprecate `bundles` in chunks of `deprecate_bundles_limit`
///
/// Returns the number of opm invocations made.
pub async fn deprecate_bundles_db(
    ctx: &BuildContext,
    index_db: &Path,
    bundles: &[String],
) -> Result<usize> {
    let limit = ctx.config.deprecate_bundles_limit.max(1);
    let mut calls = 0;
    for chunk in bundles.chunks(limit) {
        info!(
            "Deprecating {} bundle(s) in {} (batch {})",
            chunk.len(),
            index_db.display(),
            calls + 1
        );
        opm_registry_deprecatetruncate(ctx, index_db, chunk).await?;
        calls += 1;
    }
    Ok(calls)
}

/// Deprecate `bundles` in the database of `from_index` and write the recipe
/// that serves the updated database from `binary_image`
///
/// Returns the path of the written `index.Dockerfile`.
pub async fn deprecate_bundles_in_index(
    ctx: &BuildContext,
    from_index: &str,
    bundles: &[String],
    binary_image: &str,
) -> Result<PathBuf> {
    let index_db = get_index_database(ctx.images.as_ref(), from_index, ctx.base_dir()).await?;
    deprecate_bundles_db(ctx, &index_db, bundles).await?;
    create_database_dockerfile(&index_db, ctx.base_dir(), binary_image, INDEX_DOCKERFILE)
}

pub async fn opm_index_add(
    ctx: &BuildContext,
    bundles: &[String],
    binary_image: &str,
    from_index: Option<&str>,
    options: &AddOptions,
) -> Result<()> {
    let cmd = ctx
        .opm_command("Failed to add the bundles to the index image")
        .args(["index", "add", "--generate", "--bundles"])
        .arg(bundle_list_arg(bundles))
        .args(["--binary-image", binary_image])
        .opt_arg("--from-index", from_index);
    ctx.runner.run(&with_add_options(cmd, options)).await?;
    Ok(())
}

pub async fn opm_index_rm(
    ctx: &BuildContext,
    operators: &[String],
    binary_image: &str,
    from_index: &str,
    container_tool: Option<&str>,
) -> Result<()> {
    let cmd = ctx
        .opm_command("Failed to remove operators from the index image")
        .args(["index", "rm", "--generate", "--operators"])
        .arg(operators.join(","))
        .args(["--binary-image", binary_image, "--from-index", from_index])
        .opt_arg("--container-tool", container_tool);
    ctx.runner.run(&cmd).await?;
    Ok(())
}
