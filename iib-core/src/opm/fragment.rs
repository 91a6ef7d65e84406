//! Merging FBC fragments into an index
//!
//! A fragment is a configs tree holding one directory per package. Packages
//! it brings replace whatever the index had for them, including the
//! package's deprecation declarations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

use super::dockerfile::create_dockerfile;
use super::fbc::{generate_cache_locally, get_or_create_temp_index_db, CACHE_DIR, INDEX_DOCKERFILE};
use super::registry::opm_registry_rm;
use super::render::get_list_bundles;
use crate::context::BuildContext;
use crate::error::{IibError, Result};
use crate::fsutil::{copy_tree, remove_dir_if_exists, subdirectory_names};
use crate::image::{get_catalog_dir, FBC_CONFIGS_LABEL};
use crate::state::STATE_IN_PROGRESS;

pub const FRAGMENT_DIR: &str = "fbc_fragment";

const DEFAULT_CONFIGS_ROOT: &str = "/configs";

/// Copy the fragment to `base_dir/fbc_fragment` and list its packages
pub async fn extract_fbc_fragment(
    ctx: &BuildContext,
    fbc_fragment: &str,
) -> Result<(PathBuf, Vec<String>)> {
    let dest = ctx.base_dir().join(FRAGMENT_DIR);

    if !dest.exists() {
        let local = Path::new(fbc_fragment);
        if local.is_dir() {
            copy_tree(local, &dest)?;
        } else {
            let src = ctx
                .images
                .label(fbc_fragment, FBC_CONFIGS_LABEL)
                .await?
                .unwrap_or_else(|| DEFAULT_CONFIGS_ROOT.to_string());
            ctx.images.copy_from_image(fbc_fragment, &src, &dest).await?;
        }
    }

    let packages = subdirectory_names(&dest)?;
    if packages.is_empty() {
        return Err(IibError::Catalog(format!(
            "No operator packages in fbc_fragment {fbc_fragment}"
        )));
    }
    info!("fbc_fragment {} contains packages {:?}", fbc_fragment, packages);
    Ok((dest, packages))
}

/// Which of `packages` the index already has, and its shadow database
pub async fn verify_operators_exists(
    ctx: &BuildContext,
    from_index: &str,
    packages: &[String],
) -> Result<(BTreeSet<String>, PathBuf)> {
    let index_db = get_or_create_temp_index_db(ctx, Some(from_index)).await?;
    let present: BTreeSet<String> = get_list_bundles(ctx, &index_db.display().to_string())
        .await?
        .into_iter()
        .map(|bundle| bundle.package_name)
        .collect();

    let existing = packages
        .iter()
        .filter(|package| present.contains(*package))
        .cloned()
        .collect();
    Ok((existing, index_db))
}

/// Add the packages of `fbc_fragment` to the configs of `from_index`
///
/// Returns the path of the written Dockerfile.
pub async fn opm_registry_add_fbc_fragment(
    ctx: &BuildContext,
    from_index: &str,
    binary_image: &str,
    fbc_fragment: &str,
) -> Result<PathBuf> {
    ctx.set_state(
        STATE_IN_PROGRESS,
        &format!("Extracting operator packages from fbc_fragment {fbc_fragment}"),
    );
    let (fragment_dir, fragment_packages) = extract_fbc_fragment(ctx, fbc_fragment).await?;

    let (existing, index_db) = verify_operators_exists(ctx, from_index, &fragment_packages).await?;
    let configs = get_catalog_dir(ctx.images.as_ref(), from_index, ctx.base_dir()).await?;

    if !existing.is_empty() {
        let existing: Vec<String> = existing.into_iter().collect();
        ctx.set_state(
            STATE_IN_PROGRESS,
            &format!("Removing packages {existing:?} from {from_index}"),
        );
        opm_registry_rm(ctx, &index_db, &existing).await?;

        let deprecations = configs.join(&ctx.config.operator_deprecations_dir);
        for package in &existing {
            remove_dir_if_exists(&configs.join(package))?;
            remove_dir_if_exists(&deprecations.join(package))?;
        }
    }

    for package in &fragment_packages {
        copy_tree(&fragment_dir.join(package), &configs.join(package))?;
    }

    generate_cache_locally(ctx, &configs, &ctx.base_dir().join(CACHE_DIR)).await?;
    create_dockerfile(
        &configs,
        ctx.base_dir(),
        Some(&index_db),
        binary_image,
        Some(INDEX_DOCKERFILE),
    )
}
