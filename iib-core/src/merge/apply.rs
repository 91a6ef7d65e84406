//! Running a merge request end to end

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{plan_merge, MergePlan, PlanOptions};
use crate::bundle::Bundle;
use crate::context::{BuildContext, IndexPublisher};
use crate::error::{IibError, Result};
use crate::image::{is_image_fbc, DELIVERY_VERSION_LABEL};
use crate::opm::fbc::{deprecate_bundles_fbc, get_or_create_temp_index_db, INDEX_DOCKERFILE};
use crate::opm::registry::{deprecate_bundles_db, opm_index_add, AddOptions};
use crate::opm::render::{get_list_bundles, get_list_bundles_in};
use crate::opm::opm_registry_add_fbc;
use crate::state::{STATE_COMPLETE, STATE_IN_PROGRESS};

/// Extraction directory for the target index, kept apart from the source
const TARGET_EXTRACT_DIR: &str = "target";

#[derive(Debug, Clone, Default)]
pub struct MergeRequest {
    pub source_from_index: String,
    /// Without a target only the deprecation list is applied
    pub target_index: Option<String>,
    pub binary_image: String,
    /// Bundle pull specs to deprecate in addition to the invalid ones
    pub deprecation_list: Vec<String>,
    pub ignore_bundle_ocp_version: bool,
    pub overwrite_latest: bool,
    pub graph_update_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub added: Vec<Bundle>,
    pub invalid: Vec<Bundle>,
    pub deprecated: Vec<String>,
    pub conflicts: usize,
    pub dockerfile: PathBuf,
    pub published: PathBuf,
}

async fn required_label(ctx: &BuildContext, image: &str, label: &str) -> Result<String> {
    ctx.images.label(image, label).await?.ok_or_else(|| {
        IibError::Config(format!("Index image {image} has no {label} label"))
    })
}

/// Merge the missing bundles of the target index into the source index
///
/// The working directory of `ctx` holds the build context afterwards; it is
/// handed to `publisher` before returning.
pub async fn handle_merge_request(
    ctx: &mut BuildContext,
    request: &MergeRequest,
    publisher: &dyn IndexPublisher,
) -> Result<MergeOutcome> {
    ctx.set_state(STATE_IN_PROGRESS, "Resolving the index images");
    let source = request.source_from_index.as_str();
    let target = request.target_index.as_deref();

    let version_image = target.unwrap_or(source);
    let target_version = required_label(ctx, version_image, DELIVERY_VERSION_LABEL).await?;
    ctx.select_opm(Some(target_version.as_str()));

    let source_fbc = is_image_fbc(ctx.images.as_ref(), source).await?;
    let target_fbc = match target {
        Some(target) => Some(is_image_fbc(ctx.images.as_ref(), target).await?),
        None => None,
    };
    if source_fbc && target_fbc == Some(false) {
        return Err(IibError::Catalog(
            "Cannot merge source File-Based Catalog index image into target SQLite index image."
                .into(),
        ));
    }
    let fbc_output = target_fbc.unwrap_or(source_fbc);

    let ctx = &*ctx;
    ctx.set_state(STATE_IN_PROGRESS, "Getting bundles present in the index images");
    let source_bundles = get_list_bundles(ctx, source).await?;
    let target_bundles = match target {
        Some(target) => {
            let extract_dir = ctx.base_dir().join(TARGET_EXTRACT_DIR);
            get_list_bundles_in(ctx, target, &extract_dir).await?
        }
        None => Vec::new(),
    };

    let options = PlanOptions {
        target_version: &target_version,
        allow_empty: ctx.config.allows_missing_ocp_label(version_image),
        ignore_platform_version: request.ignore_bundle_ocp_version,
    };
    let plan = plan_merge(ctx.images.as_ref(), &source_bundles, &target_bundles, options).await?;

    ctx.set_state(
        STATE_IN_PROGRESS,
        &format!("Adding {} missing bundle(s) to the source index", plan.to_add.len()),
    );
    let to_add: Vec<String> = plan
        .to_add
        .iter()
        .map(|bundle| bundle.bundle_path.clone())
        .collect();
    let add_options = AddOptions {
        overwrite_latest: request.overwrite_latest,
        container_tool: ctx.config.container_tool.clone(),
        mode: request.graph_update_mode.clone(),
    };

    // A single add even with nothing to add, so opm validates the graph
    let index_db = if fbc_output {
        opm_registry_add_fbc(ctx, Some(source), &to_add, &request.binary_image, &add_options)
            .await?;
        get_or_create_temp_index_db(ctx, Some(source)).await?
    } else {
        opm_index_add(ctx, &to_add, &request.binary_image, Some(source), &add_options).await?;
        ctx.base_dir().join("database").join("index.db")
    };

    let deprecated = deprecations(ctx, &plan, request, &index_db).await?;
    if !deprecated.is_empty() {
        ctx.set_state(
            STATE_IN_PROGRESS,
            &format!("Deprecating {} bundle(s)", deprecated.len()),
        );
        if fbc_output {
            deprecate_bundles_fbc(ctx, Some(source), &deprecated, &request.binary_image).await?;
        } else {
            deprecate_bundles_db(ctx, &index_db, &deprecated).await?;
        }
    }

    let dockerfile = ctx.base_dir().join(INDEX_DOCKERFILE);
    let published = publisher.publish(ctx, &dockerfile).await?;
    ctx.set_state(STATE_COMPLETE, "The index image was successfully merged");

    Ok(MergeOutcome {
        added: plan.to_add,
        invalid: plan.invalid,
        deprecated,
        conflicts: plan.conflicts.len(),
        dockerfile,
        published,
    })
}

/// Invalid bundles plus the requested ones, limited to bundles the merged
/// database actually contains
async fn deprecations(
    ctx: &BuildContext,
    plan: &MergePlan,
    request: &MergeRequest,
    index_db: &Path,
) -> Result<Vec<String>> {
    let requested: Vec<String> = plan
        .invalid
        .iter()
        .map(|bundle| bundle.bundle_path.clone())
        .chain(request.deprecation_list.iter().cloned())
        .collect();
    if requested.is_empty() {
        return Ok(requested);
    }

    let present: HashSet<String> = get_list_bundles(ctx, &index_db.display().to_string())
        .await?
        .into_iter()
        .map(|bundle| bundle.bundle_path)
        .collect();

    let mut seen = HashSet::new();
    let deprecated: Vec<String> = requested
        .into_iter()
        .filter(|path| present.contains(path) && seen.insert(path.clone()))
        .collect();
    info!(count = deprecated.len(), "Bundles selected for deprecation");
    Ok(deprecated)
}
