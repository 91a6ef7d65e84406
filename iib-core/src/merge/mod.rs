//! Merge planning between a source and a target index
//!
//! The merged index is the source index plus every target bundle the source
//! does not have yet. Bundles whose platform-version label rejects the
//! target platform version, and source bundles that disagree with the
//! target about a release, end up deprecated.

pub mod apply;

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::bundle::Bundle;
use crate::error::{CatalogSide, IibError, Result};
use crate::image::ImageInspector;
use crate::ocp_version::{is_compatible, OCP_VERSIONS_LABEL};

pub use apply::{handle_merge_request, MergeOutcome, MergeRequest};

/// Same package and release name, different content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub source: Bundle,
    pub target: Bundle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Target bundles the source does not have
    pub missing: Vec<Bundle>,
    /// Missing bundles that will be added
    pub to_add: Vec<Bundle>,
    /// Bundles to deprecate after the add
    pub invalid: Vec<Bundle>,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions<'a> {
    /// Platform version of the merged index, e.g. `v4.15`
    pub target_version: &'a str,
    /// Bundles without a platform-version label are compatible
    pub allow_empty: bool,
    /// Add incompatible missing bundles anyway; they are still deprecated
    pub ignore_platform_version: bool,
}

fn ensure_pinned(bundles: &[Bundle], side: CatalogSide) -> Result<()> {
    match bundles.iter().find(|bundle| !bundle.is_pinned()) {
        Some(bundle) => Err(IibError::UnpinnedBundle {
            bundle: bundle.bundle_path.clone(),
            side,
        }),
        None => Ok(()),
    }
}

/// Target bundles missing from the source and conflicting release pairs
///
/// A target bundle is missing when no source bundle of its package has the
/// same release name or the same digest. Presence is judged per package: a
/// digest or release name that the source only carries under another
/// package does not make the target bundle known. Every bundle must be
/// pinned by digest.
pub fn classify(source: &[Bundle], target: &[Bundle]) -> Result<(Vec<Bundle>, Vec<Conflict>)> {
    ensure_pinned(source, CatalogSide::Source)?;
    ensure_pinned(target, CatalogSide::Target)?;

    let mut missing = Vec::new();
    let mut conflicts = Vec::new();

    for target_bundle in target {
        let same_package: Vec<&Bundle> = source
            .iter()
            .filter(|bundle| bundle.package_name == target_bundle.package_name)
            .collect();

        let known = same_package.iter().any(|bundle| {
            bundle.csv_name == target_bundle.csv_name || bundle.digest() == target_bundle.digest()
        });
        if !known {
            missing.push(target_bundle.clone());
        }

        for source_bundle in same_package {
            if source_bundle.csv_name == target_bundle.csv_name
                && (source_bundle.bundle_path != target_bundle.bundle_path
                    || source_bundle.version != target_bundle.version)
            {
                warn!(
                    "Bundle {} conflicts with {} from the target index",
                    source_bundle, target_bundle
                );
                conflicts.push(Conflict {
                    source: source_bundle.clone(),
                    target: target_bundle.clone(),
                });
            }
        }
    }

    Ok((missing, conflicts))
}

/// Bundles whose platform-version label does not accept `target_version`
pub async fn incompatible_bundles(
    images: &dyn ImageInspector,
    bundles: &[Bundle],
    target_version: &str,
    allow_empty: bool,
) -> Result<Vec<Bundle>> {
    let mut invalid = Vec::new();
    for bundle in bundles {
        let expression = images
            .label(&bundle.bundle_path, OCP_VERSIONS_LABEL)
            .await?
            .unwrap_or_default();
        if !is_compatible(&expression, target_version, allow_empty)? {
            debug!(
                bundle = %bundle.bundle_path,
                expression,
                target_version,
                "Bundle is not compatible"
            );
            invalid.push(bundle.clone());
        }
    }
    Ok(invalid)
}

fn push_unique(list: &mut Vec<Bundle>, seen: &mut HashSet<String>, bundle: &Bundle) {
    if seen.insert(bundle.bundle_path.clone()) {
        list.push(bundle.clone());
    }
}

/// Compute what to add to and deprecate from the source index
pub async fn plan_merge(
    images: &dyn ImageInspector,
    source: &[Bundle],
    target: &[Bundle],
    options: PlanOptions<'_>,
) -> Result<MergePlan> {
    let (missing, conflicts) = classify(source, target)?;

    let invalid_missing =
        incompatible_bundles(images, &missing, options.target_version, options.allow_empty)
            .await?;
    let invalid_source =
        incompatible_bundles(images, source, options.target_version, options.allow_empty).await?;

    let mut invalid = Vec::new();
    let mut seen = HashSet::new();
    for bundle in invalid_missing
        .iter()
        .chain(invalid_source.iter())
        .chain(conflicts.iter().map(|conflict| &conflict.source))
    {
        push_unique(&mut invalid, &mut seen, bundle);
    }

    let excluded: HashSet<&str> = invalid_missing
        .iter()
        .map(|bundle| bundle.bundle_path.as_str())
        .collect();
    let to_add = missing
        .iter()
        .filter(|bundle| {
            options.ignore_platform_version || !excluded.contains(bundle.bundle_path.as_str())
        })
        .cloned()
        .collect();

    let plan = MergePlan {
        missing,
        to_add,
        invalid,
        conflicts,
    };
    info!(
        missing = plan.missing.len(),
        to_add = plan.to_add.len(),
        invalid = plan.invalid.len(),
        conflicts = plan.conflicts.len(),
        "Computed merge plan"
    );
    Ok(plan)
}
