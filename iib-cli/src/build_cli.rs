//! Build request subcommands
//!
//! Each request gets a fresh [`BuildContext`]; its working directory is
//! removed when the command returns, after the result has been published.

use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::{debug, info};

use iib_core::bundle::Bundle;
use iib_core::context::{BuildContext, DirectoryPublisher, IndexPublisher};
use iib_core::image::{is_image_fbc, DELIVERY_VERSION_LABEL};
use iib_core::merge::{handle_merge_request, MergeOutcome, MergeRequest};
use iib_core::opm::fbc::INDEX_DOCKERFILE;
use iib_core::opm::{
    create_dockerfile, deprecate_bundles_fbc, deprecate_bundles_in_index, get_list_bundles,
    get_operator_package_list, opm_create_empty_fbc, opm_index_add, opm_index_rm, opm_migrate,
    opm_registry_add_fbc, opm_registry_add_fbc_fragment, opm_registry_rm_fbc, resolve_input,
    AddOptions,
};
use iib_core::state::{STATE_COMPLETE, STATE_FAILED};
use iib_core::WorkerConfig;

#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Request identifier (defaults to the current time in milliseconds)
    #[clap(long)]
    request_id: Option<u64>,

    /// Directory receiving the finished build context
    #[clap(long, default_value = "./iib-builds")]
    output: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum BuildCommand {
    /// List the bundles of an index image, database or catalog directory
    Render {
        input: String,

        /// Output as JSON
        #[clap(long)]
        json: bool,

        #[clap(flatten)]
        request: RequestArgs,
    },

    /// Add bundles to an index
    Add {
        /// Index to add to; a new file-based catalog is started without one
        #[clap(long)]
        from_index: Option<String>,

        /// Bundle pull specs (comma-separated)
        #[clap(long, value_delimiter = ',')]
        bundles: Vec<String>,

        #[clap(long)]
        binary_image: String,

        #[clap(long)]
        overwrite_latest: bool,

        /// Graph update mode (e.g. semver, replaces)
        #[clap(long)]
        mode: Option<String>,

        #[clap(flatten)]
        request: RequestArgs,
    },

    /// Remove operator packages from an index
    Rm {
        #[clap(long)]
        from_index: String,

        /// Package names (comma-separated)
        #[clap(long, value_delimiter = ',', required = true)]
        operators: Vec<String>,

        #[clap(long)]
        binary_image: String,

        #[clap(flatten)]
        request: RequestArgs,
    },

    /// Deprecate bundles in an index
    Deprecate {
        #[clap(long)]
        from_index: String,

        /// Bundle pull specs (comma-separated)
        #[clap(long, value_delimiter = ',', required = true)]
        bundles: Vec<String>,

        #[clap(long)]
        binary_image: String,

        #[clap(flatten)]
        request: RequestArgs,
    },

    /// Convert an index database to a file-based catalog
    Migrate {
        /// Database image or local index.db
        index: String,

        /// Also write index.Dockerfile on top of this base image
        #[clap(long)]
        binary_image: Option<String>,

        /// Skip generating the serve cache
        #[clap(long)]
        no_cache: bool,

        #[clap(flatten)]
        request: RequestArgs,
    },

    /// Add the packages of an FBC fragment to an index
    AddFragment {
        #[clap(long)]
        from_index: String,

        /// Fragment image or local configs directory
        #[clap(long)]
        fragment: String,

        #[clap(long)]
        binary_image: String,

        #[clap(flatten)]
        request: RequestArgs,
    },

    /// Remove every operator package from an index
    CreateEmpty {
        #[clap(long)]
        from_index: String,

        #[clap(long)]
        binary_image: String,

        #[clap(flatten)]
        request: RequestArgs,
    },

    /// Add the bundles of a target index missing from a source index
    Merge {
        #[clap(long)]
        source: String,

        #[clap(long)]
        target: Option<String>,

        #[clap(long)]
        binary_image: String,

        /// Extra bundle pull specs to deprecate (comma-separated)
        #[clap(long, value_delimiter = ',')]
        deprecation_list: Vec<String>,

        /// Add bundles even when their platform-version label rejects the target
        #[clap(long)]
        ignore_bundle_ocp_version: bool,

        #[clap(long)]
        overwrite_latest: bool,

        #[clap(long)]
        graph_update_mode: Option<String>,

        /// Output the merge result as JSON
        #[clap(long)]
        json: bool,

        #[clap(flatten)]
        request: RequestArgs,
    },
}

#[derive(Tabled)]
struct BundleRow {
    #[tabled(rename = "Package")]
    package: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "CSV")]
    csv: String,
    #[tabled(rename = "Bundle")]
    bundle: String,
}

impl From<&Bundle> for BundleRow {
    fn from(bundle: &Bundle) -> Self {
        Self {
            package: bundle.package_name.clone(),
            version: bundle.version.clone(),
            csv: bundle.csv_name.clone(),
            bundle: bundle.bundle_path.clone(),
        }
    }
}

fn print_bundles(title: &str, bundles: &[Bundle]) {
    println!("{title} ({})", bundles.len());
    if bundles.is_empty() {
        return;
    }
    let rows: Vec<BundleRow> = bundles.iter().map(BundleRow::from).collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
}

fn default_request_id() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Use the opm binary mapped to the platform version of `index`
async fn select_opm_for(ctx: &mut BuildContext, index: &str) -> Result<()> {
    if Path::new(index).exists() {
        debug!(index, "Local input, keeping the default opm");
        return Ok(());
    }
    let label = ctx.images.label(index, DELIVERY_VERSION_LABEL).await?;
    ctx.select_opm(label.as_deref());
    Ok(())
}

fn add_options(ctx: &BuildContext, overwrite_latest: bool, mode: Option<String>) -> AddOptions {
    AddOptions {
        overwrite_latest,
        container_tool: ctx.config.container_tool.clone(),
        mode,
    }
}

impl BuildCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BuildCommand::Render { .. } => "render",
            BuildCommand::Add { .. } => "add",
            BuildCommand::Rm { .. } => "rm",
            BuildCommand::Deprecate { .. } => "deprecate",
            BuildCommand::Migrate { .. } => "migrate",
            BuildCommand::AddFragment { .. } => "add-fragment",
            BuildCommand::CreateEmpty { .. } => "create-empty",
            BuildCommand::Merge { .. } => "merge",
        }
    }

    fn request(&self) -> &RequestArgs {
        match self {
            BuildCommand::Render { request, .. }
            | BuildCommand::Add { request, .. }
            | BuildCommand::Rm { request, .. }
            | BuildCommand::Deprecate { request, .. }
            | BuildCommand::Migrate { request, .. }
            | BuildCommand::AddFragment { request, .. }
            | BuildCommand::CreateEmpty { request, .. }
            | BuildCommand::Merge { request, .. } => request,
        }
    }

    pub async fn execute(self, config: WorkerConfig) -> Result<()> {
        config.validate()?;
        let request = self.request().clone();
        let request_id = request.request_id.unwrap_or_else(default_request_id);
        let mut ctx = BuildContext::builder(request_id, Arc::new(config)).build()?;
        let publisher = DirectoryPublisher::new(request.output);

        let result = self.run(&mut ctx, &publisher).await;
        if let Err(e) = &result {
            ctx.set_state(STATE_FAILED, &format!("{e:#}"));
        }
        result
    }

    async fn run(self, ctx: &mut BuildContext, publisher: &DirectoryPublisher) -> Result<()> {
        let dockerfile = match self {
            BuildCommand::Render { input, json, .. } => {
                select_opm_for(ctx, &input).await?;
                let bundles = get_list_bundles(ctx, &input).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&bundles)?);
                } else {
                    print_bundles(&input, &bundles);
                }
                return Ok(());
            }
            BuildCommand::Merge {
                source,
                target,
                binary_image,
                deprecation_list,
                ignore_bundle_ocp_version,
                overwrite_latest,
                graph_update_mode,
                json,
                ..
            } => {
                let request = MergeRequest {
                    source_from_index: source,
                    target_index: target,
                    binary_image,
                    deprecation_list,
                    ignore_bundle_ocp_version,
                    overwrite_latest,
                    graph_update_mode,
                };
                let outcome = handle_merge_request(ctx, &request, publisher).await?;
                print_merge_outcome(&outcome, json)?;
                return Ok(());
            }
            BuildCommand::Add {
                from_index,
                bundles,
                binary_image,
                overwrite_latest,
                mode,
                ..
            } => {
                let options = add_options(ctx, overwrite_latest, mode);
                match from_index.as_deref() {
                    Some(index) => {
                        select_opm_for(ctx, index).await?;
                        if is_image_fbc(ctx.images.as_ref(), index).await? {
                            opm_registry_add_fbc(ctx, Some(index), &bundles, &binary_image, &options)
                                .await?
                        } else {
                            opm_index_add(ctx, &bundles, &binary_image, Some(index), &options)
                                .await?;
                            ctx.base_dir().join(INDEX_DOCKERFILE)
                        }
                    }
                    None => {
                        opm_registry_add_fbc(ctx, None, &bundles, &binary_image, &options).await?
                    }
                }
            }
            BuildCommand::Rm {
                from_index,
                operators,
                binary_image,
                ..
            } => {
                select_opm_for(ctx, &from_index).await?;
                if is_image_fbc(ctx.images.as_ref(), &from_index).await? {
                    opm_registry_rm_fbc(ctx, &from_index, &operators, &binary_image).await?
                } else {
                    let container_tool = ctx.config.container_tool.clone();
                    opm_index_rm(
                        ctx,
                        &operators,
                        &binary_image,
                        &from_index,
                        container_tool.as_deref(),
                    )
                    .await?;
                    ctx.base_dir().join(INDEX_DOCKERFILE)
                }
            }
            BuildCommand::Deprecate {
                from_index,
                bundles,
                binary_image,
                ..
            } => {
                select_opm_for(ctx, &from_index).await?;
                if is_image_fbc(ctx.images.as_ref(), &from_index).await? {
                    deprecate_bundles_fbc(ctx, Some(&from_index), &bundles, &binary_image).await?
                } else {
                    deprecate_bundles_in_index(ctx, &from_index, &bundles, &binary_image).await?
                }
            }
            BuildCommand::Migrate {
                index,
                binary_image,
                no_cache,
                ..
            } => {
                select_opm_for(ctx, &index).await?;
                let index_db = resolve_input(ctx, &index).await?;
                if index_db.is_dir() {
                    return Err(anyhow!("{index} is already a file-based catalog"));
                }
                let (fbc_dir, _) = opm_migrate(ctx, &index_db, !no_cache).await?;
                match binary_image {
                    Some(binary_image) => create_dockerfile(
                        &fbc_dir,
                        ctx.base_dir(),
                        Some(&index_db),
                        &binary_image,
                        Some(INDEX_DOCKERFILE),
                    )?,
                    None => fbc_dir,
                }
            }
            BuildCommand::AddFragment {
                from_index,
                fragment,
                binary_image,
                ..
            } => {
                select_opm_for(ctx, &from_index).await?;
                opm_registry_add_fbc_fragment(ctx, &from_index, &binary_image, &fragment).await?
            }
            BuildCommand::CreateEmpty {
                from_index,
                binary_image,
                ..
            } => {
                select_opm_for(ctx, &from_index).await?;
                let operators = get_operator_package_list(ctx, &from_index).await?;
                info!("Removing {} operator package(s)", operators.len());
                if is_image_fbc(ctx.images.as_ref(), &from_index).await? {
                    opm_create_empty_fbc(ctx, &from_index, &binary_image, &operators).await?
                } else {
                    let container_tool = ctx.config.container_tool.clone();
                    opm_index_rm(
                        ctx,
                        &operators,
                        &binary_image,
                        &from_index,
                        container_tool.as_deref(),
                    )
                    .await?;
                    ctx.base_dir().join(INDEX_DOCKERFILE)
                }
            }
        };

        let published = publisher.publish(ctx, &dockerfile).await?;
        ctx.set_state(STATE_COMPLETE, "The build context is ready");
        println!("{}", published.display());
        Ok(())
    }
}

fn print_merge_outcome(outcome: &MergeOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    print_bundles("Added", &outcome.added);
    print_bundles("Invalid", &outcome.invalid);
    println!("Deprecated ({})", outcome.deprecated.len());
    for bundle in &outcome.deprecated {
        println!("  {bundle}");
    }
    if outcome.conflicts > 0 {
        println!("Conflicting releases: {}", outcome.conflicts);
    }
    println!("{}", outcome.published.display());
    Ok(())
}
