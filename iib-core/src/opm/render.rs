//! `opm render` output parsing

use serde_json::Value;
use std::path::Path;
use tracing::debug;

use super::input::resolve_input_in;
use crate::bundle::Bundle;
use crate::context::BuildContext;
use crate::error::{IibError, Result};

const SCHEMA_BUNDLE: &str = "olm.bundle";
const SCHEMA_PACKAGE: &str = "olm.package";

/// Render `input` and return the stream of declarative config objects
///
/// Images are extracted under `extract_dir` first.
pub async fn opm_render(ctx: &BuildContext, input: &str, extract_dir: &Path) -> Result<Vec<Value>> {
    let resolved = resolve_input_in(ctx, input, extract_dir).await?;
    let cmd = ctx
        .opm_command(format!("Failed to run opm render with input: {input}"))
        .arg("render")
        .arg(resolved.display().to_string());
    let output = ctx.runner.run(&cmd).await?;
    parse_render_output(&output)
}

/// `opm render` prints concatenated JSON documents, not a JSON array
pub fn parse_render_output(output: &str) -> Result<Vec<Value>> {
    let objects = serde_json::Deserializer::from_str(output)
        .into_iter::<Value>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(objects)
}

fn schema(object: &Value) -> Option<&str> {
    object.get("schema").and_then(Value::as_str)
}

fn string_field(object: &Value, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Version from the bundle's `olm.package` property
pub fn olm_bundle_version(bundle: &Value) -> Result<String> {
    bundle
        .get("properties")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|property| property.get("type").and_then(Value::as_str) == Some(SCHEMA_PACKAGE))
        .find_map(|property| property.pointer("/value/version").and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| IibError::Catalog("No olm package version found for OLM bundle.".into()))
}

pub fn bundles_from_render(objects: &[Value]) -> Result<Vec<Bundle>> {
    objects
        .iter()
        .filter(|object| schema(object) == Some(SCHEMA_BUNDLE))
        .map(|object| {
            Ok(Bundle {
                package_name: string_field(object, "package"),
                version: olm_bundle_version(object)?,
                bundle_path: string_field(object, "image"),
                csv_name: string_field(object, "name"),
            })
        })
        .collect()
}

pub fn packages_from_render(objects: &[Value]) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();
    for object in objects.iter().filter(|o| schema(o) == Some(SCHEMA_PACKAGE)) {
        let name = string_field(object, "name");
        if !packages.contains(&name) {
            packages.push(name);
        }
    }
    packages
}

/// Every bundle in the catalog behind `input`
pub async fn get_list_bundles(ctx: &BuildContext, input: &str) -> Result<Vec<Bundle>> {
    get_list_bundles_in(ctx, input, ctx.base_dir()).await
}

pub async fn get_list_bundles_in(
    ctx: &BuildContext,
    input: &str,
    extract_dir: &Path,
) -> Result<Vec<Bundle>> {
    let bundles = bundles_from_render(&opm_render(ctx, input, extract_dir).await?)?;
    debug!(input, count = bundles.len(), "Rendered bundles");
    Ok(bundles)
}

/// Names of the packages in the catalog behind `input`
pub async fn get_operator_package_list(ctx: &BuildContext, input: &str) -> Result<Vec<String>> {
    Ok(packages_from_render(&opm_render(ctx, input, ctx.base_dir()).await?))
}
