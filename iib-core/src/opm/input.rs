use std::path::{Path, PathBuf};
use tracing::debug;

use crate::context::BuildContext;
use crate::error::Result;
use crate::image::{catalog_format, get_catalog_dir, get_index_database, CatalogFormat};

/// Local artifact for an image reference or path
///
/// Existing local paths are returned unchanged. An image is extracted into
/// the working directory: its configs tree for a file-based catalog, its
/// database otherwise. Extraction happens once per working directory.
pub async fn resolve_input(ctx: &BuildContext, input: &str) -> Result<PathBuf> {
    resolve_input_in(ctx, input, ctx.base_dir()).await
}

/// Like [`resolve_input`] but extracts images under `extract_dir`
pub async fn resolve_input_in(
    ctx: &BuildContext,
    input: &str,
    extract_dir: &Path,
) -> Result<PathBuf> {
    let local = Path::new(input);
    if local.exists() {
        debug!(input, "Input is a local path");
        return Ok(local.to_path_buf());
    }

    let images = ctx.images.as_ref();
    match catalog_format(images, input).await? {
        CatalogFormat::FileBased => get_catalog_dir(images, input, extract_dir).await,
        CatalogFormat::Database => get_index_database(images, input, extract_dir).await,
    }
}
