//! Build recipes for index images

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;
use crate::image::{
    DEFAULT_INDEX_DATABASE, FBC_CONFIGS_LABEL, HIDDEN_INDEX_DATABASE, INDEX_DATABASE_LABEL,
};

/// Base image without an opm binary
const SCRATCH: &str = "scratch";

fn relative_to(path: &Path, base_dir: &Path) -> String {
    path.strip_prefix(base_dir)
        .ok()
        .or_else(|| path.file_name().map(Path::new))
        .unwrap_or(path)
        .display()
        .to_string()
}

fn render(fbc_dir: &str, index_db: Option<&str>, binary_image: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FROM {binary_image}");
    out.push('\n');

    if binary_image != SCRATCH {
        out.push_str("# Configure the entrypoint and command\n");
        out.push_str("ENTRYPOINT [\"/bin/opm\"]\n");
        out.push_str("CMD [\"serve\", \"/configs\", \"--cache-dir=/tmp/cache\"]\n");
        out.push('\n');
    }

    out.push_str("# Copy declarative config root and cache into image\n");
    let _ = writeln!(out, "ADD {fbc_dir} /configs");
    out.push_str("COPY --chown=1001:0 cache /tmp/cache\n");
    out.push('\n');
    out.push_str("# Set DC-specific label for the location of the DC root directory\n");
    out.push_str("# in the image\n");
    let _ = writeln!(out, "LABEL {FBC_CONFIGS_LABEL}=/configs");

    if let Some(index_db) = index_db {
        out.push('\n');
        let _ = writeln!(out, "ADD {index_db} {HIDDEN_INDEX_DATABASE}");
    }
    out
}

fn render_database(index_db: &str, binary_image: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FROM {binary_image}");
    let _ = writeln!(out, "LABEL {INDEX_DATABASE_LABEL}={DEFAULT_INDEX_DATABASE}");
    let _ = writeln!(out, "ADD {index_db} {DEFAULT_INDEX_DATABASE}");
    out.push_str("EXPOSE 50051\n");
    out.push_str("ENTRYPOINT [\"/bin/opm\"]\n");
    let _ = writeln!(
        out,
        "CMD [\"registry\", \"serve\", \"--database\", \"{DEFAULT_INDEX_DATABASE}\"]"
    );
    out
}

fn write_once(path: PathBuf, content: String, binary_image: &str) -> Result<PathBuf> {
    if path.exists() {
        debug!("{} already exists, leaving it untouched", path.display());
        return Ok(path);
    }
    std::fs::write(&path, content)?;
    info!("Created {} for binary image {}", path.display(), binary_image);
    Ok(path)
}

/// Write `name` into `base_dir` for an index served from `index_db`
///
/// Same layout as the recipe `opm index add --generate` emits. An existing
/// file is left as it is.
pub fn create_database_dockerfile(
    index_db: &Path,
    base_dir: &Path,
    binary_image: &str,
    name: &str,
) -> Result<PathBuf> {
    let content = render_database(&relative_to(index_db, base_dir), binary_image);
    write_once(base_dir.join(name), content, binary_image)
}

/// Write the Dockerfile for `fbc_dir` into `base_dir`
///
/// The file is named `name`, or `<fbc dir name>.Dockerfile` when not
/// given. An existing file of that name is left as it is. Paths inside the
/// recipe are relative to `base_dir`, the build context.
pub fn create_dockerfile(
    fbc_dir: &Path,
    base_dir: &Path,
    index_db: Option<&Path>,
    binary_image: &str,
    name: Option<&str>,
) -> Result<PathBuf> {
    let file_name = match name {
        Some(name) => name.to_string(),
        None => format!(
            "{}.Dockerfile",
            fbc_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "catalog".to_string())
        ),
    };
    let content = render(
        &relative_to(fbc_dir, base_dir),
        index_db.map(|db| relative_to(db, base_dir)).as_deref(),
        binary_image,
    );
    write_once(base_dir.join(file_name), content, binary_image)
}
