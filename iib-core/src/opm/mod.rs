//! Catalog operations over the external `opm` tool
//!
//! Nothing here reimplements opm; the functions build opm command lines for
//! the binary selected for the request and interpret what it leaves behind.

pub mod dockerfile;
pub mod fbc;
pub mod fragment;
pub mod input;
pub mod registry;
pub mod render;
pub mod version;

pub use dockerfile::{create_database_dockerfile, create_dockerfile};
pub use fbc::{
    deprecate_bundles_fbc, generate_cache_locally, get_or_create_temp_index_db, mutate_fbc,
    opm_create_empty_fbc, opm_migrate, opm_registry_add_fbc, opm_registry_rm_fbc, opm_validate,
    CatalogMutation,
};
pub use fragment::opm_registry_add_fbc_fragment;
pub use input::{resolve_input, resolve_input_in};
pub use registry::{
    deprecate_bundles_db, deprecate_bundles_in_index, opm_index_add, opm_index_rm, opm_registry_add, opm_registry_rm,
    opm_registry_deprecatetruncate, AddOptions,
};
pub use render::{get_list_bundles, get_list_bundles_in, get_operator_package_list};
pub use version::{parse_opm_version, OpmTool};
