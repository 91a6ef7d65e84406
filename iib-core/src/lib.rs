//! IIB index image build library
//!
//! Building blocks for assembling operator index images: host-wide port
//! leases for short-lived `opm serve` processes, the `opm` adapter covering
//! both database and file-based catalogs, and the merge planner that brings
//! a source index up to date with a target index.

pub mod bundle;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod image;
pub mod merge;
pub mod ocp_version;
pub mod opm;
pub mod ports;
pub mod state;

pub use bundle::Bundle;
pub use config::WorkerConfig;
pub use context::{BuildContext, DirectoryPublisher, IndexPublisher};
pub use error::{IibError, Result};
