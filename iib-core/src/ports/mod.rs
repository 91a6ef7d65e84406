//! Port-lock arbiter
//!
//! Several IIB workers can run on one host and each may start an
//! `opm serve` helper. Ports are leased through marker files in the host
//! temp directory so that two workers never target the same port at once.

pub mod generator;
pub mod guard;
pub mod lock;

pub use generator::{opm_port_stacks, PortStackGenerator};
pub use guard::{acquire_port_set, with_port_leases, LeaseSet, PortAssignment, PortRetryPolicy};
pub use lock::{marker_file_name, LeaseProvider, MarkerFileLeases, PortFileLock, PortLease};
