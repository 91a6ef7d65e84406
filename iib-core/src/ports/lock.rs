//! Host-wide port leases backed by marker files
//!
//! A lease is held when (a) nothing on the host has the port bound on the
//! IPv4 loopback address and
//! (b) this process created `<tmp>/iib_<purpose>_<port>.lock` exclusively.
//! The marker file name is shared with every other worker on the host, so
//! it must not change.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{ContentionKind, IibError, Result};

/// Exclusive claim on one port for one purpose
pub trait PortLease: Send {
    fn purpose(&self) -> &str;
    fn port(&self) -> u16;
    fn is_locked(&self) -> bool;
    fn acquire(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// Creates leases for candidate ports
pub trait LeaseProvider: Send + Sync {
    fn lease(&self, purpose: &str, port: u16) -> Box<dyn PortLease>;
}

/// Marker file name for a purpose/port pair
pub fn marker_file_name(purpose: &str, port: u16) -> String {
    format!("iib_{purpose}_{port}.lock")
}

#[derive(Debug)]
pub struct PortFileLock {
    purpose: String,
    port: u16,
    path: PathBuf,
    locked: bool,
}

impl PortFileLock {
    /// Lease with its marker in the host temp directory
    pub fn new(purpose: &str, port: u16) -> Self {
        Self::in_dir(&std::env::temp_dir(), purpose, port)
    }

    pub fn in_dir(dir: &Path, purpose: &str, port: u16) -> Self {
        Self {
            purpose: purpose.to_string(),
            port,
            path: dir.join(marker_file_name(purpose, port)),
            locked: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for PortFileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PortFileLock(port: {}, purpose: {}, locked: {})",
            self.port, self.purpose, self.locked
        )
    }
}

impl PortLease for PortFileLock {
    fn purpose(&self) -> &str {
        &self.purpose
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_locked(&self) -> bool {
        self.locked
    }

    fn acquire(&mut self) -> Result<()> {
        // The test socket is closed again before the marker is created
        match TcpListener::bind((Ipv4Addr::LOCALHOST, self.port)) {
            Ok(listener) => drop(listener),
            Err(e) => {
                debug!(port = self.port, error = %e, "Port is bound by another process");
                return Err(IibError::AddressInUse {
                    port: self.port,
                    kind: ContentionKind::System,
                });
            }
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => {
                self.locked = true;
                trace!("Acquired {}", self);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(IibError::AddressInUse {
                port: self.port,
                kind: ContentionKind::Worker,
            }),
            Err(e) => Err(IibError::Io(e)),
        }
    }

    fn release(&mut self) -> Result<()> {
        if !self.locked {
            return Err(IibError::LockNotHeld(self.to_string()));
        }

        fs::remove_file(&self.path)?;
        self.locked = false;
        trace!("Released {}", self);
        Ok(())
    }
}

/// Leases backed by [`PortFileLock`] markers in one directory
#[derive(Debug, Clone)]
pub struct MarkerFileLeases {
    dir: PathBuf,
}

impl MarkerFileLeases {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl Default for MarkerFileLeases {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl LeaseProvider for MarkerFileLeases {
    fn lease(&self, purpose: &str, port: u16) -> Box<dyn PortLease> {
        Box::new(PortFileLock::in_dir(&self.dir, purpose, port))
    }
}
