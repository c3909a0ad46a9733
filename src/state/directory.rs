//! Coordinator Directory
//!
//! The single advisory "who is coordinator" slot shared between the peer
//! nodes and the proxy. Writes are best-effort and readers must tolerate a
//! stale or missing value.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tempfile::NamedTempFile;

use super::PeerAddress;
use crate::error::{Error, Result};

/// Read/write slot holding the current coordinator's address
pub trait CoordinatorDirectory: Send + Sync {
    /// Current coordinator, if one is recorded and readable
    fn get(&self) -> Option<PeerAddress>;

    /// Record `address` as the current coordinator
    fn set(&self, address: PeerAddress) -> Result<()>;
}

/// Directory backed by a marker file on shared storage
pub struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CoordinatorDirectory for MarkerFile {
    fn get(&self) -> Option<PeerAddress> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Coordinator marker {:?} does not exist yet", self.path);
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to read coordinator marker {:?}: {}", self.path, e);
                return None;
            }
        };

        if content.trim().is_empty() {
            return None;
        }

        match PeerAddress::parse_lenient(&content) {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!("Ignoring unreadable coordinator marker {:?}: {}", self.path, e);
                None
            }
        }
    }

    fn set(&self, address: PeerAddress) -> Result<()> {
        // Each writer stages into its own temp file in the marker's directory,
        // then renames it over the marker
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir)
            .map_err(|e| Error::Directory(format!("create temp file in {:?}: {}", dir, e)))?;
        staged
            .write_all(address.to_string().as_bytes())
            .map_err(|e| Error::Directory(format!("write {:?}: {}", staged.path(), e)))?;
        staged
            .persist(&self.path)
            .map_err(|e| Error::Directory(format!("rename to {:?}: {}", self.path, e.error)))?;
        Ok(())
    }
}

/// Process-local directory, used by tests and single-host deployments
#[derive(Default)]
pub struct InMemoryDirectory {
    current: RwLock<Option<PeerAddress>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coordinator(address: PeerAddress) -> Self {
        Self {
            current: RwLock::new(Some(address)),
        }
    }
}

impl CoordinatorDirectory for InMemoryDirectory {
    fn get(&self) -> Option<PeerAddress> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, address: PeerAddress) -> Result<()> {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(address);
        Ok(())
    }
}
