//! Directory-backed resource store.
//!
//! One regular file per resource, named after it. Incoming resources are
//! written to a dotfile first and renamed into place once complete.

use rudp_core::{ProtocolError, ResourceStore, join_units, split_units, validate_resource_name};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Resources stored as files in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Serve from `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Backing directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Option<PathBuf> {
        self.permits(name).then(|| self.root.join(name))
    }
}

impl ResourceStore for DirectoryStore {
    fn list(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot list {}: {}", self.root.display(), e);
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| self.permits(name))
            .collect();
        names.sort();
        names
    }

    fn permits(&self, name: &str) -> bool {
        validate_resource_name(name).is_ok()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !name.contains("..")
    }

    fn load(&self, name: &str) -> rudp_core::Result<Vec<Vec<u8>>> {
        let path = self
            .path_for(name)
            .ok_or_else(|| ProtocolError::ResourceUnavailable(name.to_string()))?;
        match fs::read(&path) {
            Ok(bytes) => Ok(split_units(&bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ProtocolError::ResourceUnavailable(name.to_string()))
            }
            Err(e) => Err(ProtocolError::Storage(format!("{}: {}", path.display(), e))),
        }
    }

    fn store(&self, name: &str, units: Vec<Vec<u8>>) -> rudp_core::Result<()> {
        let path = self
            .path_for(name)
            .ok_or_else(|| ProtocolError::Storage(format!("name not permitted: {name:?}")))?;
        let partial = self.root.join(format!(".{name}.part"));

        let bytes = join_units(units.iter().map(Vec::as_slice));
        fs::write(&partial, bytes)
            .and_then(|()| fs::rename(&partial, &path))
            .map_err(|e| ProtocolError::Storage(format!("{}: {}", path.display(), e)))
    }

    fn contains(&self, name: &str) -> bool {
        self.path_for(name).is_some_and(|path| path.is_file())
    }
}
