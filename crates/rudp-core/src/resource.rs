//! Resource storage seam.
//!
//! The protocol never touches files itself; responders are handed a
//! [`ResourceStore`] that lists, loads and stores resources as ordered
//! units. Units are lines with their terminators kept, so an empty line
//! is still a non-empty unit and concatenating units restores the bytes.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{ProtocolError, Result};

/// Where resources come from and go to.
pub trait ResourceStore: Send + Sync {
    /// Names available for OPEN in the source role, sorted.
    fn list(&self) -> Vec<String>;

    /// Whether `name` may be written in the sink role.
    fn permits(&self, name: &str) -> bool;

    /// Units of `name`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::ResourceUnavailable` if it does not exist.
    fn load(&self, name: &str) -> Result<Vec<Vec<u8>>>;

    /// Persist a received resource.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Storage` on failure.
    fn store(&self, name: &str, units: Vec<Vec<u8>>) -> Result<()>;

    /// Whether `name` exists.
    fn contains(&self, name: &str) -> bool {
        self.list().iter().any(|n| n == name)
    }
}

/// Split bytes into line units, keeping each `\n`.
#[must_use]
pub fn split_units(bytes: &[u8]) -> Vec<Vec<u8>> {
    bytes
        .split_inclusive(|&b| b == b'\n')
        .map(<[u8]>::to_vec)
        .collect()
}

/// Reassemble units produced by [`split_units`].
#[must_use]
pub fn join_units<'a, I>(units: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    units.into_iter().flatten().copied().collect()
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    resources: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a resource.
    pub fn insert(&self, name: impl Into<String>, contents: impl Into<Vec<u8>>) {
        let mut map = self.resources.write().unwrap_or_else(|e| e.into_inner());
        map.insert(name.into(), contents.into());
    }

    /// Raw bytes of a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        let map = self.resources.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }
}

impl ResourceStore for MemoryStore {
    fn list(&self) -> Vec<String> {
        let map = self.resources.read().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }

    fn permits(&self, name: &str) -> bool {
        crate::codec::validate_resource_name(name).is_ok()
    }

    fn load(&self, name: &str) -> Result<Vec<Vec<u8>>> {
        self.get(name)
            .map(|bytes| split_units(&bytes))
            .ok_or_else(|| ProtocolError::ResourceUnavailable(name.to_string()))
    }

    fn store(&self, name: &str, units: Vec<Vec<u8>>) -> Result<()> {
        self.insert(name, join_units(units.iter().map(Vec::as_slice)));
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        let map = self.resources.read().unwrap_or_else(|e| e.into_inner());
        map.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_keeps_terminators_and_blank_lines() {
        let units = split_units(b"one\n\nthree");
        assert_eq!(
            units,
            vec![b"one\n".to_vec(), b"\n".to_vec(), b"three".to_vec()]
        );
        assert!(units.iter().all(|u| !u.is_empty()));
        assert!(split_units(b"").is_empty());
    }

    #[test]
    fn test_join_restores_bytes() {
        let original = b"a:b\r\nc\n\n".to_vec();
        let units = split_units(&original);
        assert_eq!(join_units(units.iter().map(Vec::as_slice)), original);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.insert("b.txt", "x\n");
        store.insert("a.txt", "hello\nworld\n");

        assert_eq!(store.list(), vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert!(store.contains("a.txt"));
        assert!(!store.contains("c.txt"));
        assert_eq!(store.load("a.txt").unwrap().len(), 2);
        assert!(matches!(
            store.load("c.txt"),
            Err(ProtocolError::ResourceUnavailable(name)) if name == "c.txt"
        ));

        store.store("c.txt", vec![b"1\n".to_vec(), b"2".to_vec()]).unwrap();
        assert_eq!(store.get("c.txt").unwrap(), b"1\n2");
    }

    #[test]
    fn test_permits_rejects_reserved_names() {
        let store = MemoryStore::new();
        assert!(store.permits("upload.txt"));
        assert!(!store.permits(""));
        assert!(!store.permits("a:b"));
    }
}
