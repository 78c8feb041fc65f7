//! UEFI handles.
//!
//! A handle is an opaque id owning GUID → interface bindings. Interfaces
//! are stored as guest addresses (usually a service base), never as
//! references to the service itself.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::uefi::Guid;

/// First handle id. Ids are handed out pre-incremented from here, far from
/// any mapped guest address.
pub const HANDLE_SEED: u64 = 0x5eed_face_0000_0000;

/// One handle's protocol bindings.
#[derive(Debug, Default, Clone)]
pub struct Handle {
    protocols: BTreeMap<Guid, u64>,
}

impl Handle {
    pub fn protocols(&self) -> impl Iterator<Item = (&Guid, &u64)> {
        self.protocols.iter()
    }
}

#[derive(Debug)]
pub struct HandleRegistry {
    next: u64,
    handles: BTreeMap<u64, Handle>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self {
            next: HANDLE_SEED,
            handles: BTreeMap::new(),
        }
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, empty handle.
    pub fn create(&mut self) -> u64 {
        self.next += 1;
        self.handles.insert(self.next, Handle::default());
        self.next
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    /// Bind `interface` under `guid` and every alias.
    pub fn put(&mut self, id: u64, guid: Guid, aliases: &[Guid], interface: u64) -> Result<()> {
        let handle = self.handles.get_mut(&id).ok_or(Error::NoHandle(id))?;
        for g in std::iter::once(&guid).chain(aliases) {
            handle.protocols.insert(*g, interface);
        }
        Ok(())
    }

    /// Interface bound to `guid` on `id`.
    pub fn get(&self, id: u64, guid: &Guid) -> Result<u64> {
        let handle = self.handles.get(&id).ok_or(Error::NoHandle(id))?;
        handle
            .protocols
            .get(guid)
            .copied()
            .ok_or_else(|| Error::NoProtocol {
                handle: id,
                guid: guid.to_string(),
            })
    }

    /// Drop the binding of `guid` on `id`.
    pub fn remove(&mut self, id: u64, guid: &Guid) -> Result<u64> {
        let handle = self.handles.get_mut(&id).ok_or(Error::NoHandle(id))?;
        handle
            .protocols
            .remove(guid)
            .ok_or_else(|| Error::NoProtocol {
                handle: id,
                guid: guid.to_string(),
            })
    }

    /// Every handle exposing `guid`, oldest first.
    pub fn all_handles_by_guid(&self, guid: &Guid) -> Vec<u64> {
        self.handles
            .iter()
            .filter(|(_, h)| h.protocols.contains_key(guid))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Every handle, oldest first.
    pub fn all_handles(&self) -> Vec<u64> {
        self.handles.keys().copied().collect()
    }

    /// GUIDs bound on `id`.
    pub fn protocols(&self, id: u64) -> Result<Vec<Guid>> {
        let handle = self.handles.get(&id).ok_or(Error::NoHandle(id))?;
        Ok(handle.protocols.keys().copied().collect())
    }
}
