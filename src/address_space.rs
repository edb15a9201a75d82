// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::container::VfioContainer;
use crate::memory::AddressSpaceId;
use crate::memory::GuestAddressSpace;

/// The containers serving one guest address space.
#[derive(Clone)]
pub struct AddressSpaceEntry {
    space: Arc<dyn GuestAddressSpace>,
    containers: Vec<Arc<VfioContainer>>,
}

impl AddressSpaceEntry {
    pub fn space(&self) -> &Arc<dyn GuestAddressSpace> {
        &self.space
    }

    pub fn containers(&self) -> &[Arc<VfioContainer>] {
        &self.containers
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub(crate) fn add_container(&mut self, container: Arc<VfioContainer>) {
        self.containers.push(container);
    }

    pub(crate) fn remove_container(&mut self, container: &Arc<VfioContainer>) -> bool {
        let before = self.containers.len();
        self.containers.retain(|c| !Arc::ptr_eq(c, container));
        self.containers.len() != before
    }
}

/// Guest address spaces that currently have containers, keyed by identity.
#[derive(Clone, Default)]
pub struct AddressSpaceRegistry {
    entries: BTreeMap<AddressSpaceId, AddressSpaceEntry>,
}

impl AddressSpaceRegistry {
    /// Returns the entry for `space`, creating an empty one on first use.
    pub fn resolve(&mut self, space: &Arc<dyn GuestAddressSpace>) -> &mut AddressSpaceEntry {
        self.entries
            .entry(space.id())
            .or_insert_with(|| AddressSpaceEntry {
                space: space.clone(),
                containers: Vec::new(),
            })
    }

    /// Drops the entry for `id` if it has no containers left. Returns true if it was dropped.
    pub fn release(&mut self, id: AddressSpaceId) -> bool {
        match self.entries.get(&id) {
            Some(entry) if entry.is_empty() => {
                self.entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: AddressSpaceId) -> Option<&AddressSpaceEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: AddressSpaceId) -> Option<&mut AddressSpaceEntry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: AddressSpaceId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressSpaceEntry> {
        self.entries.values()
    }
}
