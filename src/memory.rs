// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The view of guest memory that containers keep in sync with the host IOMMU.
//!
//! A guest address space is a flat list of [`MemorySection`]s, each one a window onto a
//! [`GuestMemoryRegion`]. The guest memory model reports sections appearing and disappearing to
//! every registered [`MemoryListener`], and resolves guest physical addresses on request.

use std::fmt;
use std::sync::Arc;

use crate::guest_iommu::GuestIommu;

/// Identity of a guest address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(pub u64);

/// Handle returned when a listener is registered with a [`GuestAddressSpace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// What backs a guest memory region.
#[derive(Clone)]
pub enum RegionKind {
    /// Guest RAM backed by host memory starting at `host_addr`.
    Ram { host_addr: u64 },
    /// A region whose accesses are translated by a guest visible IOMMU.
    Iommu(Arc<dyn GuestIommu>),
    /// Emulated I/O. Never mapped into the host IOMMU.
    Io,
}

impl fmt::Debug for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegionKind::Ram { host_addr } => f
                .debug_struct("Ram")
                .field("host_addr", &format_args!("{:#x}", host_addr))
                .finish(),
            RegionKind::Iommu(_) => f.write_str("Iommu"),
            RegionKind::Io => f.write_str("Io"),
        }
    }
}

#[derive(Debug)]
pub struct GuestMemoryRegion {
    name: String,
    kind: RegionKind,
    size: u128,
    readonly: bool,
}

impl GuestMemoryRegion {
    /// Creates a RAM region of `size` bytes backed by host memory at `host_addr`.
    ///
    /// # Safety
    ///
    /// `host_addr..host_addr + size` must stay mapped in this process for as long as the region,
    /// or any section referring to it, is alive. Devices are given DMA access to that memory.
    pub unsafe fn new_ram(name: &str, host_addr: u64, size: u64) -> GuestMemoryRegion {
        GuestMemoryRegion {
            name: name.to_owned(),
            kind: RegionKind::Ram { host_addr },
            size: size.into(),
            readonly: false,
        }
    }

    pub fn new_iommu(name: &str, iommu: Arc<dyn GuestIommu>) -> GuestMemoryRegion {
        let size = iommu.size();
        GuestMemoryRegion {
            name: name.to_owned(),
            kind: RegionKind::Iommu(iommu),
            size,
            readonly: false,
        }
    }

    pub fn new_io(name: &str, size: u64) -> GuestMemoryRegion {
        GuestMemoryRegion {
            name: name.to_owned(),
            kind: RegionKind::Io,
            size: size.into(),
            readonly: false,
        }
    }

    pub fn with_readonly(mut self, readonly: bool) -> GuestMemoryRegion {
        self.readonly = readonly;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RegionKind {
        &self.kind
    }

    pub fn size(&self) -> u128 {
        self.size
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_ram(&self) -> bool {
        matches!(self.kind, RegionKind::Ram { .. })
    }

    pub fn is_iommu(&self) -> bool {
        matches!(self.kind, RegionKind::Iommu(_))
    }

    /// Host address backing the start of a RAM region.
    pub fn host_addr(&self) -> Option<u64> {
        match self.kind {
            RegionKind::Ram { host_addr } => Some(host_addr),
            _ => None,
        }
    }

    pub fn iommu(&self) -> Option<&Arc<dyn GuestIommu>> {
        match &self.kind {
            RegionKind::Iommu(iommu) => Some(iommu),
            _ => None,
        }
    }
}

/// A window of a [`GuestMemoryRegion`] placed in a guest address space.
#[derive(Clone, Debug)]
pub struct MemorySection {
    pub region: Arc<GuestMemoryRegion>,
    pub offset_within_address_space: u64,
    pub offset_within_region: u64,
    /// Length in bytes. A section may cover the whole 64-bit space.
    pub size: u128,
    pub readonly: bool,
}

impl MemorySection {
    /// A section covering all of `region`, placed at `addr`.
    pub fn new(region: Arc<GuestMemoryRegion>, addr: u64) -> MemorySection {
        MemorySection {
            offset_within_address_space: addr,
            offset_within_region: 0,
            size: region.size(),
            readonly: region.readonly(),
            region,
        }
    }
}

impl PartialEq for MemorySection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
            && self.offset_within_address_space == other.offset_within_address_space
            && self.offset_within_region == other.offset_within_region
            && self.size == other.size
            && self.readonly == other.readonly
    }
}

/// Receives topology changes of a guest address space.
///
/// Calls are made synchronously and serially by the guest memory model.
pub trait MemoryListener: Send + Sync {
    fn region_add(&self, section: &MemorySection);
    fn region_del(&self, section: &MemorySection);
}

/// Result of resolving a guest address down to a memory region.
#[derive(Clone, Debug)]
pub struct Translation {
    pub region: Arc<GuestMemoryRegion>,
    pub offset_within_region: u64,
    /// Number of bytes, at most the requested length, that stay within `region`.
    pub len: u64,
}

/// A guest address space as seen by the passthrough layer.
pub trait GuestAddressSpace: Send + Sync {
    fn id(&self) -> AddressSpaceId;

    /// Adds `listener` and calls its `region_add` for every existing section before returning.
    ///
    /// The implementation must not hold its own locks while calling into the listener.
    fn register_listener(&self, listener: Arc<dyn MemoryListener>) -> ListenerId;

    /// Removes a listener. No `region_del` calls are made for the sections it has seen.
    fn unregister_listener(&self, id: ListenerId);

    /// Resolves `addr` to the region backing it, shortening `len` to what the region covers.
    fn translate(&self, addr: u64, len: u64, is_write: bool) -> Option<Translation>;
}
