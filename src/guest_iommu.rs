// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest visible IOMMUs and the bindings that mirror their translations into a container.

use std::sync::Arc;
use std::sync::Weak;

use bitflags::bitflags;
use log::debug;
use log::error;
use sync::Mutex;

use crate::container::VfioContainer;
use crate::error::Result;
use crate::error::VfioError;
use crate::memory::GuestMemoryRegion;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IommuPerm: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// One translation of a guest IOMMU. `addr_mask` is the size of the range minus one and is
/// always of the form `2^n - 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IommuTlbEntry {
    pub iova: u64,
    pub translated_addr: u64,
    pub addr_mask: u64,
    pub perm: IommuPerm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NotifierId(pub u64);

/// Receives translation changes from a guest IOMMU.
pub trait IommuNotifier: Send + Sync {
    fn notify(&self, entry: &IommuTlbEntry);
}

pub trait GuestIommu: Send + Sync {
    fn register_notifier(&self, notifier: Arc<dyn IommuNotifier>) -> NotifierId;
    fn unregister_notifier(&self, id: NotifierId);

    /// Looks up the translation currently installed for `iova`. Unmapped addresses yield an
    /// entry with empty permissions.
    fn translate(&self, iova: u64, is_write: bool) -> IommuTlbEntry;

    /// Size of the IOVA space this IOMMU translates.
    fn size(&self) -> u128;

    /// Calls `notifier` once for every translation currently installed, as if each had just
    /// been added, probing the IOVA space in steps of `granularity`.
    ///
    /// Implementations that can list their translations directly should override this; probing
    /// a large IOVA space one granule at a time is slow.
    fn replay(&self, notifier: &dyn IommuNotifier, granularity: u64, is_write: bool) {
        let step = u128::from(granularity.max(1).next_power_of_two());
        let size = self.size();
        let mut addr: u128 = 0;
        while addr < size {
            let entry = self.translate(addr as u64, is_write);
            let mut next = addr + step;
            if !entry.perm.is_empty() {
                notifier.notify(&entry);
                next = next.max(u128::from(entry.iova) + u128::from(entry.addr_mask) + 1);
            }
            addr = (next + step - 1) & !(step - 1);
        }
    }
}

/// Ties a guest IOMMU region to the container that mirrors it.
pub struct GuestIommuBinding {
    region: Arc<GuestMemoryRegion>,
    iommu: Arc<dyn GuestIommu>,
    container: Weak<VfioContainer>,
    notifier: Mutex<Option<NotifierId>>,
}

impl GuestIommuBinding {
    /// Returns `None` unless `region` is translated by a guest IOMMU.
    pub(crate) fn new(
        region: &Arc<GuestMemoryRegion>,
        container: Weak<VfioContainer>,
    ) -> Option<Arc<GuestIommuBinding>> {
        let iommu = region.iommu()?.clone();
        Some(Arc::new(GuestIommuBinding {
            region: region.clone(),
            iommu,
            container,
            notifier: Mutex::new(None),
        }))
    }

    /// Registers with the guest IOMMU and replays its current translations.
    pub(crate) fn attach(self: &Arc<Self>, granularity: u64) {
        let id = self.iommu.register_notifier(self.clone());
        *self.notifier.lock() = Some(id);
        self.iommu.replay(&**self, granularity, false);
    }

    pub(crate) fn detach(&self) {
        if let Some(id) = self.notifier.lock().take() {
            self.iommu.unregister_notifier(id);
        }
    }

    pub fn region(&self) -> &Arc<GuestMemoryRegion> {
        &self.region
    }

    pub(crate) fn is_for(&self, region: &Arc<GuestMemoryRegion>) -> bool {
        Arc::ptr_eq(&self.region, region)
    }

    fn mirror(&self, container: &VfioContainer, entry: &IommuTlbEntry) -> Result<()> {
        debug!(
            "vfio: iommu map notify iova {:#x} mask {:#x} perm {:?}",
            entry.iova, entry.addr_mask, entry.perm
        );
        let granularity_err = VfioError::TranslationGranularity {
            iova: entry.iova,
            mask: entry.addr_mask,
        };
        let len = entry.addr_mask.checked_add(1).ok_or(granularity_err.clone())?;

        // The entry only covers translation through this IOMMU; follow it the rest of the way
        // to guest RAM.
        let target = container
            .system_memory()
            .translate(
                entry.translated_addr,
                len,
                entry.perm.contains(IommuPerm::WRITE),
            )
            .ok_or(VfioError::TranslationNotMemory { iova: entry.iova })?;
        let base = target
            .region
            .host_addr()
            .ok_or(VfioError::TranslationNotMemory { iova: entry.iova })?;
        if target.len & entry.addr_mask != 0 {
            return Err(granularity_err);
        }

        if entry.perm.intersects(IommuPerm::READ | IommuPerm::WRITE) {
            let readonly = !entry.perm.contains(IommuPerm::WRITE) || target.region.readonly();
            // SAFETY: the address lies within a RAM region, whose creator guarantees it stays
            // mapped while the region is alive.
            unsafe {
                container.dma_map(
                    entry.iova,
                    len,
                    base + target.offset_within_region,
                    readonly,
                )
            }
        } else {
            container.dma_unmap(entry.iova, len)
        }
    }
}

impl IommuNotifier for GuestIommuBinding {
    fn notify(&self, entry: &IommuTlbEntry) {
        let container = match self.container.upgrade() {
            Some(c) => c,
            None => return,
        };
        if let Err(e) = self.mirror(&container, entry) {
            error!("vfio: failed to mirror guest IOMMU translation: {}", e);
        }
    }
}
