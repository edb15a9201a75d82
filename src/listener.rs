// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Keeps a container's host IOMMU mappings in step with the guest memory topology.

use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use log::error;

use crate::container::VfioContainer;
use crate::errno::SysError;
use crate::error::Result;
use crate::error::VfioError;
use crate::guest_iommu::GuestIommuBinding;
use crate::memory::MemoryListener;
use crate::memory::MemorySection;

/// The memory listener a container registers with the address space it serves.
pub struct ContainerListener {
    container: Weak<VfioContainer>,
}

impl ContainerListener {
    pub(crate) fn new(container: Weak<VfioContainer>) -> ContainerListener {
        ContainerListener { container }
    }
}

fn skipped(section: &MemorySection) -> bool {
    (!section.region.is_ram() && !section.region.is_iommu())
        // Sizing an enabled 64-bit BAR can place it in the upper half of the address space.
        // Nothing there is ever a DMA target.
        || section.offset_within_address_space & (1 << 63) != 0
}

fn check_alignment(section: &MemorySection, page_size: u64) -> Result<()> {
    let in_page = page_size - 1;
    if section.offset_within_address_space & in_page != section.offset_within_region & in_page {
        return Err(VfioError::UnalignedSection {
            offset_within_address_space: section.offset_within_address_space,
            offset_within_region: section.offset_within_region,
        });
    }
    Ok(())
}

/// Page aligned IOVA range of a section as `(iova, end)`, `end` exclusive. None when no whole
/// page is covered.
fn aligned_range(section: &MemorySection, page_size: u64) -> Option<(u64, u128)> {
    let page = u128::from(page_size);
    let mask = !(page - 1);
    let start = u128::from(section.offset_within_address_space);
    let iova = (start + page - 1) & mask;
    let end = (start + section.size) & mask;
    if iova >= end {
        return None;
    }
    Some((u64::try_from(iova).ok()?, end))
}

impl MemoryListener for ContainerListener {
    fn region_add(&self, section: &MemorySection) {
        let container = match self.container.upgrade() {
            Some(c) => c,
            None => return,
        };
        if skipped(section) {
            debug!(
                "vfio: listener skipping {} at {:#x}",
                section.region.name(),
                section.offset_within_address_space
            );
            return;
        }
        let page_size = container.page_size();
        if let Err(e) = check_alignment(section, page_size) {
            error!("vfio: region_add received unaligned region: {}", e);
            return;
        }
        let (iova, end) = match aligned_range(section, page_size) {
            Some(r) => r,
            None => return,
        };

        if iova < container.min_iova() || end - 1 > u128::from(container.max_iova()) {
            let err = VfioError::IovaOutOfRange {
                iova,
                end: u64::try_from(end - 1).unwrap_or(u64::MAX),
                min: container.min_iova(),
                max: container.max_iova(),
            };
            error!("vfio: container can't map guest IOVA region: {}", err);
            container.record_failure(err);
            return;
        }

        container.hold_region(&section.region);

        if let Some(binding) = GuestIommuBinding::new(&section.region, Arc::downgrade(&container))
        {
            container.add_giommu(binding.clone());
            binding.attach(container.granularity());
            return;
        }

        // Only RAM gets past the filter at this point.
        let host_base = match section.region.host_addr() {
            Some(addr) => addr,
            None => return,
        };
        let size = match u64::try_from(end - u128::from(iova)) {
            Ok(size) => size,
            Err(_) => {
                container.record_failure(VfioError::IovaOutOfRange {
                    iova,
                    end: u64::MAX,
                    min: container.min_iova(),
                    max: container.max_iova(),
                });
                return;
            }
        };
        let host_addr = match host_base
            .checked_add(section.offset_within_region)
            .and_then(|a| a.checked_add(iova - section.offset_within_address_space))
        {
            Some(addr) => addr,
            None => {
                container.record_failure(VfioError::DmaMap {
                    iova,
                    size,
                    err: SysError::new(libc::EOVERFLOW),
                });
                return;
            }
        };
        debug!(
            "vfio: region_add {} iova {:#x} size {:#x} host {:#x}",
            section.region.name(),
            iova,
            size,
            host_addr
        );
        // SAFETY: the address lies within a RAM region, whose creator guarantees it stays mapped
        // while the region is alive, and the region is held until the range is unmapped.
        if let Err(e) = unsafe { container.dma_map(iova, size, host_addr, section.readonly) } {
            container.record_failure(e);
        }
    }

    fn region_del(&self, section: &MemorySection) {
        let container = match self.container.upgrade() {
            Some(c) => c,
            None => return,
        };
        if skipped(section) {
            return;
        }
        let page_size = container.page_size();
        if let Err(e) = check_alignment(section, page_size) {
            error!("vfio: region_del received unaligned region: {}", e);
            return;
        }

        if section.region.is_iommu() {
            if let Some(binding) = container.remove_giommu(&section.region) {
                binding.detach();
            }
            // The single unmap below is assumed to revoke every finer grained mapping made for
            // this guest IOMMU.
        }

        let (iova, end) = match aligned_range(section, page_size) {
            Some(r) => r,
            None => return,
        };
        debug!(
            "vfio: region_del {} iova {:#x}..{:#x}",
            section.region.name(),
            iova,
            end
        );
        let ret = container.dma_unmap_range(iova, end - u128::from(iova));
        container.release_region(&section.region);
        if let Err(e) = ret {
            error!("vfio: region_del of {} failed: {}", section.region.name(), e);
        }
    }
}
