// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host VFIO control surface.
//!
//! Each trait mirrors one kind of kernel object: the container (`/dev/vfio/vfio`), an isolation
//! group (`/dev/vfio/<id>`) and a device descriptor handed out by its group. Dropping an object
//! closes it.

use std::os::raw::c_int;

use vfio_sys::*;

use crate::errno::SysError;
use crate::mmap::MemoryMapping;
use crate::mmap::Protection;

pub type RawDescriptor = c_int;

pub trait VfioHost: Send + Sync {
    fn open_container(&self) -> Result<Box<dyn HostContainer>, SysError>;
    fn open_group(&self, group_id: u32) -> Result<Box<dyn HostGroup>, SysError>;
}

pub trait HostContainer: Send + Sync {
    fn api_version(&self) -> i32;
    fn check_extension(&self, extension: u32) -> bool;
    fn set_iommu(&self, iommu: IommuType) -> Result<(), SysError>;
    /// Enables a windowed IOMMU after it has been selected.
    fn enable_iommu(&self) -> Result<(), SysError>;
    fn type1_info(&self) -> Result<Type1Info, SysError>;
    fn spapr_tce_info(&self) -> Result<SpaprTceInfo, SysError>;

    /// Maps `size` bytes of host memory at `host_addr` to `iova`.
    ///
    /// # Safety
    ///
    /// `host_addr..host_addr + size` must stay mapped until the range is unmapped again or the
    /// container is closed; devices gain DMA access to it.
    unsafe fn map_dma(
        &self,
        iova: u64,
        size: u64,
        host_addr: u64,
        readonly: bool,
    ) -> Result<(), SysError>;
    fn unmap_dma(&self, iova: u64, size: u64) -> Result<(), SysError>;

    /// Issues an EEH partitionable endpoint operation and returns the host's result.
    fn eeh_pe_op(&self, op: u32) -> Result<i32, SysError>;

    fn as_raw_descriptor(&self) -> RawDescriptor;
}

pub trait HostGroup: Send + Sync {
    /// Returns the group status flags.
    fn status(&self) -> Result<u32, SysError>;
    fn set_container(&self, container: &dyn HostContainer) -> Result<(), SysError>;
    fn unset_container(&self) -> Result<(), SysError>;
    fn get_device(&self, name: &str) -> Result<Box<dyn HostDevice>, SysError>;
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

pub trait HostDevice: Send + Sync {
    fn info(&self) -> Result<DeviceInfo, SysError>;
    fn region_info(&self, index: u32) -> Result<RegionInfo, SysError>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, SysError>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, SysError>;
    fn mmap(&self, offset: u64, size: usize, prot: Protection) -> Result<MemoryMapping, SysError>;
    fn reset(&self) -> Result<(), SysError>;
    fn set_irqs(&self, irqs: &IrqSet) -> Result<(), SysError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IommuType {
    Type1,
    Type1v2,
    SpaprTce,
}

impl IommuType {
    pub fn raw(self) -> u32 {
        match self {
            IommuType::Type1 => VFIO_TYPE1_IOMMU,
            IommuType::Type1v2 => VFIO_TYPE1v2_IOMMU,
            IommuType::SpaprTce => VFIO_SPAPR_TCE_IOMMU,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Type1Info {
    pub flags: u32,
    pub iova_pgsizes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaprTceInfo {
    pub dma32_window_start: u32,
    pub dma32_window_size: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub flags: u32,
    pub num_regions: u32,
    pub num_irqs: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionInfo {
    pub index: u32,
    pub flags: u32,
    pub size: u64,
    /// Offset of the region within the device descriptor.
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqAction {
    /// Tear down every trigger of the index.
    Disable,
    Mask,
    Unmask,
}

/// A data-less `VFIO_DEVICE_SET_IRQS` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqSet {
    pub index: u32,
    pub start: u32,
    pub count: u32,
    pub action: IrqAction,
}

impl IrqSet {
    pub fn flags(&self) -> u32 {
        VFIO_IRQ_SET_DATA_NONE
            | match self.action {
                IrqAction::Disable => VFIO_IRQ_SET_ACTION_TRIGGER,
                IrqAction::Mask => VFIO_IRQ_SET_ACTION_MASK,
                IrqAction::Unmask => VFIO_IRQ_SET_ACTION_UNMASK,
            }
    }
}
