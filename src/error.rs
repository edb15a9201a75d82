// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error;

use crate::errno::SysError;

#[sorted]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfioError {
    #[error("group {group_id} is already used in a different address space")]
    AddressSpaceConflict { group_id: u32 },
    #[error("unsupported VFIO API version {0}")]
    ApiVersion(i32),
    #[error("container has been closed")]
    ContainerClosed,
    #[error("device {0} has been released")]
    DeviceReleased(String),
    #[error("failed to map DMA iova {iova:#x} size {size:#x}: {err}")]
    DmaMap { iova: u64, size: u64, err: SysError },
    #[error("failed to unmap DMA iova {iova:#x} size {size:#x}: {err}")]
    DmaUnmap { iova: u64, size: u64, err: SysError },
    #[error("EEH operations require a container with exactly one group, found {0}")]
    EehIneligible(usize),
    #[error("EEH operations require exactly one container in the address space, found {0}")]
    EehNoContainer(usize),
    #[error("EEH PE operation {op:#x} failed: {err}")]
    EehOp { op: u32, err: SysError },
    #[error("failed to enable container IOMMU: {0}")]
    EnableIommu(SysError),
    #[error("failed to get device {name} from group {group_id}: {err}")]
    GetDevice {
        group_id: u32,
        name: String,
        err: SysError,
    },
    #[error("failed to get info of device {name}: {err}")]
    GetDeviceInfo { name: String, err: SysError },
    #[error("failed to get status of group {group_id}: {err}")]
    GetGroupStatus { group_id: u32, err: SysError },
    #[error("failed to get container IOMMU info: {0}")]
    GetIommuInfo(SysError),
    #[error("failed to get info of region {index} of device {name}: {err}")]
    GetRegionInfo {
        name: String,
        index: u32,
        err: SysError,
    },
    #[error("group {0} is not viable, all of its devices must be bound to a vfio bus driver")]
    GroupNotViable(u32),
    #[error("group {0} has been released")]
    GroupReleased(u32),
    #[error("mmap window {offset:#x}+{size:#x} does not fit region {index}")]
    InvalidMmapWindow { index: u32, offset: u64, size: u64 },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("IOVA range {iova:#x}..={end:#x} is outside the container window {min:#x}..={max:#x}")]
    IovaOutOfRange { iova: u64, end: u64, min: u64, max: u64 },
    #[error("failed to set irqs of index {index} on device {name}: {err}")]
    IrqSet {
        name: String,
        index: u32,
        err: SysError,
    },
    #[error("no available IOMMU models")]
    NoIommuModel,
    #[error("failed to open container: {0}")]
    OpenContainer(SysError),
    #[error("failed to open group {group_id}: {err}")]
    OpenGroup { group_id: u32, err: SysError },
    #[error("failed to mmap region {index} of device {name} at offset {offset:#x}: {err}")]
    RegionMmap {
        name: String,
        index: u32,
        offset: u64,
        err: SysError,
    },
    #[error("failed to reset device {name}: {err}")]
    Reset { name: String, err: SysError },
    #[error("failed to add group {group_id} to container: {err}")]
    SetContainer { group_id: u32, err: SysError },
    #[error("failed to set container IOMMU model: {0}")]
    SetIommu(SysError),
    #[error("IOMMU granularity at iova {iova:#x} mask {mask:#x} is incompatible with the target address space")]
    TranslationGranularity { iova: u64, mask: u64 },
    #[error("IOMMU maps iova {iova:#x} to a non memory area")]
    TranslationNotMemory { iova: u64 },
    #[error("section at {offset_within_address_space:#x} has region offset {offset_within_region:#x} with a different page alignment")]
    UnalignedSection {
        offset_within_address_space: u64,
        offset_within_region: u64,
    },
}

/// Coarse classification of a [`VfioError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inconsistent or unsupported setup. Never retried.
    Configuration,
    /// A host call returned an error code.
    HostCall,
    /// Section boundaries disagree in their sub-page bits.
    Alignment,
    /// An IOVA range falls outside the container's window.
    Bounds,
    /// A guest IOMMU translation that cannot be mirrored.
    Translation,
    /// An EEH operation on a container or address space it cannot apply to.
    Eligibility,
    /// The object was already torn down.
    Released,
}

impl VfioError {
    pub fn kind(&self) -> ErrorKind {
        use VfioError::*;
        match self {
            AddressSpaceConflict { .. }
            | ApiVersion(_)
            | GroupNotViable(_)
            | InvalidMmapWindow { .. }
            | InvalidOptions(_)
            | NoIommuModel => ErrorKind::Configuration,
            ContainerClosed | DeviceReleased(_) | GroupReleased(_) => ErrorKind::Released,
            EehIneligible(_) | EehNoContainer(_) => ErrorKind::Eligibility,
            IovaOutOfRange { .. } => ErrorKind::Bounds,
            TranslationGranularity { .. } | TranslationNotMemory { .. } => ErrorKind::Translation,
            UnalignedSection { .. } => ErrorKind::Alignment,
            DmaMap { .. }
            | DmaUnmap { .. }
            | EehOp { .. }
            | EnableIommu(_)
            | GetDevice { .. }
            | GetDeviceInfo { .. }
            | GetGroupStatus { .. }
            | GetIommuInfo(_)
            | GetRegionInfo { .. }
            | IrqSet { .. }
            | OpenContainer(_)
            | OpenGroup { .. }
            | RegionMmap { .. }
            | Reset { .. }
            | SetContainer { .. }
            | SetIommu(_) => ErrorKind::HostCall,
        }
    }

    /// The host error code equivalent of this error.
    pub fn errno(&self) -> i32 {
        use VfioError::*;
        match self {
            DmaMap { err, .. }
            | DmaUnmap { err, .. }
            | EehOp { err, .. }
            | GetDevice { err, .. }
            | GetDeviceInfo { err, .. }
            | GetGroupStatus { err, .. }
            | GetRegionInfo { err, .. }
            | IrqSet { err, .. }
            | OpenGroup { err, .. }
            | RegionMmap { err, .. }
            | Reset { err, .. }
            | SetContainer { err, .. } => err.errno(),
            EnableIommu(err) | GetIommuInfo(err) | OpenContainer(err) | SetIommu(err) => {
                err.errno()
            }
            EehIneligible(_) => libc::EPERM,
            ContainerClosed | DeviceReleased(_) | EehNoContainer(_) | GroupReleased(_) => {
                libc::ENODEV
            }
            IovaOutOfRange { .. } => libc::EFAULT,
            GroupNotViable(_) => libc::EPERM,
            AddressSpaceConflict { .. }
            | ApiVersion(_)
            | InvalidMmapWindow { .. }
            | InvalidOptions(_)
            | NoIommuModel
            | TranslationGranularity { .. }
            | TranslationNotMemory { .. }
            | UnalignedSection { .. } => libc::EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, VfioError>;
