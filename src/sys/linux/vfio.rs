// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host control surface backed by the kernel VFIO driver.

use std::ffi::CString;
use std::fs::File;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::path::PathBuf;

use vfio_sys::ioctl::ioctl;
use vfio_sys::ioctl::ioctl_with_mut_ref;
use vfio_sys::ioctl::ioctl_with_ptr;
use vfio_sys::ioctl::ioctl_with_ref;
use vfio_sys::ioctl::ioctl_with_val;
use vfio_sys::*;

use crate::config::VfioOptions;
use crate::errno::errno_result;
use crate::errno::SysError;
use crate::host::DeviceInfo;
use crate::host::HostContainer;
use crate::host::HostDevice;
use crate::host::HostGroup;
use crate::host::IommuType;
use crate::host::IrqSet;
use crate::host::RawDescriptor;
use crate::host::RegionInfo;
use crate::host::SpaprTceInfo;
use crate::host::Type1Info;
use crate::host::VfioHost;
use crate::mmap::MemoryMapping;
use crate::mmap::Protection;

fn open_rw(path: &Path) -> Result<File, SysError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(SysError::from)
}

fn check_ret(ret: i32) -> Result<(), SysError> {
    if ret < 0 {
        errno_result()
    } else {
        Ok(())
    }
}

/// Opens containers and groups from the VFIO device directory.
pub struct LinuxVfioHost {
    container_path: PathBuf,
    options: VfioOptions,
}

impl LinuxVfioHost {
    pub fn new(options: &VfioOptions) -> LinuxVfioHost {
        LinuxVfioHost {
            container_path: options.container_path(),
            options: options.clone(),
        }
    }
}

impl VfioHost for LinuxVfioHost {
    fn open_container(&self) -> Result<Box<dyn HostContainer>, SysError> {
        let file = open_rw(&self.container_path)?;
        Ok(Box::new(LinuxContainer { file }))
    }

    fn open_group(&self, group_id: u32) -> Result<Box<dyn HostGroup>, SysError> {
        let file = open_rw(&self.options.group_path(group_id))?;
        Ok(Box::new(LinuxGroup { file }))
    }
}

struct LinuxContainer {
    file: File,
}

impl HostContainer for LinuxContainer {
    fn api_version(&self) -> i32 {
        // SAFETY: the file is a VFIO container and the ioctl takes no argument.
        unsafe { ioctl(&self.file, VFIO_GET_API_VERSION()) }
    }

    fn check_extension(&self, extension: u32) -> bool {
        // SAFETY: the file is a VFIO container and the argument is passed by value.
        let ret = unsafe { ioctl_with_val(&self.file, VFIO_CHECK_EXTENSION(), extension.into()) };
        ret > 0
    }

    fn set_iommu(&self, iommu: IommuType) -> Result<(), SysError> {
        // SAFETY: the file is a VFIO container and the argument is passed by value.
        let ret = unsafe { ioctl_with_val(&self.file, VFIO_SET_IOMMU(), iommu.raw().into()) };
        check_ret(ret)
    }

    fn enable_iommu(&self) -> Result<(), SysError> {
        // SAFETY: the file is a VFIO container and the ioctl takes no argument.
        check_ret(unsafe { ioctl(&self.file, VFIO_IOMMU_ENABLE()) })
    }

    fn type1_info(&self) -> Result<Type1Info, SysError> {
        let mut info = vfio_iommu_type1_info {
            argsz: size_of::<vfio_iommu_type1_info>() as u32,
            ..Default::default()
        };
        // SAFETY: info is a valid, correctly sized struct owned by this frame.
        check_ret(unsafe { ioctl_with_mut_ref(&self.file, VFIO_IOMMU_GET_INFO(), &mut info) })?;
        Ok(Type1Info {
            flags: info.flags,
            iova_pgsizes: info.iova_pgsizes,
        })
    }

    fn spapr_tce_info(&self) -> Result<SpaprTceInfo, SysError> {
        let mut info = vfio_iommu_spapr_tce_info {
            argsz: size_of::<vfio_iommu_spapr_tce_info>() as u32,
            ..Default::default()
        };
        // SAFETY: info is a valid, correctly sized struct owned by this frame.
        check_ret(unsafe {
            ioctl_with_mut_ref(&self.file, VFIO_IOMMU_SPAPR_TCE_GET_INFO(), &mut info)
        })?;
        Ok(SpaprTceInfo {
            dma32_window_start: info.dma32_window_start,
            dma32_window_size: info.dma32_window_size,
        })
    }

    unsafe fn map_dma(
        &self,
        iova: u64,
        size: u64,
        host_addr: u64,
        readonly: bool,
    ) -> Result<(), SysError> {
        let mut flags = VFIO_DMA_MAP_FLAG_READ;
        if !readonly {
            flags |= VFIO_DMA_MAP_FLAG_WRITE;
        }
        let map = vfio_iommu_type1_dma_map {
            argsz: size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags,
            vaddr: host_addr,
            iova,
            size,
        };
        // SAFETY: map is a valid struct and the caller keeps the host range mapped.
        check_ret(unsafe { ioctl_with_ref(&self.file, VFIO_IOMMU_MAP_DMA(), &map) })
    }

    fn unmap_dma(&self, iova: u64, size: u64) -> Result<(), SysError> {
        let mut unmap = vfio_iommu_type1_dma_unmap {
            argsz: size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            flags: 0,
            iova,
            size,
        };
        // SAFETY: unmap is a valid struct owned by this frame.
        check_ret(unsafe { ioctl_with_mut_ref(&self.file, VFIO_IOMMU_UNMAP_DMA(), &mut unmap) })
    }

    fn eeh_pe_op(&self, op: u32) -> Result<i32, SysError> {
        let pe_op = vfio_eeh_pe_op {
            argsz: size_of::<vfio_eeh_pe_op>() as u32,
            flags: 0,
            op,
        };
        // SAFETY: pe_op is a valid struct owned by this frame.
        let ret = unsafe { ioctl_with_ref(&self.file, VFIO_EEH_PE_OP(), &pe_op) };
        check_ret(ret)?;
        Ok(ret)
    }

    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.file.as_raw_fd()
    }
}

struct LinuxGroup {
    file: File,
}

impl HostGroup for LinuxGroup {
    fn status(&self) -> Result<u32, SysError> {
        let mut status = vfio_group_status {
            argsz: size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        // SAFETY: status is a valid struct owned by this frame.
        check_ret(unsafe {
            ioctl_with_mut_ref(&self.file, VFIO_GROUP_GET_STATUS(), &mut status)
        })?;
        Ok(status.flags)
    }

    fn set_container(&self, container: &dyn HostContainer) -> Result<(), SysError> {
        let fd = container.as_raw_descriptor();
        // SAFETY: the kernel reads one descriptor from the argument.
        check_ret(unsafe { ioctl_with_ref(&self.file, VFIO_GROUP_SET_CONTAINER(), &fd) })
    }

    fn unset_container(&self) -> Result<(), SysError> {
        // SAFETY: the ioctl takes no argument.
        check_ret(unsafe { ioctl(&self.file, VFIO_GROUP_UNSET_CONTAINER()) })
    }

    fn get_device(&self, name: &str) -> Result<Box<dyn HostDevice>, SysError> {
        let name = CString::new(name).map_err(|_| SysError::new(libc::EINVAL))?;
        // SAFETY: name is a valid NUL terminated string that outlives the call.
        let ret = unsafe { ioctl_with_ptr(&self.file, VFIO_GROUP_GET_DEVICE_FD(), name.as_ptr()) };
        if ret < 0 {
            return errno_result();
        }
        // SAFETY: the kernel returned a new descriptor that nothing else owns.
        let file = unsafe { File::from_raw_fd(ret) };
        Ok(Box::new(LinuxDevice { file }))
    }

    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.file.as_raw_fd()
    }
}

struct LinuxDevice {
    file: File,
}

impl HostDevice for LinuxDevice {
    fn info(&self) -> Result<DeviceInfo, SysError> {
        let mut info = vfio_device_info {
            argsz: size_of::<vfio_device_info>() as u32,
            ..Default::default()
        };
        // SAFETY: info is a valid struct owned by this frame.
        check_ret(unsafe { ioctl_with_mut_ref(&self.file, VFIO_DEVICE_GET_INFO(), &mut info) })?;
        Ok(DeviceInfo {
            flags: info.flags,
            num_regions: info.num_regions,
            num_irqs: info.num_irqs,
        })
    }

    fn region_info(&self, index: u32) -> Result<RegionInfo, SysError> {
        let mut info = vfio_region_info {
            argsz: size_of::<vfio_region_info>() as u32,
            index,
            ..Default::default()
        };
        // SAFETY: info is a valid struct owned by this frame.
        check_ret(unsafe {
            ioctl_with_mut_ref(&self.file, VFIO_DEVICE_GET_REGION_INFO(), &mut info)
        })?;
        Ok(RegionInfo {
            index,
            flags: info.flags,
            size: info.size,
            offset: info.offset,
        })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, SysError> {
        self.file.read_at(buf, offset).map_err(SysError::from)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, SysError> {
        self.file.write_at(buf, offset).map_err(SysError::from)
    }

    fn mmap(&self, offset: u64, size: usize, prot: Protection) -> Result<MemoryMapping, SysError> {
        MemoryMapping::from_descriptor_offset(&self.file, size, offset, prot)
    }

    fn reset(&self) -> Result<(), SysError> {
        // SAFETY: the ioctl takes no argument.
        check_ret(unsafe { ioctl(&self.file, VFIO_DEVICE_RESET()) })
    }

    fn set_irqs(&self, irqs: &IrqSet) -> Result<(), SysError> {
        let irq_set = vfio_irq_set {
            argsz: size_of::<vfio_irq_set>() as u32,
            flags: irqs.flags(),
            index: irqs.index,
            start: irqs.start,
            count: irqs.count,
        };
        // SAFETY: irq_set carries no trailing data, as its flags say.
        check_ret(unsafe { ioctl_with_ref(&self.file, VFIO_DEVICE_SET_IRQS(), &irq_set) })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn positioned_io() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        let device = LinuxDevice { file };

        assert_eq!(device.write_at(&[0x34, 0x12], 0x10).unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(device.read_at(&mut buf, 0x10).unwrap(), 2);
        assert_eq!(u16::from_le_bytes(buf), 0x1234);
    }

    #[test]
    fn file_mmap_window() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0xa5u8; crate::mmap::pagesize()]).unwrap();
        let device = LinuxDevice { file };
        let mapping = device
            .mmap(0, crate::mmap::pagesize(), Protection::read())
            .unwrap();
        // SAFETY: the mapping covers at least one readable byte.
        assert_eq!(unsafe { mapping.as_ptr().read() }, 0xa5);
    }

    #[test]
    fn missing_container_node() {
        let dir = tempfile::tempdir().unwrap();
        let options = VfioOptions {
            dev_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let host = LinuxVfioHost::new(&options);
        let err = host.open_container().err().unwrap();
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(host.open_group(7).err().unwrap().errno(), libc::ENOENT);
    }
}
