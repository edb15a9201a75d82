// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device regions: a slow path accessor going through the device descriptor, optionally
//! overlaid by direct mapped windows.

use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use log::error;
use vfio_sys::*;

use crate::device::VfioDevice;
use crate::errno::SysError;
use crate::error::Result;
use crate::error::VfioError;
use crate::host::HostDevice;
use crate::mmap::pagesize;
use crate::mmap::MemoryMapping;
use crate::mmap::Protection;

/// Width of a slow path access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Word,
    Dword,
}

impl AccessSize {
    pub fn bytes(self) -> usize {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Word => 2,
            AccessSize::Dword => 4,
        }
    }
}

/// A direct mapped window of a region.
#[derive(Debug)]
pub struct MmapWindow {
    offset: u64,
    size: u64,
    mapping: Option<MemoryMapping>,
    attached: bool,
    enabled: bool,
}

impl MmapWindow {
    fn new(offset: u64, size: u64) -> MmapWindow {
        MmapWindow {
            offset,
            size,
            mapping: None,
            attached: false,
            enabled: false,
        }
    }

    fn unmap(&mut self) {
        self.attached = false;
        self.enabled = false;
        self.mapping = None;
    }

    /// Offset of the window within its region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Whether the window currently overlays the slow path.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn host_addr(&self) -> Option<u64> {
        self.mapping.as_ref().map(|m| m.as_ptr() as u64)
    }
}

pub struct VfioRegion {
    device: Weak<VfioDevice>,
    name: String,
    index: u32,
    flags: u32,
    size: u64,
    fd_offset: u64,
    present: bool,
    windows: Vec<MmapWindow>,
}

impl VfioRegion {
    /// Queries region `index` of `device`.
    ///
    /// A non-empty region that the host allows to be mapped, and whose size is a whole number of
    /// host pages, gets a single window covering all of it.
    pub fn setup(device: &Arc<VfioDevice>, index: u32) -> Result<VfioRegion> {
        let info = device.region_info(index)?;
        let mut region = VfioRegion {
            device: Arc::downgrade(device),
            name: device.name().to_owned(),
            index,
            flags: info.flags,
            size: info.size,
            fd_offset: info.offset,
            present: info.size != 0,
            windows: Vec::new(),
        };
        let page_mask = pagesize() as u64 - 1;
        if region.present
            && !device.no_mmap()
            && info.flags & VFIO_REGION_INFO_FLAG_MMAP != 0
            && info.size & page_mask == 0
        {
            region.windows.push(MmapWindow::new(0, info.size));
        }
        debug!(
            "vfio: region setup {} index {} flags {:#x} size {:#x} offset {:#x} windows {}",
            region.name,
            index,
            region.flags,
            region.size,
            region.fd_offset,
            region.windows.len()
        );
        Ok(region)
    }

    /// Adds another direct mapped window. It must be page aligned and lie within the region.
    pub fn add_mmap_window(&mut self, offset: u64, size: u64) -> Result<()> {
        let page_mask = pagesize() as u64 - 1;
        let fits = offset
            .checked_add(size)
            .map_or(false, |end| end <= self.size);
        if !self.present || size == 0 || !fits || (offset | size) & page_mask != 0 {
            return Err(VfioError::InvalidMmapWindow {
                index: self.index,
                offset,
                size,
            });
        }
        self.windows.push(MmapWindow::new(offset, size));
        Ok(())
    }

    fn device(&self) -> Result<Arc<VfioDevice>> {
        self.device
            .upgrade()
            .ok_or_else(|| VfioError::DeviceReleased(self.name.clone()))
    }

    /// Maps every window. If one fails, the windows mapped before it are unmapped and detached
    /// again and the region is left without direct mappings.
    pub fn mmap(&mut self) -> Result<()> {
        if !self.present {
            return Ok(());
        }
        let host = self.device()?.host()?;
        let prot = Protection {
            read: self.flags & VFIO_REGION_INFO_FLAG_READ != 0,
            write: self.flags & VFIO_REGION_INFO_FLAG_WRITE != 0,
        };

        for i in 0..self.windows.len() {
            let offset = self.windows[i].offset;
            let ret = usize::try_from(self.windows[i].size)
                .map_err(|_| SysError::new(libc::EOVERFLOW))
                .and_then(|size| {
                    let fd_offset = self
                        .fd_offset
                        .checked_add(offset)
                        .ok_or(SysError::new(libc::EOVERFLOW))?;
                    host.mmap(fd_offset, size, prot)
                });
            match ret {
                Ok(mapping) => {
                    let window = &mut self.windows[i];
                    debug!(
                        "vfio: region {} index {} window {:#x}+{:#x} mapped at {:p}",
                        self.name,
                        self.index,
                        offset,
                        window.size,
                        mapping.as_ptr()
                    );
                    window.mapping = Some(mapping);
                    window.attached = true;
                    window.enabled = true;
                }
                Err(err) => {
                    debug!(
                        "vfio: region {} index {} mmap fault at {:#x}: {}",
                        self.name, self.index, offset, err
                    );
                    for window in self.windows[..i].iter_mut().rev() {
                        window.unmap();
                    }
                    return Err(VfioError::RegionMmap {
                        name: self.name.clone(),
                        index: self.index,
                        offset,
                        err,
                    });
                }
            }
        }
        Ok(())
    }

    /// Detaches the mapped windows while keeping them mapped.
    pub fn exit(&mut self) {
        for window in self.windows.iter_mut().filter(|w| w.is_mapped()) {
            window.attached = false;
        }
    }

    /// Unmaps and drops every window. The region only has its slow path afterwards.
    pub fn finalize(&mut self) {
        if !self.present {
            return;
        }
        for window in &mut self.windows {
            window.unmap();
        }
        self.windows.clear();
        self.present = false;
    }

    /// Toggles direct access through the mapped windows without unmapping them.
    pub fn set_mmaps_enabled(&mut self, enabled: bool) {
        for window in self.windows.iter_mut().filter(|w| w.is_mapped()) {
            window.enabled = enabled;
        }
    }

    /// Number of windows currently mapped.
    pub fn active_windows(&self) -> usize {
        self.windows.iter().filter(|w| w.is_mapped()).count()
    }

    pub fn windows(&self) -> &[MmapWindow] {
        &self.windows
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of the region within the device descriptor.
    pub fn fd_offset(&self) -> u64 {
        self.fd_offset
    }

    fn access(
        &self,
        device: &VfioDevice,
        addr: u64,
        f: impl FnOnce(&dyn HostDevice, u64) -> std::result::Result<usize, SysError>,
        len: usize,
    ) -> std::result::Result<(), SysError> {
        let host = device
            .host()
            .map_err(|_| SysError::new(libc::ENODEV))?;
        let offset = self
            .fd_offset
            .checked_add(addr)
            .ok_or(SysError::new(libc::EINVAL))?;
        if f(host.as_ref(), offset)? != len {
            return Err(SysError::new(libc::EIO));
        }
        Ok(())
    }

    /// Reads `size` bytes at `addr` through the device descriptor. Returns all ones on failure.
    pub fn read(&self, addr: u64, size: AccessSize) -> u64 {
        let device = match self.device() {
            Ok(d) => d,
            Err(e) => {
                error!("vfio: region read: {}", e);
                return u64::MAX;
            }
        };
        let len = size.bytes();
        let mut buf = [0u8; 4];
        let ret = self.access(&device, addr, |host, off| host.read_at(&mut buf[..len], off), len);
        let data = match ret {
            Ok(()) => match size {
                AccessSize::Byte => u64::from(buf[0]),
                AccessSize::Word => u64::from(u16::from_le_bytes([buf[0], buf[1]])),
                AccessSize::Dword => u64::from(u32::from_le_bytes(buf)),
            },
            Err(e) => {
                error!(
                    "vfio: read of {}:region{}+{:#x}, {} failed: {}",
                    self.name, self.index, addr, len, e
                );
                u64::MAX
            }
        };
        debug!(
            "vfio: region read {}:region{}+{:#x}, {} = {:#x}",
            self.name, self.index, addr, len, data
        );
        device.eoi();
        data
    }

    /// Writes the low `size` bytes of `data` at `addr` through the device descriptor.
    pub fn write(&self, addr: u64, data: u64, size: AccessSize) {
        let device = match self.device() {
            Ok(d) => d,
            Err(e) => {
                error!("vfio: region write: {}", e);
                return;
            }
        };
        let len = size.bytes();
        let buf = (data as u32).to_le_bytes();
        let ret = self.access(&device, addr, |host, off| host.write_at(&buf[..len], off), len);
        if let Err(e) = ret {
            error!(
                "vfio: write of {}:region{}+{:#x}, {:#x}, {} failed: {}",
                self.name, self.index, addr, data, len, e
            );
        }
        debug!(
            "vfio: region write {}:region{}+{:#x}, {:#x}, {}",
            self.name, self.index, addr, data, len
        );
        device.eoi();
    }
}
