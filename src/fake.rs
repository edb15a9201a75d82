// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory stand-ins for the host VFIO driver and the guest memory model.
//!
//! [`FakeHost`] keeps containers, groups and devices in a table and records every host call it
//! receives, so callers can assert on exactly what reached the "kernel". Failures can be
//! injected per call.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;

use sync::Mutex;
use vfio_sys::*;

use crate::errno::SysError;
use crate::guest_iommu::GuestIommu;
use crate::guest_iommu::IommuNotifier;
use crate::guest_iommu::IommuPerm;
use crate::guest_iommu::IommuTlbEntry;
use crate::guest_iommu::NotifierId;
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
use crate::kvm::AccelChannel;
use crate::kvm::AccelProvider;
use crate::memory::AddressSpaceId;
use crate::memory::GuestAddressSpace;
use crate::memory::GuestMemoryRegion;
use crate::memory::ListenerId;
use crate::memory::MemoryListener;
use crate::memory::MemorySection;
use crate::memory::Translation;
use crate::mmap::MemoryMapping;
use crate::mmap::Protection;
use crate::reset::ResetHandler;
use crate::reset::ResetHandlerId;
use crate::reset::ResetRegistrar;

/// Region offsets within a fake device descriptor, as vfio-pci lays them out.
const REGION_OFFSET_SHIFT: u32 = 40;

/// A call received by [`FakeHost`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostCall {
    OpenContainer {
        container: RawDescriptor,
    },
    CloseContainer {
        container: RawDescriptor,
    },
    OpenGroup {
        group_id: u32,
    },
    CloseGroup {
        group_id: u32,
    },
    SetContainer {
        group_id: u32,
        container: RawDescriptor,
    },
    UnsetContainer {
        group_id: u32,
    },
    SetIommu {
        container: RawDescriptor,
        iommu: IommuType,
    },
    EnableIommu {
        container: RawDescriptor,
    },
    MapDma {
        container: RawDescriptor,
        iova: u64,
        size: u64,
        host_addr: u64,
        readonly: bool,
    },
    UnmapDma {
        container: RawDescriptor,
        iova: u64,
        size: u64,
    },
    EehPeOp {
        container: RawDescriptor,
        op: u32,
    },
    GetDevice {
        group_id: u32,
        name: String,
    },
    CloseDevice {
        name: String,
    },
    ResetDevice {
        name: String,
    },
    SetIrqs {
        name: String,
        irqs: IrqSet,
    },
    Mmap {
        name: String,
        offset: u64,
        size: usize,
    },
    DeviceRead {
        name: String,
        offset: u64,
        len: usize,
    },
    DeviceWrite {
        name: String,
        offset: u64,
        data: Vec<u8>,
    },
}

/// A DMA mapping installed in a fake container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FakeMapping {
    pub iova: u64,
    pub size: u64,
    pub host_addr: u64,
    pub readonly: bool,
}

/// Description of a device that a fake group hands out.
#[derive(Clone)]
pub struct FakeDevice {
    flags: u32,
    num_irqs: u32,
    regions: Vec<RegionInfo>,
    memory: Arc<Mutex<BTreeMap<u64, u8>>>,
}

impl FakeDevice {
    pub fn new(flags: u32, num_irqs: u32) -> FakeDevice {
        FakeDevice {
            flags,
            num_irqs,
            regions: Vec::new(),
            memory: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Adds the next region, placed at `index << 40` within the descriptor.
    pub fn with_region(mut self, flags: u32, size: u64) -> FakeDevice {
        let index = self.regions.len() as u32;
        self.regions.push(RegionInfo {
            index,
            flags,
            size,
            offset: u64::from(index) << REGION_OFFSET_SHIFT,
        });
        self
    }

    /// Adds the next region at an explicit descriptor offset.
    pub fn with_region_at(mut self, flags: u32, size: u64, offset: u64) -> FakeDevice {
        let index = self.regions.len() as u32;
        self.regions.push(RegionInfo {
            index,
            flags,
            size,
            offset,
        });
        self
    }

    /// Descriptor offset of region `index`.
    pub fn region_offset(index: u32) -> u64 {
        u64::from(index) << REGION_OFFSET_SHIFT
    }

    /// Reads descriptor bytes; unwritten bytes read as zero.
    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let memory = self.memory.lock();
        (0..len as u64)
            .map(|i| memory.get(&(offset + i)).copied().unwrap_or(0))
            .collect()
    }

    pub fn poke(&self, offset: u64, data: &[u8]) {
        let mut memory = self.memory.lock();
        for (i, b) in data.iter().enumerate() {
            memory.insert(offset + i as u64, *b);
        }
    }
}

struct GroupState {
    viable: bool,
    isolated: bool,
    devices: BTreeMap<String, FakeDevice>,
    container: Option<RawDescriptor>,
}

#[derive(Default)]
struct ContainerState {
    groups: BTreeSet<u32>,
    iommu: Option<IommuType>,
    mappings: BTreeMap<u64, FakeMapping>,
}

struct HostState {
    next_fd: RawDescriptor,
    calls: Vec<HostCall>,
    api_version: i32,
    extensions: Vec<u32>,
    type1_info: Option<Type1Info>,
    spapr_tce_info: SpaprTceInfo,
    groups: BTreeMap<u32, GroupState>,
    containers: BTreeMap<RawDescriptor, ContainerState>,
    map_errors: VecDeque<i32>,
    mmap_failures: BTreeSet<u64>,
    eeh_result: Result<i32, i32>,
}

impl HostState {
    fn alloc_fd(&mut self) -> RawDescriptor {
        self.next_fd += 1;
        self.next_fd
    }
}

/// An in-memory VFIO driver.
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    /// A host offering both type1 models, with 4K and 2M IOVA pages.
    pub fn new() -> Arc<FakeHost> {
        Arc::new(FakeHost {
            state: Arc::new(Mutex::new(HostState {
                next_fd: 100,
                calls: Vec::new(),
                api_version: VFIO_API_VERSION as i32,
                extensions: vec![VFIO_TYPE1_IOMMU, VFIO_TYPE1v2_IOMMU],
                type1_info: Some(Type1Info {
                    flags: VFIO_IOMMU_INFO_PGSIZES,
                    iova_pgsizes: 0x1000 | 0x20_0000,
                }),
                spapr_tce_info: SpaprTceInfo {
                    dma32_window_start: 0,
                    dma32_window_size: 0x4000_0000,
                },
                groups: BTreeMap::new(),
                containers: BTreeMap::new(),
                map_errors: VecDeque::new(),
                mmap_failures: BTreeSet::new(),
                eeh_result: Ok(0),
            })),
        })
    }

    /// Makes group `group_id` available, viable and without devices.
    pub fn add_group(&self, group_id: u32) {
        self.state.lock().groups.insert(
            group_id,
            GroupState {
                viable: true,
                isolated: false,
                devices: BTreeMap::new(),
                container: None,
            },
        );
    }

    pub fn set_viable(&self, group_id: u32, viable: bool) {
        if let Some(g) = self.state.lock().groups.get_mut(&group_id) {
            g.viable = viable;
        }
    }

    /// The group can only share a container with no other group.
    pub fn isolate_group(&self, group_id: u32) {
        if let Some(g) = self.state.lock().groups.get_mut(&group_id) {
            g.isolated = true;
        }
    }

    pub fn add_device(&self, group_id: u32, name: &str, device: FakeDevice) {
        if let Some(g) = self.state.lock().groups.get_mut(&group_id) {
            g.devices.insert(name.to_owned(), device);
        }
    }

    pub fn set_api_version(&self, version: i32) {
        self.state.lock().api_version = version;
    }

    pub fn set_extensions(&self, extensions: &[u32]) {
        self.state.lock().extensions = extensions.to_vec();
    }

    /// `None` makes the type1 info query fail.
    pub fn set_type1_info(&self, info: Option<Type1Info>) {
        self.state.lock().type1_info = info;
    }

    pub fn set_spapr_tce_info(&self, info: SpaprTceInfo) {
        self.state.lock().spapr_tce_info = info;
    }

    /// Fails the next DMA map request with `errno`. Queued failures apply in order.
    pub fn fail_next_map(&self, errno: i32) {
        self.state.lock().map_errors.push_back(errno);
    }

    /// Fails mmap of any device at descriptor offset `offset`.
    pub fn fail_mmap_at(&self, offset: u64) {
        self.state.lock().mmap_failures.insert(offset);
    }

    /// Result of EEH operations: `Ok(value)` or `Err(errno)`.
    pub fn set_eeh_result(&self, result: Result<i32, i32>) {
        self.state.lock().eeh_result = result;
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&HostCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn open_container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// DMA mappings of every open container, ordered by container and IOVA.
    pub fn mappings(&self) -> Vec<FakeMapping> {
        self.state
            .lock()
            .containers
            .values()
            .flat_map(|c| c.mappings.values().copied())
            .collect()
    }

    pub fn group_container(&self, group_id: u32) -> Option<RawDescriptor> {
        self.state
            .lock()
            .groups
            .get(&group_id)
            .and_then(|g| g.container)
    }
}

impl VfioHost for FakeHost {
    fn open_container(&self) -> Result<Box<dyn HostContainer>, SysError> {
        let mut state = self.state.lock();
        let fd = state.alloc_fd();
        state.containers.insert(fd, ContainerState::default());
        state.calls.push(HostCall::OpenContainer { container: fd });
        Ok(Box::new(FakeContainerHandle {
            state: self.state.clone(),
            fd,
        }))
    }

    fn open_group(&self, group_id: u32) -> Result<Box<dyn HostGroup>, SysError> {
        let mut state = self.state.lock();
        if !state.groups.contains_key(&group_id) {
            return Err(SysError::new(libc::ENOENT));
        }
        let fd = state.alloc_fd();
        state.calls.push(HostCall::OpenGroup { group_id });
        Ok(Box::new(FakeGroupHandle {
            state: self.state.clone(),
            group_id,
            fd,
        }))
    }
}

struct FakeContainerHandle {
    state: Arc<Mutex<HostState>>,
    fd: RawDescriptor,
}

impl FakeContainerHandle {
    fn with<R>(&self, f: impl FnOnce(&mut ContainerState) -> R) -> Result<R, SysError> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(&self.fd)
            .ok_or(SysError::new(libc::EBADF))?;
        Ok(f(container))
    }
}

impl HostContainer for FakeContainerHandle {
    fn api_version(&self) -> i32 {
        self.state.lock().api_version
    }

    fn check_extension(&self, extension: u32) -> bool {
        self.state.lock().extensions.contains(&extension)
    }

    fn set_iommu(&self, iommu: IommuType) -> Result<(), SysError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::SetIommu {
            container: self.fd,
            iommu,
        });
        if !state.extensions.contains(&iommu.raw()) {
            return Err(SysError::new(libc::EINVAL));
        }
        match state.containers.get_mut(&self.fd) {
            Some(c) if !c.groups.is_empty() => {
                c.iommu = Some(iommu);
                Ok(())
            }
            // The kernel needs a group before an IOMMU model can be picked.
            _ => Err(SysError::new(libc::EINVAL)),
        }
    }

    fn enable_iommu(&self) -> Result<(), SysError> {
        self.state
            .lock()
            .calls
            .push(HostCall::EnableIommu { container: self.fd });
        Ok(())
    }

    fn type1_info(&self) -> Result<Type1Info, SysError> {
        self.state
            .lock()
            .type1_info
            .ok_or(SysError::new(libc::EINVAL))
    }

    fn spapr_tce_info(&self) -> Result<SpaprTceInfo, SysError> {
        Ok(self.state.lock().spapr_tce_info)
    }

    unsafe fn map_dma(
        &self,
        iova: u64,
        size: u64,
        host_addr: u64,
        readonly: bool,
    ) -> Result<(), SysError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::MapDma {
            container: self.fd,
            iova,
            size,
            host_addr,
            readonly,
        });
        if let Some(errno) = state.map_errors.pop_front() {
            return Err(SysError::new(errno));
        }
        let container = state
            .containers
            .get_mut(&self.fd)
            .ok_or(SysError::new(libc::EBADF))?;
        let end = u128::from(iova) + u128::from(size);
        let overlaps = container.mappings.values().any(|m| {
            u128::from(m.iova) < end && u128::from(iova) < u128::from(m.iova) + u128::from(m.size)
        });
        if overlaps {
            return Err(SysError::new(libc::EEXIST));
        }
        container.mappings.insert(
            iova,
            FakeMapping {
                iova,
                size,
                host_addr,
                readonly,
            },
        );
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, size: u64) -> Result<(), SysError> {
        self.state.lock().calls.push(HostCall::UnmapDma {
            container: self.fd,
            iova,
            size,
        });
        let end = u128::from(iova) + u128::from(size);
        self.with(|c| {
            c.mappings
                .retain(|&start, _| u128::from(start) < u128::from(iova) || u128::from(start) >= end)
        })
    }

    fn eeh_pe_op(&self, op: u32) -> Result<i32, SysError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::EehPeOp {
            container: self.fd,
            op,
        });
        state.eeh_result.map_err(SysError::new)
    }

    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.fd
    }
}

impl Drop for FakeContainerHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.containers.remove(&self.fd);
        for group in state.groups.values_mut() {
            if group.container == Some(self.fd) {
                group.container = None;
            }
        }
        state.calls.push(HostCall::CloseContainer { container: self.fd });
    }
}

struct FakeGroupHandle {
    state: Arc<Mutex<HostState>>,
    group_id: u32,
    fd: RawDescriptor,
}

impl HostGroup for FakeGroupHandle {
    fn status(&self) -> Result<u32, SysError> {
        let state = self.state.lock();
        let group = state
            .groups
            .get(&self.group_id)
            .ok_or(SysError::new(libc::ENODEV))?;
        let mut flags = 0;
        if group.viable {
            flags |= VFIO_GROUP_FLAGS_VIABLE;
        }
        if group.container.is_some() {
            flags |= VFIO_GROUP_FLAGS_CONTAINER_SET;
        }
        Ok(flags)
    }

    fn set_container(&self, container: &dyn HostContainer) -> Result<(), SysError> {
        let fd = container.as_raw_descriptor();
        let mut state = self.state.lock();
        state.calls.push(HostCall::SetContainer {
            group_id: self.group_id,
            container: fd,
        });
        fn isolated(state: &HostState, id: u32) -> bool {
            state.groups.get(&id).map_or(false, |g| g.isolated)
        }
        let members = state
            .containers
            .get(&fd)
            .ok_or(SysError::new(libc::EBADF))?
            .groups
            .clone();
        let shared_with_isolated =
            isolated(&state, self.group_id) || members.iter().any(|id| isolated(&state, *id));
        if !members.is_empty() && shared_with_isolated {
            return Err(SysError::new(libc::EPERM));
        }
        let group = state
            .groups
            .get_mut(&self.group_id)
            .ok_or(SysError::new(libc::ENODEV))?;
        if group.container.is_some() {
            return Err(SysError::new(libc::EBUSY));
        }
        group.container = Some(fd);
        if let Some(c) = state.containers.get_mut(&fd) {
            c.groups.insert(self.group_id);
        }
        Ok(())
    }

    fn unset_container(&self) -> Result<(), SysError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::UnsetContainer {
            group_id: self.group_id,
        });
        let fd = state
            .groups
            .get_mut(&self.group_id)
            .and_then(|g| g.container.take())
            .ok_or(SysError::new(libc::EINVAL))?;
        if let Some(c) = state.containers.get_mut(&fd) {
            c.groups.remove(&self.group_id);
        }
        Ok(())
    }

    fn get_device(&self, name: &str) -> Result<Box<dyn HostDevice>, SysError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::GetDevice {
            group_id: self.group_id,
            name: name.to_owned(),
        });
        let group = state
            .groups
            .get(&self.group_id)
            .ok_or(SysError::new(libc::ENODEV))?;
        if group.container.is_none() {
            return Err(SysError::new(libc::EINVAL));
        }
        let device = group
            .devices
            .get(name)
            .cloned()
            .ok_or(SysError::new(libc::ENODEV))?;
        Ok(Box::new(FakeDeviceHandle {
            state: self.state.clone(),
            name: name.to_owned(),
            device,
        }))
    }

    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.fd
    }
}

impl Drop for FakeGroupHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        // Closing a group detaches it from its container.
        let fd = state
            .groups
            .get_mut(&self.group_id)
            .and_then(|g| g.container.take());
        if let Some(fd) = fd {
            if let Some(c) = state.containers.get_mut(&fd) {
                c.groups.remove(&self.group_id);
            }
        }
        state.calls.push(HostCall::CloseGroup {
            group_id: self.group_id,
        });
    }
}

struct FakeDeviceHandle {
    state: Arc<Mutex<HostState>>,
    name: String,
    device: FakeDevice,
}

impl FakeDeviceHandle {
    fn record(&self, call: HostCall) {
        self.state.lock().calls.push(call);
    }
}

impl HostDevice for FakeDeviceHandle {
    fn info(&self) -> Result<DeviceInfo, SysError> {
        Ok(DeviceInfo {
            flags: self.device.flags,
            num_regions: self.device.regions.len() as u32,
            num_irqs: self.device.num_irqs,
        })
    }

    fn region_info(&self, index: u32) -> Result<RegionInfo, SysError> {
        self.device
            .regions
            .get(index as usize)
            .copied()
            .ok_or(SysError::new(libc::EINVAL))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, SysError> {
        self.record(HostCall::DeviceRead {
            name: self.name.clone(),
            offset,
            len: buf.len(),
        });
        buf.copy_from_slice(&self.device.peek(offset, buf.len()));
        Ok(buf.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, SysError> {
        self.record(HostCall::DeviceWrite {
            name: self.name.clone(),
            offset,
            data: buf.to_vec(),
        });
        self.device.poke(offset, buf);
        Ok(buf.len())
    }

    fn mmap(&self, offset: u64, size: usize, prot: Protection) -> Result<MemoryMapping, SysError> {
        self.record(HostCall::Mmap {
            name: self.name.clone(),
            offset,
            size,
        });
        if self.state.lock().mmap_failures.contains(&offset) {
            return Err(SysError::new(libc::ENOMEM));
        }
        MemoryMapping::new_anonymous(size, prot)
    }

    fn reset(&self) -> Result<(), SysError> {
        self.record(HostCall::ResetDevice {
            name: self.name.clone(),
        });
        if self.device.flags & VFIO_DEVICE_FLAGS_RESET == 0 {
            return Err(SysError::new(libc::EINVAL));
        }
        Ok(())
    }

    fn set_irqs(&self, irqs: &IrqSet) -> Result<(), SysError> {
        self.record(HostCall::SetIrqs {
            name: self.name.clone(),
            irqs: *irqs,
        });
        if irqs.index >= self.device.num_irqs {
            return Err(SysError::new(libc::EINVAL));
        }
        Ok(())
    }
}

impl Drop for FakeDeviceHandle {
    fn drop(&mut self) {
        self.record(HostCall::CloseDevice {
            name: self.name.clone(),
        });
    }
}

#[derive(Default)]
struct SpaceState {
    sections: Vec<MemorySection>,
    listeners: Vec<(ListenerId, Arc<dyn MemoryListener>)>,
    next_listener: u64,
}

/// A flat guest address space made of explicitly added sections.
pub struct FakeAddressSpace {
    id: AddressSpaceId,
    state: Mutex<SpaceState>,
}

impl FakeAddressSpace {
    pub fn new(id: u64) -> Arc<FakeAddressSpace> {
        Arc::new(FakeAddressSpace {
            id: AddressSpaceId(id),
            state: Mutex::new(SpaceState::default()),
        })
    }

    fn listeners(&self) -> Vec<Arc<dyn MemoryListener>> {
        self.state
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Adds a section and reports it to every listener.
    pub fn add_section(&self, section: MemorySection) {
        self.state.lock().sections.push(section.clone());
        for listener in self.listeners() {
            listener.region_add(&section);
        }
    }

    /// Places all of `region` at `addr`.
    pub fn add_region(&self, region: Arc<GuestMemoryRegion>, addr: u64) -> MemorySection {
        let section = MemorySection::new(region, addr);
        self.add_section(section.clone());
        section
    }

    /// Removes a section and reports it to every listener. Returns false if it was not present.
    pub fn remove_section(&self, section: &MemorySection) -> bool {
        {
            let mut state = self.state.lock();
            match state.sections.iter().position(|s| s == section) {
                Some(pos) => {
                    state.sections.remove(pos);
                }
                None => return false,
            }
        }
        for listener in self.listeners() {
            listener.region_del(section);
        }
        true
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

impl GuestAddressSpace for FakeAddressSpace {
    fn id(&self) -> AddressSpaceId {
        self.id
    }

    fn register_listener(&self, listener: Arc<dyn MemoryListener>) -> ListenerId {
        let (id, sections) = {
            let mut state = self.state.lock();
            state.next_listener += 1;
            let id = ListenerId(state.next_listener);
            state.listeners.push((id, listener.clone()));
            (id, state.sections.clone())
        };
        for section in &sections {
            listener.region_add(section);
        }
        id
    }

    fn unregister_listener(&self, id: ListenerId) {
        self.state.lock().listeners.retain(|(l, _)| *l != id);
    }

    fn translate(&self, addr: u64, len: u64, _is_write: bool) -> Option<Translation> {
        let state = self.state.lock();
        state.sections.iter().find_map(|s| {
            let start = u128::from(s.offset_within_address_space);
            let addr128 = u128::from(addr);
            if addr128 < start || addr128 >= start + s.size {
                return None;
            }
            let remaining = start + s.size - addr128;
            Some(Translation {
                region: s.region.clone(),
                offset_within_region: s.offset_within_region + (addr - s.offset_within_address_space),
                len: u128::from(len).min(remaining) as u64,
            })
        })
    }
}

#[derive(Default)]
struct IommuState {
    entries: BTreeMap<u64, IommuTlbEntry>,
    notifiers: Vec<(NotifierId, Arc<dyn IommuNotifier>)>,
    next_notifier: u64,
}

/// A guest IOMMU whose translation table is edited directly.
pub struct FakeGuestIommu {
    size: u128,
    state: Mutex<IommuState>,
}

impl FakeGuestIommu {
    /// An IOMMU translating `size` bytes of IOVA space.
    pub fn new(size: u128) -> Arc<FakeGuestIommu> {
        Arc::new(FakeGuestIommu {
            size,
            state: Mutex::new(IommuState::default()),
        })
    }

    /// Sends `entry` to every registered notifier.
    pub fn notify(&self, entry: IommuTlbEntry) {
        let notifiers: Vec<_> = self
            .state
            .lock()
            .notifiers
            .iter()
            .map(|(_, n)| n.clone())
            .collect();
        for notifier in notifiers {
            notifier.notify(&entry);
        }
    }

    /// Installs a translation and announces it.
    pub fn map(&self, iova: u64, translated_addr: u64, addr_mask: u64, perm: IommuPerm) {
        let entry = IommuTlbEntry {
            iova,
            translated_addr,
            addr_mask,
            perm,
        };
        self.state.lock().entries.insert(iova, entry);
        self.notify(entry);
    }

    /// Removes the translation at `iova` and announces it with empty permissions.
    pub fn unmap(&self, iova: u64) {
        let removed = self.state.lock().entries.remove(&iova);
        if let Some(entry) = removed {
            self.notify(IommuTlbEntry {
                perm: IommuPerm::empty(),
                ..entry
            });
        }
    }

    pub fn notifier_count(&self) -> usize {
        self.state.lock().notifiers.len()
    }
}

impl GuestIommu for FakeGuestIommu {
    fn register_notifier(&self, notifier: Arc<dyn IommuNotifier>) -> NotifierId {
        let mut state = self.state.lock();
        state.next_notifier += 1;
        let id = NotifierId(state.next_notifier);
        state.notifiers.push((id, notifier));
        id
    }

    fn unregister_notifier(&self, id: NotifierId) {
        self.state.lock().notifiers.retain(|(n, _)| *n != id);
    }

    fn translate(&self, iova: u64, _is_write: bool) -> IommuTlbEntry {
        let state = self.state.lock();
        match state.entries.range(..=iova).next_back() {
            Some((_, entry)) if iova - entry.iova <= entry.addr_mask => *entry,
            _ => IommuTlbEntry {
                iova: iova & !0xfff,
                translated_addr: 0,
                addr_mask: 0xfff,
                perm: IommuPerm::empty(),
            },
        }
    }

    fn size(&self) -> u128 {
        self.size
    }

    fn replay(&self, notifier: &dyn IommuNotifier, _granularity: u64, _is_write: bool) {
        let entries: Vec<_> = self.state.lock().entries.values().copied().collect();
        for entry in entries.iter().filter(|e| !e.perm.is_empty()) {
            notifier.notify(entry);
        }
    }
}

#[derive(Default)]
struct RegistrarState {
    handlers: BTreeMap<ResetHandlerId, Arc<dyn ResetHandler>>,
    next: u64,
}

/// Collects reset handlers and runs them on demand.
#[derive(Default)]
pub struct FakeResetRegistrar {
    state: Mutex<RegistrarState>,
}

impl FakeResetRegistrar {
    pub fn new() -> Arc<FakeResetRegistrar> {
        Arc::new(FakeResetRegistrar::default())
    }

    pub fn handler_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Runs every registered handler, as a system reset would.
    pub fn trigger(&self) {
        let handlers: Vec<_> = self.state.lock().handlers.values().cloned().collect();
        for handler in handlers {
            handler.reset();
        }
    }
}

impl ResetRegistrar for FakeResetRegistrar {
    fn register(&self, handler: Arc<dyn ResetHandler>) -> ResetHandlerId {
        let mut state = self.state.lock();
        state.next += 1;
        let id = ResetHandlerId(state.next);
        state.handlers.insert(id, handler);
        id
    }

    fn unregister(&self, id: ResetHandlerId) {
        self.state.lock().handlers.remove(&id);
    }
}

/// What a [`FakeAccel`] channel was told.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelEvent {
    Created,
    AddGroup(RawDescriptor),
    DelGroup(RawDescriptor),
}

/// A hypervisor side channel that logs what it is told.
#[derive(Default)]
pub struct FakeAccel {
    events: Arc<Mutex<Vec<AccelEvent>>>,
    fail_create: Mutex<bool>,
}

impl FakeAccel {
    pub fn new() -> Arc<FakeAccel> {
        Arc::new(FakeAccel::default())
    }

    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock() = fail;
    }

    pub fn events(&self) -> Vec<AccelEvent> {
        self.events.lock().clone()
    }
}

impl AccelProvider for FakeAccel {
    fn create_channel(&self) -> Result<Box<dyn AccelChannel>, SysError> {
        if *self.fail_create.lock() {
            return Err(SysError::new(libc::ENODEV));
        }
        self.events.lock().push(AccelEvent::Created);
        Ok(Box::new(FakeAccelChannel {
            events: self.events.clone(),
        }))
    }
}

struct FakeAccelChannel {
    events: Arc<Mutex<Vec<AccelEvent>>>,
}

impl AccelChannel for FakeAccelChannel {
    fn add_group(&self, group: RawDescriptor) -> Result<(), SysError> {
        self.events.lock().push(AccelEvent::AddGroup(group));
        Ok(())
    }

    fn del_group(&self, group: RawDescriptor) -> Result<(), SysError> {
        self.events.lock().push(AccelEvent::DelGroup(group));
        Ok(())
    }
}
