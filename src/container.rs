// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::fmt;
use std::sync::Arc;

use log::debug;
use log::error;
use sync::Mutex;
use vfio_sys::*;

use crate::errno::SysError;
use crate::error::Result;
use crate::error::VfioError;
use crate::guest_iommu::GuestIommuBinding;
use crate::host::HostContainer;
use crate::host::HostGroup;
use crate::host::IommuType;
use crate::host::RawDescriptor;
use crate::host::VfioHost;
use crate::listener::ContainerListener;
use crate::manager::FatalHandler;
use crate::memory::AddressSpaceId;
use crate::memory::GuestAddressSpace;
use crate::memory::GuestMemoryRegion;
use crate::memory::ListenerId;

const DEFAULT_IOVA_PGSIZES: u64 = 0x1000;
// Largest single unmap request; a section may cover the full 64-bit space.
const MAX_UNMAP_CHUNK: u128 = 1 << 63;

/// The host IOMMU model a container was set up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IommuModel {
    /// General page table model. `v2` selects the variant with fine grained unmap semantics.
    Type1 { v2: bool },
    /// Windowed model with a fixed DMA window.
    SpaprTce,
}

#[derive(Clone, Copy, Debug)]
struct IommuWindow {
    model: IommuModel,
    min_iova: u64,
    max_iova: u64,
    iova_pgsizes: u64,
}

pub(crate) struct ContainerConfig<'a> {
    pub host: &'a dyn VfioHost,
    pub space: Arc<dyn GuestAddressSpace>,
    pub system_memory: Arc<dyn GuestAddressSpace>,
    pub page_size: u64,
    pub on_fatal: FatalHandler,
}

/// A host IOMMU context shared by the groups of one guest address space.
pub struct VfioContainer {
    host: Mutex<Option<Arc<dyn HostContainer>>>,
    space: Arc<dyn GuestAddressSpace>,
    system_memory: Arc<dyn GuestAddressSpace>,
    window: IommuWindow,
    page_size: u64,
    initialized: AtomicBool,
    error: Mutex<Option<VfioError>>,
    on_fatal: FatalHandler,
    listener: Mutex<Option<ListenerId>>,
    giommus: Mutex<Vec<Arc<GuestIommuBinding>>>,
    held_regions: Mutex<Vec<Arc<GuestMemoryRegion>>>,
    groups: Mutex<BTreeSet<u32>>,
}

impl fmt::Debug for VfioContainer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VfioContainer")
            .field("space", &self.space.id())
            .field("window", &self.window)
            .field("page_size", &format_args!("{:#x}", self.page_size))
            .finish_non_exhaustive()
    }
}

fn join_group(host: &dyn HostContainer, group_id: u32, group: &dyn HostGroup) -> Result<()> {
    group.set_container(host).map_err(|err| {
        error!(
            "vfio: failed to add group {} to container: {}",
            group_id, err
        );
        VfioError::SetContainer { group_id, err }
    })
}

fn unset_group(group_id: u32, group: &dyn HostGroup) {
    if let Err(e) = group.unset_container() {
        error!(
            "vfio: error disconnecting group {} from container: {}",
            group_id, e
        );
    }
}

/// Selects an IOMMU model for a fresh container and joins `group` to it.
fn setup_iommu(
    host: &dyn HostContainer,
    group_id: u32,
    group: &dyn HostGroup,
) -> Result<IommuWindow> {
    if host.check_extension(VFIO_TYPE1_IOMMU) || host.check_extension(VFIO_TYPE1v2_IOMMU) {
        let v2 = host.check_extension(VFIO_TYPE1v2_IOMMU);
        join_group(host, group_id, group)?;
        let iommu = if v2 {
            IommuType::Type1v2
        } else {
            IommuType::Type1
        };
        if let Err(e) = host.set_iommu(iommu) {
            error!("vfio: failed to set iommu for container: {}", e);
            unset_group(group_id, group);
            return Err(VfioError::SetIommu(e));
        }
        let iova_pgsizes = match host.type1_info() {
            Ok(info) if info.flags & VFIO_IOMMU_INFO_PGSIZES != 0 => info.iova_pgsizes,
            _ => DEFAULT_IOVA_PGSIZES,
        };
        Ok(IommuWindow {
            model: IommuModel::Type1 { v2 },
            min_iova: 0,
            max_iova: u64::MAX,
            iova_pgsizes,
        })
    } else if host.check_extension(VFIO_SPAPR_TCE_IOMMU) {
        join_group(host, group_id, group)?;
        let ret = host
            .set_iommu(IommuType::SpaprTce)
            .map_err(|e| {
                error!("vfio: failed to set iommu for container: {}", e);
                VfioError::SetIommu(e)
            })
            .and_then(|_| {
                host.enable_iommu().map_err(|e| {
                    error!("vfio: failed to enable container: {}", e);
                    VfioError::EnableIommu(e)
                })
            })
            .and_then(|_| {
                host.spapr_tce_info().map_err(|e| {
                    error!("vfio: VFIO_IOMMU_SPAPR_TCE_GET_INFO failed: {}", e);
                    VfioError::GetIommuInfo(e)
                })
            })
            .and_then(|info| {
                if info.dma32_window_size == 0 {
                    error!("vfio: host reported an empty DMA window");
                    return Err(VfioError::GetIommuInfo(SysError::new(libc::EINVAL)));
                }
                Ok(info)
            });
        let info = match ret {
            Ok(info) => info,
            Err(e) => {
                unset_group(group_id, group);
                return Err(e);
            }
        };
        let min_iova = u64::from(info.dma32_window_start);
        Ok(IommuWindow {
            model: IommuModel::SpaprTce,
            min_iova,
            max_iova: min_iova + u64::from(info.dma32_window_size) - 1,
            // Only 4K IOVA pages are used with this model.
            iova_pgsizes: DEFAULT_IOVA_PGSIZES,
        })
    } else {
        error!("vfio: no available IOMMU models");
        Err(VfioError::NoIommuModel)
    }
}

impl VfioContainer {
    /// Opens a new host IOMMU context, joins `group` to it and starts mirroring the guest
    /// address space into it.
    ///
    /// Everything done so far is undone on failure, in reverse order.
    pub(crate) fn connect(
        config: ContainerConfig,
        group_id: u32,
        group: &dyn HostGroup,
    ) -> Result<Arc<VfioContainer>> {
        let host: Arc<dyn HostContainer> = config
            .host
            .open_container()
            .map_err(|e| {
                error!("vfio: failed to open container: {}", e);
                VfioError::OpenContainer(e)
            })?
            .into();

        let version = host.api_version();
        if version != VFIO_API_VERSION as i32 {
            error!(
                "vfio: supported vfio version: {}, reported version: {}",
                VFIO_API_VERSION, version
            );
            return Err(VfioError::ApiVersion(version));
        }

        let window = setup_iommu(host.as_ref(), group_id, group)?;
        debug!(
            "vfio: container {} uses {:?}, iova {:#x}..={:#x}, pgsizes {:#x}",
            host.as_raw_descriptor(),
            window.model,
            window.min_iova,
            window.max_iova,
            window.iova_pgsizes
        );

        let container = Arc::new(VfioContainer {
            host: Mutex::new(Some(host)),
            space: config.space,
            system_memory: config.system_memory,
            window,
            page_size: config.page_size,
            initialized: AtomicBool::new(false),
            error: Mutex::new(None),
            on_fatal: config.on_fatal,
            listener: Mutex::new(None),
            giommus: Mutex::new(Vec::new()),
            held_regions: Mutex::new(Vec::new()),
            groups: Mutex::new(BTreeSet::from([group_id])),
        });

        let listener = Arc::new(ContainerListener::new(Arc::downgrade(&container)));
        let id = container.space.register_listener(listener);
        *container.listener.lock() = Some(id);

        let sticky = container.error.lock().take();
        if let Some(err) = sticky {
            error!(
                "vfio: memory listener initialization failed for container: {}",
                err
            );
            container.release_listener();
            container.release_bindings();
            unset_group(group_id, group);
            container.close();
            return Err(err);
        }

        container.initialized.store(true, Ordering::Release);
        Ok(container)
    }

    /// Tries to add `group` to this existing context.
    pub(crate) fn try_join(&self, group_id: u32, group: &dyn HostGroup) -> bool {
        let host = match self.host() {
            Ok(h) => h,
            Err(_) => return false,
        };
        if group.set_container(host.as_ref()).is_err() {
            return false;
        }
        self.groups.lock().insert(group_id);
        true
    }

    /// Detaches a group. Returns true when no groups are left.
    pub(crate) fn leave(&self, group_id: u32, group: Option<&dyn HostGroup>) -> bool {
        if let Some(group) = group {
            unset_group(group_id, group);
        }
        let mut groups = self.groups.lock();
        groups.remove(&group_id);
        groups.is_empty()
    }

    /// Stops mirroring and closes the host context.
    pub(crate) fn shutdown(&self) {
        self.release_listener();
        self.release_bindings();
        self.held_regions.lock().clear();
        self.close();
    }

    fn release_listener(&self) {
        let id = self.listener.lock().take();
        if let Some(id) = id {
            self.space.unregister_listener(id);
        }
    }

    fn release_bindings(&self) {
        let bindings = std::mem::take(&mut *self.giommus.lock());
        for binding in bindings {
            binding.detach();
        }
    }

    fn close(&self) {
        if let Some(host) = self.host.lock().take() {
            debug!("vfio: closing container {}", host.as_raw_descriptor());
        }
    }

    fn host(&self) -> Result<Arc<dyn HostContainer>> {
        self.host.lock().clone().ok_or(VfioError::ContainerClosed)
    }

    /// Handles a failure to keep the host IOMMU in sync with the guest.
    ///
    /// While the container is being set up the first failure is kept and fails the setup.
    /// Afterwards the guest view can no longer be trusted and the fatal handler is invoked.
    pub(crate) fn record_failure(&self, err: VfioError) {
        if self.initialized.load(Ordering::Acquire) {
            error!("vfio: DMA mapping failed, unable to continue: {}", err);
            (self.on_fatal)(&err);
        } else {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }

    pub(crate) fn hold_region(&self, region: &Arc<GuestMemoryRegion>) {
        self.held_regions.lock().push(region.clone());
    }

    pub(crate) fn release_region(&self, region: &Arc<GuestMemoryRegion>) {
        let mut held = self.held_regions.lock();
        if let Some(pos) = held.iter().position(|r| Arc::ptr_eq(r, region)) {
            held.swap_remove(pos);
        }
    }

    pub(crate) fn add_giommu(&self, binding: Arc<GuestIommuBinding>) {
        self.giommus.lock().push(binding);
    }

    pub(crate) fn remove_giommu(
        &self,
        region: &Arc<GuestMemoryRegion>,
    ) -> Option<Arc<GuestIommuBinding>> {
        let mut giommus = self.giommus.lock();
        let pos = giommus.iter().position(|b| b.is_for(region))?;
        Some(giommus.remove(pos))
    }

    /// Maps `size` bytes at `host_addr` to `iova`, readable by devices and writable unless
    /// `readonly`.
    ///
    /// A request failing with EBUSY is retried once after unmapping the range.
    ///
    /// # Safety
    ///
    /// `host_addr..host_addr + size` must stay mapped until the range is unmapped or the
    /// container is closed.
    pub unsafe fn dma_map(
        &self,
        iova: u64,
        size: u64,
        host_addr: u64,
        readonly: bool,
    ) -> Result<()> {
        let host = self.host()?;
        // SAFETY: forwarded from the caller.
        let ret = match unsafe { host.map_dma(iova, size, host_addr, readonly) } {
            Err(e) if e.errno() == libc::EBUSY => {
                debug!(
                    "vfio: iova {:#x} size {:#x} busy, unmapping and retrying",
                    iova, size
                );
                match host.unmap_dma(iova, size) {
                    // SAFETY: forwarded from the caller.
                    Ok(()) => unsafe { host.map_dma(iova, size, host_addr, readonly) },
                    Err(unmap_err) => Err(unmap_err),
                }
            }
            ret => ret,
        };
        ret.map_err(|err| {
            error!(
                "vfio: VFIO_MAP_DMA iova {:#x} size {:#x} failed: {}",
                iova, size, err
            );
            VfioError::DmaMap { iova, size, err }
        })
    }

    pub fn dma_unmap(&self, iova: u64, size: u64) -> Result<()> {
        let host = self.host()?;
        host.unmap_dma(iova, size).map_err(|err| {
            error!(
                "vfio: VFIO_UNMAP_DMA iova {:#x} size {:#x} failed: {}",
                iova, size, err
            );
            VfioError::DmaUnmap { iova, size, err }
        })
    }

    /// Unmaps a range that may be too large for a single request.
    pub(crate) fn dma_unmap_range(&self, iova: u64, size: u128) -> Result<()> {
        let mut start = u128::from(iova);
        let end = start + size;
        while start < end {
            let chunk = (end - start).min(MAX_UNMAP_CHUNK);
            self.dma_unmap(start as u64, chunk as u64)?;
            start += chunk;
        }
        Ok(())
    }

    pub(crate) fn eeh_pe_op(&self, op: u32) -> Result<i32> {
        let host = self.host()?;
        host.eeh_pe_op(op).map_err(|err| {
            error!("vfio/eeh: EEH_PE_OP {:#x} failed: {}", op, err);
            VfioError::EehOp { op, err }
        })
    }

    pub fn space(&self) -> &Arc<dyn GuestAddressSpace> {
        &self.space
    }

    pub fn space_id(&self) -> AddressSpaceId {
        self.space.id()
    }

    pub(crate) fn system_memory(&self) -> &Arc<dyn GuestAddressSpace> {
        &self.system_memory
    }

    pub fn model(&self) -> IommuModel {
        self.window.model
    }

    pub fn min_iova(&self) -> u64 {
        self.window.min_iova
    }

    pub fn max_iova(&self) -> u64 {
        self.window.max_iova
    }

    pub fn iova_pgsizes(&self) -> u64 {
        self.window.iova_pgsizes
    }

    /// Smallest IOVA page size the host supports.
    pub fn granularity(&self) -> u64 {
        1 << self.window.iova_pgsizes.trailing_zeros().min(63)
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.host.lock().is_none()
    }

    pub fn raw_descriptor(&self) -> Option<RawDescriptor> {
        self.host.lock().as_ref().map(|h| h.as_raw_descriptor())
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn group_ids(&self) -> Vec<u32> {
        self.groups.lock().iter().copied().collect()
    }

    pub fn guest_iommu_count(&self) -> usize {
        self.giommus.lock().len()
    }

    /// Number of guest memory regions currently referenced by mappings.
    pub fn held_region_count(&self) -> usize {
        self.held_regions.lock().len()
    }
}
