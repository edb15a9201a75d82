// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use log::error;
use log::info;
use sync::Mutex;
use sync::SnapshotCell;
use vfio_sys::*;

use crate::address_space::AddressSpaceRegistry;
use crate::config::VfioOptions;
use crate::container::ContainerConfig;
use crate::container::VfioContainer;
use crate::device::BasicDeviceOps;
use crate::device::DeviceOps;
use crate::device::VfioDevice;
use crate::eeh;
use crate::eeh::EehOp;
use crate::error::Result;
use crate::error::VfioError;
use crate::group::VfioGroup;
use crate::host::HostGroup;
use crate::host::VfioHost;
use crate::kvm::AccelProvider;
use crate::kvm::AccelSideChannel;
use crate::memory::AddressSpaceId;
use crate::memory::GuestAddressSpace;
use crate::reset;
use crate::reset::ResetHandler;
use crate::reset::ResetHandlerId;
use crate::reset::ResetRegistrar;

/// Called when the host IOMMU can no longer be kept consistent with an initialized container's
/// guest address space.
pub type FatalHandler = Arc<dyn Fn(&VfioError) + Send + Sync>;

#[derive(Clone, Default)]
struct Topology {
    spaces: AddressSpaceRegistry,
    groups: BTreeMap<u32, Arc<VfioGroup>>,
}

pub struct VfioManagerBuilder {
    host: Arc<dyn VfioHost>,
    system_memory: Arc<dyn GuestAddressSpace>,
    options: VfioOptions,
    accel: Option<Arc<dyn AccelProvider>>,
    reset_registrar: Option<Arc<dyn ResetRegistrar>>,
    on_fatal: Option<FatalHandler>,
}

impl VfioManagerBuilder {
    /// `system_memory` is the guest physical address space that guest IOMMU translations
    /// resolve into.
    pub fn new(
        host: Arc<dyn VfioHost>,
        system_memory: Arc<dyn GuestAddressSpace>,
    ) -> VfioManagerBuilder {
        VfioManagerBuilder {
            host,
            system_memory,
            options: VfioOptions::default(),
            accel: None,
            reset_registrar: None,
            on_fatal: None,
        }
    }

    pub fn options(mut self, options: VfioOptions) -> Self {
        self.options = options;
        self
    }

    pub fn accel(mut self, accel: Arc<dyn AccelProvider>) -> Self {
        self.accel = Some(accel);
        self
    }

    pub fn reset_registrar(mut self, registrar: Arc<dyn ResetRegistrar>) -> Self {
        self.reset_registrar = Some(registrar);
        self
    }

    /// Replaces the default fatal handler, which panics.
    pub fn on_fatal(mut self, handler: FatalHandler) -> Self {
        self.on_fatal = Some(handler);
        self
    }

    pub fn build(self) -> Result<Arc<VfioManager>> {
        self.options.validate()?;
        let on_fatal: FatalHandler = match self.on_fatal {
            Some(handler) => handler,
            None => Arc::new(|e: &VfioError| panic!("vfio: unable to continue: {}", e)),
        };
        Ok(Arc::new_cyclic(|self_ref| VfioManager {
            host: self.host,
            system_memory: self.system_memory,
            options: self.options,
            accel: AccelSideChannel::new(self.accel),
            reset_registrar: self.reset_registrar,
            reset_handler: Mutex::new(None),
            on_fatal,
            topology: SnapshotCell::new(Topology::default()),
            writer: Mutex::new(()),
            self_ref: self_ref.clone(),
        }))
    }
}

/// Owns every group, container and address space entry of one machine.
///
/// Mutations are serialized by an internal writer lock and published as a new snapshot of the
/// topology. Lookups read the current snapshot and never wait for a mutation in progress.
pub struct VfioManager {
    host: Arc<dyn VfioHost>,
    system_memory: Arc<dyn GuestAddressSpace>,
    options: VfioOptions,
    accel: AccelSideChannel,
    reset_registrar: Option<Arc<dyn ResetRegistrar>>,
    reset_handler: Mutex<Option<ResetHandlerId>>,
    on_fatal: FatalHandler,
    topology: SnapshotCell<Topology>,
    writer: Mutex<()>,
    self_ref: Weak<VfioManager>,
}

struct ManagerResetHandler {
    manager: Weak<VfioManager>,
}

impl ResetHandler for ManagerResetHandler {
    fn reset(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.reset_devices();
        }
    }
}

impl VfioManager {
    pub fn options(&self) -> &VfioOptions {
        &self.options
    }

    /// Returns group `group_id`, opening it and attaching it to a container serving `space` if
    /// it is not open yet.
    pub fn get_group(
        &self,
        group_id: u32,
        space: &Arc<dyn GuestAddressSpace>,
    ) -> Result<Arc<VfioGroup>> {
        let _writer = self.writer.lock();
        let mut topology = Topology::clone(&self.topology.load());

        if let Some(group) = topology.groups.get(&group_id) {
            if group.space_id() == space.id() {
                return Ok(group.clone());
            }
            error!("vfio: group {} used in multiple address spaces", group_id);
            return Err(VfioError::AddressSpaceConflict { group_id });
        }

        let host_group: Arc<dyn HostGroup> = self
            .host
            .open_group(group_id)
            .map_err(|err| {
                error!(
                    "vfio: error opening {}: {}",
                    self.options.group_path(group_id).display(),
                    err
                );
                VfioError::OpenGroup { group_id, err }
            })?
            .into();

        let status = host_group.status().map_err(|err| {
            error!("vfio: error getting group {} status: {}", group_id, err);
            VfioError::GetGroupStatus { group_id, err }
        })?;
        if status & VFIO_GROUP_FLAGS_VIABLE == 0 {
            error!(
                "vfio: error, group {} is not viable, please ensure all devices within the \
                 iommu_group are bound to their vfio bus driver",
                group_id
            );
            return Err(VfioError::GroupNotViable(group_id));
        }

        let container = self
            .connect(&mut topology.spaces, group_id, host_group.as_ref(), space)
            .map_err(|e| {
                error!("vfio: failed to setup container for group {}", group_id);
                e
            })?;

        let arm_reset = topology.groups.is_empty();
        let group = Arc::new(VfioGroup::new(
            group_id,
            space.id(),
            host_group.clone(),
            &container,
        ));
        topology.groups.insert(group_id, group.clone());
        self.topology.store(topology);

        if arm_reset {
            self.register_reset_handler();
        }
        self.accel.add_group(group_id, host_group.as_raw_descriptor());
        debug!("vfio: opened group {}", group_id);
        Ok(group)
    }

    /// Finds or creates a container in `space` that accepts the group.
    fn connect(
        &self,
        spaces: &mut AddressSpaceRegistry,
        group_id: u32,
        group: &dyn HostGroup,
        space: &Arc<dyn GuestAddressSpace>,
    ) -> Result<Arc<VfioContainer>> {
        let existing = spaces.resolve(space).containers().to_vec();
        for container in existing {
            if container.try_join(group_id, group) {
                debug!(
                    "vfio: group {} joined existing container {:?}",
                    group_id,
                    container.raw_descriptor()
                );
                return Ok(container);
            }
        }

        let config = ContainerConfig {
            host: self.host.as_ref(),
            space: space.clone(),
            system_memory: self.system_memory.clone(),
            page_size: self.options.target_page_size,
            on_fatal: self.on_fatal.clone(),
        };
        match VfioContainer::connect(config, group_id, group) {
            Ok(container) => {
                spaces.resolve(space).add_container(container.clone());
                Ok(container)
            }
            Err(e) => {
                spaces.release(space.id());
                Err(e)
            }
        }
    }

    /// Releases `group` once it has no devices left. Does nothing otherwise, or if the group was
    /// already released.
    pub fn put_group(&self, group: &Arc<VfioGroup>) {
        let _writer = self.writer.lock();
        if group.has_devices() {
            return;
        }
        let mut topology = Topology::clone(&self.topology.load());
        match topology.groups.get(&group.id()) {
            Some(g) if Arc::ptr_eq(g, group) => {}
            _ => return,
        }

        if let Some(fd) = group.raw_descriptor() {
            self.accel.del_group(group.id(), fd);
        }
        self.disconnect(&mut topology.spaces, group);
        topology.groups.remove(&group.id());
        group.close();

        let disarm_reset = topology.groups.is_empty();
        self.topology.store(topology);
        if disarm_reset {
            self.unregister_reset_handler();
        }
        debug!("vfio: released group {}", group.id());
    }

    fn disconnect(&self, spaces: &mut AddressSpaceRegistry, group: &VfioGroup) {
        let container = match group.container() {
            Some(c) => c,
            None => return,
        };
        let host_group = group.host().ok();
        if !container.leave(group.id(), host_group.as_deref()) {
            return;
        }
        container.shutdown();
        let space_id = container.space_id();
        if let Some(entry) = spaces.get_mut(space_id) {
            entry.remove_container(&container);
        }
        spaces.release(space_id);
    }

    pub fn get_device(&self, group: &Arc<VfioGroup>, name: &str) -> Result<Arc<VfioDevice>> {
        self.get_device_with_ops(group, name, Arc::new(BasicDeviceOps))
    }

    /// Opens device `name` of `group`, with `ops` providing its bus specific behavior.
    pub fn get_device_with_ops(
        &self,
        group: &Arc<VfioGroup>,
        name: &str,
        ops: Arc<dyn DeviceOps>,
    ) -> Result<Arc<VfioDevice>> {
        let host_group = group.host()?;
        let host_device = host_group.get_device(name).map_err(|err| {
            error!(
                "vfio: error getting device {} from group {}: {}",
                name,
                group.id(),
                err
            );
            info!(
                "Verify all devices in group {} are bound to vfio-<bus> or pci-stub and not \
                 already in use",
                group.id()
            );
            VfioError::GetDevice {
                group_id: group.id(),
                name: name.to_owned(),
                err,
            }
        })?;
        let info = host_device.info().map_err(|err| {
            error!("vfio: error getting device info of {}: {}", name, err);
            VfioError::GetDeviceInfo {
                name: name.to_owned(),
                err,
            }
        })?;

        let device = Arc::new(VfioDevice::new(
            name,
            group.id(),
            host_device.into(),
            info,
            ops,
            self.options.no_mmap,
        ));
        group.add_device(device.clone());
        debug!(
            "vfio: device {} flags {:#x} regions {} irqs {}",
            name, info.flags, info.num_regions, info.num_irqs
        );
        Ok(device)
    }

    /// Removes `device` from its group and closes it.
    pub fn put_device(&self, device: &Arc<VfioDevice>) {
        if let Some(group) = self.find_group(device.group_id()) {
            group.remove_device(device);
        }
        device.release();
    }

    /// Opens group `group_id` in `space` and device `name` from it.
    pub fn attach_device(
        &self,
        group_id: u32,
        name: &str,
        space: &Arc<dyn GuestAddressSpace>,
    ) -> Result<Arc<VfioDevice>> {
        let group = self.get_group(group_id, space)?;
        match self.get_device(&group, name) {
            Ok(device) => Ok(device),
            Err(e) => {
                self.put_group(&group);
                Err(e)
            }
        }
    }

    /// Closes `device` and releases its group if it was the group's last device.
    pub fn detach_device(&self, device: &Arc<VfioDevice>) {
        let group = self.find_group(device.group_id());
        self.put_device(device);
        if let Some(group) = group {
            self.put_group(&group);
        }
    }

    pub fn find_group(&self, group_id: u32) -> Option<Arc<VfioGroup>> {
        self.topology.load().groups.get(&group_id).cloned()
    }

    pub fn groups(&self) -> Vec<Arc<VfioGroup>> {
        self.topology.load().groups.values().cloned().collect()
    }

    /// Containers currently serving address space `id`.
    pub fn containers(&self, id: AddressSpaceId) -> Vec<Arc<VfioContainer>> {
        self.topology
            .load()
            .spaces
            .get(id)
            .map(|e| e.containers().to_vec())
            .unwrap_or_default()
    }

    pub fn has_address_space(&self, id: AddressSpaceId) -> bool {
        self.topology.load().spaces.contains(id)
    }

    pub fn address_space_count(&self) -> usize {
        self.topology.load().spaces.len()
    }

    /// Every open device, group by group.
    pub fn devices(&self) -> Vec<Arc<VfioDevice>> {
        self.topology
            .load()
            .groups
            .values()
            .flat_map(|g| g.devices())
            .collect()
    }

    pub fn reset_devices(&self) {
        reset::reset_devices(&self.devices());
    }

    /// Whether EEH operations can be applied to address space `id`.
    pub fn eeh_as_ok(&self, id: AddressSpaceId) -> bool {
        match eeh::as_container(&self.topology.load().spaces, id) {
            Ok(container) => eeh::container_ok(&container),
            Err(_) => false,
        }
    }

    pub fn eeh_as_op(&self, id: AddressSpaceId, op: EehOp) -> Result<i32> {
        let container = eeh::as_container(&self.topology.load().spaces, id)?;
        eeh::container_op(&container, op)
    }

    fn register_reset_handler(&self) {
        if let Some(registrar) = &self.reset_registrar {
            let handler = Arc::new(ManagerResetHandler {
                manager: self.self_ref.clone(),
            });
            *self.reset_handler.lock() = Some(registrar.register(handler));
        }
    }

    fn unregister_reset_handler(&self) {
        let id = self.reset_handler.lock().take();
        if let (Some(registrar), Some(id)) = (&self.reset_registrar, id) {
            registrar.unregister(id);
        }
    }
}
