// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use sync::Mutex;

use crate::container::VfioContainer;
use crate::device::VfioDevice;
use crate::error::Result;
use crate::error::VfioError;
use crate::host::HostGroup;
use crate::host::RawDescriptor;
use crate::memory::AddressSpaceId;

/// A host isolation group bound to one container.
pub struct VfioGroup {
    id: u32,
    space: AddressSpaceId,
    host: Mutex<Option<Arc<dyn HostGroup>>>,
    container: Weak<VfioContainer>,
    devices: Mutex<Vec<Arc<VfioDevice>>>,
}

impl fmt::Debug for VfioGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VfioGroup")
            .field("id", &self.id)
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}

impl VfioGroup {
    pub(crate) fn new(
        id: u32,
        space: AddressSpaceId,
        host: Arc<dyn HostGroup>,
        container: &Arc<VfioContainer>,
    ) -> VfioGroup {
        VfioGroup {
            id,
            space,
            host: Mutex::new(Some(host)),
            container: Arc::downgrade(container),
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn space_id(&self) -> AddressSpaceId {
        self.space
    }

    pub fn container(&self) -> Option<Arc<VfioContainer>> {
        self.container.upgrade()
    }

    pub(crate) fn host(&self) -> Result<Arc<dyn HostGroup>> {
        self.host
            .lock()
            .clone()
            .ok_or(VfioError::GroupReleased(self.id))
    }

    pub fn raw_descriptor(&self) -> Option<RawDescriptor> {
        self.host.lock().as_ref().map(|h| h.as_raw_descriptor())
    }

    pub fn devices(&self) -> Vec<Arc<VfioDevice>> {
        self.devices.lock().clone()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn has_devices(&self) -> bool {
        !self.devices.lock().is_empty()
    }

    pub(crate) fn add_device(&self, device: Arc<VfioDevice>) {
        self.devices.lock().push(device);
    }

    pub(crate) fn remove_device(&self, device: &Arc<VfioDevice>) -> bool {
        let mut devices = self.devices.lock();
        let before = devices.len();
        devices.retain(|d| !Arc::ptr_eq(d, device));
        devices.len() != before
    }

    pub fn is_released(&self) -> bool {
        self.host.lock().is_none()
    }

    pub(crate) fn close(&self) {
        if let Some(host) = self.host.lock().take() {
            debug!("vfio: closing group {} ({})", self.id, host.as_raw_descriptor());
        }
    }
}
