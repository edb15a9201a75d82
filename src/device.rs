// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::fmt;
use std::sync::Arc;

use log::debug;
use log::error;
use sync::Mutex;
use vfio_sys::*;

use crate::error::Result;
use crate::error::VfioError;
use crate::host::DeviceInfo;
use crate::host::HostDevice;
use crate::host::IrqAction;
use crate::host::IrqSet;
use crate::host::RegionInfo;

/// Bus specific behavior of a passthrough device.
pub trait DeviceOps: Send + Sync {
    /// Called after every slow path region access.
    fn eoi(&self, _device: &VfioDevice) {}

    /// Decides whether `device` takes part in the next system reset.
    fn compute_needs_reset(&self, device: &VfioDevice) -> bool;

    /// Resets `device`, and whatever else must be reset along with it.
    fn hot_reset_multi(&self, device: &VfioDevice) -> Result<()>;
}

/// Resets devices that advertise reset support with a plain device reset.
#[derive(Debug, Default)]
pub struct BasicDeviceOps;

impl DeviceOps for BasicDeviceOps {
    fn compute_needs_reset(&self, device: &VfioDevice) -> bool {
        device.reset_works()
    }

    fn hot_reset_multi(&self, device: &VfioDevice) -> Result<()> {
        device.reset()
    }
}

/// A passthrough device opened from its group.
pub struct VfioDevice {
    name: String,
    group_id: u32,
    host: Mutex<Option<Arc<dyn HostDevice>>>,
    info: DeviceInfo,
    needs_reset: AtomicBool,
    ops: Arc<dyn DeviceOps>,
    no_mmap: bool,
}

impl fmt::Debug for VfioDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VfioDevice")
            .field("name", &self.name)
            .field("group_id", &self.group_id)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl VfioDevice {
    pub(crate) fn new(
        name: &str,
        group_id: u32,
        host: Arc<dyn HostDevice>,
        info: DeviceInfo,
        ops: Arc<dyn DeviceOps>,
        no_mmap: bool,
    ) -> VfioDevice {
        VfioDevice {
            name: name.to_owned(),
            group_id,
            host: Mutex::new(Some(host)),
            info,
            needs_reset: AtomicBool::new(false),
            ops,
            no_mmap,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn flags(&self) -> u32 {
        self.info.flags
    }

    pub fn num_regions(&self) -> u32 {
        self.info.num_regions
    }

    pub fn num_irqs(&self) -> u32 {
        self.info.num_irqs
    }

    pub fn reset_works(&self) -> bool {
        self.info.flags & VFIO_DEVICE_FLAGS_RESET != 0
    }

    pub fn no_mmap(&self) -> bool {
        self.no_mmap
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset.load(Ordering::Acquire)
    }

    pub fn set_needs_reset(&self, needs_reset: bool) {
        self.needs_reset.store(needs_reset, Ordering::Release);
    }

    pub fn ops(&self) -> &Arc<dyn DeviceOps> {
        &self.ops
    }

    pub(crate) fn host(&self) -> Result<Arc<dyn HostDevice>> {
        self.host
            .lock()
            .clone()
            .ok_or_else(|| VfioError::DeviceReleased(self.name.clone()))
    }

    pub fn is_released(&self) -> bool {
        self.host.lock().is_none()
    }

    /// Closes the device descriptor.
    pub(crate) fn release(&self) {
        if self.host.lock().take().is_some() {
            debug!("vfio: closing device {}", self.name);
        }
    }

    pub fn region_info(&self, index: u32) -> Result<RegionInfo> {
        self.host()?.region_info(index).map_err(|err| {
            error!(
                "vfio: error getting region {} info of device {}: {}",
                index, self.name, err
            );
            VfioError::GetRegionInfo {
                name: self.name.clone(),
                index,
                err,
            }
        })
    }

    pub fn reset(&self) -> Result<()> {
        self.host()?.reset().map_err(|err| {
            error!("vfio: failed to reset device {}: {}", self.name, err);
            VfioError::Reset {
                name: self.name.clone(),
                err,
            }
        })
    }

    pub fn eoi(&self) {
        self.ops.eoi(self);
    }

    fn set_irqs(&self, irqs: IrqSet) -> Result<()> {
        self.host()?.set_irqs(&irqs).map_err(|err| {
            error!(
                "vfio: failed to set irqs of index {} ({:?}) on device {}: {}",
                irqs.index, irqs.action, self.name, err
            );
            VfioError::IrqSet {
                name: self.name.clone(),
                index: irqs.index,
                err,
            }
        })
    }

    /// Tears down every trigger of interrupt `index`.
    pub fn disable_irq_index(&self, index: u32) -> Result<()> {
        self.set_irqs(IrqSet {
            index,
            start: 0,
            count: 0,
            action: IrqAction::Disable,
        })
    }

    pub fn mask_single_irq_index(&self, index: u32) -> Result<()> {
        self.set_irqs(IrqSet {
            index,
            start: 0,
            count: 1,
            action: IrqAction::Mask,
        })
    }

    pub fn unmask_single_irq_index(&self, index: u32) -> Result<()> {
        self.set_irqs(IrqSet {
            index,
            start: 0,
            count: 1,
            action: IrqAction::Unmask,
        })
    }
}
