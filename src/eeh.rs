// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Enhanced error handling (EEH) operations.
//!
//! The host applies EEH operations to a whole container while the hardware recovers per
//! isolation group, so an operation is only well defined on a container holding exactly one
//! group. Across containers there is no synchronization at all, so the address space level
//! helpers require exactly one container.

use std::sync::Arc;

use log::error;
use vfio_sys::*;

use crate::address_space::AddressSpaceRegistry;
use crate::container::VfioContainer;
use crate::error::Result;
use crate::error::VfioError;
use crate::memory::AddressSpaceId;

/// A partitionable endpoint operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EehOp {
    Disable,
    Enable,
    UnfreezeIo,
    UnfreezeDma,
    GetState,
    Reset,
    Configure,
}

impl EehOp {
    pub fn raw(self) -> u32 {
        match self {
            EehOp::Disable => VFIO_EEH_PE_DISABLE,
            EehOp::Enable => VFIO_EEH_PE_ENABLE,
            EehOp::UnfreezeIo => VFIO_EEH_PE_UNFREEZE_IO,
            EehOp::UnfreezeDma => VFIO_EEH_PE_UNFREEZE_DMA,
            EehOp::GetState => VFIO_EEH_PE_GET_STATE,
            EehOp::Reset => VFIO_EEH_PE_RESET,
            EehOp::Configure => VFIO_EEH_PE_CONFIGURE,
        }
    }
}

pub fn container_ok(container: &VfioContainer) -> bool {
    container.group_count() == 1
}

/// Issues `op` on `container` and returns the host's result.
pub fn container_op(container: &VfioContainer, op: EehOp) -> Result<i32> {
    let groups = container.group_count();
    if groups != 1 {
        error!(
            "vfio/eeh: EEH_PE_OP {:#x}: kernel requires a container with exactly one group",
            op.raw()
        );
        return Err(VfioError::EehIneligible(groups));
    }
    container.eeh_pe_op(op.raw())
}

/// The only container of address space `id`.
pub(crate) fn as_container(
    registry: &AddressSpaceRegistry,
    id: AddressSpaceId,
) -> Result<Arc<VfioContainer>> {
    match registry.get(id).map(|e| e.containers()) {
        Some([container]) => Ok(container.clone()),
        Some(containers) => Err(VfioError::EehNoContainer(containers.len())),
        None => Err(VfioError::EehNoContainer(0)),
    }
}
