// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! System reset of passthrough devices.

use std::sync::Arc;

use log::error;

use crate::device::VfioDevice;

/// Invoked by the embedder's reset orchestration.
pub trait ResetHandler: Send + Sync {
    fn reset(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResetHandlerId(pub u64);

pub trait ResetRegistrar: Send + Sync {
    fn register(&self, handler: Arc<dyn ResetHandler>) -> ResetHandlerId;
    fn unregister(&self, id: ResetHandlerId);
}

/// Resets `devices` in two passes.
///
/// Every device first decides whether it needs a reset; only then are the flagged devices reset,
/// so no decision observes a sibling's reset.
pub fn reset_devices(devices: &[Arc<VfioDevice>]) {
    for device in devices {
        device.set_needs_reset(device.ops().compute_needs_reset(device));
    }
    for device in devices {
        if !device.needs_reset() {
            continue;
        }
        if let Err(e) = device.ops().hot_reset_multi(device) {
            error!("vfio: reset of {} failed: {}", device.name(), e);
        }
        device.set_needs_reset(false);
    }
}
