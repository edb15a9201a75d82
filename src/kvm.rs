// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use log::error;
use sync::Mutex;

use crate::errno::SysError;
use crate::host::RawDescriptor;

/// Creates the hypervisor side channel that is told about passthrough groups.
pub trait AccelProvider: Send + Sync {
    fn create_channel(&self) -> Result<Box<dyn AccelChannel>, SysError>;
}

pub trait AccelChannel: Send + Sync {
    fn add_group(&self, group: RawDescriptor) -> Result<(), SysError>;
    fn del_group(&self, group: RawDescriptor) -> Result<(), SysError>;
}

/// Forwards group changes to a lazily created channel. Failures are logged only.
pub(crate) struct AccelSideChannel {
    provider: Option<Arc<dyn AccelProvider>>,
    channel: Mutex<Option<Box<dyn AccelChannel>>>,
}

impl AccelSideChannel {
    pub fn new(provider: Option<Arc<dyn AccelProvider>>) -> AccelSideChannel {
        AccelSideChannel {
            provider,
            channel: Mutex::new(None),
        }
    }

    pub fn add_group(&self, group_id: u32, group: RawDescriptor) {
        let provider = match &self.provider {
            Some(p) => p,
            None => return,
        };
        let mut channel = self.channel.lock();
        if channel.is_none() {
            match provider.create_channel() {
                Ok(c) => *channel = Some(c),
                Err(e) => {
                    error!("Failed to create KVM VFIO device: {}", e);
                    return;
                }
            }
        }
        if let Some(c) = channel.as_ref() {
            if let Err(e) = c.add_group(group) {
                error!("Failed to add group {} to KVM VFIO device: {}", group_id, e);
            }
        }
    }

    pub fn del_group(&self, group_id: u32, group: RawDescriptor) {
        if let Some(c) = self.channel.lock().as_ref() {
            if let Err(e) = c.del_group(group) {
                error!(
                    "Failed to remove group {} from KVM VFIO device: {}",
                    group_id, e
                );
            }
        }
    }
}
