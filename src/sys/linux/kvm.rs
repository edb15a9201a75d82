// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::os::unix::io::FromRawFd;

use vfio_sys::ioctl::ioctl_with_mut_ref;
use vfio_sys::ioctl::ioctl_with_ref;
use vfio_sys::*;

use crate::errno::errno_result;
use crate::errno::SysError;
use crate::host::RawDescriptor;
use crate::kvm::AccelChannel;
use crate::kvm::AccelProvider;

/// Creates the KVM VFIO pseudo device on a VM, letting KVM know which groups are in use.
pub struct KvmVfioProvider {
    vm: File,
}

impl KvmVfioProvider {
    /// `vm` is the descriptor returned by KVM_CREATE_VM.
    pub fn new(vm: File) -> KvmVfioProvider {
        KvmVfioProvider { vm }
    }
}

impl AccelProvider for KvmVfioProvider {
    fn create_channel(&self) -> Result<Box<dyn AccelChannel>, SysError> {
        let mut device = kvm_create_device {
            type_: KVM_DEV_TYPE_VFIO,
            fd: 0,
            flags: 0,
        };
        // SAFETY: device is a valid struct owned by this frame; the return value is checked.
        let ret = unsafe { ioctl_with_mut_ref(&self.vm, KVM_CREATE_DEVICE(), &mut device) };
        if ret < 0 {
            return errno_result();
        }
        // SAFETY: the kernel returned a new descriptor that nothing else owns.
        let file = unsafe { File::from_raw_fd(device.fd as RawDescriptor) };
        Ok(Box::new(KvmVfioDevice { file }))
    }
}

struct KvmVfioDevice {
    file: File,
}

impl KvmVfioDevice {
    fn set_group_attr(&self, attr: u64, group: RawDescriptor) -> Result<(), SysError> {
        let group_fd_ptr = &group as *const RawDescriptor;
        let attr = kvm_device_attr {
            flags: 0,
            group: KVM_DEV_VFIO_GROUP,
            attr,
            addr: group_fd_ptr as u64,
        };
        // SAFETY: attr points at a descriptor that outlives the call.
        let ret = unsafe { ioctl_with_ref(&self.file, KVM_SET_DEVICE_ATTR(), &attr) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }
}

impl AccelChannel for KvmVfioDevice {
    fn add_group(&self, group: RawDescriptor) -> Result<(), SysError> {
        self.set_group_attr(KVM_DEV_VFIO_GROUP_ADD, group)
    }

    fn del_group(&self, group: RawDescriptor) -> Result<(), SysError> {
        self.set_group_attr(KVM_DEV_VFIO_GROUP_DEL, group)
    }
}
