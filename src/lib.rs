// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side resource management for VFIO device passthrough.
//!
//! A [`VfioManager`] pools passthrough devices into host IOMMU containers, one set of containers
//! per guest address space. Every container registers a memory listener with the guest address
//! space it serves and mirrors the guest's RAM layout, as well as the translations of any guest
//! visible IOMMU, into the host IOMMU page tables.
//!
//! The kernel interface is reached through the [`host`] traits. [`LinuxVfioHost`] talks to
//! `/dev/vfio`; the [`fake`] module provides an in-memory host for tests and tooling.

mod address_space;
pub mod config;
mod container;
mod device;
pub mod eeh;
mod errno;
mod error;
pub mod fake;
mod group;
pub mod guest_iommu;
pub mod host;
mod kvm;
mod listener;
mod manager;
pub mod memory;
mod mmap;
mod region;
pub mod reset;
mod sys;

pub use crate::address_space::AddressSpaceEntry;
pub use crate::address_space::AddressSpaceRegistry;
pub use crate::config::VfioOptions;
pub use crate::container::IommuModel;
pub use crate::container::VfioContainer;
pub use crate::device::BasicDeviceOps;
pub use crate::device::DeviceOps;
pub use crate::device::VfioDevice;
pub use crate::errno::SysError;
pub use crate::error::ErrorKind;
pub use crate::error::Result;
pub use crate::error::VfioError;
pub use crate::group::VfioGroup;
pub use crate::kvm::AccelChannel;
pub use crate::kvm::AccelProvider;
pub use crate::listener::ContainerListener;
pub use crate::manager::FatalHandler;
pub use crate::manager::VfioManager;
pub use crate::manager::VfioManagerBuilder;
pub use crate::mmap::pagesize;
pub use crate::mmap::MemoryMapping;
pub use crate::mmap::Protection;
pub use crate::region::AccessSize;
pub use crate::region::MmapWindow;
pub use crate::region::VfioRegion;
pub use crate::sys::platform::KvmVfioProvider;
pub use crate::sys::platform::LinuxVfioHost;
