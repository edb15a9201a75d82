// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use sync::Mutex;
use vfio_host::eeh::EehOp;
use vfio_host::fake::FakeAddressSpace;
use vfio_host::fake::FakeDevice;
use vfio_host::fake::FakeHost;
use vfio_host::fake::HostCall;
use vfio_host::host::IrqAction;
use vfio_host::host::IrqSet;
use vfio_host::memory::AddressSpaceId;
use vfio_host::memory::GuestAddressSpace;
use vfio_host::pagesize;
use vfio_host::AccessSize;
use vfio_host::DeviceOps;
use vfio_host::ErrorKind;
use vfio_host::Result;
use vfio_host::VfioDevice;
use vfio_host::VfioError;
use vfio_host::VfioManager;
use vfio_host::VfioManagerBuilder;
use vfio_host::VfioOptions;
use vfio_host::VfioRegion;
use vfio_sys::VFIO_DEVICE_FLAGS_PCI;
use vfio_sys::VFIO_DEVICE_FLAGS_RESET;
use vfio_sys::VFIO_REGION_INFO_FLAG_MMAP;
use vfio_sys::VFIO_REGION_INFO_FLAG_READ;
use vfio_sys::VFIO_REGION_INFO_FLAG_WRITE;

const RW: u32 = VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE;
const RW_MMAP: u32 = RW | VFIO_REGION_INFO_FLAG_MMAP;

fn page() -> u64 {
    pagesize() as u64
}

/// Region 0 is mappable, region 1 is slow path only and region 2 is absent.
fn pci_device() -> FakeDevice {
    FakeDevice::new(VFIO_DEVICE_FLAGS_PCI | VFIO_DEVICE_FLAGS_RESET, 5)
        .with_region(RW_MMAP, 2 * page())
        .with_region(RW, 0x100)
        .with_region(0, 0)
}

struct Machine {
    host: Arc<FakeHost>,
    manager: Arc<VfioManager>,
    space: Arc<dyn GuestAddressSpace>,
}

fn machine_with_options(options: VfioOptions) -> Machine {
    let host = FakeHost::new();
    let space: Arc<dyn GuestAddressSpace> = FakeAddressSpace::new(0);
    let manager = VfioManagerBuilder::new(host.clone(), space.clone())
        .options(options)
        .build()
        .unwrap();
    Machine {
        host,
        manager,
        space,
    }
}

fn machine() -> Machine {
    machine_with_options(VfioOptions::default())
}

impl Machine {
    fn attach(&self, group_id: u32, name: &str, device: FakeDevice) -> Arc<VfioDevice> {
        self.host.add_group(group_id);
        self.host.add_device(group_id, name, device);
        self.manager.attach_device(group_id, name, &self.space).unwrap()
    }
}

#[test]
fn device_info_is_exposed() {
    let m = machine();
    let device = m.attach(1, "0000:01:00.0", pci_device());

    assert_eq!(device.name(), "0000:01:00.0");
    assert_eq!(device.num_regions(), 3);
    assert_eq!(device.num_irqs(), 5);
    assert!(device.reset_works());
    assert_eq!(m.manager.devices().len(), 1);
}

#[test]
fn mappable_region_gets_one_window() {
    let m = machine();
    let device = m.attach(1, "dev", pci_device());

    let mut region = VfioRegion::setup(&device, 0).unwrap();
    assert_eq!(region.size(), 2 * page());
    assert_eq!(region.fd_offset(), FakeDevice::region_offset(0));
    assert_eq!(region.windows().len(), 1);

    region.mmap().unwrap();
    assert_eq!(region.active_windows(), 1);
    let window = &region.windows()[0];
    assert!(window.is_attached());
    assert!(window.is_enabled());
    assert!(window.host_addr().is_some());

    region.set_mmaps_enabled(false);
    assert!(!region.windows()[0].is_enabled());
    assert_eq!(region.active_windows(), 1);

    region.exit();
    assert!(!region.windows()[0].is_attached());
    assert_eq!(region.active_windows(), 1);

    region.finalize();
    assert!(region.windows().is_empty());
}

#[test]
fn slow_path_region_has_no_windows() {
    let m = machine();
    let device = m.attach(1, "dev", pci_device());

    let mut region = VfioRegion::setup(&device, 1).unwrap();
    assert!(region.windows().is_empty());
    region.mmap().unwrap();
    assert_eq!(m.host.count_calls(|c| matches!(c, HostCall::Mmap { .. })), 0);

    let absent = VfioRegion::setup(&device, 2).unwrap();
    assert!(absent.windows().is_empty());
}

#[test]
fn no_mmap_option_disables_windows() {
    let m = machine_with_options(VfioOptions {
        no_mmap: true,
        ..Default::default()
    });
    let device = m.attach(1, "dev", pci_device());

    assert!(device.no_mmap());
    let region = VfioRegion::setup(&device, 0).unwrap();
    assert!(region.windows().is_empty());
}

#[test]
fn failed_window_rolls_back_earlier_ones() {
    let m = machine();
    let p = page();
    let device = m.attach(
        1,
        "dev",
        FakeDevice::new(VFIO_DEVICE_FLAGS_PCI, 0).with_region(RW_MMAP, 2 * p + 0x100),
    );
    m.host.fail_mmap_at(FakeDevice::region_offset(0) + p);

    let mut region = VfioRegion::setup(&device, 0).unwrap();
    assert!(region.windows().is_empty());
    region.add_mmap_window(0, p).unwrap();
    region.add_mmap_window(p, p).unwrap();

    let err = region.mmap().unwrap_err();
    assert!(matches!(err, VfioError::RegionMmap { index: 0, .. }));
    assert_eq!(err.errno(), libc::ENOMEM);
    assert_eq!(region.active_windows(), 0);
    assert!(region.windows().iter().all(|w| !w.is_attached()));
    assert_eq!(m.host.count_calls(|c| matches!(c, HostCall::Mmap { .. })), 2);
}

#[test]
fn window_past_descriptor_end_fails_cleanly() {
    let m = machine();
    let p = page();
    let last_page = u64::MAX & !(p - 1);
    let device = m.attach(
        1,
        "dev",
        FakeDevice::new(VFIO_DEVICE_FLAGS_PCI, 0).with_region_at(RW_MMAP, 2 * p, last_page),
    );

    let mut region = VfioRegion::setup(&device, 0).unwrap();
    assert_eq!(region.windows().len(), 1);
    region.add_mmap_window(p, p).unwrap();

    let err = region.mmap().unwrap_err();
    assert!(matches!(err, VfioError::RegionMmap { index: 0, offset, .. } if offset == p));
    assert_eq!(err.errno(), libc::EOVERFLOW);
    assert_eq!(region.active_windows(), 0);
    assert_eq!(m.host.count_calls(|c| matches!(c, HostCall::Mmap { .. })), 1);
}

#[test]
fn bad_windows_are_rejected() {
    let m = machine();
    let device = m.attach(1, "dev", pci_device());
    let mut region = VfioRegion::setup(&device, 0).unwrap();

    let err = region.add_mmap_window(0x10, page()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(region.add_mmap_window(page(), 2 * page()).is_err());
    assert!(region.add_mmap_window(0, 0).is_err());
    assert_eq!(region.windows().len(), 1);
}

#[test]
fn slow_path_accesses_are_little_endian() {
    let m = machine();
    let fake = pci_device();
    let device = m.attach(1, "dev", fake.clone());
    let region = VfioRegion::setup(&device, 1).unwrap();
    let base = FakeDevice::region_offset(1);

    region.write(0x10, 0xdead_beef, AccessSize::Dword);
    assert_eq!(fake.peek(base + 0x10, 4), vec![0xef, 0xbe, 0xad, 0xde]);
    assert_eq!(region.read(0x10, AccessSize::Dword), 0xdead_beef);
    assert_eq!(region.read(0x10, AccessSize::Word), 0xbeef);
    assert_eq!(region.read(0x13, AccessSize::Byte), 0xde);

    fake.poke(base + 0x20, &[0x34, 0x12]);
    assert_eq!(region.read(0x20, AccessSize::Word), 0x1234);

    region.write(0x30, 0x1_2345_6789, AccessSize::Byte);
    assert_eq!(fake.peek(base + 0x30, 2), vec![0x89, 0x00]);
    assert!(m.host.calls().contains(&HostCall::DeviceWrite {
        name: "dev".to_owned(),
        offset: base + 0x30,
        data: vec![0x89],
    }));
}

#[derive(Default)]
struct RecordingOps {
    log: Mutex<Vec<String>>,
}

impl DeviceOps for RecordingOps {
    fn eoi(&self, device: &VfioDevice) {
        self.log.lock().push(format!("eoi:{}", device.name()));
    }

    fn compute_needs_reset(&self, device: &VfioDevice) -> bool {
        self.log.lock().push(format!("check:{}", device.name()));
        device.name() != "skip"
    }

    fn hot_reset_multi(&self, device: &VfioDevice) -> Result<()> {
        self.log.lock().push(format!("reset:{}", device.name()));
        Ok(())
    }
}

#[test]
fn every_access_ends_with_eoi() {
    let m = machine();
    m.host.add_group(1);
    m.host.add_device(1, "dev", pci_device());
    let ops = Arc::new(RecordingOps::default());
    let group = m.manager.get_group(1, &m.space).unwrap();
    let device = m
        .manager
        .get_device_with_ops(&group, "dev", ops.clone())
        .unwrap();
    let region = VfioRegion::setup(&device, 1).unwrap();

    region.write(0, 1, AccessSize::Byte);
    region.read(0, AccessSize::Byte);
    assert_eq!(*ops.log.lock(), vec!["eoi:dev", "eoi:dev"]);

    m.manager.put_device(&device);
    assert_eq!(region.read(0, AccessSize::Dword), u64::MAX);
    assert_eq!(ops.log.lock().len(), 3);
}

#[test]
fn reset_decides_before_resetting() {
    let m = machine();
    m.host.add_group(1);
    m.host.add_device(1, "a", pci_device());
    m.host.add_device(1, "skip", pci_device());
    m.host.add_device(1, "b", pci_device());
    let ops = Arc::new(RecordingOps::default());
    let group = m.manager.get_group(1, &m.space).unwrap();
    for name in ["a", "skip", "b"] {
        m.manager
            .get_device_with_ops(&group, name, ops.clone())
            .unwrap();
    }

    m.manager.reset_devices();

    assert_eq!(
        *ops.log.lock(),
        vec!["check:a", "check:skip", "check:b", "reset:a", "reset:b"]
    );
    assert!(m.manager.devices().iter().all(|d| !d.needs_reset()));
}

#[test]
fn irq_requests() {
    let m = machine();
    let device = m.attach(1, "dev", pci_device());
    m.host.clear_calls();

    device.disable_irq_index(2).unwrap();
    device.mask_single_irq_index(0).unwrap();
    device.unmask_single_irq_index(0).unwrap();
    let err = device.mask_single_irq_index(9).unwrap_err();
    assert!(matches!(err, VfioError::IrqSet { index: 9, .. }));

    let irqs: Vec<_> = m
        .host
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            HostCall::SetIrqs { irqs, .. } => Some(irqs),
            _ => None,
        })
        .collect();
    assert_eq!(
        irqs[..3],
        [
            IrqSet {
                index: 2,
                start: 0,
                count: 0,
                action: IrqAction::Disable,
            },
            IrqSet {
                index: 0,
                start: 0,
                count: 1,
                action: IrqAction::Mask,
            },
            IrqSet {
                index: 0,
                start: 0,
                count: 1,
                action: IrqAction::Unmask,
            },
        ]
    );
}

#[test]
fn released_device_refuses_requests() {
    let m = machine();
    let device = m.attach(1, "dev", pci_device());
    m.manager.detach_device(&device);

    let err = device.reset().unwrap_err();
    assert_eq!(err, VfioError::DeviceReleased("dev".to_owned()));
    assert_eq!(err.errno(), libc::ENODEV);
    assert!(device.region_info(0).is_err());
}

#[test]
fn eeh_on_single_group_container() {
    let m = machine();
    m.host.add_group(1);
    m.host.set_eeh_result(Ok(5));
    m.manager.get_group(1, &m.space).unwrap();

    assert!(m.manager.eeh_as_ok(AddressSpaceId(0)));
    assert_eq!(m.manager.eeh_as_op(AddressSpaceId(0), EehOp::GetState), Ok(5));
    assert_eq!(m.host.count_calls(|c| matches!(c, HostCall::EehPeOp { op: 4, .. })), 1);
}

#[test]
fn eeh_refused_with_two_groups() {
    let m = machine();
    m.host.add_group(1);
    m.host.add_group(2);
    m.manager.get_group(1, &m.space).unwrap();
    m.manager.get_group(2, &m.space).unwrap();

    assert!(!m.manager.eeh_as_ok(AddressSpaceId(0)));
    let err = m
        .manager
        .eeh_as_op(AddressSpaceId(0), EehOp::Reset)
        .unwrap_err();
    assert_eq!(err, VfioError::EehIneligible(2));
    assert_eq!(err.errno(), libc::EPERM);
    assert_eq!(m.host.count_calls(|c| matches!(c, HostCall::EehPeOp { .. })), 0);
}

#[test]
fn eeh_needs_exactly_one_container() {
    let m = machine();
    let err = m
        .manager
        .eeh_as_op(AddressSpaceId(0), EehOp::Enable)
        .unwrap_err();
    assert_eq!(err, VfioError::EehNoContainer(0));

    m.host.add_group(1);
    m.host.add_group(2);
    m.host.isolate_group(2);
    m.manager.get_group(1, &m.space).unwrap();
    m.manager.get_group(2, &m.space).unwrap();
    assert!(!m.manager.eeh_as_ok(AddressSpaceId(0)));
    let err = m
        .manager
        .eeh_as_op(AddressSpaceId(0), EehOp::Enable)
        .unwrap_err();
    assert_eq!(err, VfioError::EehNoContainer(2));
    assert_eq!(err.errno(), libc::ENODEV);
}

#[test]
fn eeh_host_failure_is_reported() {
    let m = machine();
    m.host.add_group(1);
    m.host.set_eeh_result(Err(libc::EIO));
    m.manager.get_group(1, &m.space).unwrap();

    let err = m
        .manager
        .eeh_as_op(AddressSpaceId(0), EehOp::Configure)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HostCall);
    assert_eq!(err.errno(), libc::EIO);
}
