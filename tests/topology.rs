// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use vfio_host::fake::AccelEvent;
use vfio_host::fake::FakeAccel;
use vfio_host::fake::FakeAddressSpace;
use vfio_host::fake::FakeDevice;
use vfio_host::fake::FakeHost;
use vfio_host::fake::FakeResetRegistrar;
use vfio_host::fake::HostCall;
use vfio_host::memory::AddressSpaceId;
use vfio_host::memory::GuestAddressSpace;
use vfio_host::ErrorKind;
use vfio_host::VfioError;
use vfio_host::VfioManager;
use vfio_host::VfioManagerBuilder;
use vfio_sys::VFIO_DEVICE_FLAGS_RESET;

struct Machine {
    host: Arc<FakeHost>,
    manager: Arc<VfioManager>,
    space: Arc<dyn GuestAddressSpace>,
}

fn machine() -> Machine {
    machine_with(|b| b)
}

fn machine_with(f: impl FnOnce(VfioManagerBuilder) -> VfioManagerBuilder) -> Machine {
    let host = FakeHost::new();
    let space: Arc<dyn GuestAddressSpace> = FakeAddressSpace::new(0);
    let manager = f(VfioManagerBuilder::new(host.clone(), space.clone()))
        .build()
        .unwrap();
    Machine {
        host,
        manager,
        space,
    }
}

fn is_open_container(c: &HostCall) -> bool {
    matches!(c, HostCall::OpenContainer { .. })
}

#[test]
fn devices_of_one_group_share_a_container() {
    let m = machine();
    m.host.add_group(7);
    m.host.add_device(7, "0000:00:01.0", FakeDevice::new(0, 0));
    m.host.add_device(7, "0000:00:01.1", FakeDevice::new(0, 0));

    let a = m.manager.attach_device(7, "0000:00:01.0", &m.space).unwrap();
    let b = m.manager.attach_device(7, "0000:00:01.1", &m.space).unwrap();

    assert_eq!(m.host.count_calls(is_open_container), 1);
    assert_eq!(m.host.count_calls(|c| matches!(c, HostCall::OpenGroup { .. })), 1);
    assert_eq!(m.manager.groups().len(), 1);
    assert_eq!(m.manager.find_group(7).unwrap().device_count(), 2);
    assert_eq!(m.manager.containers(AddressSpaceId(0)).len(), 1);
    assert_eq!(a.group_id(), b.group_id());
}

#[test]
fn groups_in_one_space_share_a_container() {
    let m = machine();
    m.host.add_group(1);
    m.host.add_group(2);

    let g1 = m.manager.get_group(1, &m.space).unwrap();
    let g2 = m.manager.get_group(2, &m.space).unwrap();

    let containers = m.manager.containers(AddressSpaceId(0));
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].group_ids(), vec![1, 2]);
    assert!(Arc::ptr_eq(&g1.container().unwrap(), &g2.container().unwrap()));
    assert_eq!(m.host.open_container_count(), 1);
}

#[test]
fn isolated_group_gets_its_own_container() {
    let m = machine();
    m.host.add_group(1);
    m.host.add_group(2);
    m.host.isolate_group(2);

    m.manager.get_group(1, &m.space).unwrap();
    m.manager.get_group(2, &m.space).unwrap();

    assert_eq!(m.manager.containers(AddressSpaceId(0)).len(), 2);
    assert_eq!(m.host.open_container_count(), 2);
    assert_ne!(m.host.group_container(1), m.host.group_container(2));
}

#[test]
fn groups_in_different_spaces_get_different_containers() {
    let m = machine();
    m.host.add_group(1);
    m.host.add_group(2);
    let other: Arc<dyn GuestAddressSpace> = FakeAddressSpace::new(5);

    m.manager.get_group(1, &m.space).unwrap();
    m.manager.get_group(2, &other).unwrap();

    assert_eq!(m.manager.address_space_count(), 2);
    assert_eq!(m.manager.containers(AddressSpaceId(0)).len(), 1);
    assert_eq!(m.manager.containers(AddressSpaceId(5)).len(), 1);
}

#[test]
fn group_in_second_space_is_rejected() {
    let m = machine();
    m.host.add_group(3);
    let other: Arc<dyn GuestAddressSpace> = FakeAddressSpace::new(1);

    let first = m.manager.get_group(3, &m.space).unwrap();
    let again = m.manager.get_group(3, &m.space).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let err = m.manager.get_group(3, &other).unwrap_err();
    assert_eq!(err, VfioError::AddressSpaceConflict { group_id: 3 });
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.errno(), libc::EINVAL);
    assert!(!m.manager.has_address_space(AddressSpaceId(1)));
    assert_eq!(m.host.count_calls(|c| matches!(c, HostCall::OpenGroup { .. })), 1);
}

#[test]
fn non_viable_group_leaves_nothing_behind() {
    let m = machine();
    m.host.add_group(4);
    m.host.set_viable(4, false);

    let err = m.manager.get_group(4, &m.space).unwrap_err();
    assert_eq!(err, VfioError::GroupNotViable(4));
    assert_eq!(err.errno(), libc::EPERM);

    assert!(m.manager.groups().is_empty());
    assert_eq!(m.manager.address_space_count(), 0);
    assert_eq!(m.host.count_calls(is_open_container), 0);
    assert_eq!(
        m.host.calls(),
        vec![
            HostCall::OpenGroup { group_id: 4 },
            HostCall::CloseGroup { group_id: 4 },
        ]
    );
}

#[test]
fn unknown_group_fails_to_open() {
    let m = machine();
    let err = m.manager.get_group(11, &m.space).unwrap_err();
    assert!(matches!(err, VfioError::OpenGroup { group_id: 11, .. }));
    assert_eq!(err.errno(), libc::ENOENT);
    assert_eq!(m.manager.address_space_count(), 0);
}

#[test]
fn unsupported_api_version_releases_everything() {
    let m = machine();
    m.host.add_group(1);
    m.host.set_api_version(1);

    let err = m.manager.get_group(1, &m.space).unwrap_err();
    assert_eq!(err, VfioError::ApiVersion(1));
    assert_eq!(m.host.open_container_count(), 0);
    assert_eq!(m.manager.address_space_count(), 0);
    assert!(m.manager.groups().is_empty());
}

#[test]
fn no_iommu_model_fails_without_joining() {
    let m = machine();
    m.host.add_group(1);
    m.host.set_extensions(&[]);

    let err = m.manager.get_group(1, &m.space).unwrap_err();
    assert_eq!(err, VfioError::NoIommuModel);
    assert_eq!(m.host.count_calls(|c| matches!(c, HostCall::SetContainer { .. })), 0);
    assert_eq!(m.host.open_container_count(), 0);
}

#[test]
fn missing_device_releases_the_group() {
    let m = machine();
    m.host.add_group(2);

    let err = m.manager.attach_device(2, "missing", &m.space).unwrap_err();
    assert!(matches!(err, VfioError::GetDevice { group_id: 2, .. }));
    assert!(m.manager.groups().is_empty());
    assert_eq!(m.manager.address_space_count(), 0);
    assert_eq!(m.host.open_container_count(), 0);
}

#[test]
fn handles_describe_themselves() {
    let m = machine();
    m.host.add_group(3);
    m.host.add_device(3, "0000:00:03.0", FakeDevice::new(0, 0));

    let device = m.manager.attach_device(3, "0000:00:03.0", &m.space).unwrap();
    let group = m.manager.find_group(3).unwrap();
    let container = m.manager.containers(AddressSpaceId(0)).remove(0);

    assert!(format!("{:?}", device).contains("0000:00:03.0"));
    assert!(format!("{:?}", group).contains("id: 3"));
    assert!(format!("{:?}", container).contains("AddressSpaceId(0)"));
    // Failed lookups can be unwrapped as errors.
    let err = m.manager.get_group(9, &m.space).unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[test]
fn teardown_cascades_and_is_idempotent() {
    let m = machine();
    m.host.add_group(9);
    m.host.add_device(9, "dev", FakeDevice::new(0, 0));

    let device = m.manager.attach_device(9, "dev", &m.space).unwrap();
    let group = m.manager.find_group(9).unwrap();
    let container = group.container().unwrap();

    m.manager.detach_device(&device);
    assert!(device.is_released());
    assert!(group.is_released());
    assert!(container.is_closed());
    assert!(m.manager.groups().is_empty());
    assert_eq!(m.manager.address_space_count(), 0);
    assert_eq!(m.host.open_container_count(), 0);

    let calls = m.host.calls();
    m.manager.detach_device(&device);
    m.manager.put_group(&group);
    assert_eq!(m.host.calls(), calls);

    let closes = |c: &HostCall| {
        matches!(
            c,
            HostCall::CloseContainer { .. }
                | HostCall::CloseGroup { .. }
                | HostCall::CloseDevice { .. }
        )
    };
    assert_eq!(m.host.count_calls(closes), 3);
}

#[test]
fn group_with_devices_is_kept() {
    let m = machine();
    m.host.add_group(1);
    m.host.add_device(1, "a", FakeDevice::new(0, 0));
    m.host.add_device(1, "b", FakeDevice::new(0, 0));

    let a = m.manager.attach_device(1, "a", &m.space).unwrap();
    let b = m.manager.attach_device(1, "b", &m.space).unwrap();

    m.manager.detach_device(&a);
    assert_eq!(m.manager.groups().len(), 1);
    assert_eq!(m.host.open_container_count(), 1);

    m.manager.detach_device(&b);
    assert!(m.manager.groups().is_empty());
    assert_eq!(m.host.open_container_count(), 0);
}

#[test]
fn shared_container_survives_first_group() {
    let m = machine();
    m.host.add_group(1);
    m.host.add_group(2);
    let g1 = m.manager.get_group(1, &m.space).unwrap();
    let g2 = m.manager.get_group(2, &m.space).unwrap();
    let container = g1.container().unwrap();

    m.manager.put_group(&g1);
    assert!(!container.is_closed());
    assert_eq!(container.group_ids(), vec![2]);
    assert!(m.host.calls().contains(&HostCall::UnsetContainer { group_id: 1 }));

    m.manager.put_group(&g2);
    assert!(container.is_closed());
    assert_eq!(m.manager.address_space_count(), 0);
}

#[test]
fn accel_channel_tracks_groups() {
    let accel = FakeAccel::new();
    let m = machine_with(|b| b.accel(accel.clone()));
    m.host.add_group(1);
    m.host.add_group(2);

    let g1 = m.manager.get_group(1, &m.space).unwrap();
    let g2 = m.manager.get_group(2, &m.space).unwrap();
    let fd1 = g1.raw_descriptor().unwrap();
    let fd2 = g2.raw_descriptor().unwrap();
    m.manager.put_group(&g1);

    assert_eq!(
        accel.events(),
        vec![
            AccelEvent::Created,
            AccelEvent::AddGroup(fd1),
            AccelEvent::AddGroup(fd2),
            AccelEvent::DelGroup(fd1),
        ]
    );
}

#[test]
fn accel_failure_does_not_fail_attach() {
    let accel = FakeAccel::new();
    accel.set_fail_create(true);
    let m = machine_with(|b| b.accel(accel.clone()));
    m.host.add_group(1);

    m.manager.get_group(1, &m.space).unwrap();
    assert!(accel.events().is_empty());
}

#[test]
fn reset_handler_follows_first_and_last_group() {
    let registrar = FakeResetRegistrar::new();
    let m = machine_with(|b| b.reset_registrar(registrar.clone()));
    m.host.add_group(1);
    m.host.add_group(2);

    let g1 = m.manager.get_group(1, &m.space).unwrap();
    assert_eq!(registrar.handler_count(), 1);
    let g2 = m.manager.get_group(2, &m.space).unwrap();
    assert_eq!(registrar.handler_count(), 1);

    m.manager.put_group(&g1);
    assert_eq!(registrar.handler_count(), 1);
    m.manager.put_group(&g2);
    assert_eq!(registrar.handler_count(), 0);
}

#[test]
fn system_reset_resets_capable_devices() {
    let registrar = FakeResetRegistrar::new();
    let m = machine_with(|b| b.reset_registrar(registrar.clone()));
    m.host.add_group(1);
    m.host
        .add_device(1, "resettable", FakeDevice::new(VFIO_DEVICE_FLAGS_RESET, 0));
    m.host.add_device(1, "plain", FakeDevice::new(0, 0));
    let resettable = m.manager.attach_device(1, "resettable", &m.space).unwrap();
    let plain = m.manager.attach_device(1, "plain", &m.space).unwrap();

    registrar.trigger();

    let resets: Vec<_> = m
        .host
        .calls()
        .into_iter()
        .filter(|c| matches!(c, HostCall::ResetDevice { .. }))
        .collect();
    assert_eq!(
        resets,
        vec![HostCall::ResetDevice {
            name: "resettable".to_owned()
        }]
    );
    assert!(!resettable.needs_reset());
    assert!(!plain.needs_reset());
}

#[test]
fn invalid_page_size_is_rejected() {
    let host = FakeHost::new();
    let space: Arc<dyn GuestAddressSpace> = FakeAddressSpace::new(0);
    let options = vfio_host::VfioOptions {
        target_page_size: 3000,
        ..Default::default()
    };
    let err = VfioManagerBuilder::new(host, space)
        .options(options)
        .build()
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
