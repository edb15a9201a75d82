// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod kvm;
mod vfio;

pub use kvm::KvmVfioProvider;
pub use vfio::LinuxVfioHost;
