// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Options controlling how the manager reaches the host and lays out guest mappings.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::VfioError;

const DEFAULT_DEV_DIR: &str = "/dev/vfio";
const DEFAULT_TARGET_PAGE_SIZE: u64 = 4096;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct VfioOptions {
    /// Directory holding the container node (`vfio`) and the numbered group nodes.
    pub dev_dir: PathBuf,
    /// Guest page size. Guest memory sections are aligned to it before being mapped.
    pub target_page_size: u64,
    /// Never direct map device regions; every access goes through the slow path.
    pub no_mmap: bool,
}

impl Default for VfioOptions {
    fn default() -> Self {
        VfioOptions {
            dev_dir: PathBuf::from(DEFAULT_DEV_DIR),
            target_page_size: DEFAULT_TARGET_PAGE_SIZE,
            no_mmap: false,
        }
    }
}

impl VfioOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.target_page_size.is_power_of_two() {
            return Err(VfioError::InvalidOptions(format!(
                "target-page-size {:#x} is not a power of two",
                self.target_page_size
            )));
        }
        Ok(())
    }

    /// Mask clearing the in-page bits of a guest address.
    pub fn target_page_mask(&self) -> u64 {
        !(self.target_page_size - 1)
    }

    pub fn container_path(&self) -> PathBuf {
        self.dev_dir.join("vfio")
    }

    pub fn group_path(&self, group_id: u32) -> PathBuf {
        self.dev_dir.join(group_id.to_string())
    }
}
