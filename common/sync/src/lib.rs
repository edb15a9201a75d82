// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! `Mutex` wraps the standard library version and mirrors its methods, except that `lock()` panics
//! where the standard library would return an Error. Release builds use panic=abort, so a panic
//! while a lock is held takes down the whole process and poison is never observed.
//!
//! `SnapshotCell` publishes immutable snapshots of shared bookkeeping. Readers take a reference
//! counted snapshot and keep using it after the cell is updated; writers build a new value and
//! swap it in.

mod mutex;
mod snapshot;

pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;
pub use crate::snapshot::SnapshotCell;
