// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::convert::TryInto;
use std::fmt;
use std::fmt::Display;
use std::io;

use thiserror::Error;

/// A host error code, as left in errno by a failed libc call or ioctl.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SysError(i32);

impl SysError {
    /// Constructs a new error with the given error number.
    pub fn new<T: TryInto<i32>>(e: T) -> SysError {
        // A value outside the bounds of an i32 will never be a valid errno.
        SysError(e.try_into().unwrap_or_default())
    }

    /// Constructs an error from the most recent system error.
    ///
    /// The result of this only has any meaning just after a libc call that returned a value
    /// indicating errno was set.
    pub fn last() -> SysError {
        SysError(io::Error::last_os_error().raw_os_error().unwrap_or_default())
    }

    /// Gets the errno for this error.
    pub fn errno(self) -> i32 {
        self.0
    }
}

impl From<io::Error> for SysError {
    fn from(e: io::Error) -> Self {
        SysError(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<SysError> for io::Error {
    fn from(e: SysError) -> io::Error {
        io::Error::from_raw_os_error(e.0)
    }
}

impl Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Into::<io::Error>::into(*self).fmt(f)
    }
}

/// Returns the last errno as a Result that is always an error.
pub fn errno_result<T>() -> std::result::Result<T, SysError> {
    Err(SysError::last())
}
