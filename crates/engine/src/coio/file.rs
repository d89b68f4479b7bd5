// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use aosl_core::helpers::lock;
use aosl_core::{AoslError, Result};
use tokio_util::sync::CancellationToken;

use super::{attach, spawn_io, CoDevice, CoFd, CoOp, Completion};

/// A regular file. Reads and writes always defer to a blocking thread of the
/// I/O runtime; seeks complete inline.
pub struct CoFile {
    file: Mutex<File>,
}

impl CoFile {
    /// Opens an existing file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns the open error.
    pub fn open(path: impl AsRef<Path>) -> Result<CoFd> {
        Self::open_with(path, OpenOptions::new().read(true).write(true))
    }

    /// Creates (or truncates) a file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns the open error.
    pub fn create(path: impl AsRef<Path>) -> Result<CoFd> {
        Self::open_with(path, OpenOptions::new().read(true).write(true).create(true).truncate(true))
    }

    /// # Errors
    ///
    /// Returns the open error.
    pub fn open_with(path: impl AsRef<Path>, options: &OpenOptions) -> Result<CoFd> {
        let file = options.open(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "file opened");
        attach(Self { file: Mutex::new(file) })
    }

    fn run_blocking(&self, op: &CoOp) -> Result<usize> {
        let mut file = lock(&self.file);
        match op {
            CoOp::Read { buf } | CoOp::Recv { buf, .. } => Ok(buf.with_slice_mut(|bytes| file.read(bytes))??),
            CoOp::Write { buf } | CoOp::Send { buf, .. } => Ok(buf.with_slice(|bytes| file.write(bytes))??),
            CoOp::Seek { pos } => {
                let offset = file.seek(*pos)?;
                usize::try_from(offset)
                    .map_err(|_| AoslError::InvalidArgument(format!("offset {offset} does not fit in usize")))
            },
            other => Err(other.unsupported("file")),
        }
    }
}

impl CoDevice for CoFile {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn try_io(&self, op: &CoOp) -> Result<Option<usize>> {
        match op {
            CoOp::Seek { .. } => self.run_blocking(op).map(Some),
            CoOp::Read { .. } | CoOp::Recv { .. } | CoOp::Write { .. } | CoOp::Send { .. } => Ok(None),
            other => Err(other.unsupported("file")),
        }
    }

    fn start_io(self: Arc<Self>, op: CoOp, done: Completion, cancel: CancellationToken) {
        spawn_io(cancel, done, async move {
            tokio::task::spawn_blocking(move || self.run_blocking(&op))
                .await
                .map_err(|err| AoslError::Io { kind: std::io::ErrorKind::Other, message: err.to_string() })?
        });
    }
}
