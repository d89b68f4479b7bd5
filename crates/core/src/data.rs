// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared data objects passed between issuers and completions.
//!
//! An asynchronous operation keeps a clone of every data object it was given
//! until its completion has been delivered, so buffers stay valid across the
//! suspension without any extra bookkeeping by the caller.

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::error::{AoslError, Result};
use crate::helpers::lock;

/// Reference-counted byte buffer.
#[derive(Clone, Default)]
pub struct Data {
    inner: Arc<Mutex<BytesMut>>,
}

impl Data {
    /// A buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(BytesMut::zeroed(len))) }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self { inner: Arc::new(Mutex::new(BytesMut::from(bytes))) }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&lock(&self.inner))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut lock(&self.inner))
    }

    /// Resizes the buffer, zero-filling any new tail.
    pub fn resize(&self, len: usize) {
        lock(&self.inner).resize(len, 0);
    }

    /// Copies the current contents out.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&lock(&self.inner))
    }

    /// Number of live handles to this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_slice(&bytes)
    }
}

impl From<&str> for Data {
    fn from(text: &str) -> Self {
        Self::from_slice(text.as_bytes())
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data").field("len", &self.len()).finish()
    }
}

/// A window into a [`Data`] buffer. `len: None` means "to the end".
#[derive(Clone, Debug)]
pub struct BufRegion {
    data: Data,
    offset: usize,
    len: Option<usize>,
}

impl BufRegion {
    pub const fn new(data: Data, offset: usize, len: Option<usize>) -> Self {
        Self { data, offset, len }
    }

    pub const fn whole(data: Data) -> Self {
        Self::new(data, 0, None)
    }

    pub const fn data(&self) -> &Data {
        &self.data
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Byte range this region covers in the current buffer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the region falls outside the buffer.
    pub fn resolve(&self) -> Result<Range<usize>> {
        resolve_range(self.offset, self.len, self.data.len())
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` when the region falls outside the buffer.
    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.data.with(|buf| {
            let range = resolve_range(self.offset, self.len, buf.len())?;
            Ok(f(&buf[range]))
        })
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` when the region falls outside the buffer.
    pub fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.data.with_mut(|buf| {
            let range = resolve_range(self.offset, self.len, buf.len())?;
            Ok(f(&mut buf[range]))
        })
    }
}

fn resolve_range(offset: usize, len: Option<usize>, total: usize) -> Result<Range<usize>> {
    if offset > total {
        return Err(AoslError::InvalidArgument(format!(
            "offset {offset} beyond buffer of {total} bytes"
        )));
    }
    let end = match len {
        None => total,
        Some(len) => offset
            .checked_add(len)
            .filter(|end| *end <= total)
            .ok_or_else(|| {
                AoslError::InvalidArgument(format!(
                    "region {offset}+{len} beyond buffer of {total} bytes"
                ))
            })?,
    };
    Ok(offset..end)
}

/// Shared single-value cell written by an operation and read by its issuer.
pub struct Slot<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(None)) }
    }

    pub fn set(&self, value: T) {
        *lock(&self.inner) = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        lock(&self.inner).take()
    }

    pub fn is_set(&self) -> bool {
        lock(&self.inner).is_some()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Option<T>) -> R) -> R {
        f(&mut lock(&self.inner))
    }
}

impl<T: Clone> Slot<T> {
    pub fn get(&self) -> Option<T> {
        lock(&self.inner).clone()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&*lock(&self.inner)).finish()
    }
}

/// Slot receiving an operation's byte count.
pub type RetSlot = Slot<usize>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rest_of_buffer() {
        let data = Data::from("hello world");
        let region = BufRegion::new(data.clone(), 6, None);
        assert_eq!(region.resolve().unwrap(), 6..11);
        assert_eq!(region.with_slice(<[u8]>::to_vec).unwrap(), b"world");

        region.with_slice_mut(|buf| buf.make_ascii_uppercase()).unwrap();
        assert_eq!(&data.to_bytes()[..], b"hello WORLD");
    }

    #[test]
    fn test_region_bounds_are_checked() {
        let data = Data::zeroed(4);
        assert!(BufRegion::new(data.clone(), 5, None).resolve().is_err());
        assert!(BufRegion::new(data.clone(), 2, Some(3)).resolve().is_err());
        assert!(BufRegion::new(data.clone(), 4, None).resolve().unwrap().is_empty());
        assert_eq!(BufRegion::new(data, 1, Some(2)).resolve().unwrap(), 1..3);
    }

    #[test]
    fn test_slot_is_shared() {
        let slot: RetSlot = Slot::new();
        let writer = slot.clone();
        assert!(!slot.is_set());
        writer.set(42);
        assert_eq!(slot.get(), Some(42));
        assert_eq!(slot.take(), Some(42));
        assert!(!writer.is_set());
    }

    #[test]
    fn test_data_handles_track_clones() {
        let data = Data::zeroed(8);
        assert_eq!(data.handle_count(), 1);
        let region = BufRegion::whole(data.clone());
        assert_eq!(data.handle_count(), 2);
        drop(region);
        assert_eq!(data.handle_count(), 1);
        data.resize(16);
        assert_eq!(data.len(), 16);
    }
}
