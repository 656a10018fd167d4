//! Views over an instance's exported linear memory.
//!
//! A view borrows the instance (or the host call context), so it cannot
//! outlive it and the memory cannot be freed underneath it. Growing the
//! memory requires a [`MemoryViewMut`], which invalidates any outstanding
//! byte slices at compile time.

use wasmtime::{Memory, StoreContext, StoreContextMut};

use embed_runtime_common::MemoryError;

use crate::context::StoreState;

/// Size of a WebAssembly page in bytes.
pub const PAGE_SIZE: usize = 65_536;

/// Read-only view of an exported memory.
pub struct MemoryView<'a, T: 'static> {
    memory: Memory,
    store: StoreContext<'a, StoreState<T>>,
}

impl<'a, T: 'static> MemoryView<'a, T> {
    pub(crate) fn new(memory: Memory, store: StoreContext<'a, StoreState<T>>) -> Self {
        Self { memory, store }
    }

    /// The whole memory as bytes.
    pub fn data(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    /// Current size in bytes.
    pub fn data_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Current size in pages.
    pub fn pages(&self) -> u64 {
        self.memory.size(&self.store)
    }

    /// Bytes in `offset..offset + len`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfBounds`] if the range is not fully inside
    /// the memory.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], MemoryError> {
        let data = self.data();
        checked_range(offset, len, data.len()).map(|range| &data[range])
    }
}

/// Mutable view of an exported memory.
pub struct MemoryViewMut<'a, T: 'static> {
    memory: Memory,
    store: StoreContextMut<'a, StoreState<T>>,
}

impl<'a, T: 'static> MemoryViewMut<'a, T> {
    pub(crate) fn new(memory: Memory, store: StoreContextMut<'a, StoreState<T>>) -> Self {
        Self { memory, store }
    }

    pub fn data(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }

    pub fn data_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    pub fn pages(&self) -> u64 {
        self.memory.size(&self.store)
    }

    /// Bytes in `offset..offset + len`.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], MemoryError> {
        let data = self.data();
        checked_range(offset, len, data.len()).map(|range| &data[range])
    }

    /// Copy `bytes` into the memory at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfBounds`] without writing anything if the
    /// bytes do not fit.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let data = self.data_mut();
        let range = checked_range(offset, bytes.len(), data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Grow the memory by `pages`, returning the previous size in pages.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Grow`] if the maximum would be exceeded or the
    /// allocation fails.
    pub fn grow(&mut self, pages: u64) -> Result<u64, MemoryError> {
        self.memory
            .grow(&mut self.store, pages)
            .map_err(|e| MemoryError::Grow {
                pages,
                reason: format!("{e:#}"),
            })
    }
}

fn checked_range(
    offset: usize,
    len: usize,
    size: usize,
) -> Result<std::ops::Range<usize>, MemoryError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(MemoryError::OutOfBounds { offset, len, size }),
    }
}

impl<T: 'static> std::fmt::Debug for MemoryView<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryView")
            .field("data_size", &self.data_size())
            .finish()
    }
}

impl<T: 'static> std::fmt::Debug for MemoryViewMut<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryViewMut")
            .field("data_size", &self.data_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range(0, 4, 4).unwrap(), 0..4);
        assert_eq!(checked_range(4, 0, 4).unwrap(), 4..4);
        assert!(checked_range(3, 2, 4).is_err());
        assert!(matches!(
            checked_range(usize::MAX, 2, 4),
            Err(MemoryError::OutOfBounds { size: 4, .. })
        ));
    }
}
