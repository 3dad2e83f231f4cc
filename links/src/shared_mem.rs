// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The shared memory region visible to every processor.
//!
//! Payload memory is handed out as [`SharedBlock`]s, each addressed by a 32-bit
//! handle. The handle plays the role of a physical address: it is what crosses
//! an IPC ring, and the receiving side resolves it back to the block through
//! [`SharedHeap::get`]. IPC rings live in [`SharedRegion`]s, plain arrays of
//! atomic words.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Error, Result};

/// A block of payload memory in the shared heap.
///
/// Cloning a block yields another view of the same memory.
#[derive(Clone)]
pub struct SharedBlock {
    handle: u32,
    data: Arc<RwLock<Vec<u8>>>,
}

impl SharedBlock {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

impl std::fmt::Debug for SharedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBlock")
            .field("handle", &format_args!("{:#010x}", self.handle))
            .field("len", &self.len())
            .finish()
    }
}

/// Fixed-size array of atomic words, the backing store of an IPC ring.
#[derive(Clone)]
pub struct SharedRegion {
    words: Arc<[AtomicU32]>,
}

impl SharedRegion {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub(crate) fn load(&self, index: usize, order: Ordering) -> u32 {
        self.words[index].load(order)
    }

    pub(crate) fn store(&self, index: usize, value: u32, order: Ordering) {
        self.words[index].store(value, order)
    }
}

struct HeapInner {
    next_handle: u32,
    used: usize,
    blocks: HashMap<u32, SharedBlock>,
}

/// Bump-counted allocator over the shared region.
///
/// The heap enforces a byte capacity across blocks and regions so that pool
/// sizing mistakes surface as [`Error::Alloc`] at link create time.
pub struct SharedHeap {
    capacity: usize,
    inner: Mutex<HeapInner>,
}

impl SharedHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HeapInner {
                next_handle: 1,
                used: 0,
                blocks: HashMap::new(),
            }),
        }
    }

    /// Allocates a zeroed block of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Alloc`] if the heap cannot hold another `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<SharedBlock> {
        let mut inner = self.inner.lock();
        self.reserve(&mut inner, size)?;
        let handle = inner.next_handle;
        inner.next_handle = inner.next_handle.wrapping_add(1).max(1);
        let block = SharedBlock {
            handle,
            data: Arc::new(RwLock::new(vec![0; size])),
        };
        inner.blocks.insert(handle, block.clone());
        Ok(block)
    }

    /// Resolves a handle received over an IPC ring.
    pub fn get(&self, handle: u32) -> Result<SharedBlock> {
        self.inner
            .lock()
            .blocks
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::InvalidParams(format!("Unknown shared block {handle:#010x}.")))
    }

    /// Returns a block's bytes to the heap. Outstanding clones keep the memory
    /// alive but the handle no longer resolves.
    pub fn free(&self, block: &SharedBlock) -> Result<()> {
        let mut inner = self.inner.lock();
        let removed = inner.blocks.remove(&block.handle).ok_or_else(|| {
            Error::InvalidParams(format!("Double free of shared block {:#010x}.", block.handle))
        })?;
        inner.used -= removed.len();
        Ok(())
    }

    /// Allocates a region of `words` atomic words for an IPC ring.
    pub fn alloc_region(&self, words: usize) -> Result<SharedRegion> {
        self.reserve(&mut self.inner.lock(), words * size_of::<u32>())?;
        Ok(SharedRegion::new(words))
    }

    pub fn free_region(&self, region: &SharedRegion) {
        let mut inner = self.inner.lock();
        inner.used = inner.used.saturating_sub(region.len() * size_of::<u32>());
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    fn reserve(&self, inner: &mut HeapInner, size: usize) -> Result<()> {
        if inner.used + size > self.capacity {
            return Err(Error::Alloc(format!(
                "shared heap exhausted: {size} bytes requested, {} of {} in use",
                inner.used, self.capacity
            )));
        }
        inner.used += size;
        Ok(())
    }
}
