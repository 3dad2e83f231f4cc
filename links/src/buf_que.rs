// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Empty/full buffer queue pair.
//!
//! A producer takes a buffer from the empty queue, fills it and puts it on the
//! full queue; the consumer side drains the full queue and eventually returns
//! each buffer to the empty queue. For a pool-backed `BufQue` the sum of both
//! queues plus the buffers currently held outside is always the pool size.

use crate::{
    Result,
    buffer::{BufferId, BufferList, Payload, SystemBuffer},
    link_id::LinkId,
    que::{Que, QueStats, Timeout},
};

pub struct BufQue {
    owner: LinkId,
    que_id: u8,
    first_index: u16,
    pool_size: usize,
    empty: Que<SystemBuffer>,
    full: Que<SystemBuffer>,
}

impl BufQue {
    /// Creates an unpopulated pair with `capacity` slots on each side.
    ///
    /// Used by links that forward buffers they do not own.
    pub fn new(
        owner: LinkId,
        que_id: u8,
        capacity: usize,
        block_on_get: bool,
        block_on_put: bool,
    ) -> Result<Self> {
        Ok(Self {
            owner,
            que_id,
            first_index: 0,
            pool_size: 0,
            empty: Que::new(capacity, block_on_get, block_on_put)?,
            full: Que::new(capacity, block_on_get, block_on_put)?,
        })
    }

    /// Creates a pair whose empty queue is filled with `count` freshly
    /// allocated buffers.
    ///
    /// # Arguments
    ///
    /// * `owner` - Link owning the pool; stamped into every [`BufferId`]
    /// * `que_id` - Output queue of `owner` this pool feeds
    /// * `count` - Pool size
    /// * `block_on_get` - Whether `get_empty`/`get_full` may wait
    /// * `alloc` - Builds the payload for each slot
    /// * `release` - Takes back the payloads built so far if the pool
    ///   cannot be completed
    ///
    /// # Errors
    ///
    /// Propagates allocation failures from `alloc` and rejects an out of range
    /// `count`.
    pub fn with_pool(
        owner: LinkId,
        que_id: u8,
        count: usize,
        block_on_get: bool,
        alloc: impl FnMut(BufferId) -> Result<Payload>,
        release: impl FnMut(Payload),
    ) -> Result<Self> {
        Self::with_pool_at(owner, que_id, 0, count, block_on_get, alloc, release)
    }

    /// Like [`BufQue::with_pool`], numbering the pool from `first_index` so
    /// that several pools can feed one output queue.
    pub fn with_pool_at(
        owner: LinkId,
        que_id: u8,
        first_index: u16,
        count: usize,
        block_on_get: bool,
        mut alloc: impl FnMut(BufferId) -> Result<Payload>,
        mut release: impl FnMut(Payload),
    ) -> Result<Self> {
        let mut que = Self::new(owner, que_id, count, block_on_get, false)?;
        que.first_index = first_index;
        for index in 0..count {
            let id = BufferId {
                owner,
                que_id,
                index: first_index + index as u16,
            };
            let filled = alloc(id).and_then(|payload| {
                que.empty
                    .put(SystemBuffer::new(id, payload), Timeout::NoWait)
                    .map_err(|rejected| {
                        release(rejected.item.payload);
                        rejected.error
                    })
            });
            if let Err(err) = filled {
                tracing::warn!("{owner} queue {que_id}: pool failed after {index} of {count} buffers: {err}");
                for buffer in que.empty.drain() {
                    release(buffer.payload);
                }
                return Err(err);
            }
        }
        que.pool_size = count;
        tracing::debug!("{owner} queue {que_id}: pool of {count} buffers");
        Ok(que)
    }

    pub fn get_empty(&self, timeout: Timeout) -> Result<SystemBuffer> {
        self.empty.get(timeout)
    }

    pub fn put_empty(&self, buffer: SystemBuffer) -> Result<()> {
        self.put(&self.empty, buffer, "empty")
    }

    pub fn get_full(&self, timeout: Timeout) -> Result<SystemBuffer> {
        self.full.get(timeout)
    }

    pub fn put_full(&self, buffer: SystemBuffer) -> Result<()> {
        self.put(&self.full, buffer, "full")
    }

    /// Moves every full buffer that fits into `list` without waiting. Returns
    /// the number moved.
    pub fn get_full_list(&self, list: &mut BufferList) -> usize {
        let mut moved = 0;
        while !list.is_full() {
            match self.full.get(Timeout::NoWait) {
                Ok(buffer) => {
                    if let Err(buffer) = list.push(buffer) {
                        // list.is_full() was checked above
                        if let Err(rejected) = self.full.put(buffer, Timeout::NoWait) {
                            tracing::warn!(
                                "{} queue {}: lost buffer {}: {}",
                                self.owner,
                                self.que_id,
                                rejected.item.id(),
                                rejected.error
                            );
                        }
                        break;
                    }
                    moved += 1;
                }
                Err(_) => break,
            }
        }
        moved
    }

    /// Returns every buffer of `list` to the empty queue.
    pub fn put_empty_list(&self, list: BufferList) -> Result<()> {
        for buffer in list {
            self.put_empty(buffer)?;
        }
        Ok(())
    }

    /// Whether `buffer` came from this pool.
    pub fn owns(&self, buffer: &SystemBuffer) -> bool {
        let id = buffer.id();
        id.owner == self.owner
            && id.que_id == self.que_id
            && id.index >= self.first_index
            && ((id.index - self.first_index) as usize) < self.pool_size
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn empty_count(&self) -> usize {
        self.empty.len()
    }

    pub fn full_count(&self) -> usize {
        self.full.len()
    }

    /// Buffers of the pool currently outside both queues.
    pub fn held(&self) -> usize {
        self.pool_size
            .saturating_sub(self.empty.len() + self.full.len())
    }

    pub fn empty_stats(&self) -> QueStats {
        self.empty.stats()
    }

    pub fn full_stats(&self) -> QueStats {
        self.full.stats()
    }

    /// Removes everything still queued on the full side.
    pub fn drain_full(&self) -> Vec<SystemBuffer> {
        self.full.drain()
    }

    /// Hands every queued buffer's payload to `release` and shuts the pair
    /// down. Buffers held outside the queues are not touched.
    pub fn release_pool(&self, mut release: impl FnMut(Payload)) {
        for buffer in self.full.drain().into_iter().chain(self.empty.drain()) {
            release(buffer.payload);
        }
        self.shutdown();
    }

    /// Unblocks waiters on both sides; used when the owning link is deleted.
    pub fn shutdown(&self) {
        self.empty.shutdown();
        self.full.shutdown();
    }

    fn put(&self, que: &Que<SystemBuffer>, buffer: SystemBuffer, side: &str) -> Result<()> {
        que.put(buffer, Timeout::NoWait).map_err(|rejected| {
            tracing::error!(
                "{} queue {}: {side} queue rejected buffer {}: {}",
                self.owner,
                self.que_id,
                rejected.item.id(),
                rejected.error
            );
            rejected.error
        })
    }
}
