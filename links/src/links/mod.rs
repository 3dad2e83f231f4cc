// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Link variants.
//!
//! | Kind       | Inputs | Outputs | Role                                          |
//! |------------|--------|---------|-----------------------------------------------|
//! | `Dup`      | 1      | 1..=6   | fan one stream out to several consumers       |
//! | `Merge`    | 1..=6  | 1       | fan several streams into one                  |
//! | `Select`   | 1      | 1..=4   | route channels to output queues               |
//! | `Split`    | 1      | 1       | cut each frame into vertical strips           |
//! | `Sync`     | 1      | 1       | group channels captured at the same time      |
//! | `Gate`     | 1      | 1       | runtime on/off switch                         |
//! | `Null`     | 1..=4  | 0       | sink, optionally dumping payloads             |
//! | `NullSrc`  | 0      | 1       | timed test source                             |
//! | `Save`     | 1      | 0       | sink that snapshots a frame on request        |
//! | `Alg`      | 1      | 0..=1   | runs an [`algorithm::AlgorithmPlugin`]        |
//! | `IpcOut`   | 1      | 1       | hands buffers to another processor            |
//! | `IpcIn`    | 1      | 1       | receives buffers from another processor       |
//! | `Endpoint` | 0..=1  | 0..=1   | bridge to application code                    |

use std::{collections::VecDeque, sync::Arc};

use crate::{
    Error, Result, SystemContext,
    buf_que::BufQue,
    buffer::{Bitstream, BufferList, BufferType, MetaData, Payload, SystemBuffer, VideoFrame},
    link::{CMD_NEW_DATA, ChInfo, InQueParams, Link},
    link_id::{LinkId, LinkType},
    que::QUE_MAX_ELEMENTS,
    shared_mem::SharedHeap,
};

pub mod algorithm;
pub mod dup;
pub mod endpoint;
pub mod gate;
pub mod ipc_in;
pub mod ipc_out;
pub mod merge;
pub mod null;
pub mod null_src;
pub mod save;
pub mod select;
pub mod split;
pub mod sync;

/// Kind and configuration of a link to create.
pub enum LinkCreateParams {
    Dup(dup::DupLinkParams),
    Merge(merge::MergeLinkParams),
    Select(select::SelectLinkParams),
    Split(split::SplitLinkParams),
    Sync(sync::SyncLinkParams),
    Gate(gate::GateLinkParams),
    Null(null::NullLinkParams),
    NullSrc(null_src::NullSrcLinkParams),
    Save(save::SaveLinkParams),
    Alg(algorithm::AlgorithmLinkParams),
    IpcOut(ipc_out::IpcOutLinkParams),
    IpcIn(ipc_in::IpcInLinkParams),
    Endpoint(endpoint::EndpointLinkParams),
}

impl LinkCreateParams {
    pub fn kind(&self) -> LinkType {
        match self {
            LinkCreateParams::Dup(_) => LinkType::Dup,
            LinkCreateParams::Merge(_) => LinkType::Merge,
            LinkCreateParams::Select(_) => LinkType::Select,
            LinkCreateParams::Split(_) => LinkType::Split,
            LinkCreateParams::Sync(_) => LinkType::Sync,
            LinkCreateParams::Gate(_) => LinkType::Gate,
            LinkCreateParams::Null(_) => LinkType::Null,
            LinkCreateParams::NullSrc(_) => LinkType::NullSrc,
            LinkCreateParams::Save(_) => LinkType::Save,
            LinkCreateParams::Alg(_) => LinkType::Alg,
            LinkCreateParams::IpcOut(_) => LinkType::IpcOut,
            LinkCreateParams::IpcIn(_) => LinkType::IpcIn,
            LinkCreateParams::Endpoint(_) => LinkType::Endpoint,
        }
    }

    /// Input queues, i.e. the edges from the links this one reads from.
    pub fn input_queues(&self) -> Vec<InQueParams> {
        match self {
            LinkCreateParams::Dup(p) => vec![p.in_que],
            LinkCreateParams::Merge(p) => p.in_queues.clone(),
            LinkCreateParams::Select(p) => vec![p.in_que],
            LinkCreateParams::Split(p) => vec![p.in_que],
            LinkCreateParams::Sync(p) => vec![p.in_que],
            // a gate bound to a link created later imposes no ordering
            LinkCreateParams::Gate(p) if !p.prev_link_is_created => Vec::new(),
            LinkCreateParams::Gate(p) => vec![p.in_que],
            LinkCreateParams::Null(p) => p.in_queues.clone(),
            LinkCreateParams::NullSrc(_) => Vec::new(),
            LinkCreateParams::Save(p) => vec![p.in_que],
            LinkCreateParams::Alg(p) => vec![p.in_que],
            LinkCreateParams::IpcOut(p) => vec![p.in_que],
            LinkCreateParams::IpcIn(p) => vec![p.in_que],
            LinkCreateParams::Endpoint(p) => p.in_que().into_iter().collect(),
        }
    }

    /// Every link read from, including a gate's late-bound input.
    pub fn sources(&self) -> Vec<InQueParams> {
        match self {
            LinkCreateParams::Gate(p) => vec![p.in_que],
            other => other.input_queues(),
        }
    }

    pub(crate) fn create(self, sys: &SystemContext, id: LinkId) -> Result<Arc<dyn Link>> {
        if id.kind() != self.kind() {
            return Err(Error::InvalidParams(format!(
                "{id} cannot be created with {} parameters.",
                self.kind()
            )));
        }
        let link: Arc<dyn Link> = match self {
            LinkCreateParams::Dup(p) => Arc::new(dup::DupLink::create(sys, id, p)?),
            LinkCreateParams::Merge(p) => Arc::new(merge::MergeLink::create(sys, id, p)?),
            LinkCreateParams::Select(p) => Arc::new(select::SelectLink::create(sys, id, p)?),
            LinkCreateParams::Split(p) => Arc::new(split::SplitLink::create(sys, id, p)?),
            LinkCreateParams::Sync(p) => Arc::new(sync::SyncLink::create(sys, id, p)?),
            LinkCreateParams::Gate(p) => Arc::new(gate::GateLink::create(sys, id, p)?),
            LinkCreateParams::Null(p) => Arc::new(null::NullLink::create(sys, id, p)?),
            LinkCreateParams::NullSrc(p) => Arc::new(null_src::NullSrcLink::create(sys, id, p)?),
            LinkCreateParams::Save(p) => Arc::new(save::SaveLink::create(sys, id, p)?),
            LinkCreateParams::Alg(p) => Arc::new(algorithm::AlgorithmLink::create(sys, id, p)?),
            LinkCreateParams::IpcOut(p) => Arc::new(ipc_out::IpcOutLink::create(sys, id, p)?),
            LinkCreateParams::IpcIn(p) => Arc::new(ipc_in::IpcInLink::create(sys, id, p)?),
            LinkCreateParams::Endpoint(p) => Arc::new(endpoint::EndpointLink::create(sys, id, p)?),
        };
        Ok(link)
    }
}

/// Returns `buffers` to the link feeding `in_que`, in list-sized batches.
pub(crate) fn release_upstream(
    sys: &SystemContext,
    owner: LinkId,
    in_que: &InQueParams,
    buffers: Vec<SystemBuffer>,
) {
    let mut buffers = buffers.into_iter().peekable();
    while buffers.peek().is_some() {
        let mut list = BufferList::new();
        while !list.is_full() {
            let Some(buffer) = buffers.next() else { break };
            if let Err(buffer) = list.push(buffer) {
                tracing::error!("[{owner}] Lost buffer {} on release", buffer.id());
            }
        }
        let count = list.len();
        if let Err(err) =
            sys.put_links_empty_buffers(in_que.prev_link_id, in_que.prev_link_que_id, list)
        {
            tracing::error!(
                "[{owner}] Could not return {count} buffers to {}: {err}",
                in_que.prev_link_id
            );
        }
    }
}

/// Sends NEW_DATA to every link in `next`. A failing consumer does not keep
/// the others from being notified; the first error is returned.
pub(crate) fn notify_all(
    sys: &SystemContext,
    id: LinkId,
    next: impl IntoIterator<Item = LinkId>,
) -> Result<()> {
    let mut first = None;
    for next_link in next {
        if let Err(err) = sys.send_link_cmd(next_link, CMD_NEW_DATA) {
            tracing::warn!("[{id}] Notifying {next_link} failed: {err}");
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Moves up to one list's worth of buffers from the front of `queue`.
pub(crate) fn take_list(queue: &mut VecDeque<SystemBuffer>) -> BufferList {
    let mut list = BufferList::new();
    while !list.is_full() {
        let Some(buffer) = queue.pop_front() else { break };
        if let Err(buffer) = list.push(buffer) {
            queue.push_front(buffer);
            break;
        }
    }
    list
}

/// Allocates the payload of one buffer of channel `ch` from the shared heap.
pub(crate) fn alloc_payload(heap: &SharedHeap, ch: &ChInfo) -> Result<Payload> {
    Ok(match ch.buf_type {
        BufferType::VideoFrame => {
            let sizes = ch.plane_sizes();
            let mut frame = VideoFrame {
                info: ch.frame_info(),
                ..Default::default()
            };
            for (plane, size) in sizes.into_iter().enumerate() {
                if size == 0 {
                    continue;
                }
                match heap.alloc(size) {
                    Ok(block) => frame.planes[plane] = Some(block),
                    Err(err) => {
                        free_payload(heap, &Payload::VideoFrame(frame));
                        return Err(err);
                    }
                }
            }
            Payload::VideoFrame(frame)
        }
        BufferType::Bitstream => Payload::Bitstream(Bitstream {
            block: Some(heap.alloc(ch.pitch[0] as usize)?),
            fill_length: 0,
        }),
        BufferType::MetaData => Payload::MetaData(MetaData {
            block: Some(heap.alloc(ch.pitch[0] as usize)?),
            fill_length: 0,
        }),
        BufferType::VideoFrameContainer => {
            return Err(Error::InvalidParams(
                "A source cannot produce container buffers.".into(),
            ));
        }
    })
}

/// Returns a payload's blocks to the shared heap.
pub(crate) fn free_payload(heap: &SharedHeap, payload: &Payload) {
    let blocks: Vec<_> = match payload {
        Payload::VideoFrame(frame) => frame.planes.iter().flatten().collect(),
        Payload::Bitstream(Bitstream { block, .. }) | Payload::MetaData(MetaData { block, .. }) => {
            block.iter().collect()
        }
        Payload::Composite(_) => Vec::new(),
    };
    for block in blocks {
        if let Err(err) = heap.free(block) {
            tracing::warn!("Freeing block {}: {err}", block.handle());
        }
    }
}

/// Allocates one pool of `num_buffers` per channel, numbered `ch * num_buffers`
/// onwards on output queue 0. On failure nothing stays allocated.
pub(crate) fn alloc_pools(
    heap: &SharedHeap,
    id: LinkId,
    channels: &[ChInfo],
    num_buffers: usize,
    block_on_get: bool,
) -> Result<Vec<BufQue>> {
    let mut pools = Vec::with_capacity(channels.len());
    for (ch, info) in channels.iter().enumerate() {
        let pool = BufQue::with_pool_at(
            id,
            0,
            (ch * num_buffers) as u16,
            num_buffers,
            block_on_get,
            |_| alloc_payload(heap, info),
            |payload| free_payload(heap, &payload),
        );
        match pool {
            Ok(pool) => pools.push(pool),
            Err(err) => {
                free_pools(heap, &pools);
                return Err(err);
            }
        }
    }
    Ok(pools)
}

/// Frees every queued buffer of `pools` and shuts them down.
pub(crate) fn free_pools(heap: &SharedHeap, pools: &[BufQue]) {
    for pool in pools {
        pool.release_pool(|payload| free_payload(heap, &payload));
    }
}

/// Checks the number of queues in a create request.
pub(crate) fn check_count(what: &str, count: usize, max: usize) -> Result<()> {
    if count == 0 || count > max {
        return Err(Error::InvalidParams(format!(
            "{count} {what} requested, 1..={max} supported."
        )));
    }
    Ok(())
}

struct Held {
    original: SystemBuffer,
    in_que: u8,
    remaining: usize,
}

/// Originals of buffers that were fanned out as shadow descriptors.
///
/// A shadow's [`crate::BufferId::index`] is its slot here; the original is
/// handed back once every shadow of the slot has been released.
pub(crate) struct ShadowTable {
    slots: Vec<Option<Held>>,
    free: Vec<u16>,
    live: usize,
}

impl ShadowTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Stores an original that `shadows` descriptors now refer to.
    pub(crate) fn insert(
        &mut self,
        original: SystemBuffer,
        in_que: u8,
        shadows: usize,
    ) -> core::result::Result<u16, SystemBuffer> {
        let held = Held {
            original,
            in_que,
            remaining: shadows,
        };
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None if self.slots.len() < QUE_MAX_ELEMENTS => {
                self.slots.push(None);
                (self.slots.len() - 1) as u16
            }
            None => return Err(held.original),
        };
        self.slots[slot as usize] = Some(held);
        self.live += 1;
        Ok(slot)
    }

    pub(crate) fn original(&self, slot: u16) -> Option<&SystemBuffer> {
        self.slots
            .get(slot as usize)
            .and_then(|held| held.as_ref())
            .map(|held| &held.original)
    }

    /// Accounts for one released shadow. Returns the original and its input
    /// queue once the last shadow of the slot is back.
    pub(crate) fn release(&mut self, slot: u16) -> Result<Option<(u8, SystemBuffer)>> {
        let entry = self
            .slots
            .get_mut(slot as usize)
            .ok_or_else(|| Error::InvalidParams(format!("Unknown shadow slot {slot}.")))?;
        let held = entry
            .as_mut()
            .ok_or_else(|| Error::InvalidParams(format!("Shadow slot {slot} is not in use.")))?;
        held.remaining = held.remaining.saturating_sub(1);
        if held.remaining > 0 {
            return Ok(None);
        }
        let Some(held) = entry.take() else {
            return Ok(None);
        };
        self.free.push(slot);
        self.live -= 1;
        Ok(Some((held.in_que, held.original)))
    }

    /// Originals still waiting for shadows.
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Empties the table regardless of outstanding shadows.
    pub(crate) fn drain(&mut self) -> Vec<(u8, SystemBuffer)> {
        self.free.clear();
        self.live = 0;
        self.slots
            .drain(..)
            .flatten()
            .map(|held| (held.in_que, held.original))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ProcId,
        buffer::{BufferId, MetaData, Payload},
    };

    fn buffer(index: u16) -> SystemBuffer {
        SystemBuffer::new(
            BufferId {
                owner: LinkId::new(ProcId::Dsp1, LinkType::NullSrc, 0).unwrap(),
                que_id: 0,
                index,
            },
            Payload::MetaData(MetaData::default()),
        )
    }

    #[test]
    fn original_comes_back_after_last_shadow() {
        let mut table = ShadowTable::new();
        let slot = table.insert(buffer(7), 0, 3).unwrap();
        assert_eq!(table.original(slot).unwrap().id().index, 7);
        assert!(table.release(slot).unwrap().is_none());
        assert!(table.release(slot).unwrap().is_none());
        let (_, original) = table.release(slot).unwrap().unwrap();
        assert_eq!(original.id().index, 7);
        assert_eq!(table.len(), 0);
        assert!(table.release(slot).is_err());
    }

    #[test]
    fn slots_are_reused() {
        let mut table = ShadowTable::new();
        let a = table.insert(buffer(0), 0, 1).unwrap();
        table.release(a).unwrap();
        let b = table.insert(buffer(1), 0, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn half_allocated_frames_are_given_back() {
        let heap = SharedHeap::new(2500);
        let ch = ChInfo::video(crate::link::DataFormat::Yuv420Sp, 64, 32);
        assert!(matches!(alloc_payload(&heap, &ch), Err(Error::Alloc(_))));
        assert_eq!(heap.block_count(), 0);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn pools_unwind_when_a_later_channel_does_not_fit() {
        let heap = SharedHeap::new(100);
        let id = LinkId::new(ProcId::Dsp1, LinkType::NullSrc, 0).unwrap();
        let channels = [
            ChInfo::opaque(BufferType::MetaData, 16),
            ChInfo::opaque(BufferType::MetaData, 16),
        ];
        assert!(alloc_pools(&heap, id, &channels, 4, false).is_err());
        assert_eq!(heap.block_count(), 0);

        let pools = alloc_pools(&heap, id, &channels[..1], 4, false).unwrap();
        assert_eq!(heap.block_count(), 4);
        free_pools(&heap, &pools);
        assert_eq!(heap.block_count(), 0);
    }
}
