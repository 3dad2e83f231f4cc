// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! IPC-In link: receiving half of an IPC pair.
//!
//! Descriptors read from the forward ring are turned back into buffers whose
//! payload resolves to the same shared heap blocks the sender used. When the
//! next link returns them, their slot numbers go back on the return ring and
//! the sender is told to release.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    ipc_out::{IPC_DESCRIPTOR_SIZE, IpcDescriptor, type_from_code},
    take_list,
};
use crate::{
    Error, Result, SystemContext,
    buffer::{
        Bitstream, BufferId, BufferList, BufferType, MetaData, Payload, SystemBuffer, VideoFrame,
    },
    ipc_que::{IpcQueReader, IpcQueWriter},
    link::{
        CMD_NEW_DATA, CMD_RELEASE_DATA, InQueParams, Link, LinkInfo, LinkStatistics,
        OutQueParams, peer_que_info,
    },
    link_id::{LinkId, LinkType},
    shared_mem::SharedHeap,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcInLinkParams {
    /// Must name the IPC-Out link feeding this one.
    pub in_que: InQueParams,
    pub out_que: OutQueParams,
}

struct IpcInState {
    forward: Option<IpcQueReader>,
    ret: Option<IpcQueWriter>,
    out_full: VecDeque<SystemBuffer>,
    /// Slots the return ring had no room for.
    unreturned: VecDeque<u32>,
    handed_out: usize,
    stats: LinkStatistics,
}

impl IpcInState {
    /// Pushes waiting slot numbers onto the return ring. Returns how many went.
    fn flush_returns(&mut self) -> usize {
        let Some(ret) = self.ret.as_mut() else {
            return 0;
        };
        let mut sent = 0;
        while let Some(&slot) = self.unreturned.front() {
            if ret.write(&slot.to_le_bytes()).is_err() {
                break;
            }
            self.unreturned.pop_front();
            sent += 1;
        }
        sent
    }
}

pub struct IpcInLink {
    id: LinkId,
    params: IpcInLinkParams,
    info: LinkInfo,
    state: Mutex<IpcInState>,
}

/// Rebuilds a buffer from a descriptor.
fn rebuild(heap: &SharedHeap, owner: LinkId, desc: &IpcDescriptor) -> Result<SystemBuffer> {
    let resolve = |handle: u32| match handle {
        0 => Ok(None),
        handle => heap.get(handle).map(Some),
    };
    let payload = match type_from_code(desc.buf_type) {
        Some(BufferType::VideoFrame) => Payload::VideoFrame(VideoFrame {
            planes: [resolve(desc.handles[0])?, resolve(desc.handles[1])?],
            offsets: [desc.offsets[0] as usize, desc.offsets[1] as usize],
            info: desc.info,
        }),
        Some(BufferType::Bitstream) => Payload::Bitstream(Bitstream {
            block: resolve(desc.handles[0])?,
            fill_length: desc.fill_length as usize,
        }),
        Some(BufferType::MetaData) => Payload::MetaData(MetaData {
            block: resolve(desc.handles[0])?,
            fill_length: desc.fill_length as usize,
        }),
        Some(BufferType::VideoFrameContainer) | None => {
            return Err(Error::InvalidParams(format!(
                "Descriptor of slot {} carries buffer type {}.",
                desc.slot, desc.buf_type
            )));
        }
    };
    let index = u16::try_from(desc.slot)
        .map_err(|_| Error::InvalidParams(format!("Slot {} out of range.", desc.slot)))?;
    let mut buffer = SystemBuffer::new(
        BufferId {
            owner,
            que_id: 0,
            index,
        },
        payload,
    );
    buffer.ch_num = desc.ch_num;
    buffer.src_timestamp = desc.src_timestamp;
    buffer.stamp_arrival();
    Ok(buffer)
}

impl IpcInLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: IpcInLinkParams) -> Result<Self> {
        let prev = params.in_que.prev_link_id;
        if prev.kind() != LinkType::IpcOut {
            return Err(Error::InvalidParams(format!(
                "{id} must be fed by an IPC-Out link, not {prev}."
            )));
        }
        let rings = sys.interconnect().take_rings(id)?;
        if rings.out_link != prev {
            let out_link = rings.out_link;
            sys.interconnect().offer_rings(id, rings)?;
            return Err(Error::InvalidParams(format!(
                "{id} is fed by {out_link}, not {prev}."
            )));
        }
        let que = match peer_que_info(sys, &params.in_que) {
            Ok(que) => que,
            Err(err) => {
                sys.interconnect().offer_rings(id, rings)?;
                return Err(err);
            }
        };
        tracing::debug!("[{id}] Attached to the rings of {prev}");
        Ok(Self {
            id,
            params,
            info: LinkInfo { queues: vec![que] },
            state: Mutex::new(IpcInState {
                forward: Some(rings.forward),
                ret: Some(rings.ret),
                out_full: VecDeque::new(),
                unreturned: VecDeque::new(),
                handed_out: 0,
                stats: LinkStatistics::default(),
            }),
        })
    }

    fn notify_prev(&self, sys: &SystemContext) -> Result<()> {
        sys.send_link_cmd(self.params.in_que.prev_link_id, CMD_RELEASE_DATA)
    }
}

impl Link for IpcInLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        self.info.clone()
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        let (received, returned) = {
            let mut state = self.state.lock();
            let returned = state.flush_returns();
            let mut received = 0;
            let mut element = [0u8; IPC_DESCRIPTOR_SIZE];
            loop {
                let read = match state.forward.as_mut() {
                    Some(forward) => forward.read(&mut element),
                    None => break,
                };
                if read.is_err() {
                    break;
                }
                let desc = IpcDescriptor::decode(&element);
                match rebuild(sys.heap(), self.id, &desc) {
                    Ok(buffer) => {
                        let ch = state.stats.ch(0, buffer.ch_num);
                        ch.recv += 1;
                        ch.out += 1;
                        state.out_full.push_back(buffer);
                        received += 1;
                    }
                    Err(err) => {
                        // hand the slot straight back so the sender can reuse it
                        tracing::warn!("[{}] {err}", self.id);
                        state.stats.in_buf_error_count += 1;
                        state.unreturned.push_back(desc.slot);
                    }
                }
            }
            (received, returned + state.flush_returns())
        };
        if returned > 0 {
            self.notify_prev(sys)?;
        }
        if received > 0 {
            sys.send_link_cmd(self.params.out_que.next_link, CMD_NEW_DATA)?;
        }
        Ok(())
    }

    fn get_full_buffers(&self, _sys: &SystemContext, que_id: u8) -> Result<BufferList> {
        if que_id != 0 {
            return Err(Error::InvalidParams(format!(
                "{} has no output queue {que_id}.",
                self.id
            )));
        }
        let mut state = self.state.lock();
        let list = take_list(&mut state.out_full);
        state.handed_out += list.len();
        Ok(list)
    }

    fn put_empty_buffers(&self, sys: &SystemContext, _que_id: u8, list: BufferList) -> Result<()> {
        let returned = {
            let mut state = self.state.lock();
            for buffer in list {
                let id = buffer.id();
                if id.owner != self.id {
                    state.stats.in_buf_error_count += 1;
                    tracing::error!("[{}] Foreign buffer {id} returned", self.id);
                    continue;
                }
                state.handed_out = state.handed_out.saturating_sub(1);
                state.unreturned.push_back(id.index as u32);
            }
            state.flush_returns()
        };
        if returned > 0 {
            self.notify_prev(sys)?;
        }
        Ok(())
    }

    fn release_data(&self, sys: &SystemContext) -> Result<()> {
        if self.state.lock().flush_returns() > 0 {
            self.notify_prev(sys)?;
        }
        Ok(())
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        let returned = {
            let mut state = self.state.lock();
            let queued: Vec<u32> = state
                .out_full
                .drain(..)
                .map(|buffer| buffer.id().index as u32)
                .collect();
            state.unreturned.extend(queued);
            let returned = state.flush_returns();
            if !state.unreturned.is_empty() || state.handed_out > 0 {
                tracing::warn!(
                    "[{}] Deleting with {} slots unreturned and {} buffers downstream",
                    self.id,
                    state.unreturned.len(),
                    state.handed_out
                );
            }
            state.forward.take();
            state.ret.take();
            returned
        };
        if returned > 0
            && let Err(err) = self.notify_prev(sys)
        {
            // the sender may already be gone
            tracing::debug!("[{}] Release notify not delivered: {err}", self.id);
        }
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats
            .counters
            .insert("unreturned".into(), state.unreturned.len() as u64);
        stats
    }

    fn pending_buffers(&self) -> usize {
        self.state.lock().handed_out
    }
}
