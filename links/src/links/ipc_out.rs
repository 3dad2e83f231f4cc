// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! IPC-Out link: hands buffers to an IPC-In link, usually on another
//! processor.
//!
//! Two rings connect the pair. The forward ring carries fixed-size
//! descriptors naming the payload by shared heap handle; the return ring
//! carries the slot numbers of descriptors the far side is done with. The
//! original buffers stay here, indexed by slot, until their slot comes back.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::release_upstream;
use crate::{
    Error, Result, SystemContext,
    buffer::{Bitstream, BufferType, FrameInfo, MetaData, Payload, SystemBuffer},
    ipc_que::{IpcQue, IpcQueReader, IpcQueWriter},
    link::{
        CMD_NEW_DATA, CMD_RELEASE_DATA, InQueParams, Link, LinkInfo, LinkStatistics,
        OutQueParams, prev_que_info,
    },
    link_id::{LinkId, LinkType},
    que::QUE_MAX_ELEMENTS,
    shared_mem::SharedRegion,
    system::IpcRingEnds,
};

/// Bytes of one descriptor on the forward ring.
pub const IPC_DESCRIPTOR_SIZE: usize = 64;
/// Bytes of one slot number on the return ring.
const RETURN_ELEMENT_SIZE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcOutLinkParams {
    pub in_que: InQueParams,
    /// Must name an IPC-In link.
    pub out_que: OutQueParams,
    /// Ring capacity; the configured default when absent.
    #[serde(default)]
    pub num_elements: Option<u32>,
}

/// Buffer descriptor as it travels on the forward ring.
///
/// Word layout (little endian `u32`): slot, channel, type, flags,
/// timestamp low, timestamp high, fill length, then handle and offset of
/// each plane, width, height and the two pitches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IpcDescriptor {
    pub(crate) slot: u32,
    pub(crate) ch_num: u32,
    pub(crate) buf_type: u32,
    pub(crate) src_timestamp: u64,
    pub(crate) fill_length: u32,
    pub(crate) handles: [u32; 2],
    pub(crate) offsets: [u32; 2],
    pub(crate) info: FrameInfo,
}

fn type_code(buf_type: BufferType) -> u32 {
    match buf_type {
        BufferType::VideoFrame => 0,
        BufferType::Bitstream => 1,
        BufferType::MetaData => 2,
        BufferType::VideoFrameContainer => 3,
    }
}

pub(crate) fn type_from_code(code: u32) -> Option<BufferType> {
    match code {
        0 => Some(BufferType::VideoFrame),
        1 => Some(BufferType::Bitstream),
        2 => Some(BufferType::MetaData),
        3 => Some(BufferType::VideoFrameContainer),
        _ => None,
    }
}

impl IpcDescriptor {
    fn describe(slot: u32, buffer: &SystemBuffer) -> Result<Self> {
        let mut desc = IpcDescriptor {
            slot,
            ch_num: buffer.ch_num,
            buf_type: type_code(buffer.buf_type()),
            src_timestamp: buffer.src_timestamp,
            ..Default::default()
        };
        match &buffer.payload {
            Payload::VideoFrame(frame) => {
                for (plane, block) in frame.planes.iter().enumerate() {
                    if let Some(block) = block {
                        desc.handles[plane] = block.handle();
                        desc.offsets[plane] = frame.offsets[plane] as u32;
                    }
                }
                desc.info = frame.info;
            }
            Payload::Bitstream(Bitstream { block, fill_length })
            | Payload::MetaData(MetaData { block, fill_length }) => {
                desc.handles[0] = block.as_ref().map_or(0, |b| b.handle());
                desc.fill_length = *fill_length as u32;
            }
            Payload::Composite(_) => {
                return Err(Error::InvalidParams(
                    "Container buffers cannot cross processors.".into(),
                ));
            }
        }
        Ok(desc)
    }

    pub(crate) fn encode(&self) -> [u8; IPC_DESCRIPTOR_SIZE] {
        let words = [
            self.slot,
            self.ch_num,
            self.buf_type,
            self.info.flags,
            self.src_timestamp as u32,
            (self.src_timestamp >> 32) as u32,
            self.fill_length,
            self.handles[0],
            self.offsets[0],
            self.handles[1],
            self.offsets[1],
            self.info.width,
            self.info.height,
            self.info.pitch[0],
            self.info.pitch[1],
            0,
        ];
        let mut bytes = [0u8; IPC_DESCRIPTOR_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub(crate) fn decode(bytes: &[u8; IPC_DESCRIPTOR_SIZE]) -> Self {
        let mut words = [0u32; IPC_DESCRIPTOR_SIZE / 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        IpcDescriptor {
            slot: words[0],
            ch_num: words[1],
            buf_type: words[2],
            src_timestamp: words[4] as u64 | (words[5] as u64) << 32,
            fill_length: words[6],
            handles: [words[7], words[9]],
            offsets: [words[8], words[10]],
            info: FrameInfo {
                width: words[11],
                height: words[12],
                pitch: [words[13], words[14]],
                flags: words[3],
            },
        }
    }
}

struct IpcOutState {
    forward: Option<IpcQueWriter>,
    ret: Option<IpcQueReader>,
    slots: Vec<Option<SystemBuffer>>,
    free: Vec<u32>,
    stats: LinkStatistics,
}

impl IpcOutState {
    fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

pub struct IpcOutLink {
    id: LinkId,
    params: IpcOutLinkParams,
    info: LinkInfo,
    regions: [SharedRegion; 2],
    state: Mutex<IpcOutState>,
}

impl IpcOutLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: IpcOutLinkParams) -> Result<Self> {
        let next = params.out_que.next_link;
        if next.kind() != LinkType::IpcIn {
            return Err(Error::InvalidParams(format!(
                "{id} must feed an IPC-In link, not {next}."
            )));
        }
        let que = prev_que_info(sys, &params.in_que)?;
        let elements = params.num_elements.unwrap_or(sys.config().ipc_que_elements);
        let heap = sys.heap();

        let fwd_region =
            heap.alloc_region(IpcQue::region_words(elements, IPC_DESCRIPTOR_SIZE as u32))?;
        let ret_region = match heap.alloc_region(IpcQue::region_words(elements, RETURN_ELEMENT_SIZE)) {
            Ok(region) => region,
            Err(err) => {
                heap.free_region(&fwd_region);
                return Err(err);
            }
        };
        let rings = IpcQue::create(fwd_region.clone(), elements, IPC_DESCRIPTOR_SIZE as u32)
            .and_then(|fwd| Ok((fwd, IpcQue::create(ret_region.clone(), elements, RETURN_ELEMENT_SIZE)?)))
            .and_then(|((fwd_w, fwd_r), (ret_w, ret_r))| {
                sys.interconnect().offer_rings(
                    next,
                    IpcRingEnds {
                        out_link: id,
                        forward: fwd_r,
                        ret: ret_w,
                    },
                )?;
                Ok((fwd_w, ret_r))
            });
        let (forward, ret) = match rings {
            Ok(ends) => ends,
            Err(err) => {
                heap.free_region(&fwd_region);
                heap.free_region(&ret_region);
                return Err(err);
            }
        };
        tracing::debug!("[{id}] Rings of {elements} elements offered to {next}");

        let slot_count = QUE_MAX_ELEMENTS;
        Ok(Self {
            id,
            params,
            info: LinkInfo { queues: vec![que] },
            regions: [fwd_region, ret_region],
            state: Mutex::new(IpcOutState {
                forward: Some(forward),
                ret: Some(ret),
                slots: (0..slot_count).map(|_| None).collect(),
                free: (0..slot_count as u32).rev().collect(),
                stats: LinkStatistics::default(),
            }),
        })
    }
}

impl Link for IpcOutLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        self.info.clone()
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        let in_que = self.params.in_que;
        let list = sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
        if list.is_empty() {
            return Ok(());
        }
        let mut rejected = Vec::new();
        let mut sent = 0;
        {
            let mut state = self.state.lock();
            for mut buffer in list {
                buffer.stamp_arrival();
                let ch = buffer.ch_num;
                state.stats.ch(0, ch).recv += 1;
                let Some(slot) = state.free.pop() else {
                    state.stats.ch(0, ch).drop += 1;
                    rejected.push(buffer);
                    continue;
                };
                let desc = match IpcDescriptor::describe(slot, &buffer) {
                    Ok(desc) => desc,
                    Err(err) => {
                        state.free.push(slot);
                        state.stats.in_buf_error_count += 1;
                        tracing::warn!("[{}] {}: {err}", self.id, buffer.id());
                        rejected.push(buffer);
                        continue;
                    }
                };
                let written = match state.forward.as_mut() {
                    Some(forward) => forward.write(&desc.encode()),
                    None => Err(Error::InvalidState("rings deleted".into())),
                };
                match written {
                    Ok(()) => {
                        state.slots[slot as usize] = Some(buffer);
                        state.stats.ch(0, ch).out += 1;
                        sent += 1;
                    }
                    Err(err) => {
                        state.free.push(slot);
                        state.stats.ch(0, ch).drop += 1;
                        tracing::debug!("[{}] Forward ring: {err}", self.id);
                        rejected.push(buffer);
                    }
                }
            }
        }
        release_upstream(sys, self.id, &in_que, rejected);
        if sent > 0 {
            sys.send_link_cmd(self.params.out_que.next_link, CMD_NEW_DATA)?;
        }
        Ok(())
    }

    fn release_data(&self, sys: &SystemContext) -> Result<()> {
        let mut originals = Vec::new();
        {
            let mut state = self.state.lock();
            let mut element = [0u8; RETURN_ELEMENT_SIZE as usize];
            loop {
                let read = match state.ret.as_mut() {
                    Some(ret) => ret.read(&mut element),
                    None => break,
                };
                if read.is_err() {
                    break;
                }
                let slot = u32::from_le_bytes(element);
                match state.slots.get_mut(slot as usize).and_then(Option::take) {
                    Some(buffer) => {
                        state.free.push(slot);
                        originals.push(buffer);
                    }
                    None => {
                        state.stats.in_buf_error_count += 1;
                        tracing::error!("[{}] Slot {slot} returned but not in use", self.id);
                    }
                }
            }
        }
        release_upstream(sys, self.id, &self.params.in_que, originals);
        Ok(())
    }

    fn notify_cmd(&self) -> u32 {
        CMD_RELEASE_DATA
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        self.release_data(sys)?;
        let held: Vec<SystemBuffer> = {
            let mut state = self.state.lock();
            if state.in_use() > 0 {
                tracing::warn!(
                    "[{}] Deleting with {} buffers still on the far side",
                    self.id,
                    state.in_use()
                );
            }
            if let Some(forward) = state.forward.take() {
                forward.delete();
            }
            if let Some(ret) = state.ret.take() {
                ret.delete();
            }
            state.slots.iter_mut().filter_map(Option::take).collect()
        };
        // rings nobody picked up
        sys.interconnect()
            .withdraw_rings(self.params.out_que.next_link);
        for region in &self.regions {
            sys.heap().free_region(region);
        }
        release_upstream(sys, self.id, &self.params.in_que, held);
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats
            .counters
            .insert("slots_in_use".into(), state.in_use() as u64);
        stats
    }

    fn pending_buffers(&self) -> usize {
        self.state.lock().in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_layout() {
        let desc = IpcDescriptor {
            slot: 7,
            ch_num: 2,
            buf_type: 0,
            src_timestamp: 0x1_0000_0005,
            fill_length: 0,
            handles: [11, 12],
            offsets: [0, 64],
            info: FrameInfo {
                width: 32,
                height: 16,
                pitch: [32, 32],
                flags: 1,
            },
        };
        let bytes = desc.encode();
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &5u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());
        assert_eq!(IpcDescriptor::decode(&bytes), desc);
        assert_eq!(type_from_code(type_code(BufferType::MetaData)), Some(BufferType::MetaData));
        assert_eq!(type_from_code(9), None);
    }
}
