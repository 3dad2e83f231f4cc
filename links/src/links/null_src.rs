// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! NullSrc link: a timed source that emits one buffer per channel every
//! interval from its own pools.
//!
//! The first eight payload bytes of every buffer carry the frame number and
//! the channel number (little endian `u32` each), which is what tests use to
//! check ordering across a chain.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{alloc_pools, check_count, free_pools};
use crate::{
    Error, Result, SystemContext,
    buf_que::BufQue,
    buffer::{BufferList, Payload, SystemBuffer, timestamp_us},
    link::{
        CMD_NEW_DATA, ChInfo, Link, LinkInfo, LinkStatistics, MAX_OUT_QUE, OutQueParams, QueInfo,
    },
    link_id::LinkId,
    que::Timeout,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullSrcLinkParams {
    pub out_que: OutQueParams,
    pub channels: Vec<ChInfo>,
    #[serde(default = "default_num_buffers_per_ch")]
    pub num_buffers_per_ch: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Frames to emit per channel before going quiet.
    #[serde(default)]
    pub max_frames: Option<u64>,
}

fn default_num_buffers_per_ch() -> usize {
    4
}

fn default_interval_ms() -> u64 {
    16
}

/// Reads the frame and channel numbers a NullSrc link wrote into a buffer.
pub fn frame_marker(buffer: &SystemBuffer) -> Option<(u32, u32)> {
    let mut bytes = Vec::new();
    buffer.copy_payload(&mut bytes);
    let frame = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    let ch = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
    Some((frame, ch))
}

/// Stamps the frame marker and fill length into a pool buffer.
fn fill(buffer: &mut SystemBuffer, frame: u32, ch: u32) {
    let block = match &mut buffer.payload {
        Payload::VideoFrame(video) => video.planes[0].clone(),
        Payload::Bitstream(bits) => {
            bits.fill_length = bits.block.as_ref().map_or(0, |b| b.len());
            bits.block.clone()
        }
        Payload::MetaData(meta) => {
            meta.fill_length = meta.block.as_ref().map_or(0, |b| b.len());
            meta.block.clone()
        }
        Payload::Composite(_) => None,
    };
    if let Some(block) = block {
        let mut data = block.write();
        if data.len() >= 8 {
            data[0..4].copy_from_slice(&frame.to_le_bytes());
            data[4..8].copy_from_slice(&ch.to_le_bytes());
        }
    }
}

pub struct NullSrcLink {
    id: LinkId,
    params: NullSrcLinkParams,
    pools: Vec<BufQue>,
    frames: Mutex<Vec<u64>>,
    stats: Mutex<LinkStatistics>,
}

impl NullSrcLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: NullSrcLinkParams) -> Result<Self> {
        check_count("channels", params.channels.len(), MAX_OUT_QUE)?;
        let nbuf = params.num_buffers_per_ch;
        if nbuf == 0 || params.interval_ms == 0 {
            return Err(Error::InvalidParams(format!(
                "{id}: num_buffers_per_ch and interval_ms must be non-zero."
            )));
        }
        let pools = alloc_pools(sys.heap(), id, &params.channels, nbuf, false)?;
        Ok(Self {
            id,
            frames: Mutex::new(vec![0; params.channels.len()]),
            pools,
            params,
            stats: Mutex::new(LinkStatistics::default()),
        })
    }

    fn produce(&self) -> usize {
        let mut produced = 0;
        let mut frames = self.frames.lock();
        let mut stats = self.stats.lock();
        for (ch, pool) in self.pools.iter().enumerate() {
            if self.params.max_frames.is_some_and(|max| frames[ch] >= max) {
                continue;
            }
            let Ok(mut buffer) = pool.get_empty(Timeout::NoWait) else {
                stats.ch(0, ch as u32).drop += 1;
                continue;
            };
            fill(&mut buffer, frames[ch] as u32, ch as u32);
            buffer.ch_num = ch as u32;
            buffer.src_timestamp = timestamp_us();
            buffer.link_local_timestamp = buffer.src_timestamp;
            if pool.put_full(buffer).is_err() {
                continue;
            }
            frames[ch] += 1;
            stats.ch(0, ch as u32).out += 1;
            produced += 1;
        }
        produced
    }

    fn pool_of(&self, buffer: &SystemBuffer) -> Option<&BufQue> {
        let index = buffer.id().index as usize / self.params.num_buffers_per_ch;
        self.pools.get(index).filter(|pool| pool.owns(buffer))
    }
}

impl Link for NullSrcLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        LinkInfo {
            queues: vec![QueInfo {
                channels: self.params.channels.clone(),
            }],
        }
    }

    fn process_new_data(&self, _sys: &SystemContext) -> Result<()> {
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.params.interval_ms))
    }

    fn on_tick(&self, sys: &SystemContext) -> Result<()> {
        if self.produce() > 0 {
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
        let mut list = BufferList::new();
        let mut progressed = true;
        while progressed && !list.is_full() {
            progressed = false;
            for pool in &self.pools {
                if list.is_full() {
                    break;
                }
                let Ok(buffer) = pool.get_full(Timeout::NoWait) else {
                    continue;
                };
                if let Err(buffer) = list.push(buffer) {
                    tracing::error!("[{}] Lost {} on dequeue", self.id, buffer.id());
                }
                progressed = true;
            }
        }
        Ok(list)
    }

    fn put_empty_buffers(&self, _sys: &SystemContext, _que_id: u8, list: BufferList) -> Result<()> {
        for buffer in list {
            match self.pool_of(&buffer) {
                Some(pool) => pool.put_empty(buffer)?,
                None => {
                    self.stats.lock().in_buf_error_count += 1;
                    tracing::error!("[{}] Foreign buffer {} returned", self.id, buffer.id());
                }
            }
        }
        Ok(())
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        let outstanding: usize = self.pools.iter().map(BufQue::held).sum();
        if outstanding > 0 {
            tracing::warn!("[{}] Deleting with {outstanding} buffers downstream", self.id);
        }
        free_pools(sys.heap(), &self.pools);
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        let mut stats = self.stats.lock().clone();
        stats.bump("frames", self.frames.lock().iter().sum());
        stats
    }

    fn pending_buffers(&self) -> usize {
        self.pools.iter().map(BufQue::held).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ProcId, buffer::BufferId, buffer::BufferType, link::DataFormat, link_id::LinkType,
        links::{alloc_payload, free_payload},
        shared_mem::SharedHeap,
    };

    #[test]
    fn marker_round_trips_through_a_frame() {
        let heap = SharedHeap::new(1 << 16);
        let ch = ChInfo::video(DataFormat::Yuv420Sp, 16, 8);
        let mut buffer = SystemBuffer::new(
            BufferId {
                owner: LinkId::new(ProcId::Ipu1_0, LinkType::NullSrc, 0).unwrap(),
                que_id: 0,
                index: 0,
            },
            alloc_payload(&heap, &ch).unwrap(),
        );
        fill(&mut buffer, 41, 3);
        assert_eq!(frame_marker(&buffer), Some((41, 3)));
        free_payload(&heap, &buffer.payload);
        assert_eq!(heap.block_count(), 0);
    }

    #[test]
    fn containers_cannot_be_sourced() {
        let heap = SharedHeap::new(1 << 16);
        let mut ch = ChInfo::video(DataFormat::Rgb24, 4, 4);
        ch.buf_type = BufferType::VideoFrameContainer;
        assert!(alloc_payload(&heap, &ch).is_err());
    }
}
