// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! System buffers, the unit of data exchanged between links.
//!
//! A [`SystemBuffer`] is a descriptor: it names the pool slot it belongs to
//! ([`BufferId`]), the channel it travels on, timestamps, and a [`Payload`] that
//! points at [`SharedBlock`] memory. Descriptors are moved, never copied, so at
//! any instant exactly one queue or link holds a given buffer. Links that fan a
//! buffer out (Dup, Split) create *shadow* descriptors that share the payload
//! memory and keep the original until every shadow has come back.

use std::{sync::OnceLock, time::Instant};

use serde::{Deserialize, Serialize};

use crate::{link_id::LinkId, shared_mem::SharedBlock};

/// Maximum number of buffers moved in one [`BufferList`].
pub const MAX_BUFFERS_IN_LIST: usize = 64;

/// Maximum number of planes in a video frame.
pub const MAX_PLANES: usize = 2;

/// Buffer type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferType {
    VideoFrame,
    Bitstream,
    MetaData,
    VideoFrameContainer,
}

/// Pool slot a buffer belongs to: the owning link, its output queue and the
/// index within that queue's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    pub owner: LinkId,
    pub que_id: u8,
    pub index: u16,
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}].{}", self.owner, self.que_id, self.index)
    }
}

/// Per-frame video geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub pitch: [u32; MAX_PLANES],
    pub flags: u32,
}

#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    pub planes: [Option<SharedBlock>; MAX_PLANES],
    /// Byte offset of the frame start inside each plane block.
    pub offsets: [usize; MAX_PLANES],
    pub info: FrameInfo,
}

#[derive(Debug, Clone, Default)]
pub struct Bitstream {
    pub block: Option<SharedBlock>,
    pub fill_length: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MetaData {
    pub block: Option<SharedBlock>,
    pub fill_length: usize,
}

/// Data carried by a buffer.
#[derive(Debug)]
pub enum Payload {
    VideoFrame(VideoFrame),
    Bitstream(Bitstream),
    MetaData(MetaData),
    /// One buffer per channel, as assembled by the Sync link. The inner
    /// buffers belong to upstream pools and travel back with the container.
    Composite(Vec<SystemBuffer>),
}

impl Payload {
    pub fn buf_type(&self) -> BufferType {
        match self {
            Payload::VideoFrame(_) => BufferType::VideoFrame,
            Payload::Bitstream(_) => BufferType::Bitstream,
            Payload::MetaData(_) => BufferType::MetaData,
            Payload::Composite(_) => BufferType::VideoFrameContainer,
        }
    }

    fn shadow(&self) -> Payload {
        match self {
            Payload::VideoFrame(frame) => Payload::VideoFrame(frame.clone()),
            Payload::Bitstream(bits) => Payload::Bitstream(bits.clone()),
            Payload::MetaData(meta) => Payload::MetaData(meta.clone()),
            Payload::Composite(frames) => {
                Payload::Composite(frames.iter().map(|b| b.shadow(b.id)).collect())
            }
        }
    }
}

/// A buffer descriptor.
#[derive(Debug)]
pub struct SystemBuffer {
    id: BufferId,
    pub ch_num: u32,
    /// Capture time in microseconds, set by the producing link.
    pub src_timestamp: u64,
    /// Time the current holder received the buffer, in microseconds.
    pub link_local_timestamp: u64,
    pub payload: Payload,
}

impl SystemBuffer {
    pub fn new(id: BufferId, payload: Payload) -> Self {
        Self {
            id,
            ch_num: 0,
            src_timestamp: 0,
            link_local_timestamp: 0,
            payload,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn buf_type(&self) -> BufferType {
        self.payload.buf_type()
    }

    /// Creates a descriptor with its own identity that shares this buffer's
    /// payload memory.
    pub(crate) fn shadow(&self, id: BufferId) -> SystemBuffer {
        SystemBuffer {
            id,
            ch_num: self.ch_num,
            src_timestamp: self.src_timestamp,
            link_local_timestamp: self.link_local_timestamp,
            payload: self.payload.shadow(),
        }
    }

    pub fn video_frame(&self) -> Option<&VideoFrame> {
        match &self.payload {
            Payload::VideoFrame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn video_frame_mut(&mut self) -> Option<&mut VideoFrame> {
        match &mut self.payload {
            Payload::VideoFrame(frame) => Some(frame),
            _ => None,
        }
    }

    /// Appends the payload bytes to `out`: each video plane from its offset
    /// to the end of the block, or the filled part of a bitstream or
    /// metadata block. Composite payloads append their frames in order.
    pub fn copy_payload(&self, out: &mut Vec<u8>) {
        match &self.payload {
            Payload::VideoFrame(frame) => {
                for (plane, offset) in frame.planes.iter().zip(frame.offsets) {
                    if let Some(block) = plane {
                        let data = block.read();
                        out.extend_from_slice(data.get(offset..).unwrap_or_default());
                    }
                }
            }
            Payload::Bitstream(Bitstream { block, fill_length })
            | Payload::MetaData(MetaData { block, fill_length }) => {
                if let Some(block) = block {
                    let data = block.read();
                    let end = (*fill_length).min(data.len());
                    out.extend_from_slice(&data[..end]);
                }
            }
            Payload::Composite(frames) => frames.iter().for_each(|b| b.copy_payload(out)),
        }
    }

    /// Marks the buffer as received now by the current holder.
    pub fn stamp_arrival(&mut self) {
        self.link_local_timestamp = timestamp_us();
    }
}

/// Microseconds elapsed on the process-wide link clock.
pub fn timestamp_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// A batch of buffers handed between links in one call.
#[derive(Debug, Default)]
pub struct BufferList {
    buffers: Vec<SystemBuffer>,
}

impl BufferList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a buffer, handing it back if the list is already full.
    pub fn push(&mut self, buffer: SystemBuffer) -> core::result::Result<(), SystemBuffer> {
        if self.is_full() {
            return Err(buffer);
        }
        self.buffers.push(buffer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffers.len() >= MAX_BUFFERS_IN_LIST
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SystemBuffer> {
        self.buffers.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, SystemBuffer> {
        self.buffers.iter_mut()
    }
}

impl IntoIterator for BufferList {
    type Item = SystemBuffer;
    type IntoIter = std::vec::IntoIter<SystemBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.into_iter()
    }
}

impl From<Vec<SystemBuffer>> for BufferList {
    /// Builds a list from a vector. Callers keep batches within
    /// [`MAX_BUFFERS_IN_LIST`]; longer vectors are not truncated.
    fn from(buffers: Vec<SystemBuffer>) -> Self {
        Self { buffers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LinkType, ProcId, shared_mem::SharedHeap};

    fn id(index: u16) -> BufferId {
        BufferId {
            owner: LinkId::new(ProcId::Ipu1_0, LinkType::NullSrc, 0).unwrap(),
            que_id: 0,
            index,
        }
    }

    #[test]
    fn shadow_shares_payload_memory() {
        let heap = SharedHeap::new(4096);
        let block = heap.alloc(16).unwrap();
        let mut original = SystemBuffer::new(
            id(0),
            Payload::VideoFrame(VideoFrame {
                planes: [Some(block), None],
                ..Default::default()
            }),
        );
        original.ch_num = 3;

        let shadow = original.shadow(id(9));
        assert_eq!(shadow.id().index, 9);
        assert_eq!(shadow.ch_num, 3);

        let plane = |b: &SystemBuffer| b.video_frame().unwrap().planes[0].clone().unwrap();
        plane(&original).write()[5] = 0xAB;
        assert_eq!(plane(&shadow).read()[5], 0xAB);
    }

    #[test]
    fn list_is_bounded() {
        let mut list = BufferList::new();
        for i in 0..MAX_BUFFERS_IN_LIST as u16 {
            list.push(SystemBuffer::new(id(i), Payload::MetaData(MetaData::default())))
                .unwrap();
        }
        let extra = SystemBuffer::new(id(99), Payload::MetaData(MetaData::default()));
        assert_eq!(list.push(extra).unwrap_err().id().index, 99);
    }
}
