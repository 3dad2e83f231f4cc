// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The link abstraction and the types shared by every link variant.
//!
//! A link is driven by exactly one task thread (see [`crate::SystemContext`]),
//! which calls [`Link::process_new_data`], [`Link::control`] and the lifecycle
//! hooks. Neighbouring links call [`Link::get_full_buffers`] and
//! [`Link::put_empty_buffers`] directly from their own task threads, so every
//! implementation keeps its mutable state behind a lock and never calls into
//! another link while holding it.

use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Error, Result, SystemContext,
    buffer::{BufferList, BufferType, FrameInfo, MAX_PLANES},
    link_id::LinkId,
    links::endpoint::Endpoint,
};

pub const CMD_CREATE: u32 = 0;
pub const CMD_START: u32 = 1;
pub const CMD_STOP: u32 = 2;
pub const CMD_DELETE: u32 = 3;
pub const CMD_NEW_DATA: u32 = 4;
pub const CMD_GET_INFO: u32 = 5;
pub const CMD_RELEASE_DATA: u32 = 6;
pub const CMD_PRINT_STATISTICS: u32 = 0xFFF;
/// First code available to link specific commands.
pub const CMD_CUSTOM_BASE: u32 = 0x1000;

/// Maximum number of output (or input) queues of a link.
pub const MAX_OUT_QUE: usize = 6;
/// Maximum number of channels on one queue.
pub const MAX_CH_PER_QUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Created,
    Started,
    Stopped,
    Deleted,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pixel layout of a video channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Luma plane followed by an interleaved half-height chroma plane.
    Yuv420Sp,
    Yuv422I,
    Rgb24,
    /// Opaque bytes; used for bitstream and metadata channels.
    Raw,
}

impl DataFormat {
    pub(crate) fn bytes_per_pixel(self) -> u32 {
        match self {
            DataFormat::Yuv420Sp | DataFormat::Raw => 1,
            DataFormat::Yuv422I => 2,
            DataFormat::Rgb24 => 3,
        }
    }
}

/// Layout of one channel on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChInfo {
    pub buf_type: BufferType,
    pub format: DataFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: [u32; MAX_PLANES],
}

impl ChInfo {
    /// A video channel with tightly packed lines.
    pub fn video(format: DataFormat, width: u32, height: u32) -> Self {
        let pitch0 = width * format.bytes_per_pixel();
        let pitch1 = if format == DataFormat::Yuv420Sp {
            pitch0
        } else {
            0
        };
        Self {
            buf_type: BufferType::VideoFrame,
            format,
            width,
            height,
            pitch: [pitch0, pitch1],
        }
    }

    /// A bitstream or metadata channel carrying at most `size` bytes.
    pub fn opaque(buf_type: BufferType, size: u32) -> Self {
        Self {
            buf_type,
            format: DataFormat::Raw,
            width: size,
            height: 1,
            pitch: [size, 0],
        }
    }

    /// Bytes needed for each plane of one buffer on this channel.
    pub fn plane_sizes(&self) -> [usize; MAX_PLANES] {
        let luma = self.pitch[0] as usize * self.height as usize;
        let chroma = match self.format {
            DataFormat::Yuv420Sp => self.pitch[1] as usize * self.height.div_ceil(2) as usize,
            _ => 0,
        };
        [luma, chroma]
    }

    pub fn frame_info(&self) -> FrameInfo {
        FrameInfo {
            width: self.width,
            height: self.height,
            pitch: self.pitch,
            flags: 0,
        }
    }
}

/// Channel layout of one output queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueInfo {
    pub channels: Vec<ChInfo>,
}

/// Output layout of a link, queried by the links it feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub queues: Vec<QueInfo>,
}

impl LinkInfo {
    /// Layout of output queue `que_id`.
    pub fn que(&self, link: LinkId, que_id: u8) -> Result<&QueInfo> {
        self.queues.get(que_id as usize).ok_or_else(|| {
            Error::InvalidParams(format!("{link} has no output queue {que_id}."))
        })
    }
}

/// Where an input queue takes its buffers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InQueParams {
    pub prev_link_id: LinkId,
    #[serde(default)]
    pub prev_link_que_id: u8,
}

/// Which link an output queue announces new data to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutQueParams {
    pub next_link: LinkId,
}

/// A control command with an opaque parameter blob.
///
/// Parameters of the built-in commands are JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCmd {
    pub code: u32,
    pub params: Vec<u8>,
}

impl LinkCmd {
    pub fn new(code: u32) -> Self {
        Self {
            code,
            params: Vec::new(),
        }
    }

    /// Builds a command whose parameters are `params` serialized as JSON.
    pub fn with_params<T: Serialize>(code: u32, params: &T) -> Result<Self> {
        Ok(Self {
            code,
            params: serde_json::to_vec(params)?,
        })
    }

    /// Decodes the JSON parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the blob does not decode as `T`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.params)?)
    }
}

/// Counters of one channel of one input queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChStatistics {
    pub in_que: u8,
    pub ch: u32,
    pub recv: u64,
    pub drop: u64,
    pub process: u64,
    pub out: u64,
}

/// Runtime counters of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatistics {
    pub new_data_cmds: u64,
    pub release_data_cmds: u64,
    pub in_buf_error_count: u64,
    pub channels: Vec<ChStatistics>,
    /// Link specific counters.
    pub counters: BTreeMap<String, u64>,
}

impl LinkStatistics {
    /// Counters for `(in_que, ch)`, created on first use.
    pub fn ch(&mut self, in_que: u8, ch: u32) -> &mut ChStatistics {
        let pos = match self
            .channels
            .iter()
            .position(|c| c.in_que == in_que && c.ch == ch)
        {
            Some(pos) => pos,
            None => {
                self.channels.push(ChStatistics {
                    in_que,
                    ch,
                    ..Default::default()
                });
                self.channels.len() - 1
            }
        };
        &mut self.channels[pos]
    }

    pub fn bump(&mut self, counter: &str, by: u64) {
        *self.counters.entry(counter.to_string()).or_default() += by;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or_default()
    }

    pub fn total_recv(&self) -> u64 {
        self.channels.iter().map(|c| c.recv).sum()
    }

    pub fn total_drop(&self) -> u64 {
        self.channels.iter().map(|c| c.drop).sum()
    }

    pub fn total_out(&self) -> u64 {
        self.channels.iter().map(|c| c.out).sum()
    }
}

/// One stage of a chain.
///
/// Every method takes `&self`; state lives behind the implementation's own
/// locks because neighbouring links reach in from their task threads through
/// [`Link::get_full_buffers`] and [`Link::put_empty_buffers`].
pub trait Link: Send + Sync {
    fn id(&self) -> LinkId;

    /// Output layout, fixed at create time.
    fn link_info(&self) -> LinkInfo;

    fn start(&self, _sys: &SystemContext) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _sys: &SystemContext) -> Result<()> {
        Ok(())
    }

    /// Returns everything the link still holds upstream and frees its pools.
    fn delete(&self, sys: &SystemContext) -> Result<()>;

    /// Handles `NEW_DATA`: pull from the inputs, process, push to the outputs.
    fn process_new_data(&self, sys: &SystemContext) -> Result<()>;

    /// Handles `RELEASE_DATA`.
    fn release_data(&self, _sys: &SystemContext) -> Result<()> {
        Ok(())
    }

    /// Handles a link specific command and returns the reply payload.
    fn control(&self, _sys: &SystemContext, cmd: &LinkCmd) -> Result<Vec<u8>> {
        Err(Error::UnsupportedCmd(cmd.code))
    }

    /// Hands the buffers waiting on output queue `que_id` to the caller.
    fn get_full_buffers(&self, _sys: &SystemContext, que_id: u8) -> Result<BufferList> {
        Err(Error::InvalidParams(format!(
            "{} has no output queue {que_id}.",
            self.id()
        )))
    }

    /// Takes back buffers previously handed out on output queue `que_id`.
    fn put_empty_buffers(&self, _sys: &SystemContext, que_id: u8, list: BufferList) -> Result<()> {
        tracing::error!(
            "[{}] {} buffers returned to missing output queue {que_id}",
            self.id(),
            list.len()
        );
        Err(Error::InvalidParams(format!(
            "{} has no output queue {que_id}.",
            self.id()
        )))
    }

    fn statistics(&self) -> LinkStatistics;

    /// Buffers handed downstream that have not come back yet.
    fn pending_buffers(&self) -> usize {
        0
    }

    /// Period of [`Link::on_tick`], for links that produce on a timer.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    fn on_tick(&self, _sys: &SystemContext) -> Result<()> {
        Ok(())
    }

    /// Command a remote notify addressed to this link turns into.
    fn notify_cmd(&self) -> u32 {
        CMD_NEW_DATA
    }

    /// Application handle, for links that bridge to application code.
    fn endpoint(&self) -> Option<Endpoint> {
        None
    }
}

/// Checks that an input queue's previous link runs on this processor and
/// exposes the queue, and returns its layout.
pub(crate) fn prev_que_info(sys: &SystemContext, in_que: &InQueParams) -> Result<QueInfo> {
    let prev = in_que.prev_link_id;
    if prev.proc() != sys.proc() {
        return Err(Error::InvalidParams(format!(
            "{prev} runs on another processor than {}; connect it through an IPC-Out/IPC-In pair.",
            sys.proc()
        )));
    }
    peer_que_info(sys, in_que)
}

/// Like [`prev_que_info`], for the one link type allowed to read across
/// processors.
pub(crate) fn peer_que_info(sys: &SystemContext, in_que: &InQueParams) -> Result<QueInfo> {
    let info = sys.link_get_info(in_que.prev_link_id)?;
    let que = info.que(in_que.prev_link_id, in_que.prev_link_que_id)?;
    if que.channels.is_empty() || que.channels.len() > MAX_CH_PER_QUE {
        return Err(Error::InvalidParams(format!(
            "{} queue {} carries {} channels.",
            in_que.prev_link_id,
            in_que.prev_link_que_id,
            que.channels.len()
        )));
    }
    Ok(que.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420sp_plane_sizes() {
        let ch = ChInfo::video(DataFormat::Yuv420Sp, 64, 33);
        assert_eq!(ch.plane_sizes(), [64 * 33, 64 * 17]);
        let ch = ChInfo::video(DataFormat::Yuv422I, 64, 32);
        assert_eq!(ch.plane_sizes(), [128 * 32, 0]);
    }

    #[test]
    fn cmd_params_are_json() {
        let cmd = LinkCmd::with_params(0x7000, &vec![1u32, 2]).unwrap();
        assert_eq!(cmd.params::<Vec<u32>>().unwrap(), vec![1, 2]);
        assert!(cmd.params::<String>().is_err());
    }

    #[test]
    fn channel_counters_are_created_on_demand() {
        let mut stats = LinkStatistics::default();
        stats.ch(0, 2).recv += 3;
        stats.ch(1, 0).recv += 1;
        stats.ch(0, 2).drop += 1;
        assert_eq!(stats.channels.len(), 2);
        assert_eq!(stats.total_recv(), 4);
        assert_eq!(stats.total_drop(), 1);
    }
}
