// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Merge link: combines several input queues into one output queue.
//!
//! Output channels are the input channels laid end to end: channel `c` of
//! input queue `q` leaves as `offset[q] + c`. The mapping is reversed when a
//! buffer comes back so that it is returned to the queue it came from with its
//! original channel number.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{check_count, release_upstream, take_list};
use crate::{
    Error, Result, SystemContext,
    buffer::{BufferList, SystemBuffer},
    link::{
        CMD_NEW_DATA, InQueParams, Link, LinkInfo, LinkStatistics, MAX_CH_PER_QUE, MAX_OUT_QUE,
        OutQueParams, QueInfo, prev_que_info,
    },
    link_id::LinkId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeLinkParams {
    pub in_queues: Vec<InQueParams>,
    pub out_que: OutQueParams,
    #[serde(default = "default_true")]
    pub notify_next_link: bool,
}

fn default_true() -> bool {
    true
}

/// Output channel numbering of a Merge link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    /// First output channel of each input queue.
    offsets: Vec<u32>,
    counts: Vec<u32>,
}

impl ChannelMap {
    fn new(counts: Vec<u32>) -> Self {
        let offsets = counts
            .iter()
            .scan(0, |next, count| {
                let first = *next;
                *next += count;
                Some(first)
            })
            .collect();
        Self { offsets, counts }
    }

    /// Output channel of channel `in_ch` of input queue `in_que`.
    pub fn out_ch(&self, in_que: usize, in_ch: u32) -> Option<u32> {
        let count = *self.counts.get(in_que)?;
        (in_ch < count).then(|| self.offsets[in_que] + in_ch)
    }

    /// Input queue and channel an output channel came from.
    pub fn origin_of(&self, out_ch: u32) -> Option<(u8, u32)> {
        self.offsets
            .iter()
            .zip(&self.counts)
            .position(|(first, count)| out_ch >= *first && out_ch < first + count)
            .map(|que| (que as u8, out_ch - self.offsets[que]))
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }
}

struct MergeState {
    out_full: VecDeque<SystemBuffer>,
    handed_out: usize,
    stats: LinkStatistics,
}

pub struct MergeLink {
    id: LinkId,
    params: MergeLinkParams,
    map: ChannelMap,
    info: LinkInfo,
    state: Mutex<MergeState>,
}

impl MergeLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: MergeLinkParams) -> Result<Self> {
        check_count("input queues", params.in_queues.len(), MAX_OUT_QUE)?;
        let mut channels = Vec::new();
        let mut counts = Vec::new();
        for in_que in &params.in_queues {
            let que = prev_que_info(sys, in_que)?;
            counts.push(que.channels.len() as u32);
            channels.extend(que.channels);
        }
        if channels.len() > MAX_CH_PER_QUE {
            return Err(Error::InvalidParams(format!(
                "{id}: {} merged channels exceed {MAX_CH_PER_QUE}.",
                channels.len()
            )));
        }
        tracing::debug!("[{id}] Merging {} channels", channels.len());
        Ok(Self {
            id,
            params,
            map: ChannelMap::new(counts),
            info: LinkInfo {
                queues: vec![QueInfo { channels }],
            },
            state: Mutex::new(MergeState {
                out_full: VecDeque::new(),
                handed_out: 0,
                stats: LinkStatistics::default(),
            }),
        })
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    /// Restores input channel numbers and hands buffers back to the queues
    /// they came from.
    fn return_upstream(&self, sys: &SystemContext, buffers: impl IntoIterator<Item = SystemBuffer>) {
        let mut per_input: Vec<Vec<SystemBuffer>> =
            (0..self.params.in_queues.len()).map(|_| Vec::new()).collect();
        for mut buffer in buffers {
            match self.map.origin_of(buffer.ch_num) {
                Some((que, in_ch)) => {
                    buffer.ch_num = in_ch;
                    per_input[que as usize].push(buffer);
                }
                None => {
                    self.state.lock().stats.in_buf_error_count += 1;
                    tracing::error!(
                        "[{}] Cannot route {} back: channel {} is not merged here",
                        self.id,
                        buffer.id(),
                        buffer.ch_num
                    );
                }
            }
        }
        for (in_que, buffers) in self.params.in_queues.iter().zip(per_input) {
            release_upstream(sys, self.id, in_que, buffers);
        }
    }
}

impl Link for MergeLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        self.info.clone()
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        let mut forwarded = 0;
        for (que, in_que) in self.params.in_queues.iter().enumerate() {
            let list = sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
            if list.is_empty() {
                continue;
            }
            let mut rejected = Vec::new();
            {
                let mut state = self.state.lock();
                for mut buffer in list {
                    buffer.stamp_arrival();
                    let in_ch = buffer.ch_num;
                    state.stats.ch(que as u8, in_ch).recv += 1;
                    match self.map.out_ch(que, in_ch) {
                        Some(out_ch) => {
                            buffer.ch_num = out_ch;
                            state.out_full.push_back(buffer);
                            state.stats.ch(que as u8, in_ch).out += 1;
                            forwarded += 1;
                        }
                        None => {
                            state.stats.in_buf_error_count += 1;
                            tracing::warn!("[{}] Channel {in_ch} unknown on input {que}", self.id);
                            rejected.push(buffer);
                        }
                    }
                }
            }
            release_upstream(sys, self.id, in_que, rejected);
        }
        if forwarded > 0 && self.params.notify_next_link {
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
        {
            let mut state = self.state.lock();
            state.handed_out = state.handed_out.saturating_sub(list.len());
        }
        self.return_upstream(sys, list);
        Ok(())
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        let queued: Vec<SystemBuffer> = self.state.lock().out_full.drain(..).collect();
        self.return_upstream(sys, queued);
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        self.state.lock().stats.clone()
    }

    fn pending_buffers(&self) -> usize {
        self.state.lock().handed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_laid_end_to_end() {
        let map = ChannelMap::new(vec![2, 1, 3]);
        assert_eq!(map.total(), 6);
        assert_eq!(map.out_ch(0, 1), Some(1));
        assert_eq!(map.out_ch(1, 0), Some(2));
        assert_eq!(map.out_ch(2, 2), Some(5));
        assert_eq!(map.out_ch(1, 1), None);
        assert_eq!(map.origin_of(2), Some((1, 0)));
        assert_eq!(map.origin_of(4), Some((2, 1)));
        assert_eq!(map.origin_of(6), None);
    }
}
