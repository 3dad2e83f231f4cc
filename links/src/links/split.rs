// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Split link: cuts every video frame into vertical strips.
//!
//! A frame of input channel `c` leaves as `num_splits` shadow frames on
//! channels `c + num_in_ch * s`, each `width / num_splits` pixels wide and
//! pointing into the original planes. No pixel is copied.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ShadowTable, release_upstream, take_list};
use crate::{
    Error, Result, SystemContext,
    buffer::{BufferId, BufferList, BufferType, SystemBuffer},
    link::{
        CMD_NEW_DATA, ChInfo, InQueParams, Link, LinkInfo, LinkStatistics, MAX_CH_PER_QUE,
        OutQueParams, QueInfo, prev_que_info,
    },
    link_id::LinkId,
};

pub const SPLIT_LINK_MAX_SPLITS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitLinkParams {
    pub in_que: InQueParams,
    pub out_que: OutQueParams,
    pub num_splits: u32,
}

struct SplitState {
    out_full: VecDeque<SystemBuffer>,
    shadows: ShadowTable,
    handed_out: usize,
    stats: LinkStatistics,
}

pub struct SplitLink {
    id: LinkId,
    params: SplitLinkParams,
    in_info: QueInfo,
    info: LinkInfo,
    state: Mutex<SplitState>,
}

impl SplitLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: SplitLinkParams) -> Result<Self> {
        let splits = params.num_splits;
        if !(2..=SPLIT_LINK_MAX_SPLITS).contains(&splits) {
            return Err(Error::InvalidParams(format!(
                "{id}: {splits} splits requested, 2..={SPLIT_LINK_MAX_SPLITS} supported."
            )));
        }
        let in_info = prev_que_info(sys, &params.in_que)?;
        let num_out = in_info.channels.len() * splits as usize;
        if num_out > MAX_CH_PER_QUE {
            return Err(Error::InvalidParams(format!(
                "{id}: {num_out} output channels exceed {MAX_CH_PER_QUE}."
            )));
        }
        for (ch, info) in in_info.channels.iter().enumerate() {
            if info.buf_type != BufferType::VideoFrame {
                return Err(Error::InvalidParams(format!(
                    "{id}: channel {ch} carries {:?}, only video frames can be split.",
                    info.buf_type
                )));
            }
            if info.width % splits != 0 {
                return Err(Error::InvalidParams(format!(
                    "{id}: width {} of channel {ch} does not divide into {splits} strips.",
                    info.width
                )));
            }
        }
        let strips = (0..splits).flat_map(|_| {
            in_info.channels.iter().map(|ch| ChInfo {
                width: ch.width / splits,
                ..*ch
            })
        });
        let info = LinkInfo {
            queues: vec![QueInfo {
                channels: strips.collect(),
            }],
        };
        Ok(Self {
            id,
            params,
            in_info,
            info,
            state: Mutex::new(SplitState {
                out_full: VecDeque::new(),
                shadows: ShadowTable::new(),
                handed_out: 0,
                stats: LinkStatistics::default(),
            }),
        })
    }

    /// Builds the strip shadows of the frame held in `slot`.
    fn strips(&self, original: &SystemBuffer, slot: u16) -> Option<Vec<SystemBuffer>> {
        let ch = self.in_info.channels.get(original.ch_num as usize)?;
        let splits = self.params.num_splits;
        let strip_width = ch.width / splits;
        let strip_bytes = (strip_width * ch.format.bytes_per_pixel()) as usize;
        let num_in = self.in_info.channels.len() as u32;
        (0..splits)
            .map(|s| {
                let mut strip = original.shadow(BufferId {
                    owner: self.id,
                    que_id: 0,
                    index: slot * splits as u16 + s as u16,
                });
                strip.ch_num = original.ch_num + num_in * s;
                let frame = strip.video_frame_mut()?;
                frame.info.width = strip_width;
                for (plane, offset) in frame.offsets.iter_mut().enumerate() {
                    if frame.planes[plane].is_some() {
                        *offset += s as usize * strip_bytes;
                    }
                }
                Some(strip)
            })
            .collect()
    }
}

impl Link for SplitLink {
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
        let splits = self.params.num_splits as usize;
        let mut rejected = Vec::new();
        let mut forwarded = false;
        {
            let mut state = self.state.lock();
            for mut buffer in list {
                buffer.stamp_arrival();
                let ch_num = buffer.ch_num;
                state.stats.ch(0, ch_num).recv += 1;
                let valid = (ch_num as usize) < self.in_info.channels.len()
                    && buffer.video_frame().is_some();
                if !valid {
                    state.stats.in_buf_error_count += 1;
                    tracing::warn!("[{}] Cannot split {} on channel {ch_num}", self.id, buffer.id());
                    rejected.push(buffer);
                    continue;
                }
                let slot = match state.shadows.insert(buffer, 0, splits) {
                    Ok(slot) => slot,
                    Err(buffer) => {
                        state.stats.ch(0, ch_num).drop += 1;
                        rejected.push(buffer);
                        continue;
                    }
                };
                let strips = state
                    .shadows
                    .original(slot)
                    .and_then(|original| self.strips(original, slot));
                match strips {
                    Some(strips) => {
                        state.out_full.extend(strips);
                        state.stats.ch(0, ch_num).out += 1;
                        forwarded = true;
                    }
                    None => {
                        // all shadows accounted for at once
                        for _ in 0..splits {
                            if let Ok(Some((_, original))) = state.shadows.release(slot) {
                                rejected.push(original);
                            }
                        }
                        state.stats.in_buf_error_count += 1;
                    }
                }
            }
        }
        release_upstream(sys, self.id, &in_que, rejected);
        if forwarded {
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
        let splits = self.params.num_splits as u16;
        let mut originals = Vec::new();
        {
            let mut state = self.state.lock();
            for strip in list {
                let id = strip.id();
                if id.owner != self.id {
                    state.stats.in_buf_error_count += 1;
                    tracing::error!("[{}] Foreign buffer {id} returned", self.id);
                    continue;
                }
                state.handed_out = state.handed_out.saturating_sub(1);
                match state.shadows.release(id.index / splits) {
                    Ok(Some((_, original))) => originals.push(original),
                    Ok(None) => {}
                    Err(err) => {
                        state.stats.in_buf_error_count += 1;
                        tracing::error!("[{}] {err}", self.id);
                    }
                }
            }
        }
        release_upstream(sys, self.id, &self.params.in_que, originals);
        Ok(())
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        let originals: Vec<SystemBuffer> = {
            let mut state = self.state.lock();
            state.out_full.clear();
            state.handed_out = 0;
            state.shadows.drain().into_iter().map(|(_, b)| b).collect()
        };
        release_upstream(sys, self.id, &self.params.in_que, originals);
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        self.state.lock().stats.clone()
    }

    fn pending_buffers(&self) -> usize {
        self.state.lock().handed_out
    }
}
