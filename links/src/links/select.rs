// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Select link: routes input channels to output queues.
//!
//! Each output queue lists the input channels it carries; a channel's position
//! in that list is its channel number on the queue. Channels no queue lists
//! are dropped. The routing can be changed while the link runs with
//! [`SELECT_LINK_CMD_SET_OUT_QUE_CH_INFO`].

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{notify_all, release_upstream, take_list};
use crate::{
    Error, Result, SystemContext,
    buffer::{BufferId, BufferList, SystemBuffer},
    link::{
        InQueParams, Link, LinkCmd, LinkInfo, LinkStatistics, MAX_CH_PER_QUE,
        QueInfo, prev_que_info,
    },
    link_id::LinkId,
};

pub const SELECT_LINK_CMD_SET_OUT_QUE_CH_INFO: u32 = 0xB000;
pub const SELECT_LINK_CMD_GET_OUT_QUE_CH_INFO: u32 = 0xB001;

/// Maximum number of output queues of a Select link.
pub const SELECT_LINK_MAX_OUT_QUE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOutQue {
    pub next_link: LinkId,
    /// Input channels carried on this queue, in output channel order.
    #[serde(default)]
    pub in_ch_nums: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectLinkParams {
    pub in_que: InQueParams,
    pub out_queues: Vec<SelectOutQue>,
    #[serde(default = "default_true")]
    pub notify_next_link: bool,
}

fn default_true() -> bool {
    true
}

/// Parameter and reply of the `*_OUT_QUE_CH_INFO` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutQueChInfo {
    pub out_que_id: u8,
    #[serde(default)]
    pub in_ch_nums: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    out_que: u8,
    out_ch: u32,
}

struct SelectState {
    /// Route of every input channel that is currently selected.
    routes: HashMap<u32, Route>,
    out_queues: Vec<Vec<u32>>,
    out_full: Vec<VecDeque<SystemBuffer>>,
    /// Input channel of every buffer currently downstream.
    in_flight: HashMap<BufferId, u32>,
    stats: LinkStatistics,
}

impl SelectState {
    fn assign(&mut self, out_que: u8, in_ch_nums: &[u32], num_in_ch: usize) -> Result<()> {
        if in_ch_nums.len() > MAX_CH_PER_QUE {
            return Err(Error::InvalidParams(format!(
                "{} channels selected on queue {out_que}, at most {MAX_CH_PER_QUE}.",
                in_ch_nums.len()
            )));
        }
        for (pos, in_ch) in in_ch_nums.iter().enumerate() {
            if *in_ch as usize >= num_in_ch {
                return Err(Error::InvalidParams(format!(
                    "Input channel {in_ch} does not exist, input has {num_in_ch}."
                )));
            }
            if in_ch_nums[..pos].contains(in_ch) {
                return Err(Error::InvalidParams(format!(
                    "Input channel {in_ch} listed twice for queue {out_que}."
                )));
            }
        }
        // channels move away from whatever queue carried them before
        for in_ch in in_ch_nums {
            if let Some(route) = self.routes.get(in_ch)
                && route.out_que != out_que
            {
                let previous = &mut self.out_queues[route.out_que as usize];
                previous.retain(|ch| ch != in_ch);
            }
        }
        self.out_queues[out_que as usize] = in_ch_nums.to_vec();
        self.reindex();
        Ok(())
    }

    fn reindex(&mut self) {
        self.routes.clear();
        for (out_que, channels) in self.out_queues.iter().enumerate() {
            for (out_ch, in_ch) in channels.iter().enumerate() {
                self.routes.insert(
                    *in_ch,
                    Route {
                        out_que: out_que as u8,
                        out_ch: out_ch as u32,
                    },
                );
            }
        }
    }
}

pub struct SelectLink {
    id: LinkId,
    params: SelectLinkParams,
    in_info: QueInfo,
    state: Mutex<SelectState>,
}

impl SelectLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: SelectLinkParams) -> Result<Self> {
        super::check_count("output queues", params.out_queues.len(), SELECT_LINK_MAX_OUT_QUE)?;
        let in_info = prev_que_info(sys, &params.in_que)?;
        let num_out = params.out_queues.len();
        let mut state = SelectState {
            routes: HashMap::new(),
            out_queues: vec![Vec::new(); num_out],
            out_full: (0..num_out).map(|_| VecDeque::new()).collect(),
            in_flight: HashMap::new(),
            stats: LinkStatistics::default(),
        };
        for (out_que, que) in params.out_queues.iter().enumerate() {
            if let Some(in_ch) = que
                .in_ch_nums
                .iter()
                .find(|ch| state.routes.contains_key(*ch))
            {
                return Err(Error::InvalidParams(format!(
                    "{id}: input channel {in_ch} is selected on more than one queue."
                )));
            }
            state.assign(out_que as u8, &que.in_ch_nums, in_info.channels.len())?;
        }
        Ok(Self {
            id,
            params,
            in_info,
            state: Mutex::new(state),
        })
    }

    fn info_for(&self, out_queues: &[Vec<u32>]) -> LinkInfo {
        LinkInfo {
            queues: out_queues
                .iter()
                .map(|channels| QueInfo {
                    channels: channels
                        .iter()
                        .filter_map(|ch| self.in_info.channels.get(*ch as usize).copied())
                        .collect(),
                })
                .collect(),
        }
    }

    fn check_que(&self, out_que_id: u8) -> Result<()> {
        if out_que_id as usize >= self.params.out_queues.len() {
            return Err(Error::InvalidParams(format!(
                "{} has no output queue {out_que_id}.",
                self.id
            )));
        }
        Ok(())
    }
}

impl Link for SelectLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        let out_queues = self.state.lock().out_queues.clone();
        self.info_for(&out_queues)
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        let in_que = self.params.in_que;
        let list = sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
        if list.is_empty() {
            return Ok(());
        }
        let mut dropped = Vec::new();
        let mut touched = vec![false; self.params.out_queues.len()];
        {
            let mut state = self.state.lock();
            for mut buffer in list {
                buffer.stamp_arrival();
                let in_ch = buffer.ch_num;
                state.stats.ch(0, in_ch).recv += 1;
                let Some(route) = state.routes.get(&in_ch).copied() else {
                    state.stats.ch(0, in_ch).drop += 1;
                    dropped.push(buffer);
                    continue;
                };
                buffer.ch_num = route.out_ch;
                state.in_flight.insert(buffer.id(), in_ch);
                state.out_full[route.out_que as usize].push_back(buffer);
                state.stats.ch(0, in_ch).out += 1;
                touched[route.out_que as usize] = true;
            }
        }
        release_upstream(sys, self.id, &in_que, dropped);
        if self.params.notify_next_link {
            let next = self
                .params
                .out_queues
                .iter()
                .zip(touched)
                .filter(|(_, touched)| *touched)
                .map(|(out, _)| out.next_link);
            notify_all(sys, self.id, next)?;
        }
        Ok(())
    }

    fn get_full_buffers(&self, _sys: &SystemContext, que_id: u8) -> Result<BufferList> {
        self.check_que(que_id)?;
        let mut state = self.state.lock();
        Ok(take_list(&mut state.out_full[que_id as usize]))
    }

    fn put_empty_buffers(&self, sys: &SystemContext, _que_id: u8, list: BufferList) -> Result<()> {
        let mut returned = Vec::with_capacity(list.len());
        {
            let mut state = self.state.lock();
            for mut buffer in list {
                match state.in_flight.remove(&buffer.id()) {
                    Some(in_ch) => buffer.ch_num = in_ch,
                    None => {
                        state.stats.in_buf_error_count += 1;
                        tracing::warn!("[{}] {} was not forwarded here", self.id, buffer.id());
                    }
                }
                returned.push(buffer);
            }
        }
        release_upstream(sys, self.id, &self.params.in_que, returned);
        Ok(())
    }

    fn control(&self, _sys: &SystemContext, cmd: &LinkCmd) -> Result<Vec<u8>> {
        match cmd.code {
            SELECT_LINK_CMD_SET_OUT_QUE_CH_INFO => {
                let prm: OutQueChInfo = cmd.params()?;
                self.check_que(prm.out_que_id)?;
                self.state
                    .lock()
                    .assign(prm.out_que_id, &prm.in_ch_nums, self.in_info.channels.len())?;
                tracing::info!(
                    "[{}] Queue {} now carries input channels {:?}",
                    self.id,
                    prm.out_que_id,
                    prm.in_ch_nums
                );
                Ok(Vec::new())
            }
            SELECT_LINK_CMD_GET_OUT_QUE_CH_INFO => {
                let prm: OutQueChInfo = cmd.params()?;
                self.check_que(prm.out_que_id)?;
                let in_ch_nums = self.state.lock().out_queues[prm.out_que_id as usize].clone();
                Ok(serde_json::to_vec(&OutQueChInfo {
                    out_que_id: prm.out_que_id,
                    in_ch_nums,
                })?)
            }
            code => Err(Error::UnsupportedCmd(code)),
        }
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        let queued: Vec<SystemBuffer> = {
            let mut state = self.state.lock();
            let queued: Vec<SystemBuffer> = state
                .out_full
                .iter_mut()
                .flat_map(|queue| queue.drain(..))
                .collect();
            queued
                .into_iter()
                .map(|mut buffer| {
                    if let Some(in_ch) = state.in_flight.remove(&buffer.id()) {
                        buffer.ch_num = in_ch;
                    }
                    buffer
                })
                .collect()
        };
        release_upstream(sys, self.id, &self.params.in_que, queued);
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        self.state.lock().stats.clone()
    }

    fn pending_buffers(&self) -> usize {
        let state = self.state.lock();
        let queued: usize = state.out_full.iter().map(VecDeque::len).sum();
        state.in_flight.len().saturating_sub(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(num_out: usize) -> SelectState {
        SelectState {
            routes: HashMap::new(),
            out_queues: vec![Vec::new(); num_out],
            out_full: (0..num_out).map(|_| VecDeque::new()).collect(),
            in_flight: HashMap::new(),
            stats: LinkStatistics::default(),
        }
    }

    #[test]
    fn reassigning_moves_channels_between_queues() {
        let mut state = state(2);
        state.assign(0, &[0, 2], 4).unwrap();
        state.assign(1, &[1], 4).unwrap();
        assert_eq!(state.routes[&2].out_que, 0);
        assert_eq!(state.routes[&2].out_ch, 1);

        state.assign(1, &[2, 3], 4).unwrap();
        assert_eq!(state.out_queues[0], vec![0]);
        assert_eq!(state.routes[&2].out_que, 1);
        assert_eq!(state.routes[&2].out_ch, 0);
        assert!(!state.routes.contains_key(&1));
    }

    #[test]
    fn bad_channel_lists_are_rejected() {
        let mut state = state(1);
        assert!(state.assign(0, &[4], 4).is_err());
        assert!(state.assign(0, &[1, 1], 4).is_err());
        assert!(state.out_queues[0].is_empty());
    }
}
