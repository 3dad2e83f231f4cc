// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Dup link: forwards every input buffer to each of its output queues.
//!
//! Each output queue receives a shadow descriptor sharing the input payload.
//! The input buffer goes back upstream only after every shadow is released.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ShadowTable, check_count, notify_all, release_upstream, take_list};
use crate::{
    Error, Result, SystemContext,
    buffer::{BufferId, BufferList, SystemBuffer},
    link::{
        InQueParams, Link, LinkInfo, LinkStatistics, MAX_OUT_QUE, OutQueParams,
        prev_que_info,
    },
    link_id::LinkId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DupLinkParams {
    pub in_que: InQueParams,
    pub out_queues: Vec<OutQueParams>,
    #[serde(default = "default_true")]
    pub notify_next_link: bool,
}

fn default_true() -> bool {
    true
}

struct DupState {
    out_full: Vec<VecDeque<SystemBuffer>>,
    shadows: ShadowTable,
    /// Shadows currently held by downstream links.
    handed_out: usize,
    stats: LinkStatistics,
}

pub struct DupLink {
    id: LinkId,
    params: DupLinkParams,
    info: LinkInfo,
    state: Mutex<DupState>,
}

impl DupLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: DupLinkParams) -> Result<Self> {
        check_count("output queues", params.out_queues.len(), MAX_OUT_QUE)?;
        let que = prev_que_info(sys, &params.in_que)?;
        let num_out = params.out_queues.len();
        Ok(Self {
            id,
            info: LinkInfo {
                queues: vec![que; num_out],
            },
            state: Mutex::new(DupState {
                out_full: (0..num_out).map(|_| VecDeque::new()).collect(),
                shadows: ShadowTable::new(),
                handed_out: 0,
                stats: LinkStatistics::default(),
            }),
            params,
        })
    }
}

impl Link for DupLink {
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
        let num_out = self.params.out_queues.len();
        let mut overflow = Vec::new();
        let mut forwarded = false;
        {
            let mut state = self.state.lock();
            for mut buffer in list {
                buffer.stamp_arrival();
                state.stats.ch(0, buffer.ch_num).recv += 1;
                let ch_num = buffer.ch_num;
                let slot = match state.shadows.insert(buffer, 0, num_out) {
                    Ok(slot) => slot,
                    Err(buffer) => {
                        state.stats.ch(0, ch_num).drop += 1;
                        overflow.push(buffer);
                        continue;
                    }
                };
                let shadows: Vec<SystemBuffer> = match state.shadows.original(slot) {
                    Some(original) => (0..num_out)
                        .map(|que_id| {
                            original.shadow(BufferId {
                                owner: self.id,
                                que_id: que_id as u8,
                                index: slot,
                            })
                        })
                        .collect(),
                    None => continue,
                };
                for (que_id, shadow) in shadows.into_iter().enumerate() {
                    state.out_full[que_id].push_back(shadow);
                }
                state.stats.ch(0, ch_num).out += 1;
                forwarded = true;
            }
        }
        if !overflow.is_empty() {
            tracing::warn!("[{}] Shadow table full, dropped {}", self.id, overflow.len());
            release_upstream(sys, self.id, &in_que, overflow);
        }
        if forwarded && self.params.notify_next_link {
            notify_all(sys, self.id, self.params.out_queues.iter().map(|out| out.next_link))?;
        }
        Ok(())
    }

    fn get_full_buffers(&self, _sys: &SystemContext, que_id: u8) -> Result<BufferList> {
        let mut state = self.state.lock();
        let queue = state.out_full.get_mut(que_id as usize).ok_or_else(|| {
            Error::InvalidParams(format!("{} has no output queue {que_id}.", self.id))
        })?;
        let list = take_list(queue);
        state.handed_out += list.len();
        Ok(list)
    }

    fn put_empty_buffers(&self, sys: &SystemContext, que_id: u8, list: BufferList) -> Result<()> {
        let mut originals = Vec::new();
        {
            let mut state = self.state.lock();
            for shadow in list {
                let id = shadow.id();
                if id.owner != self.id || id.que_id != que_id {
                    state.stats.in_buf_error_count += 1;
                    tracing::error!("[{}] Foreign buffer {id} returned on queue {que_id}", self.id);
                    continue;
                }
                state.handed_out = state.handed_out.saturating_sub(1);
                match state.shadows.release(id.index) {
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
            if state.handed_out > 0 {
                tracing::warn!(
                    "[{}] Deleting with {} shadows still downstream",
                    self.id,
                    state.handed_out
                );
            }
            state.out_full.iter_mut().for_each(VecDeque::clear);
            state.handed_out = 0;
            state.shadows.drain().into_iter().map(|(_, b)| b).collect()
        };
        release_upstream(sys, self.id, &self.params.in_que, originals);
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.counters.insert("held_originals".into(), state.shadows.len() as u64);
        stats
    }

    fn pending_buffers(&self) -> usize {
        self.state.lock().handed_out
    }
}
