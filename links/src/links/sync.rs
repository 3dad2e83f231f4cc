// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Sync link: groups frames of several channels captured at about the same
//! time into one composite buffer.
//!
//! Each active channel has a local queue. Whenever every active queue has a
//! head, the master timestamp is the mean of the head timestamps and the sync
//! window is `master ± sync_delta`:
//!
//! - heads below the window are dropped,
//! - if any head is above the window, the heads inside it are dropped too,
//! - once every head lies inside the window the heads leave together in one
//!   [`Payload::Composite`] container.
//!
//! Independently, heads older than `sync_threshold` are dropped on every pass
//! and on a timer. Thresholds at or above [`SYNC_DROP_THRESHOLD_MAX`] disable
//! the corresponding drop.

use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::release_upstream;
use crate::{
    Error, Result, SystemContext,
    buf_que::BufQue,
    buffer::{BufferList, BufferType, Payload, SystemBuffer, timestamp_us},
    link::{
        CMD_NEW_DATA, ChInfo, InQueParams, Link, LinkInfo, LinkStatistics, OutQueParams, QueInfo,
        prev_que_info,
    },
    link_id::LinkId,
    que::Timeout,
};

/// Thresholds at or above this value disable dropping.
pub const SYNC_DROP_THRESHOLD_MAX: u64 = 0xFFFF_FFFF;

/// Maximum number of channels a Sync link can group.
pub const SYNC_LINK_MAX_CHANNELS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLinkParams {
    pub in_que: InQueParams,
    pub out_que: OutQueParams,
    /// Half width of the sync window, in milliseconds.
    pub sync_delta_ms: u64,
    /// Age after which a waiting frame is dropped, in milliseconds.
    pub sync_threshold_ms: u64,
    #[serde(default = "default_num_out_buffers")]
    pub num_out_buffers: usize,
    /// Channels taking part in the sync; all input channels when absent.
    #[serde(default)]
    pub active_channels: Option<Vec<u32>>,
}

fn default_num_out_buffers() -> usize {
    4
}

struct SyncState {
    local: Vec<VecDeque<SystemBuffer>>,
    stats: LinkStatistics,
}

pub struct SyncLink {
    id: LinkId,
    params: SyncLinkParams,
    active: Vec<bool>,
    info: LinkInfo,
    out: BufQue,
    state: Mutex<SyncState>,
}

/// Where a head timestamp lies relative to the sync window.
fn in_range(lower: u64, higher: u64, ts: u64) -> std::cmp::Ordering {
    if ts < lower {
        std::cmp::Ordering::Less
    } else if ts > higher {
        std::cmp::Ordering::Greater
    } else {
        std::cmp::Ordering::Equal
    }
}

impl SyncLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: SyncLinkParams) -> Result<Self> {
        let in_info = prev_que_info(sys, &params.in_que)?;
        let num_ch = in_info.channels.len();
        if num_ch > SYNC_LINK_MAX_CHANNELS {
            return Err(Error::InvalidParams(format!(
                "{id}: {num_ch} channels exceed {SYNC_LINK_MAX_CHANNELS}."
            )));
        }
        let active = match &params.active_channels {
            None => vec![true; num_ch],
            Some(channels) => {
                let mut active = vec![false; num_ch];
                for ch in channels {
                    let slot = active.get_mut(*ch as usize).ok_or_else(|| {
                        Error::InvalidParams(format!(
                            "{id}: active channel {ch} does not exist, input has {num_ch}."
                        ))
                    })?;
                    *slot = true;
                }
                active
            }
        };
        if !active.contains(&true) {
            return Err(Error::InvalidParams(format!("{id}: no active channel.")));
        }
        if params.num_out_buffers == 0 {
            return Err(Error::InvalidParams(format!("{id}: num_out_buffers must be non-zero.")));
        }
        let out = BufQue::with_pool(
            id,
            0,
            params.num_out_buffers,
            false,
            |_| Ok(Payload::Composite(Vec::new())),
            drop,
        )?;
        let first = in_info.channels[0];
        let info = LinkInfo {
            queues: vec![QueInfo {
                channels: vec![ChInfo {
                    buf_type: BufferType::VideoFrameContainer,
                    ..first
                }],
            }],
        };
        Ok(Self {
            id,
            active,
            info,
            out,
            state: Mutex::new(SyncState {
                local: (0..num_ch).map(|_| VecDeque::new()).collect(),
                stats: LinkStatistics::default(),
            }),
            params,
        })
    }

    /// Drops heads older than the sync threshold.
    fn drop_stale(&self, state: &mut SyncState, now: u64, drops: &mut Vec<SystemBuffer>) {
        if self.params.sync_threshold_ms >= SYNC_DROP_THRESHOLD_MAX {
            return;
        }
        let threshold = self.params.sync_threshold_ms * 1000;
        for ch in 0..state.local.len() {
            while let Some(head) = state.local[ch].front()
                && now.saturating_sub(head.src_timestamp) > threshold
            {
                if let Some(buffer) = state.local[ch].pop_front() {
                    state.stats.ch(0, ch as u32).drop += 1;
                    state.stats.bump("stale_drops", 1);
                    drops.push(buffer);
                }
            }
        }
    }

    /// Matches heads until some active queue runs dry. Returns the number of
    /// composites emitted.
    fn match_heads(&self, state: &mut SyncState, drops: &mut Vec<SystemBuffer>) -> usize {
        let mut emitted = 0;
        let active: Vec<usize> = (0..self.active.len()).filter(|ch| self.active[*ch]).collect();
        loop {
            let heads: Option<Vec<u64>> = active
                .iter()
                .map(|ch| state.local[*ch].front().map(|b| b.src_timestamp))
                .collect();
            let Some(heads) = heads else { break };
            let master = heads.iter().sum::<u64>() / heads.len() as u64;

            let mut drop_ch = Vec::new();
            if self.params.sync_delta_ms < SYNC_DROP_THRESHOLD_MAX {
                let delta = self.params.sync_delta_ms * 1000;
                let lower = master.saturating_sub(delta);
                let higher = master.saturating_add(delta);
                let flags: Vec<_> = heads.iter().map(|ts| in_range(lower, higher, *ts)).collect();
                let ahead = flags.contains(&std::cmp::Ordering::Greater);
                for (pos, flag) in flags.iter().enumerate() {
                    let late = *flag == std::cmp::Ordering::Less;
                    let in_window = *flag == std::cmp::Ordering::Equal;
                    if late || (ahead && in_window) {
                        drop_ch.push(active[pos]);
                    }
                }
            }

            if !drop_ch.is_empty() {
                for ch in drop_ch {
                    if let Some(buffer) = state.local[ch].pop_front() {
                        state.stats.ch(0, ch as u32).drop += 1;
                        state.stats.bump("out_of_sync_drops", 1);
                        drops.push(buffer);
                    }
                }
                continue;
            }

            let heads: Vec<SystemBuffer> = active
                .iter()
                .filter_map(|ch| state.local[*ch].pop_front())
                .collect();
            match self.out.get_empty(Timeout::NoWait) {
                Ok(mut container) => {
                    for head in &heads {
                        state.stats.ch(0, head.ch_num).process += 1;
                        state
                            .stats
                            .bump("total_sync_delta_us", master.abs_diff(head.src_timestamp));
                    }
                    container.src_timestamp = master;
                    container.ch_num = 0;
                    container.stamp_arrival();
                    container.payload = Payload::Composite(heads);
                    if let Err(err) = self.out.put_full(container) {
                        tracing::error!("[{}] Composite lost: {err}", self.id);
                        continue;
                    }
                    state.stats.ch(0, 0).out += 1;
                    state.stats.bump("composites", 1);
                    emitted += 1;
                }
                Err(_) => {
                    for head in heads {
                        state.stats.ch(0, head.ch_num).drop += 1;
                        state.stats.bump("no_buffer_drops", 1);
                        drops.push(head);
                    }
                }
            }
        }
        emitted
    }

    fn sync_pass(&self, sys: &SystemContext, incoming: BufferList) -> Result<()> {
        let now = timestamp_us();
        let mut drops = Vec::new();
        let emitted = {
            let mut state = self.state.lock();
            self.drop_stale(&mut state, now, &mut drops);
            for mut buffer in incoming {
                buffer.stamp_arrival();
                let ch = buffer.ch_num as usize;
                if ch >= state.local.len() {
                    state.stats.in_buf_error_count += 1;
                    drops.push(buffer);
                    continue;
                }
                state.stats.ch(0, ch as u32).recv += 1;
                if self.active[ch] {
                    state.local[ch].push_back(buffer);
                } else {
                    state.stats.ch(0, ch as u32).drop += 1;
                    drops.push(buffer);
                }
            }
            self.match_heads(&mut state, &mut drops)
        };
        release_upstream(sys, self.id, &self.params.in_que, drops);
        if emitted > 0 {
            sys.send_link_cmd(self.params.out_que.next_link, CMD_NEW_DATA)?;
        }
        Ok(())
    }
}

impl Link for SyncLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        self.info.clone()
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        let in_que = self.params.in_que;
        let list = sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
        self.sync_pass(sys, list)
    }

    fn tick_interval(&self) -> Option<Duration> {
        (self.params.sync_threshold_ms < SYNC_DROP_THRESHOLD_MAX)
            .then(|| Duration::from_millis(self.params.sync_threshold_ms.max(1)))
    }

    fn on_tick(&self, sys: &SystemContext) -> Result<()> {
        self.sync_pass(sys, BufferList::new())
    }

    fn get_full_buffers(&self, _sys: &SystemContext, que_id: u8) -> Result<BufferList> {
        if que_id != 0 {
            return Err(Error::InvalidParams(format!(
                "{} has no output queue {que_id}.",
                self.id
            )));
        }
        let mut list = BufferList::new();
        self.out.get_full_list(&mut list);
        Ok(list)
    }

    fn put_empty_buffers(&self, sys: &SystemContext, _que_id: u8, list: BufferList) -> Result<()> {
        let mut inner = Vec::new();
        for mut container in list {
            if !self.out.owns(&container) {
                self.state.lock().stats.in_buf_error_count += 1;
                tracing::error!("[{}] Foreign buffer {} returned", self.id, container.id());
                continue;
            }
            if let Payload::Composite(frames) = &mut container.payload {
                inner.append(frames);
            }
            self.out.put_empty(container)?;
        }
        release_upstream(sys, self.id, &self.params.in_que, inner);
        Ok(())
    }

    fn delete(&self, sys: &SystemContext) -> Result<()> {
        let mut held: Vec<SystemBuffer> = {
            let mut state = self.state.lock();
            state.local.iter_mut().flat_map(|q| q.drain(..)).collect()
        };
        for mut container in self.out.drain_full() {
            if let Payload::Composite(frames) = &mut container.payload {
                held.append(frames);
            }
        }
        if self.out.held() > 0 {
            tracing::warn!(
                "[{}] Deleting with {} composites still downstream",
                self.id,
                self.out.held()
            );
        }
        release_upstream(sys, self.id, &self.params.in_que, held);
        self.out.shutdown();
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        let waiting: usize = state.local.iter().map(VecDeque::len).sum();
        stats.counters.insert("waiting".into(), waiting as u64);
        stats
    }

    fn pending_buffers(&self) -> usize {
        self.out.held()
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;

    #[test]
    fn window_classification() {
        assert_eq!(in_range(100, 200, 99), Ordering::Less);
        assert_eq!(in_range(100, 200, 100), Ordering::Equal);
        assert_eq!(in_range(100, 200, 200), Ordering::Equal);
        assert_eq!(in_range(100, 200, 201), Ordering::Greater);
    }
}
