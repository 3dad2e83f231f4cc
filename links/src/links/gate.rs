// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Gate link: a runtime switch between two links.
//!
//! The gate owns no queue. While ON, the next link pulls straight from the
//! previous link through the gate and returns buffers the same way. While OFF
//! (the initial state), new data is taken from the previous link and handed
//! straight back.
//!
//! A gate may be created before the link it reads from, in which case the
//! output layout has to be supplied in [`GateLinkParams::prev_link_info`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result, SystemContext,
    buffer::BufferList,
    link::{
        CMD_NEW_DATA, InQueParams, Link, LinkCmd, LinkInfo, LinkStatistics, OutQueParams,
        QueInfo, prev_que_info,
    },
    link_id::LinkId,
};

pub const GATE_LINK_CMD_SET_OPERATION_MODE_ON: u32 = 0x7000;
pub const GATE_LINK_CMD_SET_OPERATION_MODE_OFF: u32 = 0x7001;
pub const GATE_LINK_CMD_GET_BUFFER_FORWARD_COUNT: u32 = 0x7002;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateLinkParams {
    pub in_que: InQueParams,
    pub out_que: OutQueParams,
    #[serde(default = "default_true")]
    pub prev_link_is_created: bool,
    /// Layout of the previous link's queue, required when it is not created yet.
    #[serde(default)]
    pub prev_link_info: Option<QueInfo>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateStatus {
    On,
    Off,
}

/// Reply of [`GATE_LINK_CMD_GET_BUFFER_FORWARD_COUNT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateForwardCount {
    pub status: GateStatus,
    /// Buffers currently passed through and not yet returned.
    pub buf_count: u64,
}

struct GateState {
    status: GateStatus,
    buf_count: u64,
    stats: LinkStatistics,
}

pub struct GateLink {
    id: LinkId,
    params: GateLinkParams,
    info: LinkInfo,
    state: Mutex<GateState>,
}

impl GateLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: GateLinkParams) -> Result<Self> {
        let que = if params.prev_link_is_created {
            prev_que_info(sys, &params.in_que)?
        } else {
            params.prev_link_info.clone().ok_or_else(|| {
                Error::InvalidParams(format!(
                    "{id}: prev_link_info is required when the previous link is not created."
                ))
            })?
        };
        Ok(Self {
            id,
            params,
            info: LinkInfo { queues: vec![que] },
            state: Mutex::new(GateState {
                status: GateStatus::Off,
                buf_count: 0,
                stats: LinkStatistics::default(),
            }),
        })
    }

    pub fn status(&self) -> GateStatus {
        self.state.lock().status
    }

    fn set_status(&self, status: GateStatus) {
        let mut state = self.state.lock();
        if state.status != status {
            tracing::info!("[{}] Gate {:?}", self.id, status);
        }
        state.status = status;
    }
}

impl Link for GateLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        self.info.clone()
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        if self.status() == GateStatus::On {
            return sys.send_link_cmd(self.params.out_que.next_link, CMD_NEW_DATA);
        }
        let in_que = self.params.in_que;
        let list = sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
        if list.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            for buffer in list.iter() {
                let ch = state.stats.ch(0, buffer.ch_num);
                ch.recv += 1;
                ch.drop += 1;
            }
        }
        sys.put_links_empty_buffers(in_que.prev_link_id, in_que.prev_link_que_id, list)
    }

    fn get_full_buffers(&self, sys: &SystemContext, que_id: u8) -> Result<BufferList> {
        if que_id != 0 {
            return Err(Error::InvalidParams(format!(
                "{} has no output queue {que_id}.",
                self.id
            )));
        }
        if self.status() == GateStatus::Off {
            return Ok(BufferList::new());
        }
        let in_que = self.params.in_que;
        let list = sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
        let mut state = self.state.lock();
        state.buf_count += list.len() as u64;
        for buffer in list.iter() {
            let ch = state.stats.ch(0, buffer.ch_num);
            ch.recv += 1;
            ch.out += 1;
        }
        Ok(list)
    }

    fn put_empty_buffers(&self, sys: &SystemContext, _que_id: u8, list: BufferList) -> Result<()> {
        {
            let mut state = self.state.lock();
            let returned = list.len() as u64;
            if returned > state.buf_count {
                state.stats.in_buf_error_count += returned - state.buf_count;
                tracing::error!(
                    "[{}] {returned} buffers returned, only {} forwarded",
                    self.id,
                    state.buf_count
                );
            }
            state.buf_count = state.buf_count.saturating_sub(returned);
        }
        let in_que = self.params.in_que;
        sys.put_links_empty_buffers(in_que.prev_link_id, in_que.prev_link_que_id, list)
    }

    fn control(&self, _sys: &SystemContext, cmd: &LinkCmd) -> Result<Vec<u8>> {
        match cmd.code {
            GATE_LINK_CMD_SET_OPERATION_MODE_ON => {
                self.set_status(GateStatus::On);
                Ok(Vec::new())
            }
            GATE_LINK_CMD_SET_OPERATION_MODE_OFF => {
                self.set_status(GateStatus::Off);
                Ok(Vec::new())
            }
            GATE_LINK_CMD_GET_BUFFER_FORWARD_COUNT => {
                let state = self.state.lock();
                Ok(serde_json::to_vec(&GateForwardCount {
                    status: state.status,
                    buf_count: state.buf_count,
                })?)
            }
            code => Err(Error::UnsupportedCmd(code)),
        }
    }

    fn delete(&self, _sys: &SystemContext) -> Result<()> {
        let state = self.state.lock();
        if state.buf_count > 0 {
            tracing::warn!(
                "[{}] Deleting with {} buffers passed through and not returned",
                self.id,
                state.buf_count
            );
        }
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.counters.insert("buf_count".into(), state.buf_count);
        stats
    }

    fn pending_buffers(&self) -> usize {
        self.state.lock().buf_count as usize
    }
}
