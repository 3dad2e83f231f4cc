// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Save link: a sink that copies one frame into memory on request.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result, SystemContext,
    buffer::BufferType,
    link::{InQueParams, Link, LinkCmd, LinkInfo, LinkStatistics, prev_que_info},
    link_id::LinkId,
};

/// Arms a snapshot of the next frame; parameters are a [`SaveFrameRequest`].
pub const SAVE_LINK_CMD_SAVE_FRAME: u32 = 0x9000;
/// Returns the last snapshot as a JSON [`SavedFrame`].
pub const SAVE_LINK_CMD_GET_SAVED_FRAME: u32 = 0x9001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveLinkParams {
    pub in_que: InQueParams,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFrameRequest {
    /// Channel to capture; the next frame of any channel when absent.
    #[serde(default)]
    pub ch: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedFrame {
    pub ch_num: u32,
    pub src_timestamp: u64,
    pub buf_type: BufferType,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

struct SaveState {
    armed: Option<SaveFrameRequest>,
    saved: Option<SavedFrame>,
    stats: LinkStatistics,
}

pub struct SaveLink {
    id: LinkId,
    params: SaveLinkParams,
    state: Mutex<SaveState>,
}

impl SaveLink {
    pub(crate) fn create(sys: &SystemContext, id: LinkId, params: SaveLinkParams) -> Result<Self> {
        prev_que_info(sys, &params.in_que)?;
        Ok(Self {
            id,
            params,
            state: Mutex::new(SaveState {
                armed: None,
                saved: None,
                stats: LinkStatistics::default(),
            }),
        })
    }
}

impl Link for SaveLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn link_info(&self) -> LinkInfo {
        LinkInfo::default()
    }

    fn process_new_data(&self, sys: &SystemContext) -> Result<()> {
        let in_que = self.params.in_que;
        let list = sys.get_links_full_buffers(in_que.prev_link_id, in_que.prev_link_que_id)?;
        if list.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            for buffer in list.iter() {
                state.stats.ch(0, buffer.ch_num).recv += 1;
                let Some(request) = state.armed else { continue };
                if request.ch.is_some_and(|ch| ch != buffer.ch_num) {
                    continue;
                }
                let mut data = Vec::new();
                buffer.copy_payload(&mut data);
                let (width, height) = buffer
                    .video_frame()
                    .map_or((0, 0), |frame| (frame.info.width, frame.info.height));
                tracing::info!(
                    "[{}] Saved {} bytes of channel {}",
                    self.id,
                    data.len(),
                    buffer.ch_num
                );
                state.saved = Some(SavedFrame {
                    ch_num: buffer.ch_num,
                    src_timestamp: buffer.src_timestamp,
                    buf_type: buffer.buf_type(),
                    width,
                    height,
                    data,
                });
                state.armed = None;
                state.stats.ch(0, buffer.ch_num).process += 1;
            }
        }
        sys.put_links_empty_buffers(in_que.prev_link_id, in_que.prev_link_que_id, list)
    }

    fn control(&self, _sys: &SystemContext, cmd: &LinkCmd) -> Result<Vec<u8>> {
        match cmd.code {
            SAVE_LINK_CMD_SAVE_FRAME => {
                let request = if cmd.params.is_empty() {
                    SaveFrameRequest::default()
                } else {
                    cmd.params()?
                };
                self.state.lock().armed = Some(request);
                Ok(Vec::new())
            }
            SAVE_LINK_CMD_GET_SAVED_FRAME => {
                let state = self.state.lock();
                let saved = state.saved.as_ref().ok_or(Error::NotReady)?;
                Ok(serde_json::to_vec(saved)?)
            }
            code => Err(Error::UnsupportedCmd(code)),
        }
    }

    fn delete(&self, _sys: &SystemContext) -> Result<()> {
        Ok(())
    }

    fn statistics(&self) -> LinkStatistics {
        self.state.lock().stats.clone()
    }
}
